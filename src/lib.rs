pub mod agent;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod logging;
pub mod network;
pub mod server;
