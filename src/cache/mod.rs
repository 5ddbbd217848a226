//! Partitioned response cache.
//!
//! Each partition is a named, versioned container of request → response
//! snapshots. The partition set for the running version decides which names
//! are current; everything else is reclaimed at activation.

mod storage;
mod traits;

#[cfg(test)]
pub use storage::testing;
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{PartitionPurpose, PartitionSet, RequestKey, ResponseSnapshot, PARTITION_PREFIX};
