use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use url::Url;

use fieldcache::agent::queue::SyncRegistrar;
use fieldcache::agent::sync::BackgroundSync;
use fieldcache::agent::{Agent, AgentSettings};
use fieldcache::cache::{CacheStorage, MemoryStorage, SqliteStorage};
use fieldcache::config::Config;
use fieldcache::db::Database;
use fieldcache::network::{HttpNetwork, Network};
use fieldcache::{logging, server};

#[derive(Parser, Debug)]
#[command(name = "fieldcache")]
#[command(about = "Offline-first caching agent for field web applications")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fieldcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Origin the application is served from
  #[arg(short, long, global = true)]
  upstream: Option<Url>,

  /// Address to listen on (or of the running agent, for control commands)
  #[arg(short, long, global = true)]
  listen: Option<SocketAddr>,

  /// Mirror logs to stdout at debug level
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the agent (default)
  Serve {
    /// Keep caches in memory only
    #[arg(long)]
    ephemeral: bool,
  },
  /// Ask the running agent to replay its offline queue
  Sync {
    /// Sync tag (default: the configured tag)
    #[arg(short, long)]
    tag: Option<String>,
  },
  /// Ask the running agent to delete every cache partition
  Purge,
  /// Let a waiting version take control
  Activate,
  /// Show the running agent's state
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(upstream) = args.upstream {
    config.upstream = Some(upstream);
  }
  if let Some(listen) = args.listen {
    config.listen = listen;
  }

  match args.command.unwrap_or(Command::Serve { ephemeral: false }) {
    Command::Serve { ephemeral } => serve(config, args.verbose, ephemeral).await,
    Command::Sync { tag } => {
      logging::init_console();
      let body = match tag {
        Some(tag) => json!({ "tag": tag }),
        None => json!({}),
      };
      control(&config, reqwest::Method::POST, "sync", Some(body)).await
    }
    Command::Purge => {
      logging::init_console();
      let body = json!({ "type": "CLEAR_CACHE" });
      control(&config, reqwest::Method::POST, "message", Some(body)).await
    }
    Command::Activate => {
      logging::init_console();
      let body = json!({ "type": "SKIP_WAITING" });
      control(&config, reqwest::Method::POST, "message", Some(body)).await
    }
    Command::Status => {
      logging::init_console();
      control(&config, reqwest::Method::GET, "status", None).await
    }
  }
}

async fn serve(config: Config, verbose: bool, ephemeral: bool) -> Result<()> {
  let _guard = logging::init(verbose);

  let settings = AgentSettings::from_config(&config)?;
  let upstream = settings.origin.clone();

  let store: Arc<dyn CacheStorage> = if ephemeral {
    info!("Using in-memory cache storage");
    Arc::new(MemoryStorage::new())
  } else {
    let db = Database::open(config.cache.path.as_deref())?;
    Arc::new(SqliteStorage::new(db))
  };

  let timeout = config.network.timeout_secs.map(Duration::from_secs);
  let network: Arc<dyn Network> = Arc::new(HttpNetwork::new(timeout)?);

  let (registrar, registrations) = SyncRegistrar::channel();
  let agent = Arc::new(Agent::new(
    settings,
    store,
    Arc::clone(&network),
    Some(registrar.clone()),
  ));

  match agent.start().await {
    Ok(state) => info!(?state, "Agent started"),
    Err(e) => error!(error = %e, "Install failed, forwarding requests without caching"),
  }

  // Work left over from an earlier run is retried as soon as the origin answers
  match agent.queue().len().await {
    Ok(0) => {}
    Ok(pending) => {
      info!(pending, "Offline queue not empty");
      registrar.register(agent.sync_tag());
    }
    Err(e) => warn!(error = %e, "Could not read offline queue"),
  }

  let background = BackgroundSync::new(
    agent.sync_coordinator(),
    network,
    upstream.clone(),
    config.sync.probe_interval(),
  );
  tokio::spawn(background.run(registrations));

  server::serve(agent, upstream, config.listen).await
}

/// Send a control request to a running agent and print its reply.
async fn control(
  config: &Config,
  method: reqwest::Method,
  route: &str,
  body: Option<Value>,
) -> Result<()> {
  let url = format!("http://{}/__fieldcache/{}", config.listen, route);
  let client = reqwest::Client::new();

  let mut request = client.request(method, &url);
  if let Some(body) = body {
    request = request.json(&body);
  }

  let response = request
    .send()
    .await
    .map_err(|e| eyre!("No agent reachable at {}: {}", config.listen, e))?;
  let status = response.status();
  let reply: Value = response.json().await?;

  println!("{}", serde_json::to_string_pretty(&reply)?);
  if !status.is_success() {
    return Err(eyre!("Agent answered {}", status));
  }
  Ok(())
}
