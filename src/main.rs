mod config;
mod coordinator;
mod db;
mod error;
mod event;
mod intercept;
mod logging;
mod remote;
mod store;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use config::Config;
use coordinator::{ActivateOptions, CacheCoordinator, PathStatus};
use event::Connectivity;
use intercept::{
  HttpUpstream, InterceptRequest, Interceptor, InterceptorSettings, MemoryNamespaces,
  NamespaceStore, ResponseSource, SqliteNamespaces,
};
use remote::HttpRemote;
use store::{MemoryStore, PersistentStore, SqliteStore};

const PROBE_INTERVAL: Duration = Duration::from_secs(15);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const MESSAGE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "reelsync")]
#[command(about = "Offline-first cache and sync engine for a realtime media database")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/reelsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Start with connectivity reported as offline
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Resolve a path once and print its settled state
  Get {
    path: String,
    /// Entry TTL in seconds (default: cache.default_ttl_secs)
    #[arg(long)]
    ttl: Option<u64>,
    /// Fetch from the remote even when the cached entry is fresh
    #[arg(long)]
    refresh: bool,
  },
  /// Follow a path over a push subscription until interrupted
  Watch { path: String },
  /// Write a JSON value to a path
  Put { path: String, json: String },
  /// Remove the cached entry for a path, or every entry with --all
  Clear {
    #[arg(required_unless_present = "all")]
    path: Option<String>,
    #[arg(long, conflicts_with = "path")]
    all: bool,
  },
  /// Route one request through the interceptor
  Fetch {
    url: String,
    /// Treat the request as a top-level navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Delete interceptor namespaces from older versions
  Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let data_dir = db::data_dir().ok_or_else(|| eyre!("Could not determine data directory"))?;
  let _log_guard = logging::init(&data_dir)?;
  info!(command = ?args.command, offline = args.offline, "starting");

  let db_path = config.cache.path.clone().or_else(db::default_path);

  match args.command {
    Command::Get { path, ttl, refresh } => {
      let coordinator = build_coordinator(&config, db_path.as_deref(), args.offline)?;
      let mut options = ActivateOptions::default();
      if let Some(secs) = ttl {
        options = options.with_ttl(Duration::from_secs(secs));
      }
      let mut subscriber = coordinator.activate(&path, options);
      if refresh {
        subscriber.refresh();
      }
      let state = subscriber.resolved().await?;
      info!(id = subscriber.id(), status = ?state.status(), "resolved");
      println!("{}", serde_json::to_string_pretty(&state)?);
      if state.status() == PathStatus::Failed {
        return Err(eyre!("Could not resolve {}", path));
      }
    }
    Command::Watch { path } => {
      let coordinator = build_coordinator(&config, db_path.as_deref(), args.offline)?;
      if !args.offline {
        tokio::spawn(probe_connectivity(
          coordinator.connectivity().clone(),
          config.remote.url.clone(),
        ));
      }
      let mut subscriber = coordinator.activate(&path, ActivateOptions::push());
      println!("{}", serde_json::to_string(&subscriber.state())?);
      loop {
        tokio::select! {
          changed = subscriber.changed() => {
            let state = changed?;
            info!(path = subscriber.path(), status = ?state.status(), "state changed");
            println!("{}", serde_json::to_string(&state)?);
          }
          _ = tokio::signal::ctrl_c() => {
            info!(path = subscriber.path(), active = coordinator.active_count(), "interrupted");
            break;
          }
        }
      }
    }
    Command::Put { path, json } => {
      let value: Value =
        serde_json::from_str(&json).map_err(|e| eyre!("Invalid JSON value: {}", e))?;
      let coordinator = build_coordinator(&config, db_path.as_deref(), args.offline)?;
      let message_loop = if args.offline {
        None
      } else {
        let interceptor = Arc::new(build_interceptor(&config, db_path.as_deref())?);
        let (handle, task) = interceptor.spawn();
        coordinator.attach_interceptor(handle);
        Some(task)
      };
      coordinator.write(&path, value).await?;

      // Dropping the coordinator closes the channel; the loop then drains it.
      drop(coordinator);
      if let Some(task) = message_loop {
        match tokio::time::timeout(MESSAGE_DRAIN_TIMEOUT, task).await {
          Ok(Ok(())) => {}
          Ok(Err(e)) => warn!(error = %e, "interceptor message loop failed"),
          Err(_) => warn!("timed out waiting for interceptor pre-warm"),
        }
      }
      println!("ok");
    }
    Command::Clear { path, all } => {
      let coordinator = build_coordinator(&config, db_path.as_deref(), args.offline)?;
      match path {
        Some(path) if !all => {
          coordinator.clear_cache(&path)?;
          println!("cleared {}", path);
        }
        _ => {
          coordinator.clear_all()?;
          println!("cleared all entries");
        }
      }
    }
    Command::Fetch { url, navigate } => {
      let url = Url::parse(&url).map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;
      let interceptor = build_interceptor(&config, db_path.as_deref())?;
      if let Err(e) = interceptor.start().await {
        warn!(error = %e, "install failed, passing requests through");
      }
      let request = if navigate {
        InterceptRequest::navigate(url)
      } else {
        InterceptRequest::get(url)
      };
      let served = interceptor.handle(&request).await?;
      let source = match served.source {
        ResponseSource::Network => "network",
        ResponseSource::Cache => "cache",
        ResponseSource::Fallback => "offline fallback",
      };
      eprintln!(
        "{} {} ({})",
        served.response.status,
        served.response.content_type.as_deref().unwrap_or("-"),
        source
      );
      println!("{}", String::from_utf8_lossy(&served.response.body));
    }
    Command::Prune => {
      let interceptor = build_interceptor(&config, db_path.as_deref())?;
      for namespace in interceptor.activate()? {
        println!("deleted {}", namespace);
      }
    }
  }

  Ok(())
}

/// Report reachability of the remote as connectivity transitions.
async fn probe_connectivity(connectivity: Connectivity, url: String) {
  let client = reqwest::Client::new();
  let mut interval = tokio::time::interval(PROBE_INTERVAL);
  interval.tick().await;
  loop {
    interval.tick().await;
    match client.head(&url).timeout(PROBE_TIMEOUT).send().await {
      Ok(_) => connectivity.set_online(),
      Err(e) if e.is_connect() || e.is_timeout() => connectivity.set_offline(),
      Err(e) => warn!(error = %e, "connectivity probe failed"),
    }
  }
}

/// Open the durable store, degrading to memory when it is unavailable.
fn open_store(config: &Config, db_path: Option<&std::path::Path>) -> Arc<dyn PersistentStore> {
  let max_entries = config.cache.max_entries;
  let Some(path) = db_path else {
    warn!("no data directory, cache is memory-only");
    return Arc::new(MemoryStore::new(max_entries));
  };
  match SqliteStore::open(path, max_entries) {
    Ok(store) => {
      match store.len() {
        Ok(entries) => info!(path = %path.display(), entries, "opened cache database"),
        Err(e) => warn!(error = %e, "could not count cached entries"),
      }
      Arc::new(store)
    }
    Err(e) => {
      warn!(path = %path.display(), error = %e, "cache database unavailable, using memory");
      Arc::new(MemoryStore::new(max_entries))
    }
  }
}

fn build_coordinator(
  config: &Config,
  db_path: Option<&std::path::Path>,
  offline: bool,
) -> Result<CacheCoordinator> {
  let remote = HttpRemote::new(&config.remote.url, Config::get_auth_token())?;
  Ok(CacheCoordinator::new(
    open_store(config, db_path),
    Arc::new(remote),
    Connectivity::new(!offline),
    config.cache.default_ttl(),
  ))
}

fn build_interceptor(config: &Config, db_path: Option<&std::path::Path>) -> Result<Interceptor> {
  let settings = InterceptorSettings::from_config(&config.intercept, &config.remote.url)?;
  let namespaces: Arc<dyn NamespaceStore> = match db_path.map(SqliteNamespaces::open) {
    Some(Ok(store)) => Arc::new(store),
    Some(Err(e)) => {
      warn!(error = %e, "interceptor database unavailable, using memory");
      Arc::new(MemoryNamespaces::new())
    }
    None => Arc::new(MemoryNamespaces::new()),
  };
  Ok(Interceptor::new(settings, namespaces, Arc::new(HttpUpstream::new()?)))
}
