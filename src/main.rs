mod avatar;
mod cache;
mod config;
mod event;
mod providers;
mod queue;
mod registry;
mod scheduler;
mod status;
mod transport;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cache::{CacheStore, NoopStore, SqliteStore};
use crate::event::UpdateEvent;
use crate::transport::ReqwestTransport;

#[derive(Parser, Debug)]
#[command(name = "gitpulse")]
#[command(about = "Watches CI/CD status and author avatars for your git repositories")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/gitpulse/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Only watch the repository at this path
  #[arg(short, long)]
  repo: Option<String>,
}

fn init_tracing() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("gitpulse")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let file_appender = tracing_appender::rolling::daily(log_dir, "gitpulse.log");
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false),
    )
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false),
    )
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = init_tracing()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;
  let registry = registry::RepoRegistry::from_config(&config);

  let store: Arc<dyn CacheStore> = if config.cache.enabled {
    Arc::new(SqliteStore::open()?)
  } else {
    Arc::new(NoopStore)
  };
  let transport: Arc<dyn transport::HttpTransport> = Arc::new(ReqwestTransport::new()?);

  let statuses = status::StatusManager::new(Arc::clone(&store), Arc::clone(&transport));
  let avatar_dir = avatar::AvatarManager::default_avatar_dir()?;
  std::fs::create_dir_all(&avatar_dir)
    .map_err(|e| eyre!("Failed to create avatar directory: {}", e))?;
  let avatars = avatar::AvatarManager::new(store, transport, avatar_dir);

  let status_loop = statuses.spawn();
  let avatar_loop = avatars.spawn();

  let mut watched = 0;
  for repo in registry.list_repos() {
    if let Some(only) = &args.repo {
      if &repo.path != only {
        continue;
      }
    }
    watched += 1;

    for hash in &repo.commits {
      statuses.fetch(repo, hash, &repo.commits)?;
    }
    if config.avatars.enabled {
      for email in &repo.authors {
        avatars.fetch(repo, email)?;
      }
    }
  }

  if watched == 0 {
    error!("no repositories to watch, check the configuration");
  } else {
    info!(repos = watched, "watching repositories");
  }

  let mut status_events = statuses.subscribe();
  let mut avatar_events = avatars.subscribe();

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        info!("shutting down");
        break;
      }
      Ok(event) = status_events.recv() => {
        if let UpdateEvent::StatusesChanged { repo } = event {
          info!(repo, "statuses updated");
        }
      }
      Ok(event) = avatar_events.recv() => {
        if let UpdateEvent::AvatarChanged { email } = event {
          info!(email, "avatar updated");
        }
      }
    }
  }

  statuses.dispose();
  avatars.dispose();
  let _ = status_loop.await;
  let _ = avatar_loop.await;

  Ok(())
}
