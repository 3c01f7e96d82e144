mod cache;
mod classify;
mod commands;
mod config;
mod controller;
mod event;
mod fetch;
mod lifecycle;
mod logging;
mod request;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::SqliteStorage;
use crate::controller::Controller;
use crate::fetch::HttpFetcher;
use crate::request::Destination;

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "Offline cache controller for a static site")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./swcache.yaml or $XDG_CONFIG_HOME/swcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Cache version token, overriding the config file
  #[arg(long, global = true)]
  version_token: Option<String>,

  /// Echo debug logs to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache critical assets and create the image partition
  Install {
    /// Stay in the waiting state instead of activating immediately
    #[arg(long)]
    no_activate: bool,
  },
  /// Remove orphaned partitions and take control of the scope
  Activate,
  /// Send one request through the controller
  Fetch {
    /// Site path (e.g. /about) or absolute URL
    target: String,
    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    /// Declared request destination
    #[arg(long, value_enum)]
    dest: Option<Destination>,
    /// Write the body to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// List partitions and their entries
  Caches,
  /// Show lifecycle state of every recorded version
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override version if specified on command line
  let config = if let Some(version) = args.version_token {
    config::Config { version, ..config }
  } else {
    config
  };

  let _guard = logging::init(&config.log_path()?, args.verbose)?;

  let storage = Arc::new(SqliteStorage::open(&config.database_path()?, &config.scope())?);
  let fetcher = Arc::new(HttpFetcher::new(&config)?);
  let controller = Controller::new(Arc::new(config), storage, fetcher)?;

  match args.command {
    Command::Install { no_activate } => commands::install(&controller, !no_activate).await,
    Command::Activate => commands::activate(&controller).await,
    Command::Fetch {
      target,
      method,
      navigate,
      dest,
      output,
    } => {
      commands::fetch(
        &controller,
        commands::FetchOptions {
          target,
          method,
          navigate,
          destination: dest,
          output,
        },
      )
      .await
    }
    Command::Caches => commands::caches(&controller),
    Command::Status => commands::status(&controller),
  }
}
