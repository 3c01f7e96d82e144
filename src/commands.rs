//! Handlers for the command-line subcommands.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::cache::{CacheSource, CacheStorage, SqliteStorage};
use crate::controller::{Controller, Outcome};
use crate::event::{Event, EventOutcome};
use crate::lifecycle::RegistrationStore;
use crate::request::{Destination, Request, Response};

/// Options for a single intercepted request.
#[derive(Debug, Clone)]
pub struct FetchOptions {
  pub target: String,
  pub method: String,
  pub navigate: bool,
  pub destination: Option<Destination>,
  pub output: Option<PathBuf>,
}

pub async fn install(controller: &Controller<SqliteStorage>, activate: bool) -> Result<()> {
  let report = match controller.dispatch(Event::Install).await? {
    EventOutcome::Installed(report) => report,
    other => return Err(eyre!("Unexpected install outcome: {:?}", other)),
  };

  println!(
    "installed {} ({} assets precached)",
    controller.config().version,
    report.precached
  );

  if activate && report.skip_waiting {
    info!("skipping wait, activating immediately");
    self::activate(controller).await?;
  } else if report.skip_waiting {
    println!("waiting: run `swcache activate` to take over");
  }
  Ok(())
}

pub async fn activate(controller: &Controller<SqliteStorage>) -> Result<()> {
  let report = match controller.dispatch(Event::Activate).await? {
    EventOutcome::Activated(report) => report,
    other => return Err(eyre!("Unexpected activate outcome: {:?}", other)),
  };

  for name in &report.removed {
    println!("removed partition {}", name);
  }
  println!(
    "activated {} ({} older version(s) retired)",
    controller.config().version,
    report.retired
  );
  Ok(())
}

pub async fn fetch(controller: &Controller<SqliteStorage>, opts: FetchOptions) -> Result<()> {
  let url = controller.config().resolve(&opts.target)?;
  let method = Method::from_bytes(opts.method.to_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method {}: {}", opts.method, e))?;

  let mut request = if opts.navigate {
    Request::navigate(url)
  } else {
    Request::get(url)
  };
  request = request.with_method(method);
  if let Some(destination) = opts.destination {
    request = request.with_destination(destination);
  }

  let outcome = match controller.dispatch(Event::Fetch(request.clone())).await? {
    EventOutcome::Fetched(outcome) => outcome,
    other => return Err(eyre!("Unexpected fetch outcome: {:?}", other)),
  };

  let (response, source) = match outcome {
    Outcome::Respond(served) => {
      if served.source == CacheSource::OfflinePage {
        warn!(url = %request.url, "network unreachable, answered with the offline page");
      }
      let source = match served.cached_at {
        Some(at) => format!(
          "{} (stored {})",
          served.source.label(),
          at.format("%Y-%m-%d %H:%M:%S")
        ),
        None => served.source.label().to_string(),
      };
      (served.response, source)
    }
    Outcome::Passthrough => (
      controller.passthrough(&request).await?,
      "pass-through".to_string(),
    ),
  };

  // Let any background refresh land before the process exits.
  controller.settle().await;

  eprintln!(
    "{} {} [{}] <- {}",
    response.status,
    request.url,
    response.header("content-type").unwrap_or("-"),
    source
  );
  write_body(&response, opts.output.as_ref())
}

fn write_body(response: &Response, output: Option<&PathBuf>) -> Result<()> {
  match output {
    Some(path) => std::fs::write(path, &response.body)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e)),
    None => {
      let mut stdout = std::io::stdout().lock();
      stdout
        .write_all(&response.body)
        .and_then(|_| stdout.flush())
        .map_err(|e| eyre!("Failed to write response body: {}", e))
    }
  }
}

pub fn caches(controller: &Controller<SqliteStorage>) -> Result<()> {
  let storage = controller.storage();
  let current = [
    controller.config().general_cache(),
    controller.config().image_cache(),
  ];

  let names = storage.partition_names()?;
  if names.is_empty() {
    println!("no partitions");
    return Ok(());
  }

  for name in names {
    let entries = storage.entries(&name)?;
    let marker = if current.contains(&name) { "" } else { " (orphaned)" };
    println!("{}{}: {} entries", name, marker, entries.len());
    for entry in entries {
      println!(
        "  {} {} {} {}B {}",
        entry.status,
        entry.method,
        entry.url,
        entry.size,
        entry.stored_at.format("%Y-%m-%d %H:%M:%S")
      );
    }
  }
  Ok(())
}

pub fn status(controller: &Controller<SqliteStorage>) -> Result<()> {
  let scope = controller.config().scope();
  println!("scope {}", scope);
  println!(
    "this version: {} ({})",
    controller.config().version,
    controller.state()
  );

  for reg in controller.storage().registrations(&scope)? {
    println!(
      "  {:<12} {:<10} {}",
      reg.version,
      reg.state,
      reg.updated_at.format("%Y-%m-%d %H:%M:%S")
    );
  }

  for name in [
    controller.config().general_cache(),
    controller.config().image_cache(),
  ] {
    let present = controller.storage().has_partition(&name)?;
    println!("  partition {}: {}", name, if present { "present" } else { "missing" });
  }

  match controller.storage().active_version(&scope)? {
    Some(version) => println!("active: {}", version),
    None => println!("active: none"),
  }
  Ok(())
}
