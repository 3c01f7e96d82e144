//! Controller lifecycle: state machine and persisted registrations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::fmt;
use std::str::FromStr;

use crate::cache::SqliteStorage;

/// Lifecycle of one controller version within a scope.
///
/// `Registered -> Installing -> Installed -> Activating -> Activated`, with
/// `Redundant` for a failed install or a version that has been superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Registered,
  Installing,
  /// Installed and waiting to take over
  Installed,
  Activating,
  /// Controlling requests for the scope
  Activated,
  Redundant,
}

impl LifecycleState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Registered => "registered",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    }
  }

  pub fn can_transition_to(self, next: LifecycleState) -> bool {
    use LifecycleState::*;

    matches!(
      (self, next),
      (Registered, Installing)
        | (Installing, Installed)
        | (Installing, Redundant)
        | (Installed, Activating)
        | (Installed, Redundant)
        | (Activating, Activated)
        | (Activated, Redundant)
        | (Redundant, Registered)
    )
  }

  /// Move to `next`, or fail if the lifecycle does not allow it.
  pub fn transition(self, next: LifecycleState) -> Result<LifecycleState> {
    if self.can_transition_to(next) {
      Ok(next)
    } else {
      Err(eyre!("Invalid lifecycle transition: {} -> {}", self, next))
    }
  }
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

impl FromStr for LifecycleState {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "registered" => Ok(Self::Registered),
      "installing" => Ok(Self::Installing),
      "installed" => Ok(Self::Installed),
      "activating" => Ok(Self::Activating),
      "activated" => Ok(Self::Activated),
      "redundant" => Ok(Self::Redundant),
      other => Err(eyre!("Unknown lifecycle state '{}'", other)),
    }
  }
}

/// A controller version's recorded state.
#[derive(Debug, Clone)]
pub struct Registration {
  pub version: String,
  pub state: LifecycleState,
  pub updated_at: DateTime<Utc>,
}

/// Persistence for registrations.
pub trait RegistrationStore: Send + Sync {
  fn registration(&self, scope: &str, version: &str) -> Result<Option<Registration>>;

  /// All versions recorded for a scope, most recently updated first.
  fn registrations(&self, scope: &str) -> Result<Vec<Registration>>;

  fn record_state(&self, scope: &str, version: &str, state: LifecycleState) -> Result<()>;

  /// Mark every other activated or waiting version in the scope redundant.
  fn retire_others(&self, scope: &str, version: &str) -> Result<usize>;

  /// The version currently controlling the scope.
  fn active_version(&self, scope: &str) -> Result<Option<String>> {
    Ok(
      self
        .registrations(scope)?
        .into_iter()
        .find(|r| r.state == LifecycleState::Activated)
        .map(|r| r.version),
    )
  }
}

impl RegistrationStore for SqliteStorage {
  fn registration(&self, scope: &str, version: &str) -> Result<Option<Registration>> {
    let conn = self.lock()?;
    let row: Option<(String, String)> = conn
      .query_row(
        "SELECT state, updated_at FROM registrations WHERE scope = ? AND version = ?",
        params![scope, version],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read registration: {}", e))?;

    match row {
      Some((state, updated_at)) => Ok(Some(Registration {
        version: version.to_string(),
        state: state.parse()?,
        updated_at: crate::cache::parse_datetime(&updated_at)?,
      })),
      None => Ok(None),
    }
  }

  fn registrations(&self, scope: &str) -> Result<Vec<Registration>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT version, state, updated_at FROM registrations
         WHERE scope = ?
         ORDER BY updated_at DESC, version DESC",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String, String)> = stmt
      .query_map(params![scope], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      })
      .map_err(|e| eyre!("Failed to list registrations: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read registration: {}", e))?;

    rows
      .into_iter()
      .map(|(version, state, updated_at)| {
        Ok(Registration {
          version,
          state: state.parse()?,
          updated_at: crate::cache::parse_datetime(&updated_at)?,
        })
      })
      .collect()
  }

  fn record_state(&self, scope: &str, version: &str, state: LifecycleState) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO registrations (scope, version, state, updated_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![scope, version, state.as_str()],
      )
      .map_err(|e| eyre!("Failed to record registration state: {}", e))?;
    Ok(())
  }

  fn retire_others(&self, scope: &str, version: &str) -> Result<usize> {
    let conn = self.lock()?;
    let retired = conn
      .execute(
        "UPDATE registrations SET state = 'redundant', updated_at = datetime('now')
         WHERE scope = ? AND version != ? AND state != 'redundant'",
        params![scope, version],
      )
      .map_err(|e| eyre!("Failed to retire old registrations: {}", e))?;
    Ok(retired)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use LifecycleState::*;

  const SCOPE: &str = "https://club.example.org";

  #[test]
  fn test_happy_path_transitions() {
    let state = Registered
      .transition(Installing)
      .and_then(|s| s.transition(Installed))
      .and_then(|s| s.transition(Activating))
      .and_then(|s| s.transition(Activated))
      .unwrap();
    assert_eq!(state, Activated);
  }

  #[test]
  fn test_invalid_transitions_are_rejected() {
    assert!(Registered.transition(Activated).is_err());
    assert!(Installing.transition(Activating).is_err());
    assert!(Activated.transition(Installing).is_err());
    assert!(Redundant.transition(Activated).is_err());
    let err = Registered.transition(Installed).unwrap_err();
    assert!(err.to_string().contains("registered -> installed"));
  }

  #[test]
  fn test_state_round_trips_through_text() {
    for state in [Registered, Installing, Installed, Activating, Activated, Redundant] {
      assert_eq!(state.as_str().parse::<LifecycleState>().unwrap(), state);
    }
    assert!("waiting".parse::<LifecycleState>().is_err());
  }

  #[test]
  fn test_single_active_version_per_scope() {
    let storage = SqliteStorage::open_in_memory(SCOPE).unwrap();
    let scope = SCOPE;

    storage.record_state(scope, "v1", Activated).unwrap();
    assert_eq!(storage.active_version(scope).unwrap().as_deref(), Some("v1"));

    storage.record_state(scope, "v2", Installed).unwrap();
    assert_eq!(storage.active_version(scope).unwrap().as_deref(), Some("v1"));

    storage.record_state(scope, "v2", Activated).unwrap();
    assert_eq!(storage.retire_others(scope, "v2").unwrap(), 1);
    assert_eq!(storage.active_version(scope).unwrap().as_deref(), Some("v2"));
    assert_eq!(
      storage.registration(scope, "v1").unwrap().unwrap().state,
      Redundant
    );
  }

  #[test]
  fn test_scopes_are_independent() {
    let storage = SqliteStorage::open_in_memory(SCOPE).unwrap();
    storage.record_state("https://a.org", "v1", Activated).unwrap();
    storage.record_state("https://b.org", "v7", Activated).unwrap();
    storage.retire_others("https://a.org", "v1").unwrap();

    assert_eq!(
      storage.active_version("https://b.org").unwrap().as_deref(),
      Some("v7")
    );
    assert!(storage.registration("https://a.org", "v2").unwrap().is_none());
  }
}
