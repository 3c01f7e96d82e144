//! Events delivered to the controller by its host.

use crate::controller::{ActivationReport, InstallReport, Outcome};
use crate::request::Request;

/// Lifecycle and interception events, dispatched by `Controller::dispatch`.
#[derive(Debug)]
pub enum Event {
  /// A new version was registered and should populate its caches
  Install,
  /// The installed version is taking over the scope
  Activate,
  /// An outgoing request was intercepted
  Fetch(Request),
}

/// Result of handling an [`Event`].
#[derive(Debug)]
pub enum EventOutcome {
  Installed(InstallReport),
  Activated(ActivationReport),
  Fetched(Outcome),
}
