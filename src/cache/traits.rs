//! Core types describing what a strategy handed back and where it came from.

use chrono::{DateTime, Utc};

use crate::request::Response;

/// A response read back from a partition.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// Partition the entry was found in
  pub partition: String,
  /// When the entry was last written
  pub stored_at: DateTime<Utc>,
}

/// Result of handling a request, including the response and where it came from.
#[derive(Debug, Clone)]
pub struct Served {
  /// The response handed to the caller
  pub response: Response,
  /// Where the response came from
  pub source: CacheSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  /// Fresh data from the network.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Served from a partition without waiting for the network.
  pub fn from_cache(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: CacheSource::Cache,
      cached_at: Some(cached.stored_at),
    }
  }

  /// The network failed and a previously cached copy was used.
  pub fn offline(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: CacheSource::Offline,
      cached_at: Some(cached.stored_at),
    }
  }

  /// The network failed, nothing was cached, and the offline document was used.
  pub fn offline_page(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: CacheSource::OfflinePage,
      cached_at: Some(cached.stored_at),
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, returned before any network result
  Cache,
  /// Network unavailable, serving the cached copy of the same request
  Offline,
  /// Network unavailable and nothing cached, serving the offline document
  OfflinePage,
}

impl CacheSource {
  pub fn label(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline (cached copy)",
      Self::OfflinePage => "offline page",
    }
  }
}
