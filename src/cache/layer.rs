//! Cache layer that orchestrates caching strategies with network fetching.

use color_eyre::Result;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::key::RequestKey;
use super::storage::CacheStorage;
use super::traits::Served;
use crate::fetch::Fetcher;
use crate::request::{Request, Response};

/// Cache layer that manages caching strategies and network fetching.
///
/// This layer sits between intercepted requests and the network, providing
/// offline support from named partitions. Refreshes started after a cached
/// response has been returned run on the tokio runtime and are tracked until
/// [`CacheLayer::settle`] is awaited.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  fetcher: Arc<dyn Fetcher>,
  background: Mutex<JoinSet<()>>,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  pub fn new(storage: Arc<S>, fetcher: Arc<dyn Fetcher>) -> Self {
    Self {
      storage,
      fetcher,
      background: Mutex::new(JoinSet::new()),
    }
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn fetcher(&self) -> &dyn Fetcher {
    self.fetcher.as_ref()
  }

  /// Stale-while-revalidate.
  ///
  /// 1. Look the request up in each of `lookup`, in order
  /// 2. Start a network fetch that stores a 200 into `target`
  /// 3. Return the cached copy immediately if there was one
  /// 4. Otherwise wait for the network; if it fails, use `offline_page`
  pub async fn stale_while_revalidate(
    &self,
    request: &Request,
    lookup: &[&str],
    target: &str,
    offline_page: Option<&RequestKey>,
  ) -> Result<Served> {
    let key = RequestKey::from(request);

    let mut cached = None;
    for partition in lookup {
      if let Some(hit) = self.storage.match_in(partition, &key)? {
        cached = Some(hit);
        break;
      }
    }

    if let Some(cached) = cached {
      debug!(%key, partition = %cached.partition, "serving cached copy, revalidating");
      self.refresh_in_background(request, target);
      return Ok(Served::from_cache(cached));
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        remember(self.storage.as_ref(), target, &key, &response)?;
        Ok(Served::from_network(response))
      }
      Err(err) => self.offline_page_or(err, &key, offline_page),
    }
  }

  /// Cache-first with background refresh.
  ///
  /// A hit is returned immediately and refreshed behind the caller's back.
  /// A miss goes to the network; failures propagate.
  pub async fn cache_first(&self, request: &Request, partition: &str) -> Result<Served> {
    let key = RequestKey::from(request);

    if let Some(cached) = self.storage.match_in(partition, &key)? {
      debug!(%key, partition, "cache hit");
      self.refresh_in_background(request, partition);
      return Ok(Served::from_cache(cached));
    }

    debug!(%key, partition, "cache miss");
    let response = self.fetcher.fetch(request).await?;
    remember(self.storage.as_ref(), partition, &key, &response)?;
    Ok(Served::from_network(response))
  }

  /// Network-first.
  ///
  /// The network response is returned whatever its status. Only when the
  /// fetch itself fails is the cached copy used, then `offline_page`.
  pub async fn network_first(
    &self,
    request: &Request,
    partition: &str,
    offline_page: Option<&RequestKey>,
  ) -> Result<Served> {
    let key = RequestKey::from(request);

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        remember(self.storage.as_ref(), partition, &key, &response)?;
        Ok(Served::from_network(response))
      }
      Err(err) => {
        if let Some(cached) = self.storage.match_in(partition, &key)? {
          debug!(%key, partition, error = %err, "network failed, serving cached copy");
          return Ok(Served::offline(cached));
        }
        self.offline_page_or(err, &key, offline_page)
      }
    }
  }

  /// Wait for every background refresh started so far.
  pub async fn settle(&self) {
    let mut pending = {
      let mut guard = self
        .background
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      std::mem::take(&mut *guard)
    };

    while let Some(joined) = pending.join_next().await {
      if let Err(e) = joined {
        warn!(error = %e, "background refresh task failed");
      }
    }
  }

  fn offline_page_or(
    &self,
    err: color_eyre::Report,
    key: &RequestKey,
    offline_page: Option<&RequestKey>,
  ) -> Result<Served> {
    if let Some(page_key) = offline_page {
      if let Some(page) = self.storage.match_any(page_key)? {
        debug!(%key, error = %err, "network failed, serving offline page");
        return Ok(Served::offline_page(page));
      }
    }
    Err(err)
  }

  fn refresh_in_background(&self, request: &Request, partition: &str) {
    let storage = Arc::clone(&self.storage);
    let fetcher = Arc::clone(&self.fetcher);
    let request = request.clone();
    let partition = partition.to_string();

    let task = async move {
      let key = RequestKey::from(&request);
      match fetcher.fetch(&request).await {
        Ok(response) => {
          if let Err(e) = remember(storage.as_ref(), &partition, &key, &response) {
            warn!(%key, %partition, error = %e, "failed to store refreshed response");
          }
        }
        Err(e) => warn!(%key, error = %e, "background refresh failed"),
      }
    };

    let mut background = self
      .background
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    while let Some(joined) = background.try_join_next() {
      if let Err(e) = joined {
        warn!(error = %e, "background refresh task failed");
      }
    }
    background.spawn(task);
  }

  /// Refreshes spawned and not yet reaped.
  #[cfg(test)]
  fn in_flight(&self) -> usize {
    self
      .background
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }
}

/// Store a response if it is a 200. Returns whether it was written.
fn remember<S: CacheStorage + ?Sized>(
  storage: &S,
  partition: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<bool> {
  if !response.is_cacheable() {
    debug!(%key, status = response.status, "not caching non-200 response");
    return Ok(false);
  }
  storage.put(partition, key, response)?;
  debug!(%key, partition, bytes = response.body.len(), "stored response");
  Ok(true)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::fetch::testing::StubFetcher;
  use url::Url;

  const SCOPE: &str = "https://club.example.org";
  const GENERAL: &str = "app-v1";
  const IMAGES: &str = "app-images-v1";

  fn setup() -> (CacheLayer<SqliteStorage>, Arc<StubFetcher>) {
    let storage = Arc::new(SqliteStorage::open_in_memory(SCOPE).unwrap());
    storage.open_partition(GENERAL).unwrap();
    storage.open_partition(IMAGES).unwrap();
    let fetcher = Arc::new(StubFetcher::new());
    (CacheLayer::new(storage, fetcher.clone()), fetcher)
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  fn seed(layer: &CacheLayer<SqliteStorage>, partition: &str, url: &str, body: &str) {
    layer
      .storage()
      .put(partition, &RequestKey::from(&get(url)), &Response::new(200, body))
      .unwrap();
  }

  fn body(served: &Served) -> &str {
    std::str::from_utf8(&served.response.body).unwrap()
  }

  #[tokio::test]
  async fn test_cache_first_returns_cached_then_refreshes() {
    let (layer, fetcher) = setup();
    let url = "https://club.example.org/img.webp";
    seed(&layer, IMAGES, url, "old");
    fetcher.respond(url, 200, "new");

    let served = layer.cache_first(&get(url), IMAGES).await.unwrap();
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(body(&served), "old");

    layer.settle().await;
    assert_eq!(fetcher.calls_for(url), 1);

    let served = layer.cache_first(&get(url), IMAGES).await.unwrap();
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(body(&served), "new");
    layer.settle().await;
  }

  #[tokio::test]
  async fn test_finished_refreshes_are_reaped_without_settle() {
    let (layer, fetcher) = setup();
    let url = "https://club.example.org/banner.png";
    seed(&layer, IMAGES, url, "banner");
    fetcher.respond(url, 200, "banner");

    for _ in 0..5 {
      layer.cache_first(&get(url), IMAGES).await.unwrap();
      for _ in 0..10 {
        tokio::task::yield_now().await;
      }
    }
    assert_eq!(fetcher.calls_for(url), 5);
    assert_eq!(layer.in_flight(), 1);
    layer.settle().await;
    assert_eq!(layer.in_flight(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores() {
    let (layer, fetcher) = setup();
    let url = "https://club.example.org/logo.png";
    fetcher.respond(url, 200, "png");

    let served = layer.cache_first(&get(url), IMAGES).await.unwrap();
    assert_eq!(served.source, CacheSource::Network);

    let key = RequestKey::from(&get(url));
    assert!(layer.storage().match_in(IMAGES, &key).unwrap().is_some());
    assert!(layer.storage().match_in(GENERAL, &key).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_cache_first_miss_propagates_network_failure() {
    let (layer, fetcher) = setup();
    fetcher.set_offline(true);
    let result = layer
      .cache_first(&get("https://club.example.org/missing.gif"), IMAGES)
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_failed_background_refresh_keeps_cached_entry() {
    let (layer, fetcher) = setup();
    let url = "https://club.example.org/team.jpg";
    seed(&layer, IMAGES, url, "kept");
    fetcher.respond(url, 500, "error page");

    layer.cache_first(&get(url), IMAGES).await.unwrap();
    layer.settle().await;

    let stored = layer
      .storage()
      .match_in(IMAGES, &RequestKey::from(&get(url)))
      .unwrap()
      .unwrap();
    assert_eq!(stored.response.body, b"kept");
  }

  #[tokio::test]
  async fn test_network_first_prefers_network() {
    let (layer, fetcher) = setup();
    let url = "https://club.example.org/api/events";
    seed(&layer, GENERAL, url, "cached");
    fetcher.respond(url, 200, "fresh");

    let served = layer.network_first(&get(url), GENERAL, None).await.unwrap();
    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(body(&served), "fresh");

    fetcher.set_offline(true);
    let served = layer.network_first(&get(url), GENERAL, None).await.unwrap();
    assert_eq!(served.source, CacheSource::Offline);
    assert_eq!(body(&served), "fresh");
  }

  #[tokio::test]
  async fn test_network_first_returns_error_status_without_caching() {
    let (layer, fetcher) = setup();
    let url = "https://club.example.org/api/events";
    seed(&layer, GENERAL, url, "cached");
    fetcher.respond(url, 500, "boom");

    let served = layer.network_first(&get(url), GENERAL, None).await.unwrap();
    assert_eq!(served.response.status, 500);

    let stored = layer
      .storage()
      .match_in(GENERAL, &RequestKey::from(&get(url)))
      .unwrap()
      .unwrap();
    assert_eq!(stored.response.body, b"cached");
  }

  #[tokio::test]
  async fn test_network_first_offline_page_and_plain_failure() {
    let (layer, fetcher) = setup();
    let offline = RequestKey::from(&get("https://club.example.org/offline.html"));
    seed(&layer, GENERAL, "https://club.example.org/offline.html", "offline");
    fetcher.set_offline(true);

    let served = layer
      .network_first(&get("https://club.example.org/events"), GENERAL, Some(&offline))
      .await
      .unwrap();
    assert_eq!(served.source, CacheSource::OfflinePage);
    assert_eq!(body(&served), "offline");

    let result = layer
      .network_first(&get("https://club.example.org/events"), GENERAL, None)
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_checks_general_first() {
    let (layer, fetcher) = setup();
    let url = "https://fonts.example.com/inter.css";
    seed(&layer, GENERAL, url, "general");
    seed(&layer, IMAGES, url, "image");
    fetcher.respond(url, 200, "fresh");

    let served = layer
      .stale_while_revalidate(&get(url), &[GENERAL, IMAGES], GENERAL, None)
      .await
      .unwrap();
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(body(&served), "general");
    layer.settle().await;
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_waits_for_network() {
    let (layer, fetcher) = setup();
    let url = "https://images.unsplash.com/photo-1.jpg";
    fetcher.respond(url, 200, "photo");

    let served = layer
      .stale_while_revalidate(&get(url), &[GENERAL, IMAGES], IMAGES, None)
      .await
      .unwrap();
    assert_eq!(served.source, CacheSource::Network);

    let key = RequestKey::from(&get(url));
    assert!(layer.storage().match_in(IMAGES, &key).unwrap().is_some());
    assert!(layer.storage().match_in(GENERAL, &key).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_failure_without_cache() {
    let (layer, fetcher) = setup();
    fetcher.set_offline(true);

    let result = layer
      .stale_while_revalidate(
        &get("https://cdn.example.com/lib.js"),
        &[GENERAL, IMAGES],
        GENERAL,
        None,
      )
      .await;
    assert!(result.is_err());
  }
}
