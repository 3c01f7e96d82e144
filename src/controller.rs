//! The offline cache controller: lifecycle events and request dispatch.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::cache::{CacheLayer, CacheStorage, RequestKey, Served};
use crate::classify::{classify, RequestClass};
use crate::config::Config;
use crate::event::{Event, EventOutcome};
use crate::fetch::Fetcher;
use crate::lifecycle::{LifecycleState, RegistrationStore};
use crate::request::{Request, Response};

/// What the controller decided to do with an intercepted request.
#[derive(Debug)]
pub enum Outcome {
  /// Not intercepted; the request goes to the network untouched
  Passthrough,
  /// Answered by the controller
  Respond(Served),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
  /// Number of assets stored in the general partition
  pub precached: usize,
  /// Whether the new version asks to take over without waiting
  pub skip_waiting: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
  /// Orphaned partitions that were deleted
  pub removed: Vec<String>,
  /// Older versions in the scope marked redundant
  pub retired: usize,
}

/// One controller version for one scope.
pub struct Controller<S: CacheStorage + RegistrationStore> {
  config: Arc<Config>,
  layer: CacheLayer<S>,
  state: Mutex<LifecycleState>,
  offline_key: RequestKey,
}

impl<S: CacheStorage + RegistrationStore + 'static> Controller<S> {
  /// Load (or register) this configuration's version.
  ///
  /// A version left mid-install by an interrupted run is considered
  /// redundant; one left mid-activation goes back to waiting.
  pub fn new(config: Arc<Config>, storage: Arc<S>, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
    let scope = config.scope();
    if storage.scope() != scope {
      return Err(eyre!(
        "Cache storage is opened for {}, not {}",
        storage.scope(),
        scope
      ));
    }
    let state = match storage.registration(&scope, &config.version)? {
      Some(reg) => match reg.state {
        LifecycleState::Installing => {
          warn!(version = %config.version, "previous install was interrupted");
          LifecycleState::Redundant
        }
        LifecycleState::Activating => LifecycleState::Installed,
        other => other,
      },
      None => LifecycleState::Registered,
    };
    storage.record_state(&scope, &config.version, state)?;

    let offline_key = RequestKey::from(&Request::get(config.offline_url()?));

    Ok(Self {
      config,
      layer: CacheLayer::new(storage, fetcher),
      state: Mutex::new(state),
      offline_key,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn storage(&self) -> &S {
    self.layer.storage()
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn set_state(&self, next: LifecycleState) -> Result<()> {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    let next = state.transition(next)?;
    self
      .layer
      .storage()
      .record_state(&self.config.scope(), &self.config.version, next)?;
    *state = next;
    Ok(())
  }

  /// Route a lifecycle or fetch event to its handler.
  pub async fn dispatch(&self, event: Event) -> Result<EventOutcome> {
    match event {
      Event::Install => Ok(EventOutcome::Installed(self.install().await?)),
      Event::Activate => Ok(EventOutcome::Activated(self.activate().await?)),
      Event::Fetch(request) => Ok(EventOutcome::Fetched(self.handle(&request).await?)),
    }
  }

  /// Precache the critical assets and create the image partition.
  ///
  /// Any listed asset that fails to fetch, or comes back with anything but a
  /// 200, fails the whole install and no partition is written. The version is then redundant and whatever version was
  /// already active keeps serving.
  pub async fn install(&self) -> Result<InstallReport> {
    match self.state() {
      LifecycleState::Activated => {
        info!(version = %self.config.version, "version already active, nothing to install");
        return Ok(InstallReport {
          precached: 0,
          skip_waiting: false,
        });
      }
      LifecycleState::Installed => {
        info!(version = %self.config.version, "version already installed and waiting");
        return Ok(InstallReport {
          precached: 0,
          skip_waiting: true,
        });
      }
      LifecycleState::Redundant => self.set_state(LifecycleState::Registered)?,
      _ => {}
    }

    self.set_state(LifecycleState::Installing)?;
    info!(version = %self.config.version, "installing");

    match self.populate().await {
      Ok(precached) => {
        self.set_state(LifecycleState::Installed)?;
        info!(version = %self.config.version, precached, "installed");
        Ok(InstallReport {
          precached,
          skip_waiting: true,
        })
      }
      Err(e) => {
        self.set_state(LifecycleState::Redundant)?;
        warn!(version = %self.config.version, error = %e, "install failed");
        Err(e)
      }
    }
  }

  /// Fetch the precache list and the offline document concurrently.
  ///
  /// The list is all-or-nothing and lands in one transaction. The offline
  /// document is best-effort unless it is on the list. The image partition
  /// is only created once the general partition has been written.
  async fn populate(&self) -> Result<usize> {
    let general = self.config.general_cache();
    let images = self.config.image_cache();

    let assets: Vec<Request> = self
      .config
      .precache_urls()?
      .into_iter()
      .map(Request::get)
      .collect();
    let offline_page = Request::get(self.config.offline_url()?);
    let listed = assets.iter().any(|r| r.url == offline_page.url);

    let (responses, offline) = futures::join!(
      try_join_all(assets.iter().map(|r| self.precache_one(r))),
      async {
        if listed {
          None
        } else {
          Some(self.precache_one(&offline_page).await)
        }
      }
    );

    let mut batch: Vec<(RequestKey, Response)> = assets
      .iter()
      .map(RequestKey::from)
      .zip(responses?)
      .collect();
    match offline {
      Some(Ok(response)) => batch.push((RequestKey::from(&offline_page), response)),
      Some(Err(e)) => {
        warn!(
          url = %offline_page.url,
          error = %e,
          "offline page unavailable, navigations will not fall back"
        );
      }
      None => {}
    }

    let storage = self.layer.storage();
    storage.put_all(&general, &batch)?;
    storage.open_partition(&images)?;
    Ok(batch.len())
  }

  async fn precache_one(&self, request: &Request) -> Result<Response> {
    let response = self
      .layer
      .fetcher()
      .fetch(request)
      .await
      .map_err(|e| eyre!("Failed to precache {}: {}", request.url, e))?;

    if !response.is_cacheable() {
      return Err(eyre!(
        "Failed to precache {}: status {}",
        request.url,
        response.status
      ));
    }
    debug!(url = %request.url, bytes = response.body.len(), "precached");
    Ok(response)
  }

  /// Delete orphaned partitions and take control of the scope.
  pub async fn activate(&self) -> Result<ActivationReport> {
    let already_active = self.state() == LifecycleState::Activated;
    if !already_active {
      self.set_state(LifecycleState::Activating)?;
    }

    let current = [self.config.general_cache(), self.config.image_cache()];
    let storage = self.layer.storage();
    let mut removed = Vec::new();
    for name in storage.partition_names()? {
      if current.contains(&name) {
        continue;
      }
      if storage.delete_partition(&name)? {
        info!(partition = %name, "deleted orphaned partition");
        removed.push(name);
      }
    }

    if !already_active {
      self.set_state(LifecycleState::Activated)?;
    }
    let retired = storage.retire_others(&self.config.scope(), &self.config.version)?;
    info!(
      version = %self.config.version,
      removed = removed.len(),
      retired,
      "activated, controlling scope"
    );

    Ok(ActivationReport { removed, retired })
  }

  /// Decide and run the caching strategy for one intercepted request.
  pub async fn handle(&self, request: &Request) -> Result<Outcome> {
    if !request.is_get() {
      debug!(method = %request.method, url = %request.url, "not a GET, passing through");
      return Ok(Outcome::Passthrough);
    }
    if self.state() != LifecycleState::Activated {
      debug!(url = %request.url, state = %self.state(), "not controlling, passing through");
      return Ok(Outcome::Passthrough);
    }

    let class = classify(request, &self.config);
    let general = self.config.general_cache();
    let images = self.config.image_cache();
    let offline_page = request.is_navigation().then_some(&self.offline_key);

    if !request.is_same_origin(&self.config.origin) {
      debug!(url = %request.url, ?class, "cross-origin, stale-while-revalidate");
      let target = if class == RequestClass::Image {
        images.as_str()
      } else {
        general.as_str()
      };
      let served = self
        .layer
        .stale_while_revalidate(request, &[general.as_str(), images.as_str()], target, offline_page)
        .await?;
      return Ok(Outcome::Respond(served));
    }

    let served = match class {
      RequestClass::Image => self.layer.cache_first(request, &images).await?,
      RequestClass::Dynamic => self.layer.network_first(request, &general, None).await?,
      RequestClass::Other if request.is_navigation() => {
        self
          .layer
          .network_first(request, &general, offline_page)
          .await?
      }
      RequestClass::Other => {
        debug!(url = %request.url, "same-origin subresource, passing through");
        return Ok(Outcome::Passthrough);
      }
    };
    Ok(Outcome::Respond(served))
  }

  /// Send a request the controller declined straight to the network.
  pub async fn passthrough(&self, request: &Request) -> Result<Response> {
    self.layer.fetcher().fetch(request).await
  }

  /// Wait for background refreshes to finish.
  pub async fn settle(&self) {
    self.layer.settle().await;
  }
}
