//! Read-path fetch controller.
//!
//! A [`ResourceFetcher`] hands out [`FetchHandle`]s for resource URLs.
//! Each handle owns its own `{data, error, loading}` view while the cache,
//! in-flight locks, call throttling, and handle ref-counts live on the
//! shared [`ResourceCacheContext`]: across every handle of one context, a
//! given URL has at most one request in flight, calls are spaced out, and
//! fresh cache entries are served without network I/O. Failed refreshes
//! keep serving the previous data (stale-while-error).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::{error, warn};
use url::Url;

use super::context::ResourceCacheContext;

pub const INVALID_URL_ERROR: &str = "URL invalide";
pub const TIMEOUT_ERROR: &str = "La requête a pris trop de temps";
pub const CONNECTION_ERROR: &str =
  "Problème de connexion au serveur. Veuillez vérifier votre connexion internet.";
pub const UNAUTHENTICATED_ERROR: &str =
  "Vous devez être connecté pour accéder à cette ressource";
pub const STALE_DATA_ERROR: &str =
  "Erreur de rafraîchissement. Données potentiellement obsolètes.";
pub const GENERIC_ERROR: &str = "Une erreur est survenue";

/// Cache behavior for a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
  /// Serve a fresh cache entry when one exists.
  #[default]
  Default,
  /// Always go to the network (still fills the cache on success).
  NoStore,
}

/// Options for a fetch subscription.
#[derive(Debug, Clone)]
pub struct FetchOptions {
  pub method: Method,
  pub body: Option<Value>,
  pub headers: Vec<(String, String)>,
  pub cache_mode: CacheMode,
  /// Extra attempts after the first failed one.
  pub retries: u32,
  /// Base delay between retries; grows linearly with the attempt number.
  pub retry_delay: Duration,
  /// When set, one forced refresh is scheduled this long after each settle.
  pub refresh_interval: Option<Duration>,
  pub timeout: Duration,
}

impl Default for FetchOptions {
  fn default() -> Self {
    Self {
      method: Method::GET,
      body: None,
      headers: Vec::new(),
      cache_mode: CacheMode::Default,
      retries: 1,
      retry_delay: Duration::from_secs(2),
      refresh_interval: None,
      timeout: Duration::from_secs(15),
    }
  }
}

/// Point-in-time view of a subscription.
#[derive(Debug, Clone, Default)]
pub struct FetchSnapshot {
  pub data: Option<Value>,
  pub error: Option<String>,
  pub loading: bool,
}

#[derive(Debug, Default)]
pub(crate) struct FetchState {
  pub(crate) data: Option<Value>,
  pub(crate) error: Option<String>,
  pub(crate) loading: bool,
}

impl FetchState {
  pub(crate) fn snapshot(&self) -> FetchSnapshot {
    FetchSnapshot {
      data: self.data.clone(),
      error: self.error.clone(),
      loading: self.loading,
    }
  }
}

/// Issues reads through a shared [`ResourceCacheContext`].
#[derive(Clone)]
pub struct ResourceFetcher {
  context: Arc<ResourceCacheContext>,
  http: Client,
}

impl ResourceFetcher {
  pub fn new(context: Arc<ResourceCacheContext>) -> Self {
    Self {
      context,
      http: Client::new(),
    }
  }

  /// Use a preconfigured HTTP client (default headers, proxies, ...).
  pub fn with_client(context: Arc<ResourceCacheContext>, http: Client) -> Self {
    Self { context, http }
  }

  pub fn context(&self) -> &Arc<ResourceCacheContext> {
    &self.context
  }

  pub(crate) fn http(&self) -> &Client {
    &self.http
  }

  /// Subscribe to a resource URL.
  ///
  /// The first fetch runs after the context's initial delay. An empty or
  /// unparsable URL yields a terminal handle (`error = "URL invalide"`,
  /// `loading = false`) with no table side effects and no network call.
  pub fn subscribe(&self, url: &str, options: FetchOptions) -> FetchHandle {
    if url.is_empty() || Url::parse(url).is_err() {
      return FetchHandle {
        job: None,
        state: Arc::new(Mutex::new(FetchState {
          data: None,
          error: Some(INVALID_URL_ERROR.to_string()),
          loading: false,
        })),
      };
    }

    let job = FetchJob {
      url: url.to_string(),
      options,
      context: Arc::clone(&self.context),
      http: self.http.clone(),
      state: Arc::new(Mutex::new(FetchState {
        data: None,
        error: None,
        loading: true,
      })),
      has_called: Arc::new(AtomicBool::new(false)),
      initial_load: Arc::new(AtomicBool::new(true)),
      mounted: Arc::new(AtomicBool::new(true)),
      refresh_gen: Arc::new(AtomicU64::new(0)),
    };

    if let Err(e) = self.context.retain(url) {
      error!(url, "failed to register fetch handle: {}", e);
    }

    // First fetch after the initial delay; initial calls skip the throttle
    // but do consult the cache
    let first = job.clone();
    tokio::spawn(async move {
      tokio::time::sleep(first.context.initial_delay()).await;
      if first.mounted.load(Ordering::SeqCst) && !first.has_called.load(Ordering::SeqCst) {
        first.fetch_data(false).await;
      }
    });

    FetchHandle {
      state: Arc::clone(&job.state),
      job: Some(job),
    }
  }
}

/// A live subscription to one resource URL.
///
/// Dropping the handle cancels its scheduled refresh, deregisters it from
/// the shared ref-count, and force-releases the URL lock when it was the
/// last handle.
pub struct FetchHandle {
  job: Option<FetchJob>,
  state: Arc<Mutex<FetchState>>,
}

impl FetchHandle {
  /// Current `{data, error, loading}` view.
  pub fn state(&self) -> FetchSnapshot {
    self
      .state
      .lock()
      .map(|state| state.snapshot())
      .unwrap_or_default()
  }

  /// Force a fetch, bypassing the freshness window and the call throttle
  /// (the in-flight lock still applies). Resolves once the attempt settles.
  pub async fn refetch(&self) {
    if let Some(job) = &self.job {
      job.fetch_data(true).await;
    }
  }

  /// Cancel the scheduled auto-refresh, if any. Safe to call repeatedly.
  pub fn stop_auto_refresh(&self) {
    if let Some(job) = &self.job {
      job.refresh_gen.fetch_add(1, Ordering::SeqCst);
    }
  }

  pub fn url(&self) -> Option<&str> {
    self.job.as_ref().map(|job| job.url.as_str())
  }
}

impl Drop for FetchHandle {
  fn drop(&mut self) {
    if let Some(job) = &self.job {
      job.mounted.store(false, Ordering::SeqCst);
      job.refresh_gen.fetch_add(1, Ordering::SeqCst);
      if let Err(e) = job.context.release_handle(&job.url) {
        error!(url = %job.url, "failed to release fetch handle: {}", e);
      }
    }
  }
}

enum AttemptError {
  /// Worth another try: transport failure or 5xx with attempts left
  Retryable(String),
  /// Surfaced as-is: timeout, 401, 4xx, or 5xx on the last attempt
  Fatal(String),
}

/// The worker side of a handle; cheap to clone into spawned tasks.
#[derive(Clone)]
struct FetchJob {
  url: String,
  options: FetchOptions,
  context: Arc<ResourceCacheContext>,
  http: Client,
  state: Arc<Mutex<FetchState>>,
  /// This handle already attempted a fetch (first mount runs only once)
  has_called: Arc<AtomicBool>,
  /// Cleared after the first success; initial calls skip the throttle
  initial_load: Arc<AtomicBool>,
  mounted: Arc<AtomicBool>,
  /// Bumped to supersede or cancel the scheduled refresh
  refresh_gen: Arc<AtomicU64>,
}

impl FetchJob {
  fn update_state(&self, apply: impl FnOnce(&mut FetchState)) {
    if let Ok(mut state) = self.state.lock() {
      apply(&mut state);
    }
  }

  async fn fetch_data(&self, force: bool) {
    if self.has_called.load(Ordering::SeqCst) && !force {
      return;
    }

    // Another handle's request will fill the cache
    if self.context.is_locked(&self.url).unwrap_or(true) {
      return;
    }

    if !force
      && !self.initial_load.load(Ordering::SeqCst)
      && self.context.throttled(&self.url).unwrap_or(false)
    {
      return;
    }

    // Two handles can pass the check above together; the acquisition
    // itself is atomic and the loser backs off
    match self.context.try_acquire(&self.url) {
      Ok(true) => {}
      Ok(false) => return,
      Err(e) => {
        error!(url = %self.url, "failed to lock resource: {}", e);
        return;
      }
    }
    let _ = self.context.stamp_call(&self.url);
    self.has_called.store(true, Ordering::SeqCst);

    if !force && self.options.cache_mode == CacheMode::Default {
      if let Ok(Some(cached)) = self.context.fresh(&self.url) {
        if self.mounted.load(Ordering::SeqCst) {
          self.update_state(|state| {
            state.data = Some(cached);
            state.loading = false;
          });
        }
        let _ = self.context.unlock(&self.url);
        return;
      }
    }

    // Keep showing existing data during a refresh instead of a spinner
    self.update_state(|state| {
      if state.data.is_none() {
        state.loading = true;
      }
      state.error = None;
    });

    let max_retries = self.options.retries;
    let mut retry_count = 0u32;

    let outcome = loop {
      match self.attempt(retry_count, max_retries).await {
        Ok(value) => break Ok(value),
        Err(AttemptError::Fatal(message)) => break Err(message),
        Err(AttemptError::Retryable(message)) => {
          if retry_count < max_retries {
            if retry_count == 0 {
              warn!(url = %self.url, "fetch attempt failed, retrying");
            }
            tokio::time::sleep(self.options.retry_delay * (retry_count + 1)).await;
            retry_count += 1;
          } else {
            break Err(message);
          }
        }
      }
    };

    match outcome {
      Ok(value) => {
        let _ = self.context.insert(&self.url, value.clone());
        if self.mounted.load(Ordering::SeqCst) {
          self.update_state(|state| {
            state.data = Some(value);
            state.error = None;
          });
        }
        self.initial_load.store(false, Ordering::SeqCst);
      }
      Err(message) => {
        error!(url = %self.url, "fetch failed: {}", message);
        if self.mounted.load(Ordering::SeqCst) {
          self.update_state(|state| {
            state.error = Some(if state.data.is_some() {
              // Keep the stale data on screen, just flag it
              STALE_DATA_ERROR.to_string()
            } else {
              message
            });
          });
        }
      }
    }

    // Free the lock only when this is the last interested handle; unmount
    // of the final handle recovers it otherwise
    if self.context.consumer_count(&self.url).unwrap_or(0) <= 1 {
      let _ = self.context.unlock(&self.url);
    }

    if self.mounted.load(Ordering::SeqCst) {
      self.update_state(|state| state.loading = false);
      self.schedule_refresh();
    }
  }

  async fn attempt(&self, retry_count: u32, max_retries: u32) -> Result<Value, AttemptError> {
    let mut request = self
      .http
      .request(self.options.method.clone(), &self.url)
      .timeout(self.options.timeout)
      .header(CONTENT_TYPE, "application/json");

    for (name, value) in &self.options.headers {
      request = request.header(name, value);
    }

    if let Some(body) = &self.options.body {
      if self.options.method != Method::GET {
        request = request.json(body);
      }
    }

    let response = match request.send().await {
      Ok(response) => response,
      Err(e) if e.is_timeout() => {
        return Err(AttemptError::Fatal(TIMEOUT_ERROR.to_string()));
      }
      Err(_) => {
        return Err(AttemptError::Retryable(CONNECTION_ERROR.to_string()));
      }
    };

    let status = response.status();
    if !status.is_success() {
      if status.is_server_error() && retry_count < max_retries {
        return Err(AttemptError::Retryable(format!(
          "Erreur serveur {}",
          status.as_u16()
        )));
      }

      if status == StatusCode::UNAUTHORIZED {
        return Err(AttemptError::Fatal(UNAUTHENTICATED_ERROR.to_string()));
      }

      let message = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| {
          body
            .get("error")
            .and_then(Value::as_str)
            .map(String::from)
        })
        .unwrap_or_else(|| {
          format!(
            "Erreur {}: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("erreur inconnue")
          )
        });
      return Err(AttemptError::Fatal(message));
    }

    match response.json::<Value>().await {
      Ok(value) => Ok(value),
      Err(e) if e.is_timeout() => Err(AttemptError::Fatal(TIMEOUT_ERROR.to_string())),
      Err(_) => Err(AttemptError::Retryable(GENERIC_ERROR.to_string())),
    }
  }

  /// Schedule exactly one forced follow-up fetch, superseding any pending
  /// one. `stop_auto_refresh` and handle drop bump the generation so the
  /// sleeping task wakes up to nothing.
  fn schedule_refresh(&self) {
    let Some(interval) = self.options.refresh_interval else {
      return;
    };

    let generation = self.refresh_gen.fetch_add(1, Ordering::SeqCst) + 1;
    let job = self.clone();
    tokio::spawn(async move {
      tokio::time::sleep(interval).await;
      if job.mounted.load(Ordering::SeqCst)
        && job.refresh_gen.load(Ordering::SeqCst) == generation
      {
        job.fetch_boxed(true).await;
      }
    });
  }

  /// Type-erased recursion point for the scheduled refresh.
  fn fetch_boxed(&self, force: bool) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let job = self.clone();
    Box::pin(async move { job.fetch_data(force).await })
  }
}
