//! Shared client-side cache, lock, throttle, and ref-count tables.
//!
//! One context is created per application root and handed to every
//! [`ResourceFetcher`](super::ResourceFetcher); keeping the tables on an
//! explicit object (instead of process globals) makes the controller
//! testable and lets tests compress the timing windows.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long a cached response is served without revalidation.
pub const CACHE_FRESHNESS: Duration = Duration::from_secs(60);

/// Minimum spacing between non-forced calls to the same URL.
pub const MIN_CALL_INTERVAL: Duration = Duration::from_secs(10);

/// Delay before a freshly subscribed handle issues its first call,
/// absorbing remount storms during navigation.
pub const INITIAL_DELAY: Duration = Duration::from_secs(1);

/// A cached response for one resource URL.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub data: Value,
  pub fetched_at: Instant,
}

/// Per-URL state shared by every fetch handle of one application root.
pub struct ResourceCacheContext {
  entries: Mutex<HashMap<String, CacheEntry>>,
  locks: Mutex<HashMap<String, bool>>,
  last_call: Mutex<HashMap<String, Instant>>,
  ref_counts: Mutex<HashMap<String, usize>>,
  freshness_window: Duration,
  min_call_interval: Duration,
  initial_delay: Duration,
}

impl Default for ResourceCacheContext {
  fn default() -> Self {
    Self::new()
  }
}

impl ResourceCacheContext {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      locks: Mutex::new(HashMap::new()),
      last_call: Mutex::new(HashMap::new()),
      ref_counts: Mutex::new(HashMap::new()),
      freshness_window: CACHE_FRESHNESS,
      min_call_interval: MIN_CALL_INTERVAL,
      initial_delay: INITIAL_DELAY,
    }
  }

  /// Override the timing windows (freshness, call spacing, initial delay).
  pub fn with_timings(
    mut self,
    freshness_window: Duration,
    min_call_interval: Duration,
    initial_delay: Duration,
  ) -> Self {
    self.freshness_window = freshness_window;
    self.min_call_interval = min_call_interval;
    self.initial_delay = initial_delay;
    self
  }

  pub fn initial_delay(&self) -> Duration {
    self.initial_delay
  }

  /// Whether a request for this URL is currently in flight.
  pub fn is_locked(&self, url: &str) -> Result<bool> {
    let locks = self
      .locks
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(locks.get(url).copied().unwrap_or(false))
  }

  /// Mark a request for this URL as in flight.
  pub fn lock(&self, url: &str) -> Result<()> {
    let mut locks = self
      .locks
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    locks.insert(url.to_string(), true);
    Ok(())
  }

  /// Atomically take the in-flight lock; `Ok(false)` when another request
  /// already holds it.
  pub fn try_acquire(&self, url: &str) -> Result<bool> {
    let mut locks = self
      .locks
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let slot = locks.entry(url.to_string()).or_insert(false);
    if *slot {
      Ok(false)
    } else {
      *slot = true;
      Ok(true)
    }
  }

  pub fn unlock(&self, url: &str) -> Result<()> {
    let mut locks = self
      .locks
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    locks.insert(url.to_string(), false);
    Ok(())
  }

  /// Record an attempted call for throttling purposes.
  pub fn stamp_call(&self, url: &str) -> Result<()> {
    let mut last_call = self
      .last_call
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    last_call.insert(url.to_string(), Instant::now());
    Ok(())
  }

  /// Whether the last call to this URL was too recent for another one.
  pub fn throttled(&self, url: &str) -> Result<bool> {
    let last_call = self
      .last_call
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      last_call
        .get(url)
        .map(|at| at.elapsed() < self.min_call_interval)
        .unwrap_or(false),
    )
  }

  /// Return the cached value for this URL if it is still fresh.
  pub fn fresh(&self, url: &str) -> Result<Option<Value>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(url).and_then(|entry| {
      if entry.fetched_at.elapsed() < self.freshness_window {
        Some(entry.data.clone())
      } else {
        None
      }
    }))
  }

  /// Store (or overwrite) the cached value for this URL.
  pub fn insert(&self, url: &str, data: Value) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(
      url.to_string(),
      CacheEntry {
        data,
        fetched_at: Instant::now(),
      },
    );
    Ok(())
  }

  /// Delete the cached value so the next read revalidates.
  pub fn invalidate(&self, url: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.remove(url);
    Ok(())
  }

  /// Register a live handle for this URL.
  pub fn retain(&self, url: &str) -> Result<()> {
    let mut ref_counts = self
      .ref_counts
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *ref_counts.entry(url.to_string()).or_insert(0) += 1;
    Ok(())
  }

  /// Drop a handle for this URL. When the last one goes away the lock is
  /// force-released, recovering from a handle that went away mid-request.
  pub fn release_handle(&self, url: &str) -> Result<()> {
    let remaining = {
      let mut ref_counts = self
        .ref_counts
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      let count = ref_counts.entry(url.to_string()).or_insert(0);
      if *count > 0 {
        *count -= 1;
      }
      *count
    };

    if remaining == 0 {
      self.unlock(url)?;
    }
    Ok(())
  }

  /// Number of live handles for this URL.
  pub fn consumer_count(&self, url: &str) -> Result<usize> {
    let ref_counts = self
      .ref_counts
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(ref_counts.get(url).copied().unwrap_or(0))
  }
}
