//! Client-side resource fetching: cache, locks, throttling, retries.
//!
//! This module provides the data plumbing UI layers sit on:
//! - one shared [`ResourceCacheContext`] per application root,
//! - [`ResourceFetcher`]/[`FetchHandle`] for reads (de-duplicated, cached,
//!   retried, stale-while-error),
//! - [`Mutation`] for writes (single-shot, invalidates related cache
//!   entries).

mod context;
mod controller;
mod mutation;

pub use context::{ResourceCacheContext, CACHE_FRESHNESS, INITIAL_DELAY, MIN_CALL_INTERVAL};
pub use controller::{
  CacheMode, FetchHandle, FetchOptions, FetchSnapshot, ResourceFetcher, CONNECTION_ERROR,
  GENERIC_ERROR, INVALID_URL_ERROR, STALE_DATA_ERROR, TIMEOUT_ERROR, UNAUTHENTICATED_ERROR,
};
pub use mutation::Mutation;
