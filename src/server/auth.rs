//! Caller identity and the user sync endpoint.
//!
//! Authentication itself is delegated to the fronting identity proxy, which
//! installs the `x-user-*` claim headers on every request it lets through.
//! Roles have a single authoritative source: the claim is written to the
//! user row by `/api/sync-user`, and every authorization check afterwards
//! reads the row.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{debug, error, info};

use crate::api::types::{Role, UserProfile};

use super::error::ApiError;
use super::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const USER_FIRST_NAME_HEADER: &str = "x-user-first-name";
pub const USER_LAST_NAME_HEADER: &str = "x-user-last-name";

/// Placeholder identity substituted in development mode.
pub const DEMO_USER_ID: &str = "demo-user";

/// Minimum spacing between full syncs of one user.
const SYNC_COOLDOWN: Duration = Duration::from_secs(5);

/// How long a cached user row is trusted.
const USER_CACHE_TTL: Duration = Duration::from_secs(300);

/// Resolved caller identity.
#[derive(Debug, Clone)]
pub struct Identity {
  pub user_id: String,
}

/// Caller identity from the claim headers, or nothing.
pub fn caller(headers: &HeaderMap) -> Option<Identity> {
  headers
    .get(USER_ID_HEADER)
    .and_then(|value| value.to_str().ok())
    .filter(|id| !id.is_empty())
    .map(|id| Identity {
      user_id: id.to_string(),
    })
}

/// Caller identity, substituting the demo identity for unauthenticated
/// callers when development mode is on.
pub fn caller_or_demo(headers: &HeaderMap, dev_mode: bool) -> Option<Identity> {
  caller(headers).or_else(|| {
    if dev_mode {
      debug!("unauthenticated caller, using the demo identity");
      Some(Identity {
        user_id: DEMO_USER_ID.to_string(),
      })
    } else {
      None
    }
  })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
  headers
    .get(name)
    .and_then(|value| value.to_str().ok())
    .filter(|value| !value.is_empty())
    .map(String::from)
}

/// Process-local best-effort maps: recently synced users and a short-lived
/// user cache. Neither is correctness-critical; each server instance keeps
/// its own.
pub struct UserCache {
  users: Mutex<HashMap<String, (UserProfile, Instant)>>,
  recent_syncs: Mutex<HashMap<String, Instant>>,
  user_ttl: Duration,
  sync_cooldown: Duration,
}

impl Default for UserCache {
  fn default() -> Self {
    Self::new()
  }
}

impl UserCache {
  pub fn new() -> Self {
    Self {
      users: Mutex::new(HashMap::new()),
      recent_syncs: Mutex::new(HashMap::new()),
      user_ttl: USER_CACHE_TTL,
      sync_cooldown: SYNC_COOLDOWN,
    }
  }

  /// Override the cache TTL and sync cooldown.
  pub fn with_timings(mut self, user_ttl: Duration, sync_cooldown: Duration) -> Self {
    self.user_ttl = user_ttl;
    self.sync_cooldown = sync_cooldown;
    self
  }

  pub fn cached_user(&self, id: &str) -> Option<UserProfile> {
    let users = self.users.lock().ok()?;
    users.get(id).and_then(|(user, cached_at)| {
      if cached_at.elapsed() < self.user_ttl {
        Some(user.clone())
      } else {
        None
      }
    })
  }

  pub fn store_user(&self, user: UserProfile) {
    if let Ok(mut users) = self.users.lock() {
      users.insert(user.id.clone(), (user, Instant::now()));
    }
  }

  pub fn recently_synced(&self, id: &str) -> bool {
    self
      .recent_syncs
      .lock()
      .ok()
      .and_then(|syncs| syncs.get(id).map(|at| at.elapsed() < self.sync_cooldown))
      .unwrap_or(false)
  }

  pub fn mark_synced(&self, id: &str) {
    if let Ok(mut syncs) = self.recent_syncs.lock() {
      syncs.insert(id.to_string(), Instant::now());
    }
  }
}

/// POST /api/sync-user — upsert the caller's user row from the claim
/// headers. Throttled per user; cached rows are served with `X-Cache-Hit`.
pub async fn sync_user(
  State(state): State<Arc<AppState>>,
  headers: HeaderMap,
) -> Result<Response, ApiError> {
  let identity = caller(&headers).ok_or_else(|| {
    error!("sync: unauthenticated caller");
    ApiError::Unauthorized
  })?;
  let user_id = identity.user_id;

  let claimed_role = header_value(&headers, USER_ROLE_HEADER)
    .as_deref()
    .and_then(Role::parse)
    .unwrap_or(Role::Client);

  if state.users.recently_synced(&user_id) {
    debug!(user = %user_id, "sync skipped, too recent");

    if let Some(user) = state.users.cached_user(&user_id) {
      return Ok(cache_hit_response(user, true));
    }

    // Not cached: read the row without creating one
    let existing = state
      .store
      .get_user(&user_id)
      .map_err(|e| internal_sync_error(&user_id, e))?;
    if let Some(mut user) = existing {
      if user.role != claimed_role {
        state
          .store
          .set_role(&user_id, claimed_role)
          .map_err(|e| internal_sync_error(&user_id, e))?;
        user.role = claimed_role;
        info!(user = %user_id, role = claimed_role.as_str(), "role updated");
      }
      state.users.store_user(user.clone());
      return Ok(cache_hit_response(user, false));
    }
  }

  state.users.mark_synced(&user_id);
  info!(user = %user_id, "syncing user");

  let existing = state
    .store
    .get_user(&user_id)
    .map_err(|e| internal_sync_error(&user_id, e))?;

  let user = match existing {
    Some(mut user) => {
      if user.role != claimed_role {
        state
          .store
          .set_role(&user_id, claimed_role)
          .map_err(|e| internal_sync_error(&user_id, e))?;
        user.role = claimed_role;
        info!(user = %user_id, role = claimed_role.as_str(), "role updated");
      }
      user
    }
    None => {
      let user = UserProfile {
        id: user_id.clone(),
        email: header_value(&headers, USER_EMAIL_HEADER)
          .unwrap_or_else(|| format!("{}@example.com", user_id)),
        first_name: Some(
          header_value(&headers, USER_FIRST_NAME_HEADER)
            .unwrap_or_else(|| "Utilisateur".to_string()),
        ),
        last_name: Some(
          header_value(&headers, USER_LAST_NAME_HEADER)
            .unwrap_or_else(|| "Temporaire".to_string()),
        ),
        role: claimed_role,
      };
      state
        .store
        .insert_user(&user)
        .map_err(|e| internal_sync_error(&user_id, e))?;
      info!(user = %user_id, "user created");
      user
    }
  };

  state.users.store_user(user.clone());
  Ok(Json(user).into_response())
}

fn cache_hit_response(user: UserProfile, hit: bool) -> Response {
  (
    StatusCode::OK,
    [("x-cache-hit", if hit { "true" } else { "false" })],
    Json(user),
  )
    .into_response()
}

fn internal_sync_error(user_id: &str, e: color_eyre::Report) -> ApiError {
  error!(user = %user_id, "sync failed: {}", e);
  ApiError::Internal("Erreur lors de la synchronisation".to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_caller_requires_header() {
    let headers = HeaderMap::new();
    assert!(caller(&headers).is_none());
    assert!(caller_or_demo(&headers, false).is_none());

    let demo = caller_or_demo(&headers, true).unwrap();
    assert_eq!(demo.user_id, DEMO_USER_ID);
  }

  #[test]
  fn test_caller_reads_header() {
    let mut headers = HeaderMap::new();
    headers.insert(USER_ID_HEADER, "alice".parse().unwrap());
    assert_eq!(caller(&headers).unwrap().user_id, "alice");
  }

  #[test]
  fn test_sync_cooldown() {
    let cache = UserCache::new().with_timings(USER_CACHE_TTL, Duration::from_millis(50));

    assert!(!cache.recently_synced("alice"));
    cache.mark_synced("alice");
    assert!(cache.recently_synced("alice"));

    std::thread::sleep(Duration::from_millis(60));
    assert!(!cache.recently_synced("alice"));
  }

  #[test]
  fn test_user_cache_ttl() {
    let cache = UserCache::new().with_timings(Duration::ZERO, SYNC_COOLDOWN);
    cache.store_user(UserProfile {
      id: "alice".to_string(),
      email: "alice@example.com".to_string(),
      first_name: None,
      last_name: None,
      role: Role::Client,
    });

    // Zero TTL: immediately expired
    assert!(cache.cached_user("alice").is_none());
  }
}
