//! Write-path mutation controller.
//!
//! Unlike the read path, mutations are never de-duplicated: every
//! [`Mutation::mutate`] call issues its own request. A successful mutation
//! against a ticket URL invalidates the cached ticket collection so the
//! next read revalidates.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::{error, warn};

use super::context::ResourceCacheContext;
use super::controller::{
  FetchSnapshot, FetchState, ResourceFetcher, CONNECTION_ERROR, GENERIC_ERROR, TIMEOUT_ERROR,
};

const MUTATION_TIMEOUT: Duration = Duration::from_secs(10);
const MUTATION_RETRY_DELAY: Duration = Duration::from_secs(1);
const MUTATION_MAX_RETRIES: u32 = 1;

/// Path segment whose presence in a mutated URL invalidates the cached
/// ticket collection.
const TICKETS_SEGMENT: &str = "/api/tickets";

/// A reusable write operation against one resource URL.
pub struct Mutation {
  url: String,
  method: Method,
  context: Arc<ResourceCacheContext>,
  http: Client,
  state: Arc<Mutex<FetchState>>,
}

impl ResourceFetcher {
  /// Build a mutation sharing this fetcher's HTTP client and cache context.
  pub fn mutation(&self, url: &str, method: Method) -> Mutation {
    Mutation {
      url: url.to_string(),
      method,
      context: Arc::clone(self.context()),
      http: self.http().clone(),
      state: Arc::new(Mutex::new(FetchState::default())),
    }
  }
}

impl Mutation {
  /// Current `{data, error, loading}` view of the last call.
  pub fn state(&self) -> FetchSnapshot {
    self
      .state
      .lock()
      .map(|state| state.snapshot())
      .unwrap_or_default()
  }

  /// Issue the mutation and return the parsed response body.
  ///
  /// One retry after a fixed delay on a 5xx; timeouts and other non-2xx
  /// statuses surface immediately with the server's `{error}` message when
  /// it provides one.
  pub async fn mutate(&self, body: Option<Value>) -> Result<Value> {
    self.update_state(|state| {
      state.loading = true;
      state.error = None;
    });

    let mut retry_count = 0u32;
    let outcome = loop {
      let mut request = self
        .http
        .request(self.method.clone(), &self.url)
        .timeout(MUTATION_TIMEOUT)
        .header(CONTENT_TYPE, "application/json");
      if let Some(body) = &body {
        request = request.json(body);
      }

      let response = match request.send().await {
        Ok(response) => response,
        Err(e) if e.is_timeout() => break Err(TIMEOUT_ERROR.to_string()),
        Err(_) => {
          if retry_count < MUTATION_MAX_RETRIES {
            warn!(url = %self.url, "mutation attempt failed, retrying");
            retry_count += 1;
            tokio::time::sleep(MUTATION_RETRY_DELAY).await;
            continue;
          }
          break Err(CONNECTION_ERROR.to_string());
        }
      };

      let status = response.status();
      if status.is_server_error() && retry_count < MUTATION_MAX_RETRIES {
        retry_count += 1;
        tokio::time::sleep(MUTATION_RETRY_DELAY).await;
        continue;
      }

      if !status.is_success() {
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
        break Err(message);
      }

      match response.json::<Value>().await {
        Ok(value) => break Ok(value),
        Err(_) => break Err(GENERIC_ERROR.to_string()),
      }
    };

    match outcome {
      Ok(value) => {
        self.update_state(|state| {
          state.data = Some(value.clone());
          state.loading = false;
        });
        self.invalidate_related();
        Ok(value)
      }
      Err(message) => {
        error!(url = %self.url, "mutation failed: {}", message);
        self.update_state(|state| {
          state.error = Some(message.clone());
          state.loading = false;
        });
        Err(eyre!(message))
      }
    }
  }

  /// A write to any ticket URL stales the cached collection.
  fn invalidate_related(&self) {
    if let Some(position) = self.url.find(TICKETS_SEGMENT) {
      let collection = &self.url[..position + TICKETS_SEGMENT.len()];
      if let Err(e) = self.context.invalidate(collection) {
        error!(url = %self.url, "failed to invalidate ticket cache: {}", e);
      }
    }
  }

  fn update_state(&self, apply: impl FnOnce(&mut FetchState)) {
    if let Ok(mut state) = self.state.lock() {
      apply(&mut state);
    }
  }
}
