//! HTTP API server: routes, shared state, and the serve loop.

pub mod attachments;
pub mod auth;
pub mod error;
pub mod fallback;
pub mod messages;
pub mod store;
pub mod tickets;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::CONTENT_TYPE;
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use color_eyre::{eyre::eyre, Result};
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
use tokio::signal::unix::{signal, SignalKind};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::ServerConfig;

use auth::UserCache;
use fallback::FallbackStore;
use store::TicketStore;

/// Response header flagging a synthesized body served instead of a
/// datastore error.
pub const DEGRADED_HEADER: &str = "x-degraded";

/// Response header flagging a message that was answered but not persisted.
pub const DEMO_MESSAGE_HEADER: &str = "x-demo-message";

/// State shared by every request handler.
pub struct AppState {
  pub store: TicketStore,
  pub fallback: FallbackStore,
  pub users: UserCache,
  pub dev_mode: bool,
  pub uploads_dir: PathBuf,
}

impl AppState {
  pub fn new(config: &ServerConfig) -> Result<Arc<Self>> {
    let store = TicketStore::open(&config.database)?;

    Ok(Arc::new(Self {
      store,
      fallback: FallbackStore::new(&config.fallback_file),
      users: UserCache::new(),
      dev_mode: config.dev_mode,
      uploads_dir: config.uploads_dir.clone(),
    }))
  }
}

/// Build the API router on the given state.
pub fn router(state: Arc<AppState>) -> Router {
  let cors = CorsLayer::new()
    .allow_methods([
      Method::GET,
      Method::POST,
      Method::PATCH,
      Method::DELETE,
      Method::OPTIONS,
    ])
    .allow_headers([CONTENT_TYPE])
    .max_age(Duration::from_secs(60 * 60));

  Router::new()
    .route(
      "/api/tickets",
      get(tickets::list_tickets).post(tickets::create_ticket),
    )
    .route(
      "/api/tickets/{id}",
      get(tickets::get_ticket)
        .patch(tickets::update_ticket)
        .delete(tickets::delete_ticket),
    )
    .route(
      "/api/tickets/{id}/messages",
      get(messages::list_messages).post(messages::create_message),
    )
    .route(
      "/api/tickets/{id}/attachments",
      get(attachments::list_attachments)
        .post(attachments::upload_attachment)
        .delete(attachments::delete_attachment),
    )
    .route("/api/sync-user", post(auth::sync_user))
    .layer(cors)
    .with_state(state)
}

/// Run the server until SIGINT/SIGTERM.
pub async fn serve(config: &ServerConfig) -> Result<()> {
  info!("Initializing state...");
  let state = AppState::new(config)?;

  let app = router(state);

  let listener = TcpListener::bind(&config.addr)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", config.addr, e))?;
  info!("Server running on {}", config.addr);

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| eyre!("Server error: {}", e))?;

  info!("Server shut down");
  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    if ctrl_c().await.is_ok() {
      info!("Received Ctrl+C, shutting down");
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match signal(SignalKind::terminate()) {
      Ok(mut terminate) => {
        terminate.recv().await;
        info!("Received terminate signal, shutting down");
      }
      Err(e) => tracing::error!("Failed to install signal handler: {}", e),
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {},
    _ = terminate => {},
  }
}
