//! End-to-end tests: the real router on a local socket, driven by the
//! client-side fetch/mutation controllers and the typed client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::oneshot;

use appshade::api::types::{
  Message, NewMessage, NewTicket, Priority, Role, Ticket, TicketStatus, UserProfile,
};
use appshade::api::ApiClient;
use appshade::config::ClientConfig;
use appshade::fetch::{
  FetchHandle, FetchOptions, FetchSnapshot, ResourceCacheContext, ResourceFetcher,
  INVALID_URL_ERROR, STALE_DATA_ERROR, UNAUTHENTICATED_ERROR,
};
use appshade::server::auth::UserCache;
use appshade::server::fallback::{FallbackMap, FallbackStore};
use appshade::server::store::TicketStore;
use appshade::server::{self, AppState, DEGRADED_HEADER, DEMO_MESSAGE_HEADER};
use chrono::Utc;

// ============================================================================
// Harness
// ============================================================================

struct TestApp {
  addr: SocketAddr,
  state: Arc<AppState>,
  shutdown: Option<oneshot::Sender<()>>,
  _dir: tempfile::TempDir,
}

impl TestApp {
  async fn spawn(dev_mode: bool) -> Self {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = Arc::new(AppState {
      store: TicketStore::open_in_memory().expect("store"),
      fallback: FallbackStore::new(dir.path().join("temp-tickets.json")),
      users: UserCache::new(),
      dev_mode,
      uploads_dir: dir.path().join("uploads"),
    });

    let (addr, shutdown) = serve_router(server::router(Arc::clone(&state))).await;

    Self {
      addr,
      state,
      shutdown: Some(shutdown),
      _dir: dir,
    }
  }

  fn url(&self, path: &str) -> String {
    format!("http://{}{}", self.addr, path)
  }

  fn stop(&mut self) {
    if let Some(shutdown) = self.shutdown.take() {
      let _ = shutdown.send(());
    }
  }

  fn seed_user(&self, id: &str, role: Role) {
    self
      .state
      .store
      .insert_user(&UserProfile {
        id: id.to_string(),
        email: format!("{}@example.com", id),
        first_name: None,
        last_name: None,
        role,
      })
      .expect("seed user");
  }

  fn seed_ticket(&self, owner: &str, title: &str) -> Ticket {
    self
      .state
      .store
      .create_ticket(
        owner,
        &NewTicket {
          title: title.to_string(),
          description: "Description".to_string(),
          priority: None,
          category: None,
        },
      )
      .expect("seed ticket")
  }
}

async fn serve_router(app: Router) -> (SocketAddr, oneshot::Sender<()>) {
  let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
    .await
    .expect("bind");
  let addr = listener.local_addr().expect("local addr");

  let (tx, rx) = oneshot::channel::<()>();
  tokio::spawn(async move {
    let _ = axum::serve(listener, app)
      .with_graceful_shutdown(async {
        let _ = rx.await;
      })
      .await;
  });

  (addr, tx)
}

/// A router that counts requests to /api/tickets and answers slowly enough
/// for overlap windows to be observable.
async fn counting_server() -> (SocketAddr, Arc<AtomicU32>, oneshot::Sender<()>) {
  let counter = Arc::new(AtomicU32::new(0));
  let handler_counter = Arc::clone(&counter);

  let app = Router::new().route(
    "/api/tickets",
    get(move || {
      let counter = Arc::clone(&handler_counter);
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Json(json!([{ "id": "t1" }]))
      }
    }),
  );

  let (addr, shutdown) = serve_router(app).await;
  (addr, counter, shutdown)
}

/// Context with compressed timing windows so tests settle quickly.
fn fast_context() -> Arc<ResourceCacheContext> {
  Arc::new(ResourceCacheContext::new().with_timings(
    Duration::from_secs(60),
    Duration::from_secs(10),
    Duration::from_millis(20),
  ))
}

fn client_for(app: &TestApp, user: Option<&str>) -> ApiClient {
  let config = ClientConfig {
    base_url: format!("http://{}", app.addr),
    user: user.map(String::from),
  };
  ApiClient::with_context(&config, fast_context()).expect("client")
}

/// Poll a handle until it settles (data or error) or give up.
async fn settled(handle: &FetchHandle) -> FetchSnapshot {
  for _ in 0..150 {
    let state = handle.state();
    if state.data.is_some() || state.error.is_some() {
      return state;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  handle.state()
}

fn temp_ticket(id: &str, owner: &str) -> Ticket {
  let now = Utc::now();
  Ticket {
    id: id.to_string(),
    title: "Ticket temporaire".to_string(),
    description: "Créé hors ligne".to_string(),
    status: TicketStatus::Open,
    priority: Priority::Medium,
    category: "other".to_string(),
    user_id: owner.to_string(),
    created_at: now,
    updated_at: now,
    messages: Vec::new(),
    user: None,
  }
}

// ============================================================================
// Fetch controller
// ============================================================================

#[tokio::test]
async fn test_concurrent_handles_share_one_request() {
  let (addr, counter, _shutdown) = counting_server().await;
  let fetcher = ResourceFetcher::new(fast_context());
  let url = format!("http://{}/api/tickets", addr);

  let a = fetcher.subscribe(&url, FetchOptions::default());
  let b = fetcher.subscribe(&url, FetchOptions::default());

  tokio::time::sleep(Duration::from_millis(400)).await;

  // Both handles raced for the same URL; only one request went out
  assert_eq!(counter.load(Ordering::SeqCst), 1);
  assert!(a.state().data.is_some() || b.state().data.is_some());
}

#[tokio::test]
async fn test_fresh_cache_served_without_network() {
  let (addr, counter, _shutdown) = counting_server().await;
  let fetcher = ResourceFetcher::new(fast_context());
  let url = format!("http://{}/api/tickets", addr);

  let first = fetcher.subscribe(&url, FetchOptions::default());
  let state = settled(&first).await;
  assert!(state.data.is_some());
  drop(first);

  // A later handle inside the freshness window reads the cache
  let second = fetcher.subscribe(&url, FetchOptions::default());
  let state = settled(&second).await;
  assert!(state.data.is_some());
  assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_refetch_bypasses_cache_and_throttle() {
  let (addr, counter, _shutdown) = counting_server().await;
  let fetcher = ResourceFetcher::new(fast_context());
  let url = format!("http://{}/api/tickets", addr);

  let handle = fetcher.subscribe(&url, FetchOptions::default());
  let state = settled(&handle).await;
  assert!(state.data.is_some());
  assert_eq!(counter.load(Ordering::SeqCst), 1);

  // Cache is fresh (60s window) and the 10s throttle has not elapsed;
  // a forced refetch must still hit the network
  handle.refetch().await;
  assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_stale_data_kept_after_failed_refresh() {
  let (addr, _counter, shutdown) = counting_server().await;
  let fetcher = ResourceFetcher::new(fast_context());
  let url = format!("http://{}/api/tickets", addr);

  let handle = fetcher.subscribe(
    &url,
    FetchOptions {
      retries: 0,
      retry_delay: Duration::from_millis(10),
      ..FetchOptions::default()
    },
  );
  let state = settled(&handle).await;
  let data = state.data.expect("first fetch succeeds");

  // Kill the server, then force a refresh
  let _ = shutdown.send(());
  tokio::time::sleep(Duration::from_millis(50)).await;
  handle.refetch().await;

  let state = handle.state();
  assert_eq!(state.data, Some(data));
  assert_eq!(state.error.as_deref(), Some(STALE_DATA_ERROR));
  assert!(!state.loading);
}

#[tokio::test]
async fn test_stop_auto_refresh_cancels_scheduled_fetch() {
  let (addr, counter, _shutdown) = counting_server().await;
  let fetcher = ResourceFetcher::new(fast_context());
  let url = format!("http://{}/api/tickets", addr);

  let handle = fetcher.subscribe(
    &url,
    FetchOptions {
      refresh_interval: Some(Duration::from_millis(150)),
      ..FetchOptions::default()
    },
  );
  let state = settled(&handle).await;
  assert!(state.data.is_some());
  // Let the settle finish arming the refresh before cancelling it
  tokio::time::sleep(Duration::from_millis(50)).await;

  // Twice: cancelling is idempotent
  handle.stop_auto_refresh();
  handle.stop_auto_refresh();

  tokio::time::sleep(Duration::from_millis(400)).await;
  assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_empty_url_is_terminal_with_no_network() {
  let (_, counter, _shutdown) = counting_server().await;
  let fetcher = ResourceFetcher::new(fast_context());

  let handle = fetcher.subscribe("", FetchOptions::default());
  let state = handle.state();

  assert!(state.data.is_none());
  assert_eq!(state.error.as_deref(), Some(INVALID_URL_ERROR));
  assert!(!state.loading);

  tokio::time::sleep(Duration::from_millis(100)).await;
  assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unauthenticated_read_surfaces_sign_in_error() {
  let app = TestApp::spawn(false).await;
  // No session identity configured
  let client = client_for(&app, None);

  let handle = client.tickets();
  let state = settled(&handle).await;

  assert!(state.data.is_none());
  assert_eq!(state.error.as_deref(), Some(UNAUTHENTICATED_ERROR));
}

#[tokio::test]
async fn test_mutation_invalidates_ticket_collection_cache() {
  let app = TestApp::spawn(false).await;
  app.seed_user("alice", Role::Client);
  let client = client_for(&app, Some("alice"));
  let collection_url = app.url("/api/tickets");

  let handle = client.tickets();
  let state = settled(&handle).await;
  assert!(state.data.is_some());
  assert!(client
    .fetcher()
    .context()
    .fresh(&collection_url)
    .unwrap()
    .is_some());

  client
    .create_ticket(&NewTicket {
      title: "Panne".to_string(),
      description: "Rien ne marche".to_string(),
      priority: Some(Priority::High),
      category: None,
    })
    .await
    .expect("create ticket");

  // The collection entry is gone; the next forced read sees the new ticket
  assert!(client
    .fetcher()
    .context()
    .fresh(&collection_url)
    .unwrap()
    .is_none());

  handle.refetch().await;
  let tickets: Vec<Ticket> =
    serde_json::from_value(handle.state().data.expect("refetched")).expect("parse");
  assert_eq!(tickets.len(), 1);
  assert_eq!(tickets[0].title, "Panne");
}

// ============================================================================
// Fallback path
// ============================================================================

#[tokio::test]
async fn test_temp_ticket_message_round_trip() {
  let app = TestApp::spawn(false).await;
  let mut map = FallbackMap::new();
  map.insert("user-1".to_string(), vec![temp_ticket("temp-abc", "user-1")]);
  app.state.fallback.save(&map).expect("seed fallback");

  let client = client_for(&app, Some("user-1"));
  let posted = client
    .post_message(
      "temp-abc",
      &NewMessage {
        content: "Mon site est cassé".to_string(),
        is_internal: false,
      },
    )
    .await
    .expect("post message");
  assert_eq!(posted.content, "Mon site est cassé");

  let handle = client.messages("temp-abc");
  let state = settled(&handle).await;
  let messages: Vec<Message> =
    serde_json::from_value(state.data.expect("messages")).expect("parse");
  assert_eq!(messages.len(), 1);
  assert_eq!(messages[0].content, "Mon site est cassé");

  // And the record survived to disk
  let stored = app.state.fallback.find_ticket("temp-abc").expect("stored");
  assert_eq!(stored.messages.len(), 1);
  assert_eq!(stored.messages[0].content, "Mon site est cassé");
}

#[tokio::test]
async fn test_demo_ticket_placeholder() {
  let app = TestApp::spawn(false).await;

  let response = reqwest::Client::new()
    .get(app.url("/api/tickets/demo-123"))
    .header("x-user-id", "user-1")
    .send()
    .await
    .expect("request");

  assert_eq!(response.status(), 200);
  let body: serde_json::Value = response.json().await.expect("body");
  assert_eq!(body["title"], "Hello world");
  assert_eq!(body["status"], "open");
  assert_eq!(body["messages"], json!([]));
}

#[tokio::test]
async fn test_unknown_temp_ticket_message_is_flagged() {
  let app = TestApp::spawn(false).await;

  let response = reqwest::Client::new()
    .post(app.url("/api/tickets/temp-nowhere/messages"))
    .header("x-user-id", "user-1")
    .json(&json!({ "content": "Allô ?" }))
    .send()
    .await
    .expect("request");

  assert_eq!(response.status(), 201);
  assert_eq!(
    response
      .headers()
      .get(DEMO_MESSAGE_HEADER)
      .and_then(|value| value.to_str().ok()),
    Some("true")
  );

  // Nothing was persisted
  assert!(app.state.fallback.load().is_empty());
}

#[tokio::test]
async fn test_empty_temp_thread_gets_welcome_message() {
  let app = TestApp::spawn(false).await;
  let mut map = FallbackMap::new();
  map.insert("user-1".to_string(), vec![temp_ticket("temp-q", "user-1")]);
  app.state.fallback.save(&map).expect("seed fallback");

  let response = reqwest::Client::new()
    .get(app.url("/api/tickets/temp-q/messages"))
    .header("x-user-id", "user-1")
    .send()
    .await
    .expect("request");

  assert_eq!(response.status(), 200);
  let messages: Vec<Message> = response.json().await.expect("body");
  assert_eq!(messages.len(), 1);
  assert_eq!(
    messages[0].content,
    "Bienvenue ! Comment puis-je vous aider avec ce ticket ?"
  );
  assert_eq!(messages[0].user.as_ref().expect("author").role, Role::Admin);
}

// ============================================================================
// Persistent path
// ============================================================================

#[tokio::test]
async fn test_patch_forbidden_for_non_owner() {
  let app = TestApp::spawn(false).await;
  app.seed_user("alice", Role::Client);
  app.seed_user("bob", Role::Client);
  let ticket = app.seed_ticket("alice", "Question de facturation");

  let response = reqwest::Client::new()
    .patch(app.url(&format!("/api/tickets/{}", ticket.id)))
    .header("x-user-id", "bob")
    .json(&json!({ "status": "closed" }))
    .send()
    .await
    .expect("request");

  assert_eq!(response.status(), 403);
  let body: serde_json::Value = response.json().await.expect("body");
  assert_eq!(body, json!({ "error": "Non autorisé" }));
}

#[tokio::test]
async fn test_admin_can_patch_other_users_ticket() {
  let app = TestApp::spawn(false).await;
  app.seed_user("alice", Role::Client);
  app.seed_user("root", Role::Admin);
  let ticket = app.seed_ticket("alice", "Incident");

  let client = client_for(&app, Some("root"));
  let updated = client
    .set_status(&ticket.id, TicketStatus::InProgress)
    .await
    .expect("patch");
  assert_eq!(updated.status, TicketStatus::InProgress);
}

#[tokio::test]
async fn test_degraded_get_on_datastore_failure() {
  let app = TestApp::spawn(false).await;
  app.seed_user("alice", Role::Client);
  let ticket = app.seed_ticket("alice", "Incident");

  {
    let conn = app.state.store.conn().lock().expect("conn");
    conn.execute_batch("DROP TABLE tickets").expect("drop");
  }

  let response = reqwest::Client::new()
    .get(app.url(&format!("/api/tickets/{}", ticket.id)))
    .header("x-user-id", "alice")
    .send()
    .await
    .expect("request");

  // The outage is masked behind a synthesized body, but flagged
  assert_eq!(response.status(), 200);
  assert_eq!(
    response
      .headers()
      .get(DEGRADED_HEADER)
      .and_then(|value| value.to_str().ok()),
    Some("true")
  );
  let body: serde_json::Value = response.json().await.expect("body");
  assert_eq!(body["title"], "Ticket temporaire");
}

#[tokio::test]
async fn test_patch_propagates_datastore_failure() {
  let app = TestApp::spawn(false).await;
  app.seed_user("alice", Role::Client);
  let ticket = app.seed_ticket("alice", "Incident");

  {
    let conn = app.state.store.conn().lock().expect("conn");
    conn.execute_batch("DROP TABLE tickets").expect("drop");
  }

  let response = reqwest::Client::new()
    .patch(app.url(&format!("/api/tickets/{}", ticket.id)))
    .header("x-user-id", "alice")
    .json(&json!({ "status": "closed" }))
    .send()
    .await
    .expect("request");

  assert_eq!(response.status(), 500);
}

#[tokio::test]
async fn test_message_reopens_closed_ticket() {
  let app = TestApp::spawn(false).await;
  app.seed_user("alice", Role::Client);
  let ticket = app.seed_ticket("alice", "Incident");
  app
    .state
    .store
    .update_status(&ticket.id, TicketStatus::Closed)
    .expect("close");

  let client = client_for(&app, Some("alice"));
  client
    .post_message(
      &ticket.id,
      &NewMessage {
        content: "Toujours cassé".to_string(),
        is_internal: false,
      },
    )
    .await
    .expect("post message");

  let reloaded = app
    .state
    .store
    .get_ticket(&ticket.id)
    .expect("reload")
    .expect("exists");
  assert_eq!(reloaded.status, TicketStatus::Open);
}

#[tokio::test]
async fn test_internal_messages_hidden_from_owner() {
  let app = TestApp::spawn(false).await;
  app.seed_user("alice", Role::Client);
  app.seed_user("root", Role::Admin);
  let ticket = app.seed_ticket("alice", "Incident");

  let admin = client_for(&app, Some("root"));
  admin
    .post_message(
      &ticket.id,
      &NewMessage {
        content: "client is on the legacy plan".to_string(),
        is_internal: true,
      },
    )
    .await
    .expect("internal note");
  admin
    .post_message(
      &ticket.id,
      &NewMessage {
        content: "Nous regardons le problème".to_string(),
        is_internal: false,
      },
    )
    .await
    .expect("reply");

  let owner = client_for(&app, Some("alice"));
  let handle = owner.messages(&ticket.id);
  let state = settled(&handle).await;
  let visible: Vec<Message> =
    serde_json::from_value(state.data.expect("messages")).expect("parse");
  assert_eq!(visible.len(), 1);
  assert_eq!(visible[0].content, "Nous regardons le problème");

  let admin_handle = admin.messages(&ticket.id);
  let state = settled(&admin_handle).await;
  let all: Vec<Message> = serde_json::from_value(state.data.expect("messages")).expect("parse");
  assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn test_delete_ticket_and_thread() {
  let app = TestApp::spawn(false).await;
  app.seed_user("alice", Role::Client);
  let ticket = app.seed_ticket("alice", "Obsolète");
  app
    .state
    .store
    .create_message(&ticket.id, "alice", "ancien message", false)
    .expect("seed message");

  let client = client_for(&app, Some("alice"));
  client.delete_ticket(&ticket.id).await.expect("delete");

  assert!(app
    .state
    .store
    .get_ticket(&ticket.id)
    .expect("query")
    .is_none());
  assert!(app
    .state
    .store
    .list_messages(&ticket.id, true)
    .expect("query")
    .is_empty());
}

#[tokio::test]
async fn test_list_tickets_requires_identity() {
  let app = TestApp::spawn(false).await;

  let response = reqwest::Client::new()
    .get(app.url("/api/tickets"))
    .send()
    .await
    .expect("request");

  assert_eq!(response.status(), 401);
  let body: serde_json::Value = response.json().await.expect("body");
  assert_eq!(body, json!({ "error": "Non authentifié" }));
}

#[tokio::test]
async fn test_dev_mode_substitutes_demo_identity() {
  let mut app = TestApp::spawn(true).await;

  // Item routes accept the anonymous caller in dev mode
  let response = reqwest::Client::new()
    .get(app.url("/api/tickets/demo-1"))
    .send()
    .await
    .expect("request");
  assert_eq!(response.status(), 200);
  let body: serde_json::Value = response.json().await.expect("body");
  assert_eq!(body["userId"], "demo-user");

  app.stop();
}

// ============================================================================
// User sync & attachments
// ============================================================================

#[tokio::test]
async fn test_sync_user_creates_row_and_caches() {
  let app = TestApp::spawn(false).await;
  let http = reqwest::Client::new();

  let response = http
    .post(app.url("/api/sync-user"))
    .header("x-user-id", "charlie")
    .header("x-user-email", "charlie@example.com")
    .header("x-user-role", "admin")
    .send()
    .await
    .expect("request");
  assert_eq!(response.status(), 200);
  let user: UserProfile = response.json().await.expect("body");
  assert_eq!(user.role, Role::Admin);

  assert_eq!(
    app
      .state
      .store
      .user_role("charlie")
      .expect("role")
      .expect("exists"),
    Role::Admin
  );

  // Inside the cooldown window the cached row is served
  let response = http
    .post(app.url("/api/sync-user"))
    .header("x-user-id", "charlie")
    .send()
    .await
    .expect("request");
  assert_eq!(response.status(), 200);
  assert_eq!(
    response
      .headers()
      .get("x-cache-hit")
      .and_then(|value| value.to_str().ok()),
    Some("true")
  );
}

#[tokio::test]
async fn test_attachment_upload_round_trip() {
  use base64::engine::general_purpose::STANDARD as BASE64;
  use base64::Engine;

  let app = TestApp::spawn(false).await;
  app.seed_user("alice", Role::Client);
  let ticket = app.seed_ticket("alice", "Incident");

  let contents = b"fake image bytes";
  let payload = json!({
    "fileName": "capture.png",
    "fileType": "image/png",
    "fileSize": contents.len(),
    "fileData": format!("data:image/png;base64,{}", BASE64.encode(contents)),
  });

  let http = reqwest::Client::new();
  let response = http
    .post(app.url(&format!("/api/tickets/{}/attachments", ticket.id)))
    .header("x-user-id", "alice")
    .json(&payload)
    .send()
    .await
    .expect("request");
  assert_eq!(response.status(), 200);
  let body: serde_json::Value = response.json().await.expect("body");
  let file_url = body["fileUrl"].as_str().expect("fileUrl");
  assert!(file_url.starts_with("/uploads/"));

  // The bytes landed on disk under the uploads directory
  let stored = app
    .state
    .uploads_dir
    .join(file_url.trim_start_matches("/uploads/"));
  assert_eq!(std::fs::read(&stored).expect("read upload"), contents);

  // Listed for the ticket
  let response = http
    .get(app.url(&format!("/api/tickets/{}/attachments", ticket.id)))
    .header("x-user-id", "alice")
    .send()
    .await
    .expect("request");
  let body: serde_json::Value = response.json().await.expect("body");
  assert_eq!(body["attachments"].as_array().expect("array").len(), 1);

  // Delete removes row and file
  let attachment_id = body["attachments"][0]["id"].as_str().expect("id");
  let response = http
    .delete(app.url(&format!("/api/tickets/{}/attachments", ticket.id)))
    .header("x-user-id", "alice")
    .json(&json!({ "attachmentId": attachment_id }))
    .send()
    .await
    .expect("request");
  assert_eq!(response.status(), 200);
  assert!(!stored.exists());
}
