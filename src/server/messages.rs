//! Ticket thread routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::types::{Message, NewMessage, Role, TicketStatus, UserProfile};
use crate::resource::ResourceRef;

use super::auth::{caller_or_demo, DEMO_USER_ID};
use super::error::ApiError;
use super::tickets::authorize_mutation;
use super::{AppState, DEMO_MESSAGE_HEADER};

/// GET /api/tickets/{id}/messages — the ticket's thread, oldest first.
pub async fn list_messages(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
  headers: HeaderMap,
) -> Result<Response, ApiError> {
  let identity = caller_or_demo(&headers, state.dev_mode).ok_or(ApiError::Unauthorized)?;

  if ResourceRef::classify(&id).is_ephemeral() {
    info!(id = %id, "messages requested for temporary or demo ticket");

    if let Some(ticket) = state.fallback.find_ticket(&id) {
      if !ticket.messages.is_empty() {
        return Ok(Json(ticket.messages).into_response());
      }
    }

    return Ok(Json(vec![welcome_message(&id)]).into_response());
  }

  let ticket = state
    .store
    .get_ticket(&id)
    .map_err(read_error)?
    .ok_or_else(|| ApiError::NotFound("Ticket non trouvé".to_string()))?;

  let role = state.store.user_role(&identity.user_id).map_err(read_error)?;
  let is_admin = role == Some(Role::Admin);
  let is_owner = ticket.user_id == identity.user_id;

  if !is_admin && !is_owner {
    return Err(ApiError::Forbidden(
      "Accès non autorisé à ce ticket".to_string(),
    ));
  }

  let messages = state
    .store
    .list_messages(&id, is_admin)
    .map_err(read_error)?;

  Ok(Json(messages).into_response())
}

fn read_error(e: color_eyre::Report) -> ApiError {
  error!("failed to read messages: {}", e);
  ApiError::Internal("Erreur lors de la récupération des messages".to_string())
}

/// POST /api/tickets/{id}/messages — append a message to the thread.
pub async fn create_message(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
  headers: HeaderMap,
  Json(payload): Json<NewMessage>,
) -> Result<Response, ApiError> {
  let identity = caller_or_demo(&headers, state.dev_mode).ok_or(ApiError::Unauthorized)?;

  if payload.content.trim().is_empty() {
    return Err(ApiError::BadRequest(
      "Le contenu du message est obligatoire".to_string(),
    ));
  }

  if ResourceRef::classify(&id).is_ephemeral() {
    info!(id = %id, "message posted to temporary or demo ticket");

    let message = fallback_message(&id, &identity.user_id, &payload);
    return match state.fallback.append_message(&id, message.clone()) {
      Ok(Some(stored)) => Ok((StatusCode::CREATED, Json(stored)).into_response()),
      Ok(None) => {
        // Unknown ticket: answer with a synthesized message, nothing persisted
        let demo = Message {
          id: format!("demo-message-{}", Utc::now().timestamp_millis()),
          ..message
        };
        Ok(
          (
            StatusCode::CREATED,
            [(DEMO_MESSAGE_HEADER, "true")],
            Json(demo),
          )
            .into_response(),
        )
      }
      Err(e) => {
        // The append is best-effort; the caller still gets its message back
        error!(id = %id, "failed to persist temporary message: {}", e);
        Ok((StatusCode::CREATED, Json(message)).into_response())
      }
    };
  }

  let ticket = state
    .store
    .get_ticket(&id)
    .map_err(write_error)?
    .ok_or_else(|| ApiError::NotFound("Ticket non trouvé".to_string()))?;

  authorize_mutation(&state, &ticket.user_id, &identity, write_error)?;

  let message = state
    .store
    .create_message(&id, &identity.user_id, &payload.content, payload.is_internal)
    .map_err(write_error)?;

  // New client activity reopens a closed ticket
  if ticket.status == TicketStatus::Closed {
    if let Err(e) = state.store.update_status(&id, TicketStatus::Open) {
      warn!(id = %id, "failed to reopen ticket: {}", e);
    }
  }

  Ok(Json(message).into_response())
}

fn write_error(e: color_eyre::Report) -> ApiError {
  error!("failed to create message: {}", e);
  ApiError::Internal("Erreur serveur".to_string())
}

/// The one message every empty temporary thread starts with.
fn welcome_message(ticket_id: &str) -> Message {
  let sent_at = Utc::now() - Duration::hours(1);
  Message {
    id: format!("demo-message-{}-1", Utc::now().timestamp_millis()),
    content: "Bienvenue ! Comment puis-je vous aider avec ce ticket ?".to_string(),
    ticket_id: ticket_id.to_string(),
    user_id: "admin-user".to_string(),
    is_internal: false,
    created_at: sent_at,
    updated_at: sent_at,
    user: Some(UserProfile {
      id: "admin-user".to_string(),
      email: "support@appshade.com".to_string(),
      first_name: Some("Support".to_string()),
      last_name: Some("Technique".to_string()),
      role: Role::Admin,
    }),
  }
}

/// A message record for the fallback store, with a synthesized author
/// profile since fallback tickets have no relational user row.
fn fallback_message(ticket_id: &str, user_id: &str, payload: &NewMessage) -> Message {
  let now = Utc::now();
  let suffix: String = Uuid::new_v4().simple().to_string()[..13].to_string();
  let demo = user_id == DEMO_USER_ID;

  Message {
    id: format!("msg-{}-{}", now.timestamp_millis(), suffix),
    content: payload.content.clone(),
    ticket_id: ticket_id.to_string(),
    user_id: user_id.to_string(),
    is_internal: payload.is_internal,
    created_at: now,
    updated_at: now,
    user: Some(UserProfile {
      id: user_id.to_string(),
      email: if demo {
        "demo@example.com".to_string()
      } else {
        "client@temporaire.com".to_string()
      },
      first_name: Some(if demo { "Utilisateur" } else { "Client" }.to_string()),
      last_name: Some(if demo { "Démo" } else { "Temporaire" }.to_string()),
      role: Role::Client,
    }),
  }
}
