//! Attachment routes and the on-disk file vault.
//!
//! Files travel as base64 data URLs in JSON bodies and land under the
//! public uploads directory with a content-hash-derived name; the
//! relational row records the public `/uploads/...` path.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{error, warn};

use crate::api::types::{AttachmentUpload, Role};

use super::auth::caller;
use super::error::ApiError;
use super::tickets::authorize_mutation;
use super::AppState;

/// Public URL prefix recorded in attachment rows.
const UPLOADS_PREFIX: &str = "/uploads/";

/// GET /api/tickets/{id}/attachments — a ticket's attachments, newest first.
pub async fn list_attachments(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
  headers: HeaderMap,
) -> Result<Response, ApiError> {
  caller(&headers).ok_or(ApiError::Unauthorized)?;

  let attachments = state.store.list_attachments(&id).map_err(server_error)?;

  Ok(Json(json!({ "attachments": attachments })).into_response())
}

/// POST /api/tickets/{id}/attachments — upload a file to a ticket.
pub async fn upload_attachment(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
  headers: HeaderMap,
  Json(payload): Json<AttachmentUpload>,
) -> Result<Response, ApiError> {
  let identity = caller(&headers).ok_or(ApiError::Unauthorized)?;

  if payload.file_name.is_empty() || payload.file_type.is_empty() || payload.file_data.is_empty()
  {
    return Err(ApiError::BadRequest("Données invalides".to_string()));
  }

  let ticket = state
    .store
    .get_ticket(&id)
    .map_err(server_error)?
    .ok_or_else(|| ApiError::NotFound("Ticket non trouvé".to_string()))?;

  authorize_mutation(&state, &ticket.user_id, &identity, server_error)?;

  // Accept both a raw base64 payload and a full data URL
  let encoded = payload
    .file_data
    .rsplit(";base64,")
    .next()
    .unwrap_or(&payload.file_data);
  let contents = BASE64
    .decode(encoded)
    .map_err(|_| ApiError::BadRequest("Données invalides".to_string()))?;

  let stored_name = stored_file_name(&payload.file_name, &contents);
  let file_url = format!("{}{}", UPLOADS_PREFIX, stored_name);

  std::fs::create_dir_all(&state.uploads_dir).map_err(|e| {
    error!("failed to create uploads directory: {}", e);
    ApiError::Internal("Erreur serveur".to_string())
  })?;
  std::fs::write(state.uploads_dir.join(&stored_name), &contents).map_err(|e| {
    error!(file = %stored_name, "failed to write attachment: {}", e);
    ApiError::Internal("Erreur serveur".to_string())
  })?;

  let attachment = state
    .store
    .create_attachment(
      &id,
      &identity.user_id,
      &payload.file_name,
      &payload.file_type,
      payload.file_size,
      &file_url,
    )
    .map_err(server_error)?;

  Ok(Json(json!({ "attachment": attachment, "fileUrl": file_url })).into_response())
}

/// DELETE /api/tickets/{id}/attachments — remove one attachment
/// (body: `{ "attachmentId": ... }`).
pub async fn delete_attachment(
  State(state): State<Arc<AppState>>,
  Path(_id): Path<String>,
  headers: HeaderMap,
  Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
  let identity = caller(&headers).ok_or(ApiError::Unauthorized)?;

  let attachment_id = payload
    .get("attachmentId")
    .and_then(Value::as_str)
    .filter(|value| !value.is_empty())
    .ok_or_else(|| ApiError::BadRequest("ID de pièce jointe manquant".to_string()))?;

  let (attachment, ticket_owner) = state
    .store
    .get_attachment(attachment_id)
    .map_err(server_error)?
    .ok_or_else(|| ApiError::NotFound("Pièce jointe non trouvée".to_string()))?;

  // Uploader, ticket owner, or admin
  if attachment.user_id != identity.user_id && ticket_owner != identity.user_id {
    let role = state
      .store
      .user_role(&identity.user_id)
      .map_err(server_error)?;
    if role != Some(Role::Admin) {
      return Err(ApiError::Forbidden("Non autorisé".to_string()));
    }
  }

  // Remove the file best-effort; the row is authoritative
  if let Some(stored_name) = attachment.file_path.strip_prefix(UPLOADS_PREFIX) {
    let path = state.uploads_dir.join(stored_name);
    if path.exists() {
      if let Err(e) = std::fs::remove_file(&path) {
        warn!(file = %path.display(), "failed to remove attachment file: {}", e);
      }
    }
  }

  state
    .store
    .delete_attachment(attachment_id)
    .map_err(server_error)?;

  Ok(Json(json!({ "success": true })).into_response())
}

fn server_error(e: color_eyre::Report) -> ApiError {
  error!("attachment operation failed: {}", e);
  ApiError::Internal("Erreur serveur".to_string())
}

/// Content-addressed file name: hash of the bytes plus the original
/// extension, so identical uploads collapse to one file.
fn stored_file_name(original_name: &str, contents: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(contents);
  let digest = hex::encode(hasher.finalize());

  match original_name.rsplit('.').next().filter(|ext| {
    !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric())
  }) {
    Some(extension) if original_name.contains('.') => {
      format!("{}.{}", digest, extension.to_lowercase())
    }
    _ => digest,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_stored_file_name_keeps_extension() {
    let name = stored_file_name("screenshot.PNG", b"bytes");
    assert!(name.ends_with(".png"));
    assert_eq!(name.len(), 64 + 4);
  }

  #[test]
  fn test_stored_file_name_without_extension() {
    let name = stored_file_name("README", b"bytes");
    assert_eq!(name.len(), 64);
  }

  #[test]
  fn test_identical_contents_share_a_name() {
    assert_eq!(
      stored_file_name("a.png", b"bytes"),
      stored_file_name("b.png", b"bytes")
    );
  }
}
