//! Typed client for the ticket API.
//!
//! Wraps the fetch and mutation controllers with the concrete ticket,
//! message, and attachment operations, carrying the session identity on
//! every request.

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::ClientConfig;
use crate::fetch::{FetchHandle, FetchOptions, ResourceCacheContext, ResourceFetcher};

use super::types::{
  Attachment, AttachmentUpload, Message, NewMessage, NewTicket, Ticket, TicketStatus, UserProfile,
};

/// Header carrying the caller identity, installed by the identity proxy in
/// deployment and set directly by this client elsewhere.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Typed API client bound to one base URL and session identity.
#[derive(Clone)]
pub struct ApiClient {
  fetcher: ResourceFetcher,
  base_url: String,
}

impl ApiClient {
  /// Build a client from configuration, with a fresh cache context.
  pub fn new(config: &ClientConfig) -> Result<Self> {
    Self::with_context(config, Arc::new(ResourceCacheContext::new()))
  }

  /// Build a client sharing an existing cache context.
  pub fn with_context(
    config: &ClientConfig,
    context: Arc<ResourceCacheContext>,
  ) -> Result<Self> {
    let mut headers = HeaderMap::new();
    if let Some(user) = config.session_user() {
      let name = HeaderName::from_static(USER_ID_HEADER);
      let value = HeaderValue::from_str(&user)
        .map_err(|e| eyre!("Invalid session user '{}': {}", user, e))?;
      headers.insert(name, value);
    }

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      fetcher: ResourceFetcher::with_client(context, http),
      base_url: config.base_url.trim_end_matches('/').to_string(),
    })
  }

  pub fn fetcher(&self) -> &ResourceFetcher {
    &self.fetcher
  }

  fn url(&self, path: &str) -> String {
    format!("{}{}", self.base_url, path)
  }

  /// Subscribe to the caller's ticket collection.
  pub fn tickets(&self) -> FetchHandle {
    self.subscribe("/api/tickets", FetchOptions::default())
  }

  /// Subscribe to a single ticket with its thread.
  pub fn ticket(&self, id: &str) -> FetchHandle {
    self.subscribe(&format!("/api/tickets/{}", id), FetchOptions::default())
  }

  /// Subscribe to a ticket's message thread.
  pub fn messages(&self, ticket_id: &str) -> FetchHandle {
    self.subscribe(
      &format!("/api/tickets/{}/messages", ticket_id),
      FetchOptions::default(),
    )
  }

  /// Subscribe to a ticket's attachments.
  pub fn attachments(&self, ticket_id: &str) -> FetchHandle {
    self.subscribe(
      &format!("/api/tickets/{}/attachments", ticket_id),
      FetchOptions::default(),
    )
  }

  /// Subscribe to an arbitrary API path with explicit options.
  pub fn subscribe(&self, path: &str, options: FetchOptions) -> FetchHandle {
    self.fetcher.subscribe(&self.url(path), options)
  }

  pub async fn create_ticket(&self, ticket: &NewTicket) -> Result<Ticket> {
    let body = serde_json::to_value(ticket)?;
    let response = self
      .fetcher
      .mutation(&self.url("/api/tickets"), Method::POST)
      .mutate(Some(body))
      .await?;
    parse(response)
  }

  pub async fn post_message(&self, ticket_id: &str, message: &NewMessage) -> Result<Message> {
    let body = serde_json::to_value(message)?;
    let response = self
      .fetcher
      .mutation(
        &self.url(&format!("/api/tickets/{}/messages", ticket_id)),
        Method::POST,
      )
      .mutate(Some(body))
      .await?;
    parse(response)
  }

  pub async fn set_status(&self, ticket_id: &str, status: TicketStatus) -> Result<Ticket> {
    let response = self
      .fetcher
      .mutation(
        &self.url(&format!("/api/tickets/{}", ticket_id)),
        Method::PATCH,
      )
      .mutate(Some(serde_json::json!({ "status": status })))
      .await?;
    parse(response)
  }

  pub async fn delete_ticket(&self, ticket_id: &str) -> Result<()> {
    self
      .fetcher
      .mutation(
        &self.url(&format!("/api/tickets/{}", ticket_id)),
        Method::DELETE,
      )
      .mutate(None)
      .await?;
    Ok(())
  }

  /// Upload a file to a ticket; returns the created row and its public URL.
  pub async fn upload_attachment(
    &self,
    ticket_id: &str,
    upload: &AttachmentUpload,
  ) -> Result<(Attachment, String)> {
    let body = serde_json::to_value(upload)?;
    let response = self
      .fetcher
      .mutation(
        &self.url(&format!("/api/tickets/{}/attachments", ticket_id)),
        Method::POST,
      )
      .mutate(Some(body))
      .await?;

    let attachment = response
      .get("attachment")
      .cloned()
      .ok_or_else(|| eyre!("Missing attachment in response"))?;
    let file_url = response
      .get("fileUrl")
      .and_then(Value::as_str)
      .ok_or_else(|| eyre!("Missing fileUrl in response"))?
      .to_string();

    Ok((parse(attachment)?, file_url))
  }

  pub async fn delete_attachment(&self, ticket_id: &str, attachment_id: &str) -> Result<()> {
    self
      .fetcher
      .mutation(
        &self.url(&format!("/api/tickets/{}/attachments", ticket_id)),
        Method::DELETE,
      )
      .mutate(Some(serde_json::json!({ "attachmentId": attachment_id })))
      .await?;
    Ok(())
  }

  /// Push the caller's identity claims into the server-side user store.
  pub async fn sync_user(&self) -> Result<UserProfile> {
    let response = self
      .fetcher
      .mutation(&self.url("/api/sync-user"), Method::POST)
      .mutate(None)
      .await?;
    parse(response)
  }
}

fn parse<T: DeserializeOwned>(value: Value) -> Result<T> {
  serde_json::from_value(value).map_err(|e| eyre!("Failed to parse response: {}", e))
}
