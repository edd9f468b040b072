//! Wire types shared by the client and server halves.
//!
//! Field names follow the JSON casing of the HTTP API (camelCase); the
//! server's relational store and the fallback file both speak this format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
  Open,
  InProgress,
  Closed,
}

impl TicketStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      TicketStatus::Open => "open",
      TicketStatus::InProgress => "in_progress",
      TicketStatus::Closed => "closed",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "open" => Some(TicketStatus::Open),
      "in_progress" => Some(TicketStatus::InProgress),
      "closed" => Some(TicketStatus::Closed),
      _ => None,
    }
  }
}

/// Ticket priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  Low,
  Medium,
  High,
  Urgent,
}

impl Priority {
  pub fn as_str(self) -> &'static str {
    match self {
      Priority::Low => "low",
      Priority::Medium => "medium",
      Priority::High => "high",
      Priority::Urgent => "urgent",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "low" => Some(Priority::Low),
      "medium" => Some(Priority::Medium),
      "high" => Some(Priority::High),
      "urgent" => Some(Priority::Urgent),
      _ => None,
    }
  }
}

/// User role, as recorded in the relational store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Admin,
  Client,
}

impl Role {
  pub fn as_str(self) -> &'static str {
    match self {
      Role::Admin => "admin",
      Role::Client => "client",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "admin" => Some(Role::Admin),
      "client" => Some(Role::Client),
      _ => None,
    }
  }
}

/// Public profile fields of a user, nested into tickets and messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
  pub id: String,
  pub email: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub first_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_name: Option<String>,
  pub role: Role,
}

/// A message in a ticket thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
  pub id: String,
  pub content: String,
  pub ticket_id: String,
  pub user_id: String,
  /// Internal notes are visible to admins only
  #[serde(default)]
  pub is_internal: bool,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub user: Option<UserProfile>,
}

/// A support ticket, optionally hydrated with its thread and owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
  pub id: String,
  pub title: String,
  pub description: String,
  pub status: TicketStatus,
  pub priority: Priority,
  #[serde(default = "default_category")]
  pub category: String,
  pub user_id: String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default)]
  pub messages: Vec<Message>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub user: Option<UserProfile>,
}

fn default_category() -> String {
  "other".to_string()
}

/// Payload for creating a ticket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTicket {
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub description: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub priority: Option<Priority>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
}

/// Payload for posting a message to a ticket thread.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
  #[serde(default)]
  pub content: String,
  #[serde(default)]
  pub is_internal: bool,
}

/// An attachment row; the file itself lives under the public uploads
/// directory at `file_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
  pub id: String,
  pub file_name: String,
  pub file_type: String,
  pub file_size: u64,
  pub file_path: String,
  pub ticket_id: String,
  pub user_id: String,
  pub created_at: DateTime<Utc>,
}

/// Upload payload: the file travels as a base64 data URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentUpload {
  #[serde(default)]
  pub file_name: String,
  #[serde(default)]
  pub file_type: String,
  #[serde(default)]
  pub file_size: u64,
  #[serde(default)]
  pub file_data: String,
}
