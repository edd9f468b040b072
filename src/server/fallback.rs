//! File-backed store for temporary/demo tickets.
//!
//! The whole owner→tickets map lives in one JSON file that is reloaded on
//! every read and rewritten on every change (last write wins — concurrent
//! writers can lose updates, which is an accepted property of this store).
//! Load never fails: a missing or corrupt file is an empty map, because
//! fallback data is best-effort by definition.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::error;

use crate::api::types::{Message, Ticket};

/// Owner key → that owner's temporary tickets, in creation order.
pub type FallbackMap = BTreeMap<String, Vec<Ticket>>;

pub struct FallbackStore {
  path: PathBuf,
}

impl FallbackStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Read the whole map from disk.
  pub fn load(&self) -> FallbackMap {
    match std::fs::read_to_string(&self.path) {
      Ok(contents) => match serde_json::from_str(&contents) {
        Ok(map) => map,
        Err(e) => {
          error!(
            path = %self.path.display(),
            "failed to parse fallback ticket file: {}", e
          );
          FallbackMap::new()
        }
      },
      Err(e) if e.kind() == ErrorKind::NotFound => FallbackMap::new(),
      Err(e) => {
        error!(
          path = %self.path.display(),
          "failed to read fallback ticket file: {}", e
        );
        FallbackMap::new()
      }
    }
  }

  /// Rewrite the whole map to disk.
  pub fn save(&self, map: &FallbackMap) -> Result<()> {
    let contents =
      serde_json::to_string(map).map_err(|e| eyre!("Failed to serialize fallback tickets: {}", e))?;
    std::fs::write(&self.path, contents).map_err(|e| {
      eyre!(
        "Failed to write fallback ticket file {}: {}",
        self.path.display(),
        e
      )
    })
  }

  /// Search every owner's list for a ticket by id.
  pub fn find_ticket(&self, id: &str) -> Option<Ticket> {
    self
      .load()
      .into_values()
      .flatten()
      .find(|ticket| ticket.id == id)
  }

  /// Append a message to a stored ticket and persist the map.
  ///
  /// Returns `Ok(None)` when no stored ticket matches; the caller decides
  /// what to synthesize in that case.
  pub fn append_message(&self, ticket_id: &str, message: Message) -> Result<Option<Message>> {
    let mut map = self.load();

    for tickets in map.values_mut() {
      if let Some(ticket) = tickets.iter_mut().find(|ticket| ticket.id == ticket_id) {
        ticket.messages.push(message.clone());
        self.save(&map)?;
        return Ok(Some(message));
      }
    }

    Ok(None)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::{Priority, TicketStatus};
  use chrono::Utc;

  fn temp_ticket(id: &str) -> Ticket {
    Ticket {
      id: id.to_string(),
      title: "Ticket temporaire".to_string(),
      description: "d".to_string(),
      status: TicketStatus::Open,
      priority: Priority::Medium,
      category: "other".to_string(),
      user_id: "user-1".to_string(),
      created_at: Utc::now(),
      updated_at: Utc::now(),
      messages: Vec::new(),
      user: None,
    }
  }

  fn message(ticket_id: &str, content: &str) -> Message {
    Message {
      id: "msg-1".to_string(),
      content: content.to_string(),
      ticket_id: ticket_id.to_string(),
      user_id: "user-1".to_string(),
      is_internal: false,
      created_at: Utc::now(),
      updated_at: Utc::now(),
      user: None,
    }
  }

  #[test]
  fn test_missing_file_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = FallbackStore::new(dir.path().join("temp-tickets.json"));
    assert!(store.load().is_empty());
    assert!(store.find_ticket("temp-1").is_none());
  }

  #[test]
  fn test_corrupt_file_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("temp-tickets.json");
    std::fs::write(&path, "{not json").unwrap();

    let store = FallbackStore::new(path);
    assert!(store.load().is_empty());
  }

  #[test]
  fn test_save_and_find() {
    let dir = tempfile::tempdir().unwrap();
    let store = FallbackStore::new(dir.path().join("temp-tickets.json"));

    let mut map = FallbackMap::new();
    map.insert("user-1".to_string(), vec![temp_ticket("temp-1")]);
    store.save(&map).unwrap();

    assert_eq!(store.find_ticket("temp-1").unwrap().id, "temp-1");
    assert!(store.find_ticket("temp-2").is_none());
  }

  #[test]
  fn test_append_message_persists() {
    let dir = tempfile::tempdir().unwrap();
    let store = FallbackStore::new(dir.path().join("temp-tickets.json"));

    let mut map = FallbackMap::new();
    map.insert("user-1".to_string(), vec![temp_ticket("temp-1")]);
    store.save(&map).unwrap();

    let appended = store
      .append_message("temp-1", message("temp-1", "Bonjour"))
      .unwrap();
    assert!(appended.is_some());

    // Visible through a fresh load, i.e. actually on disk
    let ticket = store.find_ticket("temp-1").unwrap();
    assert_eq!(ticket.messages.len(), 1);
    assert_eq!(ticket.messages[0].content, "Bonjour");

    // Unknown ticket: nothing persisted
    assert!(store
      .append_message("temp-2", message("temp-2", "x"))
      .unwrap()
      .is_none());
  }
}
