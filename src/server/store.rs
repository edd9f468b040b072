//! Relational ticket store on SQLite.
//!
//! All access goes through a single connection behind a mutex; callers get
//! `Ok(None)` for missing rows and `Err` only for genuine datastore
//! failures, which is what lets the GET handlers decide between 404 and a
//! degraded response.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

use crate::api::types::{
  Attachment, Message, NewTicket, Priority, Role, Ticket, TicketStatus, UserProfile,
};

/// Schema for the ticket tables.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL,
    first_name TEXT,
    last_name TEXT,
    role TEXT NOT NULL DEFAULT 'client',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tickets (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    priority TEXT NOT NULL DEFAULT 'medium',
    category TEXT NOT NULL DEFAULT 'other',
    user_id TEXT NOT NULL REFERENCES users(id),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tickets_user ON tickets(user_id);
CREATE INDEX IF NOT EXISTS idx_tickets_created ON tickets(created_at);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    ticket_id TEXT NOT NULL REFERENCES tickets(id),
    user_id TEXT NOT NULL,
    content TEXT NOT NULL,
    is_internal INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_ticket ON messages(ticket_id, created_at);

CREATE TABLE IF NOT EXISTS attachments (
    id TEXT PRIMARY KEY,
    ticket_id TEXT NOT NULL REFERENCES tickets(id),
    user_id TEXT NOT NULL,
    file_name TEXT NOT NULL,
    file_type TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    file_path TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attachments_ticket ON attachments(ticket_id);
"#;

/// SQLite-backed store for users, tickets, messages, and attachments.
pub struct TicketStore {
  conn: Mutex<Connection>,
}

impl TicketStore {
  /// Open or create the database at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
      }
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// In-memory database, used by tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open database: {}", e))?;
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Direct access to the connection.
  pub fn conn(&self) -> &Mutex<Connection> {
    &self.conn
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  // ==========================================================================
  // Users
  // ==========================================================================

  pub fn insert_user(&self, user: &UserProfile) -> Result<()> {
    let conn = self.lock()?;
    let now = Utc::now().to_rfc3339();
    conn
      .execute(
        "INSERT OR REPLACE INTO users (id, email, first_name, last_name, role, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          user.id,
          user.email,
          user.first_name,
          user.last_name,
          user.role.as_str(),
          now,
          now
        ],
      )
      .map_err(|e| eyre!("Failed to insert user: {}", e))?;
    Ok(())
  }

  pub fn get_user(&self, id: &str) -> Result<Option<UserProfile>> {
    let conn = self.lock()?;
    load_user(&conn, id)
  }

  pub fn set_role(&self, id: &str, role: Role) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "UPDATE users SET role = ?, updated_at = ? WHERE id = ?",
        params![role.as_str(), Utc::now().to_rfc3339(), id],
      )
      .map_err(|e| eyre!("Failed to update role: {}", e))?;
    Ok(())
  }

  pub fn user_role(&self, id: &str) -> Result<Option<Role>> {
    let conn = self.lock()?;
    let role: Option<String> = conn
      .query_row("SELECT role FROM users WHERE id = ?", params![id], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to query role: {}", e))?;

    Ok(role.as_deref().and_then(Role::parse))
  }

  // ==========================================================================
  // Tickets
  // ==========================================================================

  pub fn create_ticket(&self, user_id: &str, ticket: &NewTicket) -> Result<Ticket> {
    let conn = self.lock()?;
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let priority = ticket.priority.unwrap_or(Priority::Medium);
    let category = ticket.category.clone().unwrap_or_else(|| "other".to_string());

    conn
      .execute(
        "INSERT INTO tickets (id, title, description, status, priority, category, user_id, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          id,
          ticket.title.trim(),
          ticket.description.trim(),
          TicketStatus::Open.as_str(),
          priority.as_str(),
          category,
          user_id,
          now.to_rfc3339(),
          now.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to create ticket: {}", e))?;

    Ok(Ticket {
      id,
      title: ticket.title.trim().to_string(),
      description: ticket.description.trim().to_string(),
      status: TicketStatus::Open,
      priority,
      category,
      user_id: user_id.to_string(),
      created_at: now,
      updated_at: now,
      messages: Vec::new(),
      user: load_user(&conn, user_id)?,
    })
  }

  /// Bare ticket row, no nesting. `Ok(None)` means the ticket is absent.
  pub fn get_ticket(&self, id: &str) -> Result<Option<Ticket>> {
    let conn = self.lock()?;
    load_ticket(&conn, id)
  }

  /// Ticket hydrated with its thread and owner profile.
  pub fn get_ticket_detail(&self, id: &str, include_internal: bool) -> Result<Option<Ticket>> {
    let conn = self.lock()?;
    let Some(mut ticket) = load_ticket(&conn, id)? else {
      return Ok(None);
    };

    ticket.messages = load_messages(&conn, id, include_internal)?;
    ticket.user = load_user(&conn, &ticket.user_id)?;
    Ok(Some(ticket))
  }

  /// Tickets visible to the requester, newest first: admins see every
  /// ticket, clients their own.
  pub fn list_tickets(&self, requester: &str, role: Role) -> Result<Vec<Ticket>> {
    let conn = self.lock()?;

    let mut stmt = match role {
      Role::Admin => conn
        .prepare(
          "SELECT id, title, description, status, priority, category, user_id, created_at, updated_at
           FROM tickets ORDER BY created_at DESC",
        )
        .map_err(|e| eyre!("Failed to prepare ticket query: {}", e))?,
      Role::Client => conn
        .prepare(
          "SELECT id, title, description, status, priority, category, user_id, created_at, updated_at
           FROM tickets WHERE user_id = ? ORDER BY created_at DESC",
        )
        .map_err(|e| eyre!("Failed to prepare ticket query: {}", e))?,
    };

    let rows: Vec<TicketRow> = match role {
      Role::Admin => stmt.query_map([], ticket_row),
      Role::Client => stmt.query_map(params![requester], ticket_row),
    }
    .map_err(|e| eyre!("Failed to query tickets: {}", e))?
    .collect::<rusqlite::Result<_>>()
    .map_err(|e| eyre!("Failed to read ticket row: {}", e))?;

    let include_internal = role == Role::Admin;
    let mut tickets = Vec::with_capacity(rows.len());
    for row in rows {
      let mut ticket = ticket_from_row(row)?;
      ticket.messages = load_messages(&conn, &ticket.id, include_internal)?;
      ticket.user = load_user(&conn, &ticket.user_id)?;
      tickets.push(ticket);
    }

    Ok(tickets)
  }

  /// Update the ticket status and stamp `updatedAt`. `Ok(None)` when the
  /// ticket is absent.
  pub fn update_status(&self, id: &str, status: TicketStatus) -> Result<Option<Ticket>> {
    let conn = self.lock()?;
    let changed = conn
      .execute(
        "UPDATE tickets SET status = ?, updated_at = ? WHERE id = ?",
        params![status.as_str(), Utc::now().to_rfc3339(), id],
      )
      .map_err(|e| eyre!("Failed to update ticket: {}", e))?;

    if changed == 0 {
      return Ok(None);
    }
    load_ticket(&conn, id)
  }

  /// Delete the ticket with its messages and attachment rows.
  pub fn delete_ticket(&self, id: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM messages WHERE ticket_id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete messages: {}", e))?;
    conn
      .execute("DELETE FROM attachments WHERE ticket_id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete attachments: {}", e))?;
    conn
      .execute("DELETE FROM tickets WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete ticket: {}", e))?;
    Ok(())
  }

  // ==========================================================================
  // Messages
  // ==========================================================================

  pub fn list_messages(&self, ticket_id: &str, include_internal: bool) -> Result<Vec<Message>> {
    let conn = self.lock()?;
    load_messages(&conn, ticket_id, include_internal)
  }

  pub fn create_message(
    &self,
    ticket_id: &str,
    user_id: &str,
    content: &str,
    is_internal: bool,
  ) -> Result<Message> {
    let conn = self.lock()?;
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();

    conn
      .execute(
        "INSERT INTO messages (id, ticket_id, user_id, content, is_internal, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          id,
          ticket_id,
          user_id,
          content,
          is_internal as i64,
          now.to_rfc3339(),
          now.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to create message: {}", e))?;

    Ok(Message {
      id,
      content: content.to_string(),
      ticket_id: ticket_id.to_string(),
      user_id: user_id.to_string(),
      is_internal,
      created_at: now,
      updated_at: now,
      user: load_user(&conn, user_id)?,
    })
  }

  // ==========================================================================
  // Attachments
  // ==========================================================================

  pub fn list_attachments(&self, ticket_id: &str) -> Result<Vec<Attachment>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, ticket_id, user_id, file_name, file_type, file_size, file_path, created_at
         FROM attachments WHERE ticket_id = ? ORDER BY created_at DESC",
      )
      .map_err(|e| eyre!("Failed to prepare attachment query: {}", e))?;

    let rows: Vec<AttachmentRow> = stmt
      .query_map(params![ticket_id], attachment_row)
      .map_err(|e| eyre!("Failed to query attachments: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read attachment row: {}", e))?;

    rows.into_iter().map(attachment_from_row).collect()
  }

  pub fn create_attachment(
    &self,
    ticket_id: &str,
    user_id: &str,
    file_name: &str,
    file_type: &str,
    file_size: u64,
    file_path: &str,
  ) -> Result<Attachment> {
    let conn = self.lock()?;
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();

    conn
      .execute(
        "INSERT INTO attachments (id, ticket_id, user_id, file_name, file_type, file_size, file_path, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          id,
          ticket_id,
          user_id,
          file_name,
          file_type,
          file_size as i64,
          file_path,
          now.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to create attachment: {}", e))?;

    Ok(Attachment {
      id,
      file_name: file_name.to_string(),
      file_type: file_type.to_string(),
      file_size,
      file_path: file_path.to_string(),
      ticket_id: ticket_id.to_string(),
      user_id: user_id.to_string(),
      created_at: now,
    })
  }

  /// An attachment with its ticket's owner id, for authorization.
  pub fn get_attachment(&self, id: &str) -> Result<Option<(Attachment, String)>> {
    let conn = self.lock()?;
    let row: Option<(AttachmentRow, String)> = conn
      .query_row(
        "SELECT a.id, a.ticket_id, a.user_id, a.file_name, a.file_type, a.file_size, a.file_path, a.created_at,
                t.user_id
         FROM attachments a INNER JOIN tickets t ON t.id = a.ticket_id
         WHERE a.id = ?",
        params![id],
        |row| {
          Ok((
            (
              row.get(0)?,
              row.get(1)?,
              row.get(2)?,
              row.get(3)?,
              row.get(4)?,
              row.get(5)?,
              row.get(6)?,
              row.get(7)?,
            ),
            row.get(8)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to query attachment: {}", e))?;

    match row {
      Some((attachment, owner)) => Ok(Some((attachment_from_row(attachment)?, owner))),
      None => Ok(None),
    }
  }

  pub fn delete_attachment(&self, id: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM attachments WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete attachment: {}", e))?;
    Ok(())
  }
}

type TicketRow = (
  String,
  String,
  String,
  String,
  String,
  String,
  String,
  String,
  String,
);

type AttachmentRow = (String, String, String, String, String, i64, String, String);

fn ticket_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TicketRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
    row.get(7)?,
    row.get(8)?,
  ))
}

fn attachment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttachmentRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
    row.get(7)?,
  ))
}

fn ticket_from_row(row: TicketRow) -> Result<Ticket> {
  Ok(Ticket {
    id: row.0,
    title: row.1,
    description: row.2,
    status: TicketStatus::parse(&row.3).unwrap_or(TicketStatus::Open),
    priority: Priority::parse(&row.4).unwrap_or(Priority::Medium),
    category: row.5,
    user_id: row.6,
    created_at: parse_timestamp(&row.7)?,
    updated_at: parse_timestamp(&row.8)?,
    messages: Vec::new(),
    user: None,
  })
}

fn attachment_from_row(row: AttachmentRow) -> Result<Attachment> {
  Ok(Attachment {
    id: row.0,
    ticket_id: row.1,
    user_id: row.2,
    file_name: row.3,
    file_type: row.4,
    file_size: row.5.max(0) as u64,
    file_path: row.6,
    created_at: parse_timestamp(&row.7)?,
  })
}

fn load_ticket(conn: &Connection, id: &str) -> Result<Option<Ticket>> {
  let row: Option<TicketRow> = conn
    .query_row(
      "SELECT id, title, description, status, priority, category, user_id, created_at, updated_at
       FROM tickets WHERE id = ?",
      params![id],
      ticket_row,
    )
    .optional()
    .map_err(|e| eyre!("Failed to query ticket: {}", e))?;

  row.map(ticket_from_row).transpose()
}

fn load_user(conn: &Connection, id: &str) -> Result<Option<UserProfile>> {
  let row: Option<(String, String, Option<String>, Option<String>, String)> = conn
    .query_row(
      "SELECT id, email, first_name, last_name, role FROM users WHERE id = ?",
      params![id],
      |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
        ))
      },
    )
    .optional()
    .map_err(|e| eyre!("Failed to query user: {}", e))?;

  Ok(row.map(|(id, email, first_name, last_name, role)| UserProfile {
    id,
    email,
    first_name,
    last_name,
    role: Role::parse(&role).unwrap_or(Role::Client),
  }))
}

fn load_messages(
  conn: &Connection,
  ticket_id: &str,
  include_internal: bool,
) -> Result<Vec<Message>> {
  let query = if include_internal {
    "SELECT id, ticket_id, user_id, content, is_internal, created_at, updated_at
     FROM messages WHERE ticket_id = ? ORDER BY created_at ASC"
  } else {
    "SELECT id, ticket_id, user_id, content, is_internal, created_at, updated_at
     FROM messages WHERE ticket_id = ? AND is_internal = 0 ORDER BY created_at ASC"
  };

  let mut stmt = conn
    .prepare(query)
    .map_err(|e| eyre!("Failed to prepare message query: {}", e))?;

  let rows: Vec<(String, String, String, String, i64, String, String)> = stmt
    .query_map(params![ticket_id], |row| {
      Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
      ))
    })
    .map_err(|e| eyre!("Failed to query messages: {}", e))?
    .collect::<rusqlite::Result<_>>()
    .map_err(|e| eyre!("Failed to read message row: {}", e))?;

  let mut messages = Vec::with_capacity(rows.len());
  for (id, ticket_id, user_id, content, is_internal, created_at, updated_at) in rows {
    let user = load_user(conn, &user_id)?;
    messages.push(Message {
      id,
      content,
      ticket_id,
      user_id,
      is_internal: is_internal != 0,
      created_at: parse_timestamp(&created_at)?,
      updated_at: parse_timestamp(&updated_at)?,
      user,
    });
  }

  Ok(messages)
}

/// Parse an RFC 3339 timestamp stored as TEXT.
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse timestamp '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn client(id: &str) -> UserProfile {
    UserProfile {
      id: id.to_string(),
      email: format!("{}@example.com", id),
      first_name: None,
      last_name: None,
      role: Role::Client,
    }
  }

  fn admin(id: &str) -> UserProfile {
    UserProfile {
      role: Role::Admin,
      ..client(id)
    }
  }

  #[test]
  fn test_ticket_round_trip() {
    let store = TicketStore::open_in_memory().unwrap();
    store.insert_user(&client("alice")).unwrap();

    let ticket = store
      .create_ticket(
        "alice",
        &NewTicket {
          title: "  Site down  ".to_string(),
          description: "Nothing loads".to_string(),
          priority: Some(Priority::High),
          category: None,
        },
      )
      .unwrap();

    assert_eq!(ticket.title, "Site down");
    assert_eq!(ticket.status, TicketStatus::Open);
    assert_eq!(ticket.user.as_ref().unwrap().id, "alice");

    let loaded = store.get_ticket(&ticket.id).unwrap().unwrap();
    assert_eq!(loaded.title, "Site down");
    assert_eq!(loaded.priority, Priority::High);

    assert!(store.get_ticket("missing").unwrap().is_none());
  }

  #[test]
  fn test_list_tickets_by_role() {
    let store = TicketStore::open_in_memory().unwrap();
    store.insert_user(&client("alice")).unwrap();
    store.insert_user(&client("bob")).unwrap();
    store.insert_user(&admin("root")).unwrap();

    let new = |title: &str| NewTicket {
      title: title.to_string(),
      description: "d".to_string(),
      ..NewTicket::default()
    };
    store.create_ticket("alice", &new("a1")).unwrap();
    store.create_ticket("bob", &new("b1")).unwrap();

    assert_eq!(store.list_tickets("alice", Role::Client).unwrap().len(), 1);
    assert_eq!(store.list_tickets("root", Role::Admin).unwrap().len(), 2);
  }

  #[test]
  fn test_internal_messages_filtered() {
    let store = TicketStore::open_in_memory().unwrap();
    store.insert_user(&client("alice")).unwrap();
    store.insert_user(&admin("root")).unwrap();

    let ticket = store
      .create_ticket(
        "alice",
        &NewTicket {
          title: "t".to_string(),
          description: "d".to_string(),
          ..NewTicket::default()
        },
      )
      .unwrap();

    store
      .create_message(&ticket.id, "alice", "please help", false)
      .unwrap();
    store
      .create_message(&ticket.id, "root", "note to self", true)
      .unwrap();

    assert_eq!(store.list_messages(&ticket.id, true).unwrap().len(), 2);
    let visible = store.list_messages(&ticket.id, false).unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].content, "please help");
  }

  #[test]
  fn test_delete_ticket_cascades() {
    let store = TicketStore::open_in_memory().unwrap();
    store.insert_user(&client("alice")).unwrap();

    let ticket = store
      .create_ticket(
        "alice",
        &NewTicket {
          title: "t".to_string(),
          description: "d".to_string(),
          ..NewTicket::default()
        },
      )
      .unwrap();
    store
      .create_message(&ticket.id, "alice", "hello", false)
      .unwrap();

    store.delete_ticket(&ticket.id).unwrap();
    assert!(store.get_ticket(&ticket.id).unwrap().is_none());
    assert!(store.list_messages(&ticket.id, true).unwrap().is_empty());
  }

  #[test]
  fn test_update_status_stamps_updated_at() {
    let store = TicketStore::open_in_memory().unwrap();
    store.insert_user(&client("alice")).unwrap();

    let ticket = store
      .create_ticket(
        "alice",
        &NewTicket {
          title: "t".to_string(),
          description: "d".to_string(),
          ..NewTicket::default()
        },
      )
      .unwrap();

    let updated = store
      .update_status(&ticket.id, TicketStatus::Closed)
      .unwrap()
      .unwrap();
    assert_eq!(updated.status, TicketStatus::Closed);
    assert!(updated.updated_at >= ticket.updated_at);

    assert!(store
      .update_status("missing", TicketStatus::Open)
      .unwrap()
      .is_none());
  }
}
