//! Classification of ticket resource identifiers.
//!
//! Ids carrying one of the reserved prefixes (`temp-`, `error-`, `demo-`)
//! never touch the relational store; they are served from the file-backed
//! fallback store without authorization checks. The prefix convention is a
//! wire contract shared with clients, so it is decided here once and the
//! rest of the server only ever sees the resulting [`ResourceRef`].

/// Kind of ephemeral (non-persisted) ticket resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EphemeralKind {
  /// Created locally before the backing store acknowledged it
  Temp,
  /// Synthesized after a failed create
  Error,
  /// Demonstration data
  Demo,
}

/// A ticket resource reference, classified once at the HTTP boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRef {
  /// Backed by the relational store, subject to authorization
  Persistent(String),
  /// Backed by the fallback file store, open to any authenticated caller
  Ephemeral(EphemeralKind, String),
}

impl ResourceRef {
  /// Classify a raw id from the request path.
  pub fn classify(id: &str) -> Self {
    match prefix_kind(id) {
      Some(kind) => ResourceRef::Ephemeral(kind, id.to_string()),
      None => ResourceRef::Persistent(id.to_string()),
    }
  }

  /// The raw identifier, whichever side it lives on.
  pub fn id(&self) -> &str {
    match self {
      ResourceRef::Persistent(id) => id,
      ResourceRef::Ephemeral(_, id) => id,
    }
  }

  pub fn is_ephemeral(&self) -> bool {
    matches!(self, ResourceRef::Ephemeral(..))
  }
}

fn prefix_kind(id: &str) -> Option<EphemeralKind> {
  if id.starts_with("temp-") {
    Some(EphemeralKind::Temp)
  } else if id.starts_with("error-") {
    Some(EphemeralKind::Error)
  } else if id.starts_with("demo-") {
    Some(EphemeralKind::Demo)
  } else {
    None
  }
}
