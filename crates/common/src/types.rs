// Core domain types shared across the Vigil crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier for one live gateway connection.
///
/// Minted by the gateway at upgrade time, stable for the life of the
/// connection, and unique process-wide. Never supplied by clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of the incident record being collaboratively viewed.
///
/// Supplied by clients and treated as an opaque room key — the gateway
/// never validates it against the incident store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct IncidentId(pub String);

impl IncidentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for IncidentId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for IncidentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for IncidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The authenticated identity bound to a connection.
///
/// Resolved once by the session authenticator before the WebSocket
/// upgrade completes; immutable afterwards. Presence payloads from the
/// client are never trusted for identity fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub analyst_id: String,
    pub display_name: String,
}

/// Live presence state for one connection within one incident room.
///
/// `is_focused` is derivable from `focused_row_id` but kept explicit to
/// mirror the wire contract; the registry keeps the two synchronized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceEntry {
    pub connection_id: ConnectionId,
    pub analyst_id: String,
    pub display_name: String,
    pub focused_row_id: Option<String>,
    pub is_focused: bool,
    pub is_editing: bool,
}

impl PresenceEntry {
    /// A fresh entry for a connection that just joined a room.
    pub fn joined(connection_id: ConnectionId, identity: &Identity) -> Self {
        Self {
            connection_id,
            analyst_id: identity.analyst_id.clone(),
            display_name: identity.display_name.clone(),
            focused_row_id: None,
            is_focused: false,
            is_editing: false,
        }
    }
}
