// WebSocket message types for the vigil-presence.v1 protocol.

use crate::types::{ConnectionId, IncidentId, PresenceEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// All message types in the vigil-presence.v1 WebSocket protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Client -> Server: start observing an incident room.
    JoinIncident { incident_id: IncidentId },

    /// Client -> Server: stop observing an incident room.
    LeaveIncident { incident_id: IncidentId },

    /// Client -> Server: move focus to a row (or clear it with `None`).
    FocusChange {
        incident_id: IncidentId,
        row_id: Option<String>,
        #[serde(default)]
        is_editing: bool,
    },

    /// Server -> Client: a connection joined the room. Broadcast to every
    /// member including the joiner, so the joiner gets a confirmed echo
    /// of its own entry.
    UserJoinedIncident { incident_id: IncidentId, entry: PresenceEntry },

    /// Server -> Client: a connection left the room (explicit leave or
    /// disconnect). Sent to the remaining members only.
    UserLeftIncident { incident_id: IncidentId, connection_id: ConnectionId },

    /// Server -> Client: a member's row focus changed.
    UserFocusedRow {
        incident_id: IncidentId,
        connection_id: ConnectionId,
        row_id: Option<String>,
        is_editing: bool,
    },

    /// Server -> Client: point-in-time room membership, unicast to a
    /// joining connection when the room already had members. Never
    /// contains the joiner's own entry.
    IncidentStateSnapshot {
        incident_id: IncidentId,
        entries: BTreeMap<ConnectionId, PresenceEntry>,
    },

    /// Server -> Client: protocol or handshake error. Presence races are
    /// never surfaced this way — they are dropped server-side.
    Error { code: String, message: String, retryable: bool },
}
