// Presence registry (who is viewing which incident, and which row).
//
// The only shared mutable state in the gateway. Every operation takes
// the write lock for its full duration, so any two concurrent operations
// on the same room are linearized; none of them performs I/O or awaits
// unrelated work while holding the guard. Broadcasts happen after the
// guard is dropped.

use crate::metrics;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use vigil_common::types::{ConnectionId, Identity, IncidentId, PresenceEntry};

/// Incident room -> (connection -> presence entry).
///
/// Rooms are created lazily on first join and removed by the operation
/// that empties them; an empty room never persists in the map.
#[derive(Debug, Clone, Default)]
pub struct PresenceRegistry {
    rooms: Arc<RwLock<HashMap<IncidentId, HashMap<ConnectionId, PresenceEntry>>>>,
}

/// Outcome of a join: the entry plus what the room looked like just
/// before the join committed, for the reconciliation snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    pub entry: PresenceEntry,
    /// Entries present before this join, excluding the joiner. Empty for
    /// a fresh room and for an idempotent re-join of a solo occupant.
    pub prior_members: BTreeMap<ConnectionId, PresenceEntry>,
    /// False when the connection already had an entry in the room.
    pub newly_joined: bool,
}

impl PresenceRegistry {
    /// Add a connection to an incident room, creating the room if needed.
    ///
    /// Idempotent: a second join for the same (incident, connection) pair
    /// returns the existing entry unchanged.
    pub async fn join(
        &self,
        incident_id: &IncidentId,
        connection_id: ConnectionId,
        identity: &Identity,
    ) -> JoinOutcome {
        let mut guard = self.rooms.write().await;
        let room = guard.entry(incident_id.clone()).or_default();

        let prior_members: BTreeMap<ConnectionId, PresenceEntry> = room
            .iter()
            .filter(|(member_id, _)| **member_id != connection_id)
            .map(|(member_id, entry)| (*member_id, entry.clone()))
            .collect();

        if let Some(existing) = room.get(&connection_id) {
            return JoinOutcome { entry: existing.clone(), prior_members, newly_joined: false };
        }

        let entry = PresenceEntry::joined(connection_id, identity);
        room.insert(connection_id, entry.clone());
        let room_count = guard.len() as i64;
        drop(guard);
        metrics::set_active_rooms(room_count);

        JoinOutcome { entry, prior_members, newly_joined: true }
    }

    /// Remove a connection from a room, deleting the room if it empties.
    ///
    /// Returns `None` when the connection was never in the room — a
    /// benign race with a prior leave or disconnect, not an error.
    pub async fn leave(
        &self,
        incident_id: &IncidentId,
        connection_id: ConnectionId,
    ) -> Option<PresenceEntry> {
        let mut guard = self.rooms.write().await;
        let room = guard.get_mut(incident_id)?;
        let removed = room.remove(&connection_id);
        if removed.is_some() && room.is_empty() {
            guard.remove(incident_id);
        }
        let room_count = guard.len() as i64;
        drop(guard);
        if removed.is_some() {
            metrics::set_active_rooms(room_count);
        }
        removed
    }

    /// Set a connection's focused row, keeping `is_focused` derived.
    ///
    /// Returns `None` when the room or entry is gone — the focus frame
    /// lost a race with a leave/disconnect and is dropped by the caller.
    pub async fn update_focus(
        &self,
        incident_id: &IncidentId,
        connection_id: ConnectionId,
        row_id: Option<String>,
        is_editing: bool,
    ) -> Option<PresenceEntry> {
        let mut guard = self.rooms.write().await;
        let entry = guard.get_mut(incident_id)?.get_mut(&connection_id)?;
        entry.is_focused = row_id.is_some();
        entry.focused_row_id = row_id;
        entry.is_editing = is_editing;
        Some(entry.clone())
    }

    /// Point-in-time copy of a room's entries. Empty map for an unknown
    /// room; empty rooms are deleted, so the two cases coincide.
    pub async fn snapshot(
        &self,
        incident_id: &IncidentId,
    ) -> BTreeMap<ConnectionId, PresenceEntry> {
        let guard = self.rooms.read().await;
        guard
            .get(incident_id)
            .map(|room| room.iter().map(|(id, entry)| (*id, entry.clone())).collect())
            .unwrap_or_default()
    }

    /// Room membership as connection ids, read at dispatch time so a
    /// broadcast never targets a connection that already left.
    pub async fn members(&self, incident_id: &IncidentId) -> Vec<ConnectionId> {
        let guard = self.rooms.read().await;
        guard
            .get(incident_id)
            .map(|room| room.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Remove a connection from every room it occupies (disconnect sweep).
    ///
    /// Returns the vacated rooms with the removed entries. A second sweep
    /// for the same connection finds nothing and returns an empty list,
    /// which makes double-fired close events harmless.
    pub async fn remove_connection_from_all_rooms(
        &self,
        connection_id: ConnectionId,
    ) -> Vec<(IncidentId, PresenceEntry)> {
        let mut guard = self.rooms.write().await;
        let mut removed = Vec::new();
        guard.retain(|incident_id, room| {
            if let Some(entry) = room.remove(&connection_id) {
                removed.push((incident_id.clone(), entry));
            }
            !room.is_empty()
        });
        let room_count = guard.len() as i64;
        drop(guard);
        if !removed.is_empty() {
            metrics::set_active_rooms(room_count);
        }
        removed.sort_by(|(a, _), (b, _)| a.cmp(b));
        removed
    }

    /// Number of rooms currently held. Test and metrics helper.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Whether a room currently exists in the registry.
    pub async fn room_exists(&self, incident_id: &IncidentId) -> bool {
        self.rooms.read().await.contains_key(incident_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inc(id: &str) -> IncidentId {
        IncidentId::from(id)
    }

    fn avery() -> Identity {
        Identity { analyst_id: "an-1".into(), display_name: "Avery".into() }
    }

    fn blair() -> Identity {
        Identity { analyst_id: "an-2".into(), display_name: "Blair".into() }
    }

    // ── Join ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn first_join_creates_room_with_unfocused_entry() {
        let registry = PresenceRegistry::default();
        let x = ConnectionId::new();

        let outcome = registry.join(&inc("INC-1"), x, &avery()).await;

        assert!(outcome.newly_joined);
        assert!(outcome.prior_members.is_empty());
        assert!(outcome.entry.focused_row_id.is_none());
        assert!(!outcome.entry.is_focused);
        assert_eq!(registry.snapshot(&inc("INC-1")).await.len(), 1);
    }

    #[tokio::test]
    async fn second_member_join_reports_prior_members() {
        let registry = PresenceRegistry::default();
        let x = ConnectionId::new();
        let y = ConnectionId::new();
        registry.join(&inc("INC-1"), x, &avery()).await;

        let outcome = registry.join(&inc("INC-1"), y, &blair()).await;

        assert!(outcome.newly_joined);
        assert_eq!(outcome.prior_members.len(), 1);
        assert!(outcome.prior_members.contains_key(&x));
        assert!(!outcome.prior_members.contains_key(&y), "snapshot must exclude the joiner");
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let registry = PresenceRegistry::default();
        let x = ConnectionId::new();
        let first = registry.join(&inc("INC-1"), x, &avery()).await;
        registry
            .update_focus(&inc("INC-1"), x, Some("ROW-2".into()), false)
            .await
            .expect("entry should exist");

        let second = registry.join(&inc("INC-1"), x, &avery()).await;

        assert!(!second.newly_joined);
        assert_eq!(second.entry.focused_row_id.as_deref(), Some("ROW-2"));
        assert_ne!(second.entry, first.entry, "re-join returns the live entry, not a reset one");
        assert_eq!(registry.snapshot(&inc("INC-1")).await.len(), 1);
    }

    // ── Leave ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn leaving_last_member_removes_room() {
        let registry = PresenceRegistry::default();
        let x = ConnectionId::new();
        registry.join(&inc("INC-1"), x, &avery()).await;

        let removed = registry.leave(&inc("INC-1"), x).await;

        assert!(removed.is_some());
        assert!(!registry.room_exists(&inc("INC-1")).await);
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn leave_keeps_room_while_members_remain() {
        let registry = PresenceRegistry::default();
        let x = ConnectionId::new();
        let y = ConnectionId::new();
        registry.join(&inc("INC-1"), x, &avery()).await;
        registry.join(&inc("INC-1"), y, &blair()).await;

        registry.leave(&inc("INC-1"), x).await;

        assert!(registry.room_exists(&inc("INC-1")).await);
        let snapshot = registry.snapshot(&inc("INC-1")).await;
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key(&y));
    }

    #[tokio::test]
    async fn leave_unknown_connection_is_none_not_error() {
        let registry = PresenceRegistry::default();
        assert!(registry.leave(&inc("INC-1"), ConnectionId::new()).await.is_none());

        let x = ConnectionId::new();
        registry.join(&inc("INC-1"), x, &avery()).await;
        assert!(registry.leave(&inc("INC-1"), ConnectionId::new()).await.is_none());
        assert_eq!(registry.snapshot(&inc("INC-1")).await.len(), 1);
    }

    // ── Focus ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn update_focus_sets_row_and_derived_flag() {
        let registry = PresenceRegistry::default();
        let x = ConnectionId::new();
        registry.join(&inc("INC-1"), x, &avery()).await;

        let entry = registry
            .update_focus(&inc("INC-1"), x, Some("ROW-7".into()), false)
            .await
            .expect("entry should exist");
        assert_eq!(entry.focused_row_id.as_deref(), Some("ROW-7"));
        assert!(entry.is_focused);

        let entry = registry
            .update_focus(&inc("INC-1"), x, None, false)
            .await
            .expect("entry should exist");
        assert!(entry.focused_row_id.is_none());
        assert!(!entry.is_focused);
    }

    #[tokio::test]
    async fn update_focus_carries_editing_flag() {
        let registry = PresenceRegistry::default();
        let x = ConnectionId::new();
        registry.join(&inc("INC-1"), x, &avery()).await;

        let entry = registry
            .update_focus(&inc("INC-1"), x, Some("ROW-7".into()), true)
            .await
            .expect("entry should exist");
        assert!(entry.is_editing);

        let entry = registry
            .update_focus(&inc("INC-1"), x, Some("ROW-8".into()), false)
            .await
            .expect("entry should exist");
        assert!(!entry.is_editing, "omitting the flag clears editing state");
    }

    #[tokio::test]
    async fn update_focus_after_removal_is_noop() {
        let registry = PresenceRegistry::default();
        let z = ConnectionId::new();
        registry.join(&inc("INC-1"), z, &avery()).await;
        registry.remove_connection_from_all_rooms(z).await;

        let result = registry
            .update_focus(&inc("INC-1"), z, Some("ROW-1".into()), false)
            .await;
        assert!(result.is_none());
        assert!(!registry.room_exists(&inc("INC-1")).await);
    }

    #[tokio::test]
    async fn update_focus_unknown_room_is_noop() {
        let registry = PresenceRegistry::default();
        let result = registry
            .update_focus(&inc("INC-404"), ConnectionId::new(), Some("ROW-1".into()), false)
            .await;
        assert!(result.is_none());
    }

    // ── Snapshot / members ─────────────────────────────────────────

    #[tokio::test]
    async fn snapshot_is_point_in_time_copy() {
        let registry = PresenceRegistry::default();
        let x = ConnectionId::new();
        registry.join(&inc("INC-1"), x, &avery()).await;

        let before = registry.snapshot(&inc("INC-1")).await;
        registry
            .update_focus(&inc("INC-1"), x, Some("ROW-9".into()), false)
            .await
            .expect("entry should exist");

        assert!(before[&x].focused_row_id.is_none(), "copy must not observe later mutations");
        let after = registry.snapshot(&inc("INC-1")).await;
        assert_eq!(after[&x].focused_row_id.as_deref(), Some("ROW-9"));
    }

    #[tokio::test]
    async fn members_reflect_current_room_state() {
        let registry = PresenceRegistry::default();
        let x = ConnectionId::new();
        let y = ConnectionId::new();
        registry.join(&inc("INC-1"), x, &avery()).await;
        registry.join(&inc("INC-1"), y, &blair()).await;

        let mut members = registry.members(&inc("INC-1")).await;
        members.sort();
        let mut expected = vec![x, y];
        expected.sort();
        assert_eq!(members, expected);

        registry.leave(&inc("INC-1"), x).await;
        assert_eq!(registry.members(&inc("INC-1")).await, vec![y]);
    }

    // ── Disconnect sweep ───────────────────────────────────────────

    #[tokio::test]
    async fn sweep_removes_connection_from_every_room() {
        let registry = PresenceRegistry::default();
        let x = ConnectionId::new();
        let y = ConnectionId::new();
        registry.join(&inc("INC-A"), x, &avery()).await;
        registry.join(&inc("INC-B"), x, &avery()).await;
        registry.join(&inc("INC-B"), y, &blair()).await;

        let removed = registry.remove_connection_from_all_rooms(x).await;

        let vacated: Vec<&str> =
            removed.iter().map(|(incident, _)| incident.as_str()).collect();
        assert_eq!(vacated, vec!["INC-A", "INC-B"]);
        assert!(!registry.room_exists(&inc("INC-A")).await, "emptied room must be deleted");
        assert_eq!(registry.members(&inc("INC-B")).await, vec![y]);
    }

    #[tokio::test]
    async fn second_sweep_finds_nothing() {
        let registry = PresenceRegistry::default();
        let x = ConnectionId::new();
        registry.join(&inc("INC-A"), x, &avery()).await;

        assert_eq!(registry.remove_connection_from_all_rooms(x).await.len(), 1);
        assert!(registry.remove_connection_from_all_rooms(x).await.is_empty());
    }

    #[tokio::test]
    async fn sweep_does_not_touch_other_connections() {
        let registry = PresenceRegistry::default();
        let x = ConnectionId::new();
        let y = ConnectionId::new();
        registry.join(&inc("INC-A"), x, &avery()).await;
        registry.join(&inc("INC-A"), y, &blair()).await;

        registry.remove_connection_from_all_rooms(x).await;

        let snapshot = registry.snapshot(&inc("INC-A")).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[&y].display_name, "Blair");
    }

    // ── Concurrency ────────────────────────────────────────────────

    #[tokio::test]
    async fn concurrent_joins_and_sweeps_preserve_cardinality() {
        let registry = PresenceRegistry::default();
        let incident = inc("INC-HOT");
        let connections: Vec<ConnectionId> = (0..32).map(|_| ConnectionId::new()).collect();

        let mut tasks = Vec::new();
        for connection_id in &connections {
            let registry = registry.clone();
            let incident = incident.clone();
            let connection_id = *connection_id;
            tasks.push(tokio::spawn(async move {
                registry.join(&incident, connection_id, &avery()).await;
                registry
                    .update_focus(&incident, connection_id, Some("ROW-1".into()), false)
                    .await;
            }));
        }
        for task in tasks {
            task.await.expect("join task should not panic");
        }
        assert_eq!(registry.snapshot(&incident).await.len(), connections.len());

        let mut tasks = Vec::new();
        for connection_id in &connections {
            let registry = registry.clone();
            let connection_id = *connection_id;
            tasks.push(tokio::spawn(async move {
                registry.remove_connection_from_all_rooms(connection_id).await
            }));
        }
        let mut total_removed = 0;
        for task in tasks {
            total_removed += task.await.expect("sweep task should not panic").len();
        }

        assert_eq!(total_removed, connections.len(), "each entry is removed exactly once");
        assert_eq!(registry.room_count().await, 0);
    }
}
