// Live connection registry and broadcast dispatch.
//
// Holds one outbound queue per connection. Room membership is never
// cached here — the presence registry is the single source of truth, and
// every room broadcast reads it at the moment of dispatch. Delivery is
// fire-and-forget: a closed queue is counted and skipped, never retried,
// and never fails the registry mutation that triggered the send.

use crate::metrics;
use crate::presence::PresenceRegistry;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{mpsc, RwLock};
use tracing::warn;
use vigil_common::protocol::ws::WsMessage;
use vigil_common::types::{ConnectionId, Identity, IncidentId};

#[derive(Debug, Clone)]
struct ConnectionRecord {
    identity: Identity,
    outbound: mpsc::UnboundedSender<WsMessage>,
}

/// connection_id -> (identity, outbound sender).
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, ConnectionRecord>>>,
}

impl ConnectionRegistry {
    pub async fn register(
        &self,
        connection_id: ConnectionId,
        identity: Identity,
        outbound: mpsc::UnboundedSender<WsMessage>,
    ) {
        self.connections
            .write()
            .await
            .insert(connection_id, ConnectionRecord { identity, outbound });
    }

    pub async fn unregister(&self, connection_id: ConnectionId) {
        self.connections.write().await.remove(&connection_id);
    }

    pub async fn identity(&self, connection_id: ConnectionId) -> Option<Identity> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|record| record.identity.clone())
    }

    /// Queue a message for a single connection. Returns false when the
    /// connection is gone or its socket task has shut down.
    pub async fn send_to_connection(
        &self,
        connection_id: ConnectionId,
        message: WsMessage,
    ) -> bool {
        let sender = {
            let guard = self.connections.read().await;
            guard.get(&connection_id).map(|record| record.outbound.clone())
        };
        match sender {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Fan a message out to every current member of an incident room.
    ///
    /// Membership is read from the presence registry at dispatch time.
    /// Returns the number of successful queue pushes.
    pub async fn broadcast_to_room(
        &self,
        registry: &PresenceRegistry,
        incident_id: &IncidentId,
        message: WsMessage,
    ) -> usize {
        self.dispatch(registry, incident_id, message, None).await
    }

    /// Room fan-out that skips one connection (the subject of a leave or
    /// disconnect, which must not receive its own departure notice).
    pub async fn broadcast_to_room_excluding(
        &self,
        registry: &PresenceRegistry,
        incident_id: &IncidentId,
        message: WsMessage,
        exclude: ConnectionId,
    ) -> usize {
        self.dispatch(registry, incident_id, message, Some(exclude)).await
    }

    async fn dispatch(
        &self,
        registry: &PresenceRegistry,
        incident_id: &IncidentId,
        message: WsMessage,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let members = registry.members(incident_id).await;

        let mut recipients = Vec::new();
        {
            let guard = self.connections.read().await;
            for member_id in members {
                if Some(member_id) == exclude {
                    continue;
                }
                if let Some(record) = guard.get(&member_id) {
                    recipients.push((member_id, record.outbound.clone()));
                }
            }
        }

        let mut sent_count = 0;
        let mut failed_count = 0u64;
        for (member_id, recipient) in recipients {
            if recipient.send(message.clone()).is_ok() {
                sent_count += 1;
            } else {
                failed_count += 1;
                warn!(
                    connection_id = %member_id,
                    incident_id = %incident_id,
                    "dropping broadcast for closed connection"
                );
            }
        }
        if failed_count > 0 {
            metrics::increment_broadcast_failures(failed_count);
        }

        sent_count
    }
}
