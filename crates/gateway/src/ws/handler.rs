use super::session::ConnectionRegistry;
use crate::auth::session::{AuthRejection, SessionStore};
use crate::error::{
    request_id_from_headers_or_generate, with_request_id_scope, ErrorCode, GatewayError,
};
use crate::metrics;
use crate::presence::PresenceRegistry;
use crate::protocol;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use vigil_common::protocol::ws::WsMessage;
use vigil_common::types::{ConnectionId, Identity, IncidentId};

pub(crate) const HEARTBEAT_INTERVAL_MS: u32 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const MAX_FRAME_BYTES: u32 = 65_536;

/// Everything a connection handler needs, constructed once at startup
/// and injected — nothing here is ambient or global, so tests build
/// isolated instances.
#[derive(Clone)]
pub struct GatewayState {
    pub presence: PresenceRegistry,
    pub connections: ConnectionRegistry,
    pub session_store: SessionStore,
}

impl GatewayState {
    pub fn new(session_store: SessionStore) -> Self {
        Self {
            presence: PresenceRegistry::default(),
            connections: ConnectionRegistry::default(),
            session_store,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpgradeParams {
    /// Session credential, for clients that cannot set headers on the
    /// WebSocket request. The Authorization header wins when both exist.
    #[serde(default)]
    token: Option<String>,
    /// Protocol version; absent means current.
    #[serde(default)]
    protocol: Option<String>,
}

pub fn router(state: GatewayState) -> Router {
    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(state)
}

pub async fn ws_upgrade(
    State(state): State<GatewayState>,
    Query(params): Query<UpgradeParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if let Some(version) = params.protocol.as_deref() {
        if let Err(upgrade_error) = protocol::require_supported(version) {
            return upgrade_error.into_response();
        }
    }

    let Some(credential) =
        bearer_token_from_headers(&headers).map(ToOwned::to_owned).or(params.token)
    else {
        metrics::increment_connections_rejected();
        return GatewayError::from_code(ErrorCode::AuthMissingCredential).into_response();
    };

    let identity = match state.session_store.resolve_session(&credential).await {
        Ok(Ok(identity)) => identity,
        Ok(Err(rejection)) => {
            metrics::increment_connections_rejected();
            debug!(reason = %rejection, "refusing websocket handshake");
            let code = match rejection {
                AuthRejection::UnknownSession => ErrorCode::AuthInvalidSession,
                AuthRejection::Expired => ErrorCode::AuthSessionExpired,
            };
            return GatewayError::from_code(code).into_response();
        }
        Err(error) => {
            error!(error = ?error, "session store lookup failed during handshake");
            return GatewayError::from_code(ErrorCode::InternalError).into_response();
        }
    };

    let connection_id = ConnectionId::new();
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES as usize).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(state, connection_id, identity, socket))
            .await;
    })
}

fn bearer_token_from_headers(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

async fn handle_socket(
    state: GatewayState,
    connection_id: ConnectionId,
    identity: Identity,
    mut socket: WebSocket,
) {
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<WsMessage>();
    state.connections.register(connection_id, identity, outbound_sender).await;
    metrics::adjust_active_connections(1);

    // Heartbeat: server pings every HEARTBEAT_INTERVAL_MS, disconnects
    // when a ping has gone unanswered for HEARTBEAT_TIMEOUT_MS. The
    // timeout is only armed once a ping is outstanding, so an idle but
    // responsive client is never dropped.
    let mut heartbeat_interval =
        tokio::time::interval(std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS as u64));
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_ping: Option<Instant> = None;
    let mut last_pong = Instant::now();
    let heartbeat_timeout = std::time::Duration::from_millis(HEARTBEAT_TIMEOUT_MS);

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if heartbeat_expired(last_ping, last_pong, heartbeat_timeout) {
                    warn!(connection_id = %connection_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
                last_ping = Some(Instant::now());
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_message) => {
                        if send_ws_message(&mut socket, &outbound_message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        let inbound = match serde_json::from_str::<WsMessage>(&raw_message) {
                            Ok(message) => message,
                            Err(_) => {
                                if send_ws_message(
                                    &mut socket,
                                    &WsMessage::Error {
                                        code: "PRESENCE_INVALID_MESSAGE".to_string(),
                                        message: "invalid websocket frame payload".to_string(),
                                        retryable: false,
                                    },
                                )
                                .await
                                .is_err()
                                {
                                    break;
                                }
                                continue;
                            }
                        };

                        match inbound {
                            WsMessage::JoinIncident { incident_id } => {
                                metrics::record_ws_message("join_incident");
                                handle_join(&state, connection_id, &incident_id).await;
                            }
                            WsMessage::LeaveIncident { incident_id } => {
                                metrics::record_ws_message("leave_incident");
                                handle_leave(&state, connection_id, &incident_id).await;
                            }
                            WsMessage::FocusChange { incident_id, row_id, is_editing } => {
                                metrics::record_ws_message("focus_change");
                                handle_focus_change(
                                    &state,
                                    connection_id,
                                    &incident_id,
                                    row_id,
                                    is_editing,
                                )
                                .await;
                            }
                            _ => {
                                if send_ws_message(
                                    &mut socket,
                                    &WsMessage::Error {
                                        code: "PRESENCE_UNSUPPORTED_MESSAGE".to_string(),
                                        message: "message type is not accepted from clients"
                                            .to_string(),
                                        retryable: false,
                                    },
                                )
                                .await
                                .is_err()
                                {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }

    sweep_disconnect(&state, connection_id).await;
    state.connections.unregister(connection_id).await;
    metrics::adjust_active_connections(-1);
}

/// Whether the connection has missed its heartbeat deadline.
///
/// True only when a ping is outstanding (sent, and no pong received
/// since) and the timeout has elapsed since that ping. Before the first
/// ping there is nothing to miss, whatever the connection's age.
fn heartbeat_expired(
    last_ping: Option<Instant>,
    last_pong: Instant,
    timeout: std::time::Duration,
) -> bool {
    match last_ping {
        Some(pinged_at) => last_pong < pinged_at && pinged_at.elapsed() > timeout,
        None => false,
    }
}

async fn send_ws_message(socket: &mut WebSocket, message: &WsMessage) -> Result<(), ()> {
    let encoded = serde_json::to_string(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

/// Process a join: commit the registry mutation, then notify.
///
/// The joined broadcast goes to every member including the joiner (a
/// confirmed echo of its own state); the reconciliation snapshot is
/// unicast to the joiner alone, and only when the room already had
/// members. A duplicate join re-echoes the live entry to the sender
/// without disturbing the room.
pub(crate) async fn handle_join(
    state: &GatewayState,
    connection_id: ConnectionId,
    incident_id: &IncidentId,
) {
    let Some(identity) = state.connections.identity(connection_id).await else {
        debug!(connection_id = %connection_id, "join from a connection that is shutting down");
        return;
    };

    let outcome = state.presence.join(incident_id, connection_id, &identity).await;

    if !outcome.newly_joined {
        let _ = state
            .connections
            .send_to_connection(
                connection_id,
                WsMessage::UserJoinedIncident {
                    incident_id: incident_id.clone(),
                    entry: outcome.entry,
                },
            )
            .await;
        return;
    }

    state
        .connections
        .broadcast_to_room(
            &state.presence,
            incident_id,
            WsMessage::UserJoinedIncident {
                incident_id: incident_id.clone(),
                entry: outcome.entry,
            },
        )
        .await;

    if !outcome.prior_members.is_empty() {
        let _ = state
            .connections
            .send_to_connection(
                connection_id,
                WsMessage::IncidentStateSnapshot {
                    incident_id: incident_id.clone(),
                    entries: outcome.prior_members,
                },
            )
            .await;
    }
}

/// Process an explicit leave. The departure notice goes to the members
/// left in the room; the registry mutation already removed the leaver,
/// so dispatch-time membership excludes it by construction.
pub(crate) async fn handle_leave(
    state: &GatewayState,
    connection_id: ConnectionId,
    incident_id: &IncidentId,
) {
    if state.presence.leave(incident_id, connection_id).await.is_none() {
        metrics::increment_presence_race();
        debug!(
            connection_id = %connection_id,
            incident_id = %incident_id,
            "leave for a room the connection is no longer in"
        );
        return;
    }

    state
        .connections
        .broadcast_to_room_excluding(
            &state.presence,
            incident_id,
            WsMessage::UserLeftIncident { incident_id: incident_id.clone(), connection_id },
            connection_id,
        )
        .await;
}

/// Process a focus change. A `None` from the registry means the frame
/// lost a race with a leave or disconnect; it is dropped without any
/// client-visible effect.
pub(crate) async fn handle_focus_change(
    state: &GatewayState,
    connection_id: ConnectionId,
    incident_id: &IncidentId,
    row_id: Option<String>,
    is_editing: bool,
) {
    let Some(entry) = state
        .presence
        .update_focus(incident_id, connection_id, row_id, is_editing)
        .await
    else {
        metrics::increment_presence_race();
        debug!(
            connection_id = %connection_id,
            incident_id = %incident_id,
            "focus change for an entry that no longer exists"
        );
        return;
    };

    state
        .connections
        .broadcast_to_room(
            &state.presence,
            incident_id,
            WsMessage::UserFocusedRow {
                incident_id: incident_id.clone(),
                connection_id,
                row_id: entry.focused_row_id,
                is_editing: entry.is_editing,
            },
        )
        .await;
}

/// Disconnect sweep, run exactly once when a socket loop exits for any
/// reason. Idempotent: a repeat sweep removes nothing and notifies
/// nobody.
pub(crate) async fn sweep_disconnect(state: &GatewayState, connection_id: ConnectionId) {
    let vacated = state.presence.remove_connection_from_all_rooms(connection_id).await;
    for (incident_id, _entry) in vacated {
        state
            .connections
            .broadcast_to_room_excluding(
                &state.presence,
                &incident_id,
                WsMessage::UserLeftIncident { incident_id: incident_id.clone(), connection_id },
                connection_id,
            )
            .await;
    }
}
