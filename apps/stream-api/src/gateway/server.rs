//! WebSocket upgrade handler and per-connection event loop.
//!
//! A connection must authenticate with a first-frame IDENTIFY before any
//! other event is processed; everything after that flows through
//! [`handler::handle_request`] with a per-request ack, while room
//! broadcasts arrive via the fanout hub and are filtered locally.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::time;

use crate::auth::jwt;
use crate::AppState;

use super::events::{
    ClientMessage, EventName, GatewayMessage, HeartbeatPayload, IdentifyPayload, OP_HEARTBEAT,
    OP_IDENTIFY, OP_REQUEST,
};
use super::fanout::{BroadcastPayload, Scope};
use super::handler;
use super::session::Session;

/// Close codes (4000-range for application-level).
const CLOSE_UNKNOWN_ERROR: u16 = 4000;
const CLOSE_UNKNOWN_OPCODE: u16 = 4001;
const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
const CLOSE_AUTH_FAILED: u16 = 4004;
const CLOSE_RATE_LIMITED: u16 = 4008;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Heartbeat interval advertised to clients in the ready payload (ms).
pub const HEARTBEAT_INTERVAL_MS: u64 = 25_000;

/// Timeout for receiving IDENTIFY after connection (seconds).
const IDENTIFY_TIMEOUT_SECS: u64 = 10;

/// Per-identity connection attempts per window. Fails open if the cache is
/// unavailable.
const CONN_RATE_LIMIT: i64 = 10;
const CONN_RATE_WINDOW_SECS: u64 = 60;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Step 1: the first frame must be IDENTIFY, within the timeout.
    let identify_result = time::timeout(Duration::from_secs(IDENTIFY_TIMEOUT_SECS), async {
        while let Some(msg) = ws_rx.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(?e, "ws read error during identify");
                    return Err((CLOSE_UNKNOWN_ERROR, "read error"));
                }
            };

            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => return Err((CLOSE_UNKNOWN_ERROR, "client closed")),
                Message::Ping(_) | Message::Pong(_) => continue,
                _ => continue,
            };

            let client_msg: ClientMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(_) => return Err((CLOSE_UNKNOWN_ERROR, "Invalid JSON")),
            };

            if client_msg.op != OP_IDENTIFY {
                return Err((CLOSE_NOT_AUTHENTICATED, "Expected IDENTIFY"));
            }

            let payload: IdentifyPayload = serde_json::from_value(client_msg.d)
                .map_err(|_| (CLOSE_UNKNOWN_ERROR, "invalid identify payload"))?;
            return Ok(payload);
        }
        Err((CLOSE_UNKNOWN_ERROR, "connection closed before identify"))
    })
    .await;

    let payload = match identify_result {
        Ok(Ok(payload)) => payload,
        Ok(Err((code, reason))) => {
            tracing::debug!(%reason, "initial handshake failed");
            let _ = send_close(&mut ws_tx, code, reason).await;
            return;
        }
        Err(_timeout) => {
            let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Handshake timeout").await;
            return;
        }
    };

    // Step 2: authenticate before any event handler runs.
    let (mut session, ready_msg) = match handle_identify(&state, payload).await {
        Ok(result) => result,
        Err((code, reason)) => {
            tracing::debug!(%reason, "identify failed");
            let _ = send_close(&mut ws_tx, code, reason).await;
            return;
        }
    };

    tracing::info!(
        conn_id = %session.conn_id,
        user_id = %session.user_id,
        username = %session.username,
        "gateway session established"
    );

    let ready_json = serde_json::to_string(&ready_msg).expect("serialize ready");
    if ws_tx.send(Message::Text(ready_json.into())).await.is_err() {
        handler::handle_disconnect(&state, &mut session).await;
        return;
    }

    // Subscribe before entering the loop so nothing dispatched after the
    // ready is missed.
    let broadcast_rx = state.broadcast.subscribe();
    run_session(&state, &mut session, ws_tx, ws_rx, broadcast_rx).await;

    // An abrupt close takes the same teardown path as an explicit
    // leave-room; both tolerate running twice.
    handler::handle_disconnect(&state, &mut session).await;

    tracing::info!(
        conn_id = %session.conn_id,
        user_id = %session.user_id,
        "gateway session ended"
    );
}

/// Verify the token, rate-check the connect, and build the session plus its
/// ready message.
async fn handle_identify(
    state: &AppState,
    payload: IdentifyPayload,
) -> Result<(Session, GatewayMessage), (u16, &'static str)> {
    let claims = jwt::verify(&state.config.jwt_secret, &payload.token)
        .map_err(|_| (CLOSE_AUTH_FAILED, "Invalid or expired token"))?;

    // Per-identity connect rate. Fails open on a cache outage.
    let rate_key = format!("conn_rate:{}", claims.sub);
    if let Some(count) = state
        .presence
        .incr_with_window(&rate_key, CONN_RATE_WINDOW_SECS)
        .await
    {
        if count > CONN_RATE_LIMIT {
            return Err((CLOSE_RATE_LIMITED, "Too many connection attempts"));
        }
    }

    let conn_id = beacon_common::id::prefixed_ulid(beacon_common::id::prefix::CONNECTION);
    state.presence.mark_online(&claims.sub, &conn_id).await;

    let mut session = Session::new(conn_id, claims.sub, claims.username);
    let seq = session.next_seq();
    let ready_msg = GatewayMessage::dispatch(
        EventName::READY,
        seq,
        serde_json::json!({
            "sessionId": session.conn_id,
            "user": {
                "id": session.user_id,
                "username": session.username,
            },
            "heartbeatInterval": HEARTBEAT_INTERVAL_MS,
        }),
    );

    Ok((session, ready_msg))
}

/// Main session event loop: handle client requests, forward broadcasts,
/// enforce the heartbeat.
async fn run_session(
    state: &AppState,
    session: &mut Session,
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut ws_rx: futures_util::stream::SplitStream<WebSocket>,
    mut broadcast_rx: broadcast::Receiver<std::sync::Arc<BroadcastPayload>>,
) {
    // Heartbeat deadline: client must heartbeat within 1.5× the interval.
    let heartbeat_deadline = Duration::from_millis(HEARTBEAT_INTERVAL_MS * 3 / 2);
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            // Client sends us a message.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                                break;
                            }
                        };

                        match client_msg.op {
                            OP_HEARTBEAT => {
                                got_heartbeat = true;
                                let payload: HeartbeatPayload =
                                    serde_json::from_value(client_msg.d).unwrap_or(HeartbeatPayload { seq: 0 });
                                let ack = GatewayMessage::heartbeat_ack(payload.seq);
                                let json = serde_json::to_string(&ack).expect("serialize ack");
                                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                            OP_REQUEST => {
                                let Some(event) = client_msg.t.as_deref() else {
                                    let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Missing event name").await;
                                    break;
                                };
                                let nonce = client_msg.n.unwrap_or(0);

                                let result =
                                    handler::handle_request(state, session, event, client_msg.d).await;

                                let ack = GatewayMessage::ack(nonce, result);
                                let json = serde_json::to_string(&ack).expect("serialize ack");
                                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                            OP_IDENTIFY => {
                                // Already identified.
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Already identified").await;
                                break;
                            }
                            _ => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_OPCODE, "Unknown opcode").await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, conn_id = %session.conn_id, "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            // Broadcast event from the fanout hub.
            result = broadcast_rx.recv() => {
                match result {
                    Ok(payload) => {
                        if !should_deliver(&payload, session) {
                            continue;
                        }

                        let seq = session.next_seq();
                        let msg = GatewayMessage::dispatch(payload.event_name, seq, payload.data.clone());
                        let json = serde_json::to_string(&msg).expect("serialize dispatch");
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(
                            conn_id = %session.conn_id,
                            skipped = n,
                            "gateway session lagged behind broadcast"
                        );
                        // Continue — we just drop the missed events.
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }

            // Heartbeat timeout check.
            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(
                        conn_id = %session.conn_id,
                        "heartbeat timeout — closing connection"
                    );
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                got_heartbeat = false;
            }
        }
    }
}

/// Whether a broadcast payload is addressed to this session.
fn should_deliver(payload: &BroadcastPayload, session: &Session) -> bool {
    match &payload.scope {
        Scope::Room(room_id) => session.room_id() == Some(room_id.as_str()),
        Scope::Global { exclude } => exclude.as_deref() != Some(session.conn_id.as_str()),
        Scope::Conn(conn_id) => conn_id == &session.conn_id,
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
