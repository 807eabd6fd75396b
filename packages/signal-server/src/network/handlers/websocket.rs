//! The WebSocket upgrade handler and per-connection read/write loop.
//!
//! This is where the transport-agnostic [`crate::handler::ProtocolHandler`]
//! meets an actual axum `WebSocket`. One task owns the connection end to
//! end: it reads frames, feeds them to the handler, and drains the
//! connection's outbound channel (fed by both its own replies and relays
//! from the peer's task) into the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use super::AppState;
use crate::connection::{ConnectionId, OutboundMessage as Frame};
use crate::error::ErrorCode;
use crate::handler::{close_code_for, HandlerDeps, ProtocolHandler};

/// axum's `WebSocketUpgrade::max_message_size` reports an oversized frame as
/// a plain `axum::Error` with no dedicated variant, so the only way to
/// distinguish it from a transport-level read failure is its message text.
fn is_message_too_large(err: &axum::Error) -> bool {
    let msg = err.to_string();
    msg.contains("too large") || msg.contains("too long") || msg.contains("message size")
}

/// `GET /ws` -- upgrades the connection after admission checks: a
/// connection-count breach rejects the new connection at accept time.
pub async fn ws_upgrade_handler(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if state.hub.count() >= state.config.connection_cap {
        metrics::counter!(crate::metrics::CONNECTIONS_REJECTED_TOTAL).increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "connection cap reached").into_response();
    }
    if !state.rate_limiter.try_acquire_connection(remote_addr.ip()) {
        metrics::counter!(crate::metrics::CONNECTIONS_REJECTED_TOTAL).increment(1);
        return (StatusCode::TOO_MANY_REQUESTS, "too many connections from this address")
            .into_response();
    }

    metrics::counter!(crate::metrics::CONNECTIONS_ACCEPTED_TOTAL).increment(1);
    ws.max_message_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, remote_addr, state))
}

/// Spawns the cleanup that must run no matter how the connection ends --
/// normal close, fatal protocol error, liveness timeout, or a panic inside
/// `handle_socket` itself. A `Drop`-triggered spawn is the only way to get
/// that last case for free without threading a fallible cleanup call
/// through every early-return path -- transport connections must be closed
/// on every exit path, including panics, and registry entries must be
/// cleaned up before the connection is closed.
struct ConnectionCleanup {
    connection_id: ConnectionId,
    remote_ip: std::net::IpAddr,
    deps: HandlerDeps,
    handler: Option<Arc<tokio::sync::Mutex<ProtocolHandler>>>,
}

impl Drop for ConnectionCleanup {
    fn drop(&mut self) {
        let connection_id = self.connection_id;
        let remote_ip = self.remote_ip;
        let deps = self.deps.clone();
        let handler = self.handler.take();
        tokio::spawn(async move {
            if let Some(handler) = handler {
                handler.lock().await.handle_disconnect(&deps).await;
            }
            deps.hub.remove(connection_id);
            deps.rate_limiter.release_connection(remote_ip);
            metrics::gauge!(crate::metrics::CONNECTIONS_LIVE).decrement(1.0);
        });
    }
}

async fn handle_socket(socket: WebSocket, remote_addr: SocketAddr, state: AppState) {
    let deps = HandlerDeps {
        registry: Arc::clone(&state.registry),
        hub: Arc::clone(&state.hub),
        rate_limiter: Arc::clone(&state.rate_limiter),
        diagnostics: Arc::clone(&state.diagnostics),
        timestamp_skew_ms: state.config.timestamp_skew_ms,
        slow_peer_stall: state.config.slow_peer_stall,
        session_ttl: state.config.session_ttl,
    };

    let (connection_handle, mut outbound_rx) =
        state.hub.register(remote_addr, state.config.outbound_channel_capacity);
    let connection_id = connection_handle.id;
    metrics::gauge!(crate::metrics::CONNECTIONS_LIVE).increment(1.0);

    let handler = Arc::new(tokio::sync::Mutex::new(ProtocolHandler::new(
        connection_id,
        remote_addr.ip(),
    )));
    let _cleanup = ConnectionCleanup {
        connection_id,
        remote_ip: remote_addr.ip(),
        deps: deps.clone(),
        handler: Some(Arc::clone(&handler)),
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let heartbeat_timeout = state.config.heartbeat_timeout;
    let mut last_activity = tokio::time::Instant::now();
    let mut heartbeat = tokio::time::interval(heartbeat_timeout / 3);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            biased;

            maybe_out = outbound_rx.recv() => {
                match maybe_out {
                    Some(Frame::Text(text)) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Frame::Close(code, reason)) => {
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                            .await;
                        break;
                    }
                    None => break,
                }
            }

            maybe_msg = ws_rx.next() => {
                let Some(maybe_msg) = maybe_msg else { break };
                let msg = match maybe_msg {
                    Ok(msg) => msg,
                    Err(e) if is_message_too_large(&e) => {
                        warn!(?connection_id, "oversized frame, closing connection");
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code_for(ErrorCode::MessageTooLarge),
                                reason: "message too large".into(),
                            })))
                            .await;
                        break;
                    }
                    Err(_) => break,
                };
                last_activity = tokio::time::Instant::now();
                match msg {
                    Message::Text(text) => {
                        let now = crate::sweeper::now_ms();
                        let mut handler = handler.lock().await;
                        if let Err(close) = handler.handle_text(text.as_str(), now, &connection_handle, &deps).await {
                            let _ = ws_tx
                                .send(Message::Close(Some(CloseFrame {
                                    code: close.code,
                                    reason: close.reason.into(),
                                })))
                                .await;
                            break;
                        }
                    }
                    // Binary frames carry the separate file-transfer channel,
                    // not signaling traffic; the server isn't a party to it.
                    Message::Binary(_) => debug!(?connection_id, "ignoring binary frame"),
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(_) => break,
                }
            }

            _ = heartbeat.tick() => {
                if last_activity.elapsed() > heartbeat_timeout {
                    warn!(?connection_id, "liveness timeout, closing connection");
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: 1001,
                            reason: "liveness timeout".into(),
                        })))
                        .await;
                    break;
                }
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
