//! The per-connection Protocol Handler state machine.
//!
//! Transport-agnostic on purpose: this module knows nothing about
//! WebSocket frames, only about envelopes, registry operations, and the
//! outbound messages a connection and its peer should receive. The axum
//! WebSocket glue in `network::handlers::ws` owns the actual read/write
//! loop and calls into [`ProtocolHandler`] once per inbound frame.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::connection::{ConnectionHandle, ConnectionHub, ConnectionId, OutboundMessage as Frame, SendError};
use crate::envelope::{
    build_relay_frame, message_type, CreateSessionPayload, InboundEnvelope, JoinSessionPayload,
    OutboundMessage, PeerDisconnectedPayload, PeerInfoPayload, PeerLeftPayload,
    SessionClosePayload, SessionCreatedPayload,
};
use crate::error::{ErrorCode, HandlerError, RegistryError};
use crate::ids::{ClientId, SessionId, Token, MAX_OPAQUE_FIELD_LEN};
use crate::rate_limit::{Action, RateLimiter};
use crate::session::{RemoveOutcome, SessionRegistry};

/// State of one connection's membership in the signaling protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    New,
    CreatorWaiting,
    /// Transient in the protocol's state table; the join transition moves a
    /// connection directly from `New` to `Paired`, so this state is never
    /// actually observed between two `handle_text` calls. Kept because the
    /// protocol is specified in terms of it.
    Joiner,
    Paired,
    Closed,
}

/// The close code and reason the transport loop should use to tear down
/// the connection after a fatal error or explicit session termination.
#[derive(Debug, Clone)]
pub struct CloseDirective {
    pub code: u16,
    pub reason: String,
}

pub(crate) fn close_code_for(code: ErrorCode) -> u16 {
    match code {
        ErrorCode::MessageTooLarge => 1009,
        ErrorCode::Internal => 1011,
        _ => 1002,
    }
}

/// Shared dependencies every `ProtocolHandler` needs. Cloned (cheaply, all
/// `Arc`s) into each per-connection task.
#[derive(Clone)]
pub struct HandlerDeps {
    pub registry: Arc<SessionRegistry>,
    pub hub: Arc<ConnectionHub>,
    pub rate_limiter: Arc<RateLimiter>,
    pub diagnostics: Arc<crate::metrics::DiagnosticCounters>,
    pub timestamp_skew_ms: i64,
    pub slow_peer_stall: Duration,
    pub session_ttl: Duration,
}

/// Per-connection protocol state machine.
pub struct ProtocolHandler {
    connection_id: ConnectionId,
    remote_addr: IpAddr,
    state: HandlerState,
    session_id: Option<SessionId>,
    client_id: Option<ClientId>,
}

impl ProtocolHandler {
    #[must_use]
    pub fn new(connection_id: ConnectionId, remote_addr: IpAddr) -> Self {
        Self {
            connection_id,
            remote_addr,
            state: HandlerState::New,
            session_id: None,
            client_id: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Processes one inbound text frame, driving registry mutations and
    /// relay dispatch. The caller's own reply channel is `self_handle`;
    /// frames to the peer (if any) are sent directly to the peer's
    /// connection handle looked up from `deps.hub`.
    ///
    /// # Errors
    ///
    /// Returns a [`CloseDirective`] when the connection must be closed:
    /// an unparsable frame, a slow-peer stall, or an internal failure.
    /// Client input and policy errors are reported via an `error` frame
    /// to `self_handle` and do not return `Err`.
    pub async fn handle_text(
        &mut self,
        raw: &str,
        now: i64,
        self_handle: &ConnectionHandle,
        deps: &HandlerDeps,
    ) -> Result<(), CloseDirective> {
        let envelope: InboundEnvelope = match serde_json::from_str(raw) {
            Ok(env) => env,
            Err(e) => {
                return Err(self.fatal(ErrorCode::InvalidMessage, format!("malformed envelope: {e}")));
            }
        };

        if (envelope.timestamp - now).abs() > deps.timestamp_skew_ms {
            self.send_error(self_handle, ErrorCode::InvalidTimestamp, "timestamp outside acceptable window", None);
            return Ok(());
        }

        let result = match envelope.kind.as_str() {
            message_type::CREATE_SESSION => self.on_create_session(&envelope, now, self_handle, deps).await,
            message_type::JOIN_SESSION => self.on_join_session(&envelope, now, self_handle, deps).await,
            t if message_type::RELAYABLE.contains(&t) => self.on_relay(&envelope, now, self_handle, deps).await,
            message_type::SESSION_CLOSE => self.on_session_close(&envelope, deps).await,
            _ => {
                self.send_error(self_handle, ErrorCode::UnknownMessageType, "unrecognized message type", None);
                Ok(())
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(HandlerError::Client(code)) => {
                self.send_error(self_handle, code, &format!("{code:?}"), None);
                Ok(())
            }
            Err(HandlerError::Fatal(code, msg)) => Err(self.fatal(code, msg)),
        }
    }

    /// Called when the transport closes or the liveness heartbeat times
    /// out. Looks up and removes this connection's membership and, if a
    /// peer remains, notifies it with `peer_disconnected`.
    pub async fn handle_disconnect(&mut self, deps: &HandlerDeps) {
        self.state = HandlerState::Closed;
        let Some((session_id, client_id, outcome)) = deps.registry.disconnect(self.connection_id) else {
            return;
        };
        if let RemoveOutcome::PeerStillPresent(peer) = outcome {
            if let Some(peer_handle) = deps.hub.get(peer.connection_id) {
                let msg = OutboundMessage::PeerDisconnected {
                    session_id,
                    payload: PeerDisconnectedPayload { peer_id: client_id },
                };
                send_frame_best_effort(&peer_handle, &msg);
            }
        }
    }

    fn fatal(&mut self, code: ErrorCode, message: String) -> CloseDirective {
        self.state = HandlerState::Closed;
        warn!(connection_id = ?self.connection_id, code = ?code, %message, "closing connection");
        CloseDirective { code: close_code_for(code), reason: message }
    }

    fn send_error(&self, self_handle: &ConnectionHandle, code: ErrorCode, message: &str, retry_after: Option<u64>) {
        let msg = OutboundMessage::Error {
            payload: crate::envelope::ErrorPayload { code, message: message.to_string(), retry_after },
        };
        send_frame_best_effort(self_handle, &msg);
    }

    async fn on_create_session(
        &mut self,
        envelope: &InboundEnvelope,
        now: i64,
        self_handle: &ConnectionHandle,
        deps: &HandlerDeps,
    ) -> Result<(), HandlerError> {
        if self.state != HandlerState::New {
            return Err(HandlerError::Client(ErrorCode::InvalidState));
        }

        if let Err(retry_after) = deps.rate_limiter.check_action(self.remote_addr, Action::CreateSession, now) {
            metrics::counter!(crate::metrics::RATE_LIMIT_REJECTIONS_TOTAL).increment(1);
            self.send_error(self_handle, ErrorCode::RateLimitExceeded, "session creation rate limit exceeded", Some(retry_after));
            return Ok(());
        }

        let payload: CreateSessionPayload =
            serde_json::from_str(envelope.payload.get()).map_err(|_| HandlerError::Client(ErrorCode::InvalidPayload))?;
        validate_opaque_field(&payload.client_id)?;
        validate_opaque_field(&payload.display_name)?;

        let session_id = SessionId::generate();
        let token = Token::generate();

        let created = deps
            .registry
            .create(session_id, token.clone(), now, deps.session_ttl)
            .map_err(|_| HandlerError::Client(ErrorCode::Internal))?;

        deps.registry
            .add_member(session_id, payload.client_id.clone(), payload.display_name, self.connection_id, now)
            .map_err(registry_error_to_handler)?;

        self.state = HandlerState::CreatorWaiting;
        self.session_id = Some(session_id);
        self.client_id = Some(payload.client_id);

        metrics::counter!(crate::metrics::SESSIONS_CREATED_TOTAL).increment(1);
        deps.diagnostics.record_session_created();

        let msg = OutboundMessage::SessionCreated {
            session_id,
            payload: SessionCreatedPayload { session_id, token: token.as_hex(), expires_at: created.expires_at },
        };
        send_frame_best_effort(self_handle, &msg);
        Ok(())
    }

    async fn on_join_session(
        &mut self,
        envelope: &InboundEnvelope,
        now: i64,
        self_handle: &ConnectionHandle,
        deps: &HandlerDeps,
    ) -> Result<(), HandlerError> {
        if self.state != HandlerState::New {
            return Err(HandlerError::Client(ErrorCode::InvalidState));
        }

        if let Err(retry_after) = deps.rate_limiter.check_action(self.remote_addr, Action::JoinSession, now) {
            metrics::counter!(crate::metrics::RATE_LIMIT_REJECTIONS_TOTAL).increment(1);
            self.send_error(self_handle, ErrorCode::RateLimitExceeded, "join rate limit exceeded", Some(retry_after));
            return Ok(());
        }

        let session_id = envelope
            .session_id
            .as_deref()
            .and_then(SessionId::from_hex)
            .ok_or(HandlerError::Client(ErrorCode::InvalidMessage))?;
        let payload: JoinSessionPayload =
            serde_json::from_str(envelope.payload.get()).map_err(|_| HandlerError::Client(ErrorCode::InvalidPayload))?;
        validate_opaque_field(&payload.client_id)?;
        validate_opaque_field(&payload.display_name)?;

        let presented = Token::from_hex(&payload.token).ok_or(HandlerError::Client(ErrorCode::InvalidToken))?;
        if !deps.registry.validate_token(session_id, &presented) {
            return Err(HandlerError::Client(ErrorCode::InvalidToken));
        }

        let outcome = deps
            .registry
            .add_member(session_id, payload.client_id.clone(), payload.display_name.clone(), self.connection_id, now)
            .map_err(registry_error_to_handler)?;

        let Some(peer) = outcome.peer else {
            // A session with zero members is deleted by the registry as
            // soon as it happens, so `add_member` succeeding with no peer
            // here would mean we just became that session's only member --
            // not a real "join". Unwind defensively; this should be
            // unreachable given the registry's own invariants.
            deps.registry.remove_member(session_id, &payload.client_id);
            return Err(HandlerError::Client(ErrorCode::SessionNotFound));
        };

        self.state = HandlerState::Paired;
        self.session_id = Some(session_id);
        self.client_id = Some(payload.client_id.clone());

        let joined = OutboundMessage::SessionJoined {
            session_id,
            payload: PeerInfoPayload { peer_id: peer.client_id.clone(), peer_display_name: peer.display_name.clone() },
        };
        send_frame_best_effort(self_handle, &joined);

        if let Some(peer_handle) = deps.hub.get(peer.connection_id) {
            let notice = OutboundMessage::PeerJoined {
                session_id,
                payload: PeerInfoPayload { peer_id: payload.client_id, peer_display_name: payload.display_name },
            };
            send_frame_best_effort(&peer_handle, &notice);
        }
        Ok(())
    }

    async fn on_relay(
        &mut self,
        envelope: &InboundEnvelope,
        now: i64,
        self_handle: &ConnectionHandle,
        deps: &HandlerDeps,
    ) -> Result<(), HandlerError> {
        if self.state != HandlerState::Paired {
            return Err(HandlerError::Client(ErrorCode::Unauthorized));
        }
        let (session_id, client_id) = (
            self.session_id.expect("Paired implies session_id is set"),
            self.client_id.clone().expect("Paired implies client_id is set"),
        );

        if let Err(retry_after) = deps.rate_limiter.check_action(self.remote_addr, Action::Message, now) {
            metrics::counter!(crate::metrics::RATE_LIMIT_REJECTIONS_TOTAL).increment(1);
            self.send_error(self_handle, ErrorCode::RateLimitExceeded, "message rate limit exceeded", Some(retry_after));
            return Ok(());
        }

        let from = envelope.from.as_deref().ok_or(HandlerError::Client(ErrorCode::InvalidMessage))?;
        let to = envelope.to.as_deref().ok_or(HandlerError::Client(ErrorCode::InvalidMessage))?;
        if from != client_id {
            return Err(HandlerError::Client(ErrorCode::Unauthorized));
        }

        let peer = deps.registry.get_peer(session_id, &client_id).ok_or(HandlerError::Client(ErrorCode::PeerNotFound))?;
        if peer.client_id != to {
            return Err(HandlerError::Client(ErrorCode::PeerNotFound));
        }

        let Some(peer_handle) = deps.hub.get(peer.connection_id) else {
            return Err(HandlerError::Client(ErrorCode::PeerNotFound));
        };

        let text = build_relay_frame(&envelope.kind, session_id, from, to, envelope.timestamp, &envelope.payload);

        match peer_handle.send_timeout(Frame::Text(text), deps.slow_peer_stall).await {
            Ok(()) => {
                metrics::counter!(crate::metrics::MESSAGES_RELAYED_TOTAL).increment(1);
                Ok(())
            }
            Err(crate::connection::SendError::Disconnected) => {
                debug!(connection_id = ?self.connection_id, "relay target already disconnected");
                Err(HandlerError::Client(ErrorCode::PeerNotFound))
            }
            Err(crate::connection::SendError::Timeout) => {
                metrics::counter!(crate::metrics::SLOW_PEER_CLOSES_TOTAL).increment(1);
                self.send_error(self_handle, ErrorCode::SlowPeer, "peer did not drain in time", None);
                let notice = OutboundMessage::Error {
                    payload: crate::envelope::ErrorPayload {
                        code: ErrorCode::SlowPeer,
                        message: "peer did not drain in time".to_string(),
                        retry_after: None,
                    },
                };
                send_frame_best_effort(&peer_handle, &notice);
                deps.registry.remove_member(session_id, &client_id);
                deps.registry.remove_member(session_id, &peer.client_id);
                Err(HandlerError::Fatal(ErrorCode::SlowPeer, "slow peer stall deadline exceeded".to_string()))
            }
        }
    }

    async fn on_session_close(
        &mut self,
        envelope: &InboundEnvelope,
        deps: &HandlerDeps,
    ) -> Result<(), HandlerError> {
        let (Some(session_id), Some(client_id)) = (self.session_id, self.client_id.clone()) else {
            return Err(HandlerError::Client(ErrorCode::InvalidState));
        };

        let reason = serde_json::from_str::<SessionClosePayload>(envelope.payload.get())
            .unwrap_or_default()
            .reason
            .unwrap_or_else(|| "peer closed the session".to_string());

        match deps.registry.remove_member(session_id, &client_id) {
            RemoveOutcome::PeerStillPresent(peer) => {
                if let Some(peer_handle) = deps.hub.get(peer.connection_id) {
                    let msg = OutboundMessage::PeerLeft {
                        session_id,
                        payload: PeerLeftPayload { peer_id: client_id, reason },
                    };
                    send_frame_best_effort(&peer_handle, &msg);
                }
            }
            RemoveOutcome::PeerAbsent | RemoveOutcome::SessionMissing => {}
        }

        self.state = HandlerState::Closed;
        Ok(())
    }
}

fn registry_error_to_handler(e: RegistryError) -> HandlerError {
    HandlerError::Client(e.into())
}

fn validate_opaque_field(s: &str) -> Result<(), HandlerError> {
    if s.is_empty() || s.len() > MAX_OPAQUE_FIELD_LEN {
        return Err(HandlerError::Client(ErrorCode::InvalidPayload));
    }
    Ok(())
}

fn send_frame_best_effort(handle: &ConnectionHandle, msg: &OutboundMessage) {
    match serde_json::to_string(msg) {
        Ok(text) => {
            if !handle.try_send(Frame::Text(text)) {
                debug!(connection_id = ?handle.id, "dropped outbound frame, channel full or closed");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize outbound message"),
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use clap::Parser;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::Config;
    use crate::connection::ConnectionHub;

    struct Client {
        handle: Arc<ConnectionHandle>,
        rx: mpsc::Receiver<Frame>,
        handler: ProtocolHandler,
    }

    impl Client {
        /// Drains every currently-queued outbound frame as parsed JSON.
        fn drain(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                if let Frame::Text(text) = frame {
                    out.push(serde_json::from_str(&text).unwrap());
                }
            }
            out
        }

        /// Drains and returns exactly one frame, panicking if none arrived.
        fn recv_one(&mut self) -> Value {
            let frames = self.drain();
            assert_eq!(frames.len(), 1, "expected exactly one outbound frame, got {frames:?}");
            frames.into_iter().next().unwrap()
        }
    }

    fn ip() -> IpAddr {
        "198.51.100.20".parse().unwrap()
    }

    fn deps() -> HandlerDeps {
        let config = Config::parse_from(["webrtc-signal-server"]);
        HandlerDeps {
            registry: Arc::new(SessionRegistry::new()),
            hub: Arc::new(ConnectionHub::new()),
            rate_limiter: Arc::new(RateLimiter::new(&config)),
            diagnostics: Arc::new(crate::metrics::DiagnosticCounters::default()),
            timestamp_skew_ms: config.timestamp_skew_ms,
            slow_peer_stall: config.slow_peer_stall,
            session_ttl: config.session_ttl,
        }
    }

    fn new_client(deps: &HandlerDeps) -> Client {
        let (handle, rx) = deps.hub.register("198.51.100.20:1".parse().unwrap(), 16);
        let id = handle.id;
        Client { handle, rx, handler: ProtocolHandler::new(id, ip()) }
    }

    fn create_session_msg(client_id: &str, display_name: &str, now: i64) -> String {
        json!({
            "type": "create_session",
            "timestamp": now,
            "payload": {"clientId": client_id, "displayName": display_name},
        })
        .to_string()
    }

    fn join_session_msg(session_id: &str, token: &str, client_id: &str, display_name: &str, now: i64) -> String {
        json!({
            "type": "join_session",
            "sessionId": session_id,
            "timestamp": now,
            "payload": {"token": token, "clientId": client_id, "displayName": display_name},
        })
        .to_string()
    }

    fn relay_msg(kind: &str, session_id: &str, from: &str, to: &str, payload: Value, now: i64) -> String {
        json!({
            "type": kind,
            "sessionId": session_id,
            "from": from,
            "to": to,
            "timestamp": now,
            "payload": payload,
        })
        .to_string()
    }

    /// Create -> join -> relay, with both notifications and the
    /// verbatim-payload guarantee checked end to end.
    #[tokio::test]
    async fn happy_pair_create_join_and_relay() {
        let deps = deps();
        let mut a = new_client(&deps);
        let mut b = new_client(&deps);

        a.handler
            .handle_text(&create_session_msg("A", "Alice", 1000), 1000, &a.handle, &deps)
            .await
            .unwrap();
        let created = a.recv_one();
        assert_eq!(created["type"], "session_created");
        let session_id = created["payload"]["sessionId"].as_str().unwrap().to_string();
        let token = created["payload"]["token"].as_str().unwrap().to_string();
        assert_eq!(a.handler.state(), HandlerState::CreatorWaiting);

        b.handler
            .handle_text(&join_session_msg(&session_id, &token, "B", "Bob", 2000), 2000, &b.handle, &deps)
            .await
            .unwrap();

        let joined = b.recv_one();
        assert_eq!(joined["type"], "session_joined");
        assert_eq!(joined["payload"]["peerId"], "A");
        assert_eq!(joined["payload"]["peerDisplayName"], "Alice");
        assert_eq!(b.handler.state(), HandlerState::Paired);

        let notice = a.recv_one();
        assert_eq!(notice["type"], "peer_joined");
        assert_eq!(notice["payload"]["peerId"], "B");
        assert_eq!(a.handler.state(), HandlerState::Paired);

        let sdp_payload = json!({"type": "offer", "sdp": "v=0..."});
        a.handler
            .handle_text(&relay_msg("offer", &session_id, "A", "B", sdp_payload.clone(), 3000), 3000, &a.handle, &deps)
            .await
            .unwrap();

        let relayed = b.recv_one();
        assert_eq!(relayed["type"], "offer");
        assert_eq!(relayed["payload"], sdp_payload);
        assert_eq!(relayed["from"], "A");
        assert_eq!(relayed["to"], "B");
        assert!(a.drain().is_empty());
    }

    /// A wrong token is rejected without touching membership or
    /// notifying the creator.
    #[tokio::test]
    async fn wrong_token_is_rejected_without_side_effects() {
        let deps = deps();
        let mut a = new_client(&deps);
        let mut c = new_client(&deps);

        a.handler.handle_text(&create_session_msg("A", "Alice", 0), 0, &a.handle, &deps).await.unwrap();
        let created = a.recv_one();
        let session_id = created["payload"]["sessionId"].as_str().unwrap().to_string();
        let bogus_token = "00".repeat(32);

        c.handler
            .handle_text(&join_session_msg(&session_id, &bogus_token, "C", "Carl", 100), 100, &c.handle, &deps)
            .await
            .unwrap();

        let err = c.recv_one();
        assert_eq!(err["type"], "error");
        assert_eq!(err["payload"]["code"], "INVALID_TOKEN");
        assert!(a.drain().is_empty());
        assert_eq!(c.handler.state(), HandlerState::New);
    }

    /// A third client with the *correct* token cannot join a full session.
    #[tokio::test]
    async fn third_client_cannot_join_full_session() {
        let deps = deps();
        let mut a = new_client(&deps);
        let mut b = new_client(&deps);
        let mut c = new_client(&deps);

        a.handler.handle_text(&create_session_msg("A", "Alice", 0), 0, &a.handle, &deps).await.unwrap();
        let created = a.recv_one();
        let session_id = created["payload"]["sessionId"].as_str().unwrap().to_string();
        let token = created["payload"]["token"].as_str().unwrap().to_string();

        b.handler
            .handle_text(&join_session_msg(&session_id, &token, "B", "Bob", 100), 100, &b.handle, &deps)
            .await
            .unwrap();
        b.drain();
        a.drain();

        c.handler
            .handle_text(&join_session_msg(&session_id, &token, "C", "Carl", 200), 200, &c.handle, &deps)
            .await
            .unwrap();
        let err = c.recv_one();
        assert_eq!(err["type"], "error");
        assert_eq!(err["payload"]["code"], "SESSION_FULL");
    }

    /// An abrupt disconnect notifies the remaining peer but keeps the
    /// session alive; once both sides are gone the session is unjoinable.
    #[tokio::test]
    async fn abrupt_disconnect_notifies_peer_then_session_is_removed() {
        let deps = deps();
        let mut a = new_client(&deps);
        let mut b = new_client(&deps);

        a.handler.handle_text(&create_session_msg("A", "Alice", 0), 0, &a.handle, &deps).await.unwrap();
        let created = a.recv_one();
        let session_id = created["payload"]["sessionId"].as_str().unwrap().to_string();
        let token = created["payload"]["token"].as_str().unwrap().to_string();

        b.handler
            .handle_text(&join_session_msg(&session_id, &token, "B", "Bob", 100), 100, &b.handle, &deps)
            .await
            .unwrap();
        a.drain();
        b.drain();

        b.handler.handle_disconnect(&deps).await;
        let notice = a.recv_one();
        assert_eq!(notice["type"], "peer_disconnected");
        assert_eq!(notice["payload"]["peerId"], "B");
        assert_eq!(deps.registry.session_count(), 1);

        a.handler.handle_disconnect(&deps).await;
        assert_eq!(deps.registry.session_count(), 0);

        let mut late = new_client(&deps);
        late.handler
            .handle_text(&join_session_msg(&session_id, &token, "D", "Dan", 300), 300, &late.handle, &deps)
            .await
            .unwrap();
        let err = late.recv_one();
        assert_eq!(err["payload"]["code"], "SESSION_NOT_FOUND");
    }

    /// The sweeper removes an expired session; a join against its old
    /// `(sessionId, token)` afterward reports `SESSION_NOT_FOUND`.
    #[tokio::test]
    async fn expired_session_is_unjoinable_after_sweep() {
        let deps = deps();
        let mut a = new_client(&deps);

        a.handler.handle_text(&create_session_msg("A", "Alice", 0), 0, &a.handle, &deps).await.unwrap();
        let created = a.recv_one();
        let session_id = created["payload"]["sessionId"].as_str().unwrap().to_string();
        let token = created["payload"]["token"].as_str().unwrap().to_string();
        let expires_at = created["payload"]["expiresAt"].as_i64().unwrap();

        let expired = deps.registry.sweep(expires_at + 1);
        assert_eq!(expired.len(), 1);

        let mut b = new_client(&deps);
        b.handler
            .handle_text(&join_session_msg(&session_id, &token, "B", "Bob", expires_at + 2), expires_at + 2, &b.handle, &deps)
            .await
            .unwrap();
        let err = b.recv_one();
        assert_eq!(err["payload"]["code"], "SESSION_NOT_FOUND");
    }

    /// A `create_session` whose timestamp is outside the replay window
    /// is rejected without creating a session.
    #[tokio::test]
    async fn stale_timestamp_is_rejected() {
        let deps = deps();
        let mut a = new_client(&deps);

        let ten_minutes_ago = 0 - 10 * 60 * 1000;
        a.handler
            .handle_text(&create_session_msg("A", "Alice", ten_minutes_ago), 0, &a.handle, &deps)
            .await
            .unwrap();

        let err = a.recv_one();
        assert_eq!(err["type"], "error");
        assert_eq!(err["payload"]["code"], "INVALID_TIMESTAMP");
        assert_eq!(deps.registry.session_count(), 0);
    }

    /// Sending `session_close` twice yields exactly one `peer_left` to
    /// the peer, not two.
    #[tokio::test]
    async fn session_close_is_idempotent() {
        let deps = deps();
        let mut a = new_client(&deps);
        let mut b = new_client(&deps);

        a.handler.handle_text(&create_session_msg("A", "Alice", 0), 0, &a.handle, &deps).await.unwrap();
        let created = a.recv_one();
        let session_id = created["payload"]["sessionId"].as_str().unwrap().to_string();
        let token = created["payload"]["token"].as_str().unwrap().to_string();
        b.handler
            .handle_text(&join_session_msg(&session_id, &token, "B", "Bob", 100), 100, &b.handle, &deps)
            .await
            .unwrap();
        a.drain();
        b.drain();

        let close_msg = json!({
            "type": "session_close",
            "sessionId": session_id,
            "timestamp": 200,
            "payload": {"reason": "done"},
        })
        .to_string();

        b.handler.handle_text(&close_msg, 200, &b.handle, &deps).await.unwrap();
        let left = a.recv_one();
        assert_eq!(left["type"], "peer_left");
        assert_eq!(left["payload"]["peerId"], "B");

        b.handler.handle_text(&close_msg, 201, &b.handle, &deps).await.unwrap();
        assert!(a.drain().is_empty());
    }

    /// A relay whose `from` doesn't match the handler's bound identity is
    /// rejected as `UNAUTHORIZED`, and the peer never sees it.
    #[tokio::test]
    async fn relay_with_spoofed_from_is_unauthorized() {
        let deps = deps();
        let mut a = new_client(&deps);
        let mut b = new_client(&deps);

        a.handler.handle_text(&create_session_msg("A", "Alice", 0), 0, &a.handle, &deps).await.unwrap();
        let created = a.recv_one();
        let session_id = created["payload"]["sessionId"].as_str().unwrap().to_string();
        let token = created["payload"]["token"].as_str().unwrap().to_string();
        b.handler
            .handle_text(&join_session_msg(&session_id, &token, "B", "Bob", 100), 100, &b.handle, &deps)
            .await
            .unwrap();
        a.drain();
        b.drain();

        let spoofed = relay_msg("offer", &session_id, "B", "B", json!({"sdp": "x"}), 300);
        a.handler.handle_text(&spoofed, 300, &a.handle, &deps).await.unwrap();

        let err = a.recv_one();
        assert_eq!(err["payload"]["code"], "UNAUTHORIZED");
        assert!(b.drain().is_empty());
    }

    /// A relay targeting a `to` that isn't the session's other member is
    /// rejected as `PEER_NOT_FOUND`.
    #[tokio::test]
    async fn relay_to_unknown_peer_is_rejected() {
        let deps = deps();
        let mut a = new_client(&deps);
        let mut b = new_client(&deps);

        a.handler.handle_text(&create_session_msg("A", "Alice", 0), 0, &a.handle, &deps).await.unwrap();
        let created = a.recv_one();
        let session_id = created["payload"]["sessionId"].as_str().unwrap().to_string();
        let token = created["payload"]["token"].as_str().unwrap().to_string();
        b.handler
            .handle_text(&join_session_msg(&session_id, &token, "B", "Bob", 100), 100, &b.handle, &deps)
            .await
            .unwrap();
        a.drain();
        b.drain();

        let bad = relay_msg("offer", &session_id, "A", "ZZZ", json!({"sdp": "x"}), 300);
        a.handler.handle_text(&bad, 300, &a.handle, &deps).await.unwrap();
        let err = a.recv_one();
        assert_eq!(err["payload"]["code"], "PEER_NOT_FOUND");
    }

    /// Relaying before a session is paired (still `New`/`CreatorWaiting`)
    /// is rejected as `UNAUTHORIZED` rather than `PEER_NOT_FOUND`.
    #[tokio::test]
    async fn relay_before_paired_is_unauthorized() {
        let deps = deps();
        let mut a = new_client(&deps);

        a.handler.handle_text(&create_session_msg("A", "Alice", 0), 0, &a.handle, &deps).await.unwrap();
        let session_id = a.recv_one()["payload"]["sessionId"].as_str().unwrap().to_string();

        let msg = relay_msg("offer", &session_id, "A", "B", json!({"sdp": "x"}), 100);
        a.handler.handle_text(&msg, 100, &a.handle, &deps).await.unwrap();
        let err = a.recv_one();
        assert_eq!(err["payload"]["code"], "UNAUTHORIZED");
    }

    /// Creating a session twice on the same connection is `INVALID_STATE`
    /// and does not mutate the registry a second time.
    #[tokio::test]
    async fn double_create_session_is_invalid_state() {
        let deps = deps();
        let mut a = new_client(&deps);

        a.handler.handle_text(&create_session_msg("A", "Alice", 0), 0, &a.handle, &deps).await.unwrap();
        a.drain();
        a.handler.handle_text(&create_session_msg("A", "Alice", 100), 100, &a.handle, &deps).await.unwrap();
        let err = a.recv_one();
        assert_eq!(err["payload"]["code"], "INVALID_STATE");
        assert_eq!(deps.registry.session_count(), 1);
    }

    /// A malformed (unparsable) frame closes the connection with a
    /// protocol-error close code rather than being reported as an `error`
    /// envelope.
    #[tokio::test]
    async fn malformed_frame_closes_connection() {
        let deps = deps();
        let mut a = new_client(&deps);

        let result = a.handler.handle_text("not json", 0, &a.handle, &deps).await;
        let close = result.unwrap_err();
        assert_eq!(close.code, 1002);
    }

    /// An unrecognized `type` gets `UNKNOWN_MESSAGE_TYPE` without closing
    /// the connection.
    #[tokio::test]
    async fn unknown_message_type_reports_error_and_stays_open() {
        let deps = deps();
        let mut a = new_client(&deps);

        let msg = json!({"type": "frobnicate", "timestamp": 0, "payload": {}}).to_string();
        a.handler.handle_text(&msg, 0, &a.handle, &deps).await.unwrap();
        let err = a.recv_one();
        assert_eq!(err["payload"]["code"], "UNKNOWN_MESSAGE_TYPE");
        assert_eq!(a.handler.state(), HandlerState::New);
    }
}
