//! The wire envelope and message payload types.
//!
//! Every frame is a single JSON object tagged by `type`. Relayable payloads
//! (`offer`/`answer`/`ice_candidate`) are kept as `Box<RawValue>` end to end
//! -- the codec never parses their contents and never re-serializes them
//! through a re-ordering map, preserving both the zero-knowledge property
//! and byte-for-byte fidelity of the forwarded payload.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::ids::SessionId;

/// Acceptable clock skew between a client-supplied `timestamp` and the
/// server's wall clock.
pub const TIMESTAMP_SKEW_MS: i64 = 5 * 60 * 1000;

/// An inbound message as received from a client, before type-specific
/// payload validation. Kept close to the wire shape so unknown fields are
/// ignored automatically by `serde`.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    pub timestamp: i64,
    pub payload: Box<RawValue>,
}

/// Client -> server payload for `create_session`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionPayload {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
}

/// Client -> server payload for `join_session`.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinSessionPayload {
    pub token: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
}

/// Client -> server payload for `session_close`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SessionClosePayload {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Every outbound (server -> client) message, serialized with `type` as the
/// discriminant and `camelCase` field names to match the wire protocol exactly.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    SessionCreated {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        payload: SessionCreatedPayload,
    },
    SessionJoined {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        payload: PeerInfoPayload,
    },
    PeerJoined {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        payload: PeerInfoPayload,
    },
    PeerLeft {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        payload: PeerLeftPayload,
    },
    PeerDisconnected {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        payload: PeerDisconnectedPayload,
    },
    Error {
        payload: ErrorPayload,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionCreatedPayload {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    pub token: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerInfoPayload {
    #[serde(rename = "peerId")]
    pub peer_id: String,
    #[serde(rename = "peerDisplayName")]
    pub peer_display_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerLeftPayload {
    #[serde(rename = "peerId")]
    pub peer_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerDisconnectedPayload {
    #[serde(rename = "peerId")]
    pub peer_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: crate::error::ErrorCode,
    pub message: String,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Builds the verbatim relay frame sent to the *other* member of a session.
///
/// Relay messages are not modeled as an `OutboundMessage` variant because
/// their `type` field must equal the original message type exactly
/// (`offer`/`answer`/`ice_candidate`), which a single `#[serde(tag = "type")]`
/// enum cannot express per-instance. `payload` is a `&RawValue`, so its bytes
/// pass through untouched instead of being rebuilt via a `Value` (which would
/// re-order object keys through its default `BTreeMap` representation and
/// break byte-for-byte fidelity).
#[derive(Serialize)]
struct RelayFrame<'a> {
    #[serde(rename = "type")]
    message_type: &'a str,
    #[serde(rename = "sessionId")]
    session_id: String,
    from: &'a str,
    to: &'a str,
    timestamp: i64,
    payload: &'a RawValue,
}

/// Serializes the relay frame to its wire text directly, since the only
/// consumer is the WebSocket write path and an intermediate `Value` would
/// reintroduce the key-ordering problem this type exists to avoid.
#[must_use]
pub fn build_relay_frame(
    message_type: &str,
    session_id: SessionId,
    from: &str,
    to: &str,
    timestamp: i64,
    payload: &RawValue,
) -> String {
    let frame = RelayFrame {
        message_type,
        session_id: session_id.as_hex(),
        from,
        to,
        timestamp,
        payload,
    };
    serde_json::to_string(&frame).expect("relay frame fields are all directly serializable")
}

/// Message type strings recognized on the client -> server direction
/// Kept as plain string constants rather than an enum because
/// the codec needs to dispatch on the raw `type` field before it knows
/// which payload shape to expect.
pub mod message_type {
    pub const CREATE_SESSION: &str = "create_session";
    pub const JOIN_SESSION: &str = "join_session";
    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const ICE_CANDIDATE: &str = "ice_candidate";
    pub const SESSION_CLOSE: &str = "session_close";

    /// The three message types that are relayed verbatim to the peer.
    pub const RELAYABLE: [&str; 3] = [OFFER, ANSWER, ICE_CANDIDATE];
}
