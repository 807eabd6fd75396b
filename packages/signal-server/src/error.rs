//! Wire-level error codes and the internal error types that map onto them.
//!
//! `ErrorCode` is the closed set from the wire protocol. Every
//! fallible operation in the registry and protocol handler resolves to one
//! of these before it is ever serialized into an `error` envelope, so the
//! wire vocabulary and the Rust error vocabulary never drift apart.

use serde::Serialize;

/// Closed set of error codes sent to clients in `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidTimestamp,
    InvalidMessage,
    InvalidPayload,
    InvalidState,
    UnknownMessageType,
    InvalidToken,
    SessionNotFound,
    SessionFull,
    Unauthorized,
    PeerNotFound,
    RateLimitExceeded,
    MessageTooLarge,
    SlowPeer,
    Internal,
}

impl ErrorCode {
    /// Whether this error is reported to the originator with the connection
    /// kept open (client input / policy error), as opposed to one that
    /// always accompanies a connection close (protocol/transport error).
    #[must_use]
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::MessageTooLarge | Self::SlowPeer | Self::Internal)
    }
}

/// Errors raised while mutating the Session Registry.
///
/// These map 1:1 onto the outcomes of `add_member`/`remove_member`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("session is full")]
    SessionFull,
    #[error("session not found")]
    NotFound,
    #[error("client_id already present in session")]
    DuplicateClient,
}

impl From<RegistryError> for ErrorCode {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::SessionFull => ErrorCode::SessionFull,
            RegistryError::NotFound => ErrorCode::SessionNotFound,
            RegistryError::DuplicateClient => ErrorCode::InvalidState,
        }
    }
}

/// Errors raised by the per-connection protocol handler while processing
/// one inbound frame. Carries enough context to build the `error` envelope
/// (client-input / policy) or to close the connection (protocol/fatal).
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("{0:?}")]
    Client(ErrorCode),
    #[error("{0:?}: {1}")]
    Fatal(ErrorCode, String),
}

impl HandlerError {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            HandlerError::Client(c) | HandlerError::Fatal(c, _) => *c,
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, HandlerError::Fatal(..))
    }
}
