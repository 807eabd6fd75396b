//! Identifier and secret generation.
//!
//! Session ids are 128-bit, tokens are 256-bit; both are generated from the
//! OS CSPRNG and rendered as lowercase hex for the wire. `Token` equality is
//! always constant-time so presenting a wrong token never leaks
//! timing information about how many bytes matched.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;

/// Opaque 128-bit session identifier, rendered as 32 lowercase hex chars on
/// the wire and used as the `SessionRegistry`'s map key internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Generates a fresh session id from the OS-seeded thread-local CSPRNG.
    /// Infallible, matching the teacher's `rand::rng()` + fill idiom
    /// (`server-rust/src/storage/engines/hashmap.rs`) -- `rand`'s `RngCore`
    /// is an infallible trait as of 0.9; fallible generation only exists on
    /// `TryRngCore` sources like a raw `OsRng`, which this crate has no
    /// need for.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[must_use]
    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a session id from its hex wire form, as presented in a
    /// `join_session` message's `sessionId` field.
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Self> {
        let decoded = hex::decode(s).ok()?;
        let bytes: [u8; 16] = decoded.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_hex())
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.as_hex())
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        SessionId::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid session id"))
    }
}

/// 256-bit join secret. Never `Debug`-printed with its contents and never
/// logged; only ever generated, compared, parsed from a client-presented
/// hex string, or sent once to the creator in `session_created`.
#[derive(Clone)]
pub struct Token([u8; 32]);

impl Token {
    /// Generates a fresh token from the OS-seeded thread-local CSPRNG.
    /// Infallible, for the same reason as [`SessionId::generate`].
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parses a token presented by a client from its hex wire form.
    ///
    /// Malformed hex or wrong length is reported the same way as a wrong
    /// token by the caller -- the two should never be distinguished, to
    /// avoid leaking a format oracle.
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Self> {
        let decoded = hex::decode(s).ok()?;
        let bytes: [u8; 32] = decoded.try_into().ok()?;
        Some(Self(bytes))
    }

    #[must_use]
    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Constant-time equality check.
    #[must_use]
    pub fn constant_time_eq(&self, other: &Token) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(..)")
    }
}

/// Opaque client-chosen identifier, treated as arbitrary (but bounded-length)
/// text. Never interpreted beyond string equality.
pub type ClientId = String;

/// Maximum length accepted for a client-supplied identifier or display name,
/// to keep a single hostile client from inflating registry memory.
pub const MAX_OPAQUE_FIELD_LEN: usize = 256;
