//! The Session Registry and Connection Registry, held behind one mutex.
//!
//! The two registries are protected together by a single mutex, with all
//! operations that mutate both run under this mutex, specifically to close
//! the TOCTOU window between a duplicate-`client_id` or `session_full`
//! check and the insertion that follows it. A pair of
//! independently-locked maps (one keyed by session, one by connection)
//! cannot give that guarantee: a second thread could observe the session
//! map mid-update. So unlike a dispatch table such as [`crate::connection::ConnectionHub`],
//! which has no cross-map invariant to protect and is intentionally a
//! lock-free `DashMap`, this registry is a single `parking_lot::Mutex`
//! wrapping both maps as one unit.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::connection::ConnectionId;
use crate::error::RegistryError;
use crate::ids::{ClientId, SessionId, Token};

/// A session record. `token` is private: the only way to read it
/// out of the registry is [`SessionRegistry::create`], which hands it back
/// to the caller exactly once, at creation.
struct Session {
    token: Token,
    created_at: i64,
    expires_at: i64,
    members: HashMap<ClientId, Member>,
}

struct Member {
    display_name: String,
    connection_id: ConnectionId,
    #[allow(dead_code)] // retained for diagnostics / future join-order reporting
    joined_at: i64,
}

/// A read-only view of a session member, returned to callers that need to
/// notify or relay to a peer without touching the registry's internals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberView {
    pub client_id: ClientId,
    pub display_name: String,
    pub connection_id: ConnectionId,
}

/// Result of [`SessionRegistry::create`].
#[derive(Debug, Clone, Copy)]
pub struct CreatedSession {
    pub session_id: SessionId,
    pub expires_at: i64,
}

/// Result of a successful [`SessionRegistry::add_member`].
#[derive(Debug, Clone)]
pub struct AddMemberOutcome {
    /// `true` if this was the first member of the session (the creator).
    pub is_first: bool,
    /// The other member of the session, if one was already present.
    pub peer: Option<MemberView>,
}

/// Result of [`SessionRegistry::remove_member`] / [`SessionRegistry::disconnect`].
#[derive(Debug, Clone)]
pub enum RemoveOutcome {
    /// The session still has its other member; here it is, for notification.
    PeerStillPresent(MemberView),
    /// The removed member was alone; the session has been deleted.
    PeerAbsent,
    /// The session, or the member within it, did not exist.
    SessionMissing,
}

/// A session that the sweeper removed for being past `expires_at`, with
/// enough information to close its members' connections.
#[derive(Debug, Clone)]
pub struct ExpiredSession {
    pub session_id: SessionId,
    pub members: Vec<MemberView>,
}

struct Inner {
    sessions: HashMap<SessionId, Session>,
    /// Reverse lookup from a bound connection to its `(session_id, client_id)`,
    /// the Connection Registry. Kept in the same `Inner` as
    /// `sessions` so both maps move under one lock acquisition.
    connections: HashMap<ConnectionId, (SessionId, ClientId)>,
}

/// The joint Session Registry / Connection Registry.
///
/// Every public method takes the lock for the duration of one logical
/// operation and releases it before returning; none of them perform I/O or
/// unbounded work while holding it.
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                connections: HashMap::new(),
            }),
        }
    }

    /// Inserts a freshly generated session with no members.
    ///
    /// `session_id` and `token` are generated by the caller *before* calling
    /// this method (RNG draws don't belong inside the critical section).
    /// Collision with a live session id is astronomically unlikely for a
    /// 128-bit identifier but is still rejected rather than silently
    /// overwriting another session's record.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateClient` if `session_id` is already
    /// in use by a live session.
    pub fn create(
        &self,
        session_id: SessionId,
        token: Token,
        now: i64,
        ttl: Duration,
    ) -> Result<CreatedSession, RegistryError> {
        let mut inner = self.inner.lock();
        if inner.sessions.contains_key(&session_id) {
            return Err(RegistryError::DuplicateClient);
        }
        let expires_at = now + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        inner.sessions.insert(
            session_id,
            Session {
                token,
                created_at: now,
                expires_at,
                members: HashMap::new(),
            },
        );
        Ok(CreatedSession { session_id, expires_at })
    }

    /// Adds a member to a session, binding its connection in the same
    /// critical section.
    ///
    /// # Errors
    ///
    /// `NotFound` if the session does not exist, `SessionFull` if it
    /// already has two members, `DuplicateClient` if `client_id` is already
    /// a member of this session.
    pub fn add_member(
        &self,
        session_id: SessionId,
        client_id: ClientId,
        display_name: String,
        connection_id: ConnectionId,
        now: i64,
    ) -> Result<AddMemberOutcome, RegistryError> {
        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get_mut(&session_id)
            .ok_or(RegistryError::NotFound)?;

        if session.members.contains_key(&client_id) {
            return Err(RegistryError::DuplicateClient);
        }
        if session.members.len() >= 2 {
            return Err(RegistryError::SessionFull);
        }

        let peer = session.members.iter().next().map(|(id, m)| MemberView {
            client_id: id.clone(),
            display_name: m.display_name.clone(),
            connection_id: m.connection_id,
        });
        let is_first = peer.is_none();

        session.members.insert(
            client_id.clone(),
            Member { display_name, connection_id, joined_at: now },
        );
        inner.connections.insert(connection_id, (session_id, client_id));

        Ok(AddMemberOutcome { is_first, peer })
    }

    /// Constant-time token check. Returns `false` for an unknown session
    /// without distinguishing that case from a wrong token.
    #[must_use]
    pub fn validate_token(&self, session_id: SessionId, presented: &Token) -> bool {
        let inner = self.inner.lock();
        inner
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.token.constant_time_eq(presented))
    }

    /// Looks up the other member of `client_id`'s session, for relay dispatch.
    #[must_use]
    pub fn get_peer(&self, session_id: SessionId, client_id: &str) -> Option<MemberView> {
        let inner = self.inner.lock();
        let session = inner.sessions.get(&session_id)?;
        session
            .members
            .iter()
            .find(|(id, _)| id.as_str() != client_id)
            .map(|(id, m)| MemberView {
                client_id: id.clone(),
                display_name: m.display_name.clone(),
                connection_id: m.connection_id,
            })
    }

    /// Checks whether `client_id` is a current member of `session_id`,
    /// used to validate a relay's `from` against the handler's bound identity.
    #[must_use]
    pub fn is_member(&self, session_id: SessionId, client_id: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.members.contains_key(client_id))
    }

    /// Removes a member by session id and client id. If the session becomes
    /// empty it is deleted, converging with the expiry path on the same
    /// "no empty, non-expired session is ever retained" invariant.
    pub fn remove_member(&self, session_id: SessionId, client_id: &str) -> RemoveOutcome {
        let mut inner = self.inner.lock();
        Self::remove_member_locked(&mut inner, session_id, client_id)
    }

    /// Looks up a connection's `(session_id, client_id)` binding and removes
    /// that member, all under one lock acquisition. This is the path the
    /// protocol handler takes on abrupt transport close or liveness
    /// timeout, where it must not trust its own possibly-stale local state.
    pub fn disconnect(&self, connection_id: ConnectionId) -> Option<(SessionId, ClientId, RemoveOutcome)> {
        let mut inner = self.inner.lock();
        let (session_id, client_id) = inner.connections.remove(&connection_id)?;
        let outcome = Self::remove_member_locked(&mut inner, session_id, &client_id);
        Some((session_id, client_id, outcome))
    }

    fn remove_member_locked(inner: &mut Inner, session_id: SessionId, client_id: &str) -> RemoveOutcome {
        let Some(session) = inner.sessions.get_mut(&session_id) else {
            return RemoveOutcome::SessionMissing;
        };
        let Some(removed) = session.members.remove(client_id) else {
            return RemoveOutcome::SessionMissing;
        };
        inner.connections.remove(&removed.connection_id);

        if let Some((peer_id, peer)) = session.members.iter().next() {
            let view = MemberView {
                client_id: peer_id.clone(),
                display_name: peer.display_name.clone(),
                connection_id: peer.connection_id,
            };
            RemoveOutcome::PeerStillPresent(view)
        } else {
            inner.sessions.remove(&session_id);
            RemoveOutcome::PeerAbsent
        }
    }

    /// Deletes every session with `expires_at <= now`, returning their
    /// members so the caller can close those connections outside the lock
    /// no notification is sent; closure happens after the snapshot.
    pub fn sweep(&self, now: i64) -> Vec<ExpiredSession> {
        let mut inner = self.inner.lock();
        let expired_ids: Vec<SessionId> = inner
            .sessions
            .iter()
            .filter(|(_, s)| s.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut expired = Vec::with_capacity(expired_ids.len());
        for session_id in expired_ids {
            if let Some(session) = inner.sessions.remove(&session_id) {
                let members: Vec<MemberView> = session
                    .members
                    .iter()
                    .map(|(id, m)| MemberView {
                        client_id: id.clone(),
                        display_name: m.display_name.clone(),
                        connection_id: m.connection_id,
                    })
                    .collect();
                for member in &members {
                    inner.connections.remove(&member.connection_id);
                }
                expired.push(ExpiredSession { session_id, members });
            }
        }
        expired
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    #[must_use]
    pub fn bound_connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new()
    }

    fn create(reg: &SessionRegistry, now: i64) -> (SessionId, Token, i64) {
        let session_id = SessionId::generate();
        let token = Token::generate();
        let created = reg
            .create(session_id, token.clone(), now, Duration::from_secs(3600))
            .unwrap();
        (session_id, token, created.expires_at)
    }

    #[test]
    fn create_then_add_first_member_has_no_peer() {
        let reg = registry();
        let (sid, _token, _exp) = create(&reg, 1000);
        let outcome = reg
            .add_member(sid, "A".to_string(), "Alice".to_string(), ConnectionId(1), 1000)
            .unwrap();
        assert!(outcome.is_first);
        assert!(outcome.peer.is_none());
        assert_eq!(reg.session_count(), 1);
        assert_eq!(reg.bound_connection_count(), 1);
    }

    #[test]
    fn add_second_member_returns_first_as_peer() {
        let reg = registry();
        let (sid, _token, _exp) = create(&reg, 1000);
        reg.add_member(sid, "A".to_string(), "Alice".to_string(), ConnectionId(1), 1000)
            .unwrap();
        let outcome = reg
            .add_member(sid, "B".to_string(), "Bob".to_string(), ConnectionId(2), 1001)
            .unwrap();
        assert!(!outcome.is_first);
        let peer = outcome.peer.unwrap();
        assert_eq!(peer.client_id, "A");
        assert_eq!(peer.display_name, "Alice");
    }

    #[test]
    fn third_member_is_rejected_session_full() {
        let reg = registry();
        let (sid, _token, _exp) = create(&reg, 1000);
        reg.add_member(sid, "A".to_string(), "Alice".to_string(), ConnectionId(1), 1000)
            .unwrap();
        reg.add_member(sid, "B".to_string(), "Bob".to_string(), ConnectionId(2), 1001)
            .unwrap();
        let err = reg
            .add_member(sid, "C".to_string(), "Carl".to_string(), ConnectionId(3), 1002)
            .unwrap_err();
        assert_eq!(err, RegistryError::SessionFull);
    }

    #[test]
    fn duplicate_client_id_in_same_session_is_rejected() {
        let reg = registry();
        let (sid, _token, _exp) = create(&reg, 1000);
        reg.add_member(sid, "A".to_string(), "Alice".to_string(), ConnectionId(1), 1000)
            .unwrap();
        let err = reg
            .add_member(sid, "A".to_string(), "Alice2".to_string(), ConnectionId(2), 1001)
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateClient);
    }

    #[test]
    fn add_member_to_unknown_session_not_found() {
        let reg = registry();
        let bogus = SessionId::generate();
        let err = reg
            .add_member(bogus, "A".to_string(), "Alice".to_string(), ConnectionId(1), 1000)
            .unwrap_err();
        assert_eq!(err, RegistryError::NotFound);
    }

    #[test]
    fn validate_token_rejects_wrong_token_and_unknown_session() {
        let reg = registry();
        let (sid, token, _exp) = create(&reg, 1000);
        assert!(reg.validate_token(sid, &token));
        assert!(!reg.validate_token(sid, &Token::generate()));
        let bogus = SessionId::generate();
        assert!(!reg.validate_token(bogus, &token));
    }

    #[test]
    fn get_peer_returns_the_other_member() {
        let reg = registry();
        let (sid, _token, _exp) = create(&reg, 1000);
        reg.add_member(sid, "A".to_string(), "Alice".to_string(), ConnectionId(1), 1000)
            .unwrap();
        reg.add_member(sid, "B".to_string(), "Bob".to_string(), ConnectionId(2), 1001)
            .unwrap();
        assert_eq!(reg.get_peer(sid, "A").unwrap().client_id, "B");
        assert_eq!(reg.get_peer(sid, "B").unwrap().client_id, "A");
    }

    #[test]
    fn remove_last_member_deletes_session() {
        let reg = registry();
        let (sid, _token, _exp) = create(&reg, 1000);
        reg.add_member(sid, "A".to_string(), "Alice".to_string(), ConnectionId(1), 1000)
            .unwrap();
        let outcome = reg.remove_member(sid, "A");
        assert!(matches!(outcome, RemoveOutcome::PeerAbsent));
        assert_eq!(reg.session_count(), 0);
        assert_eq!(reg.bound_connection_count(), 0);
    }

    #[test]
    fn remove_one_of_two_members_reports_peer_still_present() {
        let reg = registry();
        let (sid, _token, _exp) = create(&reg, 1000);
        reg.add_member(sid, "A".to_string(), "Alice".to_string(), ConnectionId(1), 1000)
            .unwrap();
        reg.add_member(sid, "B".to_string(), "Bob".to_string(), ConnectionId(2), 1001)
            .unwrap();
        let outcome = reg.remove_member(sid, "B");
        match outcome {
            RemoveOutcome::PeerStillPresent(peer) => assert_eq!(peer.client_id, "A"),
            other => panic!("expected PeerStillPresent, got {other:?}"),
        }
        assert_eq!(reg.session_count(), 1);
        assert_eq!(reg.bound_connection_count(), 1);
    }

    #[test]
    fn remove_member_twice_is_idempotent_session_missing() {
        let reg = registry();
        let (sid, _token, _exp) = create(&reg, 1000);
        reg.add_member(sid, "A".to_string(), "Alice".to_string(), ConnectionId(1), 1000)
            .unwrap();
        reg.remove_member(sid, "A");
        let second = reg.remove_member(sid, "A");
        assert!(matches!(second, RemoveOutcome::SessionMissing));
    }

    #[test]
    fn disconnect_looks_up_binding_and_removes_member() {
        let reg = registry();
        let (sid, _token, _exp) = create(&reg, 1000);
        reg.add_member(sid, "A".to_string(), "Alice".to_string(), ConnectionId(1), 1000)
            .unwrap();
        reg.add_member(sid, "B".to_string(), "Bob".to_string(), ConnectionId(2), 1001)
            .unwrap();
        let (found_sid, found_cid, outcome) = reg.disconnect(ConnectionId(2)).unwrap();
        assert_eq!(found_sid, sid);
        assert_eq!(found_cid, "B");
        match outcome {
            RemoveOutcome::PeerStillPresent(peer) => assert_eq!(peer.client_id, "A"),
            other => panic!("expected PeerStillPresent, got {other:?}"),
        }
        assert!(reg.disconnect(ConnectionId(2)).is_none());
    }

    #[test]
    fn sweep_removes_only_expired_sessions() {
        let reg = registry();
        let (sid_old, _t1, _e1) = create(&reg, 0);
        let (sid_new, _t2, _e2) = create(&reg, 10_000_000);
        reg.add_member(sid_old, "A".to_string(), "Alice".to_string(), ConnectionId(1), 0)
            .unwrap();

        let expired = reg.sweep(3_600_001);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].session_id, sid_old);
        assert_eq!(expired[0].members.len(), 1);
        assert_eq!(reg.session_count(), 1);
        assert!(reg.bound_connection_count() == 0);
        let _ = sid_new;
    }

    #[test]
    fn is_member_reflects_current_membership() {
        let reg = registry();
        let (sid, _token, _exp) = create(&reg, 1000);
        assert!(!reg.is_member(sid, "A"));
        reg.add_member(sid, "A".to_string(), "Alice".to_string(), ConnectionId(1), 1000)
            .unwrap();
        assert!(reg.is_member(sid, "A"));
        assert!(!reg.is_member(sid, "B"));
    }

    #[test]
    fn creating_with_duplicate_session_id_is_rejected() {
        let reg = registry();
        let sid = SessionId::generate();
        let token = Token::generate();
        reg.create(sid, token.clone(), 0, Duration::from_secs(1)).unwrap();
        let err = reg.create(sid, token, 1, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateClient);
    }
}
