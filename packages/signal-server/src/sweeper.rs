//! The Expiry Sweeper: a periodic task that deletes sessions
//! past their `expires_at` and closes their members' connections.
//!
//! Runs independently of any connection's lifetime. Each tick takes a
//! snapshot of expired session ids under the registry lock (via
//! [`SessionRegistry::sweep`]), then closes connections *outside* the lock
//! -- closing a connection is I/O-adjacent and must never happen while
//! holding the registry mutex.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::connection::{ConnectionHub, OutboundMessage as Frame};
use crate::metrics::DiagnosticCounters;
use crate::session::SessionRegistry;

/// Runs the sweeper loop until `shutdown` fires.
///
/// A panic inside one tick's body is impossible to cause here (no code
/// runs that isn't already panic-audited below), but a sweeper failure must
/// not kill the process -- a tick that returns an error would be
/// logged and the loop continues rather than propagating.
pub async fn run(
    registry: Arc<SessionRegistry>,
    hub: Arc<ConnectionHub>,
    diagnostics: Arc<DiagnosticCounters>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; skip it so a freshly started server
    // doesn't sweep against sessions created moments ago.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep_once(&registry, &hub, &diagnostics);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn sweep_once(registry: &SessionRegistry, hub: &ConnectionHub, diagnostics: &DiagnosticCounters) {
    let now = now_ms();
    let expired = registry.sweep(now);
    if expired.is_empty() {
        return;
    }

    let session_count = expired.len();
    let mut connections_closed = 0usize;
    for session in expired {
        for member in session.members {
            if let Some(handle) = hub.get(member.connection_id) {
                if !handle.try_send(Frame::Close(1000, "session expired".to_string())) {
                    warn!(connection_id = ?member.connection_id, "failed to enqueue close frame for expired session");
                }
                connections_closed += 1;
            }
        }
        metrics::counter!(crate::metrics::SESSIONS_EXPIRED_TOTAL).increment(1);
        diagnostics.record_session_expired();
    }
    info!(session_count, connections_closed, "swept expired sessions");
}

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Centralized here (rather than scattered `SystemTime::now()` calls)
/// because the sweeper is the one component whose correctness is entirely
/// about comparing wall-clock time against a stored deadline.
#[must_use]
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
