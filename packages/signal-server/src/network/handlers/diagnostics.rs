//! The read-only Diagnostic Surface.
//!
//! Two resources: liveness (always 200, no auth, minimal body) and
//! statistics (cumulative counters, may be restricted in production by
//! whatever sits in front of this service -- the handler itself applies
//! no access control).

use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::extract::State;
use axum::Json;
use serde_json::json;

pub use crate::metrics::DiagnosticCounters;

use super::AppState;

/// `GET /healthz` -- liveness. Always 200; must not require
/// authentication and must not block on the registry mutex for longer than
/// one lock acquisition.
pub async fn liveness_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.start_time.elapsed().as_secs(),
        "sessions": state.registry.session_count(),
        "connections": state.hub.count(),
        "timestamp": crate::sweeper::now_ms(),
    }))
}

/// `GET /stats` -- cumulative totals since start, in addition to the
/// liveness snapshot. Deployers that want to restrict this in
/// production do so with a reverse-proxy rule; this crate exposes it openly
/// like the liveness endpoint.
pub async fn stats_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.start_time.elapsed().as_secs(),
        "sessions": state.registry.session_count(),
        "connections": state.hub.count(),
        "sessionsCreatedTotal": state.diagnostics.sessions_created.load(Ordering::Relaxed),
        "sessionsExpiredTotal": state.diagnostics.sessions_expired.load(Ordering::Relaxed),
        "timestamp": crate::sweeper::now_ms(),
    }))
}
