//! Metric key definitions and a one-time `describe_metrics` call.
//!
//! Keys and the `describe_*` pattern follow the `metrics` facade crate's
//! usual convention. The actual export mechanism
//! (`metrics-exporter-prometheus`'s in-process recorder, rendered by the
//! `/metrics` diagnostic route) is wired up once at startup.

/// Cumulative counters backing the `/stats` diagnostic endpoint. Kept apart
/// from the `metrics` facade above because the diagnostic surface's
/// contract -- "cumulative totals since start" -- must hold regardless of
/// whether a Prometheus recorder is even installed.
#[derive(Debug, Default)]
pub struct DiagnosticCounters {
    pub sessions_created: std::sync::atomic::AtomicU64,
    pub sessions_expired: std::sync::atomic::AtomicU64,
}

impl DiagnosticCounters {
    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_session_expired(&self) {
        self.sessions_expired.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

pub const SESSIONS_CREATED_TOTAL: &str = "signal.sessions.created";
pub const SESSIONS_EXPIRED_TOTAL: &str = "signal.sessions.expired";
pub const SESSIONS_CLOSED_TOTAL: &str = "signal.sessions.closed";
pub const SESSIONS_LIVE: &str = "signal.sessions.live";
pub const CONNECTIONS_LIVE: &str = "signal.connections.live";
pub const CONNECTIONS_ACCEPTED_TOTAL: &str = "signal.connections.accepted";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "signal.connections.rejected";
pub const MESSAGES_RELAYED_TOTAL: &str = "signal.messages.relayed";
pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "signal.rate_limit.rejections";
pub const SLOW_PEER_CLOSES_TOTAL: &str = "signal.slow_peer.closes";

/// Registers metadata (unit, description) for every metric this crate
/// emits. Called once at startup, before the recorder starts receiving
/// updates from request-handling tasks.
pub fn describe_metrics() {
    metrics::describe_counter!(
        SESSIONS_CREATED_TOTAL,
        metrics::Unit::Count,
        "Number of sessions created"
    );
    metrics::describe_counter!(
        SESSIONS_EXPIRED_TOTAL,
        metrics::Unit::Count,
        "Number of sessions removed by the expiry sweeper"
    );
    metrics::describe_counter!(
        SESSIONS_CLOSED_TOTAL,
        metrics::Unit::Count,
        "Number of sessions removed by explicit close or last-member departure"
    );
    metrics::describe_gauge!(
        SESSIONS_LIVE,
        metrics::Unit::Count,
        "Number of sessions currently in the registry"
    );
    metrics::describe_gauge!(
        CONNECTIONS_LIVE,
        metrics::Unit::Count,
        "Number of open transport connections"
    );
    metrics::describe_counter!(
        CONNECTIONS_ACCEPTED_TOTAL,
        metrics::Unit::Count,
        "Number of WebSocket upgrades accepted"
    );
    metrics::describe_counter!(
        CONNECTIONS_REJECTED_TOTAL,
        metrics::Unit::Count,
        "Number of WebSocket upgrades rejected at accept time"
    );
    metrics::describe_counter!(
        MESSAGES_RELAYED_TOTAL,
        metrics::Unit::Count,
        "Number of offer/answer/ice_candidate messages relayed between peers"
    );
    metrics::describe_counter!(
        RATE_LIMIT_REJECTIONS_TOTAL,
        metrics::Unit::Count,
        "Number of actions rejected by the rate limiter"
    );
    metrics::describe_counter!(
        SLOW_PEER_CLOSES_TOTAL,
        metrics::Unit::Count,
        "Number of sessions closed for exceeding the slow-peer stall deadline"
    );
}
