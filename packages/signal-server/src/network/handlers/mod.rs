//! HTTP and WebSocket handler definitions.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports all handler functions for convenient access
//! when building the router.

pub mod diagnostics;
pub mod websocket;

pub use diagnostics::{liveness_handler, stats_handler, DiagnosticCounters};
pub use websocket::ws_upgrade_handler;

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::connection::ConnectionHub;
use crate::rate_limit::RateLimiter;
use crate::session::SessionRegistry;

use super::shutdown::ShutdownController;

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// The Session Registry / Connection Registry.
    pub registry: Arc<SessionRegistry>,
    /// Live transport connection pool.
    pub hub: Arc<ConnectionHub>,
    /// Per-remote-address rate limiter.
    pub rate_limiter: Arc<RateLimiter>,
    /// Graceful shutdown controller with health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Cumulative counters exposed by the statistics endpoint.
    pub diagnostics: Arc<DiagnosticCounters>,
    /// Startup configuration.
    pub config: Arc<Config>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}
