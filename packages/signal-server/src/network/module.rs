//! Network module with deferred startup lifecycle.
//!
//! Implements the deferred startup pattern: `new()` creates shared state,
//! `start()` binds the TCP listener, and `serve()` starts accepting
//! connections. This separation allows the binary entry point to spawn
//! sibling tasks (the expiry sweeper) that need the same shared registries
//! before the listener starts accepting traffic.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Config;
use crate::connection::{ConnectionHub, OutboundMessage as Frame};
use crate::metrics::DiagnosticCounters;
use crate::rate_limit::RateLimiter;
use crate::session::SessionRegistry;

use super::handlers::{liveness_handler, stats_handler, ws_upgrade_handler, AppState};
use super::middleware::{build_http_layers, build_ws_layers};
use super::shutdown::ShutdownController;

/// How long shutdown waits for in-flight connections to drain before giving
/// up and letting the process exit anyway.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Manages the full HTTP/WebSocket server lifecycle.
///
/// Follows the deferred startup pattern:
/// 1. `new()` -- allocates shared state (registry, hub, rate limiter, shutdown controller)
/// 2. `start()` -- binds the TCP listener to the configured address
/// 3. `serve()` -- begins accepting connections until shutdown is signalled
///
/// Shared state is handed out via `Arc` so the binary entry point can spawn
/// the expiry sweeper against the same registry and hub before calling
/// `serve()`.
pub struct NetworkModule {
    config: Arc<Config>,
    listener: Option<TcpListener>,
    registry: Arc<SessionRegistry>,
    hub: Arc<ConnectionHub>,
    rate_limiter: Arc<RateLimiter>,
    diagnostics: Arc<DiagnosticCounters>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let rate_limiter = Arc::new(RateLimiter::new(&config));
        Self {
            config,
            listener: None,
            registry: Arc::new(SessionRegistry::new()),
            hub: Arc::new(ConnectionHub::new()),
            rate_limiter,
            diagnostics: Arc::new(DiagnosticCounters::default()),
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    #[must_use]
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn hub(&self) -> Arc<ConnectionHub> {
        Arc::clone(&self.hub)
    }

    #[must_use]
    pub fn diagnostics(&self) -> Arc<DiagnosticCounters> {
        Arc::clone(&self.diagnostics)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    fn app_state(&self) -> AppState {
        AppState {
            registry: Arc::clone(&self.registry),
            hub: Arc::clone(&self.hub),
            rate_limiter: Arc::clone(&self.rate_limiter),
            shutdown: Arc::clone(&self.shutdown),
            diagnostics: Arc::clone(&self.diagnostics),
            config: Arc::clone(&self.config),
            start_time: Instant::now(),
        }
    }

    /// Assembles the axum router.
    ///
    /// Routes:
    /// - `GET /healthz` -- liveness
    /// - `GET /stats` -- cumulative diagnostic counters
    /// - `GET <endpoint_path>` (default `/ws`) -- WebSocket upgrade
    ///
    /// The WebSocket route gets a reduced middleware stack (no compression,
    /// no request timeout); diagnostic routes get the full stack.
    #[must_use]
    pub fn build_router(&self) -> Router {
        let state = self.app_state();

        let diagnostics = Router::new()
            .route("/healthz", get(liveness_handler))
            .route("/stats", get(stats_handler))
            .layer(build_http_layers(&self.config));

        let websocket = Router::new()
            .route(&self.config.endpoint_path, get(ws_upgrade_handler))
            .layer(build_ws_layers(&self.config));

        diagnostics.merge(websocket).with_state(state)
    }

    /// Binds the TCP listener to the configured address.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// one when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g. port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let listener = TcpListener::bind(self.config.listen_address).await?;
        let port = listener.local_addr()?.port();
        info!(address = %self.config.listen_address, bound_port = port, "TCP listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Starts serving connections until the shutdown future resolves.
    ///
    /// Consumes `self` because the listener is moved into the server.
    ///
    /// After the shutdown signal:
    /// 1. Health state transitions to Draining
    /// 2. Every live connection receives a close frame
    /// 3. Waits up to 30 seconds for in-flight work to finish
    /// 4. Health state transitions to Stopped
    ///
    /// # Errors
    ///
    /// Returns an error if the server encounters a fatal I/O error.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let listener = self.listener.expect("start() must be called before serve()");
        let hub = Arc::clone(&self.hub);
        let shutdown_ctrl = Arc::clone(&self.shutdown);
        let router = self.build_router();

        shutdown_ctrl.set_ready();
        info!("serving HTTP/WebSocket connections");

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        drain_connections(hub, shutdown_ctrl).await;
        Ok(())
    }
}

/// Sends a close frame to every live connection, then waits for in-flight
/// work to finish (up to [`DRAIN_TIMEOUT`]).
async fn drain_connections(hub: Arc<ConnectionHub>, shutdown_ctrl: Arc<ShutdownController>) {
    shutdown_ctrl.trigger_shutdown();

    let handles = hub.drain_all();
    let count = handles.len();
    if count > 0 {
        info!(count, "draining connections");
        for handle in &handles {
            let _ = handle.try_send(Frame::Close(1000, "server shutting down".to_string()));
        }
    }

    if shutdown_ctrl.wait_for_drain(DRAIN_TIMEOUT).await {
        info!("all connections drained");
    } else {
        warn!("drain timeout expired with in-flight work remaining");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn test_config() -> Config {
        Config::parse_from(["webrtc-signal-server", "--listen-address", "127.0.0.1:0"])
    }

    #[test]
    fn new_creates_module_without_binding() {
        let module = NetworkModule::new(test_config());
        assert!(module.listener.is_none());
    }

    #[test]
    fn registry_and_hub_return_shared_arcs() {
        let module = NetworkModule::new(test_config());
        assert!(Arc::ptr_eq(&module.registry(), &module.registry()));
        assert!(Arc::ptr_eq(&module.hub(), &module.hub()));
    }

    #[test]
    fn shutdown_controller_returns_shared_arc() {
        let module = NetworkModule::new(test_config());
        let s1 = module.shutdown_controller();
        let s2 = module.shutdown_controller();
        assert!(Arc::ptr_eq(&s1, &s2));
    }

    #[test]
    fn build_router_creates_router() {
        let module = NetworkModule::new(test_config());
        let _router = module.build_router();
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = NetworkModule::new(test_config());
        let port = module.start().await.expect("start should succeed");
        assert!(port > 0, "OS-assigned port should be > 0");
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    #[should_panic(expected = "start() must be called before serve()")]
    async fn serve_panics_without_start() {
        let module = NetworkModule::new(test_config());
        let _ = module.serve(std::future::pending::<()>()).await;
    }
}
