//! WebRTC signaling broker: pairs exactly two clients through a short-lived,
//! token-protected session and relays opaque SDP/ICE messages between them.
//!
//! The crate is organized leaf-first, matching the component list of the
//! design this was built from:
//!
//! - [`ids`] -- session id and token generation/encoding.
//! - [`session`] -- the Session Registry and Connection Registry, held
//!   behind one mutex (see that module's docs for why).
//! - [`connection`] -- the live transport connection pool (`ConnectionHub`)
//!   used for O(1) relay dispatch and per-connection backpressure.
//! - [`envelope`] -- the wire message envelope and payload types.
//! - [`handler`] -- the per-connection protocol state machine.
//! - [`rate_limit`] -- per-remote-address action and connection-count caps.
//! - [`sweeper`] -- the periodic expiry sweep.
//! - [`config`] -- startup configuration, parsed and validated once.
//! - [`error`] -- the closed set of wire error codes and internal error types.
//! - [`metrics`] -- metric key definitions for the diagnostic surface.
//! - [`network`] -- axum/tower glue: the HTTP router, WebSocket upgrade
//!   handler, graceful shutdown, and diagnostic routes.

pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod ids;
pub mod metrics;
pub mod network;
pub mod rate_limit;
pub mod session;
pub mod sweeper;

pub use config::Config;
pub use connection::ConnectionHub;
pub use handler::{HandlerDeps, ProtocolHandler};
pub use rate_limit::RateLimiter;
pub use session::SessionRegistry;
