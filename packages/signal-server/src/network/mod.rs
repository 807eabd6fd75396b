//! Axum/tower glue: router assembly, the WebSocket/diagnostic handlers,
//! HTTP middleware, and graceful shutdown.

pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use handlers::AppState;
pub use module::NetworkModule;
pub use shutdown::{HealthState, ShutdownController};
