//! Configuration: CLI flags and environment variables.
//!
//! Parsed once at startup with `clap`; an invalid value aborts startup before
//! any listener is bound.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

/// Top-level signaling server configuration.
///
/// Every field can be set via
/// environment variable (the `env` attribute) or an equivalent CLI flag;
/// environment variables are the documented mechanism, flags exist for
/// local development convenience.
#[derive(Parser, Debug, Clone)]
#[command(name = "webrtc-signal-server", version, about)]
pub struct Config {
    /// Address to bind the HTTP/WebSocket listener on.
    #[clap(long, env = "SIGNAL_LISTEN_ADDRESS", default_value = "0.0.0.0:8080")]
    pub listen_address: SocketAddr,

    /// Path the WebSocket upgrade endpoint is served on.
    #[clap(long, env = "SIGNAL_ENDPOINT_PATH", default_value = "/ws")]
    pub endpoint_path: String,

    /// Session time-to-live from creation.
    #[clap(
        long,
        env = "SIGNAL_SESSION_TTL",
        default_value = "1h",
        value_parser = humantime::parse_duration,
    )]
    pub session_ttl: Duration,

    /// Interval between expiry sweeper ticks.
    #[clap(
        long,
        env = "SIGNAL_SWEEP_INTERVAL",
        default_value = "5min",
        value_parser = humantime::parse_duration,
    )]
    pub sweep_interval: Duration,

    /// Maximum accepted frame size, in bytes.
    #[clap(long, env = "SIGNAL_MAX_FRAME_BYTES", default_value = "1048576")]
    pub max_frame_bytes: usize,

    /// Acceptable clock skew for a message's `timestamp` field, in milliseconds.
    #[clap(long, env = "SIGNAL_TIMESTAMP_SKEW_MS", default_value = "300000")]
    pub timestamp_skew_ms: i64,

    /// Maximum concurrent transport connections.
    #[clap(long, env = "SIGNAL_CONNECTION_CAP", default_value = "10000")]
    pub connection_cap: usize,

    /// Maximum live sessions. Defaults to half the connection cap if unset.
    #[clap(long, env = "SIGNAL_SESSION_CAP")]
    pub session_cap: Option<usize>,

    /// How long a relay may stall against a saturated peer before the
    /// session is closed with `SLOW_PEER`.
    #[clap(
        long,
        env = "SIGNAL_SLOW_PEER_STALL",
        default_value = "30s",
        value_parser = humantime::parse_duration,
    )]
    pub slow_peer_stall: Duration,

    /// Per-address session creations allowed per hour.
    #[clap(long, env = "SIGNAL_RATE_LIMIT_CREATE_PER_HOUR", default_value = "10")]
    pub rate_limit_create_per_hour: u32,

    /// Per-address joins allowed per hour.
    #[clap(long, env = "SIGNAL_RATE_LIMIT_JOIN_PER_HOUR", default_value = "20")]
    pub rate_limit_join_per_hour: u32,

    /// Per-address inbound messages allowed per minute.
    #[clap(long, env = "SIGNAL_RATE_LIMIT_MESSAGES_PER_MINUTE", default_value = "100")]
    pub rate_limit_messages_per_minute: u32,

    /// Per-address concurrent connections allowed.
    #[clap(long, env = "SIGNAL_RATE_LIMIT_CONNECTIONS", default_value = "5")]
    pub rate_limit_connections: u32,

    /// Minimum tracing log level.
    #[clap(long, env = "SIGNAL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Allowed CORS origin. `*` permits any origin (acceptable in development).
    #[clap(long, env = "SIGNAL_CORS_ORIGIN", default_value = "*")]
    pub cors_origin: String,

    /// Liveness timeout for the WebSocket heartbeat.
    #[clap(
        long,
        env = "SIGNAL_HEARTBEAT_TIMEOUT",
        default_value = "65s",
        value_parser = humantime::parse_duration,
    )]
    pub heartbeat_timeout: Duration,

    /// Outbound channel capacity per connection, in frames.
    #[clap(long, env = "SIGNAL_OUTBOUND_CHANNEL_CAPACITY", default_value = "64")]
    pub outbound_channel_capacity: usize,
}

/// Errors that make a parsed `Config` unfit to run with.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },
    #[error("endpoint_path must start with '/'")]
    EndpointPathMissingSlash,
}

impl Config {
    /// Parses configuration from CLI args and environment, then validates it.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if any value is out of range. The caller
    /// (`main`) treats this as a startup-abort condition.
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::parse();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.session_ttl.is_zero() {
            return Err(ConfigError::MustBePositive { field: "session_ttl" });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::MustBePositive { field: "sweep_interval" });
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::MustBePositive { field: "max_frame_bytes" });
        }
        if self.connection_cap == 0 {
            return Err(ConfigError::MustBePositive { field: "connection_cap" });
        }
        if !self.endpoint_path.starts_with('/') {
            return Err(ConfigError::EndpointPathMissingSlash);
        }
        Ok(())
    }

    /// Effective session cap: explicit value, or half the connection cap.
    #[must_use]
    pub fn effective_session_cap(&self) -> usize {
        self.session_cap.unwrap_or(self.connection_cap / 2)
    }
}
