//! Binary entry point for the WebRTC signaling broker: startup and shutdown
//! sequencing.
//!
//! Startup order: parse and validate configuration, install logging and the
//! metrics recorder, allocate shared state, bind the listener, spawn the
//! expiry sweeper, then start serving. An invalid configuration or a failed
//! bind aborts before any connection is accepted.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};
use webrtc_signal_server::config::Config;
use webrtc_signal_server::network::NetworkModule;
use webrtc_signal_server::{metrics as app_metrics, sweeper};

#[tokio::main]
async fn main() {
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(1);
        }
    };

    init_tracing(&config.log_level);

    if let Err(err) = PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], 9090))
        .install()
    {
        error!(%err, "failed to install prometheus recorder, metrics will be unavailable");
    }
    app_metrics::describe_metrics();

    let mut network = NetworkModule::new(config);
    let port = match network.start().await {
        Ok(port) => port,
        Err(err) => {
            error!(%err, "failed to bind listener");
            std::process::exit(1);
        }
    };
    info!(port, "listening");

    let sweeper_handle = tokio::spawn(sweeper::run(
        network.registry(),
        network.hub(),
        network.diagnostics(),
        network.config().sweep_interval,
        network.shutdown_controller().shutdown_receiver(),
    ));

    if let Err(err) = network.serve(shutdown_signal()).await {
        error!(%err, "server exited with an error");
        sweeper_handle.abort();
        std::process::exit(1);
    }

    sweeper_handle.abort();
}

/// Resolves once either `SIGINT` (ctrl-c) or `SIGTERM` is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c, starting graceful shutdown"),
        () = terminate => info!("received SIGTERM, starting graceful shutdown"),
    }
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
