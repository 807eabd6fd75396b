//! HTTP middleware stack for the signaling server.
//!
//! Builds the Tower middleware pipeline applied to HTTP requests. Middleware
//! ordering follows the outer-to-inner convention: the first layer listed is
//! the outermost (processes the request first on the way in, and the
//! response last on the way out).
//!
//! The WebSocket upgrade route does not get the full stack: compression
//! makes no sense on a `101 Switching Protocols` response, and a request
//! timeout must not apply to a connection that is expected to live for
//! hours. [`build_http_layers`] is for diagnostic (plain JSON) routes only;
//! [`build_ws_layers`] is the reduced stack for the upgrade route.

use std::time::Duration;

use axum::http::header::HeaderName;
use axum::http::{Method, StatusCode};
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;

/// How long a diagnostic HTTP request may take before the server answers
/// with `408 Request Timeout`. Not configurable: these routes only ever do
/// an atomic load and a mutex-guarded length check, so a slow response
/// means something is already wrong.
const DIAGNOSTIC_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The composed Tower layer type produced by [`build_http_layers`].
type HttpLayers = tower::layer::util::Stack<
    PropagateRequestIdLayer,
    tower::layer::util::Stack<
        TimeoutLayer,
        tower::layer::util::Stack<
            CorsLayer,
            tower::layer::util::Stack<
                CompressionLayer,
                tower::layer::util::Stack<
                    TraceLayer<
                        tower_http::classify::SharedClassifier<
                            tower_http::classify::ServerErrorsAsFailures,
                        >,
                    >,
                    tower::layer::util::Stack<
                        SetRequestIdLayer<MakeRequestUuid>,
                        tower::layer::util::Identity,
                    >,
                >,
            >,
        >,
    >,
>;

/// The composed Tower layer type produced by [`build_ws_layers`]: the same
/// stack minus `Compression` and `Timeout`.
type WsLayers = tower::layer::util::Stack<
    PropagateRequestIdLayer,
    tower::layer::util::Stack<
        CorsLayer,
        tower::layer::util::Stack<
            TraceLayer<
                tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>,
            >,
            tower::layer::util::Stack<SetRequestIdLayer<MakeRequestUuid>, tower::layer::util::Identity>,
        >,
    >,
>;

/// Builds the HTTP-level Tower middleware stack for diagnostic routes.
///
/// **Middleware ordering (outermost to innermost):**
/// 1. `SetRequestId` -- assigns a UUID v4 `X-Request-Id` to every incoming request
/// 2. `Tracing` -- logs request/response with structured trace spans
/// 3. `Compression` -- gzip response compression for bandwidth savings
/// 4. `CORS` -- Cross-Origin Resource Sharing based on the configured origin
/// 5. `Timeout` -- enforces a maximum request processing duration
/// 6. `PropagateRequestId` -- copies `X-Request-Id` from the request to the response
#[must_use]
pub fn build_http_layers(config: &Config) -> HttpLayers {
    let x_request_id = HeaderName::from_static("x-request-id");
    let cors = build_cors_layer(&config.cors_origin);

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            DIAGNOSTIC_REQUEST_TIMEOUT,
        ))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .into_inner()
}

/// Builds the reduced middleware stack for the WebSocket upgrade route:
/// request id propagation, tracing and CORS only. No compression (there is
/// no body to compress once the response is a protocol switch) and no
/// timeout (the connection the upgrade hands off to is meant to outlive any
/// HTTP request timeout by design).
#[must_use]
pub fn build_ws_layers(config: &Config) -> WsLayers {
    let x_request_id = HeaderName::from_static("x-request-id");
    let cors = build_cors_layer(&config.cors_origin);

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .into_inner()
}

/// Builds the CORS layer from the configured origin.
///
/// A wildcard `"*"` allows any origin. Otherwise the single configured
/// origin is parsed and used as an explicit allowlist of one.
fn build_cors_layer(origin: &str) -> CorsLayer {
    let allow_origin = if origin == "*" {
        AllowOrigin::any()
    } else {
        match origin.parse() {
            Ok(parsed) => AllowOrigin::list([parsed]),
            Err(_) => AllowOrigin::list([]),
        }
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}
