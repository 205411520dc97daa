use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderValue},
    middleware,
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::set_header::SetResponseHeaderLayer;

use cms_dispatch::DispatcherStatus;
use cms_ratelimit::{enforce_quota, QuotaGate, RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: DispatcherStatus,
    pub rate_limiter: Arc<RateLimiter>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub dispatcher: DispatcherReport,
    pub rate_limiter: RateLimiterReport,
}

#[derive(Debug, Serialize)]
pub struct DispatcherReport {
    pub running: bool,
    pub ticks: u64,
    pub failed_ticks: u64,
}

#[derive(Debug, Serialize)]
pub struct RateLimiterReport {
    /// True while the shared counter is failing and hits are counted locally.
    pub degraded: bool,
}

async fn root() -> &'static str {
    "cms-worker"
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        dispatcher: DispatcherReport {
            running: state.dispatcher.is_running(),
            ticks: state.dispatcher.ticks(),
            failed_ticks: state.dispatcher.failed_ticks(),
        },
        rate_limiter: RateLimiterReport {
            degraded: state.rate_limiter.is_degraded(),
        },
    })
}

pub fn router(state: AppState, gate: Arc<QuotaGate>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/status", get(status))
        .with_state(state)
        .layer(middleware::from_fn_with_state(gate, enforce_quota))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                },
            ),
        )
}
