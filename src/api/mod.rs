pub mod error;
pub mod rte;
pub mod v1;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::controller::AppState;
use error::ApiError;

const BODY_LIMIT: usize = 64 * 1024;

pub fn router(state: AppState) -> Router {
    let timeout = state.cfg.server.request_timeout();
    Router::new()
        .nest("/rte", rte::router())
        .nest("/api/v1", v1::router())
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(DefaultBodyLimit::max(BODY_LIMIT))
                .layer(TimeoutLayer::new(timeout)),
        )
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
    strategy: &'static str,
    dispatches: usize,
}

pub async fn healthz(State(st): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: chrono::Utc::now(),
        strategy: st.manager.dispatcher_name(),
        dispatches: st.manager.history().len(),
    })
}

/// Prometheus text exposition of the service registry
pub async fn metrics(State(st): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let body = crate::metrics::render(&st.registry)
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
