//! Liveness endpoint backed by the background health check.

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::health::HealthStatus;
use crate::state::AppState;

/// `425` before the first check finishes, `503` with the error text after a
/// failed check, `200` after a passing one.
pub async fn healthz(State(state): State<AppState>) -> Response {
    match state.health.status() {
        HealthStatus::Pending => (too_early(), "health check pending").into_response(),
        HealthStatus::Unhealthy(reason) => (StatusCode::SERVICE_UNAVAILABLE, reason).into_response(),
        HealthStatus::Healthy => (StatusCode::OK, "ok").into_response(),
    }
}

fn too_early() -> StatusCode {
    StatusCode::from_u16(425).unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
}

/// Create health check routes.
pub fn health_routes(path: &str) -> Router<AppState> {
    Router::new().route(path, get(healthz))
}
