//! Health check endpoint

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};

use crate::proxy::server::AppState;

/// Report server status and internet connectivity.
///
/// 200 when the outbound probe succeeds, 503 when it does not; the server
/// itself answering at all is the "running" half of the check.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.upstream.check_connectivity().await;

    if report.reachable {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "OK",
                "internet": true,
                "detail": report.detail,
                "response_time_ms": report.response_time_ms,
                "active_sessions": state.registry.len(),
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "Service Unavailable",
                "internet": false,
                "detail": report.detail,
            })),
        )
    }
}
