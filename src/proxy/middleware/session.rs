// Session validation middleware
//
// Every route except the open paths requires a live session id in the
// X-Session-ID header. Expired-on-access sessions are dropped here and the
// request is rejected, so handlers only ever see valid ids.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};

use crate::proxy::error::ProxyError;
use crate::proxy::server::AppState;

pub const SESSION_HEADER: &str = "x-session-id";

/// Paths that do not require a session.
const OPEN_PATHS: &[&str] = &["/health-check", "/subscribe", "/favicon.ico"];

/// Validated session id, stored as a request extension for handlers.
#[derive(Debug, Clone)]
pub struct SessionId(pub String);

pub async fn session_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if OPEN_PATHS.contains(&path) {
        return next.run(req).await;
    }

    let Some(session_id) = req
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": "Missing X-Session-ID header",
                "error_type": "InvalidRequest",
            })),
        )
            .into_response();
    };

    if !state.registry.validate(&session_id).await {
        return ProxyError::SessionNotFound.into_response();
    }

    // Counts as activity: refreshes last_used_at and the request counter
    let _ = state.registry.touch(&session_id).await;

    req.extensions_mut().insert(SessionId(session_id));
    next.run(req).await
}
