//! Session lifecycle and state endpoints

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    Extension,
};
use serde::Deserialize;

use crate::proxy::error::ProxyError;
use crate::proxy::middleware::session::SessionId;
use crate::proxy::server::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct SubscribePayload {
    /// Opaque caller data stored verbatim on the session
    #[serde(default)]
    pub user_data: serde_json::Map<String, serde_json::Value>,
}

/// Create a work session for the connecting client.
pub async fn subscribe(
    State(state): State<AppState>,
    Extension(peer): Extension<SocketAddr>,
    headers: HeaderMap,
    payload: Option<Json<SubscribePayload>>,
) -> impl IntoResponse {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let user_data = payload.map(|Json(p)| p.user_data).unwrap_or_default();

    let session_id = state
        .registry
        .create(peer.ip().to_string(), user_agent, user_data)
        .await;

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "OK",
            "session": { "session_id": session_id },
        })),
    )
}

/// Remove the current work session. Idempotent.
pub async fn unsubscribe(
    State(state): State<AppState>,
    Extension(SessionId(session_id)): Extension<SessionId>,
) -> impl IntoResponse {
    let existed = state.registry.delete(&session_id).await;
    Json(serde_json::json!({
        "status": "OK",
        "existed": existed,
        "detail": "Session deleted successfully",
    }))
}

/// Merge custom headers into the session (right-biased on collisions).
pub async fn set_headers(
    State(state): State<AppState>,
    Extension(SessionId(session_id)): Extension<SessionId>,
    Json(payload): Json<HashMap<String, String>>,
) -> Result<impl IntoResponse, ProxyError> {
    state.registry.set_headers(&session_id, payload).await?;
    Ok(Json(serde_json::json!({
        "status": "OK",
        "detail": "Custom headers set successfully",
    })))
}

/// Current persisted headers of the session.
pub async fn get_headers(
    State(state): State<AppState>,
    Extension(SessionId(session_id)): Extension<SessionId>,
) -> Result<impl IntoResponse, ProxyError> {
    let headers = state.registry.get_headers(&session_id).await?;
    Ok(Json(serde_json::json!({
        "status": "OK",
        "headers": headers,
    })))
}

/// Current cookie jar of the session.
pub async fn get_cookies(
    State(state): State<AppState>,
    Extension(SessionId(session_id)): Extension<SessionId>,
) -> Result<impl IntoResponse, ProxyError> {
    let cookies = state.registry.get_cookies(&session_id).await?;
    Ok(Json(serde_json::json!({
        "status": "OK",
        "cookies": cookies,
    })))
}

/// Full session snapshot: headers, cookies, metadata, timestamps.
pub async fn get_session_info(
    State(state): State<AppState>,
    Extension(SessionId(session_id)): Extension<SessionId>,
) -> Result<impl IntoResponse, ProxyError> {
    let info = state.registry.get_info(&session_id).await?;
    Ok(Json(serde_json::json!({
        "status": "OK",
        "info": info,
    })))
}

/// Empty the session's headers and cookies, keeping the session alive.
pub async fn clear_session(
    State(state): State<AppState>,
    Extension(SessionId(session_id)): Extension<SessionId>,
) -> Result<impl IntoResponse, ProxyError> {
    state.registry.clear(&session_id).await?;
    Ok(Json(serde_json::json!({
        "status": "OK",
        "detail": "Session cookies and headers cleared",
    })))
}
