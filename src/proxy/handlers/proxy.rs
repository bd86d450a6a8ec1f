//! Forwarding endpoints: buffered `/forward` and streamed `/download`

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    Extension,
};

use crate::proxy::error::ProxyError;
use crate::proxy::middleware::session::SessionId;
use crate::proxy::server::AppState;
use crate::proxy::upstream::ForwardPayload;

/// Forward an HTTP request under the session's accumulated state.
///
/// The upstream status code is passed through as the response status; only
/// connectivity-level faults surface as errors.
pub async fn forward(
    State(state): State<AppState>,
    Extension(SessionId(session_id)): Extension<SessionId>,
    Json(payload): Json<ForwardPayload>,
) -> Result<Response, ProxyError> {
    tracing::debug!(
        "Forwarding {} {} for session {}...",
        payload.method,
        payload.url,
        &session_id[..session_id.len().min(8)]
    );

    let reply = state
        .upstream
        .forward(&state.registry, &session_id, &payload)
        .await?;

    let status = StatusCode::from_u16(reply.status_code).unwrap_or(StatusCode::OK);
    Ok((status, Json(reply)).into_response())
}

/// Download a file through the session, relaying the body as a raw byte
/// stream so large files never reside fully in memory.
pub async fn download(
    State(state): State<AppState>,
    Extension(SessionId(session_id)): Extension<SessionId>,
    Json(payload): Json<ForwardPayload>,
) -> Result<Response, ProxyError> {
    tracing::debug!(
        "Downloading {} for session {}...",
        payload.url,
        &session_id[..session_id.len().min(8)]
    );

    let reply = state
        .upstream
        .download(&state.registry, &session_id, &payload)
        .await?;

    let status = StatusCode::from_u16(reply.status_code).unwrap_or(StatusCode::OK);
    let content_disposition = format!("attachment; filename=\"{}\"", reply.filename);

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, reply.content_type)
        .header(header::CONTENT_DISPOSITION, content_disposition)
        .body(Body::from_stream(reply.response.bytes_stream()))
        .map_err(|e| ProxyError::InvalidRequest(format!("Failed to build response: {}", e)))
}
