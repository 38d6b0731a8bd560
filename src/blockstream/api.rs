use super::server::{BlockStreamServer, ServerState};
use crate::pipeline::head::HeadInfo;
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadInfoResponse {
    pub head: Option<HeadInfo>,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub state: ServerState,
}

/// GET /health
pub async fn health_check() -> &'static str {
    "OK"
}

/// GET /healthz
pub async fn readiness(State(server): State<Arc<BlockStreamServer>>) -> Response {
    let state = server.state();
    let ready = state == ServerState::Ready;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready, state })).into_response()
}

/// GET /v1/head
pub async fn get_head(State(server): State<Arc<BlockStreamServer>>) -> Json<HeadInfoResponse> {
    Json(HeadInfoResponse {
        head: server.current_head(),
    })
}

/// GET /v1/blocks
///
/// Streams blocks as newline-delimited JSON from the moment of the request
/// until the server drains or the client disconnects.
pub async fn stream_blocks(
    State(server): State<Arc<BlockStreamServer>>,
) -> Result<Response, ApiError> {
    let subscription = server
        .subscribe()
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    info!(subscriber = %subscription.id(), "Block stream subscriber connected");

    let body = subscription.into_stream().map(|block| {
        let mut line = serde_json::to_vec(&*block)?;
        line.push(b'\n');
        Ok::<_, serde_json::Error>(line)
    });

    Ok((
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(body),
    )
        .into_response())
}

// Error handling
#[derive(Debug)]
pub enum ApiError {
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
