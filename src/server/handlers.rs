//! HTTP route handlers

use axum::{
    body::Bytes,
    extract::{Extension, Json, Path, Query},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{error, instrument};

use crate::server::AppState;
use crate::transport::{self, Transport};

/// `GET /`
pub async fn root(
    Extension(state): Extension<Arc<AppState>>,
    method: Method,
) -> Response {
    dispatch(&state, transport::Request::new(method)).await
}

/// Any other path
#[instrument(skip(state, query, body))]
pub async fn forward(
    Extension(state): Extension<Arc<AppState>>,
    method: Method,
    Path(path): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Response {
    let mut request = transport::Request::new(method);
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        request = request.segment(segment);
    }
    for (key, value) in query {
        request = request.param(key, value);
    }
    if !body.is_empty() {
        match serde_json::from_slice(&body) {
            Ok(json) => request = request.json(json),
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "error": "bad_request",
                        "reason": format!("invalid UTF-8 JSON: {}", e),
                    })),
                )
                    .into_response();
            }
        }
    }

    dispatch(&state, request).await
}

async fn dispatch(state: &AppState, request: transport::Request) -> Response {
    match state.engine.send(request).await {
        Ok(reply) => {
            let status =
                StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(reply.body)).into_response()
        }
        Err(e) => {
            error!(error = %e, "Engine failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": "unknown_error",
                    "reason": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}
