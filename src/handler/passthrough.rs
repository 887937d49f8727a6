//! Transparent passthrough for any path the routing table doesn't claim.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use super::AppState;

/// Upper bound on a passed-through request body, to keep a misbehaving
/// downstream from exhausting memory via this handler.
const MAX_PASSTHROUGH_BODY_BYTES: usize = 16 * 1024 * 1024;

pub async fn passthrough(State(state): State<AppState>, req: Request) -> Response {
    state.record_request().await;

    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map_or_else(|| req.uri().path().to_string(), |pq| pq.as_str().to_string());
    let headers = req.headers().clone();

    let Ok(body) = axum::body::to_bytes(req.into_body(), MAX_PASSTHROUGH_BODY_BYTES).await else {
        return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
    };

    match state
        .0
        .upstream
        .forward(method, &path_and_query, headers, body)
        .await
    {
        Ok(upstream_response) => {
            let status = upstream_response.status();
            let headers = upstream_response.headers().clone();
            let body = upstream_response.bytes().await.unwrap_or_default();

            let mut builder = Response::builder().status(status);
            for (name, value) in &headers {
                builder = builder.header(name, value);
            }
            builder
                .body(Body::from(body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) => {
            state.record_upstream_failure().await;
            tracing::error!(error = %err, "passthrough request to upstream failed");
            err.into_response()
        }
    }
}
