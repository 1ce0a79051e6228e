//! Request middleware: access logging and the two rate-limit layers.
//!
//! Composed outermost to innermost: access log → global limiter (remote
//! address) → per-client limiter (X-API-Key) → router.

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::ratelimit::RateLimiter;
use crate::server::AppState;

const API_KEY_HEADER: &str = "x-api-key";

const GLOBAL_LIMIT_BODY: &str = r#"{"code":429,"message":"rate limit exceeded"}"#;
const CLIENT_LIMIT_BODY: &str = r#"{"code":429,"message":"client rate limit exceeded"}"#;

/// Logs every request on entry and again on completion with elapsed time.
pub async fn access_log(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    tracing::info!(
        request_id = %request_id,
        method = %method,
        uri = %uri,
        "request received"
    );

    let response = next.run(request).await;

    tracing::info!(
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );
    response
}

/// Global edge limiter keyed by the peer socket address.
pub async fn global_rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if state.global_limiter.allow(&addr.to_string()) {
        next.run(request).await
    } else {
        tracing::warn!(remote = %addr, "rate limit exceeded");
        too_many_requests(GLOBAL_LIMIT_BODY)
    }
}

/// Per-client limiter. Requests without an `X-API-Key` header bypass it.
pub async fn client_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let api_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|key| !key.is_empty())
        .map(str::to_owned);

    if let (Some(key), Some(manager)) = (api_key, state.manager.as_ref()) {
        if !manager.allow(&key) {
            tracing::warn!(api_key = %key, "client rate limit exceeded");
            return too_many_requests(CLIENT_LIMIT_BODY);
        }
    }
    next.run(request).await
}

fn too_many_requests(body: &'static str) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}
