//! Request dispatch to upstream backends.
//!
//! # Responsibilities
//! - Ask the balancer for a backend, mapping an empty pool to 503
//! - Pair connection accounting with an RAII guard on every exit path
//! - Rewrite the request URI (scheme + authority only) and forward
//! - Map upstream transport failures to 502; pass responses through
//!   unchanged, streamed, with no extra buffering

use axum::{
    body::Body,
    extract::{Request, State},
    http::{
        uri::{PathAndQuery, Scheme},
        StatusCode, Uri,
    },
    response::{IntoResponse, Response},
};
use hyper_util::client::legacy::{connect::HttpConnector, Client};

use crate::balancer::{Balancer, ConnGuard};
use crate::server::AppState;

/// Shared upstream client, connection-pooled by the hyper-util legacy client.
pub type HttpClient = Client<HttpConnector, Body>;

/// Fallback handler: everything that is not the admin surface lands here.
pub async fn forward(State(state): State<AppState>, mut request: Request) -> Response {
    let Some(backend) = state.balancer.next() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no servers available").into_response();
    };

    // Held to the end of the handler so the decrease runs on success,
    // failure, panic, and cancellation alike.
    let _guard = state
        .balancer
        .conn_aware()
        .map(|conn| ConnGuard::new(conn, backend.clone()));

    let target: Uri = match backend.as_str().parse() {
        Ok(uri) => uri,
        Err(err) => {
            tracing::error!(backend = %backend, error = %err, "invalid backend URL");
            return (StatusCode::INTERNAL_SERVER_ERROR, "bad server URL").into_response();
        }
    };
    let Some(authority) = target.authority().cloned() else {
        tracing::error!(backend = %backend, "backend URL has no authority");
        return (StatusCode::INTERNAL_SERVER_ERROR, "bad server URL").into_response();
    };

    let mut parts = request.uri().clone().into_parts();
    parts.scheme = Some(target.scheme().cloned().unwrap_or(Scheme::HTTP));
    parts.authority = Some(authority);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    match Uri::from_parts(parts) {
        Ok(uri) => *request.uri_mut() = uri,
        Err(err) => {
            tracing::error!(backend = %backend, error = %err, "URI rewrite failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "bad server URL").into_response();
        }
    }

    tracing::info!(
        method = %request.method(),
        uri = %request.uri(),
        backend = %backend,
        "proxying request"
    );

    match state.client.request(request).await {
        Ok(response) => {
            // Upstream status codes, 5xx included, pass through unchanged.
            let (parts, body) = response.into_parts();
            Response::from_parts(parts, Body::new(body))
        }
        Err(err) => {
            tracing::error!(backend = %backend, error = %err, "upstream request failed");
            (StatusCode::BAD_GATEWAY, "bad gateway").into_response()
        }
    }
}
