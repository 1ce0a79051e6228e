//! Admin surface: client quota CRUD under `/clients`.
//!
//! - `POST /clients?id=<id>` with a JSON bucket config → 201
//! - `GET /clients/<id>` → config + current tokens
//! - `DELETE /clients/<id>` → 204
//!
//! Other methods on these paths get 405 from the method router.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::ratelimit::{ClientConfig, ManagerError};
use crate::server::AppState;

#[derive(Deserialize)]
struct AddClientParams {
    id: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/clients", post(add_client))
        // Wildcard so multi-segment ids 404 here instead of being proxied.
        .route("/clients/{*id}", get(get_client).delete(remove_client))
}

async fn add_client(
    State(state): State<AppState>,
    Query(params): Query<AddClientParams>,
    body: Result<Json<ClientConfig>, JsonRejection>,
) -> Response {
    let Some(manager) = state.manager.as_ref() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "service unavailable");
    };
    let Some(id) = params.id.filter(|id| !id.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing id");
    };
    let Ok(Json(config)) = body else {
        return error_response(StatusCode::BAD_REQUEST, "invalid body");
    };

    match manager.add_client(&id, config) {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(ManagerError::InvalidConfig(reason)) => {
            tracing::warn!(client = %id, reason, "rejected client config");
            error_response(StatusCode::BAD_REQUEST, "invalid body")
        }
        Err(err) => {
            tracing::error!(client = %id, error = %err, "add client failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

async fn get_client(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(manager) = state.manager.as_ref() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "service unavailable");
    };

    match manager.get_client(&id) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(ManagerError::NotFound) => error_response(StatusCode::NOT_FOUND, "not found"),
        Err(err) => {
            tracing::error!(client = %id, error = %err, "get client failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

async fn remove_client(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(manager) = state.manager.as_ref() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "service unavailable");
    };

    match manager.remove_client(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(ManagerError::NotFound) => error_response(StatusCode::NOT_FOUND, "not found"),
        Err(err) => {
            tracing::error!(client = %id, error = %err, "remove client failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
