//! HTTP handlers, split by domain.
//!
//! Every handler takes the shared [`AppState`] and returns JSON. Core errors
//! are mapped onto status codes through [`LocalAiError::http_status`].

mod backends;
mod models;
mod p2p;
mod system;

pub use backends::{apply_backend, delete_backend, installed_backends, list_backends};
pub use models::{
    apply_model, cancel_job, delete_model, installed_models, job_status, jobs, list_models,
    loaded_models, processing, shutdown_backend,
};
pub use p2p::{expose_service, ledger_bucket, ledger_value, p2p_nodes, p2p_token};
pub use system::system_info;

use crate::server::AppState;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use localai_core::LocalAiError;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Error returned by handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.status.as_u16(),
                "message": self.message,
                "type": self.status.canonical_reason().unwrap_or("error"),
            }
        }));
        (self.status, body).into_response()
    }
}

impl AppState {
    /// Map a core error, hiding the details of internal failures when
    /// opaque errors are on.
    pub fn error(&self, err: LocalAiError) -> ApiError {
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!("Request failed: {}", err);
        } else {
            debug!("Request rejected: {}", err);
        }

        if self.opaque_errors && status == StatusCode::INTERNAL_SERVER_ERROR {
            return ApiError::new(status, "an error occurred");
        }
        ApiError::new(status, err.to_string())
    }
}

pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Reject requests without a valid key when keys are configured.
///
/// Accepts `Authorization: Bearer <key>` or `x-api-key: <key>`.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if state.api_keys.is_empty() {
        return next.run(request).await;
    }

    let headers = request.headers();
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim);

    let authorized = [bearer, api_key]
        .into_iter()
        .flatten()
        .any(|key| state.api_keys.iter().any(|k| k == key));
    if !authorized {
        return ApiError::new(StatusCode::UNAUTHORIZED, "An authentication key is required")
            .into_response();
    }

    next.run(request).await
}

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}
