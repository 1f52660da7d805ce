//! Backend gallery handlers.

use super::models::JobReference;
use super::{ApiError, ApiResult};
use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use localai_core::{GalleryBackend, GalleryQuery, SystemBackend};
use serde::Deserialize;
use std::sync::Arc;

/// Body of `POST /backends/apply`.
///
/// With `uri` set the backend is installed from that OCI image, URL or
/// directory under `name` (or `id`); otherwise `id` names a gallery entry.
#[derive(Debug, Default, Deserialize)]
pub struct ApplyBackendBody {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub alias: String,
    /// Reinstall even when already present.
    #[serde(default)]
    pub force: bool,
}

pub async fn list_backends(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GalleryQuery>,
) -> ApiResult<Vec<GalleryBackend>> {
    let backends = state
        .api
        .list_gallery_backends(&query)
        .await
        .map_err(|e| state.error(e))?;
    Ok(Json(backends))
}

pub async fn installed_backends(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<SystemBackend>> {
    let backends = state
        .api
        .installed_backends()
        .await
        .map_err(|e| state.error(e))?;
    Ok(Json(backends))
}

pub async fn apply_backend(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ApplyBackendBody>,
) -> ApiResult<JobReference> {
    let uuid = match body.uri.as_deref() {
        Some(uri) => {
            let name = body.name.as_deref().unwrap_or(&body.id);
            state.api.apply_backend_uri(name, uri, &body.alias)
        }
        None if body.id.trim().is_empty() => {
            return Err(ApiError::bad_request("id is required"));
        }
        None => state.api.apply_backend(&body.id, body.force),
    }
    .map_err(|e| state.error(e))?;
    Ok(Json(JobReference::new(uuid)))
}

pub async fn delete_backend(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<JobReference> {
    let uuid = state.api.delete_backend(&name).map_err(|e| state.error(e))?;
    Ok(Json(JobReference::new(uuid)))
}
