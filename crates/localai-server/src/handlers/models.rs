//! Model gallery, operation and runtime handlers.

use super::{ApiError, ApiResult};
use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use localai_core::services::TaskType;
use localai_core::{
    GalleryModel, GalleryOpStatus, GalleryQuery, InstallRequest, LocalAiError, ProcessStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Body of `POST /models/apply`.
#[derive(Debug, Deserialize)]
pub struct ApplyModelBody {
    /// Gallery entry, `gallery@name`.
    #[serde(default)]
    pub id: String,
    /// URI to import when no gallery entry is named.
    #[serde(default)]
    pub url: String,
    #[serde(flatten)]
    pub request: InstallRequest,
}

/// Reference to a queued operation.
#[derive(Debug, Serialize)]
pub struct JobReference {
    pub uuid: String,
    pub status: String,
}

impl JobReference {
    pub(crate) fn new(uuid: String) -> Self {
        let status = format!("/models/jobs/{}", uuid);
        Self { uuid, status }
    }
}

pub async fn list_models(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GalleryQuery>,
) -> ApiResult<Vec<GalleryModel>> {
    let models = state
        .api
        .list_gallery_models(&query)
        .await
        .map_err(|e| state.error(e))?;
    Ok(Json(models))
}

pub async fn apply_model(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ApplyModelBody>,
) -> ApiResult<JobReference> {
    let name = if body.id.trim().is_empty() {
        body.url.as_str()
    } else {
        body.id.as_str()
    };
    let uuid = state
        .api
        .apply_model(name, body.request)
        .map_err(|e| state.error(e))?;
    Ok(Json(JobReference::new(uuid)))
}

pub async fn delete_model(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<JobReference> {
    let uuid = state.api.delete_model(&name).map_err(|e| state.error(e))?;
    Ok(Json(JobReference::new(uuid)))
}

/// Status of one operation. Queued operations report a waiting status
/// until the worker picks them up.
pub async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> ApiResult<GalleryOpStatus> {
    if let Some(status) = state.api.operation_status(&uuid) {
        return Ok(Json(status));
    }

    let queued = state
        .api
        .gallery_service()
        .op_cache()
        .map()
        .into_iter()
        .find(|(_, id)| *id == uuid);
    match queued {
        Some((element, id)) => Ok(Json(GalleryOpStatus {
            id,
            message: "waiting".to_string(),
            gallery_element_name: element,
            cancellable: true,
            ..Default::default()
        })),
        None => Err(state.error(LocalAiError::OperationNotFound { id: uuid })),
    }
}

pub async fn jobs(State(state): State<Arc<AppState>>) -> Json<HashMap<String, GalleryOpStatus>> {
    Json(state.api.operations())
}

pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> ApiResult<Value> {
    state
        .api
        .cancel_operation(&uuid)
        .map_err(|e| state.error(e))?;
    Ok(Json(json!({"success": true, "uuid": uuid})))
}

/// Elements with queued or running work.
pub async fn processing(State(state): State<Arc<AppState>>) -> Json<HashMap<String, TaskType>> {
    Json(state.api.processing_elements())
}

pub async fn installed_models(State(state): State<Arc<AppState>>) -> ApiResult<Vec<String>> {
    let names = state
        .api
        .installed_models()
        .await
        .map_err(|e| state.error(e))?;
    Ok(Json(names))
}

pub async fn loaded_models(State(state): State<Arc<AppState>>) -> Json<Vec<ProcessStatus>> {
    Json(state.api.loaded_models().await)
}

#[derive(Debug, Deserialize)]
pub struct ShutdownBody {
    pub model: String,
}

/// Stop the backend serving a model.
pub async fn shutdown_backend(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ShutdownBody>,
) -> ApiResult<Value> {
    if body.model.trim().is_empty() {
        return Err(ApiError::bad_request("model is required"));
    }
    state
        .api
        .unload_model(&body.model)
        .await
        .map_err(|e| state.error(e))?;
    Ok(Json(json!({"success": true})))
}
