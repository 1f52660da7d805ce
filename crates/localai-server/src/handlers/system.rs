//! System information handler.

use crate::server::AppState;
use axum::{extract::State, Json};
use localai_core::{ProcessStatus, SystemInfo};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct SystemResponse {
    #[serde(flatten)]
    pub info: SystemInfo,
    /// Backend names the runtime can start.
    pub backends: Vec<String>,
    pub loaded_models: Vec<ProcessStatus>,
}

pub async fn system_info(State(state): State<Arc<AppState>>) -> Json<SystemResponse> {
    Json(SystemResponse {
        info: state.api.system_info(),
        backends: state.api.runnable_backends(),
        loaded_models: state.api.loaded_models().await,
    })
}
