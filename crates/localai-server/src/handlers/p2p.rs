//! P2P federation handlers.

use super::{ApiError, ApiResult};
use crate::server::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use localai_core::NodeListing;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct P2pNodes {
    pub enabled: bool,
    pub workers: Vec<NodeListing>,
    pub federated: Vec<NodeListing>,
}

pub async fn p2p_nodes(State(state): State<Arc<AppState>>) -> Json<P2pNodes> {
    Json(P2pNodes {
        enabled: state.api.p2p_enabled(),
        workers: state.api.worker_nodes(),
        federated: state.api.federated_nodes(),
    })
}

/// The token other nodes need to join this network.
pub async fn p2p_token(State(state): State<Arc<AppState>>) -> ApiResult<Value> {
    match &state.api.config().p2p {
        Some(options) => Ok(Json(json!({"token": options.token}))),
        None => Err(ApiError::not_found("P2P is not enabled")),
    }
}

pub async fn ledger_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Json<BTreeMap<String, Value>> {
    Json(state.api.ledger_bucket(&bucket))
}

pub async fn ledger_value(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> ApiResult<Value> {
    state
        .api
        .ledger_value(&bucket, &key)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("No ledger entry {}/{}", bucket, key)))
}

#[derive(Debug, Deserialize)]
pub struct ExposeBody {
    pub service_id: String,
    pub host: String,
    pub port: u16,
}

/// Announce a local service to the network.
pub async fn expose_service(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExposeBody>,
) -> ApiResult<Value> {
    if body.service_id.trim().is_empty() || body.host.trim().is_empty() {
        return Err(ApiError::bad_request("service_id and host are required"));
    }
    if !state
        .api
        .expose_service(&body.host, body.port, &body.service_id)
    {
        return Err(ApiError::bad_request("P2P is not enabled"));
    }
    Ok(Json(json!({"success": true})))
}
