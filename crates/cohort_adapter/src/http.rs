#![forbid(unsafe_code)]

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::{
    error_response, AdapterError, AdapterRuntime, ContractCreateGroupRequest,
    ContractUpdateMetadataRequest, EnrollAdapterRequest, UpdateMetadataAdapterRequest,
};

pub fn router(runtime: Arc<AdapterRuntime>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/allocate", post(enroll))
        .route("/api/groups", get(list_groups))
        .route("/api/groups/:group_id/history", get(group_history))
        .route("/api/update_metadata", post(update_metadata))
        .route("/api/contract/create_group", post(contract_create_group))
        .route("/api/contract/update_metadata", post(contract_update_metadata))
        .route("/api/allocation/run", post(run_allocation))
        .with_state(runtime)
}

fn respond<T: Serialize>(op: &'static str, result: Result<T, AdapterError>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => {
            let (status, body) = error_response(op, &err);
            (status, Json(body)).into_response()
        }
    }
}

/// Malformed, mistyped or wrongly labelled bodies are a 400 like any other
/// validation failure.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AdapterError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AdapterError::BadRequest(rejection.body_text()))
}

async fn healthz(State(runtime): State<Arc<AdapterRuntime>>) -> Response {
    respond("healthz", runtime.health_report().await)
}

async fn enroll(
    State(runtime): State<Arc<AdapterRuntime>>,
    payload: Result<Json<EnrollAdapterRequest>, JsonRejection>,
) -> Response {
    respond("allocate", json_body(payload).and_then(|r| runtime.enroll(r)))
}

async fn list_groups(State(runtime): State<Arc<AdapterRuntime>>) -> Response {
    respond("groups", runtime.list_groups().await)
}

async fn group_history(
    State(runtime): State<Arc<AdapterRuntime>>,
    Path(group_id): Path<u64>,
) -> Response {
    respond("group_history", runtime.group_history(group_id).await)
}

async fn update_metadata(
    State(runtime): State<Arc<AdapterRuntime>>,
    payload: Result<Json<UpdateMetadataAdapterRequest>, JsonRejection>,
) -> Response {
    let result = match json_body(payload) {
        Ok(request) => runtime.update_metadata(request).await,
        Err(err) => Err(err),
    };
    respond("update_metadata", result)
}

async fn contract_create_group(
    State(runtime): State<Arc<AdapterRuntime>>,
    payload: Result<Json<ContractCreateGroupRequest>, JsonRejection>,
) -> Response {
    let result = match json_body(payload) {
        Ok(request) => runtime.contract_create_group(request).await,
        Err(err) => Err(err),
    };
    respond("contract_create_group", result)
}

async fn contract_update_metadata(
    State(runtime): State<Arc<AdapterRuntime>>,
    payload: Result<Json<ContractUpdateMetadataRequest>, JsonRejection>,
) -> Response {
    let result = match json_body(payload) {
        Ok(request) => runtime.contract_update_metadata(request).await,
        Err(err) => Err(err),
    };
    respond("contract_update_metadata", result)
}

async fn run_allocation(State(runtime): State<Arc<AdapterRuntime>>) -> Response {
    respond("allocation_run", runtime.run_allocation().await)
}
