//! Agent-facing call API.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::Json,
};
use ringline_types::{CallError, CallRecord};
use serde::Deserialize;

use crate::api::ApiError;
use crate::orchestrator::{
    ContinueCallResult, EndCallResult, InitiateCall, InitiateCallResult, SpeakResult,
};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub active: bool,
}

/// Attaches the call's current state, when it has one, to an error.
async fn call_error(state: &AppState, call_id: &str, error: CallError) -> ApiError {
    let err = ApiError::for_call(error, call_id);
    match state.store.get(call_id).await {
        Ok(record) => err.with_state(record.state),
        Err(_) => err,
    }
}

/// POST /api/calls
pub async fn initiate_call_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<InitiateCall>,
) -> Result<(StatusCode, Json<InitiateCallResult>), ApiError> {
    let result = state.orchestrator.initiate_call(payload).await?;
    Ok((StatusCode::CREATED, Json(result)))
}

/// GET /api/calls
pub async fn list_calls_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Json<Vec<CallRecord>> {
    Json(state.orchestrator.list_calls(params.active).await)
}

/// GET /api/calls/{callId}
pub async fn get_call_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> Result<Json<CallRecord>, ApiError> {
    state
        .orchestrator
        .get_status(&call_id)
        .await
        .map(Json)
        .map_err(|e| ApiError::for_call(e, &call_id))
}

/// POST /api/calls/{callId}/continue
pub async fn continue_call_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(call_id): Path<String>,
    Json(payload): Json<MessageRequest>,
) -> Result<Json<ContinueCallResult>, ApiError> {
    match state
        .orchestrator
        .continue_call(&call_id, &payload.message)
        .await
    {
        Ok(result) => Ok(Json(result)),
        Err(e) => Err(call_error(&state, &call_id, e).await),
    }
}

/// POST /api/calls/{callId}/speak
pub async fn speak_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(call_id): Path<String>,
    Json(payload): Json<MessageRequest>,
) -> Result<Json<SpeakResult>, ApiError> {
    match state
        .orchestrator
        .speak_to_user(&call_id, &payload.message)
        .await
    {
        Ok(result) => Ok(Json(result)),
        Err(e) => Err(call_error(&state, &call_id, e).await),
    }
}

/// POST /api/calls/{callId}/end
pub async fn end_call_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> Result<Json<EndCallResult>, ApiError> {
    match state.orchestrator.end_call(&call_id).await {
        Ok(result) => Ok(Json(result)),
        Err(e) => Err(call_error(&state, &call_id, e).await),
    }
}
