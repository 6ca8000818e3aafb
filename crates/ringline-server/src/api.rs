//! HTTP error mapping for the call API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ringline_types::{CallError, CallState};
use serde::Serialize;
use thiserror::Error;

/// A [`CallError`] plus the call context worth echoing back to the client.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ApiError {
    pub error: CallError,
    pub call_id: Option<String>,
    pub state: Option<CallState>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: String,
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    call_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<CallState>,
}

impl ApiError {
    pub fn for_call(error: CallError, call_id: impl Into<String>) -> Self {
        Self {
            error,
            call_id: Some(call_id.into()),
            state: None,
        }
    }

    pub fn with_state(mut self, state: CallState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn status(&self) -> StatusCode {
        match self.error {
            CallError::NotFound(_) => StatusCode::NOT_FOUND,
            CallError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CallError::LimitReached(_) => StatusCode::TOO_MANY_REQUESTS,
            CallError::ProviderError(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<CallError> for ApiError {
    fn from(error: CallError) -> Self {
        Self {
            error,
            call_id: None,
            state: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.error.to_string(),
            code: self.error.code(),
            call_id: self.call_id.as_deref(),
            state: self.state,
        });
        (self.status(), body).into_response()
    }
}
