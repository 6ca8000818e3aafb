//! The user-facing call error taxonomy.

use thiserror::Error;

/// Errors surfaced to callers of call-management operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// No call with the given identifier exists.
    #[error("call not found: {0}")]
    NotFound(String),

    /// The request was malformed or the state machine rejected it.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The concurrency ceiling has been reached.
    #[error("concurrent call limit reached ({0} active)")]
    LimitReached(usize),

    /// The telephony backend failed.
    #[error("provider error: {0}")]
    ProviderError(String),
}

impl CallError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::LimitReached(_) => "limit_reached",
            Self::ProviderError(_) => "provider_error",
        }
    }
}
