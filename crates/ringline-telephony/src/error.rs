//! Error types for telephony backends.

use std::time::Duration;

/// Errors that can occur while talking to a telephony provider.
#[derive(Debug, thiserror::Error)]
pub enum TelephonyError {
    /// The HTTP request itself failed.
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered with a non-success status.
    #[error("provider returned {status}: {body}")]
    Provider { status: u16, body: String },

    /// A provider response or webhook body could not be understood.
    #[error("invalid provider payload: {0}")]
    InvalidPayload(String),

    /// The operation did not finish in time.
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    /// The backend is misconfigured.
    #[error("invalid telephony configuration: {0}")]
    Config(String),
}
