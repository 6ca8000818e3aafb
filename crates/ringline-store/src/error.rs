//! Error types for call persistence.

/// Errors that can occur while writing or reading the call log.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The log file could not be opened, written or read.
    #[error("call log io error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be serialised.
    #[error("call log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
