//! Error types for churn-tracker

use thiserror::Error;

/// Errors that can occur while tracking events or deriving metrics
#[derive(Debug, Error)]
pub enum ChurnError {
    /// The event store could not be read or written
    #[error("Data access error: {0}")]
    DataAccess(String),

    /// A tracking event was rejected before being persisted
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl ChurnError {
    /// Whether this error came from the storage layer
    pub fn is_data_access(&self) -> bool {
        matches!(self, ChurnError::DataAccess(_))
    }
}
