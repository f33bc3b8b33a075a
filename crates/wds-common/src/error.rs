//! Error types for the WDS pipeline

use thiserror::Error;

/// Result type alias for WDS operations
pub type Result<T> = std::result::Result<T, WdsError>;

/// Contract-level errors for WDS naming schemes
#[derive(Error, Debug)]
pub enum WdsError {
    #[error("Invalid batch prefix: {0}")]
    InvalidPrefix(String),

    #[error("Invalid shard locator: {0}")]
    InvalidLocator(String),
}
