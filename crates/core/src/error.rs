//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid node role: {0}")]
    InvalidRole(String),

    #[error("invalid entity kind: {0}")]
    InvalidEntityKind(String),

    #[error("invalid task kind: {0}")]
    InvalidTaskKind(String),

    #[error("invalid entity state: {0}")]
    InvalidEntityState(String),

    #[error("invalid version request: {0}")]
    InvalidVersion(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("invalid health check policy: {0}")]
    InvalidPolicy(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
