//! Signer error types.

use thiserror::Error;

/// Health check token errors.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("invalid token format: {0}")]
    InvalidToken(String),

    #[error("token expired: issued {age_secs}s ago")]
    Expired { age_secs: i64 },
}

/// Result type for signing operations.
pub type SignerResult<T> = std::result::Result<T, SignerError>;
