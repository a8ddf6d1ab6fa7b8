//! Health check token sealing and opening.
//!
//! The control plane sends the sealed token in the probe request header.
//! A node opens it with its own key, so a probe cannot be forged by anyone
//! who does not know the node's credentials.

use crate::error::{SignerError, SignerResult};
use crate::key::NodeKey;
use aes_gcm::Nonce;
use aes_gcm::aead::Aead;
use base64::Engine;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const NONCE_LEN: usize = 12;

/// Probe payload carried inside the token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckPayload {
    /// Ask the node to answer without touching upstream services.
    pub only_basic_request: bool,
    /// Unix seconds at issue time.
    pub timestamp: i64,
}

impl HealthCheckPayload {
    pub fn now(only_basic_request: bool) -> Self {
        Self {
            only_basic_request,
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }
}

/// Seals and opens health check tokens for one node.
#[derive(Clone, Debug)]
pub struct HealthCheckSigner {
    key: NodeKey,
}

impl HealthCheckSigner {
    pub fn new(key: NodeKey) -> Self {
        Self { key }
    }

    pub fn for_node(unique_id: &str, secret: &str) -> SignerResult<Self> {
        Ok(Self::new(NodeKey::derive(unique_id, secret)?))
    }

    /// `base64(nonce || ciphertext)` of the JSON payload.
    pub fn seal(&self, payload: &HealthCheckPayload) -> SignerResult<String> {
        let plaintext = serde_json::to_vec(payload)
            .map_err(|e| SignerError::Encryption(format!("payload encoding: {e}")))?;
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();

        let ciphertext = self
            .key
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|e| SignerError::Encryption(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
    }

    pub fn open(&self, token: &str) -> SignerResult<HealthCheckPayload> {
        let sealed = base64::engine::general_purpose::STANDARD
            .decode(token.trim())
            .map_err(|e| SignerError::InvalidToken(format!("invalid base64: {e}")))?;
        if sealed.len() <= NONCE_LEN {
            return Err(SignerError::InvalidToken(format!(
                "expected more than {NONCE_LEN} bytes, got {}",
                sealed.len()
            )));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .key
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SignerError::DecryptionFailed)?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| SignerError::InvalidToken(format!("invalid payload: {e}")))
    }

    /// Open a token and reject it when older than `max_age_secs`.
    pub fn open_fresh(&self, token: &str, max_age_secs: i64) -> SignerResult<HealthCheckPayload> {
        let payload = self.open(token)?;
        let age_secs = OffsetDateTime::now_utc().unix_timestamp() - payload.timestamp;
        if age_secs > max_age_secs {
            return Err(SignerError::Expired { age_secs });
        }
        Ok(payload)
    }
}
