//! Per-node symmetric key derived from the node's credentials.

use crate::error::{SignerError, SignerResult};
use aes_gcm::{Aes256Gcm, KeyInit};
use sha2::{Digest, Sha256};
use std::fmt;

const KEY_CONTEXT: &[u8] = b"meridian health-check key v1";

/// AES-256 key shared by the control plane and one node.
///
/// Both sides know the node's unique id and secret, so both derive the same
/// key without exchanging it.
#[derive(Clone)]
pub struct NodeKey {
    bytes: [u8; 32],
}

impl NodeKey {
    /// SHA-256 over a context label and the length-prefixed credentials, so
    /// shifting bytes between the id and the secret yields a different key.
    pub fn derive(unique_id: &str, secret: &str) -> SignerResult<Self> {
        if unique_id.is_empty() || secret.is_empty() {
            return Err(SignerError::KeyDerivation(
                "unique id and secret must not be empty".to_string(),
            ));
        }
        let mut hasher = Sha256::new();
        hasher.update(KEY_CONTEXT);
        for field in [unique_id, secret] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        Ok(Self {
            bytes: hasher.finalize().into(),
        })
    }

    pub(crate) fn cipher(&self) -> SignerResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.bytes)
            .map_err(|e| SignerError::KeyDerivation(format!("invalid key length: {e}")))
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey([REDACTED])")
    }
}
