//! Shared handler helpers.

use crate::error::{ApiError, ApiResult};
use axum::extract::Request;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Maximum request body size for JSON endpoints (1 MiB).
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Read and parse a JSON body, consuming the request.
pub async fn read_json<T: DeserializeOwned>(req: Request) -> ApiResult<T> {
    let bytes = axum::body::to_bytes(req.into_body(), MAX_BODY_SIZE)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))
}

pub fn format_time(t: OffsetDateTime) -> ApiResult<String> {
    t.format(&Rfc3339)
        .map_err(|e| ApiError::Internal(format!("failed to format timestamp: {e}")))
}

pub fn format_time_opt(t: Option<OffsetDateTime>) -> ApiResult<Option<String>> {
    t.map(format_time).transpose()
}

/// 32 random bytes, URL-safe base64 without padding.
pub fn generate_secret() -> String {
    use base64::Engine;
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Payload {
        name: String,
    }

    #[tokio::test]
    async fn test_read_json() {
        let req = Request::new(Body::from(r#"{"name":"edge"}"#));
        let payload: Payload = read_json(req).await.unwrap();
        assert_eq!(payload.name, "edge");

        let req = Request::new(Body::from("{"));
        let err = read_json::<Payload>(req).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn test_generate_secret() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), 43);
        assert!(!a.contains('='));
        assert_ne!(a, b);
    }

    #[test]
    fn test_format_time() {
        let t = OffsetDateTime::from_unix_timestamp(0).unwrap();
        assert_eq!(format_time(t).unwrap(), "1970-01-01T00:00:00Z");
        assert_eq!(format_time_opt(None).unwrap(), None);
    }
}
