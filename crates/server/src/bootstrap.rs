//! Admin token initialization.
//!
//! The operator configures only the SHA-256 of the bootstrap token. On every
//! start the matching row is reused, or created with the configured cluster
//! scopes while the previous bootstrap token is revoked.

use anyhow::{Context, Result, bail};
use meridian_core::config::AdminConfig;
use meridian_core::token::TokenScope;
use meridian_metadata::MetadataStore;
use meridian_metadata::models::TokenRow;
use std::collections::BTreeSet;
use time::OffsetDateTime;
use uuid::Uuid;

/// What startup did with the bootstrap token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// The configured hash already had a usable token.
    Reused { token_id: Uuid },
    /// A new token was created. `revoked` is the bootstrap token it replaced.
    Created {
        token_id: Uuid,
        revoked: Option<Uuid>,
    },
}

/// Lowercase hex digest, with an optional `sha256:` prefix removed.
fn normalize_hash(raw: &str) -> Result<String> {
    let hash = raw.strip_prefix("sha256:").unwrap_or(raw).to_lowercase();
    if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("invalid admin token_hash: expected 64 hex chars");
    }
    Ok(hash)
}

/// Configured scopes, defaulting to `cluster:admin`.
fn bootstrap_scopes(config: &AdminConfig) -> Result<BTreeSet<&'static str>> {
    let Some(configured) = &config.token_scopes else {
        return Ok(BTreeSet::from([TokenScope::ClusterAdmin.as_str()]));
    };
    if configured.is_empty() {
        bail!("admin token_scopes must not be empty");
    }
    configured
        .iter()
        .map(|s| {
            TokenScope::parse(s)
                .map(|scope| scope.as_str())
                .with_context(|| format!("invalid admin scope: {s}"))
        })
        .collect()
}

fn ensure_usable(existing: &TokenRow, now: OffsetDateTime) -> Result<()> {
    if existing.revoked_at.is_some() {
        bail!(
            "admin token hash matches a revoked token (id={}); \
             use a new token hash or clear the revoked token",
            existing.token_id
        );
    }
    if let Some(expires_at) = existing.expires_at
        && expires_at <= now
    {
        bail!(
            "admin token hash matches an expired token (id={}, expired={}); \
             use a new token hash",
            existing.token_id,
            expires_at
        );
    }
    Ok(())
}

/// Ensure the configured admin token exists, rotating the previous one if needed.
///
/// Configuration errors are reported before anything is revoked, so a bad
/// restart never leaves the cluster without an admin token.
pub async fn ensure_admin_token(
    metadata: &dyn MetadataStore,
    config: &AdminConfig,
) -> Result<BootstrapOutcome> {
    let hash = normalize_hash(&config.token_hash)?;
    let scopes = bootstrap_scopes(config)?;
    let now = OffsetDateTime::now_utc();

    if let Some(existing) = metadata.get_token_by_hash(&hash).await? {
        ensure_usable(&existing, now)?;
        metadata.set_bootstrap_token_id(existing.token_id).await?;
        tracing::debug!(token_id = %existing.token_id, "Admin token already exists");
        return Ok(BootstrapOutcome::Reused {
            token_id: existing.token_id,
        });
    }

    let revoked = metadata.get_bootstrap_token_id().await?;
    if let Some(prev_id) = revoked {
        metadata.revoke_token(prev_id, now).await?;
        tracing::info!(token_id = %prev_id, "Previous admin token revoked");
    }

    let token = TokenRow {
        token_id: Uuid::new_v4(),
        token_hash: hash,
        scopes: serde_json::to_string(&scopes)?,
        expires_at: None,
        revoked_at: None,
        created_at: now,
        last_used_at: None,
        description: config.token_description.clone(),
    };
    metadata.create_token(&token).await?;
    metadata.set_bootstrap_token_id(token.token_id).await?;
    tracing::info!(token_id = %token.token_id, scopes = ?scopes, "Admin token created");

    Ok(BootstrapOutcome::Created {
        token_id: token.token_id,
        revoked,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_metadata::SqliteStore;
    use meridian_metadata::repos::TokenRepo;

    const HASH_A: &str = "a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e3f4a5b6c7d8e9f0a1b2";
    const HASH_B: &str = "b1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e3f4a5b6c7d8e9f0a1b2";

    fn admin(hash: &str) -> AdminConfig {
        AdminConfig {
            token_hash: hash.to_string(),
            token_scopes: None,
            token_description: Some("bootstrap".to_string()),
        }
    }

    #[tokio::test]
    async fn test_rotation_revokes_previous_token() {
        let temp = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(temp.path().join("metadata.db"), None)
            .await
            .unwrap();

        ensure_admin_token(&store, &admin(HASH_A)).await.unwrap();
        let first = store.get_token_by_hash(HASH_A).await.unwrap().unwrap();
        assert!(first.scopes.contains("cluster:admin"));

        // Restart with the same hash is a no-op.
        ensure_admin_token(&store, &admin(HASH_A)).await.unwrap();
        assert!(store.get_token_by_hash(HASH_A).await.unwrap().unwrap().revoked_at.is_none());

        let outcome = ensure_admin_token(&store, &admin(&format!("sha256:{}", HASH_B.to_uppercase())))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            BootstrapOutcome::Created { revoked: Some(id), .. } if id == first.token_id
        ));
        let first = store.get_token(first.token_id).await.unwrap().unwrap();
        assert!(first.revoked_at.is_some());
        assert!(store.get_token_by_hash(HASH_B).await.unwrap().is_some());

        // A revoked hash cannot come back.
        assert!(ensure_admin_token(&store, &admin(HASH_A)).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_malformed_hash_and_scope() {
        let temp = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(temp.path().join("metadata.db"), None)
            .await
            .unwrap();

        assert!(ensure_admin_token(&store, &admin("not-a-hash")).await.is_err());

        let mut config = admin(HASH_A);
        config.token_scopes = Some(vec!["nodes:write".to_string()]);
        assert!(ensure_admin_token(&store, &config).await.is_err());

        config.token_scopes = Some(Vec::new());
        assert!(ensure_admin_token(&store, &config).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_scopes_do_not_revoke_current_token() {
        let temp = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(temp.path().join("metadata.db"), None)
            .await
            .unwrap();

        let BootstrapOutcome::Created { token_id, revoked } =
            ensure_admin_token(&store, &admin(HASH_A)).await.unwrap()
        else {
            panic!("first start must create a token");
        };
        assert_eq!(revoked, None);

        let mut config = admin(HASH_B);
        config.token_scopes = Some(vec!["cluster:write".to_string()]);
        assert!(ensure_admin_token(&store, &config).await.is_err());

        let current = store.get_token(token_id).await.unwrap().unwrap();
        assert!(current.revoked_at.is_none());
        assert_eq!(
            ensure_admin_token(&store, &admin(HASH_A)).await.unwrap(),
            BootstrapOutcome::Reused { token_id }
        );
    }

    #[test]
    fn test_scopes_are_deduplicated() {
        let mut config = admin(HASH_A);
        config.token_scopes = Some(vec![
            "cluster:read".to_string(),
            "cluster:admin".to_string(),
            "cluster:read".to_string(),
        ]);
        let scopes = bootstrap_scopes(&config).unwrap();
        assert_eq!(
            serde_json::to_string(&scopes).unwrap(),
            r#"["cluster:admin","cluster:read"]"#
        );
        assert_eq!(
            bootstrap_scopes(&admin(HASH_A)).unwrap(),
            BTreeSet::from(["cluster:admin"])
        );
    }
}
