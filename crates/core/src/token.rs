//! Admin API tokens and their scopes.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for an admin token.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId(Uuid);

impl TokenId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidToken(format!("invalid token ID: {e}")))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for TokenId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({})", self.0)
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scopes an admin token may carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenScope {
    /// List clusters, nodes, tasks and messages.
    #[serde(rename = "cluster:read")]
    ClusterRead,
    /// Mutate configuration and send node commands.
    #[serde(rename = "cluster:admin")]
    ClusterAdmin,
}

impl TokenScope {
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "cluster:read" => Ok(Self::ClusterRead),
            "cluster:admin" => Ok(Self::ClusterAdmin),
            _ => Err(crate::Error::InvalidToken(format!("unknown scope: {s}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClusterRead => "cluster:read",
            Self::ClusterAdmin => "cluster:admin",
        }
    }

    /// Admin implies read.
    pub fn implies(&self, other: &Self) -> bool {
        match self {
            Self::ClusterAdmin => true,
            Self::ClusterRead => matches!(other, Self::ClusterRead),
        }
    }
}

impl fmt::Display for TokenScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A validated token with its metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub scopes: HashSet<TokenScope>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub description: Option<String>,
}

impl Token {
    /// Not revoked and not past its expiry.
    pub fn is_valid(&self) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }

        if let Some(expires_at) = self.expires_at
            && OffsetDateTime::now_utc() > expires_at
        {
            return false;
        }

        true
    }

    pub fn has_scope(&self, scope: TokenScope) -> bool {
        self.scopes.iter().any(|s| s.implies(&scope))
    }

    pub fn can_read(&self) -> bool {
        self.is_valid() && self.has_scope(TokenScope::ClusterRead)
    }

    pub fn is_admin(&self) -> bool {
        self.is_valid() && self.has_scope(TokenScope::ClusterAdmin)
    }
}

/// Request to create a token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateTokenRequest {
    pub scopes: Vec<String>,
    /// Lifetime in seconds.
    pub expires_in: Option<u64>,
    pub description: Option<String>,
}

/// Response from creating a token. The secret is only ever returned here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateTokenResponse {
    pub token_id: String,
    pub token_secret: String,
    pub expires_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_with(scopes: &[TokenScope]) -> Token {
        Token {
            id: TokenId::new(),
            scopes: scopes.iter().copied().collect(),
            expires_at: None,
            revoked_at: None,
            created_at: OffsetDateTime::now_utc(),
            description: None,
        }
    }

    #[test]
    fn test_scope_implies() {
        assert!(TokenScope::ClusterAdmin.implies(&TokenScope::ClusterRead));
        assert!(TokenScope::ClusterAdmin.implies(&TokenScope::ClusterAdmin));
        assert!(TokenScope::ClusterRead.implies(&TokenScope::ClusterRead));
        assert!(!TokenScope::ClusterRead.implies(&TokenScope::ClusterAdmin));
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!(
            TokenScope::parse("cluster:read").unwrap(),
            TokenScope::ClusterRead
        );
        assert_eq!(
            TokenScope::parse("cluster:admin").unwrap(),
            TokenScope::ClusterAdmin
        );
        assert!(TokenScope::parse("cache:admin").is_err());
    }

    #[test]
    fn test_revoked_token_is_not_admin() {
        let mut token = token_with(&[TokenScope::ClusterAdmin]);
        assert!(token.is_admin());
        assert!(token.can_read());

        token.revoked_at = Some(OffsetDateTime::now_utc());
        assert!(!token.is_admin());
    }

    #[test]
    fn test_expired_token_is_invalid() {
        let mut token = token_with(&[TokenScope::ClusterRead]);
        token.expires_at = Some(OffsetDateTime::now_utc() - time::Duration::minutes(1));
        assert!(!token.can_read());
    }
}
