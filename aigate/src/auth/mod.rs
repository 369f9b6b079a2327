pub mod registry;
pub mod tokens;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Credential identifiers
// ---------------------------------------------------------------------------

/// Scheme prefix for credentials sourced from the environment rather than a
/// file. Index 0 denotes the legacy single-credential variable names; indices
/// >= 1 use the numbered `<PROVIDER>_<N>_*` variants.
pub const ENV_URI_SCHEME: &str = "env://";

/// Build an `env://<provider>/<index>` identifier.
pub fn env_uri(provider: &str, index: u32) -> String {
    format!("{ENV_URI_SCHEME}{provider}/{index}")
}

/// Parse an `env://<provider>/<index>` identifier.
pub fn parse_env_uri(id: &str) -> Option<(&str, u32)> {
    let rest = id.strip_prefix(ENV_URI_SCHEME)?;
    let (provider, index) = rest.rsplit_once('/')?;
    if provider.is_empty() {
        return None;
    }
    Some((provider, index.parse().ok()?))
}

// ---------------------------------------------------------------------------
// Credential records
// ---------------------------------------------------------------------------

/// Bookkeeping the gateway attaches to an OAuth credential file. Serialized
/// under `_proxy_metadata` so upstream tooling that reads the same file
/// ignores it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    /// Epoch ms of the last refresh or validation against the provider.
    #[serde(default)]
    pub last_check_timestamp: i64,
    #[serde(default)]
    pub loaded_from_env: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_credential_index: Option<u32>,
}

/// On-disk OAuth credential schema (one JSON file per credential, owner-only
/// permissions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Expiry timestamp in milliseconds since epoch. Always present.
    pub expiry_date: i64,
    pub token_uri: String,
    #[serde(rename = "_proxy_metadata", default)]
    pub metadata: ProxyMetadata,
}

impl OAuthTokens {
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expiry_date
    }

    /// Expired or expiring within the proactive buffer.
    pub fn expires_within(&self, now_ms: i64, buffer_ms: i64) -> bool {
        now_ms + buffer_ms >= self.expiry_date
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialSecret {
    StaticKey { key: String },
    OAuth(OAuthTokens),
}

/// A single upstream identity: an API key or an OAuth token record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub provider: String,
    /// Stable identifier: a filesystem path or an `env://provider/N` URI.
    pub id: String,
    pub secret: CredentialSecret,
}

impl CredentialRecord {
    pub fn is_env_backed(&self) -> bool {
        self.id.starts_with(ENV_URI_SCHEME)
    }

    pub fn is_oauth(&self) -> bool {
        matches!(self.secret, CredentialSecret::OAuth(_))
    }

    pub fn oauth(&self) -> Option<&OAuthTokens> {
        match &self.secret {
            CredentialSecret::OAuth(t) => Some(t),
            CredentialSecret::StaticKey { .. } => None,
        }
    }

    /// Key used for deduplication: the account identity when known, falling
    /// back to the raw secret for static keys.
    pub fn identity_key(&self) -> String {
        match &self.secret {
            CredentialSecret::OAuth(t) => t
                .metadata
                .email
                .clone()
                .or_else(|| t.metadata.account_id.clone())
                .unwrap_or_else(|| self.id.clone()),
            CredentialSecret::StaticKey { key } => key.clone(),
        }
    }

    /// Short label for logs; never includes secret material.
    pub fn display_label(&self) -> String {
        if let Some(tokens) = self.oauth() {
            if let Some(email) = &tokens.metadata.email {
                return format!("{}:{}", self.provider, email);
            }
        }
        let tail = self.id.chars().rev().take(12).collect::<Vec<_>>();
        format!("{}:…{}", self.provider, tail.into_iter().rev().collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_uri_round_trip() {
        let uri = env_uri("google-oauth", 3);
        assert_eq!(uri, "env://google-oauth/3");
        assert_eq!(parse_env_uri(&uri), Some(("google-oauth", 3)));
        assert_eq!(parse_env_uri("env:///0"), None);
        assert_eq!(parse_env_uri("file:///x"), None);
    }

    #[test]
    fn oauth_expiry_buffer() {
        let tokens = OAuthTokens {
            access_token: "a".into(),
            refresh_token: "r".into(),
            id_token: None,
            expiry_date: 10_000,
            token_uri: "https://oauth2.example/token".into(),
            metadata: ProxyMetadata::default(),
        };
        assert!(!tokens.is_expired_at(9_999));
        assert!(tokens.is_expired_at(10_000));
        assert!(tokens.expires_within(5_000, 5_000));
        assert!(!tokens.expires_within(4_999, 5_000));
    }

    #[test]
    fn identity_prefers_email() {
        let record = CredentialRecord {
            provider: "google-oauth".into(),
            id: "/tmp/x.json".into(),
            secret: CredentialSecret::OAuth(OAuthTokens {
                access_token: "a".into(),
                refresh_token: "r".into(),
                id_token: None,
                expiry_date: 0,
                token_uri: String::new(),
                metadata: ProxyMetadata {
                    email: Some("dev@example.com".into()),
                    account_id: Some("acct-1".into()),
                    ..Default::default()
                },
            }),
        };
        assert_eq!(record.identity_key(), "dev@example.com");
    }
}
