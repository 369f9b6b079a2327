//! OAuth token lifecycle: proactive and on-demand refresh, per-credential
//! locking, and the re-authentication queue for credentials whose refresh
//! token has been revoked.

use super::{CredentialRecord, CredentialSecret, OAuthTokens};
use super::registry::CredentialStore;
use crate::error::GatewayError;
use crate::store::ResilientWriter;
use futures::StreamExt;
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Refresh when a token expires within this window.
pub const PROACTIVE_REFRESH_BUFFER_MS: i64 = 5 * 60 * 1000;
const REFRESH_MAX_ATTEMPTS: u32 = 3;
const REFRESH_BASE_BACKOFF: Duration = Duration::from_secs(1);
/// Distinct credentials refreshed concurrently by the background pipeline.
const REFRESH_PIPELINE_WIDTH: usize = 4;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    expires_in: i64,
    refresh_token: Option<String>,
    id_token: Option<String>,
}

/// Boundary to the interactive enrollment collaborator. The default
/// implementation opens the provider's authorization page; the full login
/// flow lives outside the engine.
#[async_trait::async_trait]
pub trait ReauthHandler: Send + Sync {
    async fn reauthorize(&self, record: &CredentialRecord) -> anyhow::Result<()>;
}

/// Build an OAuth authorization URL for an interactive re-auth flow.
pub fn build_authorization_url(
    auth_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[&str],
) -> anyhow::Result<String> {
    let scopes = scopes.join(" ");
    let params = [
        ("client_id", client_id),
        ("response_type", "code"),
        ("redirect_uri", redirect_uri),
        ("scope", scopes.as_str()),
        ("access_type", "offline"),
        ("prompt", "consent"),
    ];
    let mut url = url::Url::parse(auth_endpoint)?;
    url.set_query(Some(&serde_urlencoded::to_string(params)?));
    Ok(url.to_string())
}

/// Opens the authorization URL in a browser and leaves completion to the
/// operator. Used when no richer enrollment flow is wired in.
pub struct BrowserReauthHandler {
    pub auth_url: String,
}

#[async_trait::async_trait]
impl ReauthHandler for BrowserReauthHandler {
    async fn reauthorize(&self, record: &CredentialRecord) -> anyhow::Result<()> {
        tracing::warn!(
            credential = %record.display_label(),
            url = %self.auth_url,
            "credential needs re-authorization; opening browser"
        );
        let _ = open::that(&self.auth_url);
        Ok(())
    }
}

struct ManagerInner {
    store: Arc<CredentialStore>,
    writer: ResilientWriter,
    http: reqwest::Client,
    /// One mutex per credential so concurrent refreshes of the same id
    /// coalesce behind a single network call.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Credentials whose refresh token was rejected; excluded from selection
    /// until re-authorized.
    reauth_queue: Mutex<VecDeque<String>>,
    reauth_members: Mutex<HashSet<String>>,
    /// Ids already queued for proactive refresh.
    refresh_inflight: Mutex<HashSet<String>>,
    refresh_tx: tokio::sync::mpsc::UnboundedSender<String>,
    /// Serializes interactive flows so two browser launches never race.
    interactive: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<ManagerInner>,
}

impl TokenManager {
    pub fn new(store: Arc<CredentialStore>, writer: ResilientWriter, http: reqwest::Client) -> Self {
        let (refresh_tx, refresh_rx) = tokio::sync::mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(ManagerInner {
                store,
                writer,
                http,
                locks: Mutex::new(HashMap::new()),
                reauth_queue: Mutex::new(VecDeque::new()),
                reauth_members: Mutex::new(HashSet::new()),
                refresh_inflight: Mutex::new(HashSet::new()),
                refresh_tx,
                interactive: tokio::sync::Mutex::new(()),
            }),
        };
        spawn_refresh_worker(&manager, refresh_rx);
        manager
    }

    /// Valid `Bearer` header for the credential, or `NeedsReauth`. A token
    /// inside the proactive buffer is still served while a background
    /// refresh is queued; a truly expired token is refreshed inline.
    pub async fn get_auth_header(&self, id: &str) -> Result<String, GatewayError> {
        if self.in_reauth_queue(id) {
            return Err(GatewayError::NeedsReauth { credential: id.to_string() });
        }
        let record = self
            .inner
            .store
            .load(id)
            .ok_or_else(|| GatewayError::NotFound(format!("credential {id}")))?;

        let tokens = match &record.secret {
            CredentialSecret::StaticKey { key } => return Ok(format!("Bearer {key}")),
            CredentialSecret::OAuth(tokens) => tokens.clone(),
        };

        let now = now_ms();
        if tokens.is_expired_at(now) {
            let fresh = self.refresh(id).await?;
            return Ok(format!("Bearer {}", fresh.access_token));
        }
        if tokens.expires_within(now, PROACTIVE_REFRESH_BUFFER_MS) {
            self.proactively_refresh(id);
        }
        Ok(format!("Bearer {}", tokens.access_token))
    }

    /// Queue a background refresh; concurrent requests for the same id
    /// coalesce.
    pub fn proactively_refresh(&self, id: &str) {
        let mut inflight = self.inner.refresh_inflight.lock().expect("refresh inflight lock");
        if inflight.insert(id.to_string()) {
            let _ = self.inner.refresh_tx.send(id.to_string());
        }
    }

    /// Whether the credential can currently be selected: not awaiting
    /// re-auth, and either fresh or refreshable.
    pub fn is_available(&self, id: &str) -> bool {
        if self.in_reauth_queue(id) {
            return false;
        }
        let Some(record) = self.inner.store.load(id) else {
            return false;
        };
        match &record.secret {
            CredentialSecret::StaticKey { .. } => true,
            CredentialSecret::OAuth(tokens) => {
                !tokens.is_expired_at(now_ms()) || !tokens.refresh_token.is_empty()
            }
        }
    }

    pub fn in_reauth_queue(&self, id: &str) -> bool {
        self.inner.reauth_members.lock().expect("reauth lock").contains(id)
    }

    pub fn reauth_queue(&self) -> Vec<String> {
        self.inner.reauth_queue.lock().expect("reauth lock").iter().cloned().collect()
    }

    /// Refresh the credential's tokens now. Safe to call concurrently: the
    /// per-credential mutex makes the losers observe the winner's result.
    pub async fn refresh(&self, id: &str) -> Result<OAuthTokens, GatewayError> {
        let lock = self.credential_lock(id);
        let _guard = lock.lock().await;

        // Someone may have refreshed while we waited on the lock.
        let record = self
            .inner
            .store
            .load(id)
            .ok_or_else(|| GatewayError::NotFound(format!("credential {id}")))?;
        let tokens = record
            .oauth()
            .ok_or_else(|| GatewayError::Other(format!("{id} is not an OAuth credential")))?
            .clone();
        if !tokens.expires_within(now_ms(), PROACTIVE_REFRESH_BUFFER_MS) {
            return Ok(tokens);
        }
        if tokens.refresh_token.is_empty() {
            self.enqueue_reauth(id);
            return Err(GatewayError::NeedsReauth { credential: id.to_string() });
        }

        let response = self.call_token_endpoint(id, &tokens).await?;
        let refreshed = self.build_refreshed(&tokens, response);

        // Persist before swapping the cache so a partial failure never leaves
        // memory ahead of disk. Environment-backed credentials never touch
        // disk.
        if !record.is_env_backed() {
            let value = serde_json::to_value(&refreshed)?;
            self.inner.writer.write(PathBuf::from(id), value).await;
        }
        self.inner.store.update_tokens(id, refreshed.clone());
        tracing::debug!(credential = %record.display_label(), "token refreshed");
        Ok(refreshed)
    }

    /// Run the interactive re-auth flow for the head of the queue. Flows are
    /// globally serialized so concurrent calls cannot launch two browsers.
    pub async fn process_reauth_queue(&self, handler: &dyn ReauthHandler) -> anyhow::Result<usize> {
        let _serial = self.inner.interactive.lock().await;
        let mut handled = 0;
        loop {
            let next = self.inner.reauth_queue.lock().expect("reauth lock").pop_front();
            let Some(id) = next else { break };
            let Some(record) = self.inner.store.load(&id) else {
                self.inner.reauth_members.lock().expect("reauth lock").remove(&id);
                continue;
            };
            handler.reauthorize(&record).await?;
            self.inner.reauth_members.lock().expect("reauth lock").remove(&id);
            handled += 1;
        }
        Ok(handled)
    }

    pub fn enqueue_reauth(&self, id: &str) {
        let mut members = self.inner.reauth_members.lock().expect("reauth lock");
        if members.insert(id.to_string()) {
            self.inner.reauth_queue.lock().expect("reauth lock").push_back(id.to_string());
            tracing::warn!(credential = id, "queued for re-authorization");
        }
    }

    fn credential_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.locks.lock().expect("token locks");
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    async fn call_token_endpoint(
        &self,
        id: &str,
        tokens: &OAuthTokens,
    ) -> Result<TokenEndpointResponse, GatewayError> {
        let mut backoff = REFRESH_BASE_BACKOFF;
        let mut last_err: Option<GatewayError> = None;

        for attempt in 0..REFRESH_MAX_ATTEMPTS {
            let result = self
                .inner
                .http
                .post(&tokens.token_uri)
                .form(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", tokens.refresh_token.as_str()),
                ])
                .send()
                .await;

            let response = match result {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(GatewayError::Network(e));
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response.json::<TokenEndpointResponse>().await?);
            }

            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();

            if status.as_u16() == 401
                || status.as_u16() == 403
                || (status.as_u16() == 400 && body.contains("invalid_grant"))
            {
                self.enqueue_reauth(id);
                return Err(GatewayError::NeedsReauth { credential: id.to_string() });
            }

            tracing::warn!(
                credential = id,
                status = status.as_u16(),
                attempt,
                "token refresh attempt failed"
            );
            last_err = Some(GatewayError::from_status(status.as_u16(), &body));
            let wait = if status.as_u16() == 429 {
                retry_after.unwrap_or(backoff)
            } else {
                backoff
            };
            tokio::time::sleep(wait).await;
            backoff *= 2;
        }
        Err(last_err.unwrap_or_else(|| GatewayError::Other("token refresh failed".into())))
    }

    fn build_refreshed(&self, old: &OAuthTokens, response: TokenEndpointResponse) -> OAuthTokens {
        let mut refreshed = OAuthTokens {
            access_token: response.access_token,
            refresh_token: response.refresh_token.unwrap_or_else(|| old.refresh_token.clone()),
            id_token: response.id_token.or_else(|| old.id_token.clone()),
            expiry_date: now_ms() + response.expires_in * 1000,
            token_uri: old.token_uri.clone(),
            metadata: old.metadata.clone(),
        };
        refreshed.metadata.last_check_timestamp = now_ms();
        // The id token carries the account identity; keep metadata current.
        if let Some(claims) = refreshed.id_token.as_deref().and_then(peek_jwt_claims) {
            if refreshed.metadata.email.is_none() {
                refreshed.metadata.email = claims.email;
            }
            if refreshed.metadata.account_id.is_none() {
                refreshed.metadata.account_id = claims.subject;
            }
        }
        refreshed
    }
}

/// Background refresh pipeline: drains the queue with bounded concurrency so
/// several credentials tripping the proactive buffer at once do not refresh
/// back-to-back. Same-id work is already deduplicated upstream by the
/// inflight set and serialized by the per-credential lock. The worker holds
/// only a weak reference, so it exits once the manager is dropped and the
/// sender closes.
fn spawn_refresh_worker(
    manager: &TokenManager,
    rx: tokio::sync::mpsc::UnboundedReceiver<String>,
) {
    let weak = Arc::downgrade(&manager.inner);
    tokio::spawn(async move {
        let queue = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|id| (id, rx))
        });
        queue
            .map(|id| {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else { return };
                    let manager = TokenManager { inner };
                    if let Err(e) = manager.refresh(&id).await {
                        tracing::warn!(credential = %id, error = %e, "proactive refresh failed");
                    }
                    manager
                        .inner
                        .refresh_inflight
                        .lock()
                        .expect("refresh inflight lock")
                        .remove(&id);
                }
            })
            .buffer_unordered(REFRESH_PIPELINE_WIDTH)
            .for_each(|()| async {})
            .await;
    });
}

// ---------------------------------------------------------------------------
// JWT inspection
// ---------------------------------------------------------------------------

pub struct JwtClaims {
    pub email: Option<String>,
    pub subject: Option<String>,
    pub expiry_s: Option<i64>,
}

/// Unauthenticated decode of a JWT payload for metadata extraction only.
/// Signature verification is deliberately absent: the token is bound to the
/// upstream's own trust anchor, never ours.
pub fn peek_jwt_claims(jwt: &str) -> Option<JwtClaims> {
    use base64::Engine;
    let payload = jwt.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    Some(JwtClaims {
        email: value.get("email").and_then(|v| v.as_str()).map(String::from),
        subject: value.get("sub").and_then(|v| v.as_str()).map(String::from),
        expiry_s: value.get("exp").and_then(|v| v.as_i64()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn fake_jwt(payload: serde_json::Value) -> String {
        let header = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"alg\":\"none\"}");
        let body = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&payload).unwrap());
        format!("{header}.{body}.sig")
    }

    #[test]
    fn jwt_peek_extracts_metadata() {
        let jwt = fake_jwt(serde_json::json!({
            "email": "dev@example.com",
            "sub": "1234567890",
            "exp": 1_900_000_000,
        }));
        let claims = peek_jwt_claims(&jwt).unwrap();
        assert_eq!(claims.email.as_deref(), Some("dev@example.com"));
        assert_eq!(claims.subject.as_deref(), Some("1234567890"));
        assert_eq!(claims.expiry_s, Some(1_900_000_000));
    }

    #[test]
    fn jwt_peek_rejects_garbage() {
        assert!(peek_jwt_claims("not-a-jwt").is_none());
        assert!(peek_jwt_claims("a.###.c").is_none());
    }

    #[test]
    fn authorization_url_encodes_scopes() {
        let url = build_authorization_url(
            "https://accounts.example.com/o/oauth2/v2/auth",
            "client-1",
            "http://127.0.0.1:1455/callback",
            &["email", "profile"],
        )
        .unwrap();
        assert!(url.starts_with("https://accounts.example.com/o/oauth2/v2/auth?"));
        assert!(url.contains("client_id=client-1"));
        assert!(url.contains("scope=email+profile"));
        assert!(url.contains("access_type=offline"));
    }
}
