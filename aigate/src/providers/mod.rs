pub mod google;
pub mod openai;
pub mod sanitize;

use crate::auth::CredentialRecord;
use crate::error::GatewayError;
use crate::types::{
    AssistantMessage, ChatRequest, EmbeddingRequest, EmbeddingResponse, ModelDef, StreamEvent,
};
use crate::usage::UsageConfig;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Read budget for non-streaming upstream calls. Streaming responses are
/// bounded per chunk by the stream wrapper instead.
pub const NON_STREAMING_TIMEOUT: Duration = Duration::from_secs(600);

/// How the scheduler orders credentials inside a sub-tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RotationMode {
    /// Weighted-random biased toward the least-used credential. Tolerance 0
    /// degenerates to strict least-used; larger values flatten the bias.
    Balanced { tolerance: f64 },
    /// Sticky: prefer the most-used credential still available.
    Sequential,
}

/// Parsed quota signal from an upstream rate-limit body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaHint {
    /// Authoritative reset, epoch ms.
    pub reset_at_ms: Option<i64>,
    pub retry_after: Option<Duration>,
}

/// Periodic adapter-owned work (e.g. polling remaining-quota baselines).
#[derive(Debug, Clone, Copy)]
pub struct BackgroundJobSpec {
    pub name: &'static str,
    pub interval: Duration,
    pub run_on_start: bool,
}

/// Credential material handed to an adapter for one attempt.
#[derive(Debug, Clone)]
pub struct AdapterAuth {
    /// Full `Authorization` header value, e.g. `Bearer sk-…`.
    pub bearer: String,
    pub record: CredentialRecord,
}

impl AdapterAuth {
    pub fn project_id(&self) -> Option<&str> {
        self.record.oauth().and_then(|t| t.metadata.project_id.as_deref())
    }

    pub fn account_id(&self) -> Option<&str> {
        self.record.oauth().and_then(|t| t.metadata.account_id.as_deref())
    }
}

/// Everything a background job may touch.
pub struct JobContext {
    pub store: Arc<crate::auth::registry::CredentialStore>,
    pub tokens: crate::auth::tokens::TokenManager,
    pub usage: Arc<crate::usage::UsageManager>,
}

/// One upstream provider: wire translation, quota parsing, and the policy
/// knobs the scheduler reads (tiers, rotation, usage windows).
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider tag; the first segment of wire model ids.
    fn tag(&self) -> &str;

    /// Models this adapter exposes.
    fn models(&self) -> Vec<ModelDef>;

    fn rotation_mode(&self) -> RotationMode {
        RotationMode::Balanced { tolerance: 1.0 }
    }

    /// Priority tier for a credential; lower is higher priority.
    fn assign_tier(&self, _record: &CredentialRecord) -> u8 {
        1
    }

    /// Loosest tier allowed to serve this model, when restricted.
    fn min_tier(&self, _model: &str) -> Option<u8> {
        None
    }

    /// Usage/quota policy for this provider.
    fn usage_config(&self) -> UsageConfig;

    /// Parse an authoritative reset or retry delay out of a quota error
    /// body. `None` means the body carried no usable hint.
    fn parse_quota_error(&self, _status: u16, _body: &str) -> Option<QuotaHint> {
        None
    }

    fn background_job(&self) -> Option<BackgroundJobSpec> {
        None
    }

    async fn run_background_job(&self, _ctx: &JobContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Non-streaming chat completion.
    async fn chat(
        &self,
        request: &ChatRequest,
        auth: &AdapterAuth,
    ) -> Result<AssistantMessage, GatewayError>;

    /// Streaming chat completion. The returned stream yields translated
    /// events; transport errors surface as stream items.
    fn stream_chat(
        &self,
        request: &ChatRequest,
        auth: &AdapterAuth,
    ) -> BoxStream<'static, Result<StreamEvent, GatewayError>>;

    /// Batch embedding call. Providers without an embedding surface keep the
    /// default.
    async fn embed(
        &self,
        request: &EmbeddingRequest,
        _auth: &AdapterAuth,
    ) -> Result<EmbeddingResponse, GatewayError> {
        Err(GatewayError::NotFound(format!(
            "{} has no embedding endpoint for {}",
            self.tag(),
            request.model
        )))
    }
}

/// Classify a failed upstream response, preferring the adapter's quota
/// parser over the generic status mapping.
pub fn classify_response(
    adapter: &dyn ProviderAdapter,
    status: u16,
    retry_after_header: Option<Duration>,
    body: &str,
) -> GatewayError {
    if status == 429 || status == 403 {
        if let Some(hint) = adapter.parse_quota_error(status, body) {
            if let Some(reset) = hint.reset_at_ms {
                return GatewayError::Quota {
                    detail: sanitize::sanitize_api_error(body),
                    reset_at_ms: reset,
                };
            }
            if let Some(after) = hint.retry_after {
                return GatewayError::RateLimit {
                    detail: sanitize::sanitize_api_error(body),
                    reset_at_ms: None,
                    retry_after: Some(after),
                };
            }
        }
    }
    if status == 429 {
        if let Some(after) = retry_after_header {
            return GatewayError::RateLimit {
                detail: sanitize::sanitize_api_error(body),
                reset_at_ms: None,
                retry_after: Some(after),
            };
        }
        return GatewayError::TransientQuota { detail: sanitize::sanitize_api_error(body) };
    }
    GatewayError::from_status(status, body)
}

/// Parse a `Retry-After` header value (delta seconds form).
pub fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    let seconds: f64 = value?.to_str().ok()?.trim().parse().ok()?;
    if seconds.is_finite() && seconds >= 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Adapters keyed by provider tag.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.tag().to_string(), adapter);
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(tag).cloned()
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.adapters.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn all(&self) -> Vec<Arc<dyn ProviderAdapter>> {
        self.tags()
            .into_iter()
            .filter_map(|tag| self.get(&tag))
            .collect()
    }
}

/// The built-in adapter pair: a static-key OpenAI-wire provider and a
/// Google-OAuth provider.
pub fn default_registry(http: reqwest::Client) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(openai::OpenAiAdapter::new(http.clone())));
    registry.register(Arc::new(google::GoogleOAuthAdapter::new(http)));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_round_trip() {
        let registry = default_registry(reqwest::Client::new());
        assert_eq!(registry.tags(), vec!["google-oauth", "openai"]);
        assert!(registry.get("openai").is_some());
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn retry_after_header_parses_delta_seconds() {
        use reqwest::header::HeaderValue;
        let v = HeaderValue::from_static("30");
        assert_eq!(parse_retry_after(Some(&v)), Some(Duration::from_secs(30)));
        let junk = HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_retry_after(Some(&junk)), None);
        assert_eq!(parse_retry_after(None), None);
    }
}
