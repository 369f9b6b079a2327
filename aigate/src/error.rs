use std::time::Duration;

/// Errors produced anywhere between credential selection and the upstream
/// response. The variant decides retry policy, cooldown handling, and the
/// HTTP status surfaced to the client.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Upstream 401/403 or an OAuth `invalid_grant`. Never retried on the
    /// same credential.
    #[error("authentication failed: {detail}")]
    Auth { detail: String },

    /// The credential needs an interactive re-authorization.
    #[error("re-authorization required for {credential}")]
    NeedsReauth { credential: String },

    /// Upstream 429 carrying a retry hint.
    #[error("rate limited: {detail}")]
    RateLimit {
        detail: String,
        /// Authoritative reset, epoch ms, when the provider supplied one.
        reset_at_ms: Option<i64>,
        retry_after: Option<Duration>,
    },

    /// Upstream 429/403 with an authoritative window reset.
    #[error("quota exhausted: {detail}")]
    Quota { detail: String, reset_at_ms: i64 },

    /// Upstream 429 with no hint at all; treated like a server blip.
    #[error("rate limited with no retry hint: {detail}")]
    TransientQuota { detail: String },

    /// 5xx, connection reset, or an empty-response sentinel.
    #[error("upstream server error {status}: {detail}")]
    Server { status: u16, detail: String },

    /// Read/connect timeout against the upstream.
    #[error("upstream timeout: {0}")]
    Timeout(String),

    /// The request's global deadline elapsed before an attempt could finish.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Every candidate credential was excluded until past the deadline.
    #[error("no credential available: {detail}")]
    NoKeyAvailable {
        detail: String,
        /// Earliest cooldown expiry among excluded credentials, epoch ms.
        next_reset_ms: Option<i64>,
    },

    /// The chosen credential is at its concurrency cap. Internal to the
    /// scheduler loop; never surfaced to clients.
    #[error("credential at concurrency cap")]
    Overloaded,

    #[error("context length exceeded: {0}")]
    ContextLength(String),

    #[error("content filtered by provider: {0}")]
    ContentFilter(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// An error frame arrived mid-stream, after the response headers.
    #[error("error in stream: {0}")]
    Streamed(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// HTTP status to surface to the client for this failure.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Auth { .. } | Self::NeedsReauth { .. } => 401,
            Self::RateLimit { .. } | Self::Quota { .. } | Self::TransientQuota { .. } => 429,
            Self::ContextLength(_) | Self::ContentFilter(_) => 400,
            Self::NotFound(_) => 404,
            Self::NoKeyAvailable { .. } => 503,
            Self::DeadlineExceeded | Self::Timeout(_) => 504,
            Self::Server { .. } | Self::Streamed(_) | Self::Overloaded => 503,
            Self::Network(_) | Self::Json(_) | Self::Other(_) => 500,
        }
    }

    /// Whether the executor may retry this failure on the same credential.
    pub fn retries_same_credential(&self) -> bool {
        match self {
            Self::Server { .. } | Self::Timeout(_) | Self::Network(_) | Self::Other(_) => true,
            Self::Streamed(_) => true,
            _ => false,
        }
    }

    /// Whether the executor should rotate to another credential after this
    /// failure (as opposed to failing the request outright).
    pub fn rotates(&self) -> bool {
        match self {
            Self::Auth { .. }
            | Self::NeedsReauth { .. }
            | Self::RateLimit { .. }
            | Self::Quota { .. }
            | Self::TransientQuota { .. }
            | Self::Server { .. }
            | Self::Timeout(_)
            | Self::Streamed(_)
            | Self::Network(_)
            | Self::Other(_) => true,
            Self::ContextLength(_)
            | Self::ContentFilter(_)
            | Self::NotFound(_)
            | Self::DeadlineExceeded
            | Self::NoKeyAvailable { .. }
            | Self::Overloaded
            | Self::Json(_) => false,
        }
    }

    /// Structural copy for fan-out to multiple waiters. Variants wrapping
    /// non-clonable sources degrade to their message text.
    pub fn replicate(&self) -> Self {
        match self {
            Self::Auth { detail } => Self::Auth { detail: detail.clone() },
            Self::NeedsReauth { credential } => {
                Self::NeedsReauth { credential: credential.clone() }
            }
            Self::RateLimit { detail, reset_at_ms, retry_after } => Self::RateLimit {
                detail: detail.clone(),
                reset_at_ms: *reset_at_ms,
                retry_after: *retry_after,
            },
            Self::Quota { detail, reset_at_ms } => {
                Self::Quota { detail: detail.clone(), reset_at_ms: *reset_at_ms }
            }
            Self::TransientQuota { detail } => Self::TransientQuota { detail: detail.clone() },
            Self::Server { status, detail } => {
                Self::Server { status: *status, detail: detail.clone() }
            }
            Self::Timeout(detail) => Self::Timeout(detail.clone()),
            Self::DeadlineExceeded => Self::DeadlineExceeded,
            Self::NoKeyAvailable { detail, next_reset_ms } => Self::NoKeyAvailable {
                detail: detail.clone(),
                next_reset_ms: *next_reset_ms,
            },
            Self::Overloaded => Self::Overloaded,
            Self::ContextLength(detail) => Self::ContextLength(detail.clone()),
            Self::ContentFilter(detail) => Self::ContentFilter(detail.clone()),
            Self::NotFound(detail) => Self::NotFound(detail.clone()),
            Self::Streamed(detail) => Self::Streamed(detail.clone()),
            Self::Network(e) => Self::Other(format!("network error: {e}")),
            Self::Json(e) => Self::Other(format!("json error: {e}")),
            Self::Other(detail) => Self::Other(detail.clone()),
        }
    }

    /// Fallback classification from an HTTP status and response body. Adapters
    /// run their own quota parsing first and only then fall back to this.
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = crate::providers::sanitize::sanitize_api_error(body);
        match status {
            401 | 403 => Self::Auth { detail },
            404 => Self::NotFound(detail),
            400 if looks_like_context_overflow(body) => Self::ContextLength(detail),
            400 if looks_like_content_filter(body) => Self::ContentFilter(detail),
            408 => Self::Timeout(detail),
            429 => Self::TransientQuota { detail },
            s if s >= 500 => Self::Server { status: s, detail },
            s => Self::Server { status: s, detail },
        }
    }
}

fn looks_like_context_overflow(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    ["context length", "context_length", "maximum context", "too many tokens", "prompt is too long"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn looks_like_content_filter(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    ["content_filter", "content management policy", "safety", "blocked by"]
        .iter()
        .any(|needle| lower.contains(needle))
}
