//! Google-OAuth adapter speaking the Cloud Code Assist wire format: message
//! arrays become `contents`/`systemInstruction` parts, quota errors arrive as
//! `google.rpc.RetryInfo` entries inside 429 bodies.

use super::{
    classify_response, parse_retry_after, AdapterAuth, BackgroundJobSpec, JobContext,
    ProviderAdapter, QuotaHint, RotationMode, NON_STREAMING_TIMEOUT,
};
use crate::error::GatewayError;
use crate::sse::{SseFrames, STREAM_IDLE_TIMEOUT};
use crate::types::*;
use crate::usage::{now_ms, QuotaGroup, ResetMode, UsageConfig};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

const DEFAULT_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";

/// Tier 1: paid/licensed accounts. Tier 2: free tier.
const TIER_PAID: u8 = 1;
const TIER_FREE: u8 = 2;

#[derive(Clone)]
pub struct GoogleOAuthAdapter {
    http: Client,
    endpoint: String,
}

impl GoogleOAuthAdapter {
    pub fn new(http: Client) -> Self {
        Self { http, endpoint: DEFAULT_ENDPOINT.to_string() }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    fn generate_url(&self, streaming: bool) -> String {
        if streaming {
            format!("{}/v1internal:streamGenerateContent?alt=sse", self.endpoint)
        } else {
            format!("{}/v1internal:generateContent", self.endpoint)
        }
    }

    fn apply_headers(
        &self,
        request: reqwest::RequestBuilder,
        auth: &AdapterAuth,
    ) -> reqwest::RequestBuilder {
        let mut request = request
            .header("Authorization", &auth.bearer)
            .header("User-Agent", "google-cloud-sdk vscode_cloudshelleditor/0.1")
            .header(
                "Client-Metadata",
                json!({
                    "ideType": "IDE_UNSPECIFIED",
                    "platform": "PLATFORM_UNSPECIFIED",
                    "pluginType": "GEMINI"
                })
                .to_string(),
            );
        if let Some(account) = auth.account_id() {
            request = request.header("X-Goog-Account-Id", account);
        }
        request
    }
}

// ---------------------------------------------------------------------------
// Wire types (Cloud Code Assist format)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateBody {
    project: String,
    model: String,
    request: InnerRequest,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InnerRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireSystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<WireGenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireToolDeclaration>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct WireContent {
    role: &'static str,
    parts: Vec<WirePart>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<WireInlineData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<WireFunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<WireFunctionResponse>,
}

impl WirePart {
    fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), inline_data: None, function_call: None, function_response: None }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireInlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
struct WireFunctionCall {
    name: String,
    args: serde_json::Value,
}

#[derive(Serialize)]
struct WireFunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Serialize)]
struct WireSystemInstruction {
    parts: Vec<WirePart>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<WireThinkingConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireThinkingConfig {
    include_thoughts: bool,
    thinking_level: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireToolDeclaration {
    function_declarations: Vec<WireFunctionDeclaration>,
}

#[derive(Serialize)]
struct WireFunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
struct Envelope {
    response: Option<ResponseData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseData {
    candidates: Option<Vec<Candidate>>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    parts: Option<Vec<CandidatePart>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidatePart {
    text: Option<String>,
    thought: Option<bool>,
    function_call: Option<CandidateFunctionCall>,
}

#[derive(Deserialize)]
struct CandidateFunctionCall {
    name: String,
    args: Option<serde_json::Value>,
    id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
    thoughts_token_count: Option<u64>,
    total_token_count: Option<u64>,
    cached_content_token_count: Option<u64>,
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn convert_contents(request: &ChatRequest) -> Vec<WireContent> {
    let mut contents = Vec::new();
    for message in &request.messages {
        match message {
            Message::User(user) => {
                let parts: Vec<WirePart> = user
                    .content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text(t) => Some(WirePart::text(&t.text)),
                        ContentBlock::Image(img) => Some(WirePart {
                            text: None,
                            inline_data: Some(WireInlineData {
                                mime_type: img.mime_type.clone(),
                                data: img.data.clone(),
                            }),
                            function_call: None,
                            function_response: None,
                        }),
                        _ => None,
                    })
                    .collect();
                if !parts.is_empty() {
                    contents.push(WireContent { role: "user", parts });
                }
            }
            Message::Assistant(assistant) => {
                let mut parts = Vec::new();
                for block in &assistant.content {
                    match block {
                        ContentBlock::Text(t) => parts.push(WirePart::text(&t.text)),
                        ContentBlock::ToolCall(tc) => parts.push(WirePart {
                            text: None,
                            inline_data: None,
                            function_call: Some(WireFunctionCall {
                                name: tc.name.clone(),
                                args: tc.arguments.clone(),
                            }),
                            function_response: None,
                        }),
                        ContentBlock::Thinking(_) | ContentBlock::Image(_) => {}
                    }
                }
                if !parts.is_empty() {
                    contents.push(WireContent { role: "model", parts });
                }
            }
            Message::ToolResult(result) => {
                let text = result
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text(t) => Some(t.text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                contents.push(WireContent {
                    role: "user",
                    parts: vec![WirePart {
                        text: None,
                        inline_data: None,
                        function_call: None,
                        function_response: Some(WireFunctionResponse {
                            name: result.tool_name.clone(),
                            response: json!({ "output": text }),
                        }),
                    }],
                });
            }
        }
    }
    contents
}

fn thinking_level(effort: ReasoningEffort) -> &'static str {
    match effort {
        ReasoningEffort::Low => "LOW",
        ReasoningEffort::Medium => "MEDIUM",
        ReasoningEffort::High => "HIGH",
    }
}

fn generate_body(request: &ChatRequest, project: &str) -> GenerateBody {
    let tool_config = request.tool_choice.as_ref().map(|choice| match choice {
        ToolChoice::Auto => json!({"functionCallingConfig": {"mode": "AUTO"}}),
        ToolChoice::Required => json!({"functionCallingConfig": {"mode": "ANY"}}),
        ToolChoice::None => json!({"functionCallingConfig": {"mode": "NONE"}}),
        ToolChoice::Tool(name) => json!({
            "functionCallingConfig": {"mode": "ANY", "allowedFunctionNames": [name]}
        }),
    });
    GenerateBody {
        project: project.to_string(),
        model: request.model.clone(),
        request: InnerRequest {
            contents: convert_contents(request),
            system_instruction: request
                .system
                .as_ref()
                .map(|s| WireSystemInstruction { parts: vec![WirePart::text(s)] }),
            generation_config: Some(WireGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
                thinking_config: request.reasoning.map(|effort| WireThinkingConfig {
                    include_thoughts: true,
                    thinking_level: thinking_level(effort),
                }),
            }),
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(vec![WireToolDeclaration {
                    function_declarations: request
                        .tools
                        .iter()
                        .map(|t| WireFunctionDeclaration {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.parameters.clone(),
                        })
                        .collect(),
                }])
            },
            tool_config,
        },
    }
}

fn map_finish_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("MAX_TOKENS") => StopReason::Length,
        Some("SAFETY") | Some("PROHIBITED_CONTENT") => StopReason::Error,
        _ => StopReason::Stop,
    }
}

fn usage_from_metadata(metadata: Option<UsageMetadata>) -> Usage {
    let Some(m) = metadata else { return Usage::default() };
    let input = m.prompt_token_count.unwrap_or(0);
    let output =
        m.candidates_token_count.unwrap_or(0) + m.thoughts_token_count.unwrap_or(0);
    Usage {
        input_tokens: input,
        output_tokens: output,
        cache_read_tokens: m.cached_content_token_count.unwrap_or(0),
        cache_write_tokens: 0,
        total_tokens: m.total_token_count.unwrap_or(input + output),
    }
}

fn synthesize_call_id(given: Option<String>) -> String {
    given.unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()))
}

/// Parse `retryDelay` strings like "3600s" or "3.5s".
fn parse_retry_delay(value: &str) -> Option<Duration> {
    let seconds: f64 = value.trim().strip_suffix('s')?.parse().ok()?;
    if seconds.is_finite() && seconds >= 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

#[async_trait]
impl ProviderAdapter for GoogleOAuthAdapter {
    fn tag(&self) -> &str {
        "google-oauth"
    }

    fn models(&self) -> Vec<ModelDef> {
        static_models()
    }

    fn rotation_mode(&self) -> RotationMode {
        RotationMode::Sequential
    }

    fn assign_tier(&self, record: &crate::auth::CredentialRecord) -> u8 {
        match record.oauth().and_then(|t| t.metadata.tier.as_deref()) {
            Some("standard-tier") | Some("paid") => TIER_PAID,
            _ => TIER_FREE,
        }
    }

    fn min_tier(&self, model: &str) -> Option<u8> {
        // The preview pro model is only served to licensed accounts.
        match model {
            "gemini-2.5-pro-preview" => Some(TIER_PAID),
            _ => None,
        }
    }

    fn usage_config(&self) -> UsageConfig {
        let mut config = UsageConfig::new("google-oauth");
        config.max_concurrent = 2;
        config.tier_multipliers.insert(TIER_PAID, 4);
        config.default_reset = ResetMode::PerModel { default_window_ms: 5 * 60 * 1000 };
        config
            .reset_modes
            .insert(TIER_FREE, ResetMode::Daily { utc_hour: 7 });
        config.quota_groups = vec![QuotaGroup {
            name: "gemini-pro".into(),
            models: vec!["gemini-2.5-pro".into(), "gemini-2.5-pro-preview".into()],
        }];
        config.fair_cycle = true;
        config
    }

    fn parse_quota_error(&self, status: u16, body: &str) -> Option<QuotaHint> {
        if status != 429 && status != 403 {
            return None;
        }
        let value: serde_json::Value = serde_json::from_str(body).ok()?;
        let details = value.pointer("/error/details")?.as_array()?;
        for detail in details {
            let type_url = detail.get("@type").and_then(|t| t.as_str()).unwrap_or("");
            if type_url.ends_with("RetryInfo") {
                let delay = detail
                    .get("retryDelay")
                    .and_then(|d| d.as_str())
                    .and_then(parse_retry_delay)?;
                return Some(QuotaHint {
                    reset_at_ms: Some(now_ms() + delay.as_millis() as i64),
                    retry_after: Some(delay),
                });
            }
        }
        // ErrorInfo without RetryInfo gives no usable reset.
        None
    }

    fn background_job(&self) -> Option<BackgroundJobSpec> {
        Some(BackgroundJobSpec {
            name: "google-quota-baseline",
            interval: Duration::from_secs(300),
            run_on_start: true,
        })
    }

    /// Poll `loadCodeAssist` per credential to learn the account tier and
    /// remaining-quota baseline.
    async fn run_background_job(&self, ctx: &JobContext) -> anyhow::Result<()> {
        for id in ctx.store.list(self.tag()) {
            let Ok(bearer) = ctx.tokens.get_auth_header(&id).await else {
                continue;
            };
            let response = self
                .http
                .post(format!("{}/v1internal:loadCodeAssist", self.endpoint))
                .header("Authorization", &bearer)
                .json(&json!({
                    "metadata": {
                        "ideType": "IDE_UNSPECIFIED",
                        "platform": "PLATFORM_UNSPECIFIED",
                        "pluginType": "GEMINI"
                    }
                }))
                .send()
                .await;
            let Ok(response) = response else { continue };
            if !response.status().is_success() {
                continue;
            }
            let Ok(value) = response.json::<serde_json::Value>().await else {
                continue;
            };
            if let Some(tier) = value.pointer("/currentTier/id").and_then(|t| t.as_str()) {
                if let Some(record) = ctx.store.load(&id) {
                    if let Some(mut tokens) = record.oauth().cloned() {
                        if tokens.metadata.tier.as_deref() != Some(tier) {
                            tokens.metadata.tier = Some(tier.to_string());
                            ctx.store.update_tokens(&id, tokens);
                        }
                    }
                }
            }
            if let Some(baselines) = value.pointer("/quotaInfo").and_then(|q| q.as_array()) {
                for entry in baselines {
                    let Some(model) = entry.get("model").and_then(|m| m.as_str()) else {
                        continue;
                    };
                    let Some(fraction) =
                        entry.get("remainingFraction").and_then(|f| f.as_f64())
                    else {
                        continue;
                    };
                    let max = entry.get("maxRequests").and_then(|m| m.as_u64());
                    ctx.usage.set_baseline(&id, model, fraction, max, now_ms());
                }
            }
        }
        Ok(())
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        auth: &AdapterAuth,
    ) -> Result<AssistantMessage, GatewayError> {
        let project = auth.project_id().unwrap_or_default();
        let body = generate_body(request, project);
        let response = self
            .apply_headers(self.http.post(self.generate_url(false)), auth)
            .timeout(NON_STREAMING_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers().get(reqwest::header::RETRY_AFTER));
            let text = response.text().await.unwrap_or_default();
            return Err(classify_response(self, status.as_u16(), retry_after, &text));
        }

        let envelope: Envelope = response.json().await?;
        let data = envelope.response.ok_or_else(|| GatewayError::Server {
            status: status.as_u16(),
            detail: "empty response envelope".into(),
        })?;
        let candidate = data
            .candidates
            .and_then(|mut c| if c.is_empty() { None } else { Some(c.remove(0)) })
            .ok_or_else(|| GatewayError::Server {
                status: status.as_u16(),
                detail: "no candidates in response".into(),
            })?;

        if matches!(candidate.finish_reason.as_deref(), Some("SAFETY") | Some("PROHIBITED_CONTENT"))
        {
            return Err(GatewayError::ContentFilter("response blocked by provider safety".into()));
        }

        let mut content = Vec::new();
        for part in candidate.content.and_then(|c| c.parts).unwrap_or_default() {
            if let Some(text) = part.text {
                if part.thought.unwrap_or(false) {
                    content.push(ContentBlock::Thinking(ThinkingContent { thinking: text }));
                } else {
                    content.push(ContentBlock::Text(TextContent { text }));
                }
            }
            if let Some(call) = part.function_call {
                content.push(ContentBlock::ToolCall(ToolCall {
                    id: synthesize_call_id(call.id),
                    name: call.name,
                    arguments: call.args.unwrap_or(json!({})),
                }));
            }
        }

        let has_tool_calls = content.iter().any(|b| matches!(b, ContentBlock::ToolCall(_)));
        let stop_reason = if has_tool_calls {
            StopReason::ToolUse
        } else {
            map_finish_reason(candidate.finish_reason.as_deref())
        };

        Ok(AssistantMessage {
            content,
            model: request.model.clone(),
            provider: self.tag().to_string(),
            usage: Some(usage_from_metadata(data.usage_metadata)),
            stop_reason,
        })
    }

    fn stream_chat(
        &self,
        request: &ChatRequest,
        auth: &AdapterAuth,
    ) -> BoxStream<'static, Result<StreamEvent, GatewayError>> {
        let project = auth.project_id().unwrap_or_default().to_string();
        let body = generate_body(request, &project);
        let builder = self.apply_headers(self.http.post(self.generate_url(true)), auth);
        let model = request.model.clone();
        let provider = self.tag().to_string();
        let adapter = self.clone();

        let stream = async_stream::stream! {
            let response = match builder.json(&body).send().await {
                Ok(r) => r,
                Err(e) => {
                    yield Err(GatewayError::Network(e));
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let retry_after =
                    parse_retry_after(response.headers().get(reqwest::header::RETRY_AFTER));
                let text = response.text().await.unwrap_or_default();
                yield Err(classify_response(&adapter, status.as_u16(), retry_after, &text));
                return;
            }
            yield Ok(StreamEvent::Start);

            let frames = SseFrames::new(response.bytes_stream(), STREAM_IDLE_TIMEOUT, true);
            tokio::pin!(frames);
            let mut text_buffer = String::new();
            let mut thinking_buffer = String::new();
            let mut tool_calls: Vec<ToolCall> = Vec::new();
            let mut usage = Usage::default();
            let mut finish: Option<String> = None;

            while let Some(frame) = frames.next().await {
                let frame = match frame {
                    Ok(f) => f,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                let envelope: Envelope = match serde_json::from_str(&frame.data) {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                let Some(data) = envelope.response else { continue };
                if let Some(metadata) = data.usage_metadata {
                    usage = usage_from_metadata(Some(metadata));
                }
                for candidate in data.candidates.unwrap_or_default() {
                    if let Some(reason) = &candidate.finish_reason {
                        finish = Some(reason.clone());
                    }
                    for part in candidate.content.and_then(|c| c.parts).unwrap_or_default() {
                        if let Some(text) = part.text {
                            if part.thought.unwrap_or(false) {
                                thinking_buffer.push_str(&text);
                                yield Ok(StreamEvent::ThinkingDelta(text));
                            } else {
                                text_buffer.push_str(&text);
                                yield Ok(StreamEvent::TextDelta(text));
                            }
                        }
                        if let Some(call) = part.function_call {
                            // Function calls arrive whole, not as deltas.
                            let index = tool_calls.len();
                            let tool_call = ToolCall {
                                id: synthesize_call_id(call.id),
                                name: call.name,
                                arguments: call.args.unwrap_or(json!({})),
                            };
                            yield Ok(StreamEvent::ToolCallStart {
                                index,
                                id: tool_call.id.clone(),
                                name: tool_call.name.clone(),
                            });
                            yield Ok(StreamEvent::ToolCallEnd {
                                index,
                                tool_call: tool_call.clone(),
                            });
                            tool_calls.push(tool_call);
                        }
                    }
                }
            }

            if matches!(finish.as_deref(), Some("SAFETY") | Some("PROHIBITED_CONTENT")) {
                yield Err(GatewayError::ContentFilter(
                    "stream blocked by provider safety".into(),
                ));
                return;
            }

            let mut content = Vec::new();
            if !thinking_buffer.is_empty() {
                content.push(ContentBlock::Thinking(ThinkingContent { thinking: thinking_buffer }));
            }
            if !text_buffer.is_empty() {
                content.push(ContentBlock::Text(TextContent { text: text_buffer }));
            }
            let has_tool_calls = !tool_calls.is_empty();
            content.extend(tool_calls.into_iter().map(ContentBlock::ToolCall));

            let stop_reason = if has_tool_calls {
                StopReason::ToolUse
            } else {
                map_finish_reason(finish.as_deref())
            };
            yield Ok(StreamEvent::Done {
                message: AssistantMessage {
                    content,
                    model,
                    provider,
                    usage: Some(usage),
                    stop_reason,
                },
            });
        };
        Box::pin(stream)
    }
}

fn static_models() -> Vec<ModelDef> {
    vec![
        ModelDef {
            id: "gemini-2.5-pro".into(),
            name: "Gemini 2.5 Pro".into(),
            provider: "google-oauth".into(),
            reasoning: true,
            embeddings: false,
            input: vec![InputModality::Text, InputModality::Image],
            cost: ModelCost { input: 1.25, output: 10.0, cache_read: 0.31, cache_write: 0.0 },
            context_window: 1_048_576,
            max_tokens: 65_536,
        },
        ModelDef {
            id: "gemini-2.5-pro-preview".into(),
            name: "Gemini 2.5 Pro Preview".into(),
            provider: "google-oauth".into(),
            reasoning: true,
            embeddings: false,
            input: vec![InputModality::Text, InputModality::Image],
            cost: ModelCost { input: 1.25, output: 10.0, cache_read: 0.31, cache_write: 0.0 },
            context_window: 1_048_576,
            max_tokens: 65_536,
        },
        ModelDef {
            id: "gemini-2.5-flash".into(),
            name: "Gemini 2.5 Flash".into(),
            provider: "google-oauth".into(),
            reasoning: true,
            embeddings: false,
            input: vec![InputModality::Text, InputModality::Image],
            cost: ModelCost { input: 0.3, output: 2.5, cache_read: 0.075, cache_write: 0.0 },
            context_window: 1_048_576,
            max_tokens: 65_536,
        },
    ]
}
