//! Static-key adapter speaking the OpenAI wire format: Bearer auth, JSON
//! errors under `error.code`/`error.message`, SSE deltas for streaming.

use super::{
    classify_response, parse_retry_after, AdapterAuth, ProviderAdapter, QuotaHint, RotationMode,
    NON_STREAMING_TIMEOUT,
};
use crate::error::GatewayError;
use crate::sse::{SseFrames, STREAM_IDLE_TIMEOUT};
use crate::types::*;
use crate::usage::{QuotaGroup, ResetMode, UsageConfig};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct OpenAiAdapter {
    http: Client,
    base_url: String,
}

impl OpenAiAdapter {
    pub fn new(http: Client) -> Self {
        Self { http, base_url: DEFAULT_BASE_URL.to_string() }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/embeddings", self.base_url)
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatBody {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'static str>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionCall,
}

#[derive(Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionSchema,
}

#[derive(Serialize)]
struct WireFunctionSchema {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<WireUsage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<ResponseToolCall>>,
}

#[derive(Deserialize)]
struct ResponseToolCall {
    id: String,
    function: ResponseFunction,
}

#[derive(Deserialize)]
struct ResponseFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
    usage: Option<WireUsage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Deserialize)]
struct StreamToolCallDelta {
    index: Option<usize>,
    id: Option<String>,
    function: Option<StreamFunctionDelta>,
}

#[derive(Deserialize)]
struct StreamFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingEntry>,
    usage: Option<WireUsage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingEntry {
    index: usize,
    embedding: Vec<f32>,
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn convert_messages(request: &ChatRequest) -> Vec<WireMessage> {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(WireMessage {
            role: "system",
            content: Some(json!(system)),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        });
    }
    for message in &request.messages {
        match message {
            Message::User(user) => messages.push(WireMessage {
                role: "user",
                content: Some(user_content_to_json(&user.content)),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            }),
            Message::Assistant(assistant) => {
                let mut text = String::new();
                let mut tool_calls = Vec::new();
                for block in &assistant.content {
                    match block {
                        ContentBlock::Text(t) => text.push_str(&t.text),
                        ContentBlock::ToolCall(tc) => tool_calls.push(WireToolCall {
                            id: tc.id.clone(),
                            kind: "function",
                            function: WireFunctionCall {
                                name: tc.name.clone(),
                                arguments: tc.arguments.to_string(),
                            },
                        }),
                        // Thinking is never echoed back upstream.
                        ContentBlock::Thinking(_) | ContentBlock::Image(_) => {}
                    }
                }
                messages.push(WireMessage {
                    role: "assistant",
                    content: if text.is_empty() { None } else { Some(json!(text)) },
                    tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                    tool_call_id: None,
                    name: None,
                });
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
                messages.push(WireMessage {
                    role: "tool",
                    content: Some(json!(text)),
                    tool_calls: None,
                    tool_call_id: Some(result.tool_call_id.clone()),
                    name: Some(result.tool_name.clone()),
                });
            }
        }
    }
    messages
}

fn user_content_to_json(blocks: &[ContentBlock]) -> serde_json::Value {
    if let [ContentBlock::Text(t)] = blocks {
        return json!(t.text);
    }
    let parts: Vec<serde_json::Value> = blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text(t) => Some(json!({"type": "text", "text": t.text})),
            ContentBlock::Image(img) => Some(json!({
                "type": "image_url",
                "image_url": {
                    "url": format!("data:{};base64,{}", img.mime_type, img.data)
                }
            })),
            _ => None,
        })
        .collect();
    json!(parts)
}

fn convert_tool_choice(choice: &ToolChoice) -> serde_json::Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::Required => json!("required"),
        ToolChoice::None => json!("none"),
        ToolChoice::Tool(name) => json!({"type": "function", "function": {"name": name}}),
    }
}

fn reasoning_effort(effort: ReasoningEffort) -> &'static str {
    match effort {
        ReasoningEffort::Low => "low",
        ReasoningEffort::Medium => "medium",
        ReasoningEffort::High => "high",
    }
}

fn chat_body(request: &ChatRequest, stream: bool) -> ChatBody {
    ChatBody {
        model: request.model.clone(),
        messages: convert_messages(request),
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        stream,
        stream_options: stream.then(|| json!({"include_usage": true})),
        tools: if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| WireTool {
                        kind: "function",
                        function: WireFunctionSchema {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.parameters.clone(),
                        },
                    })
                    .collect(),
            )
        },
        tool_choice: request.tool_choice.as_ref().map(convert_tool_choice),
        reasoning_effort: request.reasoning.map(reasoning_effort),
    }
}

fn map_finish_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("length") => StopReason::Length,
        Some("tool_calls") => StopReason::ToolUse,
        _ => StopReason::Stop,
    }
}

fn usage_from_wire(wire: Option<WireUsage>) -> Usage {
    let wire = match wire {
        Some(w) => w,
        None => return Usage::default(),
    };
    let input = wire.prompt_tokens.unwrap_or(0);
    let output = wire.completion_tokens.unwrap_or(0);
    Usage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: wire.total_tokens.unwrap_or(input + output),
        ..Usage::default()
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn tag(&self) -> &str {
        "openai"
    }

    fn models(&self) -> Vec<ModelDef> {
        static_models()
    }

    fn rotation_mode(&self) -> RotationMode {
        RotationMode::Balanced { tolerance: 1.0 }
    }

    fn usage_config(&self) -> UsageConfig {
        let mut config = UsageConfig::new("openai");
        config.max_concurrent = 8;
        config.default_reset = ResetMode::Credential { window_ms: 60_000 };
        config.quota_groups = vec![QuotaGroup {
            name: "gpt-4o-family".into(),
            models: vec!["gpt-4o".into(), "gpt-4o-mini".into()],
        }];
        config
    }

    fn parse_quota_error(&self, status: u16, body: &str) -> Option<QuotaHint> {
        if status != 429 {
            return None;
        }
        // OpenAI-wire quota errors embed the wait in the message text:
        // "Please try again in 20s." / "… in 6m0s." / "… in 250ms."
        let value: serde_json::Value = serde_json::from_str(body).ok()?;
        let message = value.pointer("/error/message")?.as_str()?;
        let delay = parse_try_again_delay(message)?;
        Some(QuotaHint { reset_at_ms: None, retry_after: Some(delay) })
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        auth: &AdapterAuth,
    ) -> Result<AssistantMessage, GatewayError> {
        let body = chat_body(request, false);
        let response = self
            .http
            .post(self.chat_url())
            .header("Authorization", &auth.bearer)
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

        let parsed: ChatResponse = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Server {
                status: status.as_u16(),
                detail: "empty choices in response".into(),
            })?;

        let mut content = Vec::new();
        if let Some(thinking) = choice.message.reasoning_content.filter(|t| !t.is_empty()) {
            content.push(ContentBlock::Thinking(ThinkingContent { thinking }));
        }
        if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
            content.push(ContentBlock::Text(TextContent { text }));
        }
        for tc in choice.message.tool_calls.unwrap_or_default() {
            let arguments = serde_json::from_str(&tc.function.arguments).unwrap_or(json!({}));
            content.push(ContentBlock::ToolCall(ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments,
            }));
        }

        Ok(AssistantMessage {
            content,
            model: parsed.model.unwrap_or_else(|| request.model.clone()),
            provider: self.tag().to_string(),
            usage: Some(usage_from_wire(parsed.usage)),
            stop_reason: map_finish_reason(choice.finish_reason.as_deref()),
        })
    }

    fn stream_chat(
        &self,
        request: &ChatRequest,
        auth: &AdapterAuth,
    ) -> BoxStream<'static, Result<StreamEvent, GatewayError>> {
        let body = chat_body(request, true);
        let http = self.http.clone();
        let url = self.chat_url();
        let bearer = auth.bearer.clone();
        let model = request.model.clone();
        let provider = self.tag().to_string();
        let adapter_for_classify = self.clone();

        let stream = async_stream::stream! {
            let response = match http
                .post(&url)
                .header("Authorization", &bearer)
                .json(&body)
                .send()
                .await
            {
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
                yield Err(classify_response(&adapter_for_classify, status.as_u16(), retry_after, &text));
                return;
            }
            yield Ok(StreamEvent::Start);

            let frames = SseFrames::new(response.bytes_stream(), STREAM_IDLE_TIMEOUT, true);
            tokio::pin!(frames);
            let mut text_buffer = String::new();
            let mut thinking_buffer = String::new();
            let mut tool_calls: Vec<(String, String, String)> = Vec::new();
            let mut usage = Usage::default();
            let mut stop_reason = StopReason::Stop;
            let mut response_model: Option<String> = None;

            while let Some(frame) = frames.next().await {
                let frame = match frame {
                    Ok(f) => f,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                if frame.is_done_marker() {
                    break;
                }
                let chunk: StreamChunk = match serde_json::from_str(&frame.data) {
                    Ok(c) => c,
                    Err(_) => continue,
                };
                if let Some(m) = chunk.model {
                    response_model = Some(m);
                }
                if let Some(wire) = chunk.usage {
                    usage = usage_from_wire(Some(wire));
                }
                for choice in chunk.choices.unwrap_or_default() {
                    if let Some(reason) = &choice.finish_reason {
                        stop_reason = map_finish_reason(Some(reason));
                    }
                    let Some(delta) = choice.delta else { continue };
                    if let Some(thinking) = delta.reasoning_content.filter(|t| !t.is_empty()) {
                        thinking_buffer.push_str(&thinking);
                        yield Ok(StreamEvent::ThinkingDelta(thinking));
                    }
                    if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                        text_buffer.push_str(&text);
                        yield Ok(StreamEvent::TextDelta(text));
                    }
                    for tc_delta in delta.tool_calls.unwrap_or_default() {
                        let index = tc_delta.index.unwrap_or(tool_calls.len());
                        while tool_calls.len() <= index {
                            tool_calls.push((String::new(), String::new(), String::new()));
                        }
                        if let Some(id) = tc_delta.id {
                            tool_calls[index].0 = id;
                        }
                        if let Some(function) = tc_delta.function {
                            if let Some(name) = function.name {
                                if tool_calls[index].1.is_empty() {
                                    tool_calls[index].1 = name.clone();
                                    yield Ok(StreamEvent::ToolCallStart {
                                        index,
                                        id: tool_calls[index].0.clone(),
                                        name,
                                    });
                                }
                            }
                            if let Some(arguments) = function.arguments {
                                tool_calls[index].2.push_str(&arguments);
                                yield Ok(StreamEvent::ToolCallDelta { index, delta: arguments });
                            }
                        }
                    }
                }
            }

            let mut content = Vec::new();
            if !thinking_buffer.is_empty() {
                content.push(ContentBlock::Thinking(ThinkingContent {
                    thinking: thinking_buffer,
                }));
            }
            if !text_buffer.is_empty() {
                content.push(ContentBlock::Text(TextContent { text: text_buffer }));
            }
            for (index, (id, name, arguments)) in tool_calls.iter().enumerate() {
                let parsed = serde_json::from_str(arguments).unwrap_or(json!({}));
                let tool_call = ToolCall { id: id.clone(), name: name.clone(), arguments: parsed };
                yield Ok(StreamEvent::ToolCallEnd { index, tool_call: tool_call.clone() });
                content.push(ContentBlock::ToolCall(tool_call));
            }

            yield Ok(StreamEvent::Done {
                message: AssistantMessage {
                    content,
                    model: response_model.unwrap_or(model),
                    provider,
                    usage: Some(usage),
                    stop_reason,
                },
            });
        };
        Box::pin(stream)
    }

    async fn embed(
        &self,
        request: &EmbeddingRequest,
        auth: &AdapterAuth,
    ) -> Result<EmbeddingResponse, GatewayError> {
        let mut body = json!({
            "model": request.model,
            "input": request.inputs,
        });
        if let Some(dimensions) = request.dimensions {
            body["dimensions"] = json!(dimensions);
        }
        let response = self
            .http
            .post(self.embeddings_url())
            .header("Authorization", &auth.bearer)
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

        let parsed: EmbeddingsResponse = response.json().await?;
        let mut entries = parsed.data;
        entries.sort_by_key(|e| e.index);
        Ok(EmbeddingResponse {
            model: parsed.model.unwrap_or_else(|| request.model.clone()),
            vectors: entries.into_iter().map(|e| e.embedding).collect(),
            usage: usage_from_wire(parsed.usage),
        })
    }
}

/// Parse delays like "20s", "6m0s", "250ms" out of "Please try again in …".
fn parse_try_again_delay(message: &str) -> Option<std::time::Duration> {
    let marker = "try again in ";
    let at = message.to_ascii_lowercase().find(marker)?;
    let rest = &message[at + marker.len()..];
    let token: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '.' | 'm' | 's' | 'h'))
        .collect();
    // The hint usually ends the sentence ("… in 20s."); drop that period.
    let token = token.trim_end_matches('.');
    if token.is_empty() {
        return None;
    }
    let mut total = std::time::Duration::ZERO;
    let mut number = String::new();
    let mut chars = token.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let value: f64 = number.parse().ok()?;
        number.clear();
        let unit = match c {
            'h' => 3600.0,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                0.001
            }
            'm' => 60.0,
            's' => 1.0,
            _ => return None,
        };
        total += std::time::Duration::from_secs_f64(value * unit);
    }
    if !number.is_empty() {
        // Trailing bare number: treat as seconds.
        total += std::time::Duration::from_secs_f64(number.parse().ok()?);
    }
    Some(total)
}

fn static_models() -> Vec<ModelDef> {
    vec![
        ModelDef {
            id: "gpt-4o".into(),
            name: "GPT-4o".into(),
            provider: "openai".into(),
            reasoning: false,
            embeddings: false,
            input: vec![InputModality::Text, InputModality::Image],
            cost: ModelCost { input: 2.5, output: 10.0, cache_read: 1.25, cache_write: 0.0 },
            context_window: 128_000,
            max_tokens: 16_384,
        },
        ModelDef {
            id: "gpt-4o-mini".into(),
            name: "GPT-4o mini".into(),
            provider: "openai".into(),
            reasoning: false,
            embeddings: false,
            input: vec![InputModality::Text, InputModality::Image],
            cost: ModelCost { input: 0.15, output: 0.6, cache_read: 0.075, cache_write: 0.0 },
            context_window: 128_000,
            max_tokens: 16_384,
        },
        ModelDef {
            id: "o4-mini".into(),
            name: "o4-mini".into(),
            provider: "openai".into(),
            reasoning: true,
            embeddings: false,
            input: vec![InputModality::Text, InputModality::Image],
            cost: ModelCost { input: 1.1, output: 4.4, cache_read: 0.275, cache_write: 0.0 },
            context_window: 200_000,
            max_tokens: 100_000,
        },
        ModelDef {
            id: "text-embedding-3-small".into(),
            name: "Text Embedding 3 Small".into(),
            provider: "openai".into(),
            reasoning: false,
            embeddings: true,
            input: vec![InputModality::Text],
            cost: ModelCost { input: 0.02, output: 0.0, cache_read: 0.0, cache_write: 0.0 },
            context_window: 8_191,
            max_tokens: 0,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_tools() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o".into(),
            system: Some("be brief".into()),
            messages: vec![Message::User(UserMessage {
                content: vec![ContentBlock::Text(TextContent { text: "hi".into() })],
            })],
            tools: vec![ToolDef {
                name: "lookup".into(),
                description: "find things".into(),
                parameters: json!({"type": "object"}),
            }],
            tool_choice: Some(ToolChoice::Tool("lookup".into())),
            temperature: Some(0.2),
            max_tokens: Some(512),
            reasoning: Some(ReasoningEffort::High),
            stream: false,
        }
    }

    #[test]
    fn chat_body_maps_system_tools_and_choice() {
        let body = chat_body(&request_with_tools(), false);
        let value = serde_json::to_value(&body).unwrap();

        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][0]["content"], "be brief");
        assert_eq!(value["messages"][1]["role"], "user");
        assert_eq!(value["tools"][0]["function"]["name"], "lookup");
        assert_eq!(value["tool_choice"]["function"]["name"], "lookup");
        assert_eq!(value["reasoning_effort"], "high");
        assert!(value.get("stream_options").is_none());
    }

    #[test]
    fn streaming_body_requests_usage() {
        let body = chat_body(&request_with_tools(), true);
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["stream"], true);
        assert_eq!(value["stream_options"]["include_usage"], true);
    }

    #[test]
    fn tool_result_round_trips_as_tool_role() {
        let request = ChatRequest {
            model: "gpt-4o".into(),
            messages: vec![Message::ToolResult(ToolResultMessage {
                tool_call_id: "call_1".into(),
                tool_name: "lookup".into(),
                content: vec![ContentBlock::Text(TextContent { text: "42".into() })],
                is_error: false,
            })],
            ..Default::default()
        };
        let value = serde_json::to_value(chat_body(&request, false)).unwrap();
        assert_eq!(value["messages"][0]["role"], "tool");
        assert_eq!(value["messages"][0]["tool_call_id"], "call_1");
        assert_eq!(value["messages"][0]["content"], "42");
    }

    #[test]
    fn try_again_delays_parse() {
        use std::time::Duration;
        assert_eq!(parse_try_again_delay("Please try again in 20s."), Some(Duration::from_secs(20)));
        assert_eq!(
            parse_try_again_delay("Rate limit reached. Please try again in 6m0s."),
            Some(Duration::from_secs(360))
        );
        assert_eq!(
            parse_try_again_delay("Please try again in 250ms."),
            Some(Duration::from_millis(250))
        );
        assert_eq!(parse_try_again_delay("no hint here"), None);
    }

    #[test]
    fn quota_parser_requires_429_and_message() {
        let adapter = OpenAiAdapter::new(Client::new());
        let body = r#"{"error":{"message":"Rate limit reached. Please try again in 20s."}}"#;
        let hint = adapter.parse_quota_error(429, body).unwrap();
        assert_eq!(hint.retry_after, Some(std::time::Duration::from_secs(20)));
        assert!(adapter.parse_quota_error(500, body).is_none());
        assert!(adapter.parse_quota_error(429, "{}").is_none());
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("stop")), StopReason::Stop);
        assert_eq!(map_finish_reason(Some("length")), StopReason::Length);
        assert_eq!(map_finish_reason(Some("tool_calls")), StopReason::ToolUse);
        assert_eq!(map_finish_reason(None), StopReason::Stop);
    }
}
