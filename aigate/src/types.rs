use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Provider identifiers
// ---------------------------------------------------------------------------

/// A provider identifier string, e.g. "openai", "google-oauth".
pub type ProviderId = String;

// ---------------------------------------------------------------------------
// Model definition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCost {
    /// Cost per million input tokens (USD).
    pub input: f64,
    /// Cost per million output tokens (USD).
    pub output: f64,
    /// Cost per million cache-read tokens (USD).
    pub cache_read: f64,
    /// Cost per million cache-write tokens (USD).
    pub cache_write: f64,
}

/// Supported input modalities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputModality {
    Text,
    Image,
}

/// A model definition known to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDef {
    /// Model ID as sent to the provider API (e.g. "gpt-4o").
    pub id: String,
    /// Human-friendly display name.
    pub name: String,
    /// Which provider owns this model.
    pub provider: ProviderId,
    /// Whether the model supports extended reasoning / thinking.
    pub reasoning: bool,
    /// Whether the model serves `/v1/embeddings` rather than chat.
    #[serde(default)]
    pub embeddings: bool,
    /// Supported input modalities.
    pub input: Vec<InputModality>,
    /// Token cost information.
    pub cost: ModelCost,
    /// Maximum context window in tokens.
    pub context_window: u64,
    /// Maximum output tokens.
    pub max_tokens: u64,
}

// ---------------------------------------------------------------------------
// Chat messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingContent {
    pub thinking: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageContent {
    /// Base64-encoded image data.
    pub data: String,
    /// MIME type, e.g. "image/jpeg".
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text(TextContent),
    Thinking(ThinkingContent),
    Image(ImageContent),
    ToolCall(ToolCall),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub provider: ProviderId,
    pub usage: Option<Usage>,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: Vec<ContentBlock>,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
}

// ---------------------------------------------------------------------------
// Usage & stop reason
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    Stop,
    Length,
    ToolUse,
    Error,
    Aborted,
}

// ---------------------------------------------------------------------------
// Tool definitions and selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool parameters.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    /// The model must call some tool.
    Required,
    /// Tool calling disabled.
    None,
    /// The model must call this specific tool.
    Tool(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

// ---------------------------------------------------------------------------
// Normalized chat request (what the dispatcher executes)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Short model ID, without the provider prefix.
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningEffort>,
    #[serde(default)]
    pub stream: bool,
}

impl Default for ToolChoice {
    fn default() -> Self {
        Self::Auto
    }
}

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Short model ID, without the provider prefix.
    pub model: String,
    pub inputs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub model: String,
    pub vectors: Vec<Vec<f32>>,
    pub usage: Usage,
}

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Start,
    TextDelta(String),
    ThinkingDelta(String),
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    ToolCallDelta {
        index: usize,
        delta: String,
    },
    ToolCallEnd {
        index: usize,
        tool_call: ToolCall,
    },
    Done {
        message: AssistantMessage,
    },
}

// ---------------------------------------------------------------------------
// Token estimation
// ---------------------------------------------------------------------------

/// Rough token estimate used by the stateless count/cost helpers. Providers
/// that can count exactly are asked instead; this keeps the helpers offline.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Estimate the prompt tokens of a request without calling a provider.
pub fn estimate_request_tokens(request: &ChatRequest) -> u64 {
    let mut total = request
        .system
        .as_deref()
        .map(estimate_tokens)
        .unwrap_or(0);
    for message in &request.messages {
        let blocks = match message {
            Message::User(u) => &u.content,
            Message::Assistant(a) => &a.content,
            Message::ToolResult(t) => &t.content,
        };
        for block in blocks {
            total += match block {
                ContentBlock::Text(t) => estimate_tokens(&t.text),
                ContentBlock::Thinking(t) => estimate_tokens(&t.thinking),
                ContentBlock::ToolCall(tc) => estimate_tokens(&tc.arguments.to_string()),
                // Images bill as a flat patch count upstream; use a fixed stand-in.
                ContentBlock::Image(_) => 768,
            };
        }
    }
    for tool in &request.tools {
        total += estimate_tokens(&tool.name)
            + estimate_tokens(&tool.description)
            + estimate_tokens(&tool.parameters.to_string());
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn request_estimate_covers_all_blocks() {
        let request = ChatRequest {
            model: "m".into(),
            system: Some("you are terse".into()),
            messages: vec![Message::User(UserMessage {
                content: vec![ContentBlock::Text(TextContent {
                    text: "hello world".into(),
                })],
            })],
            ..Default::default()
        };
        assert!(estimate_request_tokens(&request) >= estimate_tokens("you are terse"));
    }
}
