//! Dialect translation between the two public wire formats (OpenAI chat and
//! Anthropic messages) and the normalized request/response types the
//! dispatcher works with.

pub mod stream;

use crate::error::GatewayError;
use crate::types::*;
use serde_json::{json, Value};
use std::collections::HashMap;

fn invalid(detail: impl Into<String>) -> GatewayError {
    GatewayError::Other(detail.into())
}

// ---------------------------------------------------------------------------
// Anthropic dialect -> normalized
// ---------------------------------------------------------------------------

/// Parse an Anthropic messages request body into the normalized form.
pub fn chat_request_from_anthropic(body: &Value) -> Result<ChatRequest, GatewayError> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing model"))?
        .to_string();

    let system = match body.get("system") {
        Some(Value::String(s)) => Some(s.clone()),
        // System can also arrive as an array of text blocks.
        Some(Value::Array(blocks)) => {
            let text = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    };

    let mut messages = Vec::new();
    // Anthropic tool_result blocks carry only the call id; recover the tool
    // name from the matching tool_use seen earlier in the conversation.
    let mut tool_names: HashMap<String, String> = HashMap::new();

    for message in body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("missing messages"))?
    {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("");
        let content = message.get("content").cloned().unwrap_or(Value::Null);
        match role {
            "user" => parse_anthropic_user(&content, &tool_names, &mut messages),
            "assistant" => {
                let blocks = parse_anthropic_assistant(&content, &mut tool_names);
                messages.push(Message::Assistant(AssistantMessage {
                    content: blocks,
                    model: String::new(),
                    provider: String::new(),
                    usage: None,
                    stop_reason: StopReason::Stop,
                }));
            }
            other => {
                return Err(invalid(format!("unsupported message role: {other}")));
            }
        }
    }

    let tools = body
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .map(|tool| ToolDef {
                    name: tool.get("name").and_then(Value::as_str).unwrap_or("").to_string(),
                    description: tool
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    parameters: tool.get("input_schema").cloned().unwrap_or(json!({})),
                })
                .collect()
        })
        .unwrap_or_default();

    let tool_choice = body.get("tool_choice").and_then(|choice| {
        match choice.get("type").and_then(Value::as_str)? {
            "auto" => Some(ToolChoice::Auto),
            "any" => Some(ToolChoice::Required),
            "none" => Some(ToolChoice::None),
            "tool" => choice
                .get("name")
                .and_then(Value::as_str)
                .map(|name| ToolChoice::Tool(name.to_string())),
            _ => None,
        }
    });

    let reasoning = body.get("thinking").and_then(|thinking| {
        if thinking.get("type").and_then(Value::as_str) != Some("enabled") {
            return None;
        }
        let budget = thinking.get("budget_tokens").and_then(Value::as_u64);
        Some(match budget {
            Some(b) if b < 2_048 => ReasoningEffort::Low,
            Some(b) if b >= 16_384 => ReasoningEffort::High,
            _ => ReasoningEffort::Medium,
        })
    });

    Ok(ChatRequest {
        model,
        system,
        messages,
        tools,
        tool_choice,
        temperature: body.get("temperature").and_then(Value::as_f64),
        max_tokens: body.get("max_tokens").and_then(Value::as_u64),
        reasoning,
        stream: body.get("stream").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn parse_anthropic_user(
    content: &Value,
    tool_names: &HashMap<String, String>,
    messages: &mut Vec<Message>,
) {
    if let Some(text) = content.as_str() {
        messages.push(Message::User(UserMessage {
            content: vec![ContentBlock::Text(TextContent { text: text.to_string() })],
        }));
        return;
    }
    let mut user_blocks = Vec::new();
    for block in content.as_array().map(Vec::as_slice).unwrap_or(&[]) {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    user_blocks.push(ContentBlock::Text(TextContent { text: text.to_string() }));
                }
            }
            Some("image") => {
                let source = block.get("source");
                let data = source
                    .and_then(|s| s.get("data"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let mime = source
                    .and_then(|s| s.get("media_type"))
                    .and_then(Value::as_str)
                    .unwrap_or("image/png");
                user_blocks.push(ContentBlock::Image(ImageContent {
                    data: data.to_string(),
                    mime_type: mime.to_string(),
                }));
            }
            Some("tool_result") => {
                let id = block
                    .get("tool_use_id")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let text = match block.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Array(parts)) => parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join("\n"),
                    _ => String::new(),
                };
                messages.push(Message::ToolResult(ToolResultMessage {
                    tool_name: tool_names.get(&id).cloned().unwrap_or_default(),
                    tool_call_id: id,
                    content: vec![ContentBlock::Text(TextContent { text })],
                    is_error: block
                        .get("is_error")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                }));
            }
            _ => {}
        }
    }
    if !user_blocks.is_empty() {
        messages.push(Message::User(UserMessage { content: user_blocks }));
    }
}

fn parse_anthropic_assistant(
    content: &Value,
    tool_names: &mut HashMap<String, String>,
) -> Vec<ContentBlock> {
    if let Some(text) = content.as_str() {
        return vec![ContentBlock::Text(TextContent { text: text.to_string() })];
    }
    let mut blocks = Vec::new();
    for block in content.as_array().map(Vec::as_slice).unwrap_or(&[]) {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    blocks.push(ContentBlock::Text(TextContent { text: text.to_string() }));
                }
            }
            Some("thinking") => {
                if let Some(thinking) = block.get("thinking").and_then(Value::as_str) {
                    blocks.push(ContentBlock::Thinking(ThinkingContent {
                        thinking: thinking.to_string(),
                    }));
                }
            }
            Some("tool_use") => {
                let id = block.get("id").and_then(Value::as_str).unwrap_or("").to_string();
                let name = block.get("name").and_then(Value::as_str).unwrap_or("").to_string();
                tool_names.insert(id.clone(), name.clone());
                blocks.push(ContentBlock::ToolCall(ToolCall {
                    id,
                    name,
                    arguments: block.get("input").cloned().unwrap_or(json!({})),
                }));
            }
            _ => {}
        }
    }
    blocks
}

// ---------------------------------------------------------------------------
// Normalized -> Anthropic dialect
// ---------------------------------------------------------------------------

pub fn anthropic_stop_reason(stop: StopReason) -> &'static str {
    match stop {
        StopReason::Stop | StopReason::Error | StopReason::Aborted => "end_turn",
        StopReason::Length => "max_tokens",
        StopReason::ToolUse => "tool_use",
    }
}

/// Render an assistant message as an Anthropic messages response.
pub fn anthropic_message_response(message: &AssistantMessage, wire_model: &str) -> Value {
    let mut blocks = Vec::new();
    for block in &message.content {
        match block {
            ContentBlock::Thinking(t) => {
                blocks.push(json!({"type": "thinking", "thinking": t.thinking}));
            }
            ContentBlock::Text(t) => {
                blocks.push(json!({"type": "text", "text": t.text}));
            }
            ContentBlock::ToolCall(tc) => {
                blocks.push(json!({
                    "type": "tool_use",
                    "id": tc.id,
                    "name": tc.name,
                    "input": tc.arguments,
                }));
            }
            ContentBlock::Image(_) => {}
        }
    }
    json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": wire_model,
        "content": blocks,
        "stop_reason": anthropic_stop_reason(message.stop_reason),
        "stop_sequence": null,
        "usage": message.usage.as_ref().map(|u| json!({
            "input_tokens": u.input_tokens,
            "output_tokens": u.output_tokens,
            "cache_read_input_tokens": u.cache_read_tokens,
            "cache_creation_input_tokens": u.cache_write_tokens,
        })),
    })
}

/// Render a gateway failure in the Anthropic error envelope.
pub fn anthropic_error_body(error: &GatewayError) -> Value {
    let kind = match error.http_status() {
        401 => "authentication_error",
        400 => "invalid_request_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        503 | 529 => "overloaded_error",
        _ => "api_error",
    };
    json!({
        "type": "error",
        "error": {"type": kind, "message": error.to_string()},
    })
}

// ---------------------------------------------------------------------------
// OpenAI dialect -> normalized
// ---------------------------------------------------------------------------

/// Parse an OpenAI chat completions request body into the normalized form.
pub fn chat_request_from_openai(body: &Value) -> Result<ChatRequest, GatewayError> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing model"))?
        .to_string();

    let mut system = None;
    let mut messages = Vec::new();
    for message in body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("missing messages"))?
    {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("");
        match role {
            "system" | "developer" => {
                system = message.get("content").and_then(Value::as_str).map(String::from);
            }
            "user" => {
                messages.push(Message::User(UserMessage {
                    content: parse_openai_user_content(message.get("content")),
                }));
            }
            "assistant" => {
                let mut blocks = Vec::new();
                if let Some(text) = message.get("content").and_then(Value::as_str) {
                    if !text.is_empty() {
                        blocks.push(ContentBlock::Text(TextContent { text: text.to_string() }));
                    }
                }
                for tc in message
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or(&[])
                {
                    let arguments = tc
                        .pointer("/function/arguments")
                        .and_then(Value::as_str)
                        .and_then(|raw| serde_json::from_str(raw).ok())
                        .unwrap_or(json!({}));
                    blocks.push(ContentBlock::ToolCall(ToolCall {
                        id: tc.get("id").and_then(Value::as_str).unwrap_or("").to_string(),
                        name: tc
                            .pointer("/function/name")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        arguments,
                    }));
                }
                messages.push(Message::Assistant(AssistantMessage {
                    content: blocks,
                    model: String::new(),
                    provider: String::new(),
                    usage: None,
                    stop_reason: StopReason::Stop,
                }));
            }
            "tool" => {
                let text = message
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                messages.push(Message::ToolResult(ToolResultMessage {
                    tool_call_id: message
                        .get("tool_call_id")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    tool_name: message
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    content: vec![ContentBlock::Text(TextContent { text })],
                    is_error: false,
                }));
            }
            _ => {}
        }
    }

    let tools = body
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|tool| {
                    let function = tool.get("function")?;
                    Some(ToolDef {
                        name: function.get("name")?.as_str()?.to_string(),
                        description: function
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        parameters: function.get("parameters").cloned().unwrap_or(json!({})),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let tool_choice = body.get("tool_choice").and_then(|choice| match choice {
        Value::String(s) => match s.as_str() {
            "auto" => Some(ToolChoice::Auto),
            "required" => Some(ToolChoice::Required),
            "none" => Some(ToolChoice::None),
            _ => None,
        },
        other => other
            .pointer("/function/name")
            .and_then(Value::as_str)
            .map(|name| ToolChoice::Tool(name.to_string())),
    });

    let reasoning = body
        .get("reasoning_effort")
        .and_then(Value::as_str)
        .and_then(|effort| match effort {
            "low" | "minimal" => Some(ReasoningEffort::Low),
            "medium" => Some(ReasoningEffort::Medium),
            "high" => Some(ReasoningEffort::High),
            _ => None,
        });

    Ok(ChatRequest {
        model,
        system,
        messages,
        tools,
        tool_choice,
        temperature: body.get("temperature").and_then(Value::as_f64),
        max_tokens: body
            .get("max_tokens")
            .or_else(|| body.get("max_completion_tokens"))
            .and_then(Value::as_u64),
        reasoning,
        stream: body.get("stream").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn parse_openai_user_content(content: Option<&Value>) -> Vec<ContentBlock> {
    match content {
        Some(Value::String(text)) => {
            vec![ContentBlock::Text(TextContent { text: text.clone() })]
        }
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part.get("type").and_then(Value::as_str) {
                Some("text") => part.get("text").and_then(Value::as_str).map(|text| {
                    ContentBlock::Text(TextContent { text: text.to_string() })
                }),
                Some("image_url") => {
                    let url = part.pointer("/image_url/url").and_then(Value::as_str)?;
                    let (mime, data) = parse_data_url(url)?;
                    Some(ContentBlock::Image(ImageContent { data, mime_type: mime }))
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (mime, data) = rest.split_once(";base64,")?;
    Some((mime.to_string(), data.to_string()))
}

// ---------------------------------------------------------------------------
// Normalized -> OpenAI dialect
// ---------------------------------------------------------------------------

pub fn openai_finish_reason(stop: StopReason) -> &'static str {
    match stop {
        StopReason::Stop | StopReason::Error | StopReason::Aborted => "stop",
        StopReason::Length => "length",
        StopReason::ToolUse => "tool_calls",
    }
}

/// Render an assistant message as an OpenAI chat completion response.
pub fn openai_chat_response(message: &AssistantMessage, wire_model: &str) -> Value {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for block in &message.content {
        match block {
            ContentBlock::Text(t) => text.push_str(&t.text),
            ContentBlock::Thinking(t) => reasoning.push_str(&t.thinking),
            ContentBlock::ToolCall(tc) => tool_calls.push(json!({
                "id": tc.id,
                "type": "function",
                "function": {"name": tc.name, "arguments": tc.arguments.to_string()},
            })),
            ContentBlock::Image(_) => {}
        }
    }
    let mut wire_message = json!({"role": "assistant"});
    wire_message["content"] = if text.is_empty() { Value::Null } else { json!(text) };
    if !reasoning.is_empty() {
        wire_message["reasoning_content"] = json!(reasoning);
    }
    if !tool_calls.is_empty() {
        wire_message["tool_calls"] = json!(tool_calls);
    }

    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": wire_model,
        "choices": [{
            "index": 0,
            "message": wire_message,
            "finish_reason": openai_finish_reason(message.stop_reason),
        }],
        "usage": message.usage.as_ref().map(|u| json!({
            "prompt_tokens": u.input_tokens,
            "completion_tokens": u.output_tokens,
            "total_tokens": u.total_tokens,
        })),
    })
}

/// Render a gateway failure in the OpenAI error envelope.
pub fn openai_error_body(error: &GatewayError) -> Value {
    json!({
        "error": {
            "message": error.to_string(),
            "type": match error.http_status() {
                401 => "authentication_error",
                429 => "rate_limit_error",
                400 => "invalid_request_error",
                404 => "not_found_error",
                _ => "api_error",
            },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anthropic_request() -> Value {
        json!({
            "model": "openai/gpt-4o",
            "max_tokens": 1024,
            "temperature": 0.5,
            "system": "be helpful",
            "tool_choice": {"type": "any"},
            "thinking": {"type": "enabled", "budget_tokens": 32000},
            "tools": [{
                "name": "get_weather",
                "description": "weather lookup",
                "input_schema": {"type": "object", "properties": {"city": {"type": "string"}}},
            }],
            "messages": [
                {"role": "user", "content": "what's the weather in Oslo?"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "checking"},
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather",
                     "input": {"city": "Oslo"}},
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "4C, rain"},
                ]},
            ],
        })
    }

    #[test]
    fn anthropic_request_parses_fully() {
        let request = chat_request_from_anthropic(&anthropic_request()).unwrap();
        assert_eq!(request.model, "openai/gpt-4o");
        assert_eq!(request.system.as_deref(), Some("be helpful"));
        assert_eq!(request.max_tokens, Some(1024));
        assert_eq!(request.tool_choice, Some(ToolChoice::Required));
        assert_eq!(request.reasoning, Some(ReasoningEffort::High));
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.tools[0].name, "get_weather");

        assert_eq!(request.messages.len(), 3);
        assert!(matches!(request.messages[0], Message::User(_)));
        let Message::Assistant(assistant) = &request.messages[1] else {
            panic!("expected assistant message");
        };
        assert!(matches!(assistant.content[1], ContentBlock::ToolCall(_)));
        let Message::ToolResult(result) = &request.messages[2] else {
            panic!("expected tool result");
        };
        // Tool name recovered from the preceding tool_use block.
        assert_eq!(result.tool_name, "get_weather");
        assert_eq!(result.tool_call_id, "toolu_1");
    }

    #[test]
    fn round_trip_preserves_common_fields() {
        // Anthropic -> normalized -> OpenAI wire -> normalized: the two
        // normalized forms must agree on the fields both dialects express.
        let original = chat_request_from_anthropic(&anthropic_request()).unwrap();

        let openai_wire = json!({
            "model": original.model,
            "temperature": original.temperature,
            "max_tokens": original.max_tokens,
            "tool_choice": "required",
            "messages": openai_wire_messages(&original),
            "tools": original.tools.iter().map(|t| json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                },
            })).collect::<Vec<_>>(),
        });
        let reparsed = chat_request_from_openai(&openai_wire).unwrap();

        assert_eq!(reparsed.model, original.model);
        assert_eq!(reparsed.temperature, original.temperature);
        assert_eq!(reparsed.max_tokens, original.max_tokens);
        assert_eq!(reparsed.tool_choice, original.tool_choice);
        assert_eq!(reparsed.tools, original.tools);
        assert_eq!(reparsed.messages, original.messages);
    }

    /// Encode normalized messages the way the OpenAI dialect carries them.
    fn openai_wire_messages(request: &ChatRequest) -> Vec<Value> {
        let mut wire = Vec::new();
        for message in &request.messages {
            match message {
                Message::User(user) => {
                    let text = user
                        .content
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text(t) => Some(t.text.as_str()),
                            _ => None,
                        })
                        .collect::<String>();
                    wire.push(json!({"role": "user", "content": text}));
                }
                Message::Assistant(assistant) => {
                    let mut text = String::new();
                    let mut tool_calls = Vec::new();
                    for block in &assistant.content {
                        match block {
                            ContentBlock::Text(t) => text.push_str(&t.text),
                            ContentBlock::ToolCall(tc) => tool_calls.push(json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments.to_string(),
                                },
                            })),
                            _ => {}
                        }
                    }
                    wire.push(json!({
                        "role": "assistant",
                        "content": text,
                        "tool_calls": tool_calls,
                    }));
                }
                Message::ToolResult(result) => {
                    let text = result
                        .content
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text(t) => Some(t.text.as_str()),
                            _ => None,
                        })
                        .collect::<String>();
                    wire.push(json!({
                        "role": "tool",
                        "tool_call_id": result.tool_call_id,
                        "name": result.tool_name,
                        "content": text,
                    }));
                }
            }
        }
        wire
    }

    #[test]
    fn openai_response_renders_tool_calls_and_reasoning() {
        let message = AssistantMessage {
            content: vec![
                ContentBlock::Thinking(ThinkingContent { thinking: "hmm".into() }),
                ContentBlock::ToolCall(ToolCall {
                    id: "call_1".into(),
                    name: "lookup".into(),
                    arguments: json!({"q": "x"}),
                }),
            ],
            model: "gpt-4o".into(),
            provider: "openai".into(),
            usage: Some(Usage { input_tokens: 7, output_tokens: 3, total_tokens: 10, ..Usage::default() }),
            stop_reason: StopReason::ToolUse,
        };
        let value = openai_chat_response(&message, "openai/gpt-4o");
        assert_eq!(value["model"], "openai/gpt-4o");
        assert_eq!(value["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(value["choices"][0]["message"]["reasoning_content"], "hmm");
        assert_eq!(
            value["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
            "lookup"
        );
        assert_eq!(value["usage"]["total_tokens"], 10);
    }

    #[test]
    fn anthropic_response_maps_stop_reasons() {
        let message = AssistantMessage {
            content: vec![ContentBlock::Text(TextContent { text: "hi".into() })],
            model: "gpt-4o".into(),
            provider: "openai".into(),
            usage: None,
            stop_reason: StopReason::Length,
        };
        let value = anthropic_message_response(&message, "openai/gpt-4o");
        assert_eq!(value["stop_reason"], "max_tokens");
        assert_eq!(value["content"][0]["text"], "hi");
        assert_eq!(value["role"], "assistant");
    }

    #[test]
    fn thinking_budget_maps_to_effort() {
        let mut body = anthropic_request();
        body["thinking"] = json!({"type": "enabled", "budget_tokens": 1000});
        let request = chat_request_from_anthropic(&body).unwrap();
        assert_eq!(request.reasoning, Some(ReasoningEffort::Low));

        body["thinking"] = json!({"type": "enabled"});
        let request = chat_request_from_anthropic(&body).unwrap();
        assert_eq!(request.reasoning, Some(ReasoningEffort::Medium));

        body["thinking"] = json!({"type": "disabled"});
        let request = chat_request_from_anthropic(&body).unwrap();
        assert_eq!(request.reasoning, None);
    }

    #[test]
    fn error_envelopes_match_dialect() {
        let err = GatewayError::Auth { detail: "bad key".into() };
        assert_eq!(openai_error_body(&err)["error"]["type"], "authentication_error");
        assert_eq!(anthropic_error_body(&err)["error"]["type"], "authentication_error");
        let err = GatewayError::NoKeyAvailable { detail: "cooling".into(), next_reset_ms: None };
        assert_eq!(anthropic_error_body(&err)["error"]["type"], "overloaded_error");
    }
}
