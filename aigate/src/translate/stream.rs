//! Streaming dialect conversion: normalized stream events out of the
//! dispatcher become either Anthropic event-stream frames or OpenAI delta
//! chunks.

use crate::types::{StreamEvent, Usage};
use serde_json::{json, Value};
use std::collections::HashMap;

/// One outgoing SSE frame: `event:` name plus `data:` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct WireEvent {
    pub event: &'static str,
    pub data: Value,
}

fn wire(event: &'static str, data: Value) -> WireEvent {
    WireEvent { event, data }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OpenBlock {
    Thinking(usize),
    Text(usize),
    /// (anthropic block index, upstream tool index)
    Tool(usize, usize),
}

impl OpenBlock {
    fn index(self) -> usize {
        match self {
            OpenBlock::Thinking(i) | OpenBlock::Text(i) | OpenBlock::Tool(i, _) => i,
        }
    }
}

/// Stateful converter producing the Anthropic event sequence
/// `message_start, (content_block_start, content_block_delta*,
/// content_block_stop)*, message_delta, message_stop` with accurate block
/// indices and tool arguments aggregated across chunks.
pub struct AnthropicEventEncoder {
    wire_model: String,
    message_id: String,
    next_block: usize,
    open: Option<OpenBlock>,
    tool_blocks: HashMap<usize, usize>,
}

impl AnthropicEventEncoder {
    pub fn new(wire_model: &str) -> Self {
        Self {
            wire_model: wire_model.to_string(),
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            next_block: 0,
            open: None,
            tool_blocks: HashMap::new(),
        }
    }

    pub fn encode(&mut self, event: &StreamEvent) -> Vec<WireEvent> {
        match event {
            StreamEvent::Start => vec![wire(
                "message_start",
                json!({
                    "type": "message_start",
                    "message": {
                        "id": self.message_id,
                        "type": "message",
                        "role": "assistant",
                        "model": self.wire_model,
                        "content": [],
                        "stop_reason": null,
                        "stop_sequence": null,
                        "usage": {"input_tokens": 0, "output_tokens": 0},
                    },
                }),
            )],
            StreamEvent::ThinkingDelta(delta) => {
                let mut events = Vec::new();
                let index = match self.open {
                    Some(OpenBlock::Thinking(i)) => i,
                    _ => {
                        events.extend(self.close_open());
                        let i = self.open_block(
                            OpenBlock::Thinking(self.next_block),
                            json!({"type": "thinking", "thinking": ""}),
                            &mut events,
                        );
                        i
                    }
                };
                events.push(wire(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "thinking_delta", "thinking": delta},
                    }),
                ));
                events
            }
            StreamEvent::TextDelta(delta) => {
                let mut events = Vec::new();
                let index = match self.open {
                    Some(OpenBlock::Text(i)) => i,
                    _ => {
                        events.extend(self.close_open());
                        self.open_block(
                            OpenBlock::Text(self.next_block),
                            json!({"type": "text", "text": ""}),
                            &mut events,
                        )
                    }
                };
                events.push(wire(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "text_delta", "text": delta},
                    }),
                ));
                events
            }
            StreamEvent::ToolCallStart { index: upstream, id, name } => {
                let mut events = self.close_open();
                let block = self.open_block(
                    OpenBlock::Tool(self.next_block, *upstream),
                    json!({"type": "tool_use", "id": id, "name": name, "input": {}}),
                    &mut events,
                );
                self.tool_blocks.insert(*upstream, block);
                events
            }
            StreamEvent::ToolCallDelta { index: upstream, delta } => {
                let Some(block) = self.tool_blocks.get(upstream).copied() else {
                    return Vec::new();
                };
                vec![wire(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": block,
                        "delta": {"type": "input_json_delta", "partial_json": delta},
                    }),
                )]
            }
            StreamEvent::ToolCallEnd { index: upstream, .. } => {
                match self.open {
                    Some(OpenBlock::Tool(_, open_upstream)) if open_upstream == *upstream => {
                        self.close_open()
                    }
                    // Already closed when the next block opened.
                    _ => Vec::new(),
                }
            }
            StreamEvent::Done { message } => {
                let mut events = self.close_open();
                let usage = message.usage.clone().unwrap_or_default();
                events.push(wire(
                    "message_delta",
                    json!({
                        "type": "message_delta",
                        "delta": {
                            "stop_reason": super::anthropic_stop_reason(message.stop_reason),
                            "stop_sequence": null,
                        },
                        "usage": {"output_tokens": usage.output_tokens},
                    }),
                ));
                events.push(wire("message_stop", json!({"type": "message_stop"})));
                events
            }
        }
    }

    fn open_block(
        &mut self,
        block: OpenBlock,
        content: Value,
        events: &mut Vec<WireEvent>,
    ) -> usize {
        let index = self.next_block;
        self.next_block += 1;
        self.open = Some(block);
        events.push(wire(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": content,
            }),
        ));
        index
    }

    fn close_open(&mut self) -> Vec<WireEvent> {
        match self.open.take() {
            Some(block) => vec![wire(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": block.index()}),
            )],
            None => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// OpenAI chunk encoding
// ---------------------------------------------------------------------------

/// Encode one normalized stream event as an OpenAI `chat.completion.chunk`.
/// Returns `None` for events the OpenAI stream shape does not carry.
pub fn openai_stream_chunk(event: &StreamEvent, wire_model: &str, id: &str) -> Option<Value> {
    let chunk = |delta: Value, finish: Option<&str>, usage: Option<&Usage>| {
        json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": chrono::Utc::now().timestamp(),
            "model": wire_model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish,
            }],
            "usage": usage.map(|u| json!({
                "prompt_tokens": u.input_tokens,
                "completion_tokens": u.output_tokens,
                "total_tokens": u.total_tokens,
            })),
        })
    };
    match event {
        StreamEvent::Start => Some(chunk(json!({"role": "assistant"}), None, None)),
        StreamEvent::TextDelta(text) => Some(chunk(json!({"content": text}), None, None)),
        StreamEvent::ThinkingDelta(thinking) => {
            Some(chunk(json!({"reasoning_content": thinking}), None, None))
        }
        StreamEvent::ToolCallStart { index, id: call_id, name } => Some(chunk(
            json!({
                "tool_calls": [{
                    "index": index,
                    "id": call_id,
                    "type": "function",
                    "function": {"name": name, "arguments": ""},
                }]
            }),
            None,
            None,
        )),
        StreamEvent::ToolCallDelta { index, delta } => Some(chunk(
            json!({
                "tool_calls": [{
                    "index": index,
                    "function": {"arguments": delta},
                }]
            }),
            None,
            None,
        )),
        StreamEvent::ToolCallEnd { .. } => None,
        StreamEvent::Done { message } => Some(chunk(
            json!({}),
            Some(super::openai_finish_reason(message.stop_reason)),
            message.usage.as_ref(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    fn done_event() -> StreamEvent {
        StreamEvent::Done {
            message: AssistantMessage {
                content: Vec::new(),
                model: "gpt-4o".into(),
                provider: "openai".into(),
                usage: Some(Usage { output_tokens: 12, ..Usage::default() }),
                stop_reason: StopReason::Stop,
            },
        }
    }

    fn encode_all(events: &[StreamEvent]) -> Vec<WireEvent> {
        let mut encoder = AnthropicEventEncoder::new("openai/gpt-4o");
        events.iter().flat_map(|e| encoder.encode(e)).collect()
    }

    #[test]
    fn text_stream_produces_canonical_sequence() {
        let out = encode_all(&[
            StreamEvent::Start,
            StreamEvent::TextDelta("hel".into()),
            StreamEvent::TextDelta("lo".into()),
            done_event(),
        ]);
        let names: Vec<&str> = out.iter().map(|e| e.event).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert_eq!(out[1].data["content_block"]["type"], "text");
        assert_eq!(out[2].data["delta"]["text"], "hel");
        assert_eq!(out[5].data["delta"]["stop_reason"], "end_turn");
        assert_eq!(out[5].data["usage"]["output_tokens"], 12);
    }

    #[test]
    fn thinking_then_text_uses_distinct_indices() {
        let out = encode_all(&[
            StreamEvent::Start,
            StreamEvent::ThinkingDelta("mm".into()),
            StreamEvent::TextDelta("hi".into()),
            done_event(),
        ]);
        let starts: Vec<(&str, u64)> = out
            .iter()
            .filter(|e| e.event == "content_block_start")
            .map(|e| {
                (
                    e.data["content_block"]["type"].as_str().unwrap(),
                    e.data["index"].as_u64().unwrap(),
                )
            })
            .collect();
        assert_eq!(starts, vec![("thinking", 0), ("text", 1)]);
    }

    #[test]
    fn tool_arguments_aggregate_across_chunks() {
        let tool_call = ToolCall {
            id: "call_1".into(),
            name: "lookup".into(),
            arguments: serde_json::json!({"q": "oslo"}),
        };
        let out = encode_all(&[
            StreamEvent::Start,
            StreamEvent::TextDelta("checking".into()),
            StreamEvent::ToolCallStart { index: 0, id: "call_1".into(), name: "lookup".into() },
            StreamEvent::ToolCallDelta { index: 0, delta: "{\"q\":".into() },
            StreamEvent::ToolCallDelta { index: 0, delta: "\"oslo\"}".into() },
            StreamEvent::ToolCallEnd { index: 0, tool_call },
            done_event(),
        ]);

        // The text block closes before the tool block opens.
        let tool_start = out
            .iter()
            .position(|e| {
                e.event == "content_block_start"
                    && e.data["content_block"]["type"] == "tool_use"
            })
            .unwrap();
        assert_eq!(out[tool_start - 1].event, "content_block_stop");
        assert_eq!(out[tool_start].data["index"], 1);
        assert_eq!(out[tool_start].data["content_block"]["name"], "lookup");

        let partials: String = out
            .iter()
            .filter(|e| e.data["delta"]["type"] == "input_json_delta")
            .map(|e| e.data["delta"]["partial_json"].as_str().unwrap())
            .collect();
        assert_eq!(partials, "{\"q\":\"oslo\"}");

        // Every opened block is closed before message_delta.
        let stops = out.iter().filter(|e| e.event == "content_block_stop").count();
        assert_eq!(stops, 2);
        assert_eq!(out.last().unwrap().event, "message_stop");
    }

    #[test]
    fn openai_chunks_carry_deltas_and_finish() {
        let start = openai_stream_chunk(&StreamEvent::Start, "openai/gpt-4o", "chatcmpl-1").unwrap();
        assert_eq!(start["choices"][0]["delta"]["role"], "assistant");

        let delta = openai_stream_chunk(
            &StreamEvent::TextDelta("hey".into()),
            "openai/gpt-4o",
            "chatcmpl-1",
        )
        .unwrap();
        assert_eq!(delta["choices"][0]["delta"]["content"], "hey");

        let done = openai_stream_chunk(&done_event(), "openai/gpt-4o", "chatcmpl-1").unwrap();
        assert_eq!(done["choices"][0]["finish_reason"], "stop");
        assert_eq!(done["usage"]["completion_tokens"], 12);
    }
}
