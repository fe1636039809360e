use bytes::Bytes;
use serde_json::{json, Value};

use super::response::{map_stop_reason, random_id, translate_usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockType {
    None,
    Text,
    Thinking,
}

// Incremental Cloud Code SSE -> Anthropic SSE translation. One instance per
// stream; chunks are fed in arrival order and events come back ready to
// write to the client.
pub struct StreamingState {
    model: String,
    block_type: BlockType,
    block_index: usize,
    message_start_sent: bool,
    message_stop_sent: bool,
    has_tool_call: bool,
    finish_reason: Option<String>,
    usage: Option<Value>,
}

impl StreamingState {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            block_type: BlockType::None,
            block_index: 0,
            message_start_sent: false,
            message_stop_sent: false,
            has_tool_call: false,
            finish_reason: None,
            usage: None,
        }
    }

    pub fn emit(event_type: &str, data: Value) -> Bytes {
        let sse = format!(
            "event: {}\ndata: {}\n\n",
            event_type,
            serde_json::to_string(&data).unwrap_or_default()
        );
        Bytes::from(sse)
    }

    fn emit_message_start(&mut self, raw: &Value, out: &mut Vec<Bytes>) {
        if self.message_start_sent {
            return;
        }
        self.message_start_sent = true;
        let id = raw
            .get("responseId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| random_id("msg"));
        out.push(Self::emit(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "usage": translate_usage(raw.get("usageMetadata")),
                }
            }),
        ));
    }

    fn close_block(&mut self, out: &mut Vec<Bytes>) {
        if self.block_type != BlockType::None {
            out.push(Self::emit(
                "content_block_stop",
                json!({ "type": "content_block_stop", "index": self.block_index }),
            ));
            self.block_index += 1;
            self.block_type = BlockType::None;
        }
    }

    fn ensure_block(&mut self, wanted: BlockType, out: &mut Vec<Bytes>) {
        if self.block_type == wanted {
            return;
        }
        self.close_block(out);
        let content_block = match wanted {
            BlockType::Text => json!({ "type": "text", "text": "" }),
            BlockType::Thinking => json!({ "type": "thinking", "thinking": "" }),
            BlockType::None => return,
        };
        out.push(Self::emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block,
            }),
        ));
        self.block_type = wanted;
    }

    // Translate one upstream SSE payload into zero or more client events.
    pub fn process_chunk(&mut self, chunk: &Value) -> Vec<Bytes> {
        let raw = chunk.get("response").unwrap_or(chunk);
        let mut out = Vec::new();
        self.emit_message_start(raw, &mut out);

        if let Some(meta) = raw.get("usageMetadata") {
            self.usage = Some(meta.clone());
        }
        let candidate = raw
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first());
        if let Some(reason) = candidate
            .and_then(|c| c.get("finishReason"))
            .and_then(|v| v.as_str())
        {
            self.finish_reason = Some(reason.to_string());
        }

        let parts = candidate
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array());
        let Some(parts) = parts else {
            return out;
        };

        for part in parts {
            if let Some(call) = part.get("functionCall") {
                self.close_block(&mut out);
                self.has_tool_call = true;
                out.push(Self::emit(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": self.block_index,
                        "content_block": {
                            "type": "tool_use",
                            "id": random_id("toolu"),
                            "name": call.get("name").and_then(|v| v.as_str()).unwrap_or(""),
                            "input": {},
                        }
                    }),
                ));
                let args = call.get("args").cloned().unwrap_or(json!({}));
                out.push(Self::emit(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": {
                            "type": "input_json_delta",
                            "partial_json": serde_json::to_string(&args).unwrap_or_default(),
                        }
                    }),
                ));
                out.push(Self::emit(
                    "content_block_stop",
                    json!({ "type": "content_block_stop", "index": self.block_index }),
                ));
                self.block_index += 1;
            } else if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                let is_thought = part.get("thought").and_then(|v| v.as_bool()).unwrap_or(false);
                if is_thought {
                    self.ensure_block(BlockType::Thinking, &mut out);
                    out.push(Self::emit(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": self.block_index,
                            "delta": { "type": "thinking_delta", "thinking": text },
                        }),
                    ));
                } else {
                    self.ensure_block(BlockType::Text, &mut out);
                    out.push(Self::emit(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": self.block_index,
                            "delta": { "type": "text_delta", "text": text },
                        }),
                    ));
                }
            }
        }
        out
    }

    pub fn has_emitted_content(&self) -> bool {
        self.block_index > 0 || self.block_type != BlockType::None
    }

    // Close any open block and emit the terminal message_delta/message_stop
    // pair. Idempotent: a finished stream stays finished.
    pub fn finish(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        if self.message_stop_sent {
            return out;
        }
        if !self.message_start_sent {
            self.emit_message_start(&json!({}), &mut out);
        }
        self.close_block(&mut out);

        let stop_reason = map_stop_reason(
            self.finish_reason.as_deref().unwrap_or("STOP"),
            self.has_tool_call,
        );
        let output_tokens = self
            .usage
            .as_ref()
            .and_then(|u| u.get("candidatesTokenCount"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        out.push(Self::emit(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": stop_reason, "stop_sequence": null },
                "usage": { "output_tokens": output_tokens },
            }),
        ));
        out.push(Self::emit(
            "message_stop",
            json!({ "type": "message_stop" }),
        ));
        self.message_stop_sent = true;
        out
    }
}

pub const EMPTY_RESPONSE_RECOVERY_TEXT: &str =
    "[No response after retries - please try again]";

// Emitted when every empty-response retry came back blank: a minimal, fully
// formed Anthropic stream so the client terminates cleanly.
pub fn synthetic_recovery_stream(model: &str) -> Vec<Bytes> {
    vec![
        StreamingState::emit(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": random_id("msg"),
                    "type": "message",
                    "role": "assistant",
                    "model": model,
                    "content": [],
                    "stop_reason": null,
                    "usage": { "input_tokens": 0, "output_tokens": 0 },
                }
            }),
        ),
        StreamingState::emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": { "type": "text", "text": "" },
            }),
        ),
        StreamingState::emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "text_delta", "text": EMPTY_RESPONSE_RECOVERY_TEXT },
            }),
        ),
        StreamingState::emit(
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": 0 }),
        ),
        StreamingState::emit(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": "end_turn", "stop_sequence": null },
                "usage": { "output_tokens": 0 },
            }),
        ),
        StreamingState::emit("message_stop", json!({ "type": "message_stop" })),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_types(events: &[Bytes]) -> Vec<String> {
        events
            .iter()
            .map(|b| {
                let text = String::from_utf8_lossy(b);
                text.lines()
                    .next()
                    .unwrap()
                    .trim_start_matches("event: ")
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn text_stream_produces_canonical_event_order() {
        let mut state = StreamingState::new("claude-sonnet-4-5");
        let mut events = state.process_chunk(&json!({
            "response": {
                "responseId": "resp-1",
                "candidates": [{ "content": { "parts": [{ "text": "Hel" }] } }]
            }
        }));
        events.extend(state.process_chunk(&json!({
            "response": {
                "candidates": [{ "content": { "parts": [{ "text": "lo" }] }, "finishReason": "STOP" }],
                "usageMetadata": { "candidatesTokenCount": 2 }
            }
        })));
        events.extend(state.finish());

        assert_eq!(
            event_types(&events),
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
        let last_delta = String::from_utf8_lossy(&events[5]);
        assert!(last_delta.contains(r#""stop_reason":"end_turn""#));
        assert!(last_delta.contains(r#""output_tokens":2"#));
    }

    #[test]
    fn thinking_then_text_switches_blocks() {
        let mut state = StreamingState::new("m");
        let events = state.process_chunk(&json!({
            "candidates": [{ "content": { "parts": [
                { "text": "hmm", "thought": true },
                { "text": "answer" }
            ]}}]
        }));

        let types = event_types(&events);
        assert_eq!(
            types,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
            ]
        );
        let thinking_start = String::from_utf8_lossy(&events[1]);
        assert!(thinking_start.contains(r#""type":"thinking""#));
    }

    #[test]
    fn function_call_emits_complete_tool_block() {
        let mut state = StreamingState::new("m");
        let events = state.process_chunk(&json!({
            "candidates": [{ "content": { "parts": [
                { "functionCall": { "name": "lookup", "args": { "q": "x" } } }
            ]}, "finishReason": "STOP" }]
        }));
        let final_events = event_types(&state.finish());

        let types = event_types(&events);
        assert!(types.contains(&"content_block_start".to_string()));
        assert!(types.contains(&"content_block_stop".to_string()));
        // tool_use wins the stop reason
        assert_eq!(final_events, vec!["message_delta", "message_stop"]);
    }

    #[test]
    fn synthetic_stream_is_six_events_ending_in_message_stop() {
        let events = synthetic_recovery_stream("m");
        assert_eq!(
            event_types(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        let delta = String::from_utf8_lossy(&events[2]);
        assert!(delta.contains(EMPTY_RESPONSE_RECOVERY_TEXT));
        let start = String::from_utf8_lossy(&events[0]);
        // msg_ followed by 32 hex chars
        let id_start = start.find("\"id\":\"msg_").unwrap() + 10;
        let id = &start[id_start..id_start + 32];
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn finish_is_idempotent() {
        let mut state = StreamingState::new("m");
        state.process_chunk(&json!({
            "candidates": [{ "content": { "parts": [{ "text": "x" }] } }]
        }));
        assert!(!state.finish().is_empty());
        assert!(state.finish().is_empty());
    }
}
