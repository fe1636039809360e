use serde_json::{json, Value};

// Cloud Code JSON -> Anthropic message translation. The upstream wraps the
// Gemini-shaped payload in a `response` field; both shapes are accepted.

pub fn random_id(prefix: &str) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let hex: String = (0..32)
        .map(|_| {
            let chars = b"0123456789abcdef";
            chars[rng.gen_range(0..chars.len())] as char
        })
        .collect();
    format!("{}_{}", prefix, hex)
}

pub fn translate_response(upstream: &Value, requested_model: &str) -> Value {
    let raw = upstream.get("response").unwrap_or(upstream);
    let candidate = raw
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first());

    let mut content = Vec::new();
    let mut has_tool_call = false;

    if let Some(parts) = candidate
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
    {
        for part in parts {
            if let Some(call) = part.get("functionCall") {
                has_tool_call = true;
                content.push(json!({
                    "type": "tool_use",
                    "id": random_id("toolu"),
                    "name": call.get("name").and_then(|v| v.as_str()).unwrap_or(""),
                    "input": call.get("args").cloned().unwrap_or(json!({})),
                }));
            } else if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                let is_thought = part.get("thought").and_then(|v| v.as_bool()).unwrap_or(false);
                if is_thought {
                    let mut block = json!({ "type": "thinking", "thinking": text });
                    if let Some(sig) = part.get("thoughtSignature").and_then(|v| v.as_str()) {
                        block["signature"] = json!(sig);
                    }
                    content.push(block);
                } else {
                    content.push(json!({ "type": "text", "text": text }));
                }
            }
        }
    }

    let finish_reason = candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(|v| v.as_str())
        .unwrap_or("STOP");
    let stop_reason = map_stop_reason(finish_reason, has_tool_call);

    let id = raw
        .get("responseId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| random_id("msg"));

    json!({
        "id": id,
        "type": "message",
        "role": "assistant",
        "model": requested_model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": translate_usage(raw.get("usageMetadata")),
    })
}

pub fn map_stop_reason(finish_reason: &str, has_tool_call: bool) -> &'static str {
    if has_tool_call {
        return "tool_use";
    }
    match finish_reason {
        "MAX_TOKENS" => "max_tokens",
        "STOP" | "FINISH_REASON_UNSPECIFIED" | "" => "end_turn",
        _ => "end_turn",
    }
}

pub fn translate_usage(usage: Option<&Value>) -> Value {
    let input = usage
        .and_then(|u| u.get("promptTokenCount"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output = usage
        .and_then(|u| u.get("candidatesTokenCount"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    json!({ "input_tokens": input, "output_tokens": output })
}

pub fn prompt_token_count(upstream: &Value) -> Option<u64> {
    let raw = upstream.get("response").unwrap_or(upstream);
    raw.get("usageMetadata")
        .and_then(|u| u.get("promptTokenCount"))
        .and_then(|v| v.as_u64())
}

// Merge a sequence of Cloud Code SSE payloads into one response value, used
// to serve thinking models to non-streaming clients. Text and thought runs
// concatenate; function calls and the final usage/finish metadata carry over.
pub fn merge_sse_chunks(chunks: &[Value]) -> Value {
    let mut text = String::new();
    let mut thinking = String::new();
    let mut thought_signature: Option<String> = None;
    let mut function_calls = Vec::new();
    let mut finish_reason = Value::Null;
    let mut usage = Value::Null;
    let mut response_id = Value::Null;

    for chunk in chunks {
        let raw = chunk.get("response").unwrap_or(chunk);
        if let Some(id) = raw.get("responseId") {
            response_id = id.clone();
        }
        if let Some(meta) = raw.get("usageMetadata") {
            usage = meta.clone();
        }
        let candidate = raw
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first());
        if let Some(reason) = candidate.and_then(|c| c.get("finishReason")) {
            if !reason.is_null() {
                finish_reason = reason.clone();
            }
        }
        let Some(parts) = candidate
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
        else {
            continue;
        };
        for part in parts {
            if let Some(call) = part.get("functionCall") {
                function_calls.push(json!({ "functionCall": call.clone() }));
            } else if let Some(t) = part.get("text").and_then(|v| v.as_str()) {
                if part.get("thought").and_then(|v| v.as_bool()).unwrap_or(false) {
                    thinking.push_str(t);
                    if let Some(sig) = part.get("thoughtSignature").and_then(|v| v.as_str()) {
                        thought_signature = Some(sig.to_string());
                    }
                } else {
                    text.push_str(t);
                }
            }
        }
    }

    let mut parts = Vec::new();
    if !thinking.is_empty() {
        let mut part = json!({ "text": thinking, "thought": true });
        if let Some(sig) = thought_signature {
            part["thoughtSignature"] = json!(sig);
        }
        parts.push(part);
    }
    if !text.is_empty() {
        parts.push(json!({ "text": text }));
    }
    parts.extend(function_calls);

    json!({
        "responseId": response_id,
        "candidates": [{
            "content": { "role": "model", "parts": parts },
            "finishReason": if finish_reason.is_null() { json!("STOP") } else { finish_reason },
        }],
        "usageMetadata": usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_text_response_with_usage() {
        let upstream = json!({
            "response": {
                "responseId": "resp-1",
                "candidates": [{
                    "content": { "role": "model", "parts": [{ "text": "hello there" }] },
                    "finishReason": "STOP"
                }],
                "usageMetadata": { "promptTokenCount": 12, "candidatesTokenCount": 3 }
            }
        });
        let message = translate_response(&upstream, "claude-sonnet-4-5");

        assert_eq!(message["id"], "resp-1");
        assert_eq!(message["model"], "claude-sonnet-4-5");
        assert_eq!(message["content"][0]["type"], "text");
        assert_eq!(message["content"][0]["text"], "hello there");
        assert_eq!(message["stop_reason"], "end_turn");
        assert_eq!(message["usage"]["input_tokens"], 12);
        assert_eq!(message["usage"]["output_tokens"], 3);
    }

    #[test]
    fn function_call_maps_to_tool_use_stop_reason() {
        let upstream = json!({
            "candidates": [{
                "content": { "parts": [
                    { "functionCall": { "name": "get_weather", "args": { "city": "Oslo" } } }
                ]},
                "finishReason": "STOP"
            }]
        });
        let message = translate_response(&upstream, "m");

        assert_eq!(message["stop_reason"], "tool_use");
        assert_eq!(message["content"][0]["type"], "tool_use");
        assert_eq!(message["content"][0]["name"], "get_weather");
        assert_eq!(message["content"][0]["input"]["city"], "Oslo");
    }

    #[test]
    fn thought_parts_become_thinking_blocks() {
        let upstream = json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "working it out", "thought": true, "thoughtSignature": "sig-1" },
                    { "text": "the answer" }
                ]},
                "finishReason": "MAX_TOKENS"
            }]
        });
        let message = translate_response(&upstream, "m");

        assert_eq!(message["content"][0]["type"], "thinking");
        assert_eq!(message["content"][0]["signature"], "sig-1");
        assert_eq!(message["content"][1]["type"], "text");
        assert_eq!(message["stop_reason"], "max_tokens");
    }

    #[test]
    fn merge_concatenates_streamed_text() {
        let chunks = vec![
            json!({ "response": { "candidates": [{ "content": { "parts": [{ "text": "Hel" }] } }] } }),
            json!({ "response": { "candidates": [{ "content": { "parts": [{ "text": "lo" }] }, "finishReason": "STOP" }],
                     "usageMetadata": { "promptTokenCount": 4, "candidatesTokenCount": 2 } } }),
        ];
        let merged = merge_sse_chunks(&chunks);
        let message = translate_response(&merged, "m");

        assert_eq!(message["content"][0]["text"], "Hello");
        assert_eq!(message["usage"]["output_tokens"], 2);
    }

    #[test]
    fn empty_candidates_yield_empty_content() {
        let message = translate_response(&json!({}), "m");
        assert!(message["content"].as_array().unwrap().is_empty());
        assert!(message["id"].as_str().unwrap().starts_with("msg_"));
    }
}
