use serde_json::{json, Map, Value};

use super::models::{ClaudeRequest, ContentBlock, Message, MessageContent};

// Anthropic -> Cloud Code request translation. The upstream takes a Gemini
// `request` payload wrapped in a project envelope.

pub fn build_cloud_code_request(request: &ClaudeRequest, model: &str, project: &str) -> Value {
    let mut inner = json!({
        "contents": build_contents(&request.messages),
    });

    if let Some(system) = &request.system {
        let text = system.as_text();
        if !text.is_empty() {
            inner["systemInstruction"] = json!({
                "role": "user",
                "parts": [{ "text": text }]
            });
        }
    }

    let generation_config = build_generation_config(request);
    if !generation_config.as_object().map(Map::is_empty).unwrap_or(true) {
        inner["generationConfig"] = generation_config;
    }

    if let Some(tools) = build_tools(request) {
        inner["tools"] = tools;
        if let Some(tool_config) = build_tool_config(request) {
            inner["toolConfig"] = tool_config;
        }
    }

    json!({
        "project": project,
        "model": model,
        "request": inner,
    })
}

fn build_tool_config(request: &ClaudeRequest) -> Option<Value> {
    let choice = request.tool_choice.as_ref()?;
    let mode = match choice.get("type").and_then(|v| v.as_str())? {
        "any" | "tool" => "ANY",
        "none" => "NONE",
        _ => "AUTO",
    };
    let mut config = json!({ "functionCallingConfig": { "mode": mode } });
    if let Some(name) = choice.get("name").and_then(|v| v.as_str()) {
        config["functionCallingConfig"]["allowedFunctionNames"] = json!([name]);
    }
    Some(config)
}

fn build_contents(messages: &[Message]) -> Value {
    let mut contents = Vec::new();
    for message in messages {
        let role = if message.role == "assistant" {
            "model"
        } else {
            "user"
        };
        let parts = build_parts(&message.content);
        if parts.is_empty() {
            continue;
        }
        contents.push(json!({ "role": role, "parts": parts }));
    }
    Value::Array(contents)
}

fn build_parts(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::String(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![json!({ "text": text })]
            }
        }
        MessageContent::Array(blocks) => blocks.iter().filter_map(block_to_part).collect(),
    }
}

fn block_to_part(block: &ContentBlock) -> Option<Value> {
    match block {
        ContentBlock::Text { text } => Some(json!({ "text": text })),
        ContentBlock::Image { source } | ContentBlock::Document { source } => {
            let mime = source.get("media_type").and_then(|v| v.as_str())?;
            let data = source.get("data").and_then(|v| v.as_str())?;
            Some(json!({ "inlineData": { "mimeType": mime, "data": data } }))
        }
        ContentBlock::ToolUse { name, input, .. } => Some(json!({
            "functionCall": { "name": name, "args": input }
        })),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let result = tool_result_text(content);
            let mut response = json!({ "result": result });
            if is_error.unwrap_or(false) {
                response["isError"] = json!(true);
            }
            Some(json!({
                "functionResponse": { "name": tool_use_id, "response": response }
            }))
        }
        // Thinking traces belong to the producing model; replaying them
        // upstream corrupts signature verification.
        ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => None,
    }
}

fn tool_result_text(content: &Option<Value>) -> String {
    match content {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
    }
}

fn build_generation_config(request: &ClaudeRequest) -> Value {
    let mut config = Map::new();
    if let Some(max_tokens) = request.max_tokens {
        config.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        config.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        config.insert("topP".to_string(), json!(top_p));
    }
    if let Some(stops) = &request.stop_sequences {
        if !stops.is_empty() {
            config.insert("stopSequences".to_string(), json!(stops));
        }
    }
    if request.is_thinking_model() {
        let budget = request
            .thinking
            .as_ref()
            .and_then(|t| t.budget_tokens)
            .unwrap_or(8_192);
        config.insert(
            "thinkingConfig".to_string(),
            json!({ "includeThoughts": true, "thinkingBudget": budget }),
        );
    }
    Value::Object(config)
}

fn build_tools(request: &ClaudeRequest) -> Option<Value> {
    let tools = request.tools.as_ref()?;
    if tools.is_empty() {
        return None;
    }
    let declarations: Vec<Value> = tools
        .iter()
        .map(|tool| {
            let mut schema = tool.input_schema.clone();
            sanitize_schema(&mut schema);
            json!({
                "name": tool.name,
                "description": tool.description.clone().unwrap_or_default(),
                "parameters": schema,
            })
        })
        .collect();
    Some(json!([{ "functionDeclarations": declarations }]))
}

// Strip JSON-Schema keywords the Gemini function-calling validator rejects.
fn sanitize_schema(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            map.remove("$schema");
            map.remove("additionalProperties");
            for value in map.values_mut() {
                sanitize_schema(value);
            }
        }
        Value::Array(items) => {
            for item in items {
                sanitize_schema(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_from(body: &str) -> ClaudeRequest {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn wraps_payload_in_project_envelope() {
        let request = request_from(
            r#"{"model":"claude-sonnet-4-5","messages":[{"role":"user","content":"hello"}]}"#,
        );
        let body = build_cloud_code_request(&request, "gemini-3-pro", "my-project");

        assert_eq!(body["project"], "my-project");
        assert_eq!(body["model"], "gemini-3-pro");
        assert_eq!(body["request"]["contents"][0]["role"], "user");
        assert_eq!(body["request"]["contents"][0]["parts"][0]["text"], "hello");
    }

    #[test]
    fn assistant_role_becomes_model_and_tools_map_to_function_calls() {
        let request = request_from(
            r#"{"model":"m","messages":[
                {"role":"assistant","content":[{"type":"tool_use","id":"tu_1","name":"get_weather","input":{"city":"Tokyo"}}]},
                {"role":"user","content":[{"type":"tool_result","tool_use_id":"tu_1","content":"sunny"}]}
            ]}"#,
        );
        let body = build_cloud_code_request(&request, "m", "p");
        let contents = body["request"]["contents"].as_array().unwrap();

        assert_eq!(contents[0]["role"], "model");
        assert_eq!(contents[0]["parts"][0]["functionCall"]["name"], "get_weather");
        assert_eq!(
            contents[1]["parts"][0]["functionResponse"]["response"]["result"],
            "sunny"
        );
    }

    #[test]
    fn thinking_config_enables_thoughts() {
        let request = request_from(
            r#"{"model":"claude-opus-4-5-thinking","messages":[{"role":"user","content":"x"}],"max_tokens":1024}"#,
        );
        let body = build_cloud_code_request(&request, "m", "p");
        let config = &body["request"]["generationConfig"];
        assert_eq!(config["thinkingConfig"]["includeThoughts"], true);
        assert_eq!(config["maxOutputTokens"], 1024);
    }

    #[test]
    fn schema_sanitizer_strips_unsupported_keywords() {
        let request = request_from(
            r#"{"model":"m","messages":[{"role":"user","content":"x"}],
                "tools":[{"name":"t","input_schema":{
                    "$schema":"http://json-schema.org/draft-07/schema#",
                    "type":"object",
                    "additionalProperties":false,
                    "properties":{"q":{"type":"string"}}
                }}]}"#,
        );
        let body = build_cloud_code_request(&request, "m", "p");
        let params = &body["request"]["tools"][0]["functionDeclarations"][0]["parameters"];
        assert!(params.get("$schema").is_none());
        assert!(params.get("additionalProperties").is_none());
        assert_eq!(params["properties"]["q"]["type"], "string");
    }

    #[test]
    fn tool_choice_maps_to_function_calling_config() {
        let request = request_from(
            r#"{"model":"m","messages":[{"role":"user","content":"x"}],
                "tools":[{"name":"t","input_schema":{"type":"object"}}],
                "tool_choice":{"type":"tool","name":"t"}}"#,
        );
        let body = build_cloud_code_request(&request, "m", "p");
        let config = &body["request"]["toolConfig"]["functionCallingConfig"];
        assert_eq!(config["mode"], "ANY");
        assert_eq!(config["allowedFunctionNames"][0], "t");
    }

    #[test]
    fn thinking_blocks_are_not_replayed_upstream() {
        let request = request_from(
            r#"{"model":"m","messages":[
                {"role":"assistant","content":[
                    {"type":"thinking","thinking":"private","signature":"sig"},
                    {"type":"text","text":"answer"}
                ]}
            ]}"#,
        );
        let body = build_cloud_code_request(&request, "m", "p");
        let parts = body["request"]["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0]["text"], "answer");
    }
}
