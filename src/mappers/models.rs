use serde::{Deserialize, Serialize};
use serde_json::Value;

// Anthropic message API shapes, reduced to the fields the proxy consumes.
// Unknown client fields are preserved nowhere; the upstream never sees them.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
}

impl ClaudeRequest {
    // Thinking models are routed through the SSE endpoint even for
    // non-streaming clients; the stream is collected into one response.
    pub fn is_thinking_model(&self) -> bool {
        self.model.ends_with("-thinking")
            || self
                .thinking
                .as_ref()
                .map(|t| t.kind == "enabled")
                .unwrap_or(false)
    }

    pub fn has_binary_content(&self) -> bool {
        self.messages.iter().any(|m| match &m.content {
            MessageContent::String(_) => false,
            MessageContent::Array(blocks) => blocks
                .iter()
                .any(|b| matches!(b, ContentBlock::Image { .. } | ContentBlock::Document { .. })),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    String(String),
    Blocks(Vec<ContentBlock>),
}

impl SystemPrompt {
    pub fn as_text(&self) -> String {
        match self {
            SystemPrompt::String(s) => s.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    String(String),
    Array(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: Value,
    },
    Document {
        source: Value,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountTokensRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_request() {
        let request: ClaudeRequest = serde_json::from_str(
            r#"{"model":"claude-sonnet-4-5","messages":[{"role":"user","content":"hi"}]}"#,
        )
        .unwrap();
        assert_eq!(request.model, "claude-sonnet-4-5");
        assert!(!request.stream);
        assert!(!request.is_thinking_model());
    }

    #[test]
    fn thinking_detection_covers_suffix_and_config() {
        let by_suffix: ClaudeRequest = serde_json::from_str(
            r#"{"model":"claude-opus-4-5-thinking","messages":[]}"#,
        )
        .unwrap();
        assert!(by_suffix.is_thinking_model());

        let by_config: ClaudeRequest = serde_json::from_str(
            r#"{"model":"claude-opus-4-5","messages":[],"thinking":{"type":"enabled","budget_tokens":2048}}"#,
        )
        .unwrap();
        assert!(by_config.is_thinking_model());
    }

    #[test]
    fn binary_content_detection() {
        let request: ClaudeRequest = serde_json::from_str(
            r#"{"model":"m","messages":[{"role":"user","content":[
                {"type":"text","text":"what is this"},
                {"type":"image","source":{"type":"base64","media_type":"image/png","data":"Zm9v"}}
            ]}]}"#,
        )
        .unwrap();
        assert!(request.has_binary_content());
    }

    #[test]
    fn system_prompt_accepts_both_shapes() {
        let blocks: SystemPrompt =
            serde_json::from_str(r#"[{"type":"text","text":"be brief"}]"#).unwrap();
        assert_eq!(blocks.as_text(), "be brief");

        let plain: SystemPrompt = serde_json::from_str(r#""be brief""#).unwrap();
        assert_eq!(plain.as_text(), "be brief");
    }
}
