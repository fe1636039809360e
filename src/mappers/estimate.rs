use super::models::{CountTokensRequest, ContentBlock, MessageContent};

// Local token estimate for text-only count_tokens requests. Roughly four
// characters per token plus a small per-message framing overhead; good enough
// for client-side budgeting, never used for billing.

const CHARS_PER_TOKEN: usize = 4;
const PER_MESSAGE_OVERHEAD: usize = 5;

fn text_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

pub fn estimate_input_tokens(request: &CountTokensRequest) -> u64 {
    let mut total = 0usize;

    if let Some(system) = &request.system {
        total += text_tokens(&system.as_text());
    }

    for message in &request.messages {
        total += PER_MESSAGE_OVERHEAD;
        match &message.content {
            MessageContent::String(text) => total += text_tokens(text),
            MessageContent::Array(blocks) => {
                for block in blocks {
                    total += match block {
                        ContentBlock::Text { text } => text_tokens(text),
                        ContentBlock::Thinking { thinking, .. } => text_tokens(thinking),
                        ContentBlock::ToolUse { input, .. } => text_tokens(&input.to_string()),
                        ContentBlock::ToolResult { content, .. } => content
                            .as_ref()
                            .map(|c| text_tokens(&c.to_string()))
                            .unwrap_or(0),
                        // Binary blocks are counted upstream, not here
                        _ => 0,
                    };
                }
            }
        }
    }

    if let Some(tools) = &request.tools {
        for tool in tools {
            total += text_tokens(&tool.name);
            total += tool
                .description
                .as_ref()
                .map(|d| text_tokens(d))
                .unwrap_or(0);
            total += text_tokens(&tool.input_schema.to_string());
        }
    }

    total as u64
}
