//! Plain-text transcript fed to CLI backends on stdin.
//!
//! The CLIs accept a single prompt and have no structured system-prompt
//! flag, so the whole conversation is flattened into marked sections.

use std::fmt::Write as _;

use crate::types::{ChatRequest, ContentBlock, Message, Role};

/// Render the request as a transcript.
///
/// A lone user message with no system prompt is sent verbatim.
pub fn render_transcript(request: &ChatRequest) -> String {
    let system = request.system_prompt.as_deref().filter(|s| !s.is_empty());

    if system.is_none()
        && let [only] = request.messages.as_slice()
        && only.role == Role::User
        && only.content.iter().all(|b| matches!(b, ContentBlock::Text { .. }))
    {
        return only.text();
    }

    let mut out = String::new();
    if let Some(system) = system {
        push_section(&mut out, "[System]", system);
    }
    for message in &request.messages {
        render_message(&mut out, message);
    }
    out.trim_end().to_owned()
}

fn render_message(out: &mut String, message: &Message) {
    match message.role {
        Role::System => push_section(out, "[System]", &message.text()),
        Role::User => push_section(out, "[User]", &blocks_text(&message.content)),
        Role::Assistant => push_section(out, "[Assistant]", &blocks_text(&message.content)),
        Role::Tool => {
            for block in &message.content {
                if let ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } = block
                {
                    let header = if *is_error {
                        format!("[Tool Result {tool_use_id} (error)]")
                    } else {
                        format!("[Tool Result {tool_use_id}]")
                    };
                    push_section(out, &header, content);
                }
            }
        }
    }
}

fn blocks_text(blocks: &[ContentBlock]) -> String {
    let mut text = String::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text: t } => text.push_str(t),
            ContentBlock::ToolUse(call) => {
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                let _ = write!(text, "[Tool Use {} {}] {}", call.id, call.name, call.input);
            }
            ContentBlock::Image { media_type, .. } => {
                let _ = write!(text, "[Image {media_type} omitted]");
            }
            ContentBlock::ToolResult { content, .. } => text.push_str(content),
        }
    }
    text
}

fn push_section(out: &mut String, header: &str, body: &str) {
    out.push_str(header);
    out.push('\n');
    out.push_str(body);
    out.push_str("\n\n");
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn single_user_message_is_verbatim() {
        let req = ChatRequest::new(vec![Message::user("What is 2+2?")]);
        assert_eq!(render_transcript(&req), "What is 2+2?");
    }

    #[test]
    fn multi_turn_uses_markers() {
        let req = ChatRequest::new(vec![
            Message::user("Weather in Paris?"),
            Message::assistant_blocks(vec![ContentBlock::tool_use(
                "t1",
                "get_weather",
                json!({"city": "Paris"}),
            )]),
            Message::tool_result("t1", "18C, sunny", false),
            Message::tool_result("t2", "timeout", true),
        ])
        .with_system_prompt("Be brief.");

        let text = render_transcript(&req);
        assert_eq!(
            text,
            "[System]\nBe brief.\n\n\
             [User]\nWeather in Paris?\n\n\
             [Assistant]\n[Tool Use t1 get_weather] {\"city\":\"Paris\"}\n\n\
             [Tool Result t1]\n18C, sunny\n\n\
             [Tool Result t2 (error)]\ntimeout"
        );
    }
}
