//! Flattens a structured chat history into the single prompt string the agent
//! endpoint accepts.

use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text(String),
    /// Inline image; `data` is the base64 payload without the data-URL prefix.
    Image { media_type: String, data: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl PromptMessage {
    #[cfg(test)]
    pub fn text(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: vec![ContentBlock::Text(text.into())],
        }
    }
}

const CLOSING_INSTRUCTION: &str = "Continue the conversation as the assistant. Answer the last user turn directly in plain text. Do not create, edit or run project files.";

/// Pure and deterministic: equal inputs give byte-identical prompts.
pub fn build_prompt(model: &str, messages: &[PromptMessage], system: &str) -> String {
    let mut out = String::new();

    if !model.trim().is_empty() {
        let _ = writeln!(out, "<model>{}</model>", model.trim());
    }
    if !system.trim().is_empty() {
        let _ = writeln!(out, "<system>\n{}\n</system>", system.trim());
    }

    out.push_str("<conversation>\n");
    for message in messages {
        let role = normalize_role(&message.role);
        let _ = writeln!(out, "<{role}>");
        for block in &message.content {
            match block {
                ContentBlock::Text(text) => {
                    if !text.is_empty() {
                        let _ = writeln!(out, "{text}");
                    }
                }
                ContentBlock::Image { media_type, data } => {
                    let _ = writeln!(
                        out,
                        "[image attached: {media_type}, {} base64 chars]",
                        data.len()
                    );
                }
            }
        }
        let _ = writeln!(out, "</{role}>");
    }
    out.push_str("</conversation>\n\n");
    out.push_str(CLOSING_INSTRUCTION);
    out
}

fn normalize_role(role: &str) -> &str {
    match role {
        "assistant" | "model" => "assistant",
        "tool" | "function" => "tool",
        _ => "user",
    }
}

#[cfg(test)]
mod tests {
    use super::{ContentBlock, PromptMessage, build_prompt};

    #[test]
    fn prompt_is_deterministic() {
        let messages = vec![
            PromptMessage::text("user", "hi"),
            PromptMessage::text("assistant", "hello"),
        ];
        let a = build_prompt("claude-opus-4-5", &messages, "be brief");
        let b = build_prompt("claude-opus-4-5", &messages, "be brief");
        assert_eq!(a, b);
        assert!(a.contains("<system>\nbe brief\n</system>"));
        assert!(a.find("<user>").unwrap() < a.find("<assistant>").unwrap());
    }

    #[test]
    fn images_become_placeholders() {
        let messages = vec![PromptMessage {
            role: "user".to_string(),
            content: vec![ContentBlock::Image {
                media_type: "image/png".to_string(),
                data: "AAAA".to_string(),
            }],
        }];
        let prompt = build_prompt("", &messages, "");
        assert!(prompt.contains("[image attached: image/png, 4 base64 chars]"));
        assert!(!prompt.contains("<system>"));
        assert!(!prompt.contains("<model>"));
    }
}
