//! Chat prompt templates

use serde::{Deserialize, Serialize};

/// How a user message is wrapped before it reaches the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatTemplate {
    #[default]
    Llama3,
    Llama2,
    ChatMl,
    /// Pass the message through untouched
    Raw,
}

impl ChatTemplate {
    /// Format a single user turn, leaving the assistant turn open.
    pub fn render(&self, user_message: &str) -> String {
        match self {
            ChatTemplate::Llama3 => format!(
                "<|begin_of_text|><|start_header_id|>user<|end_header_id|>\n\n{user_message}<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n"
            ),
            ChatTemplate::Llama2 => format!("<s>[INST] {user_message} [/INST]"),
            ChatTemplate::ChatMl => format!(
                "<|im_start|>user\n{user_message}<|im_end|>\n<|im_start|>assistant\n"
            ),
            ChatTemplate::Raw => user_message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_wrap_message() {
        for template in [ChatTemplate::Llama3, ChatTemplate::Llama2, ChatTemplate::ChatMl] {
            let prompt = template.render("hello");
            assert!(prompt.contains("hello"));
            assert_ne!(prompt, "hello");
        }
        assert_eq!(ChatTemplate::Raw.render("hello"), "hello");
    }

    #[test]
    fn test_llama3_leaves_assistant_turn_open() {
        let prompt = ChatTemplate::Llama3.render("hi");
        assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn test_template_names() {
        let t: ChatTemplate = serde_yaml::from_str("chatml").unwrap();
        assert_eq!(t, ChatTemplate::ChatMl);
    }
}
