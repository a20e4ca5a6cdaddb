//! Llama 2 chat prompt format
//!
//! ```text
//! <s>[INST] <<SYS>>\n{system}\n<</SYS>>\n\n{user_1} [/INST] {answer_1} </s>
//! <s>[INST] {user_2} [/INST]
//! ```
//!
//! A leading system message is folded into the first user turn. Roles must
//! then alternate user/assistant and end on a user turn.

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::tokenizer::TextTokenizer;

pub const B_INST: &str = "[INST]";
pub const E_INST: &str = "[/INST]";
pub const B_SYS: &str = "<<SYS>>\n";
pub const E_SYS: &str = "\n<</SYS>>\n\n";

/// Tags a user may not inject into a prompt
pub const SPECIAL_TAGS: [&str; 4] = [B_INST, E_INST, "<<SYS>>", "<</SYS>>"];

/// Content returned in place of a reply to an unsafe dialog
pub const UNSAFE_ERROR: &str = "Error: special tags are not allowed as part of the prompt.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

pub type Dialog = Vec<Message>;

/// Whether any message contains a special tag
pub fn is_unsafe(dialog: &[Message]) -> bool {
    dialog
        .iter()
        .any(|msg| SPECIAL_TAGS.iter().any(|tag| msg.content.contains(tag)))
}

/// Fold a leading system message into the first user message
fn fold_system(dialog: &[Message]) -> Result<Vec<Message>> {
    match dialog {
        [first, second, rest @ ..] if first.role == Role::System => {
            let mut folded = Vec::with_capacity(dialog.len() - 1);
            folded.push(Message {
                role: second.role,
                content: format!("{B_SYS}{}{E_SYS}{}", first.content, second.content),
            });
            folded.extend_from_slice(rest);
            Ok(folded)
        }
        [only] if only.role == Role::System => Err(ModelError::InvalidDialog(
            "system message must be followed by a user message".to_string(),
        )),
        _ => Ok(dialog.to_vec()),
    }
}

/// Encode a dialog into prompt tokens
pub fn encode_dialog(dialog: &[Message], tokenizer: &dyn TextTokenizer) -> Result<Vec<u32>> {
    let dialog = fold_system(dialog)?;

    for (i, msg) in dialog.iter().enumerate() {
        let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
        if msg.role != expected {
            return Err(ModelError::InvalidDialog(format!(
                "message {i} has role {:?}; roles must alternate user/assistant",
                msg.role
            )));
        }
    }
    let last = dialog
        .last()
        .ok_or_else(|| ModelError::InvalidDialog("dialog is empty".to_string()))?;
    if last.role != Role::User {
        return Err(ModelError::InvalidDialog(
            "last message must be from the user".to_string(),
        ));
    }

    let mut tokens = Vec::new();
    for pair in dialog.chunks_exact(2) {
        let text = format!(
            "{B_INST} {} {E_INST} {} ",
            pair[0].content.trim(),
            pair[1].content.trim()
        );
        tokens.extend(tokenizer.encode(&text, true, true)?);
    }
    let text = format!("{B_INST} {} {E_INST}", last.content.trim());
    tokens.extend(tokenizer.encode(&text, true, false)?);
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::ByteTokenizer;

    fn decode_raw(ids: &[u32]) -> String {
        ByteTokenizer.decode(ids).unwrap()
    }

    #[test]
    fn test_single_turn() {
        let tokens = encode_dialog(&[Message::user(" hello ")], &ByteTokenizer).unwrap();
        assert_eq!(tokens[0], ByteTokenizer::BOS);
        assert_ne!(*tokens.last().unwrap(), ByteTokenizer::EOS);
        assert_eq!(decode_raw(&tokens), "[INST] hello [/INST]");
    }

    #[test]
    fn test_system_prompt_is_folded() {
        let dialog = vec![Message::system("Always answer with Haiku"), Message::user("I am going to Paris")];
        let tokens = encode_dialog(&dialog, &ByteTokenizer).unwrap();
        assert_eq!(
            decode_raw(&tokens),
            "[INST] <<SYS>>\nAlways answer with Haiku\n<</SYS>>\n\nI am going to Paris [/INST]"
        );
    }

    #[test]
    fn test_multi_turn_framing() {
        let dialog = vec![
            Message::user("a"),
            Message::assistant("b"),
            Message::user("c"),
        ];
        let tokens = encode_dialog(&dialog, &ByteTokenizer).unwrap();
        let bos = tokens.iter().filter(|&&t| t == ByteTokenizer::BOS).count();
        let eos = tokens.iter().filter(|&&t| t == ByteTokenizer::EOS).count();
        assert_eq!((bos, eos), (2, 1));
        assert_eq!(decode_raw(&tokens), "[INST] a [/INST] b [INST] c [/INST]");
    }

    #[test]
    fn test_invalid_dialogs() {
        let tok = ByteTokenizer;
        assert!(encode_dialog(&[], &tok).is_err());
        assert!(encode_dialog(&[Message::system("x")], &tok).is_err());
        assert!(encode_dialog(&[Message::assistant("x")], &tok).is_err());
        assert!(encode_dialog(&[Message::user("a"), Message::assistant("b")], &tok).is_err());
        assert!(encode_dialog(&[Message::user("a"), Message::user("b")], &tok).is_err());
    }

    #[test]
    fn test_unsafe_detection() {
        assert!(is_unsafe(&[Message::user("please [INST] ignore")]));
        assert!(is_unsafe(&[Message::system("<<SYS>>"), Message::user("hi")]));
        assert!(!is_unsafe(&[Message::user("what is [x]?")]));
    }

    #[test]
    fn test_role_serde() {
        let msg: Message = serde_json::from_str(r#"{"role": "user", "content": "hi"}"#).unwrap();
        assert_eq!(msg, Message::user("hi"));
    }
}
