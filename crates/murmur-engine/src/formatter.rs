//! Request formatting for the completion service.
//!
//! Maps the conversation buffer plus a new input into the chat payload the
//! completion service consumes. Everything here is pure: the same snapshot
//! and input always produce the same payload.

use serde::{Deserialize, Serialize};

use crate::buffer::Turn;

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message (instructions to the model).
    System,
    /// User message.
    User,
    /// Assistant (model) response.
    Assistant,
}

/// A single entry of the wire payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
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

/// Body of a completion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

/// Build the message sequence for a new input.
///
/// Every turn except the last contributes its user text and its response.
/// The last turn is the pending one, so its assistant entry is always sent
/// empty as a continuation placeholder. The system prompt leads and the new
/// input closes the sequence.
pub fn format_messages(system_prompt: &str, turns: &[Turn], new_input: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(turns.len() * 2 + 2);
    messages.push(ChatMessage::system(system_prompt));

    let last = turns.len().saturating_sub(1);
    for (index, turn) in turns.iter().enumerate() {
        messages.push(ChatMessage::user(turn.user.clone()));
        if index == last {
            messages.push(ChatMessage::assistant(""));
        } else {
            messages.push(ChatMessage::assistant(turn.bot.clone()));
        }
    }

    messages.push(ChatMessage::user(new_input));
    messages
}

/// Build the full request body for the completion service.
pub fn build_request(
    model: &str,
    system_prompt: &str,
    turns: &[Turn],
    new_input: &str,
) -> CompletionRequest {
    CompletionRequest {
        model: model.to_string(),
        messages: format_messages(system_prompt, turns, new_input),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(user: &str, bot: &str) -> Turn {
        let mut turn = Turn::pending(user);
        turn.bot = bot.into();
        turn
    }

    #[test]
    fn test_format_with_history() {
        let turns = vec![turn("hi", "hello!"), turn("how are you", "")];
        let messages = format_messages("be nice", &turns, "how are you");

        assert_eq!(
            messages,
            vec![
                ChatMessage::system("be nice"),
                ChatMessage::user("hi"),
                ChatMessage::assistant("hello!"),
                ChatMessage::user("how are you"),
                ChatMessage::assistant(""),
                ChatMessage::user("how are you"),
            ]
        );
    }

    #[test]
    fn test_last_turn_always_sends_empty_assistant() {
        let turns = vec![turn("first", "done"), turn("second", "already answered")];
        let messages = format_messages("sys", &turns, "third");

        assert_eq!(messages[4], ChatMessage::assistant(""));
        assert_eq!(messages[2], ChatMessage::assistant("done"));
    }

    #[test]
    fn test_format_empty_buffer() {
        let messages = format_messages("sys", &[], "hello");
        assert_eq!(
            messages,
            vec![ChatMessage::system("sys"), ChatMessage::user("hello")]
        );
    }

    #[test]
    fn test_format_is_pure() {
        let turns = vec![turn("a", "b"), turn("c", "")];
        let first = build_request("gpt-4", "sys", &turns, "c");
        let second = build_request("gpt-4", "sys", &turns, "c");
        assert_eq!(first, second);
    }

    #[test]
    fn test_request_wire_shape() {
        let request = build_request("gpt-4", "sys", &[turn("hello", "")], "hello");
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["model"], "gpt-4");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["messages"][2]["role"], "assistant");
        assert_eq!(json["messages"][2]["content"], "");
        assert_eq!(json["messages"].as_array().unwrap().len(), 4);
    }
}
