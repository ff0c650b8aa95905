//! Message parser - turns raw chat text into structured updates

use crate::domain::entities::{Content, Message, MessageType, User};

/// Parses incoming text into domain [`Message`]s
#[derive(Debug, Clone)]
pub struct MessageParser {
    command_prefix: String,
}

impl MessageParser {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            command_prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.command_prefix
    }

    /// Parse a text message
    pub fn parse(&self, chat_id: impl Into<String>, text: impl Into<String>, sender: Option<User>) -> Message {
        let text = text.into();
        let chat_id = chat_id.into();

        if text.starts_with('/') || (!self.command_prefix.is_empty() && text.starts_with(&self.command_prefix)) {
            return self.parse_command(chat_id, &text, sender);
        }

        Message::new(chat_id, Content::Text(text))
            .with_message_type(MessageType::Text)
            .with_sender_opt(sender)
    }

    fn parse_command(&self, chat_id: String, text: &str, sender: Option<User>) -> Message {
        let cmd_text = text
            .strip_prefix('/')
            .or_else(|| text.strip_prefix(self.command_prefix.as_str()))
            .unwrap_or(text);

        let mut parts = cmd_text.split_whitespace();
        let name = parts.next().unwrap_or_default().to_string();
        let args = parts.map(str::to_string).collect();

        Message::new(chat_id, Content::Command { name, args })
            .with_message_type(MessageType::Command)
            .with_sender_opt(sender)
    }

    /// Parse a callback query (inline button press)
    pub fn parse_callback(&self, chat_id: impl Into<String>, data: impl Into<String>, user: User) -> Message {
        Message::new(chat_id, Content::CallbackData(data.into()))
            .with_message_type(MessageType::Callback)
            .with_sender(user)
    }
}
