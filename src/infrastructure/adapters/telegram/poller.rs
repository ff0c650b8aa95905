//! Long-polling update source.
//!
//! Runs as its own task, turns Telegram updates into domain messages and
//! pushes them into the shared update stream. Stops when the stream asks it
//! to; dropping the sender then closes the stream for the workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::{TelegramAdapter, Update};
use crate::application::messaging::MessageParser;
use crate::domain::entities::{Message, User};
use crate::runtime::updates::UpdateSender;

/// Pause after a failed getUpdates call
const RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct UpdatePoller {
    adapter: Arc<TelegramAdapter>,
    parser: MessageParser,
    timeout: u64,
}

impl UpdatePoller {
    pub fn new(adapter: Arc<TelegramAdapter>, parser: MessageParser, timeout: u64) -> Self {
        Self { adapter, parser, timeout }
    }

    pub fn spawn(self, sender: UpdateSender) -> JoinHandle<()> {
        tokio::spawn(self.run(sender))
    }

    async fn run(self, sender: UpdateSender) {
        tracing::info!("Starting update polling (timeout {}s)", self.timeout);
        let mut offset: i64 = 0;

        'poll: loop {
            let batch = tokio::select! {
                _ = sender.stopped() => break 'poll,
                res = self.adapter.get_updates(offset, self.timeout) => res,
            };

            match batch {
                Ok(updates) => {
                    if !updates.is_empty() {
                        tracing::debug!("Received {} updates", updates.len());
                    }
                    offset = TelegramAdapter::get_next_offset(&updates, offset);

                    for update in updates {
                        let Some(message) = self.to_message(update) else {
                            continue;
                        };
                        if sender.send(message).await.is_err() {
                            break 'poll;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to get updates: {}", e);
                    tokio::select! {
                        _ = sender.stopped() => break 'poll,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }

        tracing::info!("Update polling stopped");
    }

    /// Converts a raw update; updates without usable content are skipped.
    fn to_message(&self, update: Update) -> Option<Message> {
        if let Some(msg) = update.message {
            let text = msg.text?;
            let sender = msg.from.map(to_user);
            return Some(
                self.parser
                    .parse(msg.chat.id.to_string(), text, sender)
                    .with_id(update.update_id.to_string()),
            );
        }

        if let Some(cb) = update.callback_query {
            let chat_id = cb
                .message
                .as_ref()
                .map(|m| m.chat.id)
                .unwrap_or(cb.from.id)
                .to_string();
            let data = cb.data.unwrap_or_default();
            return Some(
                self.parser
                    .parse_callback(chat_id, data, to_user(cb.from))
                    .with_id(cb.id),
            );
        }

        None
    }
}

fn to_user(user: super::User) -> User {
    User {
        id: user.id.to_string(),
        username: user.username,
        first_name: user.first_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::Content;

    fn poller() -> UpdatePoller {
        UpdatePoller::new(Arc::new(TelegramAdapter::new("t")), MessageParser::new("/"), 1)
    }

    #[test]
    fn converts_commands_and_callbacks() {
        let updates: Vec<Update> = serde_json::from_str(
            r#"[
                {"update_id": 1, "message": {"message_id": 9, "chat": {"id": 42}, "from": {"id": 7, "username": "ada"}, "text": "/subscribe home/#"}},
                {"update_id": 2, "callback_query": {"id": "cb-1", "from": {"id": 7}, "message": {"message_id": 9, "chat": {"id": 42}}, "data": "unsub:home/#"}},
                {"update_id": 3, "message": {"message_id": 10, "chat": {"id": 42}}}
            ]"#,
        )
        .unwrap();

        let poller = poller();
        let messages: Vec<Message> = updates.into_iter().filter_map(|u| poller.to_message(u)).collect();
        assert_eq!(messages.len(), 2);

        assert_eq!(messages[0].id, "1");
        assert_eq!(messages[0].chat_id, "42");
        assert_eq!(messages[0].sender.as_ref().and_then(|u| u.username.as_deref()), Some("ada"));
        assert_eq!(
            messages[0].content,
            Content::Command { name: "subscribe".to_string(), args: vec!["home/#".to_string()] }
        );

        assert_eq!(messages[1].id, "cb-1");
        assert_eq!(messages[1].content, Content::CallbackData("unsub:home/#".to_string()));
    }
}
