//! The business logic run by dispatch workers.

use std::sync::Arc;

use async_trait::async_trait;

use crate::application::errors::{BotError, CommandError, StorageError};
use crate::application::services::{CommandService, UserManager};
use crate::domain::entities::{Content, Message, SubscriptionMessage, TopicFilter};
use crate::domain::traits::{Bot, KeyboardButton, UpdateHandler};

/// Callback data prefix of the unsubscribe buttons under `/list`
pub const UNSUBSCRIBE_CALLBACK: &str = "unsub:";

pub struct BridgeService {
    bot: Arc<dyn Bot>,
    users: Arc<UserManager>,
    commands: CommandService,
    max_sub_data_count: usize,
}

impl BridgeService {
    pub fn new(bot: Arc<dyn Bot>, users: Arc<UserManager>, commands: CommandService, max_sub_data_count: usize) -> Self {
        Self {
            bot,
            users,
            commands,
            max_sub_data_count,
        }
    }

    async fn handle_command(&self, update: &Message) -> Result<(), BotError> {
        let is_list = matches!(&update.content, Content::Command { name, .. } if self.is_list(name));

        let response = match self.commands.handle(update) {
            Ok(Some(response)) => response,
            Ok(None) => return Ok(()),
            Err(CommandError::NotFound(name)) => format!("Unknown command /{}. Try /help", name),
            Err(e) => e.to_string(),
        };

        let filters = if is_list { self.users.subscriptions(&update.chat_id) } else { Vec::new() };
        if filters.is_empty() {
            self.bot.send_message(&update.chat_id, &response).await?;
        } else {
            let buttons = filters
                .iter()
                .map(|f| vec![KeyboardButton::new(format!("Unsubscribe {}", f)).with_callback(format!("{}{}", UNSUBSCRIBE_CALLBACK, f))])
                .collect();
            self.bot.send_with_keyboard(&update.chat_id, &response, buttons).await?;
        }
        Ok(())
    }

    fn is_list(&self, name: &str) -> bool {
        ["list", "ls"].iter().any(|n| n.eq_ignore_ascii_case(name))
    }

    async fn handle_callback(&self, update: &Message, data: &str) -> Result<(), BotError> {
        let Some(raw) = data.strip_prefix(UNSUBSCRIBE_CALLBACK) else {
            self.bot.answer_callback(&update.id, None).await?;
            return Ok(());
        };

        let filter = TopicFilter::parse(raw)?;
        let removed = self.users.unsubscribe(&update.chat_id, &filter)?;
        let text = if removed {
            format!("Unsubscribed from {}", filter)
        } else {
            format!("You are not subscribed to {}", filter)
        };

        self.bot.answer_callback(&update.id, Some(&text)).await?;
        self.bot.send_message(&update.chat_id, &text).await?;
        Ok(())
    }
}

#[async_trait]
impl UpdateHandler for BridgeService {
    async fn handle_update(&self, update: Message) -> Result<(), BotError> {
        tracing::debug!("Update {} from chat {} ({})", update.id, update.chat_id, update.message_type.as_str());

        match &update.content {
            Content::Command { .. } => self.handle_command(&update).await,
            Content::CallbackData(data) => self.handle_callback(&update, data).await,
            Content::Text(_) => {
                let hint = format!("Send {}help to see what I can do.", self.commands.prefix());
                self.bot.send_message(&update.chat_id, &hint).await.map(|_| ())
            }
            Content::Empty => Ok(()),
        }
    }

    async fn handle_subscription(&self, message: SubscriptionMessage) -> Result<(), BotError> {
        // sqlite is synchronous; keep it off the runtime threads
        let store = Arc::clone(self.users.store());
        let keep = self.max_sub_data_count;
        let (message, stored) = tokio::task::spawn_blocking(move || {
            let stored = store.store_payload(&message.chat_id, &message.filter, &message.topic, &message.payload, keep);
            (message, stored)
        })
        .await
        .map_err(|e| BotError::Internal(format!("payload store task failed: {}", e)))?;

        match stored {
            Ok(()) => {}
            // unsubscribed while the message was in flight
            Err(StorageError::NotFound(_)) => {
                tracing::debug!("Dropping message on {} for chat {}: no longer subscribed", message.topic, message.chat_id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let text = format!("{}\n{}", message.topic, message.payload_text());
        self.bot.send_message(&message.chat_id, &text).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::User;
    use crate::domain::traits::BotInfo;
    use crate::infrastructure::database::Database;
    use crate::runtime::bridge;
    use crate::runtime::shutdown::ShutdownSignal;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Text(String, String),
        Keyboard(String, String, usize),
        Answer(String, Option<String>),
    }

    #[derive(Default)]
    struct FakeBot {
        sent: Mutex<Vec<Sent>>,
    }

    #[async_trait]
    impl Bot for FakeBot {
        async fn send_message(&self, chat_id: &str, text: &str) -> Result<String, BotError> {
            self.sent.lock().unwrap().push(Sent::Text(chat_id.to_string(), text.to_string()));
            Ok("1".to_string())
        }

        async fn send_with_keyboard(&self, chat_id: &str, text: &str, buttons: Vec<Vec<KeyboardButton>>) -> Result<String, BotError> {
            self.sent.lock().unwrap().push(Sent::Keyboard(chat_id.to_string(), text.to_string(), buttons.len()));
            Ok("1".to_string())
        }

        async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), BotError> {
            self.sent.lock().unwrap().push(Sent::Answer(callback_id.to_string(), text.map(str::to_string)));
            Ok(())
        }

        fn bot_info(&self) -> BotInfo {
            BotInfo { id: "1".to_string(), name: "fake".to_string(), username: "fake_bot".to_string() }
        }
    }

    fn service() -> (BridgeService, Arc<FakeBot>, Arc<UserManager>) {
        let (tx, _rx) = bridge::channel(ShutdownSignal::new());
        let users = Arc::new(UserManager::new(Arc::new(Database::open_in_memory().unwrap()), tx));
        let mut commands = CommandService::new("/");
        commands.register_defaults();
        commands.register_subscription_commands(Arc::clone(&users), 3);
        let bot = Arc::new(FakeBot::default());
        (BridgeService::new(bot.clone(), Arc::clone(&users), commands, 3), bot, users)
    }

    fn filter(s: &str) -> TopicFilter {
        TopicFilter::parse(s).unwrap()
    }

    #[tokio::test]
    async fn command_reply_is_sent() {
        let (service, bot, _) = service();
        service.handle_update(Message::from_command("5", "subscribe", vec!["a/+".to_string()])).await.unwrap();
        service.handle_update(Message::from_command("5", "bogus", vec![])).await.unwrap();

        let sent = bot.sent.lock().unwrap().clone();
        assert_eq!(sent[0], Sent::Text("5".to_string(), "Subscribed to a/+".to_string()));
        assert_eq!(sent[1], Sent::Text("5".to_string(), "Unknown command /bogus. Try /help".to_string()));
    }

    #[tokio::test]
    async fn list_comes_with_unsubscribe_buttons() {
        let (service, bot, users) = service();
        users.subscribe("5", &filter("a/#")).unwrap();
        users.subscribe("5", &filter("b")).unwrap();

        service.handle_update(Message::from_command("5", "list", vec![])).await.unwrap();
        assert!(matches!(&bot.sent.lock().unwrap()[0], Sent::Keyboard(chat, _, 2) if chat == "5"));
    }

    #[tokio::test]
    async fn unsubscribe_callback() {
        let (service, bot, users) = service();
        users.subscribe("5", &filter("a/#")).unwrap();

        let update = Message::new("5", Content::CallbackData("unsub:a/#".to_string()))
            .with_id("cb-9")
            .with_sender(User::new("5"));
        service.handle_update(update).await.unwrap();

        assert!(users.subscriptions("5").is_empty());
        let sent = bot.sent.lock().unwrap().clone();
        assert_eq!(sent[0], Sent::Answer("cb-9".to_string(), Some("Unsubscribed from a/#".to_string())));
    }

    #[tokio::test]
    async fn subscription_message_is_stored_and_delivered() {
        let (service, bot, users) = service();
        let f = filter("sensors/+");
        users.subscribe("5", &f).unwrap();

        for n in 0..5 {
            let msg = SubscriptionMessage::new("5", "sensors/t", f.clone(), n.to_string());
            service.handle_subscription(msg).await.unwrap();
        }

        assert_eq!(bot.sent.lock().unwrap().len(), 5);
        assert_eq!(bot.sent.lock().unwrap()[4], Sent::Text("5".to_string(), "sensors/t\n4".to_string()));
        assert_eq!(users.store().recent_payloads("5", &f, 10).unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn payload_limit_spans_all_of_a_chats_subscriptions() {
        let (service, bot, users) = service();
        let (a, b) = (filter("a/+"), filter("b/+"));
        users.subscribe("5", &a).unwrap();
        users.subscribe("5", &b).unwrap();

        for n in 0..4 {
            service.handle_subscription(SubscriptionMessage::new("5", "a/x", a.clone(), n.to_string())).await.unwrap();
            service.handle_subscription(SubscriptionMessage::new("5", "b/x", b.clone(), n.to_string())).await.unwrap();
        }

        assert_eq!(bot.sent.lock().unwrap().len(), 8);
        let kept = users.store().recent_payloads("5", &a, 10).unwrap().len()
            + users.store().recent_payloads("5", &b, 10).unwrap().len();
        assert_eq!(kept, 3);
    }

    #[tokio::test]
    async fn message_for_removed_subscription_is_dropped() {
        let (service, bot, _) = service();
        let msg = SubscriptionMessage::new("5", "x", filter("x"), "v");
        service.handle_subscription(msg).await.unwrap();
        assert!(bot.sent.lock().unwrap().is_empty());
    }
}
