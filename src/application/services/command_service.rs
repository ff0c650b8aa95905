use std::sync::Arc;

use crate::application::errors::CommandError;
use crate::application::services::UserManager;
use crate::domain::entities::{Command, CommandRegistry, Content, Message, TopicFilter, User};

/// Service for managing and executing commands
pub struct CommandService {
    registry: CommandRegistry,
    prefix: String,
}

impl CommandService {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            registry: CommandRegistry::new(),
            prefix: prefix.into(),
        }
    }

    pub fn register(&mut self, command: Command) {
        self.registry.register(command);
    }

    pub fn register_defaults(&mut self) {
        // answered by `handle` so it can see the whole registry
        self.register(Command::new("help")
            .with_description("Show help message")
            .with_usage("/help [command]"));

        self.register(Command::new("version")
            .with_description("Show bot version")
            .with_handler(|_| Ok(format!("mqtg-bot v{}", env!("CARGO_PKG_VERSION")))));
    }

    /// Commands backed by the user manager.
    pub fn register_subscription_commands(&mut self, users: Arc<UserManager>, history_limit: usize) {
        let manager = Arc::clone(&users);
        self.register(Command::new("start")
            .with_description("Start the bot")
            .with_handler(move |msg| {
                let user = msg.sender.clone()
                    .map(|u| User { id: msg.chat_id.clone(), ..u })
                    .unwrap_or_else(|| User::new(msg.chat_id.clone()));
                manager.register_user(&user).map_err(failed)?;
                Ok(format!(
                    "Hi {}! I forward MQTT messages to this chat.\n\
                     Use /subscribe <topic> to start, /help for everything else.",
                    user.display_name()
                ))
            }));

        let manager = Arc::clone(&users);
        self.register(Command::new("subscribe")
            .with_description("Subscribe to an MQTT topic filter")
            .with_aliases(vec!["sub".to_string()])
            .with_usage("/subscribe <topic filter>, e.g. /subscribe home/+/temperature")
            .with_handler(move |msg| {
                let filter = filter_arg(msg, "/subscribe <topic filter>")?;
                if manager.subscribe(&msg.chat_id, &filter).map_err(failed)? {
                    Ok(format!("Subscribed to {}", filter))
                } else {
                    Ok(format!("Already subscribed to {}", filter))
                }
            }));

        let manager = Arc::clone(&users);
        self.register(Command::new("unsubscribe")
            .with_description("Remove a subscription")
            .with_aliases(vec!["unsub".to_string()])
            .with_usage("/unsubscribe <topic filter>")
            .with_handler(move |msg| {
                let filter = filter_arg(msg, "/unsubscribe <topic filter>")?;
                if manager.unsubscribe(&msg.chat_id, &filter).map_err(failed)? {
                    Ok(format!("Unsubscribed from {}", filter))
                } else {
                    Ok(format!("You are not subscribed to {}", filter))
                }
            }));

        let manager = Arc::clone(&users);
        self.register(Command::new("list")
            .with_description("List your subscriptions")
            .with_aliases(vec!["ls".to_string()])
            .with_handler(move |msg| {
                let filters = manager.subscriptions(&msg.chat_id);
                if filters.is_empty() {
                    return Ok("No subscriptions yet. Use /subscribe <topic>.".to_string());
                }
                let mut text = "Your subscriptions:\n".to_string();
                for filter in filters {
                    text.push_str(&format!("  {}\n", filter));
                }
                Ok(text)
            }));

        let manager = users;
        self.register(Command::new("history")
            .with_description("Show recent messages of a subscription")
            .with_usage("/history <topic filter>")
            .with_handler(move |msg| {
                let filter = filter_arg(msg, "/history <topic filter>")?;
                let stored = manager.store()
                    .recent_payloads(&msg.chat_id, &filter, history_limit)
                    .map_err(failed)?;
                if stored.is_empty() {
                    return Ok(format!("Nothing stored for {}", filter));
                }
                let mut text = format!("Last {} messages for {}:\n", stored.len(), filter);
                for item in stored.iter().rev() {
                    text.push_str(&format!("[{}] {}: {}\n", item.received_at, item.topic, String::from_utf8_lossy(&item.payload)));
                }
                Ok(text)
            }));
    }

    pub fn handle(&self, message: &Message) -> Result<Option<String>, CommandError> {
        let Content::Command { name, args } = &message.content else {
            return Ok(None);
        };

        let cmd = self.registry.find(name)
            .ok_or_else(|| CommandError::NotFound(name.clone()))?;

        if cmd.name == "help" {
            return Ok(Some(self.get_help(args.first().map(String::as_str))));
        }

        if let Some(handler) = &cmd.handler {
            Ok(Some(handler(message)?))
        } else {
            Ok(Some(format!("Command {} not implemented", cmd.name)))
        }
    }

    pub fn get_help(&self, command: Option<&str>) -> String {
        if let Some(name) = command {
            let name = name.trim_start_matches('/');
            if let Some(cmd) = self.registry.find(name) {
                let mut help = format!("/{} - {}", cmd.name, cmd.description.as_deref().unwrap_or("No description"));
                if let Some(usage) = &cmd.usage {
                    help.push_str(&format!("\nUsage: {}", usage));
                }
                return help;
            }
            return format!("Command /{} not found", name);
        }

        let mut help = "Available commands:\n".to_string();
        for cmd in self.registry.all() {
            help.push_str(&format!("  /{} - {}\n", cmd.name, cmd.description.as_deref().unwrap_or("")));
        }
        help
    }

    /// (name, description) pairs for setMyCommands
    pub fn descriptions(&self) -> Vec<(String, String)> {
        self.registry
            .all()
            .map(|cmd| (cmd.name.clone(), cmd.description.clone().unwrap_or_default()))
            .collect()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

fn filter_arg(msg: &Message, usage: &str) -> Result<TopicFilter, CommandError> {
    let Content::Command { args, .. } = &msg.content else {
        return Err(CommandError::InvalidArgs(format!("Usage: {}", usage)));
    };
    match args.first() {
        Some(raw) => TopicFilter::parse(raw),
        None => Err(CommandError::InvalidArgs(format!("Usage: {}", usage))),
    }
}

fn failed(e: impl std::fmt::Display) -> CommandError {
    CommandError::ExecutionFailed(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::Database;
    use crate::runtime::bridge;
    use crate::runtime::shutdown::ShutdownSignal;

    fn service() -> (CommandService, Arc<UserManager>) {
        let (tx, _rx) = bridge::channel(ShutdownSignal::new());
        let store = Arc::new(Database::open_in_memory().unwrap());
        let users = Arc::new(UserManager::new(store, tx));
        let mut commands = CommandService::new("/");
        commands.register_defaults();
        commands.register_subscription_commands(Arc::clone(&users), 5);
        (commands, users)
    }

    fn run(commands: &CommandService, text: &str) -> Result<Option<String>, CommandError> {
        let mut parts = text.split_whitespace();
        let name = parts.next().unwrap().trim_start_matches('/');
        let args = parts.map(str::to_string).collect();
        commands.handle(&Message::from_command("42", name, args))
    }

    #[test]
    fn subscribe_list_unsubscribe() {
        let (commands, users) = service();

        let reply = run(&commands, "/subscribe home/+/temp").unwrap().unwrap();
        assert_eq!(reply, "Subscribed to home/+/temp");
        assert_eq!(run(&commands, "/sub home/+/temp").unwrap().unwrap(), "Already subscribed to home/+/temp");
        assert_eq!(users.recipients("home/hall/temp").len(), 1);

        let list = run(&commands, "/list").unwrap().unwrap();
        assert!(list.contains("home/+/temp"));

        assert_eq!(run(&commands, "/unsubscribe home/+/temp").unwrap().unwrap(), "Unsubscribed from home/+/temp");
        assert!(run(&commands, "/list").unwrap().unwrap().starts_with("No subscriptions"));
    }

    #[test]
    fn bad_arguments_are_command_errors() {
        let (commands, _) = service();
        assert!(matches!(run(&commands, "/subscribe"), Err(CommandError::InvalidArgs(_))));
        assert!(matches!(run(&commands, "/subscribe a/#/b"), Err(CommandError::InvalidArgs(_))));
        assert!(matches!(run(&commands, "/nope"), Err(CommandError::NotFound(_))));
    }

    #[test]
    fn start_registers_user() {
        let (commands, users) = service();
        let msg = Message::from_command("42", "start", vec![]).with_sender(User::new("7").with_username("ada"));
        let reply = commands.handle(&msg).unwrap().unwrap();
        assert!(reply.starts_with("Hi @ada"));

        let stored = users.store().get_user("42").unwrap().unwrap();
        assert_eq!(stored.username.as_deref(), Some("ada"));
    }

    #[test]
    fn history_shows_stored_payloads() {
        let (commands, users) = service();
        let filter = TopicFilter::parse("sensors/#").unwrap();
        users.subscribe("42", &filter).unwrap();
        users.store().store_payload("42", &filter, "sensors/a", b"1", 5).unwrap();
        users.store().store_payload("42", &filter, "sensors/b", b"2", 5).unwrap();

        let reply = run(&commands, "/history sensors/#").unwrap().unwrap();
        assert!(reply.starts_with("Last 2 messages for sensors/#"));
        let first = reply.find("sensors/a: 1").unwrap();
        let second = reply.find("sensors/b: 2").unwrap();
        assert!(first < second);
    }

    #[test]
    fn help_lists_everything() {
        let (commands, _) = service();
        let help = run(&commands, "/help").unwrap().unwrap();
        for name in ["help", "history", "list", "start", "subscribe", "unsubscribe", "version"] {
            assert!(help.contains(&format!("/{} ", name)), "missing {} in {}", name, help);
        }
        assert!(run(&commands, "/help subscribe").unwrap().unwrap().contains("Usage:"));
        assert_eq!(commands.descriptions().len(), 7);
    }
}
