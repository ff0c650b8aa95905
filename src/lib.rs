//! mqtg-bot: forwards MQTT publishes to Telegram chats and manages each
//! chat's subscriptions through bot commands.

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod runtime;
