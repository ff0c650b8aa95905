//! Platform adapters

pub mod telegram;

pub use telegram::{TelegramAdapter, UpdatePoller};
