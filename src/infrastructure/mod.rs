//! Infrastructure layer - External concerns
//!
//! This layer contains:
//! - Config: Configuration loading
//! - Database: SQLite persistence
//! - Adapters: Telegram Bot API client and update poller

pub mod config;
pub mod database;
pub mod adapters;
