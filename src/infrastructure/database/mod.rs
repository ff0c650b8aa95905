//! SQLite persistence for users, subscriptions and received payloads.
//!
//! One connection shared by all workers behind a mutex. [`Database::close`]
//! releases it; afterwards every call fails with [`StorageError::Closed`].

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::application::errors::StorageError;
use crate::domain::entities::{Subscription, TopicFilter, User};

/// One stored payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPayload {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: String,
}

pub struct Database {
    conn: Mutex<Option<Connection>>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn: Mutex::new(Some(conn)),
        };
        db.init_tables()?;
        Ok(db)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        // a panicking worker must not take the store down with it
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T, StorageError> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;
        Ok(f(conn)?)
    }

    fn init_tables(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    chat_id TEXT PRIMARY KEY,
                    username TEXT,
                    first_name TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS subscriptions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    chat_id TEXT NOT NULL REFERENCES users(chat_id) ON DELETE CASCADE,
                    topic_filter TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE (chat_id, topic_filter)
                );

                CREATE TABLE IF NOT EXISTS subscription_data (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    subscription_id INTEGER NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
                    topic TEXT NOT NULL,
                    payload BLOB NOT NULL,
                    received_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_subscription_data_sub
                    ON subscription_data(subscription_id, id);",
            )
        })
    }

    /// Releases the connection. Only the first call closes it.
    pub fn close(&self) -> Result<(), StorageError> {
        let conn = self.lock().take().ok_or(StorageError::Closed)?;
        conn.close().map_err(|(_, e)| StorageError::Sqlite(e))
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    // Users

    pub fn upsert_user(&self, user: &User) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (chat_id, username, first_name) VALUES (?1, ?2, ?3)
                 ON CONFLICT(chat_id) DO UPDATE SET
                    username = COALESCE(excluded.username, users.username),
                    first_name = COALESCE(excluded.first_name, users.first_name)",
                params![user.id, user.username, user.first_name],
            )
            .map(|_| ())
        })
    }

    pub fn get_user(&self, chat_id: &str) -> Result<Option<User>, StorageError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT chat_id, username, first_name FROM users WHERE chat_id = ?1",
                [chat_id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        first_name: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn list_users(&self) -> Result<Vec<User>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT chat_id, username, first_name FROM users ORDER BY created_at, chat_id")?;
            let rows = stmt.query_map([], |row| {
                Ok(User {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    first_name: row.get(2)?,
                })
            })?;
            rows.collect()
        })
    }

    // Subscriptions

    /// Returns false if the chat already had this filter.
    pub fn add_subscription(&self, chat_id: &str, filter: &TopicFilter) -> Result<bool, StorageError> {
        self.with_conn(|conn| {
            conn.execute("INSERT OR IGNORE INTO users (chat_id) VALUES (?1)", [chat_id])?;
            let rows = conn.execute(
                "INSERT OR IGNORE INTO subscriptions (chat_id, topic_filter) VALUES (?1, ?2)",
                params![chat_id, filter.as_str()],
            )?;
            Ok(rows > 0)
        })
    }

    /// Removes the subscription and its stored payloads.
    pub fn remove_subscription(&self, chat_id: &str, filter: &TopicFilter) -> Result<bool, StorageError> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "DELETE FROM subscriptions WHERE chat_id = ?1 AND topic_filter = ?2",
                params![chat_id, filter.as_str()],
            )?;
            Ok(rows > 0)
        })
    }

    pub fn list_subscriptions(&self, chat_id: &str) -> Result<Vec<Subscription>, StorageError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chat_id, topic_filter, created_at FROM subscriptions
                 WHERE chat_id = ?1 ORDER BY topic_filter",
            )?;
            let rows = stmt.query_map([chat_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect::<rusqlite::Result<Vec<(String, String, String)>>>()
        })?;
        Ok(rows.into_iter().filter_map(to_subscription).collect())
    }

    /// Every subscription of every user, for the startup preload.
    pub fn load_active_subscriptions(&self) -> Result<Vec<Subscription>, StorageError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.chat_id, s.topic_filter, s.created_at FROM subscriptions s
                 JOIN users u ON u.chat_id = s.chat_id
                 ORDER BY s.chat_id, s.topic_filter",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect::<rusqlite::Result<Vec<(String, String, String)>>>()
        })?;
        Ok(rows.into_iter().filter_map(to_subscription).collect())
    }

    // Subscription data

    /// Stores one payload, then trims the chat to its newest `keep` rows
    /// across all of its subscriptions.
    pub fn store_payload(&self, chat_id: &str, filter: &TopicFilter, topic: &str, payload: &[u8], keep: usize) -> Result<(), StorageError> {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or(StorageError::Closed)?;
        let tx = conn.transaction()?;

        let subscription_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM subscriptions WHERE chat_id = ?1 AND topic_filter = ?2",
                params![chat_id, filter.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(subscription_id) = subscription_id else {
            return Err(StorageError::NotFound(format!("subscription {} for chat {}", filter, chat_id)));
        };

        tx.execute(
            "INSERT INTO subscription_data (subscription_id, topic, payload) VALUES (?1, ?2, ?3)",
            params![subscription_id, topic, payload],
        )?;
        tx.execute(
            "DELETE FROM subscription_data
             WHERE subscription_id IN (SELECT id FROM subscriptions WHERE chat_id = ?1)
               AND id NOT IN (
                SELECT d.id FROM subscription_data d
                JOIN subscriptions s ON s.id = d.subscription_id
                WHERE s.chat_id = ?1
                ORDER BY d.id DESC LIMIT ?2
            )",
            params![chat_id, keep as i64],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Newest first.
    pub fn recent_payloads(&self, chat_id: &str, filter: &TopicFilter, limit: usize) -> Result<Vec<StoredPayload>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT d.topic, d.payload, d.received_at FROM subscription_data d
                 JOIN subscriptions s ON s.id = d.subscription_id
                 WHERE s.chat_id = ?1 AND s.topic_filter = ?2
                 ORDER BY d.id DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![chat_id, filter.as_str(), limit as i64], |row| {
                Ok(StoredPayload {
                    topic: row.get(0)?,
                    payload: row.get(1)?,
                    received_at: row.get(2)?,
                })
            })?;
            rows.collect()
        })
    }
}

fn to_subscription((chat_id, filter, created_at): (String, String, String)) -> Option<Subscription> {
    match TopicFilter::parse(&filter) {
        Ok(filter) => Some(Subscription { chat_id, filter, created_at }),
        Err(e) => {
            tracing::warn!("Skipping stored subscription {:?} of chat {}: {}", filter, chat_id, e);
            None
        }
    }
}
