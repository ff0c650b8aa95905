//! Users and their subscriptions.
//!
//! The store is the source of truth; an in-memory index of chat → filters
//! answers routing questions without touching SQLite. [`UserManager::publish`]
//! is the ingress used by the MQTT side: it fans a publish out to every
//! matching chat through the subscription bridge.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::application::errors::{BridgeError, StorageError};
use crate::domain::entities::{SubscriptionMessage, TopicFilter, User};
use crate::infrastructure::database::Database;
use crate::runtime::bridge::BridgeSender;

type Index = HashMap<String, BTreeSet<TopicFilter>>;

pub struct UserManager {
    store: Arc<Database>,
    bridge: BridgeSender,
    index: RwLock<Index>,
}

impl UserManager {
    pub fn new(store: Arc<Database>, bridge: BridgeSender) -> Self {
        Self {
            store,
            bridge,
            index: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn store(&self) -> &Arc<Database> {
        &self.store
    }

    /// Rebuilds the index from every persisted subscription.
    /// Returns the number of users with at least one subscription.
    pub fn load_all_connected_users(&self) -> Result<usize, StorageError> {
        let subscriptions = self.store.load_active_subscriptions()?;

        let mut index = Index::new();
        for sub in subscriptions {
            index.entry(sub.chat_id).or_default().insert(sub.filter);
        }

        let users = index.len();
        let total: usize = index.values().map(BTreeSet::len).sum();
        *self.write() = index;

        tracing::info!("Loaded {} connected users with {} subscriptions", users, total);
        Ok(users)
    }

    pub fn register_user(&self, user: &User) -> Result<(), StorageError> {
        self.store.upsert_user(user)
    }

    /// Returns false if the chat was already subscribed to `filter`.
    pub fn subscribe(&self, chat_id: &str, filter: &TopicFilter) -> Result<bool, StorageError> {
        let added = self.store.add_subscription(chat_id, filter)?;
        self.write()
            .entry(chat_id.to_string())
            .or_default()
            .insert(filter.clone());
        if added {
            tracing::info!("Chat {} subscribed to {}", chat_id, filter);
        }
        Ok(added)
    }

    /// Returns false if there was no such subscription.
    pub fn unsubscribe(&self, chat_id: &str, filter: &TopicFilter) -> Result<bool, StorageError> {
        let removed = self.store.remove_subscription(chat_id, filter)?;

        let mut index = self.write();
        if let Some(filters) = index.get_mut(chat_id) {
            filters.remove(filter);
            if filters.is_empty() {
                index.remove(chat_id);
            }
        }

        if removed {
            tracing::info!("Chat {} unsubscribed from {}", chat_id, filter);
        }
        Ok(removed)
    }

    pub fn subscriptions(&self, chat_id: &str) -> Vec<TopicFilter> {
        self.read()
            .get(chat_id)
            .map(|filters| filters.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Chats with at least one subscription
    pub fn connected_users(&self) -> usize {
        self.read().len()
    }

    /// Every (chat, filter) pair matching `topic`.
    pub fn recipients(&self, topic: &str) -> Vec<(String, TopicFilter)> {
        self.read()
            .iter()
            .flat_map(|(chat_id, filters)| {
                filters
                    .iter()
                    .filter(|f| f.matches(topic))
                    .map(move |f| (chat_id.clone(), f.clone()))
            })
            .collect()
    }

    /// Routes one MQTT publish to every matching chat, one bridge handoff
    /// per (chat, filter). Returns how many were handed off.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<usize, BridgeError> {
        let recipients = self.recipients(topic);
        let mut delivered = 0;

        for (chat_id, filter) in recipients {
            let message = SubscriptionMessage::new(chat_id, topic, filter, payload);
            self.bridge.send(message).await?;
            delivered += 1;
        }

        tracing::debug!("Publish on {} handed to {} subscribers", topic, delivered);
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::bridge;
    use crate::runtime::shutdown::ShutdownSignal;

    fn filter(s: &str) -> TopicFilter {
        TopicFilter::parse(s).unwrap()
    }

    fn manager() -> (UserManager, bridge::BridgeReceiver, ShutdownSignal) {
        let shutdown = ShutdownSignal::new();
        let (tx, rx) = bridge::channel(shutdown.clone());
        let store = Arc::new(Database::open_in_memory().unwrap());
        (UserManager::new(store, tx), rx, shutdown)
    }

    #[test]
    fn preload_rebuilds_index() {
        let (manager, _rx, _shutdown) = manager();
        manager.store().add_subscription("1", &filter("a/#")).unwrap();
        manager.store().add_subscription("1", &filter("b")).unwrap();
        manager.store().add_subscription("2", &filter("b")).unwrap();

        assert_eq!(manager.connected_users(), 0);
        assert_eq!(manager.load_all_connected_users().unwrap(), 2);
        assert_eq!(manager.subscriptions("1"), vec![filter("a/#"), filter("b")]);
        assert_eq!(manager.recipients("b").len(), 2);
    }

    #[test]
    fn subscribe_and_unsubscribe_keep_index_in_sync() {
        let (manager, _rx, _shutdown) = manager();
        assert!(manager.subscribe("1", &filter("home/+")).unwrap());
        assert!(!manager.subscribe("1", &filter("home/+")).unwrap());
        assert_eq!(manager.recipients("home/hall"), vec![("1".to_string(), filter("home/+"))]);

        assert!(manager.unsubscribe("1", &filter("home/+")).unwrap());
        assert!(manager.recipients("home/hall").is_empty());
        assert_eq!(manager.connected_users(), 0);
        assert!(!manager.unsubscribe("1", &filter("home/+")).unwrap());
    }

    #[tokio::test]
    async fn publish_hands_off_to_each_match() {
        let (manager, rx, _shutdown) = manager();
        manager.subscribe("1", &filter("home/#")).unwrap();
        manager.subscribe("2", &filter("home/+/temp")).unwrap();
        manager.subscribe("3", &filter("garden/#")).unwrap();

        let consumer = tokio::spawn(async move {
            let mut got = Vec::new();
            for _ in 0..2 {
                let msg = rx.recv().await.unwrap();
                let text = msg.payload_text();
                got.push((msg.chat_id, text));
            }
            got.sort();
            got
        });

        assert_eq!(manager.publish("home/hall/temp", b"21.5").await, Ok(2));
        assert_eq!(
            consumer.await.unwrap(),
            vec![("1".to_string(), "21.5".to_string()), ("2".to_string(), "21.5".to_string())]
        );
        assert_eq!(manager.publish("nobody/listens", b"x").await, Ok(0));
    }

    #[tokio::test]
    async fn publish_stops_on_shutdown() {
        let (manager, _rx, shutdown) = manager();
        manager.subscribe("1", &filter("#")).unwrap();
        shutdown.close().unwrap();
        assert_eq!(manager.publish("a", b"x").await, Err(BridgeError::ShuttingDown));
    }
}
