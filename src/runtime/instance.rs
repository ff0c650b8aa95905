//! The bot instance: wiring, startup and coordinated shutdown.
//!
//! Startup validates configuration before anything else, so a missing token
//! stops the process before a single worker registers. Shutdown is split in
//! two calls:
//!
//! 1. [`BotInstance::shutdown`]: stop the update producer, then close the
//!    shutdown signal (guarded against a second close).
//! 2. [`BotInstance::wait`]: block until every worker has deregistered, join
//!    the poller, then release the store exactly once.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::application::errors::{BotError, ShutdownError};
use crate::application::messaging::MessageParser;
use crate::application::services::{BridgeService, CommandService, UserManager};
use crate::domain::traits::Bot;
use crate::infrastructure::adapters::{TelegramAdapter, UpdatePoller};
use crate::infrastructure::config::Config;
use crate::infrastructure::database::Database;
use crate::runtime::barrier::CompletionBarrier;
use crate::runtime::bridge::{self, BridgeSender};
use crate::runtime::pool::{DispatchPool, PoolStats, WorkerContext};
use crate::runtime::shutdown::{Lifecycle, LifecycleState, ShutdownSignal};
use crate::runtime::updates::{self, UpdateStream};

/// Command prefix understood by the bot
pub const COMMAND_PREFIX: &str = "/";

/// External collaborators a [`BotInstance`] is built from.
pub struct Collaborators {
    /// Outbound send capability
    pub bot: Arc<dyn Bot>,
    pub store: Arc<Database>,
    /// Consumer side of the inbound update stream
    pub updates: UpdateStream,
    /// Task producing into `updates`, joined during [`BotInstance::wait`]
    pub producer: Option<JoinHandle<()>>,
}

pub struct BotInstance {
    bot: Arc<dyn Bot>,
    store: Arc<Database>,
    updates: UpdateStream,
    bridge: BridgeSender,
    users: Arc<UserManager>,
    barrier: CompletionBarrier,
    shutdown: ShutdownSignal,
    lifecycle: Lifecycle,
    stats: Arc<PoolStats>,
    workers: usize,
    max_sub_data_count: usize,
    producer: Mutex<Option<JoinHandle<()>>>,
}

impl BotInstance {
    /// Builds the Telegram client, store and poller from `config`, then
    /// launches the instance.
    pub async fn start(config: &Config) -> Result<Self, BotError> {
        config.validate()?;
        let token = config.token()?;

        let mut adapter = TelegramAdapter::new(token)
            .with_api_endpoint(&config.telegram.api_endpoint)
            .with_debug(config.telegram.debug);
        adapter.fetch_bot_info().await?;
        tracing::info!("Authorized as @{}", adapter.bot_info().username);

        let store = Arc::new(Database::open(&config.storage.path)?);
        tracing::info!("Database opened at {}", config.storage.path.display());

        let adapter = Arc::new(adapter);
        let (sender, stream) = updates::channel(updates::UPDATE_BUFFER);
        let parser = MessageParser::new(COMMAND_PREFIX);

        let instance = Self::launch(
            config,
            Collaborators {
                bot: adapter.clone(),
                store,
                updates: stream,
                producer: None,
            },
        )?;

        if let Err(e) = adapter.register_commands(&instance.command_descriptions()).await {
            tracing::warn!("Failed to register commands: {}", e);
        }

        let producer = UpdatePoller::new(adapter, parser, config.telegram.poll_timeout).spawn(sender);
        instance.attach_producer(producer);

        tracing::info!("Successfully started Telegram bot");
        Ok(instance)
    }

    /// Wires the core around already-built collaborators and starts the
    /// dispatch workers. Must run inside a Tokio runtime.
    pub fn launch(config: &Config, parts: Collaborators) -> Result<Self, BotError> {
        config.validate()?;

        let shutdown = ShutdownSignal::new();
        let (bridge_tx, bridge_rx) = bridge::channel(shutdown.clone());

        let users = Arc::new(UserManager::new(Arc::clone(&parts.store), bridge_tx.clone()));
        users.load_all_connected_users()?;

        let max_sub_data_count = config.max_sub_data_count();
        let service = BridgeService::new(
            Arc::clone(&parts.bot),
            Arc::clone(&users),
            Self::commands(&users, max_sub_data_count),
            max_sub_data_count,
        );

        let barrier = CompletionBarrier::new();
        let pool = DispatchPool::new(config.worker_count());
        pool.spawn(
            WorkerContext {
                updates: parts.updates.clone(),
                bridge: bridge_rx,
                shutdown: shutdown.clone(),
                handler: Arc::new(service),
            },
            &barrier,
        );

        Ok(Self {
            bot: parts.bot,
            store: parts.store,
            updates: parts.updates,
            bridge: bridge_tx,
            users,
            barrier,
            shutdown,
            lifecycle: Lifecycle::new(),
            stats: pool.stats(),
            workers: pool.workers(),
            max_sub_data_count,
            producer: Mutex::new(parts.producer),
        })
    }

    fn commands(users: &Arc<UserManager>, history_limit: usize) -> CommandService {
        let mut commands = CommandService::new(COMMAND_PREFIX);
        commands.register_defaults();
        commands.register_subscription_commands(Arc::clone(users), history_limit);
        commands
    }

    fn command_descriptions(&self) -> Vec<(String, String)> {
        Self::commands(&self.users, self.max_sub_data_count).descriptions()
    }

    fn attach_producer(&self, producer: JoinHandle<()>) {
        let mut slot = self.producer.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(producer);
    }

    /// Stops intake and signals the workers. Call once; a repeated call is
    /// reported as [`ShutdownError::AlreadyClosed`] and changes nothing.
    pub fn shutdown(&self) -> Result<(), ShutdownError> {
        if !self.lifecycle.transition(LifecycleState::Running, LifecycleState::Stopping) {
            tracing::error!("Shutdown requested while {:?}: signal already closed", self.lifecycle.get());
            return Err(ShutdownError::AlreadyClosed);
        }
        tracing::info!("Bot received shutdown signal, closing all {} workers", self.workers);

        self.updates.stop_receiving();
        self.shutdown.close()
    }

    /// Blocks until every worker has exited, then releases owned resources.
    pub async fn wait(&self) {
        self.barrier.wait().await;
        tracing::info!(
            "All workers stopped ({} updates, {} subscription messages, {} failures, {} panics)",
            self.stats.updates(),
            self.stats.subscription_messages(),
            self.stats.failures(),
            self.stats.panics()
        );

        let producer = self.producer.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(producer) = producer {
            if !self.updates.is_stopping() {
                self.updates.stop_receiving();
            }
            if let Err(e) = producer.await {
                tracing::error!("Update producer ended abnormally: {}", e);
            }
        }

        if self.lifecycle.finish() {
            match self.store.close() {
                Ok(()) => tracing::info!("Database connection closed"),
                Err(e) => tracing::error!("Failed to close database: {}", e),
            }
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.get()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Registered workers not yet exited
    pub fn active_workers(&self) -> usize {
        self.barrier.outstanding()
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    pub fn users(&self) -> &Arc<UserManager> {
        &self.users
    }

    /// Write side of the subscription bridge for MQTT producers
    pub fn bridge(&self) -> BridgeSender {
        self.bridge.clone()
    }

    pub fn bot(&self) -> &Arc<dyn Bot> {
        &self.bot
    }

    pub fn max_sub_data_count(&self) -> usize {
        self.max_sub_data_count
    }

    /// Completes when every worker has exited, whatever the reason.
    pub async fn workers_finished(&self) {
        self.barrier.wait().await
    }
}
