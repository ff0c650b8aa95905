//! Dispatch pool.
//!
//! N workers drain the shared update stream and the subscription bridge.
//! Every loop iteration races three sources:
//!
//! - the next update
//! - the next bridge message
//! - the shutdown signal
//!
//! `tokio::select!` picks uniformly among ready branches, so neither source
//! can starve the other. A unit of work runs to completion before the worker
//! looks at the signal again. There is no ordering across workers.
//!
//! A worker exits when the signal closes or when the update stream ends.
//! Failures and panics in the handler are logged and counted; the worker
//! keeps going.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::application::errors::BotError;
use crate::domain::traits::UpdateHandler;
use crate::runtime::barrier::{CompletionBarrier, WorkerGuard};
use crate::runtime::bridge::BridgeReceiver;
use crate::runtime::shutdown::ShutdownSignal;
use crate::runtime::updates::UpdateStream;

/// Everything a worker needs; cloned once per worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub updates: UpdateStream,
    pub bridge: BridgeReceiver,
    pub shutdown: ShutdownSignal,
    pub handler: Arc<dyn UpdateHandler>,
}

/// Counters shared by all workers of a pool.
#[derive(Debug, Default)]
pub struct PoolStats {
    updates: AtomicU64,
    subscription_messages: AtomicU64,
    failures: AtomicU64,
    panics: AtomicU64,
}

impl PoolStats {
    /// Inbound updates handled (successfully or not)
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    /// Bridge messages handled (successfully or not)
    pub fn subscription_messages(&self) -> u64 {
        self.subscription_messages.load(Ordering::Relaxed)
    }

    /// Units whose handler returned an error
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Units whose handler panicked
    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }
}

/// Fixed-size pool of dispatch workers.
pub struct DispatchPool {
    workers: usize,
    stats: Arc<PoolStats>,
}

impl DispatchPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Registers every worker with `barrier`, then spawns them.
    pub fn spawn(&self, ctx: WorkerContext, barrier: &CompletionBarrier) -> Vec<JoinHandle<()>> {
        tracing::info!("Running {} dispatch workers", self.workers);

        (0..self.workers)
            .map(|id| {
                let guard = barrier.register();
                let ctx = ctx.clone();
                let stats = Arc::clone(&self.stats);
                tokio::spawn(run_worker(id, ctx, stats, guard))
            })
            .collect()
    }
}

async fn run_worker(id: usize, ctx: WorkerContext, stats: Arc<PoolStats>, _guard: WorkerGuard) {
    tracing::debug!("Worker {} started", id);
    let mut bridge_open = true;

    loop {
        tokio::select! {
            _ = ctx.shutdown.closed() => {
                tracing::debug!("Worker {} observed shutdown", id);
                break;
            }
            update = ctx.updates.recv() => match update {
                Some(update) => {
                    stats.updates.fetch_add(1, Ordering::Relaxed);
                    let label = format!("update {} from chat {}", update.id, update.chat_id);
                    isolate(id, &label, &stats, ctx.handler.handle_update(update)).await;
                }
                None => {
                    tracing::info!("Worker {}: update stream closed", id);
                    break;
                }
            },
            message = ctx.bridge.recv(), if bridge_open => match message {
                Some(message) => {
                    stats.subscription_messages.fetch_add(1, Ordering::Relaxed);
                    let label = format!("subscription message {} for chat {}", message.topic, message.chat_id);
                    isolate(id, &label, &stats, ctx.handler.handle_subscription(message)).await;
                }
                None => {
                    tracing::debug!("Worker {}: subscription bridge closed", id);
                    bridge_open = false;
                }
            },
        }
    }

    tracing::debug!("Worker {} stopped", id);
}

/// Runs one unit of work, containing both errors and panics.
async fn isolate<F>(worker: usize, label: &str, stats: &PoolStats, work: F)
where
    F: Future<Output = Result<(), BotError>>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            stats.failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!("Worker {} failed on {}: {}", worker, label, e);
        }
        Err(panic) => {
            stats.panics.fetch_add(1, Ordering::Relaxed);
            tracing::error!("Worker {} panicked on {}: {}", worker, label, panic_message(&*panic));
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
