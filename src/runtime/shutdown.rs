//! Shutdown signal and lifecycle state.
//!
//! [`ShutdownSignal`] is a broadcast-once flag: any number of tasks can wait
//! on [`ShutdownSignal::closed`], and [`ShutdownSignal::close`] flips it
//! exactly once. A second close is reported as
//! [`ShutdownError::AlreadyClosed`] instead of passing silently.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::application::errors::ShutdownError;

/// Broadcast-once shutdown flag. Cheap to clone; all clones share state.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the signal. Only the first call succeeds.
    pub fn close(&self) -> Result<(), ShutdownError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ShutdownError::AlreadyClosed);
        }
        self.token.cancel();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the signal is set. Cancel-safe, usable in `select!`.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// Lifecycle of a bot instance: `Running -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LifecycleState::Running,
            1 => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }
}

/// Atomic holder for [`LifecycleState`]; transitions only move forward.
#[derive(Debug, Default)]
pub struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves from `from` to `to`. Returns false if the current state was not `from`.
    pub fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves to `Stopped` from any state. Returns false if already stopped.
    pub fn finish(&self) -> bool {
        self.0.swap(LifecycleState::Stopped as u8, Ordering::AcqRel) != LifecycleState::Stopped as u8
    }
}
