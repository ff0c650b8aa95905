//! Runtime - dispatch and shutdown coordination
//!
//! - Updates: shared inbound update stream
//! - Bridge: rendezvous handoff for subscription messages
//! - Pool: dispatch workers racing both sources against shutdown
//! - Barrier / Shutdown: completion tracking and the broadcast-once signal
//! - Instance: the wired bot and its shutdown sequence

pub mod barrier;
pub mod bridge;
pub mod instance;
pub mod pool;
pub mod shutdown;
pub mod signals;
pub mod updates;

pub use barrier::{CompletionBarrier, WorkerGuard};
pub use bridge::{BridgeReceiver, BridgeSender};
pub use instance::{BotInstance, Collaborators};
pub use pool::{DispatchPool, PoolStats, WorkerContext};
pub use shutdown::{LifecycleState, ShutdownSignal};
pub use updates::{UpdateSender, UpdateStream};
