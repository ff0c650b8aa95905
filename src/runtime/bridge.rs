//! Subscription bridge: the handoff between the MQTT side and the dispatch
//! workers.
//!
//! The bridge is unbuffered in effect. [`BridgeSender::send`] returns only
//! once a worker has taken the message, or fails when shutdown preempts the
//! handoff. Each message carries a oneshot ack; a worker processes a message
//! only if its ack reaches a sender that is still waiting, so a message is
//! either handled by exactly one worker or reported as not delivered.
//!
//! ```text
//!  MQTT callback ──send──► [slot] ──recv──► worker
//!        ▲                                   │
//!        └──────────────── ack ──────────────┘
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::application::errors::BridgeError;
use crate::domain::entities::SubscriptionMessage;
use crate::runtime::shutdown::ShutdownSignal;

struct Envelope {
    message: SubscriptionMessage,
    ack: oneshot::Sender<()>,
}

/// Creates the bridge. Sends race against `shutdown`.
pub fn channel(shutdown: ShutdownSignal) -> (BridgeSender, BridgeReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (
        BridgeSender { tx, shutdown },
        BridgeReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// Write side, cloned into every MQTT-facing producer.
#[derive(Clone)]
pub struct BridgeSender {
    tx: mpsc::Sender<Envelope>,
    shutdown: ShutdownSignal,
}

impl BridgeSender {
    /// Hands `message` to one consumer.
    ///
    /// Blocks until a worker accepts it. Fails with
    /// [`BridgeError::ShuttingDown`] if the shutdown signal closes first, and
    /// with [`BridgeError::Closed`] if every receiver is gone.
    pub async fn send(&self, message: SubscriptionMessage) -> Result<(), BridgeError> {
        if self.shutdown.is_closed() {
            return Err(BridgeError::ShuttingDown);
        }

        let (ack, mut accepted) = oneshot::channel();
        let envelope = Envelope { message, ack };

        tokio::select! {
            biased;
            _ = self.shutdown.closed() => return Err(BridgeError::ShuttingDown),
            res = self.tx.send(envelope) => res.map_err(|_| BridgeError::Closed)?,
        }

        tokio::select! {
            biased;
            res = &mut accepted => res.map_err(|_| BridgeError::Closed),
            _ = self.shutdown.closed() => {
                // a worker may have acked between the two polls
                accepted.close();
                match accepted.try_recv() {
                    Ok(()) => Ok(()),
                    Err(_) => Err(BridgeError::ShuttingDown),
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Read side, shared by the dispatch workers.
#[derive(Clone)]
pub struct BridgeReceiver {
    rx: Arc<Mutex<mpsc::Receiver<Envelope>>>,
}

impl BridgeReceiver {
    /// Takes the next message whose sender is still waiting for it.
    /// `None` once every sender is dropped.
    ///
    /// Cancel-safe: acking happens right after the receive with no await in
    /// between.
    pub async fn recv(&self) -> Option<SubscriptionMessage> {
        let mut rx = self.rx.lock().await;
        loop {
            let Envelope { message, ack } = rx.recv().await?;
            if ack.send(()).is_ok() {
                return Some(message);
            }
            tracing::debug!("Dropping abandoned subscription message for chat {}", message.chat_id);
        }
    }
}
