//! Inbound update stream.
//!
//! One producer (the long-polling loop) pushes updates into a bounded
//! buffer; any number of dispatch workers pull from the same
//! [`UpdateStream`]. Each update is taken by exactly one worker.
//!
//! [`UpdateStream::stop_receiving`] asks the producer to stop. Updates already
//! buffered stay readable; once the producer drops its [`UpdateSender`] and
//! the buffer is empty, [`UpdateStream::recv`] returns `None`.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::domain::entities::Message;

/// Buffered updates between the poller and the workers
pub const UPDATE_BUFFER: usize = 100;

/// Creates a linked producer/consumer pair.
pub fn channel(capacity: usize) -> (UpdateSender, UpdateStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stop = CancellationToken::new();
    (
        UpdateSender {
            tx,
            stop: stop.clone(),
        },
        UpdateStream {
            rx: Arc::new(Mutex::new(rx)),
            stop,
        },
    )
}

/// Returned by [`UpdateSender::send`] when the update was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRejected {
    /// `stop_receiving` was called
    Stopped,
    /// every stream handle is gone
    Closed,
}

/// Producer side, owned by the update source.
#[derive(Debug)]
pub struct UpdateSender {
    tx: mpsc::Sender<Message>,
    stop: CancellationToken,
}

impl UpdateSender {
    /// Pushes one update, waiting for buffer space. Gives up as soon as the
    /// stream is told to stop.
    pub async fn send(&self, update: Message) -> Result<(), SendRejected> {
        if self.stop.is_cancelled() {
            return Err(SendRejected::Stopped);
        }
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(SendRejected::Stopped),
            res = self.tx.send(update) => res.map_err(|_| SendRejected::Closed),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Completes when the consumers asked the producer to stop.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }
}

/// Consumer side, shared by all dispatch workers.
#[derive(Clone, Debug)]
pub struct UpdateStream {
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    stop: CancellationToken,
}

impl UpdateStream {
    /// Takes the next update. `None` means the producer is gone and the
    /// buffer is drained.
    ///
    /// Cancel-safe: if the future is dropped before completing, no update is
    /// lost.
    pub async fn recv(&self) -> Option<Message> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    /// Tells the producer to stop producing. Idempotent.
    pub fn stop_receiving(&self) {
        self.stop.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn buffered_updates_drain_after_stop() {
        let (tx, stream) = channel(4);
        tx.send(Message::from_text("1", "a")).await.unwrap();
        tx.send(Message::from_text("1", "b")).await.unwrap();

        stream.stop_receiving();
        assert!(tx.is_stopped());
        assert_eq!(tx.send(Message::from_text("1", "c")).await, Err(SendRejected::Stopped));
        drop(tx);

        assert_eq!(stream.recv().await.and_then(|m| m.content.text().map(String::from)), Some("a".to_string()));
        assert_eq!(stream.recv().await.and_then(|m| m.content.text().map(String::from)), Some("b".to_string()));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn blocked_send_is_released_by_stop() {
        let (tx, stream) = channel(1);
        tx.send(Message::from_text("1", "fills buffer")).await.unwrap();

        let producer = tokio::spawn(async move { tx.send(Message::from_text("1", "blocked")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        stream.stop_receiving();
        let res = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer stuck")
            .unwrap();
        assert_eq!(res, Err(SendRejected::Stopped));
    }

    #[tokio::test]
    async fn stopped_future_completes() {
        let (tx, stream) = channel(1);
        let waiter = tokio::spawn(async move { tx.stopped().await });
        stream.stop_receiving();
        stream.stop_receiving();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("stop not observed")
            .unwrap();
    }
}
