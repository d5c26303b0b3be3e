//! Bounded per-session command queue.
//!
//! A single `tokio::mpsc` channel feeding the single-consumer processor,
//! with a disposed flag so enqueue fails loudly once the
//! session is torn down rather than silently dropping work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{BridgeError, Result};
use crate::types::QueuedCommand;

/// Producer handle: any number of callers may enqueue concurrently.
#[derive(Clone)]
pub struct CommandQueue {
    sender: mpsc::Sender<Arc<QueuedCommand>>,
    disposed: Arc<AtomicBool>,
}

/// Consumer handle: owned exclusively by the processor task.
pub struct CommandQueueReceiver {
    receiver: mpsc::Receiver<Arc<QueuedCommand>>,
}

#[must_use]
pub fn channel(capacity: usize) -> (CommandQueue, CommandQueueReceiver) {
    let (sender, receiver) = mpsc::channel(capacity);
    (
        CommandQueue {
            sender,
            disposed: Arc::new(AtomicBool::new(false)),
        },
        CommandQueueReceiver { receiver },
    )
}

impl CommandQueue {
    /// Enqueue raw command text, returning the generated id. Rejects
    /// empty/whitespace text and disposed queues.
    pub async fn enqueue(&self, text: impl Into<String>) -> Result<Arc<QueuedCommand>> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(BridgeError::InvalidArgument(
                "command text must not be empty".to_string(),
            ));
        }
        if self.disposed.load(Ordering::Acquire) {
            return Err(BridgeError::Disposed);
        }

        let id = Uuid::new_v4().to_string();
        let command = Arc::new(QueuedCommand::new(id, text, Instant::now()));

        self.sender
            .send(command.clone())
            .await
            .map_err(|_| BridgeError::Disposed)?;

        Ok(command)
    }

    /// Reject further enqueues. Idempotent.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl CommandQueueReceiver {
    pub async fn recv(&mut self) -> Option<Arc<QueuedCommand>> {
        self.receiver.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_rejects_empty_text() {
        let (queue, _rx) = channel(8);
        let err = queue.enqueue("   ").await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn enqueue_after_dispose_is_rejected() {
        let (queue, _rx) = channel(8);
        queue.dispose();
        let err = queue.enqueue("lm").await.unwrap_err();
        assert!(matches!(err, BridgeError::Disposed));
    }

    #[tokio::test]
    async fn enqueued_commands_are_received_in_order() {
        let (queue, mut rx) = channel(8);
        let a = queue.enqueue("a").await.unwrap();
        let b = queue.enqueue("b").await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.id, a.id);
        assert_eq!(second.id, b.id);
    }
}
