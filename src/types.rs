//! Core data model: results, lifecycle state, and the shared-completion
//! handle threaded between the queue, processor, and callers awaiting a
//! command's outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// A single value in a [`CommandResult`]'s side-channel data map.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum DataValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

/// Lifecycle state of a queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Queued,
    Executing,
    Completed,
    Cancelled,
    Failed,
}

impl CommandState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Completed | CommandState::Cancelled | CommandState::Failed
        )
    }
}

/// Immutable result of a completed command execution.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub output: String,
    pub error_message: Option<String>,
    pub duration: Duration,
    pub data: HashMap<String, DataValue>,
}

impl CommandResult {
    #[must_use]
    pub fn success(output: String, duration: Duration) -> Self {
        Self {
            success: true,
            output,
            error_message: None,
            duration,
            data: HashMap::new(),
        }
    }

    #[must_use]
    pub fn failure(error_message: String, duration: Duration) -> Self {
        Self {
            success: false,
            output: String::new(),
            error_message: Some(error_message),
            duration,
            data: HashMap::new(),
        }
    }
}

/// Metadata captured alongside a [`CommandResult`] when it is cached.
#[derive(Debug, Clone)]
pub struct CachedResultMeta {
    pub original_command: String,
    pub queue_time: Instant,
    pub start_time: Instant,
    pub end_time: Instant,
}

/// A completed result plus bookkeeping, as held by the result cache (C2).
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub result: CommandResult,
    pub created_at: Instant,
    pub last_access_at: Instant,
    pub meta: CachedResultMeta,
}

/// External, read-only view of a queued/executing command (for status
/// queries and `getQueueStatus`).
#[derive(Debug, Clone, Serialize)]
pub struct CommandInfo {
    pub id: String,
    pub text: String,
    pub state: CommandState,
    #[serde(skip)]
    pub queue_time: Instant,
    pub elapsed: Duration,
    pub remaining: Option<Duration>,
    pub queue_position: Option<usize>,
    pub is_completed: bool,
}

/// Global monotonic counter backing `QueuedCommand::seq`. A `DashMap`'s
/// iteration order tracks nothing about enqueue order, so `tracker`
/// readers that need real FIFO position (queue status, `queue_position`)
/// sort by this instead.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

/// A command that has been placed on a session's queue.
///
/// `completion` is a single-shot value broadcast over a `watch` channel so
/// that any number of callers (the original submitter, a late poller, an
/// extension callback) can await the same terminal result: exactly one
/// producer, any number of consumers.
pub struct QueuedCommand {
    pub id: String,
    pub text: String,
    pub queue_time: Instant,
    /// Monotonically increasing enqueue order, independent of `queue_time`'s
    /// clock resolution and of the tracker's unordered map iteration.
    pub seq: u64,
    pub cancel_signal: CancellationToken,
    completion_set: tokio::sync::watch::Sender<Option<CommandResult>>,
    completion_rx: tokio::sync::watch::Receiver<Option<CommandResult>>,
}

impl QueuedCommand {
    #[must_use]
    pub fn new(id: String, text: String, queue_time: Instant) -> Self {
        let (tx, rx) = tokio::sync::watch::channel(None);
        Self {
            id,
            text,
            queue_time,
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            cancel_signal: CancellationToken::new(),
            completion_set: tx,
            completion_rx: rx,
        }
    }

    /// Complete this command's result. A second call is a documented no-op:
    /// `completion` is set at most once.
    pub fn complete(&self, result: CommandResult) {
        self.completion_set.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        });
    }

    /// Await the terminal result. Multiple callers may await independently.
    pub async fn result(&self) -> CommandResult {
        let mut rx = self.completion_rx.clone();
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                // The sender lives on `self`, so this only fires if `self`
                // is being dropped concurrently; fall back to whatever was
                // last observed rather than spinning.
                return rx
                    .borrow()
                    .clone()
                    .unwrap_or_else(|| CommandResult::failure("command was dropped".into(), Duration::ZERO));
            }
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completion_rx.borrow().is_some()
    }
}
