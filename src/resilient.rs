//! Resilient processor (C6): C4 plus automatic session recovery.
//!
//! Grounded on [`crate::processor::CommandProcessor`], reusing its
//! per-command protocol ([`crate::processor::run_one`],
//! [`crate::processor::finish_terminal`]) rather than duplicating the state
//! machine. What C6 adds on top: commands are visible to
//! status queries the instant they're enqueued (not only once picked up),
//! a "session lost" outcome triggers C5 before giving up, and
//! `getCommandResult` always awaits `completion` directly so a later cache
//! eviction can never hide the first authoritative answer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cache::ResultCache;
use crate::debugger_session::DebuggerSession;
use crate::error::{BridgeError, Result};
use crate::notify::{methods, NotificationSink};
use crate::processor::{self, Outcome};
use crate::queue::{CommandQueue, CommandQueueReceiver};
use crate::recovery::{RecoveryManager, SessionRestarter};
use crate::tracker::CommandTracker;
use crate::types::{CommandResult, CommandState, QueuedCommand};

/// Restarts a [`DebuggerSession`] against the fixed target/args it was
/// originally started with. Owned by the session wiring, not by C6 itself,
/// since only the session knows what it was started against.
pub struct DebuggerRestarter {
    session: Arc<DebuggerSession>,
    target: String,
    args: Vec<String>,
}

impl DebuggerRestarter {
    #[must_use]
    pub fn new(session: Arc<DebuggerSession>, target: String, args: Vec<String>) -> Self {
        Self {
            session,
            target,
            args,
        }
    }
}

#[async_trait]
impl SessionRestarter for DebuggerRestarter {
    async fn restart(&self) -> bool {
        self.session.start(&self.target, &self.args).await.is_ok()
    }
}

/// Resilient, recovering command processor (C6).
pub struct ResilientProcessor {
    executor: Arc<DebuggerSession>,
    cache: Arc<ResultCache>,
    tracker: Arc<CommandTracker>,
    notify: NotificationSink,
    recovery: Arc<RecoveryManager>,
    restarter: Arc<dyn SessionRestarter>,
    queue: CommandQueue,
    heartbeat_interval: Duration,
    command_timeout: Duration,
    shutdown: CancellationToken,
}

impl ResilientProcessor {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: Arc<DebuggerSession>,
        cache: Arc<ResultCache>,
        tracker: Arc<CommandTracker>,
        notify: NotificationSink,
        recovery: Arc<RecoveryManager>,
        restarter: Arc<dyn SessionRestarter>,
        queue: CommandQueue,
        heartbeat_interval: Duration,
        command_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            executor,
            cache,
            tracker,
            notify,
            recovery,
            restarter,
            queue,
            heartbeat_interval,
            command_timeout,
            shutdown,
        }
    }

    /// Enqueue and immediately register in the tracker, so a poll right
    /// after `enqueue` returns already sees the command.
    pub async fn enqueue(&self, text: impl Into<String>) -> Result<Arc<QueuedCommand>> {
        let command = self.queue.enqueue(text).await?;
        self.tracker.insert(command.clone());
        self.notify.notify(
            methods::COMMAND_STATUS,
            serde_json::json!({"id": command.id, "state": CommandState::Queued}),
        );
        Ok(command)
    }

    /// Await the command's authoritative result directly, not the cache.
    /// Unknown ids are a caller error.
    pub async fn command_result(&self, id: &str) -> Result<CommandResult> {
        let command = self
            .tracker
            .get(id)
            .ok_or_else(|| BridgeError::NotFound(format!("unknown command id: {id}")))?;
        Ok(command.result().await)
    }

    /// Cancel every currently tracked command, returning how many were
    /// signalled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let ids = self.tracker.snapshot_ids();
        let mut count = 0;
        for id in &ids {
            if let Some(command) = self.tracker.get(id) {
                if !command.cancel_signal.is_cancelled() {
                    command.cancel_signal.cancel();
                    count += 1;
                }
            }
        }
        self.notify.notify(
            methods::SESSION_EVENT,
            serde_json::json!({"event": "cancelAll", "reason": reason, "count": count}),
        );
        count
    }

    /// Cancel a single command by id; delegates to the same synchronous
    /// completion behavior as C4's `cancel`.
    pub fn cancel(&self, id: &str) -> bool {
        let Some(command) = self.tracker.get(id) else {
            return false;
        };
        if command.cancel_signal.is_cancelled() {
            return true;
        }
        command.cancel_signal.cancel();

        let is_executing = self
            .tracker
            .current()
            .is_some_and(|current| current.id == id);
        if !is_executing {
            let result = CommandResult::failure(
                "Command was cancelled before execution".to_string(),
                Duration::ZERO,
            );
            command.complete(result);
            self.tracker.record_cancelled();
            self.tracker.try_remove(id);
            self.notify.notify(
                methods::COMMAND_STATUS,
                serde_json::json!({"id": id, "state": CommandState::Cancelled}),
            );
        }
        true
    }

    /// Drain the queue until it closes or shutdown fires, recovering from
    /// session loss between attempts at a single command.
    pub async fn run(&self, mut receiver: CommandQueueReceiver) {
        loop {
            let next = tokio::select! {
                () = self.shutdown.cancelled() => None,
                cmd = receiver.recv() => cmd,
            };

            let Some(command) = next else { break };

            // `enqueue` may already have inserted this command; re-insert is
            // a harmless overwrite if some external caller built the queue
            // directly instead of going through `Self::enqueue`.
            self.tracker.insert(command.clone());
            self.tracker.set_current(Some(command.clone()));
            self.notify.notify(
                methods::COMMAND_STATUS,
                serde_json::json!({"id": command.id, "state": CommandState::Executing}),
            );

            let start = Instant::now();
            let outcome = self.run_with_recovery(&command).await;

            processor::finish_terminal(
                &command,
                outcome,
                &self.cache,
                &self.tracker,
                &self.notify,
                command.queue_time,
                start,
            );
        }

        for id in self.tracker.snapshot_ids() {
            if let Some(command) = self.tracker.try_remove(&id) {
                if !command.is_completed() {
                    let result = CommandResult::failure(
                        "Command cancelled due to service shutdown".to_string(),
                        Duration::ZERO,
                    );
                    command.complete(result);
                    self.tracker.record_cancelled();
                }
            }
        }
    }

    /// Run one command, retrying exactly once more per `shouldAttempt` if
    /// the failure is classified as "session lost" -- attempt budget 2,
    /// the original attempt plus one retry after recovery.
    async fn run_with_recovery(&self, command: &QueuedCommand) -> Outcome {
        loop {
            let outcome = processor::run_one(
                command,
                self.executor.as_ref(),
                &self.notify,
                self.heartbeat_interval,
                self.command_timeout,
                &self.shutdown,
            )
            .await;

            let Outcome::SessionLost(err) = outcome else {
                return outcome;
            };

            if !self.recovery.should_attempt() {
                return Outcome::Failed(err);
            }

            let recovered = self
                .recovery
                .recover(
                    self.executor.as_ref(),
                    self.restarter.as_ref(),
                    &err.to_string(),
                    &[command.id.clone()],
                )
                .await;

            if !recovered {
                return Outcome::Failed(err);
            }
            // Loop once more with the now-restarted session.
        }
    }
}
