//! Command processor (C4): the single consumer that drives queued commands
//! through the debugger one at a time.
//!
//! Await a unit of work with an optional timeout, cache the result, make it
//! queryable afterward, in a persistent loop pulling from [`CommandQueue`]
//! so the debugger session is never touched by more than one task -- this
//! single-consumer channel is what serializes access to it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cache::ResultCache;
use crate::error::Result;
use crate::notify::{methods, NotificationSink};
use crate::queue::CommandQueueReceiver;
use crate::tracker::CommandTracker;
use crate::types::{CachedResultMeta, CommandResult, CommandState, QueuedCommand};

/// Anything that can run a debugger command to completion (or cancellation)
/// against the live session. [`crate::debugger_session::DebuggerSession`]
/// implements this directly; [`crate::resilient::RecoveringExecutor`] wraps
/// it with retry-on-session-loss (C6 over C4).
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str, cancel: CancellationToken) -> Result<String>;
}

/// How a single command's terminal outcome was decided, so the caller
/// (plain C4 vs. C6's retry wrapper) can react -- e.g. C6 treats
/// `SessionLost` as a trigger for recovery rather than a final `Failed`.
pub enum Outcome {
    Success(String),
    Cancelled(&'static str),
    Timeout,
    SessionLost(crate::error::BridgeError),
    Failed(crate::error::BridgeError),
}

/// Run one command to its terminal outcome against `executor`: transition to
/// `Executing`, start a heartbeat, build the linked cancellation, call the
/// executor. Does not cache or transition past `Executing` -- callers (the
/// plain loop or C6's retry wrapper) decide how to interpret [`Outcome`]
/// and finish the job via [`finish_terminal`].
pub async fn run_one<E: CommandExecutor + ?Sized>(
    command: &QueuedCommand,
    executor: &E,
    notify: &NotificationSink,
    heartbeat_interval: Duration,
    command_timeout: Duration,
    shutdown: &CancellationToken,
) -> Outcome {
    let start = Instant::now();

    let heartbeat_cancel = CancellationToken::new();
    let heartbeat_task = {
        let id = command.id.clone();
        let notify = notify.clone();
        let cancel = heartbeat_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(heartbeat_interval) => {
                        notify.notify(
                            methods::COMMAND_HEARTBEAT,
                            serde_json::json!({
                                "id": id,
                                "elapsedMs": start.elapsed().as_millis(),
                                "elapsedDisplay": crate::notify::format_elapsed_display(start.elapsed()),
                            }),
                        );
                    }
                }
            }
        })
    };

    let linked = shutdown.child_token();
    let timeout_future = tokio::time::sleep(command_timeout);
    tokio::pin!(timeout_future);

    let exec_result = tokio::select! {
        biased;
        () = command.cancel_signal.cancelled() => {
            heartbeat_cancel.cancel();
            let _ = heartbeat_task.await;
            return Outcome::Cancelled("Command was cancelled by user request");
        }
        () = linked.cancelled() => {
            heartbeat_cancel.cancel();
            let _ = heartbeat_task.await;
            return Outcome::Cancelled("Command cancelled due to service shutdown");
        }
        () = &mut timeout_future => {
            heartbeat_cancel.cancel();
            let _ = heartbeat_task.await;
            return Outcome::Timeout;
        }
        r = executor.execute(&command.text, command.cancel_signal.clone()) => r,
    };

    heartbeat_cancel.cancel();
    let _ = heartbeat_task.await;

    match exec_result {
        Ok(output) => Outcome::Success(output),
        Err(e) if e.is_session_lost() => Outcome::SessionLost(e),
        Err(e) => Outcome::Failed(e),
    }
}

/// Build the `CommandResult` + cache metadata for a terminal outcome and
/// store it, then update the tracker's counters and remove the command
/// from the live map. The result is always cached before the command is
/// removed from the tracker, so a late poll still finds it.
pub fn finish_terminal(
    command: &QueuedCommand,
    outcome: Outcome,
    cache: &ResultCache,
    tracker: &CommandTracker,
    notify: &NotificationSink,
    queue_time: Instant,
    start: Instant,
) {
    let end_time = Instant::now();
    let elapsed = end_time.duration_since(start);

    let (state, result) = match outcome {
        Outcome::Success(output) => {
            let result = CommandResult::success(output, elapsed);
            (CommandState::Completed, result)
        }
        Outcome::Cancelled(message) => {
            let mut result = CommandResult::failure(message.to_string(), elapsed);
            result.success = false;
            (CommandState::Cancelled, result)
        }
        Outcome::Timeout => {
            let minutes = elapsed.as_secs_f64() / 60.0;
            let result = CommandResult::failure(
                format!("Command timed out after {minutes:.1} minutes"),
                elapsed,
            );
            (CommandState::Failed, result)
        }
        Outcome::SessionLost(e) | Outcome::Failed(e) => {
            let result =
                CommandResult::failure(format!("Command execution failed: {e}"), elapsed);
            (CommandState::Failed, result)
        }
    };

    // start/end for stats come from the actual measured execution window,
    // never from `queueTime`.
    let start_time = end_time - elapsed;
    let meta = CachedResultMeta {
        original_command: command.text.clone(),
        queue_time,
        start_time,
        end_time,
    };

    cache.store(command.id.clone(), result.clone(), meta);
    command.complete(result);

    match state {
        CommandState::Completed => tracker.record_completed(),
        CommandState::Cancelled => tracker.record_cancelled(),
        _ => tracker.record_failed(),
    }

    notify.notify(
        methods::COMMAND_STATUS,
        serde_json::json!({
            "id": command.id,
            "state": state,
            "queueWaitMs": start.duration_since(queue_time).as_millis(),
            "executionMs": elapsed.as_millis(),
            "totalMs": end_time.duration_since(queue_time).as_millis(),
        }),
    );

    tracker.try_remove(&command.id);
    tracker.set_current(None);
}

/// The plain C4 loop: no recovery, one command at a time, runs until the
/// queue closes or shutdown fires.
pub struct CommandProcessor<E: CommandExecutor> {
    executor: Arc<E>,
    cache: Arc<ResultCache>,
    tracker: Arc<CommandTracker>,
    notify: NotificationSink,
    heartbeat_interval: Duration,
    command_timeout: Duration,
    shutdown: CancellationToken,
}

impl<E: CommandExecutor + 'static> CommandProcessor<E> {
    #[must_use]
    pub fn new(
        executor: Arc<E>,
        cache: Arc<ResultCache>,
        tracker: Arc<CommandTracker>,
        notify: NotificationSink,
        heartbeat_interval: Duration,
        command_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            executor,
            cache,
            tracker,
            notify,
            heartbeat_interval,
            command_timeout,
            shutdown,
        }
    }

    /// Drain the queue until it closes or shutdown fires. Per-command
    /// exceptions never stop the loop.
    pub async fn run(&self, mut receiver: CommandQueueReceiver) {
        loop {
            let next = tokio::select! {
                () = self.shutdown.cancelled() => None,
                cmd = receiver.recv() => cmd,
            };

            let Some(command) = next else { break };

            self.tracker.insert(command.clone());
            self.tracker.set_current(Some(command.clone()));
            self.notify.notify(
                methods::COMMAND_STATUS,
                serde_json::json!({"id": command.id, "state": CommandState::Executing}),
            );

            let start = Instant::now();
            let outcome = run_one(
                &command,
                self.executor.as_ref(),
                &self.notify,
                self.heartbeat_interval,
                self.command_timeout,
                &self.shutdown,
            )
            .await;

            finish_terminal(
                &command,
                outcome,
                &self.cache,
                &self.tracker,
                &self.notify,
                command.queue_time,
                start,
            );
        }

        // Anything still tracked at shutdown is completed as cancelled.
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

    /// Cancel a command by id. Returns `false` iff the id is
    /// unknown; a no-op `true` if already cancelled. If the command has not
    /// yet been picked up by the loop (it isn't the tracker's `current`
    /// slot), it is completed synchronously here rather than left for the
    /// loop to notice -- there is no heartbeat task or executor call racing
    /// against it yet.
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
        }
        true
    }
}

/// Collected, non-completing view of the tracker's live commands plus
/// their elapsed/position, used by external collaborators for
/// `getQueueStatus`. Ordered by real enqueue sequence (`QueuedCommand::seq`),
/// not `snapshot_ids()`'s unordered `DashMap` iteration, so a caller taking
/// `position()` over the `"queued"` entries gets a reliable FIFO index. The
/// tracker's `current()` slot is consulted so the one command actually
/// executing is labelled `"executing"` rather than lumped in with `"queued"`.
#[must_use]
pub fn queue_status(tracker: &CommandTracker) -> Vec<(String, String, Instant, &'static str)> {
    let current_id = tracker.current().map(|cmd| cmd.id.clone());

    let mut commands: Vec<_> = tracker
        .snapshot_ids()
        .into_iter()
        .filter_map(|id| tracker.get(&id))
        .collect();
    commands.sort_by_key(|cmd| cmd.seq);

    commands
        .into_iter()
        .map(|cmd| {
            let label = if cmd.is_completed() {
                "completed"
            } else if current_id.as_deref() == Some(cmd.id.as_str()) {
                "executing"
            } else {
                "queued"
            };
            (cmd.id.clone(), cmd.text.clone(), cmd.queue_time, label)
        })
        .collect()
}
