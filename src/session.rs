//! Session wiring: one `Session` bundles the queue, processor, cache,
//! tracker, and debugger session that make up a single debugger-backed
//! session; `BridgeManager` owns the map of live sessions.
//!
//! A map of live sessions, created on demand and torn down
//! explicitly. The core pipeline itself never creates a
//! `Session` -- `BridgeManager` is the outer collaborator that does.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::ResultCache;
use crate::config::BridgeConfig;
use crate::debugger_session::DebuggerSession;
use crate::error::{BridgeError, Result};
use crate::notify::NotificationSink;
use crate::processor::queue_status;
use crate::queue::CommandQueue;
use crate::recovery::RecoveryManager;
use crate::resilient::{DebuggerRestarter, ResilientProcessor};
use crate::tokens::ExtensionTokenRegistry;
use crate::tracker::CommandTracker;
use crate::types::{CachedResult, CommandInfo, CommandResult, CommandState};

/// A single debugger-backed session: the queue, the resilient processor
/// (C6, which subsumes C4), the result cache (C2), the command tracker
/// (C3), and the debugger session itself (C1), plus the recovery manager
/// (C5) that watches over the debugger.
///
/// Ownership: the session exclusively owns its queue,
/// processor, tracker, and debugger session; the cache is owned by the
/// session and shared by read with the tracker/processor.
pub struct Session {
    pub session_id: String,
    debugger: Arc<DebuggerSession>,
    queue: CommandQueue,
    processor: Arc<ResilientProcessor>,
    cache: Arc<ResultCache>,
    tracker: Arc<CommandTracker>,
    command_timeout: Duration,
    shutdown: CancellationToken,
    processor_task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Start a debugger session against `target`/`args` and spin up its
    /// queue + resilient processor. Returns once the debugger has started,
    /// bounded by the configured command timeout as an end-to-end deadline.
    pub async fn start(
        session_id: impl Into<String>,
        target: &str,
        args: Vec<String>,
        config: &BridgeConfig,
        notify: NotificationSink,
    ) -> Result<Arc<Self>> {
        let session_id = session_id.into();
        let debugger = Arc::new(DebuggerSession::new(
            config.debugger_path.clone(),
            config.command_timeout,
            config.stop_grace_period,
        ));
        debugger.start(target, &args).await?;

        let cache = Arc::new(ResultCache::new(config.cache.clone()));
        let tracker = Arc::new(CommandTracker::new());
        let recovery = Arc::new(RecoveryManager::new(config.recovery.clone(), notify.clone()));
        let restarter: Arc<dyn crate::recovery::SessionRestarter> =
            Arc::new(DebuggerRestarter::new(debugger.clone(), target.to_string(), args));
        let shutdown = CancellationToken::new();
        let (queue, receiver) = crate::queue::channel(config.queue_capacity);

        let processor = Arc::new(ResilientProcessor::new(
            debugger.clone(),
            cache.clone(),
            tracker.clone(),
            notify,
            recovery,
            restarter,
            queue.clone(),
            config.heartbeat_interval,
            config.command_timeout,
            shutdown.clone(),
        ));

        let task = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.run(receiver).await })
        };

        Ok(Arc::new(Self {
            session_id,
            debugger,
            queue,
            processor,
            cache,
            tracker,
            command_timeout: config.command_timeout,
            shutdown,
            processor_task: Mutex::new(Some(task)),
        }))
    }

    /// Enqueue a raw command, returning its id. Rejects empty/whitespace
    /// text and a disposed session.
    pub async fn enqueue(&self, command: impl Into<String>) -> Result<String> {
        let queued = self.processor.enqueue(command).await?;
        Ok(queued.id)
    }

    /// `cancel(id) -> bool`.
    #[must_use]
    pub fn cancel(&self, id: &str) -> bool {
        self.processor.cancel(id)
    }

    /// `cancelAll(reason?) -> count`.
    pub fn cancel_all(&self, reason: &str) -> usize {
        self.processor.cancel_all(reason)
    }

    /// Look up a command's current state. Checks the live tracker first, then
    /// falls back to the cache. A command cancelled before it was ever
    /// picked up is completed synchronously without being cached -- that
    /// path never entered `Executing`, so it is indistinguishable
    /// from "unknown" here -- callers that need its outcome should await
    /// `command_result`/`command_result_raw` instead, which always resolves
    /// from the completion channel regardless of tracker/cache presence.
    #[must_use]
    pub fn command_state(&self, id: &str) -> Option<CommandState> {
        if let Some(command) = self.tracker.get(id) {
            if command.is_completed() {
                return Some(CommandState::Completed);
            }
            let is_current = self
                .tracker
                .current()
                .is_some_and(|current| current.id == id);
            return Some(if is_current {
                CommandState::Executing
            } else {
                CommandState::Queued
            });
        }
        if self.cache.has(id) {
            return Some(CommandState::Completed);
        }
        None
    }

    /// `getCommandInfo(id) -> info?`.
    #[must_use]
    pub fn command_info(&self, id: &str) -> Option<CommandInfo> {
        let command = self.tracker.get(id)?;
        let elapsed = command.queue_time.elapsed();
        let is_current = self
            .tracker
            .current()
            .is_some_and(|current| current.id == id);
        let state = if command.is_completed() {
            CommandState::Completed
        } else if is_current {
            CommandState::Executing
        } else {
            CommandState::Queued
        };
        let remaining = if is_current {
            Some(self.command_timeout.saturating_sub(elapsed))
        } else {
            None
        };
        let queue_position = if state == CommandState::Queued {
            queue_status(&self.tracker)
                .into_iter()
                .filter(|(_, _, _, label)| *label == "queued")
                .position(|(queued_id, _, _, _)| queued_id == id)
        } else {
            None
        };
        Some(CommandInfo {
            id: command.id.clone(),
            text: command.text.clone(),
            state,
            queue_time: command.queue_time,
            elapsed,
            remaining,
            queue_position,
            is_completed: command.is_completed(),
        })
    }

    /// `getQueueStatus() -> [(id, text, queueTime, statusLabel)]`.
    #[must_use]
    pub fn queue_status(&self) -> Vec<(String, String, std::time::Instant, &'static str)> {
        queue_status(&self.tracker)
    }

    /// Await a command's final output, not the cache. Unknown ids fail with
    /// `NotFound`; a terminal non-success result is surfaced as an
    /// `Internal` error carrying the recorded message.
    pub async fn command_result(&self, id: &str) -> Result<String> {
        let result = self.command_result_raw(id).await?;
        if result.success {
            Ok(result.output)
        } else {
            Err(BridgeError::Internal(
                result
                    .error_message
                    .unwrap_or_else(|| "command did not succeed".to_string()),
            ))
        }
    }

    /// Await one terminal result (success or failure) directly, surfacing
    /// a `CommandResult` rather than collapsing failures into an error --
    /// used by the extension callback boundary, which needs the raw
    /// success/output/error triple.
    pub async fn command_result_raw(&self, id: &str) -> Result<CommandResult> {
        self.processor.command_result(id).await
    }

    /// `getCachedResultWithMetadata(id) -> cached?`.
    #[must_use]
    pub fn cached_result_with_metadata(&self, id: &str) -> Option<CachedResult> {
        self.cache.get_with_metadata(id)
    }

    #[must_use]
    pub fn cache_statistics(&self) -> crate::cache::CacheStatistics {
        self.cache.statistics()
    }

    #[must_use]
    pub fn counters(&self) -> crate::tracker::TrackerCounters {
        self.tracker.counters()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.queue.is_disposed()
    }

    /// Dispose this session: signal shutdown, reject
    /// further enqueues, wait up to 10s for the processor task, then tear
    /// down the debugger session. In-flight commands are completed as
    /// `Cancelled` with "service shutdown" text by the processor loop
    /// itself as it unwinds.
    pub async fn dispose(&self) {
        self.shutdown.cancel();
        self.queue.dispose();

        let task = self.processor_task.lock().await.take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(Duration::from_secs(10), task).await;
        }

        self.debugger.dispose().await;
    }
}

/// Owns the map of live sessions: sessions are created and
/// destroyed by an outer manager; the core never creates them -- this is
/// that outer manager, a thin map plus create/remove, since each
/// `Session` owns its own queue/processor/cache/tracker internally.
pub struct BridgeManager {
    sessions: DashMap<String, Arc<Session>>,
    notify: NotificationSink,
    config: BridgeConfig,
}

impl BridgeManager {
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            notify: NotificationSink::default(),
            config,
        }
    }

    #[must_use]
    pub fn notifications(&self) -> NotificationSink {
        self.notify.clone()
    }

    /// Create (or replace) a session keyed by `session_id`. Replacing
    /// disposes the previous session first so its debugger process does
    /// not leak.
    pub async fn create_session(
        &self,
        session_id: impl Into<String>,
        target: &str,
        args: Vec<String>,
    ) -> Result<Arc<Session>> {
        let session_id = session_id.into();
        if let Some((_, old)) = self.sessions.remove(&session_id) {
            old.dispose().await;
        }

        let session = Session::start(
            session_id.clone(),
            target,
            args,
            &self.config,
            self.notify.clone(),
        )
        .await?;
        self.sessions.insert(session_id, session.clone());
        Ok(session)
    }

    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }

    /// Remove and dispose a session. No-op (`false`) if unknown.
    pub async fn remove_session(&self, session_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };
        session.dispose().await;
        true
    }

    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Dispose every live session, e.g. on process shutdown.
    pub async fn dispose_all(&self) {
        let ids = self.session_ids();
        for id in ids {
            self.remove_session(&id).await;
        }
    }
}

/// Bridges the process-wide extension-token registry (C7)
/// with the session map so the extension-callback HTTP boundary can look
/// up the session a validated token is bound to.
pub struct ExtensionBridge {
    pub manager: Arc<BridgeManager>,
    pub tokens: Arc<ExtensionTokenRegistry>,
}

impl ExtensionBridge {
    #[must_use]
    pub fn new(manager: Arc<BridgeManager>, tokens: Arc<ExtensionTokenRegistry>) -> Self {
        Self { manager, tokens }
    }
}

/// A read-only external view of a session, for listing. Kept separate from
/// `Session` itself so callers cannot reach into internals.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub is_disposed: bool,
}

#[must_use]
pub fn summarize(sessions: &HashMap<String, Arc<Session>>) -> Vec<SessionSummary> {
    sessions
        .values()
        .map(|s| SessionSummary {
            session_id: s.session_id.clone(),
            is_disposed: s.is_disposed(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.command_timeout = Duration::from_secs(5);
        config.heartbeat_interval = Duration::from_secs(30);
        config.stop_grace_period = Duration::from_millis(200);
        config
    }

    fn fake_debugger_path() -> String {
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/support/fake_debugger.sh").to_string()
    }

    #[tokio::test]
    async fn start_enqueue_and_get_result_round_trips() {
        let mut config = fast_config();
        config.debugger_path = Some(fake_debugger_path());
        let session = Session::start("s1", "sample.dmp", vec![], &config, NotificationSink::new(16))
            .await
            .unwrap();

        let id = session.enqueue("lm").await.unwrap();
        let output = session.command_result(&id).await.unwrap();
        assert!(output.contains("module1"));
        assert_eq!(session.counters().completed, 1);

        session.dispose().await;
    }

    #[tokio::test]
    async fn cancel_before_pickup_completes_with_documented_message() {
        let mut config = fast_config();
        config.debugger_path = Some(fake_debugger_path());
        let session = Session::start("s2", "sample.dmp", vec![], &config, NotificationSink::new(16))
            .await
            .unwrap();

        // Keep the single worker busy so the second command is guaranteed
        // to still be queued (not executing) when it is cancelled.
        let _busy = session.enqueue("hang").await.unwrap();
        let second = session.enqueue("lm").await.unwrap();
        assert!(session.cancel(&second));

        let result = session.command_result_raw(&second).await.unwrap();
        assert!(!result.success);
        assert_eq!(
            result.error_message.as_deref(),
            Some("Command was cancelled before execution")
        );

        session.dispose().await;
    }

    #[tokio::test]
    async fn manager_create_with_no_debugger_binary_fails_and_leaves_no_session() {
        let manager = BridgeManager::new(fast_config());
        let err = manager.create_session("s1", "sample.dmp", vec![]).await;
        assert!(err.is_err());
        assert!(manager.get("s1").is_none());
    }

    #[tokio::test]
    async fn manager_remove_unknown_session_is_false() {
        let manager = BridgeManager::new(fast_config());
        assert!(!manager.remove_session("nope").await);
    }

    #[tokio::test]
    async fn manager_create_replaces_and_disposes_previous_session() {
        let mut config = fast_config();
        config.debugger_path = Some(fake_debugger_path());
        let manager = BridgeManager::new(config);

        let first = manager
            .create_session("dup", "sample.dmp", vec![])
            .await
            .unwrap();
        let second = manager
            .create_session("dup", "sample.dmp", vec![])
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(manager.get("dup").is_some());
        manager.dispose_all().await;
    }
}
