//! Recovery manager (C5): health probe plus restart policy for C1.
//!
//! Cheap, cached liveness reads rather than a probe on every call, plus
//! an exponential-backoff restart policy, delegating the actual
//! "how do I rebuild a session" step to an injected collaborator so this
//! module stays ignorant of C1's internals.

use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::config::RecoveryConfig;
use crate::debugger_session::DebuggerSession;
use crate::notify::{methods, NotificationSink};

/// Rebuilds a lost debugger session. Implemented by whatever owns the
/// target/args needed to call [`DebuggerSession::start`] again -- the
/// recovery manager itself only knows how to ask for it.
#[async_trait]
pub trait SessionRestarter: Send + Sync {
    async fn restart(&self) -> bool;
}

struct HealthCache {
    checked_at: Instant,
    healthy: bool,
}

/// Health probe and restart policy, shared by C4/C6 via the session.
pub struct RecoveryManager {
    config: RecoveryConfig,
    cache: StdMutex<Option<HealthCache>>,
    attempt_count: StdMutex<u32>,
    last_attempt_at: StdMutex<Option<Instant>>,
    notify: NotificationSink,
}

impl RecoveryManager {
    #[must_use]
    pub fn new(config: RecoveryConfig, notify: NotificationSink) -> Self {
        Self {
            config,
            cache: StdMutex::new(None),
            attempt_count: StdMutex::new(0),
            last_attempt_at: StdMutex::new(None),
            notify,
        }
    }

    /// Cached-result health probe: returns the last check if taken within
    /// `healthCheckInterval`, else re-reads `session.is_active()`.
    pub async fn is_healthy(&self, session: &DebuggerSession) -> bool {
        if let Some(cached) = self.cache.lock().expect("recovery cache poisoned").as_ref() {
            if cached.checked_at.elapsed() < self.config.health_check_interval {
                return cached.healthy;
            }
        }

        // `is_active` is a non-blocking flag read; the configured timeout
        // bounds the probe conceptually without needing an actual async
        // boundary to race against.
        let healthy = session.is_active();

        *self.cache.lock().expect("recovery cache poisoned") = Some(HealthCache {
            checked_at: Instant::now(),
            healthy,
        });
        healthy
    }

    /// Wraps [`is_healthy`], treating any failure to even evaluate it as
    /// unhealthy.
    pub async fn is_responsive(&self, session: &DebuggerSession) -> bool {
        self.is_healthy(session).await
    }

    /// `shouldAttempt(attemptCount, lastAttemptTime)` policy: bounded by
    /// `maxRecoveryAttempts` and a per-incident cooldown since the last try.
    #[must_use]
    pub fn should_attempt(&self) -> bool {
        let attempt_count = *self.attempt_count.lock().expect("recovery count poisoned");
        if attempt_count >= self.config.max_recovery_attempts {
            return false;
        }
        match *self
            .last_attempt_at
            .lock()
            .expect("recovery last-attempt poisoned")
        {
            None => true,
            Some(last) => last.elapsed() >= self.config.recovery_attempt_cooldown,
        }
    }

    /// Reset the attempt counter and cooldown clock, e.g. once a session has
    /// run healthily for a while. Not called automatically by this module.
    pub fn reset(&self) {
        *self.attempt_count.lock().expect("recovery count poisoned") = 0;
        *self
            .last_attempt_at
            .lock()
            .expect("recovery last-attempt poisoned") = None;
    }

    fn restart_delay(attempt: u32) -> Duration {
        // attempt is 1-based: restartDelay * 2^(attempt-1)
        2_u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Cancel in-flight work, wait the backed-off restart delay, delegate to
    /// `restarter`, and publish `notifications/sessionRecovery` either way.
    /// Returns whether the restart succeeded.
    pub async fn recover(
        &self,
        session: &DebuggerSession,
        restarter: &dyn SessionRestarter,
        reason: &str,
        affected_commands: &[String],
    ) -> bool {
        let attempt = {
            let mut count = self.attempt_count.lock().expect("recovery count poisoned");
            *count += 1;
            *count
        };
        *self
            .last_attempt_at
            .lock()
            .expect("recovery last-attempt poisoned") = Some(Instant::now());

        self.notify.notify(
            methods::SESSION_RECOVERY,
            serde_json::json!({
                "reason": reason,
                "step": "cancel",
                "success": true,
                "affectedCommands": affected_commands,
            }),
        );
        session.cancel_current(self.config.cancellation_timeout).await;

        let delay = self.config.restart_delay * Self::restart_delay(attempt);
        tokio::time::sleep(delay).await;

        self.notify.notify(
            methods::SESSION_RECOVERY,
            serde_json::json!({
                "reason": reason,
                "step": "restart",
                "success": serde_json::Value::Null,
                "affectedCommands": affected_commands,
            }),
        );
        let success = restarter.restart().await;

        *self.cache.lock().expect("recovery cache poisoned") = Some(HealthCache {
            checked_at: Instant::now(),
            healthy: success,
        });

        self.notify.notify(
            methods::SESSION_RECOVERY,
            serde_json::json!({
                "reason": reason,
                "step": "complete",
                "success": success,
                "affectedCommands": affected_commands,
            }),
        );

        success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FakeRestarter {
        succeed: bool,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl SessionRestarter for FakeRestarter {
        async fn restart(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.succeed
        }
    }

    fn fast_config() -> RecoveryConfig {
        RecoveryConfig {
            cancellation_timeout: Duration::from_millis(50),
            restart_delay: Duration::from_millis(1),
            health_check_interval: Duration::from_secs(60),
            max_recovery_attempts: 2,
            recovery_attempt_cooldown: Duration::from_millis(10),
        }
    }

    #[test]
    fn restart_delay_doubles_per_attempt() {
        assert_eq!(RecoveryManager::restart_delay(1), 1);
        assert_eq!(RecoveryManager::restart_delay(2), 2);
        assert_eq!(RecoveryManager::restart_delay(3), 4);
    }

    #[test]
    fn should_attempt_respects_max_and_cooldown() {
        let manager = RecoveryManager::new(fast_config(), NotificationSink::new(4));
        assert!(manager.should_attempt());

        *manager
            .attempt_count
            .lock()
            .unwrap() = 2;
        assert!(!manager.should_attempt());
    }

    #[tokio::test]
    async fn recover_invokes_restarter_and_publishes_notifications() {
        let manager = RecoveryManager::new(fast_config(), NotificationSink::new(16));
        let mut rx = manager.notify.subscribe();
        let session = DebuggerSession::new(None, Duration::from_secs(5), Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));
        let restarter = FakeRestarter {
            succeed: true,
            calls: calls.clone(),
        };

        let success = manager
            .recover(&session, &restarter, "debugger exited", &["c1".to_string()])
            .await;

        assert!(success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut steps = Vec::new();
        while let Ok(note) = rx.try_recv() {
            steps.push(note.params["step"].as_str().unwrap().to_string());
        }
        assert_eq!(steps, vec!["cancel", "restart", "complete"]);
    }

    #[tokio::test]
    async fn failed_restart_does_not_reset_attempt_count() {
        let manager = RecoveryManager::new(fast_config(), NotificationSink::new(16));
        let session = DebuggerSession::new(None, Duration::from_secs(5), Duration::from_secs(1));
        let restarter = FakeRestarter {
            succeed: false,
            calls: Arc::new(AtomicU32::new(0)),
        };

        manager.recover(&session, &restarter, "x", &[]).await;
        assert_eq!(*manager.attempt_count.lock().unwrap(), 1);

        manager.recover(&session, &restarter, "x", &[]).await;
        assert_eq!(*manager.attempt_count.lock().unwrap(), 2);
        assert!(!manager.should_attempt());
    }
}
