//! Topic-addressed notifications.
//!
//! Modeled as a broadcast channel of `{method, params}` records rather than
//! a handler-registry with inheritance: any subscriber conforming to the
//! two-field capability can listen. Handlers that need per-topic filtering
//! just match on `method`.

use serde_json::Value;
use tokio::sync::broadcast;

/// One notification record, addressed by MCP-style method name.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Notification {
    pub method: &'static str,
    pub params: Value,
}

/// `notifications/commandStatus` et al. -- the method names this crate emits.
pub mod methods {
    pub const COMMAND_STATUS: &str = "notifications/commandStatus";
    pub const COMMAND_HEARTBEAT: &str = "notifications/commandHeartbeat";
    pub const SESSION_EVENT: &str = "notifications/sessionEvent";
    pub const SESSION_RECOVERY: &str = "notifications/sessionRecovery";
    pub const SERVER_HEALTH: &str = "notifications/serverHealth";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/toolsListChanged";
}

/// A cheap-to-clone sink. Cloning shares the same underlying broadcast
/// channel; publishing from any clone reaches every subscriber.
#[derive(Clone)]
pub struct NotificationSink {
    tx: broadcast::Sender<Notification>,
}

impl NotificationSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a notification. Exceptions are isolated per handler in the
    /// real dispatch (each subscriber is an independent task); a send with
    /// no subscribers is a cheap no-op, not an error.
    pub fn notify(&self, method: &'static str, params: Value) {
        let _ = self.tx.send(Notification { method, params });
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for NotificationSink {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Format an elapsed duration the way heartbeat notifications display it:
/// `Nd` / `Nh` / `Nm` / `Ns` / `N.Ns`, largest unit that applies.
#[must_use]
pub fn format_elapsed_display(elapsed: std::time::Duration) -> String {
    let total_secs = elapsed.as_secs();
    const DAY: u64 = 86_400;
    const HOUR: u64 = 3_600;
    const MIN: u64 = 60;

    if total_secs >= DAY {
        format!("{}d", total_secs / DAY)
    } else if total_secs >= HOUR {
        format!("{}h", total_secs / HOUR)
    } else if total_secs >= MIN {
        format!("{}m", total_secs / MIN)
    } else if elapsed.subsec_millis() == 0 {
        format!("{total_secs}s")
    } else {
        format!("{:.1}s", elapsed.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn elapsed_display_picks_largest_unit() {
        assert_eq!(format_elapsed_display(Duration::from_secs(1)), "1s");
        assert_eq!(format_elapsed_display(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_elapsed_display(Duration::from_secs(90)), "1m");
        assert_eq!(format_elapsed_display(Duration::from_secs(3 * 3600)), "3h");
        assert_eq!(format_elapsed_display(Duration::from_secs(2 * 86_400)), "2d");
    }

    #[tokio::test]
    async fn subscribers_receive_published_notifications() {
        let sink = NotificationSink::new(16);
        let mut rx = sink.subscribe();
        sink.notify(methods::COMMAND_STATUS, serde_json::json!({"id": "c1"}));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.method, methods::COMMAND_STATUS);
    }
}
