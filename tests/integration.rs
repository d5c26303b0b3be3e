//! Cross-component scenarios against the fake debugger harness, one test
//! per named scenario. Mirrors the teacher's `tests/test_session.rs` split:
//! unit-level checks live inline per module, cross-component behavior lives
//! here.

use std::sync::Arc;
use std::time::Duration;

use dbgbridge::cache::ResultCache;
use dbgbridge::config::{BridgeConfig, CacheConfig, RecoveryConfig, TokenConfig};
use dbgbridge::notify::NotificationSink;
use dbgbridge::session::{BridgeManager, ExtensionBridge, Session};
use dbgbridge::tokens::ExtensionTokenRegistry;
use dbgbridge::types::CachedResultMeta;

fn fake_debugger_path() -> String {
    concat!(env!("CARGO_MANIFEST_DIR"), "/tests/support/fake_debugger.sh").to_string()
}

fn fast_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.debugger_path = Some(fake_debugger_path());
    config.heartbeat_interval = Duration::from_secs(30);
    config.stop_grace_period = Duration::from_millis(200);
    config
}

/// S1. Happy path: `lm` against the fake debugger returns its two module
/// lines; the result is cached and `completed` is incremented once.
#[tokio::test]
async fn s1_happy_path() {
    let mut config = fast_config();
    config.command_timeout = Duration::from_secs(5);
    let session = Session::start("s1", "sample.dmp", vec![], &config, NotificationSink::new(16))
        .await
        .unwrap();

    let id = session.enqueue("lm").await.unwrap();
    assert!(!id.is_empty());

    let output = session.command_result(&id).await.unwrap();
    assert_eq!(output, "module1 0x1000 0x2000\nmodule2 0x3000 0x4000");

    assert!(session.cached_result_with_metadata(&id).is_some());
    assert_eq!(session.counters().completed, 1);

    session.dispose().await;
}

/// S2. Explicit cancel: cancelling a command while it is the tracker's
/// current (already executing, not merely queued) slot produces the "by
/// user request" message rather than the pre-pickup one.
#[tokio::test]
async fn s2_explicit_cancel_of_executing_command() {
    let mut config = fast_config();
    config.command_timeout = Duration::from_secs(5);
    let session = Session::start("s2", "sample.dmp", vec![], &config, NotificationSink::new(16))
        .await
        .unwrap();

    let id = session.enqueue("hang").await.unwrap();
    // Give the single worker a moment to pick the command up so the cancel
    // below lands on an executing command, not a still-queued one.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.cancel(&id));

    let result = session.command_result_raw(&id).await.unwrap();
    assert!(!result.success);
    assert_eq!(
        result.error_message.as_deref(),
        Some("Command was cancelled by user request")
    );
    assert_eq!(session.counters().cancelled, 1);

    session.dispose().await;
}

/// S3. Timeout: a command the fake debugger never answers within the
/// configured timeout terminates `Failed` with a "timed out" message.
#[tokio::test]
async fn s3_command_timeout() {
    let mut config = fast_config();
    config.command_timeout = Duration::from_millis(300);
    let session = Session::start("s3", "sample.dmp", vec![], &config, NotificationSink::new(16))
        .await
        .unwrap();

    let id = session.enqueue("hang").await.unwrap();
    let result = session.command_result_raw(&id).await.unwrap();

    assert!(!result.success);
    assert!(result
        .error_message
        .as_deref()
        .unwrap_or_default()
        .starts_with("Command timed out after"));
    assert_eq!(session.counters().failed, 1);

    session.dispose().await;
}

/// S4. Cache eviction: storing a fourth result against `maxResults = 3`
/// evicts exactly the oldest-accessed entry.
#[test]
fn s4_cache_eviction_picks_oldest() {
    let mut config = CacheConfig::default();
    config.max_results = 3;
    config.max_memory_bytes = 1024 * 1024;
    let cache = ResultCache::new(config);

    for i in 0..4 {
        let now = std::time::Instant::now();
        cache.store(
            format!("c{i}"),
            dbgbridge::types::CommandResult::success(format!("out{i}"), Duration::from_millis(1)),
            CachedResultMeta {
                original_command: "lm".to_string(),
                queue_time: now,
                start_time: now,
                end_time: now,
            },
        );
        std::thread::sleep(Duration::from_millis(2));
    }

    let stats = cache.statistics();
    assert_eq!(stats.count, 3);
    assert!(!cache.has("c0"));
    assert!(cache.has("c3"));
}

/// S5. Extension callback round-trip: a token issued for `(s1, c1)` lets a
/// loopback caller enqueue and await a command through the HTTP boundary.
#[tokio::test]
async fn s5_extension_callback_round_trip() {
    let mut config = fast_config();
    config.command_timeout = Duration::from_secs(5);
    let manager = Arc::new(BridgeManager::new(config));
    manager
        .create_session("s1", "sample.dmp", vec![])
        .await
        .unwrap();
    let tokens = Arc::new(ExtensionTokenRegistry::new(TokenConfig::default()));
    let token = tokens.create("s1", "c1").unwrap();
    let bridge = Arc::new(ExtensionBridge::new(manager.clone(), tokens.clone()));

    let app = dbgbridge::extension_http::router(bridge, NotificationSink::new(4), Duration::from_secs(5));

    let mut request = axum::http::Request::builder()
        .method("POST")
        .uri("/extension-callback/execute")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(axum::body::Body::from(
            serde_json::json!({"command": "k"}).to_string(),
        ))
        .unwrap();
    request.extensions_mut().insert(axum::extract::connect_info::ConnectInfo(
        "127.0.0.1:9999".parse::<std::net::SocketAddr>().unwrap(),
    ));

    use tower::ServiceExt;
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["status"], "Success");
    assert!(parsed["output"].as_str().unwrap().contains("unrecognized command: k"));

    // The token remains valid until its TTL -- still accepted afterward.
    assert!(tokens.validate(&token).valid);

    manager.dispose_all().await;
}

/// S6. Recovery: the debugger process dies mid-command; the processor
/// classifies this as session-lost and the recovery manager restarts it.
/// With a one-recovery attempt budget (original attempt + one retry = 2
/// total), the retried command crashes the now-fresh debugger again, so
/// the budget is exhausted and the command terminates `Failed`.
#[tokio::test]
async fn s6_recovery_retries_once_then_gives_up() {
    let mut config = fast_config();
    config.command_timeout = Duration::from_secs(5);
    config.recovery = RecoveryConfig {
        cancellation_timeout: Duration::from_millis(200),
        restart_delay: Duration::from_millis(1),
        health_check_interval: Duration::from_secs(60),
        max_recovery_attempts: 1,
        recovery_attempt_cooldown: Duration::ZERO,
    };
    let session = Session::start("s6", "sample.dmp", vec![], &config, NotificationSink::new(16))
        .await
        .unwrap();

    let id = session.enqueue("crash").await.unwrap();
    let result = session.command_result_raw(&id).await.unwrap();

    assert!(!result.success);
    assert!(result
        .error_message
        .as_deref()
        .unwrap_or_default()
        .starts_with("Command execution failed"));
    assert_eq!(session.counters().failed, 1);

    session.dispose().await;
}
