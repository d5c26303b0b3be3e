//! Extension callback HTTP boundary: a thin `axum` router exercising C7
//! (the extension token registry) the way an external extension script
//! calls back into the session it was spawned from.
//!
//! Grounded on the sibling pack's MCP-hub HTTP surface
//! (`csa-mcp-hub::serve`): `axum::serve` over a `TcpListener`, bound
//! per-connection peer address checked against a policy, and a
//! `CancellationToken` for graceful shutdown. This keeps that shape but
//! narrows the policy to the two gates this boundary actually needs --
//! loopback-only remote address and a bearer token `validate` accepts --
//! and drops the JSON-RPC framing, rate limiting, and skill-sync wiring
//! the hub needs for its own purpose.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::notify::{methods, NotificationSink};
use crate::session::ExtensionBridge;
use crate::types::CommandState;

#[derive(Clone)]
struct AppState {
    bridge: Arc<ExtensionBridge>,
    notify: NotificationSink,
    default_deadline: Duration,
}

/// Build the extension-callback router. The embedder is responsible for
/// binding it on loopback only. Primary client-facing transport framing is
/// handled elsewhere; this boundary is kept minimal: three routes, no
/// middleware stack, no metrics.
#[must_use]
pub fn router(bridge: Arc<ExtensionBridge>, notify: NotificationSink, default_deadline: Duration) -> Router {
    let state = AppState {
        bridge,
        notify,
        default_deadline,
    };
    Router::new()
        .route("/extension-callback/execute", post(execute))
        .route("/extension-callback/read", post(read))
        .route("/extension-callback/log", post(log))
        .with_state(state)
}

/// Serve the router on `bind_addr` until `shutdown` fires.
pub async fn serve(
    bridge: Arc<ExtensionBridge>,
    notify: NotificationSink,
    default_deadline: Duration,
    bind_addr: SocketAddr,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(bridge, notify, default_deadline)
        .into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn error_body(message: impl Into<String>) -> Json<Value> {
    Json(json!({"error": message.into()}))
}

/// Loopback + bearer-token gate shared by every route: requires both a
/// loopback-only remote address and a bearer token that `validate` accepts.
fn authorize(
    state: &AppState,
    addr: &SocketAddr,
    headers: &HeaderMap,
) -> Result<crate::tokens::TokenValidation, Response> {
    if !addr.ip().is_loopback() {
        return Err((StatusCode::FORBIDDEN, error_body("remote address is not loopback")).into_response());
    }

    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let Some(token) = token else {
        return Err((StatusCode::UNAUTHORIZED, error_body("missing bearer token")).into_response());
    };

    let validation = state.bridge.tokens.validate(token);
    if !validation.valid {
        return Err((StatusCode::UNAUTHORIZED, error_body("invalid or expired token")).into_response());
    }
    Ok(validation)
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    command: String,
    #[serde(rename = "timeoutSeconds")]
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ExecuteResponse {
    #[serde(rename = "commandId")]
    command_id: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn execute(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<ExecuteRequest>,
) -> Response {
    let validation = match authorize(&state, &addr, &headers) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let session_id = validation.session_id.expect("validated token carries a session id");

    if req.command.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, error_body("command must not be empty")).into_response();
    }

    let Some(session) = state.bridge.manager.get(&session_id) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("bound session is no longer available"),
        )
            .into_response();
    };

    let id = match session.enqueue(req.command.clone()).await {
        Ok(id) => id,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string())).into_response();
        }
    };

    let deadline = req
        .timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or(state.default_deadline);

    let poll_interval = Duration::from_millis(100);
    let start = tokio::time::Instant::now();

    loop {
        if let Some(result) = session.cached_result_with_metadata(&id) {
            let response = if result.result.success {
                ExecuteResponse {
                    command_id: id,
                    status: "Success",
                    output: Some(result.result.output),
                    error: None,
                }
            } else {
                ExecuteResponse {
                    command_id: id,
                    status: "Failed",
                    output: None,
                    error: result.result.error_message,
                }
            };
            return (StatusCode::OK, Json(response)).into_response();
        }

        if start.elapsed() >= deadline {
            let _ = session.cancel(&id);
            return (
                StatusCode::GATEWAY_TIMEOUT,
                Json(ExecuteResponse {
                    command_id: id,
                    status: "Failed",
                    output: None,
                    error: Some("extension callback deadline exceeded".to_string()),
                }),
            )
                .into_response();
        }

        tokio::time::sleep(poll_interval).await;
    }
}

#[derive(Debug, Deserialize)]
struct ReadRequest {
    #[serde(rename = "commandId")]
    command_id: String,
}

#[derive(Debug, Serialize)]
struct ReadResponse {
    #[serde(rename = "commandId")]
    command_id: String,
    status: &'static str,
    #[serde(rename = "isCompleted")]
    is_completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn read(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<ReadRequest>,
) -> Response {
    let validation = match authorize(&state, &addr, &headers) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let session_id = validation.session_id.expect("validated token carries a session id");

    let Some(session) = state.bridge.manager.get(&session_id) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("bound session is no longer available"),
        )
            .into_response();
    };

    let Some(command_state) = session.command_state(&req.command_id) else {
        return (StatusCode::NOT_FOUND, error_body("unknown command id")).into_response();
    };

    let is_completed = command_state.is_terminal();
    let cached = session.cached_result_with_metadata(&req.command_id);

    let (status, output, error) = match cached {
        Some(cached) if cached.result.success => ("Success", Some(cached.result.output), None),
        Some(cached) => ("Failed", None, cached.result.error_message),
        None if command_state == CommandState::Executing || command_state == CommandState::Queued => {
            ("Pending", None, None)
        }
        None => ("Failed", None, Some("command result is no longer cached".to_string())),
    };

    (
        StatusCode::OK,
        Json(ReadResponse {
            command_id: req.command_id,
            status,
            is_completed,
            output,
            error,
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct LogRequest {
    message: String,
    level: String,
}

async fn log(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<LogRequest>,
) -> Response {
    let validation = match authorize(&state, &addr, &headers) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let level = match req.level.as_str() {
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        // Unknown levels map to info.
        _ => "info",
    };

    match level {
        "debug" => tracing::debug!(
            session_id = %validation.session_id.as_deref().unwrap_or(""),
            command_id = %validation.command_id.as_deref().unwrap_or(""),
            "{}",
            req.message
        ),
        "warn" => tracing::warn!(
            session_id = %validation.session_id.as_deref().unwrap_or(""),
            command_id = %validation.command_id.as_deref().unwrap_or(""),
            "{}",
            req.message
        ),
        "error" => tracing::error!(
            session_id = %validation.session_id.as_deref().unwrap_or(""),
            command_id = %validation.command_id.as_deref().unwrap_or(""),
            "{}",
            req.message
        ),
        _ => tracing::info!(
            session_id = %validation.session_id.as_deref().unwrap_or(""),
            command_id = %validation.command_id.as_deref().unwrap_or(""),
            "{}",
            req.message
        ),
    }

    state.notify.notify(
        methods::SESSION_EVENT,
        json!({
            "event": "extensionLog",
            "level": level,
            "sessionId": validation.session_id,
            "commandId": validation.command_id,
        }),
    );

    StatusCode::OK.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::session::BridgeManager;
    use crate::tokens::ExtensionTokenRegistry;
    use axum::body::Body;
    use axum::extract::connect_info::ConnectInfo;
    use axum::http::Request;
    use tower::ServiceExt;

    fn fake_debugger_path() -> String {
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/support/fake_debugger.sh").to_string()
    }

    async fn bridge_with_session() -> (Arc<ExtensionBridge>, String) {
        let mut config = BridgeConfig::default();
        config.debugger_path = Some(fake_debugger_path());
        config.command_timeout = std::time::Duration::from_secs(5);
        let manager = Arc::new(BridgeManager::new(config));
        manager
            .create_session("s1", "sample.dmp", vec![])
            .await
            .unwrap();
        let tokens = Arc::new(ExtensionTokenRegistry::new(crate::config::TokenConfig::default()));
        (Arc::new(ExtensionBridge::new(manager, tokens)), "s1".to_string())
    }

    fn loopback_addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    fn request_from(addr: SocketAddr, uri: &str, auth: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        let mut request = builder.body(Body::from(body.to_string())).unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    #[tokio::test]
    async fn execute_without_bearer_token_is_unauthorized() {
        let (bridge, _) = bridge_with_session().await;
        let app = router(bridge, NotificationSink::new(4), Duration::from_secs(1));

        let request = request_from(
            loopback_addr(),
            "/extension-callback/execute",
            None,
            json!({"command": "lm"}),
        );

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn execute_from_non_loopback_address_is_forbidden() {
        let (bridge, session_id) = bridge_with_session().await;
        let token = bridge.tokens.create(session_id, "c0").unwrap();
        let app = router(bridge, NotificationSink::new(4), Duration::from_secs(1));

        let request = request_from(
            "203.0.113.5:9999".parse().unwrap(),
            "/extension-callback/execute",
            Some(&format!("Bearer {token}")),
            json!({"command": "lm"}),
        );

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn execute_round_trip_with_valid_token_returns_success() {
        let (bridge, session_id) = bridge_with_session().await;
        let token = bridge.tokens.create(session_id, "c0").unwrap();
        let app = router(bridge, NotificationSink::new(4), Duration::from_secs(5));

        let request = request_from(
            loopback_addr(),
            "/extension-callback/execute",
            Some(&format!("Bearer {token}")),
            json!({"command": "lm"}),
        );

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "Success");
        assert!(parsed["output"].as_str().unwrap().contains("module1"));
    }

    #[tokio::test]
    async fn read_unknown_command_is_not_found() {
        let (bridge, session_id) = bridge_with_session().await;
        let token = bridge.tokens.create(session_id, "c0").unwrap();
        let app = router(bridge, NotificationSink::new(4), Duration::from_secs(1));

        let request = request_from(
            loopback_addr(),
            "/extension-callback/read",
            Some(&format!("Bearer {token}")),
            json!({"commandId": "does-not-exist"}),
        );

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn log_with_valid_token_returns_ok() {
        let (bridge, session_id) = bridge_with_session().await;
        let token = bridge.tokens.create(session_id, "c0").unwrap();
        let app = router(bridge, NotificationSink::new(4), Duration::from_secs(1));

        let request = request_from(
            loopback_addr(),
            "/extension-callback/log",
            Some(&format!("Bearer {token}")),
            json!({"message": "hello from extension", "level": "debug"}),
        );

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
