//! Entry point for the dbgbridge extension-callback demo host.
//!
//! The primary client-facing API (tool definitions, JSON-RPC/HTTP transport
//! framing) is out of scope for this crate -- an embedder wires
//! `BridgeManager` into whatever protocol its clients speak. What this
//! binary stands up is the one HTTP surface pinned down end to end: the
//! extension-callback boundary, bound to loopback only, so
//! `extension_http` has something real listening behind it.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{self, EnvFilter};

use dbgbridge::config::{BridgeConfig, TokenConfig};
use dbgbridge::extension_http;
use dbgbridge::session::{BridgeManager, ExtensionBridge};
use dbgbridge::tokens::ExtensionTokenRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("starting dbgbridge v{}", env!("CARGO_PKG_VERSION"));

    let bridge_config = BridgeConfig::default();
    let token_config = TokenConfig::default();
    let callback_deadline = token_config.callback_deadline;

    let manager = Arc::new(BridgeManager::new(bridge_config));
    let tokens = Arc::new(ExtensionTokenRegistry::new(token_config));
    let bridge = Arc::new(ExtensionBridge::new(manager.clone(), tokens));
    let notify = bridge.manager.notifications();

    let bind_addr: SocketAddr = std::env::var("DBGBRIDGE_EXTENSION_HTTP_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:4711".to_string())
        .parse()?;

    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();

    tracing::info!(%bind_addr, "extension callback endpoint listening");
    let server = tokio::spawn(async move {
        if let Err(e) = extension_http::serve(bridge, notify, callback_deadline, bind_addr, server_shutdown).await {
            tracing::error!(error = %e, "extension callback endpoint failed");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    shutdown.cancel();
    let _ = server.await;

    manager.dispose_all().await;
    tracing::info!("dbgbridge shut down");
    Ok(())
}
