//! dbgbridge: a multi-session bridge fronting an interactive console
//! debugger process behind a request/response API.
//!
//! The core pipeline (queue -> processor -> debugger session -> cache,
//! recovery and extension tokens wrapped around it) lives in the modules
//! below. Transport framing, configuration loading from disk, and
//! tool/resource definitions exposed to a particular client protocol are
//! deliberately outside this crate's scope -- `session` and
//! `extension_http` are the thin seams where an embedder wires the core
//! into something that actually listens on a socket.

pub mod cache;
pub mod config;
pub mod debugger_session;
pub mod error;
pub mod extension_http;
pub mod notify;
pub mod processor;
pub mod queue;
pub mod recovery;
pub mod resilient;
pub mod session;
pub mod tokens;
pub mod tracker;
pub mod types;
