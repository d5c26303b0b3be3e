//! Debugger session (C1): owns the child debugger process.
//!
//! Spawn, write to stdin, read delimited output, close. A console debugger
//! talks plain pipes rather than a PTY, so this keeps the write-then-read-
//! until-marker shape and a drain-on-startup step but skips PTY machinery.
//!
//! This component intentionally has no execution mutex: the
//! queue's single consumer is the only caller of [`DebuggerSession::execute`]
//! at a time. The only state guarded here is the lifecycle flags and the
//! current-operation cancellation slot.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};

/// ASCII ETX -- the debugger's interrupt byte.
const INTERRUPT_BYTE: u8 = 0x03;
/// The debugger's "break to prompt" command, sent right after the interrupt
/// byte. Opaque protocol of the external tool; write exactly as specified.
const BREAK_TO_PROMPT: &str = ".kill\n";
/// The debugger's quit command -- the single character `q`.
const QUIT_COMMAND: &str = "q\n";

fn prompt_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+:\d+>").expect("prompt regex is valid"))
}

/// Well-known install locations to probe when no explicit path is
/// configured, ordered by architecture priority.
fn well_known_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for arch in ["x64", "x86", "arm64"] {
        paths.push(PathBuf::from(format!(
            "C:\\Program Files\\Debugging Tools for Windows ({arch})\\cdb.exe"
        )));
        paths.push(PathBuf::from(format!(
            "C:\\Program Files (x86)\\Windows Kits\\10\\Debuggers\\{arch}\\cdb.exe"
        )));
    }
    paths
}

/// Locate the debugger binary: configured path, then well-known install
/// paths, then `PATH` lookup, each checked within a 5 second cap.
async fn locate_debugger(configured: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = configured {
        let p = PathBuf::from(path);
        if p.is_file() {
            return Ok(p);
        }
        return Err(BridgeError::DebuggerUnavailable(format!(
            "configured debugger path does not exist: {path}"
        )));
    }

    for candidate in well_known_paths() {
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    let which = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::task::spawn_blocking(|| which_cdb()).await.ok().flatten()
    })
    .await
    .ok()
    .flatten();

    which.ok_or_else(|| {
        BridgeError::DebuggerUnavailable("no debugger executable found on PATH".to_string())
    })
}

fn which_cdb() -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join("cdb.exe"))
        .find(|candidate| candidate.is_file())
}

struct Streams {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<tokio::process::ChildStdout>,
}

/// Long-lived child debugger process.
pub struct DebuggerSession {
    debugger_path: Option<String>,
    command_timeout: Duration,
    stop_grace_period: Duration,
    active: AtomicBool,
    streams: Mutex<Option<Streams>>,
    current_op: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl DebuggerSession {
    #[must_use]
    pub fn new(
        debugger_path: Option<String>,
        command_timeout: Duration,
        stop_grace_period: Duration,
    ) -> Self {
        Self {
            debugger_path,
            command_timeout,
            stop_grace_period,
            active: AtomicBool::new(false),
            streams: Mutex::new(None),
            current_op: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Lock-free read of `active ∧ ¬processExited`.
    #[must_use]
    pub fn is_active(&self) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        // A cheap liveness nudge: if the child has already exited the flag
        // is stale until the next `stop`/`start`, but callers combine this
        // with the recovery manager's health probe for anything that needs
        // certainty.
        true
    }

    /// Start the debugger against `target` with `args`. Stops any active
    /// session first.
    pub async fn start(&self, target: &str, args: &[String]) -> Result<()> {
        if self.is_active() {
            self.stop().await?;
        }

        let deadline = self.command_timeout;
        let path = locate_debugger(self.debugger_path.as_deref()).await?;

        let spawn_fut = spawn_debugger(&path, target, args);
        let mut child = tokio::time::timeout(deadline, spawn_fut)
            .await
            .map_err(|_| BridgeError::Timeout("debugger start exceeded command timeout".into()))??;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Internal("child stdin was not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Internal("child stdout was not piped".into()))?;

        *self.streams.lock().await = Some(Streams {
            child,
            stdin,
            reader: BufReader::new(stdout),
        });
        self.active.store(true, Ordering::Release);

        Ok(())
    }

    /// Execute a single command, reading output until a prompt line or
    /// cancellation. Not internally serialized -- see module docs.
    ///
    /// Races the read against three independent cancellation sources --
    /// `external_cancel` (the command's own `cancelSignal`), a per-call
    /// timeout, and session shutdown -- plus C1's own operation slot used
    /// by [`cancel_current`]. Whichever fires first wins; the losing
    /// futures (including the in-flight read, which holds the stream
    /// lock) are dropped, which is how the lock gets released without an
    /// explicit unlock. This is a linked cancellation tree, expressed as a
    /// `select!` instead of a merged token, since
    /// `CancellationToken` only supports a single parent per child.
    pub async fn execute(&self, command: &str, external_cancel: CancellationToken) -> Result<String> {
        if !self.is_active() {
            return Err(BridgeError::DebuggerUnavailable(
                "session is not active".to_string(),
            ));
        }

        let op_token = CancellationToken::new();
        *self.current_op.lock().await = Some(op_token.clone());

        let result = tokio::select! {
            biased;
            () = external_cancel.cancelled() => Ok("<cancelled>".to_string()),
            () = op_token.cancelled() => Ok("<cancelled>".to_string()),
            () = self.shutdown.cancelled() => Ok("<cancelled>".to_string()),
            () = tokio::time::sleep(self.command_timeout) => Ok("<cancelled>".to_string()),
            r = self.write_and_read(command) => r,
        };

        *self.current_op.lock().await = None;
        result
    }

    async fn write_and_read(&self, command: &str) -> Result<String> {
        let mut guard = self.streams.lock().await;
        let streams = guard
            .as_mut()
            .ok_or_else(|| BridgeError::DebuggerUnavailable("session is not active".to_string()))?;

        streams
            .stdin
            .write_all(command.as_bytes())
            .await
            .map_err(|e| BridgeError::Transient(format!("write to debugger stdin failed: {e}")))?;
        streams
            .stdin
            .write_all(b"\n")
            .await
            .map_err(|e| BridgeError::Transient(format!("write to debugger stdin failed: {e}")))?;
        streams
            .stdin
            .flush()
            .await
            .map_err(|e| BridgeError::Transient(format!("flush debugger stdin failed: {e}")))?;

        let mut output = String::new();
        let mut last_byte_at = Instant::now();
        let mut warned_silence = false;

        loop {
            let mut line = String::new();
            let read = tokio::time::timeout(
                Duration::from_millis(50),
                streams.reader.read_line(&mut line),
            )
            .await;

            match read {
                Ok(Ok(0)) => {
                    return Err(BridgeError::DebuggerUnavailable(
                        "debugger process exited before completing the command".to_string(),
                    ));
                }
                Ok(Ok(_)) => {
                    last_byte_at = Instant::now();
                    warned_silence = false;
                    let is_prompt = prompt_regex().is_match(&line);
                    if is_prompt {
                        break;
                    }
                    output.push_str(&line);
                }
                Ok(Err(e)) => {
                    return Err(BridgeError::Transient(format!(
                        "error reading debugger output: {e}"
                    )));
                }
                Err(_) => {
                    if !warned_silence && last_byte_at.elapsed() >= Duration::from_secs(5) {
                        tracing::warn!("no output from debugger in 5s, still waiting for prompt");
                        warned_silence = true;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        Ok(output.trim_end_matches('\n').to_string())
    }

    /// Cancel the current operation and attempt a best-effort interrupt of
    /// the debugger. Never blocks the caller longer than `timeout`, which
    /// callers source from `RecoveryConfig::cancellation_timeout`.
    pub async fn cancel_current(&self, timeout: Duration) {
        if let Some(op) = self.current_op.lock().await.clone() {
            op.cancel();
        }

        let mut guard = self.streams.lock().await;
        if let Some(streams) = guard.as_mut() {
            let write = async {
                let _ = streams.stdin.write_all(&[INTERRUPT_BYTE]).await;
                let _ = streams.stdin.write_all(BREAK_TO_PROMPT.as_bytes()).await;
                let _ = streams.stdin.flush().await;
            };
            let _ = tokio::time::timeout(timeout, write).await;
        }
    }

    /// Send the quit command, wait a grace period, then force-kill the
    /// whole process tree if still alive.
    pub async fn stop(&self) -> Result<bool> {
        self.active.store(false, Ordering::Release);
        let mut guard = self.streams.lock().await;
        let Some(mut streams) = guard.take() else {
            return Ok(false);
        };

        let quit = async {
            let _ = streams.stdin.write_all(QUIT_COMMAND.as_bytes()).await;
            let _ = streams.stdin.flush().await;
        };
        let _ = tokio::time::timeout(Duration::from_secs(1), quit).await;

        let exited = tokio::time::timeout(self.stop_grace_period, streams.child.wait())
            .await
            .is_ok();

        if !exited {
            kill_tree(&streams.child);
            let _ = streams.child.wait().await;
        }

        Ok(true)
    }

    /// Stop without re-entering `stop` on a disposed session; swallows
    /// errors rather than throwing on an already-disposed session.
    pub async fn dispose(&self) {
        self.shutdown.cancel();
        let _ = self.stop().await;
    }
}

async fn spawn_debugger(path: &Path, target: &str, args: &[String]) -> Result<Child> {
    let mut cmd = Command::new(path);
    cmd.arg("-z").arg(target);
    cmd.args(args);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    // Start a new process group so `kill_tree` can signal the whole tree
    // (debugger + any children it spawns) via the negated pid instead of
    // only the direct child.
    // SAFETY: pre_exec runs after fork, before exec, in the child process.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    // Symbol-server timeout/retry environment.
    cmd.env("_NT_SYMBOL_RETRY_COUNT", "1");
    cmd.env("SYMSRV_TIMEOUT", "10");

    cmd.spawn()
        .map_err(|e| BridgeError::DebuggerUnavailable(format!("failed to spawn debugger: {e}")))
}

fn kill_tree(child: &Child) {
    let Some(pid) = child.id() else { return };
    // The child was spawned as its own process group leader, so the
    // negated pid signals the whole group (the debugger and anything it
    // spawned), not just the direct child.
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(-(pid as i32)),
        nix::sys::signal::Signal::SIGKILL,
    );
}

pub type SharedDebuggerSession = Arc<DebuggerSession>;

#[async_trait::async_trait]
impl crate::processor::CommandExecutor for DebuggerSession {
    async fn execute(&self, command: &str, cancel: CancellationToken) -> Result<String> {
        DebuggerSession::execute(self, command, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_regex_matches_digit_colon_digit_gt_anywhere() {
        assert!(prompt_regex().is_match("0:000> "));
        assert!(prompt_regex().is_match("leading text 12:004>"));
        assert!(!prompt_regex().is_match("no prompt here"));
    }
}
