//! Extension token registry (C7): short-lived capability tokens bound to
//! `(sessionId, commandId)`.
//!
//! A concurrent map with an expiry check on read and an
//! opportunistic sweep triggered by inserts rather than a background timer.
//! A secondary session-keyed index supports revoking every token bound to
//! a session, and revocation is a flag rather than a removal, so a
//! `validate` racing a `revoke` never returns a stale "valid" answer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::config::TokenConfig;
use crate::error::{BridgeError, Result};

const TOKEN_PREFIX: &str = "ext_";
const TOKEN_RANDOM_LEN: usize = 32;

#[derive(Debug, Clone)]
struct TokenEntry {
    session_id: String,
    command_id: String,
    expires_at: Instant,
    revoked: bool,
}

impl TokenEntry {
    fn is_live(&self) -> bool {
        !self.revoked && Instant::now() < self.expires_at
    }
}

/// Outcome of [`ExtensionTokenRegistry::validate`].
#[derive(Debug, Clone)]
pub struct TokenValidation {
    pub valid: bool,
    pub session_id: Option<String>,
    pub command_id: Option<String>,
}

impl TokenValidation {
    fn invalid() -> Self {
        Self {
            valid: false,
            session_id: None,
            command_id: None,
        }
    }
}

/// Process-wide registry of extension capability tokens, modeled as an
/// injected singleton behind a capability.
pub struct ExtensionTokenRegistry {
    config: TokenConfig,
    tokens: DashMap<String, TokenEntry>,
    by_session: DashMap<String, Vec<String>>,
    last_sweep_at: AtomicU64,
    started_at: Instant,
}

fn generate_token() -> String {
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{TOKEN_PREFIX}{random}")
}

impl ExtensionTokenRegistry {
    #[must_use]
    pub fn new(config: TokenConfig) -> Self {
        Self {
            config,
            tokens: DashMap::new(),
            by_session: DashMap::new(),
            last_sweep_at: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    fn now_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Issue a token bound to `(session_id, command_id)`. Both must be
    /// non-empty. Triggers an opportunistic cleanup sweep if the last one
    /// is older than `cleanupCooldown`.
    pub fn create(&self, session_id: impl Into<String>, command_id: impl Into<String>) -> Result<String> {
        let session_id = session_id.into();
        let command_id = command_id.into();
        if session_id.trim().is_empty() || command_id.trim().is_empty() {
            return Err(BridgeError::InvalidArgument(
                "sessionId and commandId must be non-empty".to_string(),
            ));
        }

        self.maybe_sweep();

        let token = generate_token();
        self.tokens.insert(
            token.clone(),
            TokenEntry {
                session_id: session_id.clone(),
                command_id,
                expires_at: Instant::now() + self.config.ttl,
                revoked: false,
            },
        );
        self.by_session
            .entry(session_id)
            .or_default()
            .push(token.clone());

        Ok(token)
    }

    /// Validate a token. Empty, unknown, expired, and revoked tokens are all
    /// indistinguishably invalid to the caller.
    #[must_use]
    pub fn validate(&self, token: &str) -> TokenValidation {
        if token.trim().is_empty() {
            return TokenValidation::invalid();
        }
        let Some(entry) = self.tokens.get(token) else {
            return TokenValidation::invalid();
        };
        if !entry.is_live() {
            return TokenValidation::invalid();
        }
        TokenValidation {
            valid: true,
            session_id: Some(entry.session_id.clone()),
            command_id: Some(entry.command_id.clone()),
        }
    }

    /// Mark a single token revoked. Idempotent; unknown tokens are a no-op.
    pub fn revoke(&self, token: &str) {
        if let Some(mut entry) = self.tokens.get_mut(token) {
            entry.revoked = true;
        }
    }

    /// Revoke every token bound to `session_id`.
    pub fn revoke_for_session(&self, session_id: &str) {
        if let Some(tokens) = self.by_session.get(session_id) {
            for token in tokens.iter() {
                self.revoke(token);
            }
        }
    }

    /// Remove expired and revoked entries if `cleanupCooldown` has elapsed
    /// since the last sweep; always called opportunistically from
    /// [`create`](Self::create), never on a background timer.
    fn maybe_sweep(&self) {
        let now = self.now_secs();
        let last = self.last_sweep_at.load(Ordering::Acquire);
        if now.saturating_sub(last) < self.config.cleanup_cooldown.as_secs() {
            return;
        }
        if self
            .last_sweep_at
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let dead: Vec<String> = self
            .tokens
            .iter()
            .filter(|entry| !entry.value().is_live())
            .map(|entry| entry.key().clone())
            .collect();

        for token in dead {
            self.tokens.remove(&token);
        }
        for mut tokens in self.by_session.iter_mut() {
            tokens.retain(|token| self.tokens.contains_key(token));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ttl: Duration) -> TokenConfig {
        TokenConfig {
            ttl,
            cleanup_cooldown: Duration::from_secs(0),
            callback_deadline: Duration::from_secs(300),
        }
    }

    #[test]
    fn create_rejects_empty_ids() {
        let registry = ExtensionTokenRegistry::new(config(Duration::from_secs(300)));
        assert!(registry.create("", "c1").is_err());
        assert!(registry.create("s1", "  ").is_err());
    }

    #[test]
    fn create_then_validate_roundtrips() {
        let registry = ExtensionTokenRegistry::new(config(Duration::from_secs(300)));
        let token = registry.create("s1", "c1").unwrap();
        assert!(token.starts_with("ext_"));

        let result = registry.validate(&token);
        assert!(result.valid);
        assert_eq!(result.session_id.as_deref(), Some("s1"));
        assert_eq!(result.command_id.as_deref(), Some("c1"));
    }

    #[test]
    fn validate_rejects_unknown_empty_and_whitespace() {
        let registry = ExtensionTokenRegistry::new(config(Duration::from_secs(300)));
        assert!(!registry.validate("").valid);
        assert!(!registry.validate("   ").valid);
        assert!(!registry.validate("ext_doesnotexist").valid);
    }

    #[test]
    fn validate_rejects_expired_token() {
        let registry = ExtensionTokenRegistry::new(config(Duration::from_millis(1)));
        let token = registry.create("s1", "c1").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!registry.validate(&token).valid);
    }

    #[test]
    fn revoke_invalidates_token() {
        let registry = ExtensionTokenRegistry::new(config(Duration::from_secs(300)));
        let token = registry.create("s1", "c1").unwrap();
        registry.revoke(&token);
        assert!(!registry.validate(&token).valid);
    }

    #[test]
    fn revoke_for_session_invalidates_every_bound_token() {
        let registry = ExtensionTokenRegistry::new(config(Duration::from_secs(300)));
        let a = registry.create("s1", "c1").unwrap();
        let b = registry.create("s1", "c2").unwrap();
        let other = registry.create("s2", "c3").unwrap();

        registry.revoke_for_session("s1");

        assert!(!registry.validate(&a).valid);
        assert!(!registry.validate(&b).valid);
        assert!(registry.validate(&other).valid);
    }

    #[test]
    fn sweep_removes_expired_entries_on_next_create() {
        let registry = ExtensionTokenRegistry::new(config(Duration::from_millis(1)));
        let _expired = registry.create("s1", "c1").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(registry.len(), 1);
        let _fresh = registry.create("s2", "c2").unwrap();
        // Cleanup cooldown is zero in this config, so `create` sweeps
        // immediately and the expired entry from `s1` is gone.
        assert_eq!(registry.len(), 1);
    }
}
