//! Ambient configuration for the pipeline. Every tunable default lives here,
//! not as a magic number scattered across modules.

use std::time::Duration;

/// Configuration for the result cache (C2).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Soft cap on estimated bytes held by the cache. Default 100 MiB.
    pub max_memory_bytes: u64,
    /// Hard cap on the number of cached results. Default 1000.
    pub max_results: usize,
    /// Fraction of `max_memory_bytes` that triggers eviction before an
    /// insert that would breach it. Must lie in `[0.1, 1.0]`.
    pub memory_pressure_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 100 * 1024 * 1024,
            max_results: 1000,
            memory_pressure_threshold: 0.8,
        }
    }
}

/// Configuration for the recovery manager (C5).
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Bound on how long a cancel-and-wait step is allowed to take.
    pub cancellation_timeout: Duration,
    /// Base delay before the first restart attempt; doubles per attempt.
    pub restart_delay: Duration,
    /// How often the health probe result is allowed to be reused.
    pub health_check_interval: Duration,
    /// Attempt budget per incident.
    pub max_recovery_attempts: u32,
    /// Minimum gap between the start of two recovery attempts for the same
    /// incident.
    pub recovery_attempt_cooldown: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            cancellation_timeout: Duration::from_secs(5),
            restart_delay: Duration::from_secs(2),
            health_check_interval: Duration::from_secs(60),
            max_recovery_attempts: 3,
            recovery_attempt_cooldown: Duration::from_secs(5 * 60),
        }
    }
}

/// Configuration for the extension token registry (C7).
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Lifetime of a freshly issued token.
    pub ttl: Duration,
    /// Minimum gap between opportunistic cleanup sweeps.
    pub cleanup_cooldown: Duration,
    /// Deadline applied to an extension's `/execute` wait-for-result poll.
    pub callback_deadline: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            cleanup_cooldown: Duration::from_secs(5 * 60),
            callback_deadline: Duration::from_secs(5 * 60),
        }
    }
}

/// Top-level configuration for a single debugger-backed session.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Path to the debugger binary. `None` triggers the well-known-paths /
    /// PATH lookup.
    pub debugger_path: Option<String>,
    /// Per-command execution timeout. Also the end-to-end deadline for
    /// session start.
    pub command_timeout: Duration,
    /// Interval between heartbeat notifications while a command executes.
    pub heartbeat_interval: Duration,
    /// Bound on the command queue's channel capacity.
    pub queue_capacity: usize,
    /// Grace period given to the debugger's quit command before force-kill.
    pub stop_grace_period: Duration,
    pub cache: CacheConfig,
    pub recovery: RecoveryConfig,
    pub tokens: TokenConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            debugger_path: None,
            command_timeout: Duration::from_secs(5 * 60),
            heartbeat_interval: Duration::from_secs(10),
            queue_capacity: 256,
            stop_grace_period: Duration::from_secs(3),
            cache: CacheConfig::default(),
            recovery: RecoveryConfig::default(),
            tokens: TokenConfig::default(),
        }
    }
}
