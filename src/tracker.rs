//! Command tracker (C3): in-memory registry of live commands.
//!
//! A lock-free map of live commands: no TTL, no result
//! caching (that's C2's job) -- just "what's currently queued or executing,
//! and what's the running tally."

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::types::QueuedCommand;

/// Non-blocking live-command registry, shared by the processor and by
/// external collaborators listing queue status.
#[derive(Default)]
pub struct CommandTracker {
    commands: DashMap<String, Arc<QueuedCommand>>,
    current: RwLock<Option<Arc<QueuedCommand>>>,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Snapshot of the tracker's counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackerCounters {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl CommandTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, command: Arc<QueuedCommand>) {
        self.commands.insert(command.id.clone(), command);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<QueuedCommand>> {
        self.commands.get(id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn try_remove(&self, id: &str) -> Option<Arc<QueuedCommand>> {
        self.commands.remove(id).map(|(_, command)| command)
    }

    pub fn set_current(&self, command: Option<Arc<QueuedCommand>>) {
        *self.current.write() = command;
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<QueuedCommand>> {
        self.current.read().clone()
    }

    /// Snapshot of every id currently tracked, for `cancelAllCommands`.
    #[must_use]
    pub fn snapshot_ids(&self) -> Vec<String> {
        self.commands.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn counters(&self) -> TrackerCounters {
        TrackerCounters {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}
