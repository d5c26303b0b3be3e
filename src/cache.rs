//! Result cache (C2): bounded, per-session store keyed by command id.
//!
//! A `Mutex`-guarded map pruned into a byte-budgeted LRU -- eviction by
//! oldest `last_access_at` instead of a fixed wall-clock TTL, triggered by
//! configured thresholds *and* optional runtime memory-pressure probes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::CacheConfig;
use crate::types::{CachedResult, CachedResultMeta, CommandResult};

/// Fixed per-entry overhead added to the estimated size.
const ENTRY_OVERHEAD_BYTES: u64 = 100;
/// Estimated bytes per key/value pair in `CommandResult::data`.
const DATA_ENTRY_BYTES: u64 = 50;

/// Optional runtime memory-pressure probes -- system managed-heap load bytes
/// and process private bytes. Implementors wire these to whatever platform
/// API the embedding process has available; the cache itself only needs the
/// two numbers back.
pub trait MemoryProbe: Send + Sync {
    /// Current observed bytes, and the "high pressure" bytes ceiling the
    /// caller considers dangerous, if both are currently knowable.
    fn sample(&self) -> Option<(u64, u64)>;
}

fn estimate_bytes(result: &CommandResult) -> u64 {
    let error_len = result.error_message.as_ref().map_or(0, String::len) as u64;
    ENTRY_OVERHEAD_BYTES
        + 2 * result.output.len() as u64
        + 2 * error_len
        + DATA_ENTRY_BYTES * result.data.len() as u64
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatistics {
    pub count: usize,
    pub bytes: u64,
    pub max_bytes: u64,
    pub max_count: usize,
    pub utilization_percent: f64,
}

/// Per-session bounded result cache.
pub struct ResultCache {
    config: CacheConfig,
    entries: DashMap<String, CachedResult>,
    bytes: AtomicU64,
    /// Guards eviction and the byte counter together; reads that don't
    /// mutate stay lock-free against the concurrent map.
    eviction_lock: Mutex<()>,
    heap_probe: Option<Box<dyn MemoryProbe>>,
    process_probe: Option<Box<dyn MemoryProbe>>,
}

impl ResultCache {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            bytes: AtomicU64::new(0),
            eviction_lock: Mutex::new(()),
            heap_probe: None,
            process_probe: None,
        }
    }

    #[must_use]
    pub fn with_probes(
        config: CacheConfig,
        heap_probe: Option<Box<dyn MemoryProbe>>,
        process_probe: Option<Box<dyn MemoryProbe>>,
    ) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            bytes: AtomicU64::new(0),
            eviction_lock: Mutex::new(()),
            heap_probe,
            process_probe,
        }
    }

    /// Whether a probe reports pressure above its documented ratio: 85% for
    /// the heap probe, 75% for the process probe.
    fn probes_under_pressure(&self) -> bool {
        if let Some(probe) = &self.heap_probe {
            if let Some((observed, high)) = probe.sample() {
                if high > 0 && observed as f64 >= 0.85 * high as f64 {
                    return true;
                }
            }
        }
        if let Some(probe) = &self.process_probe {
            if let Some((observed, high)) = probe.sample() {
                if high > 0 && observed as f64 >= 0.75 * high as f64 {
                    return true;
                }
            }
        }
        false
    }

    fn configured_pressure(&self, incoming_bytes: u64) -> bool {
        let current_bytes = self.bytes.load(Ordering::Acquire);
        let count = self.entries.len();
        let byte_ceiling =
            (self.config.max_memory_bytes as f64 * self.config.memory_pressure_threshold) as u64;

        count + 1 > self.config.max_results || current_bytes + incoming_bytes > byte_ceiling
    }

    /// Evict roughly 25% of entries, oldest `last_access_at` first.
    fn evict_some(&self) {
        let _guard = self.eviction_lock.lock();

        let count = self.entries.len();
        if count == 0 {
            return;
        }
        let target = (count / 4).max(1);

        let mut candidates: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().last_access_at))
            .collect();
        candidates.sort_by_key(|(_, last_access)| *last_access);

        for (id, _) in candidates.into_iter().take(target) {
            if let Some((_, removed)) = self.entries.remove(&id) {
                let size = estimate_bytes(&removed.result);
                self.bytes.fetch_sub(size.min(self.bytes.load(Ordering::Acquire)), Ordering::AcqRel);
            }
        }
    }

    /// Store a completed result, evicting first if the insert would breach
    /// a configured or observed threshold.
    pub fn store(&self, id: String, result: CommandResult, meta: CachedResultMeta) {
        let incoming = estimate_bytes(&result);

        if self.configured_pressure(incoming) || self.probes_under_pressure() {
            self.evict_some();
        }

        let now = Instant::now();
        let entry = CachedResult {
            result,
            created_at: now,
            last_access_at: now,
            meta,
        };

        // Replacing an existing id must not double-count its bytes.
        if let Some(old) = self.entries.insert(id, entry) {
            let old_size = estimate_bytes(&old.result);
            self.bytes.fetch_sub(old_size.min(self.bytes.load(Ordering::Acquire)), Ordering::AcqRel);
        }
        self.bytes.fetch_add(incoming, Ordering::AcqRel);
    }

    /// Fetch a result, bumping `last_access_at` on hit.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<CommandResult> {
        let mut entry = self.entries.get_mut(id)?;
        entry.last_access_at = Instant::now();
        Some(entry.result.clone())
    }

    #[must_use]
    pub fn get_with_metadata(&self, id: &str) -> Option<CachedResult> {
        let mut entry = self.entries.get_mut(id)?;
        entry.last_access_at = Instant::now();
        Some(entry.clone())
    }

    #[must_use]
    pub fn has(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn remove(&self, id: &str) -> bool {
        let _guard = self.eviction_lock.lock();
        if let Some((_, removed)) = self.entries.remove(id) {
            let size = estimate_bytes(&removed.result);
            self.bytes.fetch_sub(size.min(self.bytes.load(Ordering::Acquire)), Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    pub fn clear(&self) {
        let _guard = self.eviction_lock.lock();
        self.entries.clear();
        self.bytes.store(0, Ordering::Release);
    }

    #[must_use]
    pub fn statistics(&self) -> CacheStatistics {
        let bytes = self.bytes.load(Ordering::Acquire);
        let utilization_percent = if self.config.max_memory_bytes == 0 {
            0.0
        } else {
            100.0 * bytes as f64 / self.config.max_memory_bytes as f64
        };
        CacheStatistics {
            count: self.entries.len(),
            bytes,
            max_bytes: self.config.max_memory_bytes,
            max_count: self.config.max_results,
            utilization_percent,
        }
    }
}
