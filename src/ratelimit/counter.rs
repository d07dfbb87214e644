//! In-process fixed-window counter used when the shared store is unavailable.
//!
//! Windows are aligned to the epoch: a 60s window always starts on the minute.
//! Across a boundary this admits up to twice the limit within one window's
//! span, which is accepted for a degraded mode. Counts are process-local and
//! vanish on restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::backend::{CountingBackend, WindowTally};
use super::clock::{Clock, SystemClock};
use crate::error::Result;

/// Default interval between sweeps of expired windows.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Count for one key in one aligned window.
#[derive(Debug, Clone, Copy)]
struct WindowSlot {
    /// `floor(now_ms / window_ms)` when the slot was opened
    index: i64,
    count: u64,
    /// Start of the next window, epoch milliseconds
    reset_ms: i64,
}

/// Process-owned fixed-window counter.
///
/// Construct one per process and share it through an `Arc`. Each key is
/// updated under its map shard lock, so concurrent checks never lose an
/// increment.
pub struct FixedWindowCounter {
    slots: DashMap<String, WindowSlot>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FixedWindowCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindowCounter")
            .field("slots", &self.slots.len())
            .finish_non_exhaustive()
    }
}

impl Default for FixedWindowCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl FixedWindowCounter {
    /// Create a counter on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a counter reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
        }
    }

    /// The clock this counter reads.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Count one attempt for `key`.
    pub fn increment(&self, key: &str, limit: u64, window: Duration) -> WindowTally {
        let now_ms = self.clock.now().timestamp_millis();
        // Saturate rather than wrap, so an oversized window never shrinks.
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1);
        let index = now_ms.div_euclid(window_ms);
        let reset_ms = index.saturating_add(1).saturating_mul(window_ms);

        let count = {
            let mut slot = self
                .slots
                .entry(key.to_string())
                .or_insert(WindowSlot {
                    index,
                    count: 0,
                    reset_ms,
                });

            if slot.index != index {
                // Rolled into a new window.
                *slot = WindowSlot {
                    index,
                    count: 0,
                    reset_ms,
                };
            }
            slot.count += 1;
            slot.count
        };

        trace!(key = %key, count, limit, "Fallback window incremented");

        let reset_at = DateTime::from_timestamp_millis(reset_ms).unwrap_or_else(Utc::now);
        WindowTally::from_count(count, limit, reset_at)
    }

    /// Current count for `key` without counting, if its window is still open.
    pub fn current_count(&self, key: &str) -> Option<u64> {
        let now_ms = self.clock.now().timestamp_millis();
        self.slots
            .get(key)
            .filter(|slot| slot.reset_ms > now_ms)
            .map(|slot| slot.count)
    }

    /// Drop every slot whose window has ended. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now_ms = self.clock.now().timestamp_millis();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.reset_ms > now_ms);
        let removed = before.saturating_sub(self.slots.len());

        if removed > 0 {
            debug!(removed, remaining = self.slots.len(), "Swept expired fallback windows");
        }
        removed
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let counter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                counter.sweep();
            }
        })
    }
}

#[async_trait]
impl CountingBackend for FixedWindowCounter {
    async fn check(&self, key: &str, limit: u64, window: Duration) -> Result<WindowTally> {
        Ok(self.increment(key, limit, window))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
