//! Global atomic counters for Synapse observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (end of an orchestration, daemon tick).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lock-free counters.
pub struct Metrics {
    tasks_started: AtomicU64,
    tasks_retried: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_skipped: AtomicU64,
    items_discarded: AtomicU64,
    items_expired: AtomicU64,
    items_consolidated: AtomicU64,
    decay_passes: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($field), "counter incremented");
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            tasks_started: AtomicU64::new(0),
            tasks_retried: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_skipped: AtomicU64::new(0),
            items_discarded: AtomicU64::new(0),
            items_expired: AtomicU64::new(0),
            items_consolidated: AtomicU64::new(0),
            decay_passes: AtomicU64::new(0),
        }
    }

    counter!(inc_tasks_started, tasks_started, tasks_started);
    counter!(inc_tasks_retried, tasks_retried, tasks_retried);
    counter!(inc_tasks_failed, tasks_failed, tasks_failed);
    counter!(inc_tasks_skipped, tasks_skipped, tasks_skipped);
    // Items dropped on read for tenant / shape violations.
    counter!(inc_items_discarded, items_discarded, items_discarded);
    counter!(inc_items_expired, items_expired, items_expired);
    counter!(inc_items_consolidated, items_consolidated, items_consolidated);
    counter!(inc_decay_passes, decay_passes, decay_passes);

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            tasks_started = self.tasks_started(),
            tasks_retried = self.tasks_retried(),
            tasks_failed = self.tasks_failed(),
            tasks_skipped = self.tasks_skipped(),
            items_discarded = self.items_discarded(),
            items_expired = self.items_expired(),
            items_consolidated = self.items_consolidated(),
            decay_passes = self.decay_passes(),
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.tasks_started,
            &self.tasks_retried,
            &self.tasks_failed,
            &self.tasks_skipped,
            &self.items_discarded,
            &self.items_expired,
            &self.items_consolidated,
            &self.decay_passes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
