//! Global atomic counters for engine observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a consolidation pass).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters — no allocations, no locking.
pub struct Metrics {
    entries_created: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
    expirations: AtomicU64,
    surprises_recorded: AtomicU64,
    patterns_detected: AtomicU64,
    patches_applied: AtomicU64,
    missed_writes: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            entries_created: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            demotions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            surprises_recorded: AtomicU64::new(0),
            patterns_detected: AtomicU64::new(0),
            patches_applied: AtomicU64::new(0),
            missed_writes: AtomicU64::new(0),
        }
    }

    pub fn inc_entries_created(&self) {
        self.entries_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_promotions(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_demotions(&self) {
        self.demotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_expirations(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_surprises_recorded(&self) {
        self.surprises_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_patterns_detected(&self) {
        self.patterns_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_patches_applied(&self) {
        self.patches_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_missed_writes(&self) {
        self.missed_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call at natural boundaries (end of a consolidation pass, daemon
    /// tick) rather than on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            entries_created = self.entries_created(),
            promotions = self.promotions(),
            demotions = self.demotions(),
            expirations = self.expirations(),
            surprises_recorded = self.surprises_recorded(),
            patterns_detected = self.patterns_detected(),
            patches_applied = self.patches_applied(),
            missed_writes = self.missed_writes(),
        );
    }

    pub fn entries_created(&self) -> u64 {
        self.entries_created.load(Ordering::Relaxed)
    }

    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    pub fn demotions(&self) -> u64 {
        self.demotions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    pub fn surprises_recorded(&self) -> u64 {
        self.surprises_recorded.load(Ordering::Relaxed)
    }

    pub fn patterns_detected(&self) -> u64 {
        self.patterns_detected.load(Ordering::Relaxed)
    }

    pub fn patches_applied(&self) -> u64 {
        self.patches_applied.load(Ordering::Relaxed)
    }

    pub fn missed_writes(&self) -> u64 {
        self.missed_writes.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.entries_created.store(0, Ordering::Relaxed);
        self.promotions.store(0, Ordering::Relaxed);
        self.demotions.store(0, Ordering::Relaxed);
        self.expirations.store(0, Ordering::Relaxed);
        self.surprises_recorded.store(0, Ordering::Relaxed);
        self.patterns_detected.store(0, Ordering::Relaxed);
        self.patches_applied.store(0, Ordering::Relaxed);
        self.missed_writes.store(0, Ordering::Relaxed);
    }
}
