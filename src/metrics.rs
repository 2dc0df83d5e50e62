//! Migration observability counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge that can increase or decrease.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    /// Create a new gauge.
    pub const fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }

    /// Increment the gauge by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the gauge by 1.
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics for migration and range deletion operations.
#[derive(Debug)]
pub struct MigrationMetrics {
    /// Migrations currently in flight on this shard (donor side).
    pub migrations_active: Gauge,
    /// Total migrations started.
    pub migrations_started: Counter,
    /// Total migrations committed.
    pub migrations_committed: Counter,
    /// Total migrations aborted.
    pub migrations_aborted: Counter,
    /// Clone batches sent to recipients.
    pub clone_batches_sent: Counter,
    /// Documents cloned to recipients.
    pub documents_cloned: Counter,
    /// Write ops forwarded from the mods buffer.
    pub mods_transferred: Counter,
    /// Range deletion tasks executed to completion.
    pub range_deletions_completed: Counter,
    /// Documents removed by range deletion.
    pub documents_deleted: Counter,
}

impl MigrationMetrics {
    /// Create new migration metrics.
    pub const fn new() -> Self {
        Self {
            migrations_active: Gauge::new(),
            migrations_started: Counter::new(),
            migrations_committed: Counter::new(),
            migrations_aborted: Counter::new(),
            clone_batches_sent: Counter::new(),
            documents_cloned: Counter::new(),
            mods_transferred: Counter::new(),
            range_deletions_completed: Counter::new(),
            documents_deleted: Counter::new(),
        }
    }

    /// Record a migration start.
    pub fn record_start(&self) {
        self.migrations_started.inc();
        self.migrations_active.inc();
    }

    /// Record a committed migration.
    pub fn record_commit(&self) {
        self.migrations_committed.inc();
        self.migrations_active.dec();
    }

    /// Record an aborted migration.
    pub fn record_abort(&self) {
        self.migrations_aborted.inc();
        self.migrations_active.dec();
    }
}

impl Default for MigrationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
