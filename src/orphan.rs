//! Orphan filtering for the read and write paths.
//!
//! A shard may physically hold documents it no longer (or not yet) owns
//! while a migration or range deletion is in progress. The
//! [`OrphanFilter`] wraps both paths so those documents are never
//! returned to readers and never silently written.

use crate::error::{Error, Result};
use crate::ownership::RangeOwnershipTable;
use crate::types::{CollectionUuid, Document, KeyRange, ModOp};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Buffer of write operations captured on the donor during cloning,
/// drained to the recipient before the critical-section commit.
#[derive(Debug, Default)]
pub struct ModsBuffer {
    ops: Mutex<VecDeque<ModOp>>,
}

impl ModsBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an op.
    pub fn push(&self, op: ModOp) {
        self.ops.lock().push_back(op);
    }

    /// Drain up to `max` ops in arrival order.
    pub fn drain(&self, max: usize) -> Vec<ModOp> {
        let mut ops = self.ops.lock();
        let n = max.min(ops.len());
        ops.drain(..n).collect()
    }

    /// Number of buffered ops.
    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }
}

/// Hook registered by an outgoing migration so the write path forwards
/// ops on the migrating range into its mods buffer.
#[derive(Debug, Clone)]
pub struct MigrationWriteHook {
    /// The migration this hook belongs to.
    pub migration_id: Uuid,
    /// The migrating range.
    pub range: KeyRange,
    /// Captured write ops, drained by the donor's catch-up loop.
    pub buffer: Arc<ModsBuffer>,
    /// Raised while the donor holds its critical section; writes to the
    /// range fail with a retryable routing error instead of queueing.
    pub critical_section: Arc<AtomicBool>,
}

/// Wraps the read and write paths with point-in-time ownership checks.
#[derive(Debug)]
pub struct OrphanFilter {
    table: Arc<RangeOwnershipTable>,
    hooks: RwLock<HashMap<CollectionUuid, Vec<MigrationWriteHook>>>,
}

impl OrphanFilter {
    /// Create a filter over a shard's ownership table.
    pub fn new(table: Arc<RangeOwnershipTable>) -> Self {
        Self {
            table,
            hooks: RwLock::new(HashMap::new()),
        }
    }

    /// Lazily drop documents whose key is outside all currently-owned
    /// ranges. Ownership is consulted per document at yield time, so an
    /// in-flight fetch reflects point-in-time ownership rather than the
    /// snapshot it started from.
    pub fn filter_read<'a, I>(
        &'a self,
        collection: CollectionUuid,
        docs: I,
    ) -> impl Iterator<Item = Document> + 'a
    where
        I: IntoIterator<Item = Document> + 'a,
        I::IntoIter: 'a,
    {
        docs.into_iter()
            .filter(move |doc| self.table.lookup(collection, &doc.key).owned)
    }

    /// Gate a write before it reaches storage.
    ///
    /// Fails with [`Error::NotOwner`] when this shard does not own the
    /// key's range, and [`Error::CriticalSectionActive`] while an
    /// ownership handoff for the range is in its commit window. While a
    /// migration is cloning, the op is also forwarded into its mods
    /// buffer so it reaches the recipient before commit.
    pub fn guard_write(&self, collection: CollectionUuid, op: &ModOp) -> Result<()> {
        let lookup = self.table.lookup(collection, op.key());
        if !lookup.owned {
            return Err(Error::NotOwner {
                shard: self.table.shard_id(),
            });
        }

        let hooks = self.hooks.read();
        if let Some(active) = hooks.get(&collection) {
            for hook in active.iter().filter(|h| h.range.contains(op.key())) {
                if hook.critical_section.load(Ordering::Acquire) {
                    tracing::debug!(
                        collection = %collection,
                        op = op.display_name(),
                        "Write rejected during migration critical section"
                    );
                    return Err(Error::CriticalSectionActive);
                }
                hook.buffer.push(op.clone());
            }
        }
        Ok(())
    }

    /// Raise a migration's critical-section gate.
    ///
    /// Takes the hooks write lock, which excludes in-flight
    /// [`guard_write`](Self::guard_write) calls: when this returns,
    /// every write admitted under the open gate is already in the mods
    /// buffer, and every later write observes the raised gate. The
    /// donor's final buffer drain therefore misses nothing.
    pub fn enter_critical_section(&self, collection: CollectionUuid, migration_id: Uuid) {
        let hooks = self.hooks.write();
        if let Some(hook) = hooks
            .get(&collection)
            .and_then(|active| active.iter().find(|h| h.migration_id == migration_id))
        {
            hook.critical_section.store(true, Ordering::Release);
        }
    }

    /// Register an outgoing migration's write hook.
    pub fn register_migration(&self, collection: CollectionUuid, hook: MigrationWriteHook) {
        self.hooks.write().entry(collection).or_default().push(hook);
    }

    /// Remove a migration's write hook.
    pub fn deregister_migration(&self, collection: CollectionUuid, migration_id: Uuid) {
        let mut hooks = self.hooks.write();
        if let Some(active) = hooks.get_mut(&collection) {
            active.retain(|h| h.migration_id != migration_id);
            if active.is_empty() {
                hooks.remove(&collection);
            }
        }
    }
}
