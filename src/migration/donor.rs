//! Donor-side migration driver.
//!
//! A [`MigrationSourceManager`] drives one outgoing migration through
//! clone, catch-up, and the critical-section commit. The commit
//! protocol is write-ahead: a pending recovery document reaches the
//! durable store before the authority is asked to commit, so a crash at
//! any point leaves enough state behind for the coordinator to settle
//! the outcome from authoritative cluster metadata.

use crate::authority::ClusterAuthority;
use crate::config::MigrationConfig;
use crate::error::{Error, Result};
use crate::metrics::MigrationMetrics;
use crate::migration::recovery::{MigrationDecision, MigrationRecoveryDocument, RecoveryStore};
use crate::migration::transport::{CloneBatch, RecipientRpc, StartRecipientRequest};
use crate::orphan::{MigrationWriteHook, ModsBuffer, OrphanFilter};
use crate::ownership::RangeOwnershipTable;
use crate::range_deletion::RangeDeletionScheduler;
use crate::storage::ShardStorage;
use crate::types::{ChunkVersion, CollectionUuid, KeyRange, ShardId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// State of an outgoing migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DonorState {
    /// Constructed, preconditions not yet checked.
    Created,
    /// Cloning the range and draining buffered writes.
    CloningCatchup,
    /// Writes to the range are blocked while the commit settles.
    CriticalSection,
    /// The handoff committed; the range now belongs to the recipient.
    Committed,
    /// The migration was abandoned; this shard keeps the range.
    Aborted,
}

/// Tracks in-flight outgoing migrations so overlapping ranges never
/// migrate concurrently.
#[derive(Debug, Default)]
pub struct ActiveMigrationRegistry {
    active: Mutex<std::collections::HashMap<CollectionUuid, Vec<(Uuid, KeyRange)>>>,
}

impl ActiveMigrationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `range` for a migration. Fails if any in-flight migration
    /// overlaps it, or if the shard-wide concurrency limit is reached.
    pub fn register(
        &self,
        collection: CollectionUuid,
        migration_id: Uuid,
        range: KeyRange,
        max_total: usize,
    ) -> Result<()> {
        let mut active = self.active.lock();
        let total: usize = active.values().map(|v| v.len()).sum();
        if total >= max_total {
            return Err(Error::TooManyMigrations);
        }
        if let Some(list) = active.get(&collection) {
            if let Some((other, other_range)) = list.iter().find(|(_, r)| r.overlaps(&range)) {
                return Err(Error::ConflictingOperationInProgress(format!(
                    "migration {} already covers {}",
                    other, other_range
                )));
            }
        }
        active.entry(collection).or_default().push((migration_id, range));
        Ok(())
    }

    /// Release a migration's claim.
    pub fn deregister(&self, collection: CollectionUuid, migration_id: Uuid) {
        let mut active = self.active.lock();
        if let Some(list) = active.get_mut(&collection) {
            list.retain(|(id, _)| *id != migration_id);
            if list.is_empty() {
                active.remove(&collection);
            }
        }
    }

    /// Number of in-flight migrations.
    pub fn len(&self) -> usize {
        self.active.lock().values().map(|v| v.len()).sum()
    }

    /// Whether no migration is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared collaborators a donor needs.
#[derive(Debug, Clone)]
pub struct DonorDeps {
    /// Local storage engine.
    pub storage: Arc<dyn ShardStorage>,
    /// Local ownership table.
    pub ownership: Arc<RangeOwnershipTable>,
    /// Read/write path filter, for write hook registration.
    pub orphan: Arc<OrphanFilter>,
    /// Durable recovery document store.
    pub recovery_store: Arc<dyn RecoveryStore>,
    /// Post-commit range cleanup.
    pub scheduler: Arc<RangeDeletionScheduler>,
    /// Cluster metadata authority.
    pub authority: Arc<dyn ClusterAuthority>,
    /// In-flight migration claims.
    pub registry: Arc<ActiveMigrationRegistry>,
    /// Shard-level counters.
    pub metrics: Arc<MigrationMetrics>,
}

/// Drives one outgoing migration on the donor shard.
#[derive(Debug)]
pub struct MigrationSourceManager {
    migration_id: Uuid,
    ns: String,
    collection: CollectionUuid,
    range: KeyRange,
    recipient_shard: ShardId,
    config: MigrationConfig,
    deps: DonorDeps,
    state: Mutex<DonorState>,
    cancel: AtomicBool,
    buffer: Arc<ModsBuffer>,
    critical_section: Arc<AtomicBool>,
    scheduled_deletion: Mutex<Option<Uuid>>,
}

impl MigrationSourceManager {
    /// Create a donor for one migration.
    pub fn new(
        ns: impl Into<String>,
        collection: CollectionUuid,
        range: KeyRange,
        recipient_shard: ShardId,
        config: MigrationConfig,
        deps: DonorDeps,
    ) -> Self {
        Self {
            migration_id: Uuid::new_v4(),
            ns: ns.into(),
            collection,
            range,
            recipient_shard,
            config,
            deps,
            state: Mutex::new(DonorState::Created),
            cancel: AtomicBool::new(false),
            buffer: Arc::new(ModsBuffer::new()),
            critical_section: Arc::new(AtomicBool::new(false)),
            scheduled_deletion: Mutex::new(None),
        }
    }

    /// This migration's id.
    pub fn migration_id(&self) -> Uuid {
        self.migration_id
    }

    /// Current state.
    pub fn state(&self) -> DonorState {
        *self.state.lock()
    }

    /// Range deletion task scheduled at commit, if any.
    pub fn scheduled_deletion(&self) -> Option<Uuid> {
        *self.scheduled_deletion.lock()
    }

    /// Request cancellation. Honored at phase boundaries before the
    /// critical section; once the commit protocol starts, the migration
    /// runs to a durable decision.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Drive the migration to a terminal state.
    pub async fn run(&self, rpc: Arc<dyn RecipientRpc>) -> Result<()> {
        let pre_version = self.check_preconditions()?;
        self.deps.registry.register(
            self.collection,
            self.migration_id,
            self.range.clone(),
            self.config.max_concurrent,
        )?;
        self.deps.metrics.record_start();
        self.set_state(DonorState::CloningCatchup);
        tracing::info!(
            migration_id = %self.migration_id,
            ns = %self.ns,
            range = %self.range,
            to_shard = self.recipient_shard,
            "Migration started"
        );

        self.deps.orphan.register_migration(
            self.collection,
            MigrationWriteHook {
                migration_id: self.migration_id,
                range: self.range.clone(),
                buffer: self.buffer.clone(),
                critical_section: self.critical_section.clone(),
            },
        );

        let result = self.drive(rpc.as_ref(), pre_version).await;

        self.critical_section.store(false, Ordering::Release);
        self.deps
            .orphan
            .deregister_migration(self.collection, self.migration_id);
        self.deps
            .registry
            .deregister(self.collection, self.migration_id);

        match &result {
            Ok(()) => {
                self.deps.metrics.record_commit();
                tracing::info!(migration_id = %self.migration_id, "Migration committed");
            }
            Err(e) => {
                self.abort_cleanup(rpc.as_ref()).await;
                self.deps.metrics.record_abort();
                tracing::warn!(
                    migration_id = %self.migration_id,
                    error = %e,
                    "Migration aborted"
                );
            }
        }
        result
    }

    fn check_preconditions(&self) -> Result<ChunkVersion> {
        if self.range.is_empty() {
            return Err(Error::Internal(format!("empty range {}", self.range)));
        }
        let chunk = self
            .deps
            .ownership
            .chunk_for_range(self.collection, &self.range)
            .ok_or_else(|| Error::Internal(format!("no chunk matching range {}", self.range)))?;
        if chunk.shard != self.deps.ownership.shard_id() {
            return Err(Error::NotOwner { shard: chunk.shard });
        }
        Ok(chunk.version)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    async fn drive(&self, rpc: &dyn RecipientRpc, pre_version: ChunkVersion) -> Result<()> {
        let donor_indexes = self.deps.storage.list_indexes(self.collection).await?;
        rpc.start_recipient(StartRecipientRequest {
            migration_id: self.migration_id,
            ns: self.ns.clone(),
            collection: self.collection,
            range: self.range.clone(),
            donor: self.deps.ownership.shard_id(),
            donor_indexes,
        })
        .await?;

        self.clone_initial_data(rpc).await?;
        self.catch_up(rpc).await?;
        self.commit(rpc, pre_version).await
    }

    /// Stream a point-in-time snapshot of the range in bounded batches.
    /// Batches carry sequence numbers, so a failed send is retried once
    /// and the recipient deduplicates.
    async fn clone_initial_data(&self, rpc: &dyn RecipientRpc) -> Result<()> {
        let snapshot = self
            .deps
            .storage
            .snapshot_range(self.collection, &self.range)
            .await?;
        let total = snapshot.len();

        let mut batches = Vec::new();
        let mut current = Vec::new();
        let mut current_bytes = 0usize;
        for doc in snapshot {
            current_bytes += doc.key.len() + doc.body.len();
            current.push(doc);
            if current.len() >= self.config.clone_batch_size
                || current_bytes >= self.config.max_clone_batch_bytes
            {
                batches.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
        }
        // Always send a final batch, even when the range is empty, so
        // the recipient session reaches its cloning state.
        batches.push(current);

        let last = batches.len() - 1;
        for (sequence, docs) in batches.into_iter().enumerate() {
            self.check_cancelled()?;
            let batch = CloneBatch {
                migration_id: self.migration_id,
                sequence: sequence as u64,
                docs,
                is_final: sequence == last,
            };
            let mut retried = false;
            loop {
                match rpc.clone_batch(batch.clone()).await {
                    Ok(applied) => {
                        self.deps.metrics.clone_batches_sent.inc();
                        self.deps.metrics.documents_cloned.inc_by(applied);
                        break;
                    }
                    Err(e) if !retried => {
                        retried = true;
                        tracing::warn!(
                            migration_id = %self.migration_id,
                            sequence = batch.sequence,
                            error = %e,
                            "Clone batch failed, retrying"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        tracing::debug!(
            migration_id = %self.migration_id,
            documents = total,
            "Initial clone complete"
        );
        Ok(())
    }

    /// Drain buffered write ops to the recipient until it reports a
    /// steady state with an empty buffer, within bounded rounds and a
    /// wall-clock budget.
    async fn catch_up(&self, rpc: &dyn RecipientRpc) -> Result<()> {
        let deadline = Instant::now() + self.config.catchup_timeout;
        for _round in 0..self.config.max_catchup_rounds {
            self.check_cancelled()?;
            if Instant::now() >= deadline {
                break;
            }
            let ops = self.buffer.drain(self.config.mods_batch_size);
            if !ops.is_empty() {
                let applied = rpc.apply_mods(self.migration_id, ops).await?;
                self.deps.metrics.mods_transferred.inc_by(applied);
                continue;
            }
            if rpc.steady_state(self.migration_id).await? {
                return Ok(());
            }
        }
        Err(Error::MigrationExceededTimeLimit)
    }

    async fn commit(&self, rpc: &dyn RecipientRpc, pre_version: ChunkVersion) -> Result<()> {
        // Writes to the range fail with a retryable routing error from
        // here until the decision settles. Raising the gate through the
        // filter synchronizes with in-flight writes: everything admitted
        // before it is in the buffer for the final drain below.
        self.deps
            .orphan
            .enter_critical_section(self.collection, self.migration_id);
        self.set_state(DonorState::CriticalSection);
        let result = self.commit_inner(rpc, pre_version).await;
        self.critical_section.store(false, Ordering::Release);
        result
    }

    async fn commit_inner(&self, rpc: &dyn RecipientRpc, pre_version: ChunkVersion) -> Result<()> {
        // Final drain: the buffer can no longer grow.
        loop {
            let ops = self.buffer.drain(self.config.mods_batch_size);
            if ops.is_empty() {
                break;
            }
            let applied = rpc.apply_mods(self.migration_id, ops).await?;
            self.deps.metrics.mods_transferred.inc_by(applied);
        }
        if !rpc.steady_state(self.migration_id).await? {
            return Err(Error::InvalidMigrationState(
                "recipient not steady at critical section".to_string(),
            ));
        }

        // Write-ahead: the pending document is durable before any
        // externally visible commit step.
        let doc = MigrationRecoveryDocument {
            migration_id: self.migration_id,
            collection: self.collection,
            ns: self.ns.clone(),
            range: self.range.clone(),
            donor: self.deps.ownership.shard_id(),
            recipient: self.recipient_shard,
            decision: MigrationDecision::Pending,
            pre_migration_version: pre_version,
        };
        self.deps.recovery_store.insert(&doc).await?;

        let ack = tokio::time::timeout(
            self.config.critical_section_timeout,
            rpc.prepare_commit(self.migration_id),
        )
        .await;
        match ack {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.record_abort_decision().await;
                return Err(e);
            }
            Err(_) => {
                self.record_abort_decision().await;
                return Err(Error::Timeout);
            }
        }

        let new_version = match self
            .deps
            .authority
            .commit_ownership_change(
                self.collection,
                &self.range,
                self.deps.ownership.shard_id(),
                self.recipient_shard,
                pre_version,
            )
            .await
        {
            Ok(v) => v,
            Err(e) => {
                self.record_abort_decision().await;
                return Err(e);
            }
        };

        // The authority applied the handoff; from here the migration is
        // committed no matter what. Finalization failures leave the
        // recovery document behind for the coordinator to settle.
        if let Err(e) = self.finalize_commit(rpc, pre_version, new_version).await {
            tracing::warn!(
                migration_id = %self.migration_id,
                error = %e,
                "Commit finalization incomplete, recovery will settle it"
            );
        }
        self.set_state(DonorState::Committed);
        Ok(())
    }

    async fn finalize_commit(
        &self,
        rpc: &dyn RecipientRpc,
        pre_version: ChunkVersion,
        new_version: ChunkVersion,
    ) -> Result<()> {
        self.deps
            .recovery_store
            .update_decision(self.migration_id, MigrationDecision::Committed)
            .await?;
        self.deps.ownership.apply_ownership_change(
            self.collection,
            &self.range,
            self.recipient_shard,
            pre_version,
            new_version,
        )?;
        let task_id = self
            .deps
            .scheduler
            .schedule(
                self.collection,
                &self.ns,
                self.range.clone(),
                self.deps.ownership.shard_id(),
            )
            .await?;
        *self.scheduled_deletion.lock() = Some(task_id);
        rpc.signal_decision(self.migration_id, MigrationDecision::Committed)
            .await?;
        self.deps.recovery_store.remove(self.migration_id).await?;
        self.deps.scheduler.mark_ready(task_id).await?;
        Ok(())
    }

    /// Record the abort decision on a pending recovery document. Best
    /// effort: a document left pending is settled by the coordinator
    /// against authoritative state.
    async fn record_abort_decision(&self) {
        if let Err(e) = self
            .deps
            .recovery_store
            .update_decision(self.migration_id, MigrationDecision::Aborted)
            .await
        {
            if !matches!(e, Error::MigrationNotFound(_)) {
                tracing::warn!(
                    migration_id = %self.migration_id,
                    error = %e,
                    "Failed to record abort decision"
                );
            }
        }
    }

    /// Abort path: nothing on the donor changed, so cleanup is telling
    /// the recipient to discard and removing any terminal recovery
    /// document.
    async fn abort_cleanup(&self, rpc: &dyn RecipientRpc) {
        self.set_state(DonorState::Aborted);
        if let Err(e) = rpc
            .signal_decision(self.migration_id, MigrationDecision::Aborted)
            .await
        {
            tracing::warn!(
                migration_id = %self.migration_id,
                error = %e,
                "Failed to signal abort to recipient"
            );
        }
        // Only a terminal document may be garbage collected here; a
        // pending one belongs to the coordinator.
        match self.deps.recovery_store.get(self.migration_id).await {
            Ok(Some(doc)) if doc.decision == MigrationDecision::Aborted => {
                if let Err(e) = self.deps.recovery_store.remove(self.migration_id).await {
                    tracing::warn!(
                        migration_id = %self.migration_id,
                        error = %e,
                        "Failed to remove aborted recovery document"
                    );
                }
            }
            _ => {}
        }
    }

    fn set_state(&self, state: DonorState) {
        *self.state.lock() = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_rejects_overlap() {
        let registry = ActiveMigrationRegistry::new();
        let coll = Uuid::new_v4();
        let a = KeyRange::new(
            crate::types::KeyBound::NegInfinity,
            crate::types::KeyBound::key(b"m".to_vec()),
        );
        let b = KeyRange::new(
            crate::types::KeyBound::key(b"f".to_vec()),
            crate::types::KeyBound::key(b"q".to_vec()),
        );
        let c = KeyRange::new(
            crate::types::KeyBound::key(b"m".to_vec()),
            crate::types::KeyBound::PosInfinity,
        );

        let first = Uuid::new_v4();
        registry.register(coll, first, a, 4).unwrap();
        let err = registry.register(coll, Uuid::new_v4(), b, 4).unwrap_err();
        assert!(matches!(err, Error::ConflictingOperationInProgress(_)));

        // Adjacent half-open ranges do not conflict.
        registry.register(coll, Uuid::new_v4(), c, 4).unwrap();
        assert_eq!(registry.len(), 2);

        registry.deregister(coll, first);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_concurrency_limit() {
        let registry = ActiveMigrationRegistry::new();
        let coll = Uuid::new_v4();
        registry
            .register(coll, Uuid::new_v4(), KeyRange::full(), 1)
            .unwrap();
        let err = registry
            .register(Uuid::new_v4(), Uuid::new_v4(), KeyRange::full(), 1)
            .unwrap_err();
        assert!(matches!(err, Error::TooManyMigrations));
    }
}
