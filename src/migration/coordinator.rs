//! Crash recovery for in-doubt migrations.
//!
//! On startup the [`MigrationCoordinator`] loads every recovery
//! document left behind by a crashed donor and settles each one. A
//! pending document is never resolved by guessing: the coordinator
//! observes the authority's committed chunk and adopts whatever outcome
//! the authority durably applied. Effects are re-driven idempotently,
//! so recovering a migration whose effects partially landed is safe.

use crate::authority::ClusterAuthority;
use crate::error::{Error, Result};
use crate::migration::recovery::{MigrationDecision, MigrationRecoveryDocument, RecoveryStore};
use crate::migration::transport::RecipientRpc;
use crate::ownership::RangeOwnershipTable;
use crate::range_deletion::RangeDeletionScheduler;
use crate::types::ShardId;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of one recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Migrations settled as committed.
    pub committed: usize,
    /// Migrations settled as aborted.
    pub aborted: usize,
    /// Migrations left unsettled, typically because the authority or
    /// the recipient was unreachable. Their documents remain for the
    /// next pass.
    pub unresolved: usize,
}

/// Settles in-doubt migrations against authoritative cluster state.
#[derive(Debug)]
pub struct MigrationCoordinator {
    shard_id: ShardId,
    recovery_store: Arc<dyn RecoveryStore>,
    ownership: Arc<RangeOwnershipTable>,
    authority: Arc<dyn ClusterAuthority>,
    scheduler: Arc<RangeDeletionScheduler>,
}

impl MigrationCoordinator {
    /// Create a coordinator for one shard.
    pub fn new(
        shard_id: ShardId,
        recovery_store: Arc<dyn RecoveryStore>,
        ownership: Arc<RangeOwnershipTable>,
        authority: Arc<dyn ClusterAuthority>,
        scheduler: Arc<RangeDeletionScheduler>,
    ) -> Self {
        Self {
            shard_id,
            recovery_store,
            ownership,
            authority,
            scheduler,
        }
    }

    /// Settle every recovery document left behind by a crash.
    ///
    /// `peers` maps shard ids to recipient transports, used to re-signal
    /// an outcome the recipient may have missed.
    pub async fn recover(
        &self,
        peers: &HashMap<ShardId, Arc<dyn RecipientRpc>>,
    ) -> Result<RecoverySummary> {
        let docs = self.recovery_store.load_all().await?;
        let mut summary = RecoverySummary::default();
        if docs.is_empty() {
            return Ok(summary);
        }
        tracing::info!(
            shard = self.shard_id,
            count = docs.len(),
            "Recovering in-doubt migrations"
        );

        for doc in docs {
            match self.settle_one(&doc, peers).await {
                Ok(MigrationDecision::Committed) => summary.committed += 1,
                Ok(MigrationDecision::Aborted) => summary.aborted += 1,
                Ok(MigrationDecision::Pending) => summary.unresolved += 1,
                Err(e) => {
                    summary.unresolved += 1;
                    tracing::warn!(
                        migration_id = %doc.migration_id,
                        error = %e,
                        "Migration left unresolved, will retry on next pass"
                    );
                }
            }
        }

        tracing::info!(
            shard = self.shard_id,
            committed = summary.committed,
            aborted = summary.aborted,
            unresolved = summary.unresolved,
            "Recovery pass complete"
        );
        Ok(summary)
    }

    async fn settle_one(
        &self,
        doc: &MigrationRecoveryDocument,
        peers: &HashMap<ShardId, Arc<dyn RecipientRpc>>,
    ) -> Result<MigrationDecision> {
        // Refresh routing before anything else: re-driving effects is
        // idempotent only against current authoritative metadata.
        let info = self.authority.refresh_routing(doc.collection).await?;
        self.ownership.install_routing_info(info)?;

        let decision = match doc.decision {
            MigrationDecision::Committed => MigrationDecision::Committed,
            MigrationDecision::Aborted => MigrationDecision::Aborted,
            MigrationDecision::Pending => self.observe_outcome(doc).await?,
        };

        match decision {
            MigrationDecision::Committed => self.redrive_commit(doc, peers).await?,
            MigrationDecision::Aborted => self.redrive_abort(doc, peers).await?,
            MigrationDecision::Pending => {}
        }
        Ok(decision)
    }

    /// Resolve a pending document by observing which shard the
    /// authority durably assigned the chunk to.
    async fn observe_outcome(
        &self,
        doc: &MigrationRecoveryDocument,
    ) -> Result<MigrationDecision> {
        let chunk = self
            .authority
            .committed_chunk(doc.collection, &doc.range)
            .await?;
        if chunk.shard == doc.recipient && chunk.version > doc.pre_migration_version {
            tracing::info!(
                migration_id = %doc.migration_id,
                "Authority shows handoff applied, settling as committed"
            );
            return Ok(MigrationDecision::Committed);
        }
        if chunk.shard == doc.donor {
            tracing::info!(
                migration_id = %doc.migration_id,
                "Authority shows donor still owns the range, settling as aborted"
            );
            return Ok(MigrationDecision::Aborted);
        }
        Err(Error::ManualInterventionRequired(format!(
            "chunk {} owned by shard {}, neither donor {} nor recipient {}",
            doc.range, chunk.shard, doc.donor, doc.recipient
        )))
    }

    async fn redrive_commit(
        &self,
        doc: &MigrationRecoveryDocument,
        peers: &HashMap<ShardId, Arc<dyn RecipientRpc>>,
    ) -> Result<()> {
        self.recovery_store
            .update_decision(doc.migration_id, MigrationDecision::Committed)
            .await?;

        // The routing refresh above already moved local ownership; what
        // may still be missing is the deletion task and the recipient's
        // notification.
        match self
            .scheduler
            .schedule(doc.collection, &doc.ns, doc.range.clone(), doc.donor)
            .await
        {
            Ok(task_id) => self.scheduler.mark_ready(task_id).await?,
            Err(Error::OverlappingRangeDeletion(_)) => {
                self.scheduler
                    .mark_overlapping_ready(doc.collection, &doc.range)
                    .await?;
            }
            Err(e) => return Err(e),
        }

        self.signal_peer(doc, peers, MigrationDecision::Committed)
            .await?;
        self.recovery_store.remove(doc.migration_id).await
    }

    async fn redrive_abort(
        &self,
        doc: &MigrationRecoveryDocument,
        peers: &HashMap<ShardId, Arc<dyn RecipientRpc>>,
    ) -> Result<()> {
        self.recovery_store
            .update_decision(doc.migration_id, MigrationDecision::Aborted)
            .await?;
        self.signal_peer(doc, peers, MigrationDecision::Aborted)
            .await?;
        self.recovery_store.remove(doc.migration_id).await
    }

    async fn signal_peer(
        &self,
        doc: &MigrationRecoveryDocument,
        peers: &HashMap<ShardId, Arc<dyn RecipientRpc>>,
        decision: MigrationDecision,
    ) -> Result<()> {
        let Some(rpc) = peers.get(&doc.recipient) else {
            tracing::warn!(
                migration_id = %doc.migration_id,
                recipient = doc.recipient,
                "No transport to recipient, outcome not re-signaled"
            );
            return Ok(());
        };
        match rpc.signal_decision(doc.migration_id, decision).await {
            Ok(()) => Ok(()),
            // The recipient may have restarted and forgotten the
            // session; nothing is left there to settle.
            Err(Error::MigrationNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
