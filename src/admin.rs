//! Shard node wiring and the administrative command surface.
//!
//! A [`ShardNode`] assembles the migration machinery for one shard and
//! exposes the data path (ownership-filtered reads and writes) plus the
//! `move_range` command a balancer or operator drives migrations with.

use crate::authority::ClusterAuthority;
use crate::config::{MigrationConfig, RangeDeletionConfig};
use crate::error::{Error, Result};
use crate::metrics::MigrationMetrics;
use crate::migration::coordinator::{MigrationCoordinator, RecoverySummary};
use crate::migration::donor::{ActiveMigrationRegistry, DonorDeps, MigrationSourceManager};
use crate::migration::recipient::MigrationDestinationManager;
use crate::migration::recovery::RecoveryStore;
use crate::migration::transport::RecipientRpc;
use crate::orphan::OrphanFilter;
use crate::ownership::RangeOwnershipTable;
use crate::range_deletion::{RangeDeletionScheduler, RangeDeletionStore};
use crate::storage::ShardStorage;
use crate::types::{CollectionUuid, Document, KeyRange, ModOp, ShardId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Request to migrate a range to another shard.
#[derive(Debug, Clone)]
pub struct MoveRangeRequest {
    /// Namespace of the sharded collection.
    pub ns: String,
    /// The range to migrate; must match an existing chunk exactly.
    pub range: KeyRange,
    /// The receiving shard.
    pub to_shard: ShardId,
}

/// Outcome of a `move_range` command.
#[derive(Debug, Clone)]
pub struct MoveRangeResponse {
    /// Whether the migration committed.
    pub ok: bool,
    /// Id of the migration that ran, when one was started.
    pub migration_id: Option<Uuid>,
    /// Stable error code on failure.
    pub code: Option<u32>,
    /// Error message on failure.
    pub error: Option<String>,
}

impl MoveRangeResponse {
    fn committed(migration_id: Uuid) -> Self {
        Self {
            ok: true,
            migration_id: Some(migration_id),
            code: None,
            error: None,
        }
    }

    fn failed(migration_id: Option<Uuid>, e: &Error) -> Self {
        Self {
            ok: false,
            migration_id,
            code: Some(e.code()),
            error: Some(e.to_string()),
        }
    }
}

/// One shard's assembled migration subsystem.
#[derive(Debug)]
pub struct ShardNode {
    shard_id: ShardId,
    config: MigrationConfig,
    storage: Arc<dyn ShardStorage>,
    ownership: Arc<RangeOwnershipTable>,
    orphan: Arc<OrphanFilter>,
    recovery_store: Arc<dyn RecoveryStore>,
    scheduler: Arc<RangeDeletionScheduler>,
    authority: Arc<dyn ClusterAuthority>,
    registry: Arc<ActiveMigrationRegistry>,
    metrics: Arc<MigrationMetrics>,
    destination: Arc<MigrationDestinationManager>,
    coordinator: MigrationCoordinator,
    peers: RwLock<HashMap<ShardId, Arc<dyn RecipientRpc>>>,
}

impl ShardNode {
    /// Assemble a node from its durable collaborators.
    pub fn new(
        shard_id: ShardId,
        storage: Arc<dyn ShardStorage>,
        recovery_store: Arc<dyn RecoveryStore>,
        deletion_store: Arc<dyn RangeDeletionStore>,
        authority: Arc<dyn ClusterAuthority>,
        config: MigrationConfig,
        deletion_config: RangeDeletionConfig,
    ) -> Arc<Self> {
        let ownership = Arc::new(RangeOwnershipTable::new(shard_id));
        let orphan = Arc::new(OrphanFilter::new(ownership.clone()));
        let metrics = Arc::new(MigrationMetrics::new());
        let scheduler = Arc::new(RangeDeletionScheduler::new(
            storage.clone(),
            deletion_store,
            ownership.clone(),
            deletion_config,
            metrics.clone(),
        ));
        let destination = Arc::new(MigrationDestinationManager::new(
            shard_id,
            storage.clone(),
            ownership.clone(),
            authority.clone(),
            scheduler.clone(),
        ));
        let coordinator = MigrationCoordinator::new(
            shard_id,
            recovery_store.clone(),
            ownership.clone(),
            authority.clone(),
            scheduler.clone(),
        );
        Arc::new(Self {
            shard_id,
            config,
            storage,
            ownership,
            orphan,
            recovery_store,
            scheduler,
            authority,
            registry: Arc::new(ActiveMigrationRegistry::new()),
            metrics,
            destination,
            coordinator,
            peers: RwLock::new(HashMap::new()),
        })
    }

    /// This node's shard id.
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// The storage engine.
    pub fn storage(&self) -> &Arc<dyn ShardStorage> {
        &self.storage
    }

    /// The ownership table.
    pub fn ownership(&self) -> &Arc<RangeOwnershipTable> {
        &self.ownership
    }

    /// The incoming-migration manager, for transports to wrap.
    pub fn destination(&self) -> &Arc<MigrationDestinationManager> {
        &self.destination
    }

    /// The range deletion scheduler.
    pub fn scheduler(&self) -> &Arc<RangeDeletionScheduler> {
        &self.scheduler
    }

    /// Shard-level counters.
    pub fn metrics(&self) -> &Arc<MigrationMetrics> {
        &self.metrics
    }

    /// Register a transport to a peer shard.
    pub fn add_peer(&self, shard: ShardId, rpc: Arc<dyn RecipientRpc>) {
        self.peers.write().insert(shard, rpc);
    }

    /// The collaborators a donor built outside this node would need, for
    /// callers that drive [`MigrationSourceManager`] directly.
    pub fn donor_deps(&self) -> DonorDeps {
        DonorDeps {
            storage: self.storage.clone(),
            ownership: self.ownership.clone(),
            orphan: self.orphan.clone(),
            recovery_store: self.recovery_store.clone(),
            scheduler: self.scheduler.clone(),
            authority: self.authority.clone(),
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Pull routing info for a collection from the authority.
    pub async fn refresh_routing(&self, collection: CollectionUuid) -> Result<()> {
        let info = self.authority.refresh_routing(collection).await?;
        self.ownership.install_routing_info(info)?;
        Ok(())
    }

    /// Apply a write through the ownership and migration gates.
    pub async fn apply(&self, collection: CollectionUuid, op: ModOp) -> Result<()> {
        self.orphan.guard_write(collection, &op)?;
        match op.kind {
            crate::types::ModKind::Insert(doc) | crate::types::ModKind::Update(doc) => {
                self.storage.upsert(collection, doc).await
            }
            crate::types::ModKind::Delete { key } => {
                self.storage.delete(collection, &key).await?;
                Ok(())
            }
        }
    }

    /// Fetch a document, returning nothing for keys this shard merely
    /// stores but does not own.
    pub async fn find(&self, collection: CollectionUuid, key: &[u8]) -> Result<Option<Document>> {
        let Some(doc) = self.storage.get(collection, key).await? else {
            return Ok(None);
        };
        Ok(self.orphan.filter_read(collection, [doc]).next())
    }

    /// Count the documents this shard owns, filtering orphans.
    pub async fn owned_count(&self, collection: CollectionUuid) -> Result<u64> {
        let docs = self
            .storage
            .snapshot_range(collection, &KeyRange::full())
            .await?;
        Ok(self.orphan.filter_read(collection, docs).count() as u64)
    }

    /// Count the documents physically present, orphans included.
    pub async fn raw_count(&self, collection: CollectionUuid) -> Result<u64> {
        self.storage.count_range(collection, &KeyRange::full()).await
    }

    /// Migrate a range to another shard and wait for the outcome.
    pub async fn move_range(&self, req: MoveRangeRequest) -> MoveRangeResponse {
        match self.move_range_inner(req).await {
            Ok(migration_id) => MoveRangeResponse::committed(migration_id),
            Err((migration_id, e)) => {
                tracing::warn!(error = %e, "move_range failed");
                MoveRangeResponse::failed(migration_id, &e)
            }
        }
    }

    async fn move_range_inner(
        &self,
        req: MoveRangeRequest,
    ) -> std::result::Result<Uuid, (Option<Uuid>, Error)> {
        let collection = self
            .storage
            .collection_uuid(&req.ns)
            .await
            .map_err(|e| (None, e))?
            .ok_or_else(|| (None, Error::CollectionNotFound(req.ns.clone())))?;
        let rpc = self
            .peers
            .read()
            .get(&req.to_shard)
            .cloned()
            .ok_or_else(|| {
                (
                    None,
                    Error::Internal(format!("no transport to shard {}", req.to_shard)),
                )
            })?;

        let donor = MigrationSourceManager::new(
            req.ns,
            collection,
            req.range,
            req.to_shard,
            self.config.clone(),
            self.donor_deps(),
        );
        let migration_id = donor.migration_id();
        donor.run(rpc).await.map_err(|e| (Some(migration_id), e))?;

        if self.config.wait_for_delete {
            if let Some(task_id) = donor.scheduled_deletion() {
                self.scheduler
                    .execute(task_id)
                    .await
                    .map_err(|e| (Some(migration_id), e))?;
            }
        }
        Ok(migration_id)
    }

    /// Abort incoming sessions whose donor went silent past the
    /// configured idle deadline, discarding their cloned data. Run
    /// periodically; a dead donor leaves nothing durable that any
    /// recovery pass could settle here.
    pub async fn expire_idle_recipient_sessions(&self) -> Result<usize> {
        self.destination
            .expire_idle_sessions(self.config.recipient_session_timeout)
            .await
    }

    /// Reload persisted cleanup tasks and settle in-doubt migrations.
    /// Run once after a restart, before serving traffic.
    pub async fn recover_on_startup(&self) -> Result<RecoverySummary> {
        let resumed = self.scheduler.load_persisted().await?;
        if resumed > 0 {
            tracing::info!(
                shard = self.shard_id,
                tasks = resumed,
                "Resumed persisted range deletion tasks"
            );
        }
        let peers = self.peers.read().clone();
        self.coordinator.recover(&peers).await
    }
}
