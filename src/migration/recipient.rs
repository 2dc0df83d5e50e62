//! Recipient-side migration sessions.
//!
//! The [`MigrationDestinationManager`] owns every incoming migration on
//! a shard: it prepares the local collection, applies clone batches and
//! forwarded write ops, and reacts to the donor's durable decision.
//! Until the decision arrives, the incoming range stays invisible to
//! readers because the ownership table still routes it to the donor.

use crate::authority::ClusterAuthority;
use crate::error::{Error, Result};
use crate::migration::recovery::MigrationDecision;
use crate::migration::transport::{CloneBatch, StartRecipientRequest};
use crate::ownership::RangeOwnershipTable;
use crate::range_deletion::RangeDeletionScheduler;
use crate::storage::ShardStorage;
use crate::types::{CollectionUuid, KeyRange, ModKind, ModOp, ShardId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// State of an incoming migration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationState {
    /// Session opened, collection prepared, no data received yet.
    Ready,
    /// Receiving the initial clone stream.
    Cloning,
    /// Initial clone done, applying forwarded ops, ready to commit.
    Steady,
    /// The handoff committed; this shard now owns the range.
    Committed,
    /// The migration aborted; cloned data has been discarded.
    Aborted,
}

#[derive(Debug)]
struct RecipientSession {
    state: DestinationState,
    ns: String,
    collection: CollectionUuid,
    range: KeyRange,
    donor: ShardId,
    seen_sequences: HashSet<u64>,
    docs_cloned: u64,
    mods_applied: u64,
    last_activity: Instant,
}

/// Manages every incoming migration on one shard.
#[derive(Debug)]
pub struct MigrationDestinationManager {
    shard_id: ShardId,
    storage: Arc<dyn ShardStorage>,
    ownership: Arc<RangeOwnershipTable>,
    authority: Arc<dyn ClusterAuthority>,
    scheduler: Arc<RangeDeletionScheduler>,
    sessions: RwLock<HashMap<Uuid, RecipientSession>>,
}

impl MigrationDestinationManager {
    /// Create a manager for one shard.
    pub fn new(
        shard_id: ShardId,
        storage: Arc<dyn ShardStorage>,
        ownership: Arc<RangeOwnershipTable>,
        authority: Arc<dyn ClusterAuthority>,
        scheduler: Arc<RangeDeletionScheduler>,
    ) -> Self {
        Self {
            shard_id,
            storage,
            ownership,
            authority,
            scheduler,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Open a session and prepare the local collection.
    ///
    /// If the collection does not exist locally it is created with the
    /// donor's UUID and indexes. If it exists, its UUID must match the
    /// donor's, and a non-empty collection must already carry every
    /// donor index. A range this shard is still cleaning up from an
    /// earlier migration is refused outright: the outstanding deletion
    /// task would destroy the incoming documents once they commit. All
    /// checks fail fast, before any data moves.
    pub async fn start_recipient(&self, req: StartRecipientRequest) -> Result<()> {
        if self.sessions.read().contains_key(&req.migration_id) {
            return Ok(());
        }
        if self.scheduler.has_overlapping(req.collection, &req.range) {
            return Err(Error::OverlappingRangeDeletion(format!(
                "incoming range {} awaits cleanup on this shard",
                req.range
            )));
        }

        match self.storage.collection_uuid(&req.ns).await? {
            Some(local) if local != req.collection => {
                return Err(Error::CollectionUuidMismatch {
                    donor: req.collection,
                    recipient: local,
                });
            }
            Some(local) => {
                if !self.storage.is_empty(local).await? {
                    let local_names: HashSet<String> = self
                        .storage
                        .list_indexes(local)
                        .await?
                        .into_iter()
                        .map(|i| i.name)
                        .collect();
                    let missing: Vec<String> = req
                        .donor_indexes
                        .iter()
                        .filter(|i| !local_names.contains(&i.name))
                        .map(|i| i.name.clone())
                        .collect();
                    if !missing.is_empty() {
                        return Err(Error::IndexesMissingForMigration { missing });
                    }
                }
            }
            None => {
                self.storage
                    .create_collection(&req.ns, req.collection, req.donor_indexes.clone())
                    .await?;
            }
        }

        tracing::info!(
            migration_id = %req.migration_id,
            ns = %req.ns,
            range = %req.range,
            donor = req.donor,
            shard = self.shard_id,
            "Recipient session opened"
        );
        self.sessions.write().insert(
            req.migration_id,
            RecipientSession {
                state: DestinationState::Ready,
                ns: req.ns,
                collection: req.collection,
                range: req.range,
                donor: req.donor,
                seen_sequences: HashSet::new(),
                docs_cloned: 0,
                mods_applied: 0,
                last_activity: Instant::now(),
            },
        );
        Ok(())
    }

    /// Apply one clone batch. A batch whose sequence number was already
    /// applied is acknowledged without re-applying, so a donor retry
    /// after a lost ack is harmless.
    pub async fn clone_batch(&self, batch: CloneBatch) -> Result<u64> {
        let collection = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .get_mut(&batch.migration_id)
                .ok_or(Error::MigrationNotFound(batch.migration_id))?;
            match session.state {
                DestinationState::Ready => session.state = DestinationState::Cloning,
                DestinationState::Cloning => {}
                state => {
                    return Err(Error::InvalidMigrationState(format!(
                        "clone batch in state {:?}",
                        state
                    )));
                }
            }
            session.last_activity = Instant::now();
            if !session.seen_sequences.insert(batch.sequence) {
                tracing::debug!(
                    migration_id = %batch.migration_id,
                    sequence = batch.sequence,
                    "Duplicate clone batch acknowledged"
                );
                return Ok(0);
            }
            session.docs_cloned += batch.docs.len() as u64;
            session.collection
        };

        let applied = batch.docs.len() as u64;
        for doc in batch.docs {
            self.storage.upsert(collection, doc).await?;
        }
        Ok(applied)
    }

    /// Apply forwarded write ops in arrival order.
    pub async fn apply_mods(&self, migration_id: Uuid, ops: Vec<ModOp>) -> Result<u64> {
        let collection = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .get_mut(&migration_id)
                .ok_or(Error::MigrationNotFound(migration_id))?;
            match session.state {
                DestinationState::Ready
                | DestinationState::Cloning
                | DestinationState::Steady => {}
                state => {
                    return Err(Error::InvalidMigrationState(format!(
                        "apply mods in state {:?}",
                        state
                    )));
                }
            }
            session.last_activity = Instant::now();
            session.mods_applied += ops.len() as u64;
            session.collection
        };

        let applied = ops.len() as u64;
        for op in ops {
            match op.kind {
                ModKind::Insert(doc) | ModKind::Update(doc) => {
                    self.storage.upsert(collection, doc).await?;
                }
                ModKind::Delete { key } => {
                    self.storage.delete(collection, &key).await?;
                }
            }
        }
        Ok(applied)
    }

    /// Whether everything delivered so far has been applied. Batches and
    /// ops are applied synchronously on delivery, so a live session is
    /// caught up by construction and moves to steady state here.
    pub async fn steady_state(&self, migration_id: Uuid) -> Result<bool> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&migration_id)
            .ok_or(Error::MigrationNotFound(migration_id))?;
        session.last_activity = Instant::now();
        match session.state {
            DestinationState::Cloning | DestinationState::Steady => {
                session.state = DestinationState::Steady;
                Ok(true)
            }
            DestinationState::Ready => Ok(false),
            state => Err(Error::InvalidMigrationState(format!(
                "steady state query in state {:?}",
                state
            ))),
        }
    }

    /// Final ack inside the donor's critical section.
    pub async fn prepare_commit(&self, migration_id: Uuid) -> Result<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&migration_id)
            .ok_or(Error::MigrationNotFound(migration_id))?;
        session.last_activity = Instant::now();
        match session.state {
            DestinationState::Steady => Ok(()),
            state => Err(Error::InvalidMigrationState(format!(
                "prepare commit in state {:?}",
                state
            ))),
        }
    }

    /// React to the migration's durable outcome.
    ///
    /// On commit, routing is refreshed from the authority so the newly
    /// owned range becomes visible to readers. On abort, every cloned
    /// document in the range is removed before the session closes, so
    /// an abort never leaks orphans.
    pub async fn signal_decision(
        &self,
        migration_id: Uuid,
        decision: MigrationDecision,
    ) -> Result<()> {
        let (collection, range, state) = {
            let sessions = self.sessions.read();
            let session = sessions
                .get(&migration_id)
                .ok_or(Error::MigrationNotFound(migration_id))?;
            (session.collection, session.range.clone(), session.state)
        };

        match decision {
            MigrationDecision::Committed => {
                if state == DestinationState::Committed {
                    return Ok(());
                }
                if state == DestinationState::Aborted {
                    return Err(Error::InvalidMigrationState(
                        "commit signaled after abort".to_string(),
                    ));
                }
                let info = self.authority.refresh_routing(collection).await?;
                self.ownership.install_routing_info(info)?;
                self.set_state(migration_id, DestinationState::Committed)?;
                tracing::info!(
                    migration_id = %migration_id,
                    range = %range,
                    shard = self.shard_id,
                    "Incoming migration committed"
                );
            }
            MigrationDecision::Aborted => {
                if state == DestinationState::Aborted {
                    return Ok(());
                }
                if state == DestinationState::Committed {
                    return Err(Error::InvalidMigrationState(
                        "abort signaled after commit".to_string(),
                    ));
                }
                let mut discarded = 0u64;
                loop {
                    let n = self.storage.delete_range_batch(collection, &range, 256).await?;
                    discarded += n;
                    if n == 0 {
                        break;
                    }
                }
                self.set_state(migration_id, DestinationState::Aborted)?;
                tracing::info!(
                    migration_id = %migration_id,
                    range = %range,
                    discarded,
                    "Incoming migration aborted, cloned data discarded"
                );
            }
            MigrationDecision::Pending => {
                return Err(Error::InvalidMigrationState(
                    "pending is not a terminal decision".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Abort sessions whose donor has gone silent.
    ///
    /// A donor that dies before its write-ahead recovery document
    /// exists leaves nothing durable behind, so no recovery pass will
    /// ever settle the session here. Sessions idle past `max_idle`
    /// that never reached a terminal state are aborted and their
    /// cloned range discarded. Returns how many sessions were expired.
    pub async fn expire_idle_sessions(&self, max_idle: Duration) -> Result<usize> {
        let stale: Vec<(Uuid, CollectionUuid, KeyRange)> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| {
                matches!(
                    s.state,
                    DestinationState::Ready
                        | DestinationState::Cloning
                        | DestinationState::Steady
                ) && s.last_activity.elapsed() >= max_idle
            })
            .map(|(id, s)| (*id, s.collection, s.range.clone()))
            .collect();

        for (migration_id, collection, range) in &stale {
            tracing::warn!(
                migration_id = %migration_id,
                range = %range,
                shard = self.shard_id,
                "Recipient session idle past deadline, discarding cloned range"
            );
            loop {
                let n = self
                    .storage
                    .delete_range_batch(*collection, range, 256)
                    .await?;
                if n == 0 {
                    break;
                }
            }
            self.set_state(*migration_id, DestinationState::Aborted)?;
        }
        Ok(stale.len())
    }

    /// Current state of a session, if one exists.
    pub fn session_state(&self, migration_id: Uuid) -> Option<DestinationState> {
        self.sessions.read().get(&migration_id).map(|s| s.state)
    }

    /// Documents applied from the clone stream for a session.
    pub fn docs_cloned(&self, migration_id: Uuid) -> u64 {
        self.sessions
            .read()
            .get(&migration_id)
            .map(|s| s.docs_cloned)
            .unwrap_or(0)
    }

    /// Write ops applied from the mods stream for a session.
    pub fn mods_applied(&self, migration_id: Uuid) -> u64 {
        self.sessions
            .read()
            .get(&migration_id)
            .map(|s| s.mods_applied)
            .unwrap_or(0)
    }

    /// Namespace of a session, for diagnostics.
    pub fn session_ns(&self, migration_id: Uuid) -> Option<String> {
        self.sessions
            .read()
            .get(&migration_id)
            .map(|s| s.ns.clone())
    }

    /// Donor shard of a session.
    pub fn session_donor(&self, migration_id: Uuid) -> Option<ShardId> {
        self.sessions.read().get(&migration_id).map(|s| s.donor)
    }

    fn set_state(&self, migration_id: Uuid, state: DestinationState) -> Result<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&migration_id)
            .ok_or(Error::MigrationNotFound(migration_id))?;
        session.state = state;
        Ok(())
    }
}
