//! Donor-to-recipient wire surface.
//!
//! [`RecipientRpc`] is the seam a real deployment implements over its
//! network layer; [`LocalRecipientRpc`] routes calls to an in-process
//! [`MigrationDestinationManager`] and adds failure and delay injection
//! for tests.

use crate::error::{Error, Result};
use crate::migration::recipient::MigrationDestinationManager;
use crate::migration::recovery::MigrationDecision;
use crate::types::{CollectionUuid, Document, IndexSpec, KeyRange, ModOp, ShardId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Opens a migration session on the recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRecipientRequest {
    /// Migration id.
    pub migration_id: Uuid,
    /// Namespace of the collection.
    pub ns: String,
    /// Collection identity on the donor; the recipient must match it.
    pub collection: CollectionUuid,
    /// The incoming range.
    pub range: KeyRange,
    /// The donor shard.
    pub donor: ShardId,
    /// Indexes present on the donor, required on a non-empty recipient.
    pub donor_indexes: Vec<IndexSpec>,
}

/// One batch of cloned documents.
///
/// Batches carry a sequence number so a retried send is recognized and
/// applied exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneBatch {
    /// Migration id.
    pub migration_id: Uuid,
    /// Position of this batch in the clone stream, starting at zero.
    pub sequence: u64,
    /// Documents in this batch, ordered by key.
    pub docs: Vec<Document>,
    /// Whether this is the last batch of the initial clone.
    pub is_final: bool,
}

/// Calls the donor makes against the recipient shard.
#[async_trait]
pub trait RecipientRpc: Send + Sync + std::fmt::Debug {
    /// Open a migration session and prepare the local collection.
    async fn start_recipient(&self, req: StartRecipientRequest) -> Result<()>;

    /// Deliver one clone batch; returns documents newly applied.
    async fn clone_batch(&self, batch: CloneBatch) -> Result<u64>;

    /// Deliver buffered write ops in arrival order; returns ops applied.
    async fn apply_mods(&self, migration_id: Uuid, ops: Vec<ModOp>) -> Result<u64>;

    /// Whether the recipient has applied everything delivered so far and
    /// is ready for the critical section.
    async fn steady_state(&self, migration_id: Uuid) -> Result<bool>;

    /// Final ack inside the donor's critical section. After this
    /// returns, the recipient must accept the range if the decision is
    /// `Committed`.
    async fn prepare_commit(&self, migration_id: Uuid) -> Result<()>;

    /// Inform the recipient of the migration's durable outcome.
    async fn signal_decision(&self, migration_id: Uuid, decision: MigrationDecision) -> Result<()>;
}

/// In-process transport wrapping a recipient manager directly.
#[derive(Debug)]
pub struct LocalRecipientRpc {
    recipient: Arc<MigrationDestinationManager>,
    /// Fail the next N `prepare_commit` calls.
    fail_prepare_commit: AtomicU32,
    /// Fail the next N `clone_batch` calls before delivery.
    fail_clone_batches: AtomicU32,
    /// Drop `signal_decision` calls, simulating a recipient that never
    /// learns the outcome.
    drop_decisions: AtomicBool,
    /// Delay injected before each `clone_batch` delivery.
    clone_delay: Mutex<Option<Duration>>,
}

impl LocalRecipientRpc {
    /// Wrap a recipient manager.
    pub fn new(recipient: Arc<MigrationDestinationManager>) -> Self {
        Self {
            recipient,
            fail_prepare_commit: AtomicU32::new(0),
            fail_clone_batches: AtomicU32::new(0),
            drop_decisions: AtomicBool::new(false),
            clone_delay: Mutex::new(None),
        }
    }

    /// The wrapped recipient manager.
    pub fn recipient(&self) -> &Arc<MigrationDestinationManager> {
        &self.recipient
    }

    /// Make the next `n` `prepare_commit` calls time out.
    pub fn fail_prepare_commit(&self, n: u32) {
        self.fail_prepare_commit.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` `clone_batch` calls fail before delivery.
    pub fn fail_clone_batches(&self, n: u32) {
        self.fail_clone_batches.store(n, Ordering::SeqCst);
    }

    /// Drop decision signals instead of delivering them.
    pub fn drop_decisions(&self, drop: bool) {
        self.drop_decisions.store(drop, Ordering::SeqCst);
    }

    /// Inject a delay before each clone batch delivery.
    pub fn set_clone_delay(&self, delay: Option<Duration>) {
        *self.clone_delay.lock() = delay;
    }

    fn take_injected(&self, counter: &AtomicU32) -> bool {
        let pending = counter.load(Ordering::SeqCst);
        if pending > 0 {
            counter.store(pending - 1, Ordering::SeqCst);
            return true;
        }
        false
    }
}

#[async_trait]
impl RecipientRpc for LocalRecipientRpc {
    async fn start_recipient(&self, req: StartRecipientRequest) -> Result<()> {
        self.recipient.start_recipient(req).await
    }

    async fn clone_batch(&self, batch: CloneBatch) -> Result<u64> {
        if self.take_injected(&self.fail_clone_batches) {
            return Err(Error::Timeout);
        }
        let delay = *self.clone_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.recipient.clone_batch(batch).await
    }

    async fn apply_mods(&self, migration_id: Uuid, ops: Vec<ModOp>) -> Result<u64> {
        self.recipient.apply_mods(migration_id, ops).await
    }

    async fn steady_state(&self, migration_id: Uuid) -> Result<bool> {
        self.recipient.steady_state(migration_id).await
    }

    async fn prepare_commit(&self, migration_id: Uuid) -> Result<()> {
        if self.take_injected(&self.fail_prepare_commit) {
            // Simulate an unreachable recipient: the donor's own timeout
            // decides the outcome.
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.recipient.prepare_commit(migration_id).await
    }

    async fn signal_decision(&self, migration_id: Uuid, decision: MigrationDecision) -> Result<()> {
        if self.drop_decisions.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.recipient.signal_decision(migration_id, decision).await
    }
}
