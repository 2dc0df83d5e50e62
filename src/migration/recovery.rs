//! Durable migration decision records.
//!
//! Before a donor asks the authority to commit a handoff it writes a
//! [`MigrationRecoveryDocument`] with a [`Pending`] decision. The
//! document outlives a crash: on restart the coordinator loads every
//! record and resolves each one against authoritative cluster state.
//! The write-ahead ordering is strict: the record reaches the store
//! before any externally visible commit step, and in-memory state is
//! only updated after the store acknowledges.
//!
//! [`Pending`]: MigrationDecision::Pending

use crate::error::{Error, Result};
use crate::types::{ChunkVersion, CollectionUuid, KeyRange, ShardId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Outcome of a migration, as recorded durably on the donor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationDecision {
    /// The commit protocol started but its outcome is not yet known.
    Pending,
    /// The authority applied the handoff.
    Committed,
    /// The migration was abandoned; the donor keeps ownership.
    Aborted,
}

/// Durable record of one migration's commit protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecoveryDocument {
    /// Migration id.
    pub migration_id: Uuid,
    /// Collection being migrated.
    pub collection: CollectionUuid,
    /// Namespace, for diagnostics.
    pub ns: String,
    /// The migrating range.
    pub range: KeyRange,
    /// The shard giving up the range.
    pub donor: ShardId,
    /// The shard receiving the range.
    pub recipient: ShardId,
    /// Current decision.
    pub decision: MigrationDecision,
    /// Chunk version before the handoff, used as the conditional
    /// `expected` version when re-driving the commit.
    pub pre_migration_version: ChunkVersion,
}

impl MigrationRecoveryDocument {
    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Durable store of migration recovery documents.
#[async_trait]
pub trait RecoveryStore: Send + Sync + std::fmt::Debug {
    /// Persist a new document. The insert must be durable before the
    /// caller takes any externally visible commit step.
    async fn insert(&self, doc: &MigrationRecoveryDocument) -> Result<()>;

    /// Record the decision for a migration.
    ///
    /// `Pending -> Committed/Aborted` happens at most once; repeating
    /// the same terminal decision is a no-op, flipping between terminal
    /// decisions is an error.
    async fn update_decision(&self, migration_id: Uuid, decision: MigrationDecision) -> Result<()>;

    /// Load one document.
    async fn get(&self, migration_id: Uuid) -> Result<Option<MigrationRecoveryDocument>>;

    /// Load every document, in no particular order.
    async fn load_all(&self) -> Result<Vec<MigrationRecoveryDocument>>;

    /// Remove a document once its effects are fully applied.
    async fn remove(&self, migration_id: Uuid) -> Result<()>;
}

fn apply_decision(
    doc: &mut MigrationRecoveryDocument,
    decision: MigrationDecision,
) -> Result<bool> {
    match (doc.decision, decision) {
        (current, next) if current == next => Ok(false),
        (MigrationDecision::Pending, next) => {
            doc.decision = next;
            Ok(true)
        }
        (current, next) => Err(Error::InvalidMigrationState(format!(
            "migration {} decision {:?} cannot change to {:?}",
            doc.migration_id, current, next
        ))),
    }
}

/// Recovery store held in memory, for tests and fixtures.
///
/// Contents survive for the lifetime of the `Arc`, which lets tests
/// model durable state across a simulated process restart.
#[derive(Debug, Default)]
pub struct InMemoryRecoveryStore {
    docs: Mutex<HashMap<Uuid, MigrationRecoveryDocument>>,
}

impl InMemoryRecoveryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecoveryStore for InMemoryRecoveryStore {
    async fn insert(&self, doc: &MigrationRecoveryDocument) -> Result<()> {
        self.docs.lock().insert(doc.migration_id, doc.clone());
        Ok(())
    }

    async fn update_decision(&self, migration_id: Uuid, decision: MigrationDecision) -> Result<()> {
        let mut docs = self.docs.lock();
        let doc = docs
            .get_mut(&migration_id)
            .ok_or(Error::MigrationNotFound(migration_id))?;
        apply_decision(doc, decision)?;
        Ok(())
    }

    async fn get(&self, migration_id: Uuid) -> Result<Option<MigrationRecoveryDocument>> {
        Ok(self.docs.lock().get(&migration_id).cloned())
    }

    async fn load_all(&self) -> Result<Vec<MigrationRecoveryDocument>> {
        Ok(self.docs.lock().values().cloned().collect())
    }

    async fn remove(&self, migration_id: Uuid) -> Result<()> {
        self.docs.lock().remove(&migration_id);
        Ok(())
    }
}

/// Atomically write `data` to `path` via a temp file and rename.
pub(crate) async fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// File-backed recovery store: one `<migration_id>.bin` per document.
#[derive(Debug)]
pub struct FileRecoveryStore {
    dir: PathBuf,
}

impl FileRecoveryStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, migration_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.bin", migration_id))
    }

    async fn read_doc(&self, path: &Path) -> Result<MigrationRecoveryDocument> {
        let data = tokio::fs::read(path).await?;
        MigrationRecoveryDocument::from_bytes(&data)
    }
}

#[async_trait]
impl RecoveryStore for FileRecoveryStore {
    async fn insert(&self, doc: &MigrationRecoveryDocument) -> Result<()> {
        atomic_write(&self.path_for(doc.migration_id), &doc.to_bytes()?).await
    }

    async fn update_decision(&self, migration_id: Uuid, decision: MigrationDecision) -> Result<()> {
        let path = self.path_for(migration_id);
        let mut doc = match self.read_doc(&path).await {
            Ok(doc) => doc,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::MigrationNotFound(migration_id));
            }
            Err(e) => return Err(e),
        };
        if apply_decision(&mut doc, decision)? {
            atomic_write(&path, &doc.to_bytes()?).await?;
        }
        Ok(())
    }

    async fn get(&self, migration_id: Uuid) -> Result<Option<MigrationRecoveryDocument>> {
        match self.read_doc(&self.path_for(migration_id)).await {
            Ok(doc) => Ok(Some(doc)),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn load_all(&self) -> Result<Vec<MigrationRecoveryDocument>> {
        let mut docs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                continue;
            }
            docs.push(self.read_doc(&path).await?);
        }
        Ok(docs)
    }

    async fn remove(&self, migration_id: Uuid) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(migration_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
