//! Post-migration range cleanup.
//!
//! After a handoff commits, the donor still physically holds the
//! migrated documents. A [`RangeDeletionTask`] records the obligation
//! to remove them; tasks are persisted so a restart never forgets an
//! orphaned range, and are executed in bounded storage batches.

use crate::config::RangeDeletionConfig;
use crate::error::{Error, Result};
use crate::metrics::MigrationMetrics;
use crate::migration::recovery::atomic_write;
use crate::ownership::RangeOwnershipTable;
use crate::storage::ShardStorage;
use crate::types::{CollectionUuid, KeyRange, ShardId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// One pending or ready range cleanup obligation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeDeletionTask {
    /// Task id.
    pub task_id: Uuid,
    /// Collection holding the orphaned range.
    pub collection: CollectionUuid,
    /// Namespace, for diagnostics.
    pub ns: String,
    /// The orphaned range.
    pub range: KeyRange,
    /// The shard that donated the range away, i.e. the shard this task
    /// runs on.
    pub donor: ShardId,
    /// While `true` the commit that produced this task has not fully
    /// settled and the task must not run.
    pub pending: bool,
}

impl RangeDeletionTask {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Durable store of range deletion tasks.
#[async_trait]
pub trait RangeDeletionStore: Send + Sync + std::fmt::Debug {
    /// Persist a new task.
    async fn insert(&self, task: &RangeDeletionTask) -> Result<()>;

    /// Persist an updated task.
    async fn update(&self, task: &RangeDeletionTask) -> Result<()>;

    /// Remove a completed task.
    async fn remove(&self, task_id: Uuid) -> Result<()>;

    /// Load every persisted task.
    async fn load_all(&self) -> Result<Vec<RangeDeletionTask>>;
}

/// Task store held in memory, for tests and fixtures.
#[derive(Debug, Default)]
pub struct InMemoryRangeDeletionStore {
    tasks: Mutex<HashMap<Uuid, RangeDeletionTask>>,
}

impl InMemoryRangeDeletionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RangeDeletionStore for InMemoryRangeDeletionStore {
    async fn insert(&self, task: &RangeDeletionTask) -> Result<()> {
        self.tasks.lock().insert(task.task_id, task.clone());
        Ok(())
    }

    async fn update(&self, task: &RangeDeletionTask) -> Result<()> {
        self.tasks.lock().insert(task.task_id, task.clone());
        Ok(())
    }

    async fn remove(&self, task_id: Uuid) -> Result<()> {
        self.tasks.lock().remove(&task_id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<RangeDeletionTask>> {
        Ok(self.tasks.lock().values().cloned().collect())
    }
}

/// File-backed task store: one `<task_id>.task` per task.
#[derive(Debug)]
pub struct FileRangeDeletionStore {
    dir: PathBuf,
}

impl FileRangeDeletionStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, task_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.task", task_id))
    }

    async fn read_task(&self, path: &Path) -> Result<RangeDeletionTask> {
        let data = tokio::fs::read(path).await?;
        RangeDeletionTask::from_bytes(&data)
    }
}

#[async_trait]
impl RangeDeletionStore for FileRangeDeletionStore {
    async fn insert(&self, task: &RangeDeletionTask) -> Result<()> {
        atomic_write(&self.path_for(task.task_id), &task.to_bytes()?).await
    }

    async fn update(&self, task: &RangeDeletionTask) -> Result<()> {
        self.insert(task).await
    }

    async fn remove(&self, task_id: Uuid) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(task_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_all(&self) -> Result<Vec<RangeDeletionTask>> {
        let mut tasks = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("task") {
                continue;
            }
            tasks.push(self.read_task(&path).await?);
        }
        Ok(tasks)
    }
}

/// Schedules and executes range deletion tasks on one shard.
#[derive(Debug)]
pub struct RangeDeletionScheduler {
    storage: Arc<dyn ShardStorage>,
    store: Arc<dyn RangeDeletionStore>,
    ownership: Arc<RangeOwnershipTable>,
    config: RangeDeletionConfig,
    metrics: Arc<MigrationMetrics>,
    tasks: Mutex<HashMap<Uuid, RangeDeletionTask>>,
}

impl RangeDeletionScheduler {
    /// Create a scheduler.
    pub fn new(
        storage: Arc<dyn ShardStorage>,
        store: Arc<dyn RangeDeletionStore>,
        ownership: Arc<RangeOwnershipTable>,
        config: RangeDeletionConfig,
        metrics: Arc<MigrationMetrics>,
    ) -> Self {
        Self {
            storage,
            store,
            ownership,
            config,
            metrics,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Record a cleanup obligation for `range` in pending state.
    ///
    /// Fails if any known task overlaps the range: two deletions over
    /// shared keys would race, and an overlap signals a bookkeeping bug
    /// upstream.
    pub async fn schedule(
        &self,
        collection: CollectionUuid,
        ns: &str,
        range: KeyRange,
        donor: ShardId,
    ) -> Result<Uuid> {
        let task = {
            let tasks = self.tasks.lock();
            if let Some(existing) = tasks
                .values()
                .find(|t| t.collection == collection && t.range.overlaps(&range))
            {
                return Err(Error::OverlappingRangeDeletion(format!(
                    "task {} covers {}",
                    existing.task_id, existing.range
                )));
            }
            RangeDeletionTask {
                task_id: Uuid::new_v4(),
                collection,
                ns: ns.to_string(),
                range,
                donor,
                pending: true,
            }
        };

        self.store.insert(&task).await?;
        let task_id = task.task_id;
        tracing::info!(
            task_id = %task_id,
            ns = %task.ns,
            range = %task.range,
            donor,
            "Range deletion scheduled"
        );
        self.tasks.lock().insert(task_id, task);
        Ok(task_id)
    }

    /// Allow a pending task to run.
    pub async fn mark_ready(&self, task_id: Uuid) -> Result<()> {
        let updated = {
            let mut tasks = self.tasks.lock();
            let task = tasks
                .get_mut(&task_id)
                .ok_or_else(|| Error::Internal(format!("unknown range deletion task {task_id}")))?;
            task.pending = false;
            task.clone()
        };
        self.store.update(&updated).await
    }

    /// Physically delete a ready task's range in bounded batches, with
    /// bounded retries for transient storage errors.
    pub async fn execute(&self, task_id: Uuid) -> Result<u64> {
        let task = self
            .tasks
            .lock()
            .get(&task_id)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("unknown range deletion task {task_id}")))?;
        if task.pending {
            return Err(Error::InvalidMigrationState(format!(
                "range deletion task {task_id} is still pending"
            )));
        }
        // The range may have migrated back onto this shard after the
        // task was scheduled; deleting it now would destroy owned
        // documents.
        if self
            .ownership
            .owned_ranges(task.collection)
            .iter()
            .any(|r| r.overlaps(&task.range))
        {
            return Err(Error::ManualInterventionRequired(format!(
                "range deletion task {task_id} overlaps a range this shard owns"
            )));
        }

        let mut deleted = 0u64;
        loop {
            let mut attempts = 0;
            let n = loop {
                match self
                    .storage
                    .delete_range_batch(task.collection, &task.range, self.config.delete_batch_size)
                    .await
                {
                    Ok(n) => break n,
                    Err(e) if attempts < self.config.max_retries => {
                        attempts += 1;
                        tracing::warn!(
                            task_id = %task_id,
                            attempt = attempts,
                            error = %e,
                            "Range deletion batch failed, retrying"
                        );
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                    Err(e) => return Err(e),
                }
            };
            deleted += n;
            if n == 0 {
                break;
            }
        }

        self.store.remove(task_id).await?;
        self.tasks.lock().remove(&task_id);
        self.metrics.range_deletions_completed.inc();
        self.metrics.documents_deleted.inc_by(deleted);
        tracing::info!(
            task_id = %task_id,
            ns = %task.ns,
            range = %task.range,
            deleted,
            "Range deletion complete"
        );
        Ok(deleted)
    }

    /// Execute every ready task; returns total documents removed.
    pub async fn drain_ready(&self) -> Result<u64> {
        let ready: Vec<Uuid> = self
            .tasks
            .lock()
            .values()
            .filter(|t| !t.pending)
            .map(|t| t.task_id)
            .collect();
        let mut total = 0u64;
        for task_id in ready {
            total += self.execute(task_id).await?;
        }
        Ok(total)
    }

    /// Reload persisted tasks after a restart; returns how many were found.
    pub async fn load_persisted(&self) -> Result<usize> {
        let persisted = self.store.load_all().await?;
        let count = persisted.len();
        let mut tasks = self.tasks.lock();
        for task in persisted {
            tasks.insert(task.task_id, task);
        }
        Ok(count)
    }

    /// Mark every task overlapping `range` ready; returns how many were
    /// still pending. Crash recovery uses this when a commit settled but
    /// the donor died before releasing its deletion task.
    pub async fn mark_overlapping_ready(
        &self,
        collection: CollectionUuid,
        range: &KeyRange,
    ) -> Result<usize> {
        let overlapping: Vec<Uuid> = self
            .tasks
            .lock()
            .values()
            .filter(|t| t.collection == collection && t.range.overlaps(range) && t.pending)
            .map(|t| t.task_id)
            .collect();
        for task_id in &overlapping {
            self.mark_ready(*task_id).await?;
        }
        Ok(overlapping.len())
    }

    /// A task by id, if known.
    pub fn task(&self, task_id: Uuid) -> Option<RangeDeletionTask> {
        self.tasks.lock().get(&task_id).cloned()
    }

    /// Whether any known task overlaps `range`.
    pub fn has_overlapping(&self, collection: CollectionUuid, range: &KeyRange) -> bool {
        self.tasks
            .lock()
            .values()
            .any(|t| t.collection == collection && t.range.overlaps(range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::types::{Chunk, ChunkVersion, CollectionRoutingInfo, Document, KeyBound};

    async fn fixture(
        docs: usize,
    ) -> (Arc<InMemoryStorage>, RangeDeletionScheduler, CollectionUuid) {
        let storage = Arc::new(InMemoryStorage::new());
        let coll = Uuid::new_v4();
        storage.create_collection("test.kv", coll, vec![]).await.unwrap();
        for i in 0..docs {
            storage
                .upsert(coll, Document::new(format!("k{i:04}").into_bytes(), vec![1u8]))
                .await
                .unwrap();
        }
        let scheduler = RangeDeletionScheduler::new(
            storage.clone(),
            Arc::new(InMemoryRangeDeletionStore::new()),
            Arc::new(RangeOwnershipTable::new(1)),
            RangeDeletionConfig::default()
                .with_delete_batch_size(10)
                .with_retry_delay(std::time::Duration::from_millis(1)),
            Arc::new(MigrationMetrics::new()),
        );
        (storage, scheduler, coll)
    }

    #[tokio::test]
    async fn test_schedule_rejects_overlap() {
        let (_, scheduler, coll) = fixture(0).await;
        let a = KeyRange::new(KeyBound::NegInfinity, KeyBound::key(b"m".to_vec()));
        let b = KeyRange::new(KeyBound::key(b"f".to_vec()), KeyBound::key(b"q".to_vec()));
        let c = KeyRange::new(KeyBound::key(b"m".to_vec()), KeyBound::PosInfinity);

        scheduler.schedule(coll, "test.kv", a, 1).await.unwrap();
        let err = scheduler.schedule(coll, "test.kv", b, 1).await.unwrap_err();
        assert!(matches!(err, Error::OverlappingRangeDeletion(_)));

        // Adjacent ranges are fine, as is the same range in another collection.
        scheduler.schedule(coll, "test.kv", c, 1).await.unwrap();
        scheduler
            .schedule(Uuid::new_v4(), "other.kv", KeyRange::full(), 1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_execute_requires_ready() {
        let (_, scheduler, coll) = fixture(5).await;
        let id = scheduler
            .schedule(coll, "test.kv", KeyRange::full(), 1)
            .await
            .unwrap();
        assert!(scheduler.execute(id).await.is_err());

        scheduler.mark_ready(id).await.unwrap();
        assert_eq!(scheduler.execute(id).await.unwrap(), 5);
        assert!(scheduler.task(id).is_none());
    }

    #[tokio::test]
    async fn test_execute_bounded_batches_and_retry() {
        let (storage, scheduler, coll) = fixture(25).await;
        let id = scheduler
            .schedule(coll, "test.kv", KeyRange::full(), 1)
            .await
            .unwrap();
        scheduler.mark_ready(id).await.unwrap();

        // Two transient failures are absorbed by the retry budget.
        storage.inject_delete_failures(2);
        assert_eq!(scheduler.execute(id).await.unwrap(), 25);
        assert_eq!(storage.count_range(coll, &KeyRange::full()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_ready_skips_pending() {
        let (storage, scheduler, coll) = fixture(6).await;
        let lower = KeyRange::new(KeyBound::NegInfinity, KeyBound::key(b"k0003".to_vec()));
        let upper = KeyRange::new(KeyBound::key(b"k0003".to_vec()), KeyBound::PosInfinity);
        let ready = scheduler.schedule(coll, "test.kv", lower, 1).await.unwrap();
        let pending = scheduler.schedule(coll, "test.kv", upper, 1).await.unwrap();
        scheduler.mark_ready(ready).await.unwrap();

        assert_eq!(scheduler.drain_ready().await.unwrap(), 3);
        assert_eq!(storage.count_range(coll, &KeyRange::full()).await.unwrap(), 3);
        assert!(scheduler.task(pending).is_some());
    }

    #[tokio::test]
    async fn test_execute_refuses_owned_range() {
        let storage = Arc::new(InMemoryStorage::new());
        let coll = Uuid::new_v4();
        storage.create_collection("test.kv", coll, vec![]).await.unwrap();
        storage
            .upsert(coll, Document::new(b"a".to_vec(), vec![1u8]))
            .await
            .unwrap();
        let ownership = Arc::new(RangeOwnershipTable::new(1));
        let scheduler = RangeDeletionScheduler::new(
            storage.clone(),
            Arc::new(InMemoryRangeDeletionStore::new()),
            ownership.clone(),
            RangeDeletionConfig::default(),
            Arc::new(MigrationMetrics::new()),
        );
        let id = scheduler
            .schedule(coll, "test.kv", KeyRange::full(), 1)
            .await
            .unwrap();
        scheduler.mark_ready(id).await.unwrap();

        // The range migrated back onto this shard before the task ran.
        ownership
            .install_routing_info(CollectionRoutingInfo::new(
                coll,
                "{x: 1}",
                vec![Chunk {
                    range: KeyRange::full(),
                    shard: 1,
                    version: ChunkVersion::new(1, 0),
                    collection: coll,
                }],
            ))
            .unwrap();

        let err = scheduler.execute(id).await.unwrap_err();
        assert!(matches!(err, Error::ManualInterventionRequired(_)));
        assert_eq!(storage.count_range(coll, &KeyRange::full()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_tasks_persist_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(InMemoryStorage::new());
        let coll = Uuid::new_v4();
        storage.create_collection("test.kv", coll, vec![]).await.unwrap();
        for i in 0..4 {
            storage
                .upsert(coll, Document::new(format!("k{i}").into_bytes(), vec![1u8]))
                .await
                .unwrap();
        }

        let id = {
            let store = Arc::new(FileRangeDeletionStore::open(dir.path()).await.unwrap());
            let scheduler = RangeDeletionScheduler::new(
                storage.clone(),
                store,
                Arc::new(RangeOwnershipTable::new(1)),
                RangeDeletionConfig::default(),
                Arc::new(MigrationMetrics::new()),
            );
            let id = scheduler
                .schedule(coll, "test.kv", KeyRange::full(), 1)
                .await
                .unwrap();
            scheduler.mark_ready(id).await.unwrap();
            id
        };

        // Restart: a fresh scheduler over the same directory resumes the task.
        let store = Arc::new(FileRangeDeletionStore::open(dir.path()).await.unwrap());
        let scheduler = RangeDeletionScheduler::new(
            storage.clone(),
            store,
            Arc::new(RangeOwnershipTable::new(1)),
            RangeDeletionConfig::default(),
            Arc::new(MigrationMetrics::new()),
        );
        assert_eq!(scheduler.load_persisted().await.unwrap(), 1);
        assert_eq!(scheduler.execute(id).await.unwrap(), 4);
        assert!(scheduler.store.load_all().await.unwrap().is_empty());
    }
}
