//! Storage seam between the migration machinery and the storage engine.
//!
//! The engine itself (B-tree/LSM internals) is an external collaborator;
//! this module defines the key-value interface the subsystem consumes
//! and an in-memory implementation used by tests and fixtures.

use crate::error::{Error, Result};
use crate::types::{CollectionUuid, Document, IndexSpec, KeyBound, KeyRange};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, Ordering};

/// Key-value interface over one shard's storage engine.
#[async_trait]
pub trait ShardStorage: Send + Sync + std::fmt::Debug {
    /// Create a collection with a fixed UUID and index set. Idempotent
    /// when the UUID matches an existing collection.
    async fn create_collection(
        &self,
        ns: &str,
        collection: CollectionUuid,
        indexes: Vec<IndexSpec>,
    ) -> Result<()>;

    /// Resolve a namespace to its collection UUID.
    async fn collection_uuid(&self, ns: &str) -> Result<Option<CollectionUuid>>;

    /// Indexes present on a collection.
    async fn list_indexes(&self, collection: CollectionUuid) -> Result<Vec<IndexSpec>>;

    /// Whether a collection holds no documents.
    async fn is_empty(&self, collection: CollectionUuid) -> Result<bool>;

    /// Point-in-time copy of all documents in `range`, ordered by key.
    async fn snapshot_range(
        &self,
        collection: CollectionUuid,
        range: &KeyRange,
    ) -> Result<Vec<Document>>;

    /// Fetch a document by key.
    async fn get(&self, collection: CollectionUuid, key: &[u8]) -> Result<Option<Document>>;

    /// Insert or replace a document by key.
    async fn upsert(&self, collection: CollectionUuid, doc: Document) -> Result<()>;

    /// Delete a document by key; returns whether it existed.
    async fn delete(&self, collection: CollectionUuid, key: &[u8]) -> Result<bool>;

    /// Number of documents physically present in `range`.
    async fn count_range(&self, collection: CollectionUuid, range: &KeyRange) -> Result<u64>;

    /// Delete up to `limit` documents in `range`; returns how many were
    /// removed. Bounded so large ranges are reclaimed in batches rather
    /// than one unbounded transaction.
    async fn delete_range_batch(
        &self,
        collection: CollectionUuid,
        range: &KeyRange,
        limit: usize,
    ) -> Result<u64>;
}

#[derive(Debug)]
struct CollectionData {
    ns: String,
    indexes: Vec<IndexSpec>,
    docs: BTreeMap<Vec<u8>, Bytes>,
}

/// In-memory storage engine backed by a `BTreeMap` per collection.
///
/// Contents survive for the lifetime of the `Arc`, which lets tests
/// model durable storage across a simulated process restart.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    collections: RwLock<HashMap<CollectionUuid, CollectionData>>,
    ns_index: RwLock<HashMap<String, CollectionUuid>>,
    /// Fail the next N `delete_range_batch` calls (test support for
    /// transient storage errors).
    inject_delete_failures: AtomicU32,
}

impl InMemoryStorage {
    /// Create an empty storage engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` range-deletion batches fail with a storage error.
    pub fn inject_delete_failures(&self, n: u32) {
        self.inject_delete_failures.store(n, Ordering::SeqCst);
    }

    /// Add an index to an existing collection.
    pub fn add_index(&self, collection: CollectionUuid, index: IndexSpec) -> Result<()> {
        let mut collections = self.collections.write();
        let data = collections
            .get_mut(&collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        if !data.indexes.iter().any(|i| i.name == index.name) {
            data.indexes.push(index);
        }
        Ok(())
    }

    fn bounds(range: &KeyRange) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        let lo = match &range.min {
            KeyBound::NegInfinity => Bound::Unbounded,
            KeyBound::Key(k) => Bound::Included(k.clone()),
            KeyBound::PosInfinity => Bound::Excluded(Vec::new()), // unreachable for non-empty ranges
        };
        let hi = match &range.max {
            KeyBound::NegInfinity => Bound::Excluded(Vec::new()),
            KeyBound::Key(k) => Bound::Excluded(k.clone()),
            KeyBound::PosInfinity => Bound::Unbounded,
        };
        (lo, hi)
    }
}

#[async_trait]
impl ShardStorage for InMemoryStorage {
    async fn create_collection(
        &self,
        ns: &str,
        collection: CollectionUuid,
        indexes: Vec<IndexSpec>,
    ) -> Result<()> {
        let mut collections = self.collections.write();
        if let Some(existing) = collections.get(&collection) {
            if existing.ns != ns {
                return Err(Error::Internal(format!(
                    "collection {} already exists under namespace {}",
                    collection, existing.ns
                )));
            }
            return Ok(());
        }
        collections.insert(
            collection,
            CollectionData {
                ns: ns.to_string(),
                indexes,
                docs: BTreeMap::new(),
            },
        );
        self.ns_index.write().insert(ns.to_string(), collection);
        Ok(())
    }

    async fn collection_uuid(&self, ns: &str) -> Result<Option<CollectionUuid>> {
        Ok(self.ns_index.read().get(ns).copied())
    }

    async fn list_indexes(&self, collection: CollectionUuid) -> Result<Vec<IndexSpec>> {
        self.collections
            .read()
            .get(&collection)
            .map(|c| c.indexes.clone())
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))
    }

    async fn is_empty(&self, collection: CollectionUuid) -> Result<bool> {
        self.collections
            .read()
            .get(&collection)
            .map(|c| c.docs.is_empty())
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))
    }

    async fn snapshot_range(
        &self,
        collection: CollectionUuid,
        range: &KeyRange,
    ) -> Result<Vec<Document>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let collections = self.collections.read();
        let data = collections
            .get(&collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        Ok(data
            .docs
            .range(Self::bounds(range))
            .map(|(k, v)| Document {
                key: k.clone(),
                body: v.clone(),
            })
            .collect())
    }

    async fn get(&self, collection: CollectionUuid, key: &[u8]) -> Result<Option<Document>> {
        let collections = self.collections.read();
        let data = collections
            .get(&collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        Ok(data.docs.get(key).map(|body| Document {
            key: key.to_vec(),
            body: body.clone(),
        }))
    }

    async fn upsert(&self, collection: CollectionUuid, doc: Document) -> Result<()> {
        let mut collections = self.collections.write();
        let data = collections
            .get_mut(&collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        data.docs.insert(doc.key, doc.body);
        Ok(())
    }

    async fn delete(&self, collection: CollectionUuid, key: &[u8]) -> Result<bool> {
        let mut collections = self.collections.write();
        let data = collections
            .get_mut(&collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        Ok(data.docs.remove(key).is_some())
    }

    async fn count_range(&self, collection: CollectionUuid, range: &KeyRange) -> Result<u64> {
        if range.is_empty() {
            return Ok(0);
        }
        let collections = self.collections.read();
        let data = collections
            .get(&collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        Ok(data.docs.range(Self::bounds(range)).count() as u64)
    }

    async fn delete_range_batch(
        &self,
        collection: CollectionUuid,
        range: &KeyRange,
        limit: usize,
    ) -> Result<u64> {
        let pending = self.inject_delete_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.inject_delete_failures
                .store(pending - 1, Ordering::SeqCst);
            return Err(Error::Storage("injected transient delete failure".into()));
        }
        if range.is_empty() {
            return Ok(0);
        }
        let mut collections = self.collections.write();
        let data = collections
            .get_mut(&collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        let keys: Vec<Vec<u8>> = data
            .docs
            .range(Self::bounds(range))
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            data.docs.remove(key);
        }
        Ok(keys.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn seeded() -> (InMemoryStorage, CollectionUuid) {
        let storage = InMemoryStorage::new();
        let coll = Uuid::new_v4();
        storage
            .create_collection("test.kv", coll, vec![IndexSpec::new("_key_", "{x: 1}")])
            .await
            .unwrap();
        for key in [b"a".to_vec(), b"f".to_vec(), b"m".to_vec(), b"z".to_vec()] {
            storage
                .upsert(coll, Document::new(key, vec![0u8]))
                .await
                .unwrap();
        }
        (storage, coll)
    }

    #[tokio::test]
    async fn test_snapshot_range_half_open() {
        let (storage, coll) = seeded().await;
        let range = KeyRange::new(KeyBound::key(b"f".to_vec()), KeyBound::key(b"m".to_vec()));
        let docs = storage.snapshot_range(coll, &range).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].key, b"f".to_vec());

        let all = storage.snapshot_range(coll, &KeyRange::full()).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_delete_range_batch_bounded() {
        let (storage, coll) = seeded().await;
        let deleted = storage
            .delete_range_batch(coll, &KeyRange::full(), 3)
            .await
            .unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(storage.count_range(coll, &KeyRange::full()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_injected_delete_failure() {
        let (storage, coll) = seeded().await;
        storage.inject_delete_failures(1);
        assert!(storage
            .delete_range_batch(coll, &KeyRange::full(), 10)
            .await
            .is_err());
        // Next attempt succeeds.
        assert_eq!(
            storage
                .delete_range_batch(coll, &KeyRange::full(), 10)
                .await
                .unwrap(),
            4
        );
    }

    #[tokio::test]
    async fn test_create_collection_idempotent() {
        let (storage, coll) = seeded().await;
        storage
            .create_collection("test.kv", coll, vec![])
            .await
            .unwrap();
        assert_eq!(storage.collection_uuid("test.kv").await.unwrap(), Some(coll));
        assert_eq!(storage.collection_uuid("missing").await.unwrap(), None);
    }
}
