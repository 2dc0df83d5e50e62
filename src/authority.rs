//! Cluster authority client.
//!
//! The authority is the durable, linearizable source of truth for chunk
//! ownership. Shards never decide ownership among themselves: the donor
//! asks the authority to commit a handoff, and crash recovery consults
//! the authority to learn whether a handoff took effect.

use crate::error::{Error, Result};
use crate::types::{Chunk, ChunkVersion, CollectionRoutingInfo, CollectionUuid, KeyRange, ShardId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Client interface to the cluster's metadata authority.
#[async_trait]
pub trait ClusterAuthority: Send + Sync + std::fmt::Debug {
    /// Fetch the authoritative routing info for a collection.
    async fn refresh_routing(&self, collection: CollectionUuid) -> Result<CollectionRoutingInfo>;

    /// Durably commit an ownership handoff of `range` from `from` to
    /// `to` and return the chunk's new version.
    ///
    /// The commit is conditional on `expected` still being the chunk's
    /// version. Replaying a commit that already took effect returns the
    /// current version instead of failing, so a donor that crashed
    /// after the authority applied its commit can safely retry.
    async fn commit_ownership_change(
        &self,
        collection: CollectionUuid,
        range: &KeyRange,
        from: ShardId,
        to: ShardId,
        expected: ChunkVersion,
    ) -> Result<ChunkVersion>;

    /// The authoritative chunk exactly matching `range`, used by crash
    /// recovery to resolve an in-doubt migration.
    async fn committed_chunk(&self, collection: CollectionUuid, range: &KeyRange) -> Result<Chunk>;
}

/// In-process authority backed by a mutex-guarded routing map.
///
/// Stands in for the real config service in tests and single-process
/// deployments; commits are applied atomically under one lock, which is
/// all the linearizability the trait demands.
#[derive(Debug, Default)]
pub struct InMemoryAuthority {
    routing: Mutex<HashMap<CollectionUuid, CollectionRoutingInfo>>,
    /// Fail the next N calls (test support for an unreachable authority).
    inject_failures: AtomicU32,
}

impl InMemoryAuthority {
    /// Create an empty authority.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed routing info for a collection, replacing any cached copy.
    pub fn install_collection(&self, info: CollectionRoutingInfo) -> Result<()> {
        info.validate().map_err(Error::Internal)?;
        self.routing.lock().insert(info.collection, info);
        Ok(())
    }

    /// Make the next `n` calls fail as if the authority were unreachable.
    pub fn inject_failures(&self, n: u32) {
        self.inject_failures.store(n, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<()> {
        let pending = self.inject_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.inject_failures.store(pending - 1, Ordering::SeqCst);
            return Err(Error::Timeout);
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterAuthority for InMemoryAuthority {
    async fn refresh_routing(&self, collection: CollectionUuid) -> Result<CollectionRoutingInfo> {
        self.check_reachable()?;
        self.routing
            .lock()
            .get(&collection)
            .cloned()
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))
    }

    async fn commit_ownership_change(
        &self,
        collection: CollectionUuid,
        range: &KeyRange,
        from: ShardId,
        to: ShardId,
        expected: ChunkVersion,
    ) -> Result<ChunkVersion> {
        self.check_reachable()?;
        let mut routing = self.routing.lock();
        let info = routing
            .get_mut(&collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        let next = info.max_version().bump_major();
        let chunk = info
            .chunks
            .iter_mut()
            .find(|c| &c.range == range)
            .ok_or_else(|| Error::Internal(format!("no chunk matching range {}", range)))?;

        // Replayed commit: already applied, report the committed version.
        if chunk.shard == to && chunk.version > expected {
            return Ok(chunk.version);
        }
        if chunk.shard != from || chunk.version != expected {
            return Err(Error::StaleVersion {
                expected,
                actual: chunk.version,
            });
        }

        chunk.shard = to;
        chunk.version = next;
        tracing::info!(
            collection = %collection,
            range = %range,
            from_shard = from,
            to_shard = to,
            version = %next,
            "Authority committed ownership change"
        );
        Ok(next)
    }

    async fn committed_chunk(&self, collection: CollectionUuid, range: &KeyRange) -> Result<Chunk> {
        self.check_reachable()?;
        self.routing
            .lock()
            .get(&collection)
            .and_then(|info| info.chunk_for_range(range).cloned())
            .ok_or_else(|| Error::Internal(format!("no chunk matching range {}", range)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyBound;
    use uuid::Uuid;

    fn seed(authority: &InMemoryAuthority) -> (CollectionUuid, KeyRange) {
        let coll = Uuid::new_v4();
        let range = KeyRange::new(KeyBound::NegInfinity, KeyBound::key(b"m".to_vec()));
        authority
            .install_collection(CollectionRoutingInfo::new(
                coll,
                "{x: 1}",
                vec![
                    Chunk {
                        range: range.clone(),
                        shard: 1,
                        version: ChunkVersion::new(1, 0),
                        collection: coll,
                    },
                    Chunk {
                        range: KeyRange::new(KeyBound::key(b"m".to_vec()), KeyBound::PosInfinity),
                        shard: 2,
                        version: ChunkVersion::new(1, 1),
                        collection: coll,
                    },
                ],
            ))
            .unwrap();
        (coll, range)
    }

    #[tokio::test]
    async fn test_commit_bumps_major_of_collection_max() {
        let authority = InMemoryAuthority::new();
        let (coll, range) = seed(&authority);

        let v = authority
            .commit_ownership_change(coll, &range, 1, 2, ChunkVersion::new(1, 0))
            .await
            .unwrap();
        assert_eq!(v, ChunkVersion::new(2, 0));

        let chunk = authority.committed_chunk(coll, &range).await.unwrap();
        assert_eq!(chunk.shard, 2);
        assert_eq!(chunk.version, v);
    }

    #[tokio::test]
    async fn test_commit_replay_returns_committed_version() {
        let authority = InMemoryAuthority::new();
        let (coll, range) = seed(&authority);

        let v1 = authority
            .commit_ownership_change(coll, &range, 1, 2, ChunkVersion::new(1, 0))
            .await
            .unwrap();
        let v2 = authority
            .commit_ownership_change(coll, &range, 1, 2, ChunkVersion::new(1, 0))
            .await
            .unwrap();
        assert_eq!(v1, v2);
    }

    #[tokio::test]
    async fn test_commit_rejects_stale_expected_version() {
        let authority = InMemoryAuthority::new();
        let (coll, range) = seed(&authority);

        let err = authority
            .commit_ownership_change(coll, &range, 1, 2, ChunkVersion::new(9, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StaleVersion { .. }));
    }

    #[tokio::test]
    async fn test_injected_unreachable() {
        let authority = InMemoryAuthority::new();
        let (coll, _) = seed(&authority);
        authority.inject_failures(1);
        assert!(authority.refresh_routing(coll).await.is_err());
        assert!(authority.refresh_routing(coll).await.is_ok());
    }
}
