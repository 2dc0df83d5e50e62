//! Per-shard range ownership tracking.
//!
//! The [`RangeOwnershipTable`] is the authoritative per-shard answer to
//! "do I own key K right now, and at what version?". Lookups take a
//! read lock only; ownership changes are applied exclusively by the
//! migration machinery after a durable commit decision.

use crate::error::{Error, Result};
use crate::types::{ChunkVersion, CollectionRoutingInfo, CollectionUuid, KeyRange, ShardId};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Result of an ownership lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipLookup {
    /// Whether this shard owns the key's chunk.
    pub owned: bool,
    /// Version of the enclosing chunk, if routing is cached.
    pub version: Option<ChunkVersion>,
}

impl OwnershipLookup {
    /// Lookup result when no routing info is cached for the collection.
    pub fn unknown() -> Self {
        Self {
            owned: false,
            version: None,
        }
    }
}

/// Per-shard table of cached routing info and chunk ownership.
#[derive(Debug)]
pub struct RangeOwnershipTable {
    /// The shard this table belongs to.
    shard_id: ShardId,
    /// Cached routing info per collection.
    routing: RwLock<HashMap<CollectionUuid, CollectionRoutingInfo>>,
}

impl RangeOwnershipTable {
    /// Create an empty table for a shard.
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            routing: RwLock::new(HashMap::new()),
        }
    }

    /// The shard this table answers for.
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Whether routing info is cached for a collection.
    pub fn has_routing(&self, collection: CollectionUuid) -> bool {
        self.routing.read().contains_key(&collection)
    }

    /// Answer "do I own `key`?" without blocking on migration machinery.
    pub fn lookup(&self, collection: CollectionUuid, key: &[u8]) -> OwnershipLookup {
        let routing = self.routing.read();
        let Some(info) = routing.get(&collection) else {
            return OwnershipLookup::unknown();
        };
        match info.owner_of(key) {
            Some((shard, version)) => OwnershipLookup {
                owned: shard == self.shard_id,
                version: Some(version),
            },
            None => OwnershipLookup::unknown(),
        }
    }

    /// The chunk exactly matching `range`, if cached.
    pub fn chunk_for_range(
        &self,
        collection: CollectionUuid,
        range: &KeyRange,
    ) -> Option<crate::types::Chunk> {
        self.routing
            .read()
            .get(&collection)
            .and_then(|info| info.chunk_for_range(range))
            .cloned()
    }

    /// Ranges currently owned by this shard for a collection.
    pub fn owned_ranges(&self, collection: CollectionUuid) -> Vec<KeyRange> {
        self.routing
            .read()
            .get(&collection)
            .map(|info| {
                info.chunks
                    .iter()
                    .filter(|c| c.shard == self.shard_id)
                    .map(|c| c.range.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Install routing info refreshed from the cluster authority.
    ///
    /// Refresh is a pure install: the new info replaces the cached copy
    /// only if it carries a strictly newer max chunk version (or no copy
    /// is cached). Returns whether the install happened.
    pub fn install_routing_info(&self, info: CollectionRoutingInfo) -> Result<bool> {
        info.validate().map_err(Error::Internal)?;
        let mut routing = self.routing.write();
        match routing.get(&info.collection) {
            Some(cached) if cached.max_version() >= info.max_version() => Ok(false),
            _ => {
                routing.insert(info.collection, info);
                Ok(true)
            }
        }
    }

    /// Atomically transfer ownership of `range` after a durable commit
    /// decision.
    ///
    /// Fails with [`Error::StaleVersion`] if `expected` does not match
    /// the chunk's current version, protecting against duplicate or
    /// out-of-order commits. Replaying a commit that already took
    /// effect is a no-op.
    pub fn apply_ownership_change(
        &self,
        collection: CollectionUuid,
        range: &KeyRange,
        new_owner: ShardId,
        expected: ChunkVersion,
        new_version: ChunkVersion,
    ) -> Result<()> {
        let mut routing = self.routing.write();
        let info = routing
            .get_mut(&collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        let chunk = info
            .chunks
            .iter_mut()
            .find(|c| &c.range == range)
            .ok_or_else(|| Error::Internal(format!("no chunk matching range {}", range)))?;

        // Duplicate commit replay: the change already took effect.
        if chunk.shard == new_owner && chunk.version >= new_version {
            return Ok(());
        }
        if chunk.version != expected {
            return Err(Error::StaleVersion {
                expected,
                actual: chunk.version,
            });
        }
        if new_version <= chunk.version {
            return Err(Error::StaleVersion {
                expected: new_version,
                actual: chunk.version,
            });
        }

        tracing::info!(
            collection = %collection,
            range = %chunk.range,
            from_shard = chunk.shard,
            to_shard = new_owner,
            version = %new_version,
            "Ownership change applied"
        );
        chunk.shard = new_owner;
        chunk.version = new_version;
        Ok(())
    }
}
