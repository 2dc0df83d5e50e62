//! Testing utilities for the migration subsystem.
//!
//! The central piece is [`TestCluster`], a multi-shard fixture wiring
//! [`ShardNode`]s to a shared [`InMemoryAuthority`] over in-process
//! transports. Durable stores are held by `Arc`, so a "crashed" node
//! can be rebuilt over the same state to exercise recovery paths.
//!
//! End-to-end suites live in the `*_tests` submodules.

use crate::admin::ShardNode;
use crate::authority::{ClusterAuthority, InMemoryAuthority};
use crate::config::{MigrationConfig, RangeDeletionConfig};
use crate::error::Result;
use crate::migration::recovery::InMemoryRecoveryStore;
use crate::migration::transport::LocalRecipientRpc;
use crate::range_deletion::InMemoryRangeDeletionStore;
use crate::storage::{InMemoryStorage, ShardStorage};
use crate::types::{
    Chunk, ChunkVersion, CollectionRoutingInfo, CollectionUuid, Document, IndexSpec, KeyRange,
    ModOp, ShardId,
};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

mod migration_e2e_tests;
mod recovery_e2e_tests;

/// One shard in a [`TestCluster`], with handles to its durable state.
pub struct TestNode {
    /// The assembled node.
    pub node: Arc<ShardNode>,
    /// The node's storage engine, shared across restarts.
    pub storage: Arc<InMemoryStorage>,
    /// The node's recovery document store, shared across restarts.
    pub recovery_store: Arc<InMemoryRecoveryStore>,
    /// The node's deletion task store, shared across restarts.
    pub deletion_store: Arc<InMemoryRangeDeletionStore>,
    /// Transport other shards use to reach this node's recipient.
    pub rpc: Arc<LocalRecipientRpc>,
}

/// Multi-shard fixture over a shared in-memory authority.
pub struct TestCluster {
    /// The cluster's metadata authority.
    pub authority: Arc<InMemoryAuthority>,
    config: MigrationConfig,
    nodes: HashMap<ShardId, TestNode>,
}

impl TestCluster {
    /// Build a cluster with default configuration.
    pub fn new(shards: &[ShardId]) -> Self {
        Self::with_config(shards, MigrationConfig::default())
    }

    /// Build a cluster with a custom migration configuration.
    pub fn with_config(shards: &[ShardId], config: MigrationConfig) -> Self {
        let authority = Arc::new(InMemoryAuthority::new());
        let mut cluster = Self {
            authority,
            config,
            nodes: HashMap::new(),
        };
        for &shard in shards {
            let test_node = cluster.build_node(
                shard,
                Arc::new(InMemoryStorage::new()),
                Arc::new(InMemoryRecoveryStore::new()),
                Arc::new(InMemoryRangeDeletionStore::new()),
            );
            cluster.nodes.insert(shard, test_node);
        }
        cluster.wire_peers();
        cluster
    }

    fn build_node(
        &self,
        shard: ShardId,
        storage: Arc<InMemoryStorage>,
        recovery_store: Arc<InMemoryRecoveryStore>,
        deletion_store: Arc<InMemoryRangeDeletionStore>,
    ) -> TestNode {
        let node = ShardNode::new(
            shard,
            storage.clone(),
            recovery_store.clone(),
            deletion_store.clone(),
            self.authority.clone(),
            self.config.clone(),
            RangeDeletionConfig::default(),
        );
        let rpc = Arc::new(LocalRecipientRpc::new(node.destination().clone()));
        TestNode {
            node,
            storage,
            recovery_store,
            deletion_store,
            rpc,
        }
    }

    fn wire_peers(&self) {
        for (&a, node_a) in &self.nodes {
            for (&b, node_b) in &self.nodes {
                if a != b {
                    node_a.node.add_peer(b, node_b.rpc.clone());
                }
            }
        }
    }

    /// A shard's node.
    pub fn node(&self, shard: ShardId) -> &Arc<ShardNode> {
        &self.nodes[&shard].node
    }

    /// A shard's full fixture entry.
    pub fn entry(&self, shard: ShardId) -> &TestNode {
        &self.nodes[&shard]
    }

    /// The transport wrapping a shard's recipient.
    pub fn rpc(&self, shard: ShardId) -> &Arc<LocalRecipientRpc> {
        &self.nodes[&shard].rpc
    }

    /// Create a sharded collection whose chunks are placed per
    /// `placement`, seed the authority, and pre-create the collection
    /// on the shards that own data, each with the default key index.
    pub async fn create_collection(
        &self,
        ns: &str,
        placement: Vec<(KeyRange, ShardId)>,
    ) -> Result<CollectionUuid> {
        let coll = Uuid::new_v4();
        let owners: Vec<ShardId> = placement.iter().map(|(_, s)| *s).collect();
        let chunks = placement
            .into_iter()
            .enumerate()
            .map(|(i, (range, shard))| Chunk {
                range,
                shard,
                version: ChunkVersion::new(1, i as u64),
                collection: coll,
            })
            .collect();
        self.authority
            .install_collection(CollectionRoutingInfo::new(coll, "{x: 1}", chunks))?;

        for (&shard, entry) in &self.nodes {
            if owners.contains(&shard) {
                entry
                    .storage
                    .create_collection(ns, coll, vec![IndexSpec::new("_key_", "{x: 1}")])
                    .await?;
            }
            entry.node.refresh_routing(coll).await?;
        }
        Ok(coll)
    }

    /// Route a write to the owning shard, refreshing and retrying once
    /// on a stale-routing rejection, the way a router would.
    pub async fn route_write(&self, coll: CollectionUuid, op: ModOp) -> Result<()> {
        for attempt in 0..3 {
            let info = self.authority.refresh_routing(coll).await?;
            let Some((owner, _)) = info.owner_of(op.key()) else {
                return Err(crate::error::Error::Internal("key has no owner".into()));
            };
            let node = self.node(owner);
            match node.apply(coll, op.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable_routing() && attempt < 2 => {
                    node.refresh_routing(coll).await?;
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(crate::error::Error::Internal("routing retries exhausted".into()))
    }

    /// Insert a document through the router path.
    pub async fn insert(&self, coll: CollectionUuid, doc: Document) -> Result<()> {
        self.route_write(coll, ModOp::insert(doc)).await
    }

    /// Total documents the cluster owns, summed over ownership-filtered
    /// per-shard counts. Orphans never inflate this number.
    pub async fn cluster_count(&self, coll: CollectionUuid) -> Result<u64> {
        let mut total = 0;
        for entry in self.nodes.values() {
            total += entry.node.owned_count(coll).await?;
        }
        Ok(total)
    }

    /// Rebuild a node over its existing durable state, simulating a
    /// crash and restart. Peer links are rewired on every node.
    pub fn restart_node(&mut self, shard: ShardId) {
        let old = self.nodes.remove(&shard).unwrap_or_else(|| {
            panic!("no node for shard {shard}");
        });
        let rebuilt = self.build_node(
            shard,
            old.storage,
            old.recovery_store,
            old.deletion_store,
        );
        self.nodes.insert(shard, rebuilt);
        self.wire_peers();
    }
}

/// A small test document.
pub fn doc(key: &str) -> Document {
    Document::new(key.as_bytes().to_vec(), format!("body-{key}").into_bytes())
}
