//! Chunk migration and ownership consistency for a sharded store.
//!
//! This crate provides the machinery a shard needs to hand contiguous
//! key ranges (chunks) to other shards without losing writes or leaking
//! orphaned documents:
//! - **Range ownership tracking** with versioned routing metadata
//! - **Orphan filtering** on the read and write paths
//! - **Donor/recipient migration protocol** with clone, catch-up, and a
//!   brief critical-section commit
//! - **Crash recovery** that settles in-doubt migrations against the
//!   cluster authority instead of guessing
//! - **Persistent range deletion** for post-migration cleanup
//!
//! # Example
//!
//! ```rust,no_run
//! use chunkmover::{
//!     InMemoryAuthority, InMemoryRangeDeletionStore, InMemoryRecoveryStore, InMemoryStorage,
//!     KeyBound, KeyRange, MigrationConfig, MoveRangeRequest, RangeDeletionConfig, ShardNode,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let authority = Arc::new(InMemoryAuthority::new());
//!     let node = ShardNode::new(
//!         1,
//!         Arc::new(InMemoryStorage::new()),
//!         Arc::new(InMemoryRecoveryStore::new()),
//!         Arc::new(InMemoryRangeDeletionStore::new()),
//!         authority,
//!         MigrationConfig::default(),
//!         RangeDeletionConfig::default(),
//!     );
//!
//!     // Settle anything a previous process left in doubt.
//!     node.recover_on_startup().await?;
//!
//!     // Hand the lower half of the key space to shard 2.
//!     let resp = node
//!         .move_range(MoveRangeRequest {
//!             ns: "app.users".to_string(),
//!             range: KeyRange::new(KeyBound::NegInfinity, KeyBound::key(b"m".to_vec())),
//!             to_shard: 2,
//!         })
//!         .await;
//!     assert!(resp.ok);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 ShardNode                    │
//! │  • move_range(ns, range, to_shard)           │
//! │  • apply / find through the orphan filter    │
//! │  • recover_on_startup()                      │
//! └──────────────────────────────────────────────┘
//!          │                │               │
//!          ▼                ▼               ▼
//! ┌───────────────┐  ┌─────────────┐  ┌────────────────┐
//! │ Migration     │  │ Ownership   │  │ RangeDeletion  │
//! │ donor/recip./ │  │ table +     │  │ scheduler +    │
//! │ coordinator   │  │ OrphanFilter│  │ durable tasks  │
//! └───────────────┘  └─────────────┘  └────────────────┘
//!          │
//!          ▼
//! ┌───────────────┐
//! │ ClusterAuth-  │  durable, linearizable chunk metadata
//! │ ority         │
//! └───────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Ownership** is decided only by the cluster authority; shards cache
//!   versioned routing info and refresh on staleness.
//! - **Commits** are write-ahead: a pending recovery document is durable
//!   before the authority is asked to commit, so any crash leaves enough
//!   state to settle the outcome.
//! - **Reads and writes** pass through the orphan filter: documents a
//!   shard stores but does not own are invisible and unwritable.

pub mod admin;
pub mod authority;
pub mod config;
pub mod error;
pub mod metrics;
pub mod migration;
pub mod orphan;
pub mod ownership;
pub mod range_deletion;
pub mod storage;
pub mod testing;
pub mod types;

// Re-export main public API
pub use admin::{MoveRangeRequest, MoveRangeResponse, ShardNode};
pub use authority::{ClusterAuthority, InMemoryAuthority};
pub use config::{MigrationConfig, RangeDeletionConfig};
pub use error::{Error, Result};
pub use types::{
    Chunk, ChunkVersion, CollectionRoutingInfo, CollectionUuid, Document, IndexSpec, KeyBound,
    KeyRange, ModKind, ModOp, ShardId, ShardKey,
};

// Ownership and filtering
pub use orphan::{MigrationWriteHook, ModsBuffer, OrphanFilter};
pub use ownership::{OwnershipLookup, RangeOwnershipTable};

// Migration protocol
pub use migration::{
    ActiveMigrationRegistry, CloneBatch, DestinationState, DonorDeps, DonorState,
    FileRecoveryStore, InMemoryRecoveryStore, LocalRecipientRpc, MigrationCoordinator,
    MigrationDecision, MigrationDestinationManager, MigrationRecoveryDocument,
    MigrationSourceManager, RecipientRpc, RecoveryStore, RecoverySummary, StartRecipientRequest,
};

// Storage and cleanup
pub use range_deletion::{
    FileRangeDeletionStore, InMemoryRangeDeletionStore, RangeDeletionScheduler,
    RangeDeletionStore, RangeDeletionTask,
};
pub use storage::{InMemoryStorage, ShardStorage};

// Observability
pub use metrics::{Counter, Gauge, MigrationMetrics};

// Test fixtures
pub use testing::{TestCluster, TestNode};
