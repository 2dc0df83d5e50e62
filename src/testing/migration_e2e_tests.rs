//! Migration E2E Test Suite
//!
//! End-to-end tests for range migration between shards, verifying:
//! - Full move with no data loss and no orphan double-counting
//! - Idempotent clone batch retries
//! - Conflict rejection for overlapping migrations
//! - Write forwarding while a range is cloning
//! - Fast precondition failures before any data moves
//!
//! # Test Strategy
//!
//! Tests use the `TestCluster` fixture: real `ShardNode`s over a shared
//! in-memory authority, connected by in-process transports with failure
//! and delay injection.

#[cfg(test)]
mod tests {
    use crate::admin::MoveRangeRequest;
    use crate::config::MigrationConfig;
    use crate::migration::donor::MigrationSourceManager;
    use crate::migration::recovery::RecoveryStore;
    use crate::migration::transport::RecipientRpc;
    use crate::testing::{doc, TestCluster};
    use crate::types::{IndexSpec, KeyBound, KeyRange};
    use std::sync::Arc;
    use std::time::Duration;

    fn lower() -> KeyRange {
        KeyRange::new(KeyBound::NegInfinity, KeyBound::key(b"m".to_vec()))
    }

    fn upper() -> KeyRange {
        KeyRange::new(KeyBound::key(b"m".to_vec()), KeyBound::PosInfinity)
    }

    #[tokio::test]
    async fn test_move_range_end_to_end() {
        let cluster = TestCluster::new(&[1, 2]);
        let coll = cluster
            .create_collection("test.kv", vec![(lower(), 1), (upper(), 1)])
            .await
            .unwrap();
        for key in ["apple", "banana", "fig", "melon", "zebra"] {
            cluster.insert(coll, doc(key)).await.unwrap();
        }
        assert_eq!(cluster.node(1).raw_count(coll).await.unwrap(), 5);

        let resp = cluster
            .node(1)
            .move_range(MoveRangeRequest {
                ns: "test.kv".to_string(),
                range: lower(),
                to_shard: 2,
            })
            .await;
        assert!(resp.ok, "move failed: {:?}", resp.error);

        // No loss, no double counting: the donor still physically holds
        // the migrated documents, but its filter excludes them.
        assert_eq!(cluster.cluster_count(coll).await.unwrap(), 5);
        assert_eq!(cluster.node(1).raw_count(coll).await.unwrap(), 5);
        assert_eq!(cluster.node(1).owned_count(coll).await.unwrap(), 2);
        assert_eq!(cluster.node(2).owned_count(coll).await.unwrap(), 3);

        // Writes to the moved range now land on the recipient.
        cluster.insert(coll, doc("cherry")).await.unwrap();
        assert_eq!(cluster.node(2).owned_count(coll).await.unwrap(), 4);
        assert!(cluster
            .node(2)
            .find(coll, b"apple")
            .await
            .unwrap()
            .is_some());
        assert!(cluster.node(1).find(coll, b"apple").await.unwrap().is_none());

        // Cleanup reclaims the donor's orphans without touching the rest.
        let deleted = cluster.node(1).scheduler().drain_ready().await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(cluster.node(1).raw_count(coll).await.unwrap(), 2);
        assert_eq!(cluster.cluster_count(coll).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_move_back_blocked_until_cleanup_completes() {
        let cluster = TestCluster::new(&[1, 2]);
        let coll = cluster
            .create_collection("test.kv", vec![(lower(), 1), (upper(), 1)])
            .await
            .unwrap();
        for key in ["apple", "banana", "zebra"] {
            cluster.insert(coll, doc(key)).await.unwrap();
        }

        let resp = cluster
            .node(1)
            .move_range(MoveRangeRequest {
                ns: "test.kv".to_string(),
                range: lower(),
                to_shard: 2,
            })
            .await;
        assert!(resp.ok, "move failed: {:?}", resp.error);

        // Shard 1 still holds the orphans behind a queued deletion
        // task; moving the range straight back would hand that task
        // freshly committed documents to destroy.
        let resp = cluster
            .node(2)
            .move_range(MoveRangeRequest {
                ns: "test.kv".to_string(),
                range: lower(),
                to_shard: 1,
            })
            .await;
        assert!(!resp.ok);
        assert_eq!(resp.code, Some(21));
        assert_eq!(cluster.cluster_count(coll).await.unwrap(), 3);

        // Once the cleanup runs, the move back goes through unharmed.
        assert_eq!(cluster.node(1).scheduler().drain_ready().await.unwrap(), 2);
        let resp = cluster
            .node(2)
            .move_range(MoveRangeRequest {
                ns: "test.kv".to_string(),
                range: lower(),
                to_shard: 1,
            })
            .await;
        assert!(resp.ok, "move back failed: {:?}", resp.error);
        assert_eq!(cluster.cluster_count(coll).await.unwrap(), 3);
        assert_eq!(cluster.node(1).owned_count(coll).await.unwrap(), 3);

        assert_eq!(cluster.node(2).scheduler().drain_ready().await.unwrap(), 2);
        assert_eq!(cluster.cluster_count(coll).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_move_range_wait_for_delete() {
        let cluster = TestCluster::with_config(
            &[1, 2],
            MigrationConfig::default().with_wait_for_delete(true),
        );
        let coll = cluster
            .create_collection("test.kv", vec![(lower(), 1), (upper(), 1)])
            .await
            .unwrap();
        for key in ["apple", "zebra"] {
            cluster.insert(coll, doc(key)).await.unwrap();
        }

        let resp = cluster
            .node(1)
            .move_range(MoveRangeRequest {
                ns: "test.kv".to_string(),
                range: lower(),
                to_shard: 2,
            })
            .await;
        assert!(resp.ok, "move failed: {:?}", resp.error);

        // The response only returns after the orphans are gone.
        assert_eq!(cluster.node(1).raw_count(coll).await.unwrap(), 1);
        assert_eq!(cluster.cluster_count(coll).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_clone_batch_retry_is_idempotent() {
        let cluster = TestCluster::with_config(
            &[1, 2],
            MigrationConfig::default().with_clone_batch_size(2),
        );
        let coll = cluster
            .create_collection("test.kv", vec![(lower(), 1), (upper(), 2)])
            .await
            .unwrap();
        for key in ["a", "b", "c", "d", "e"] {
            cluster.insert(coll, doc(key)).await.unwrap();
        }

        // First batch send fails after delivery would have happened; the
        // donor retries and the recipient deduplicates by sequence.
        cluster.rpc(2).fail_clone_batches(1);
        let resp = cluster
            .node(1)
            .move_range(MoveRangeRequest {
                ns: "test.kv".to_string(),
                range: lower(),
                to_shard: 2,
            })
            .await;
        assert!(resp.ok, "move failed: {:?}", resp.error);

        assert_eq!(cluster.node(2).owned_count(coll).await.unwrap(), 5);
        assert_eq!(cluster.cluster_count(coll).await.unwrap(), 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_conflicting_migration_rejected() {
        let cluster = Arc::new(TestCluster::new(&[1, 2]));
        let coll = cluster
            .create_collection("test.kv", vec![(lower(), 1), (upper(), 1)])
            .await
            .unwrap();
        cluster.insert(coll, doc("apple")).await.unwrap();

        cluster.rpc(2).set_clone_delay(Some(Duration::from_millis(200)));
        let slow = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                cluster
                    .node(1)
                    .move_range(MoveRangeRequest {
                        ns: "test.kv".to_string(),
                        range: lower(),
                        to_shard: 2,
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Same range, still in flight.
        let resp = cluster
            .node(1)
            .move_range(MoveRangeRequest {
                ns: "test.kv".to_string(),
                range: lower(),
                to_shard: 2,
            })
            .await;
        assert!(!resp.ok);
        assert_eq!(resp.code, Some(20));

        let first = slow.await.unwrap();
        assert!(first.ok, "first move failed: {:?}", first.error);
        assert_eq!(cluster.cluster_count(coll).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_writes_forward_during_clone() {
        let cluster = Arc::new(TestCluster::new(&[1, 2]));
        let coll = cluster
            .create_collection("test.kv", vec![(lower(), 1), (upper(), 1)])
            .await
            .unwrap();
        for key in ["apple", "banana", "fig"] {
            cluster.insert(coll, doc(key)).await.unwrap();
        }

        cluster.rpc(2).set_clone_delay(Some(Duration::from_millis(150)));
        let moving = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                cluster
                    .node(1)
                    .move_range(MoveRangeRequest {
                        ns: "test.kv".to_string(),
                        range: lower(),
                        to_shard: 2,
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Written mid-clone: applied on the donor and forwarded to the
        // recipient through the mods buffer.
        cluster.insert(coll, doc("cherry")).await.unwrap();

        let resp = moving.await.unwrap();
        assert!(resp.ok, "move failed: {:?}", resp.error);
        assert!(cluster
            .node(2)
            .find(coll, b"cherry")
            .await
            .unwrap()
            .is_some());
        assert_eq!(cluster.node(2).owned_count(coll).await.unwrap(), 4);
        assert_eq!(cluster.cluster_count(coll).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_missing_index_fails_before_any_data_moves() {
        let cluster = TestCluster::new(&[1, 2]);
        let coll = cluster
            .create_collection("test.kv", vec![(lower(), 1), (upper(), 2)])
            .await
            .unwrap();
        cluster.insert(coll, doc("apple")).await.unwrap();
        cluster.insert(coll, doc("zebra")).await.unwrap();

        // The donor grows an index the (non-empty) recipient lacks.
        cluster
            .entry(1)
            .storage
            .add_index(coll, IndexSpec::new("x_1", "{x: 1}"))
            .unwrap();

        let resp = cluster
            .node(1)
            .move_range(MoveRangeRequest {
                ns: "test.kv".to_string(),
                range: lower(),
                to_shard: 2,
            })
            .await;
        assert!(!resp.ok);
        assert_eq!(resp.code, Some(40));

        // Failed preconditions move nothing and leave nothing behind.
        assert_eq!(cluster.node(2).raw_count(coll).await.unwrap(), 1);
        assert_eq!(cluster.node(1).owned_count(coll).await.unwrap(), 1);
        assert!(cluster
            .entry(1)
            .recovery_store
            .load_all()
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_before_critical_section() {
        let cluster = Arc::new(TestCluster::new(&[1, 2]));
        let coll = cluster
            .create_collection("test.kv", vec![(lower(), 1), (upper(), 1)])
            .await
            .unwrap();
        cluster.insert(coll, doc("apple")).await.unwrap();

        cluster.rpc(2).set_clone_delay(Some(Duration::from_millis(200)));
        let donor = Arc::new(MigrationSourceManager::new(
            "test.kv",
            coll,
            lower(),
            2,
            MigrationConfig::default(),
            cluster.node(1).donor_deps(),
        ));
        let running = {
            let donor = donor.clone();
            let rpc: Arc<dyn RecipientRpc> = cluster.rpc(2).clone();
            tokio::spawn(async move { donor.run(rpc).await })
        };
        tokio::time::sleep(Duration::from_millis(40)).await;
        donor.cancel();

        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(err, crate::error::Error::Cancelled));

        // The donor keeps ownership and the claim is released: a second
        // attempt goes through.
        cluster.rpc(2).set_clone_delay(None);
        assert_eq!(cluster.node(1).owned_count(coll).await.unwrap(), 1);
        let resp = cluster
            .node(1)
            .move_range(MoveRangeRequest {
                ns: "test.kv".to_string(),
                range: lower(),
                to_shard: 2,
            })
            .await;
        assert!(resp.ok, "retry failed: {:?}", resp.error);
    }
}
