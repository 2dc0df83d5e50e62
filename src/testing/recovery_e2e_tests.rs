//! Recovery E2E Test Suite
//!
//! Crash-recovery tests for in-doubt migrations, verifying:
//! - Pending decisions are settled by observing the authority, never guessed
//! - Re-driving a settled decision is idempotent
//! - An unreachable authority leaves documents for the next pass
//! - Critical-section failures abort atomically
//!
//! # Test Strategy
//!
//! Crashes are simulated by writing the durable state a dying donor
//! would leave behind, rebuilding the node over the same stores with
//! `TestCluster::restart_node`, and running `recover_on_startup`.

#[cfg(test)]
mod tests {
    use crate::admin::MoveRangeRequest;
    use crate::authority::ClusterAuthority;
    use crate::config::MigrationConfig;
    use crate::migration::recovery::{
        MigrationDecision, MigrationRecoveryDocument, RecoveryStore,
    };
    use crate::migration::transport::{CloneBatch, StartRecipientRequest};
    use crate::storage::ShardStorage;
    use crate::testing::{doc, TestCluster};
    use crate::types::{ChunkVersion, CollectionUuid, IndexSpec, KeyBound, KeyRange};
    use std::time::Duration;
    use uuid::Uuid;

    fn lower() -> KeyRange {
        KeyRange::new(KeyBound::NegInfinity, KeyBound::key(b"m".to_vec()))
    }

    fn upper() -> KeyRange {
        KeyRange::new(KeyBound::key(b"m".to_vec()), KeyBound::PosInfinity)
    }

    fn pending_doc(coll: CollectionUuid) -> MigrationRecoveryDocument {
        MigrationRecoveryDocument {
            migration_id: Uuid::new_v4(),
            collection: coll,
            ns: "test.kv".to_string(),
            range: lower(),
            donor: 1,
            recipient: 2,
            decision: MigrationDecision::Pending,
            pre_migration_version: ChunkVersion::new(1, 0),
        }
    }

    /// The donor died after the authority applied the handoff but
    /// before any local finalization. Recovery must observe the commit
    /// and re-drive every effect.
    #[tokio::test]
    async fn test_pending_settles_committed_from_authority() {
        let mut cluster = TestCluster::new(&[1, 2]);
        let coll = cluster
            .create_collection("test.kv", vec![(lower(), 1), (upper(), 2)])
            .await
            .unwrap();
        for key in ["apple", "banana", "fig"] {
            cluster.insert(coll, doc(key)).await.unwrap();
        }

        // The recipient already holds the cloned copies, the authority
        // already committed, and the pending document survived.
        for key in ["apple", "banana", "fig"] {
            cluster
                .entry(2)
                .storage
                .upsert(coll, doc(key))
                .await
                .unwrap();
        }
        cluster
            .authority
            .commit_ownership_change(coll, &lower(), 1, 2, ChunkVersion::new(1, 0))
            .await
            .unwrap();
        cluster
            .entry(1)
            .recovery_store
            .insert(&pending_doc(coll))
            .await
            .unwrap();

        cluster.restart_node(1);
        let summary = cluster.node(1).recover_on_startup().await.unwrap();
        assert_eq!(summary.committed, 1);
        assert_eq!(summary.aborted, 0);
        assert_eq!(summary.unresolved, 0);

        // The recipient never saw the decision; its next refresh makes
        // the range visible.
        cluster.node(2).refresh_routing(coll).await.unwrap();

        assert!(!cluster.node(1).ownership().lookup(coll, b"apple").owned);
        assert_eq!(cluster.cluster_count(coll).await.unwrap(), 3);
        assert!(cluster
            .entry(1)
            .recovery_store
            .load_all()
            .await
            .unwrap()
            .is_empty());

        // The re-driven deletion task reclaims the donor's orphans.
        assert_eq!(cluster.node(1).scheduler().drain_ready().await.unwrap(), 3);
        assert_eq!(cluster.node(1).raw_count(coll).await.unwrap(), 0);
        assert_eq!(cluster.cluster_count(coll).await.unwrap(), 3);

        // A second pass finds nothing to settle.
        let again = cluster.node(1).recover_on_startup().await.unwrap();
        assert_eq!(again, Default::default());
    }

    /// The donor died inside the critical section before the authority
    /// saw anything. The authority still shows the donor as owner, so
    /// recovery settles the migration as aborted.
    #[tokio::test]
    async fn test_pending_settles_aborted_from_authority() {
        let mut cluster = TestCluster::new(&[1, 2]);
        let coll = cluster
            .create_collection("test.kv", vec![(lower(), 1), (upper(), 2)])
            .await
            .unwrap();
        cluster.insert(coll, doc("apple")).await.unwrap();
        cluster
            .entry(1)
            .recovery_store
            .insert(&pending_doc(coll))
            .await
            .unwrap();

        cluster.restart_node(1);
        let summary = cluster.node(1).recover_on_startup().await.unwrap();
        assert_eq!(summary.aborted, 1);
        assert_eq!(summary.committed, 0);

        assert!(cluster.node(1).ownership().lookup(coll, b"apple").owned);
        assert_eq!(cluster.cluster_count(coll).await.unwrap(), 1);
        assert!(!cluster.node(1).scheduler().has_overlapping(coll, &lower()));
        assert!(cluster
            .entry(1)
            .recovery_store
            .load_all()
            .await
            .unwrap()
            .is_empty());
    }

    /// An unreachable authority must never be guessed around: the
    /// document stays pending until a pass can observe real state.
    #[tokio::test]
    async fn test_pending_unresolved_while_authority_unreachable() {
        let mut cluster = TestCluster::new(&[1, 2]);
        let coll = cluster
            .create_collection("test.kv", vec![(lower(), 1), (upper(), 2)])
            .await
            .unwrap();
        cluster
            .entry(1)
            .recovery_store
            .insert(&pending_doc(coll))
            .await
            .unwrap();
        cluster.restart_node(1);

        cluster.authority.inject_failures(1);
        let summary = cluster.node(1).recover_on_startup().await.unwrap();
        assert_eq!(summary.unresolved, 1);
        assert_eq!(
            cluster.entry(1).recovery_store.load_all().await.unwrap().len(),
            1
        );

        // Next pass, authority back: the document settles.
        let summary = cluster.node(1).recover_on_startup().await.unwrap();
        assert_eq!(summary.aborted, 1);
        assert!(cluster
            .entry(1)
            .recovery_store
            .load_all()
            .await
            .unwrap()
            .is_empty());
    }

    /// A recipient that never acks inside the critical section aborts
    /// the migration atomically: the donor keeps serving the range and
    /// the recipient discards everything it cloned.
    #[tokio::test]
    async fn test_prepare_commit_timeout_aborts_atomically() {
        let cluster = TestCluster::with_config(
            &[1, 2],
            MigrationConfig::default()
                .with_critical_section_timeout(Duration::from_millis(100)),
        );
        let coll = cluster
            .create_collection("test.kv", vec![(lower(), 1), (upper(), 1)])
            .await
            .unwrap();
        for key in ["apple", "banana"] {
            cluster.insert(coll, doc(key)).await.unwrap();
        }

        cluster.rpc(2).fail_prepare_commit(1);
        let resp = cluster
            .node(1)
            .move_range(MoveRangeRequest {
                ns: "test.kv".to_string(),
                range: lower(),
                to_shard: 2,
            })
            .await;
        assert!(!resp.ok);
        assert_eq!(resp.code, Some(31));

        // Donor side untouched, recipient side emptied, nothing durable left.
        assert_eq!(cluster.node(1).owned_count(coll).await.unwrap(), 2);
        assert_eq!(cluster.node(2).raw_count(coll).await.unwrap(), 0);
        assert_eq!(cluster.cluster_count(coll).await.unwrap(), 2);
        assert!(cluster
            .entry(1)
            .recovery_store
            .load_all()
            .await
            .unwrap()
            .is_empty());
        assert!(!cluster.node(1).scheduler().has_overlapping(coll, &lower()));

        // Writes to the range flow again, and a clean retry commits.
        cluster.insert(coll, doc("cherry")).await.unwrap();
        let resp = cluster
            .node(1)
            .move_range(MoveRangeRequest {
                ns: "test.kv".to_string(),
                range: lower(),
                to_shard: 2,
            })
            .await;
        assert!(resp.ok, "retry failed: {:?}", resp.error);
        assert_eq!(cluster.cluster_count(coll).await.unwrap(), 3);
    }

    /// Failures before the pending document exists are a pure abort:
    /// no durable trace, no cleanup obligations.
    #[tokio::test]
    async fn test_failure_before_pending_doc_leaves_no_trace() {
        let cluster = TestCluster::new(&[1, 2]);
        let coll = cluster
            .create_collection("test.kv", vec![(lower(), 1), (upper(), 2)])
            .await
            .unwrap();
        cluster.insert(coll, doc("apple")).await.unwrap();

        // Both the send and its retry fail.
        cluster.rpc(2).fail_clone_batches(2);
        let resp = cluster
            .node(1)
            .move_range(MoveRangeRequest {
                ns: "test.kv".to_string(),
                range: lower(),
                to_shard: 2,
            })
            .await;
        assert!(!resp.ok);

        assert!(cluster
            .entry(1)
            .recovery_store
            .load_all()
            .await
            .unwrap()
            .is_empty());
        assert!(!cluster.node(1).scheduler().has_overlapping(coll, &lower()));
        assert_eq!(cluster.node(1).owned_count(coll).await.unwrap(), 1);
        assert_eq!(cluster.node(1).metrics().migrations_aborted.get(), 1);
        assert_eq!(cluster.node(1).metrics().migrations_active.get(), 0);
    }

    /// A donor that dies mid-clone leaves no recovery document, so no
    /// recovery pass will ever settle the recipient's session. The idle
    /// deadline does: the session aborts and the cloned range goes.
    #[tokio::test]
    async fn test_silent_donor_session_expired_on_recipient() {
        let cluster = TestCluster::with_config(
            &[1, 2],
            MigrationConfig::default()
                .with_recipient_session_timeout(Duration::ZERO),
        );
        let coll = cluster
            .create_collection("test.kv", vec![(lower(), 1), (upper(), 2)])
            .await
            .unwrap();
        for key in ["apple", "banana"] {
            cluster.insert(coll, doc(key)).await.unwrap();
        }

        // The donor opened a session and delivered one batch, then died
        // before anything durable existed.
        let id = Uuid::new_v4();
        cluster
            .node(2)
            .destination()
            .start_recipient(StartRecipientRequest {
                migration_id: id,
                ns: "test.kv".to_string(),
                collection: coll,
                range: lower(),
                donor: 1,
                donor_indexes: vec![IndexSpec::new("_key_", "{x: 1}")],
            })
            .await
            .unwrap();
        cluster
            .node(2)
            .destination()
            .clone_batch(CloneBatch {
                migration_id: id,
                sequence: 0,
                docs: vec![doc("apple")],
                is_final: false,
            })
            .await
            .unwrap();
        assert_eq!(cluster.node(2).raw_count(coll).await.unwrap(), 1);

        assert_eq!(
            cluster.node(2).expire_idle_recipient_sessions().await.unwrap(),
            1
        );
        assert_eq!(cluster.node(2).raw_count(coll).await.unwrap(), 0);
        assert_eq!(cluster.cluster_count(coll).await.unwrap(), 2);
    }

    /// A document already carrying a terminal decision is re-driven
    /// without consulting its content twice: repeated passes converge.
    #[tokio::test]
    async fn test_terminal_decision_redriven_idempotently() {
        let mut cluster = TestCluster::new(&[1, 2]);
        let coll = cluster
            .create_collection("test.kv", vec![(lower(), 1), (upper(), 2)])
            .await
            .unwrap();
        cluster.insert(coll, doc("apple")).await.unwrap();

        // Crash after the decision was recorded but before cleanup.
        cluster
            .authority
            .commit_ownership_change(coll, &lower(), 1, 2, ChunkVersion::new(1, 0))
            .await
            .unwrap();
        let mut committed = pending_doc(coll);
        committed.decision = MigrationDecision::Committed;
        cluster
            .entry(1)
            .recovery_store
            .insert(&committed)
            .await
            .unwrap();

        cluster.restart_node(1);
        let summary = cluster.node(1).recover_on_startup().await.unwrap();
        assert_eq!(summary.committed, 1);
        let summary = cluster.node(1).recover_on_startup().await.unwrap();
        assert_eq!(summary, Default::default());

        assert!(!cluster.node(1).ownership().lookup(coll, b"apple").owned);
        assert!(cluster.node(1).scheduler().has_overlapping(coll, &lower()));
        assert_eq!(cluster.node(1).scheduler().drain_ready().await.unwrap(), 1);
    }
}
