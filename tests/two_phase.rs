//! Two-phase commit behaviour across shards under injected faults

mod common;

use common::{Cluster, Fault};
use segmentation_gateway::{Error, Percentage, Segment, SegmentPatch};

#[tokio::test]
async fn test_prepare_failure_on_any_shard_commits_nothing() {
    for failing in 0..4 {
        let cluster = Cluster::new(4);
        cluster.faulty[failing].inject(Fault::FailPrepare);

        let err = cluster
            .coordinator()
            .create_segment(Segment::new("S", "d"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShardPrepareFailed { .. }), "{err}");
        assert!(cluster.holders("S").is_empty(), "failing shard {failing}");
        assert_eq!(cluster.prepared_total(), 0);
    }
}

#[tokio::test]
async fn test_prepare_timeout_leaves_nothing_prepared() {
    let cluster = Cluster::new(3);
    cluster.faulty[1].inject(Fault::HangPrepare);

    let err = cluster
        .coordinator()
        .create_segment(Segment::new("S", "d"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShardUnavailable { shard: 1, .. }));
    assert!(cluster.holders("S").is_empty());
    assert_eq!(cluster.prepared_total(), 0);
}

#[tokio::test]
async fn test_prepare_landing_after_timeout_is_rolled_back() {
    let cluster = Cluster::new(3);
    cluster.faulty[2].inject(Fault::LatePrepare);

    let err = cluster
        .coordinator()
        .create_segment(Segment::new("S", "d"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShardUnavailable { shard: 2, .. }));
    assert_eq!(cluster.prepared_total(), 0);
    assert!(cluster.holders("S").is_empty());

    // The late transaction no longer blocks the same write.
    cluster.faulty[2].inject(Fault::None);
    cluster
        .coordinator()
        .create_segment(Segment::new("S", "d"))
        .await
        .unwrap();
    assert_eq!(cluster.holders("S"), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_duplicate_create_keeps_single_row() {
    let cluster = Cluster::new(3);
    let coordinator = cluster.coordinator();
    coordinator
        .create_segment(Segment::new("S", "first"))
        .await
        .unwrap();

    let err = coordinator
        .create_segment(Segment::new("S", "second"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SegmentAlreadyExists));
    assert_eq!(cluster.holders("S"), vec![0, 1, 2]);
    for shard in &cluster.memory {
        assert_eq!(shard.segment("S").unwrap().description, "first");
    }
}

#[tokio::test]
async fn test_delete_and_update_need_one_match() {
    let cluster = Cluster::new(3);
    let coordinator = cluster.coordinator();

    // No shard has it: nothing changes.
    assert!(matches!(
        coordinator.delete_segment("S").await,
        Err(Error::SegmentNotFound)
    ));
    assert!(matches!(
        coordinator
            .update_segment("S", SegmentPatch::description("x"))
            .await,
        Err(Error::SegmentNotFound)
    ));

    // Only shard 2 has it: both succeed.
    cluster.seed_segment(2, "S", "d1").await;
    coordinator
        .update_segment("S", SegmentPatch::description("d2"))
        .await
        .unwrap();
    assert_eq!(cluster.memory[2].segment("S").unwrap().description, "d2");

    coordinator.delete_segment("S").await.unwrap();
    assert!(cluster.holders("S").is_empty());
    assert_eq!(cluster.prepared_total(), 0);
}

#[tokio::test]
async fn test_commit_failure_reports_partial_write() {
    let cluster = Cluster::new(3);
    cluster.faulty[1].inject(Fault::FailCommit);

    let err = cluster
        .coordinator()
        .create_segment(Segment::new("S", "d"))
        .await
        .unwrap_err();

    match err {
        Error::ShardCommitFailed {
            failed, committed, ..
        } => {
            assert_eq!(failed, vec![1]);
            assert_eq!(committed, vec![0, 2]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(cluster.holders("S"), vec![0, 2]);
    // The failed shard's transaction is rolled back, not left dangling.
    assert_eq!(cluster.prepared_total(), 0);
}

#[tokio::test]
async fn test_commit_failure_is_internal_to_callers() {
    let cluster = Cluster::new(2);
    cluster.faulty[0].inject(Fault::FailCommit);
    let err = cluster
        .coordinator()
        .create_segment(Segment::new("S", "d"))
        .await
        .unwrap_err();
    assert!(!err.is_public());
    assert_eq!(err.public_message(), "internal server error");
}

#[tokio::test]
async fn test_distribute_failure_rolls_back_memberships() {
    let cluster = Cluster::new(3);
    cluster.seed_users(30).await;
    let coordinator = cluster.coordinator();
    coordinator
        .create_segment(Segment::new("S", "d"))
        .await
        .unwrap();

    cluster.faulty[2].inject(Fault::FailPrepare);
    let full = Percentage::new(100).unwrap();
    assert!(coordinator.distribute_segment("S", full).await.is_err());
    for shard in &cluster.memory {
        assert_eq!(shard.member_count("S"), 0);
    }

    cluster.faulty[2].inject(Fault::None);
    coordinator.distribute_segment("S", full).await.unwrap();
    for shard in &cluster.memory {
        assert_eq!(shard.member_count("S"), 10);
    }
}
