//! End-to-end segmentation flows through the service layer

mod common;

use common::{Cluster, FailingCache};
use segmentation_gateway::{ErrorKind, Segment, SegmentPatch};
use std::sync::Arc;

#[tokio::test]
async fn test_segment_lifecycle() {
    let cluster = Cluster::new(3);
    cluster.seed_users(12).await;
    let (state, _) = cluster.state();
    let svc = &state.segmentation;

    svc.create_segment(Segment::new("S", "d1")).await.unwrap();
    svc.update_segment("S", SegmentPatch::description("d2"))
        .await
        .unwrap();

    let info = svc.get_segment_info("S").await.unwrap();
    assert_eq!(info.description, "d2");
    assert_eq!(info.users_num, 0);

    svc.distribute_segment("S", 100).await.unwrap();
    let segments = svc.get_user_segments(5).await.unwrap();
    assert!(segments.contains(&Segment::new("S", "d2")));
    assert_eq!(svc.get_segment_info("S").await.unwrap().users_num, 12);

    svc.delete_segment("S").await.unwrap();
    let err = svc.get_segment_info("S").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::SegmentNotFound);
    assert!(svc.get_user_segments(5).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_distribution_respects_target_count() {
    let cluster = Cluster::new(1);
    cluster.seed_users(1000).await;
    let (state, _) = cluster.state();
    let svc = &state.segmentation;

    svc.create_segment(Segment::new("S", "d")).await.unwrap();
    svc.distribute_segment("S", 10).await.unwrap();
    let members = cluster.memory[0].member_count("S");
    assert!(members <= 100, "inserted {members} rows");
    assert!(members > 0);
}

#[tokio::test]
async fn test_repeat_distribution_over_covered_population() {
    let cluster = Cluster::new(2);
    cluster.seed_users(50).await;
    let (state, _) = cluster.state();
    let svc = &state.segmentation;

    svc.create_segment(Segment::new("S", "d")).await.unwrap();
    svc.distribute_segment("S", 100).await.unwrap();

    let err = svc.distribute_segment("S", 100).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::SegmentDistributed);
    assert_eq!(svc.get_segment_info("S").await.unwrap().users_num, 50);
}

#[tokio::test]
async fn test_write_invalidates_cached_segments() {
    let cluster = Cluster::new(2);
    cluster.seed_users(4).await;
    let (state, cache) = cluster.state();
    let svc = &state.segmentation;

    svc.create_segment(Segment::new("S", "d")).await.unwrap();
    assert!(svc.get_user_segments(3).await.unwrap().is_empty());
    assert_eq!(cache.get(3).await.unwrap(), Some(Vec::new()));

    svc.distribute_segment("S", 100).await.unwrap();
    assert_eq!(cache.get(3).await.unwrap(), None);
    assert_eq!(
        svc.get_user_segments(3).await.unwrap(),
        vec![Segment::new("S", "d")]
    );
}

#[tokio::test]
async fn test_cached_entry_short_circuits_shard_read() {
    let cluster = Cluster::new(2);
    let (state, cache) = cluster.state();

    // User 9 does not exist on any shard, but the cache says otherwise.
    let generation = cache.generation().await.unwrap();
    cache
        .set(9, &[Segment::new("C", "cached")], generation)
        .await
        .unwrap();
    let segments = state.segmentation.get_user_segments(9).await.unwrap();
    assert_eq!(segments, vec![Segment::new("C", "cached")]);
}

#[tokio::test]
async fn test_user_delete_flushes_cache() {
    let cluster = Cluster::new(2);
    cluster.seed_users(2).await;
    let (state, cache) = cluster.state();

    state.segmentation.get_user_segments(0).await.unwrap();
    state.segmentation.get_user_segments(1).await.unwrap();
    state.users.delete_user(1).await.unwrap();

    assert_eq!(cache.get(0).await.unwrap(), None);
    let err = state.segmentation.get_user_segments(1).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::UserNotFound);
}

#[tokio::test]
async fn test_read_racing_a_write_is_not_cached() {
    let cluster = Cluster::new(2);
    cluster.seed_users(4).await;
    let (state, cache) = cluster.state();
    let svc = state.segmentation.clone();
    svc.create_segment(Segment::new("S", "d")).await.unwrap();

    // User 1 lives on shard 1. Park its read after it has loaded the
    // pre-write list, then let a write commit and flush.
    let gate = cluster.faulty[1].gate_next_read();
    let reader = tokio::spawn({
        let svc = svc.clone();
        async move { svc.get_user_segments(1).await }
    });
    gate.reached.notified().await;
    svc.distribute_segment("S", 100).await.unwrap();
    gate.release.notify_one();

    assert!(reader.await.unwrap().unwrap().is_empty());
    assert_eq!(cache.get(1).await.unwrap(), None);
    assert_eq!(
        svc.get_user_segments(1).await.unwrap(),
        vec![Segment::new("S", "d")]
    );
}

#[tokio::test]
async fn test_segment_writes_survive_cache_failure() {
    let cluster = Cluster::new(2);
    cluster.seed_users(6).await;
    let state = cluster.state_with_cache(Arc::new(FailingCache));
    let svc = &state.segmentation;

    svc.create_segment(Segment::new("S", "d")).await.unwrap();
    assert_eq!(cluster.holders("S"), vec![0, 1]);

    svc.distribute_segment("S", 100).await.unwrap();
    assert_eq!(cluster.memory[0].member_count("S"), 3);
    assert_eq!(cluster.memory[1].member_count("S"), 3);

    svc.update_segment("S", SegmentPatch::description("d2"))
        .await
        .unwrap();
    assert_eq!(cluster.memory[1].segment("S").unwrap().description, "d2");
}

#[tokio::test]
async fn test_cache_read_failure_falls_through_to_shard() {
    let cluster = Cluster::new(2);
    cluster.seed_users(2).await;
    let state = cluster.state_with_cache(Arc::new(FailingCache));
    let svc = &state.segmentation;

    svc.create_segment(Segment::new("S", "d")).await.unwrap();
    svc.distribute_segment("S", 100).await.unwrap();
    assert_eq!(
        svc.get_user_segments(1).await.unwrap(),
        vec![Segment::new("S", "d")]
    );
    let err = svc.get_user_segments(7).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::UserNotFound);
}

#[tokio::test]
async fn test_user_delete_surfaces_cache_failure() {
    let cluster = Cluster::new(2);
    cluster.seed_users(2).await;
    let state = cluster.state_with_cache(Arc::new(FailingCache));

    let err = state.users.delete_user(1).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Internal);
    assert_eq!(err.message, "internal server error");
    // The delete itself has already been applied.
    assert_eq!(cluster.memory[1].user_count(), 0);
    let err = state.users.delete_user(1).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::UserNotFound);
}
