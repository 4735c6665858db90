//! Delivery through the queue: per-shard order, fan-out to replicas,
//! shard isolation, dead-lettering and restart recovery.

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use common::*;
use falcon_common::config::ClusterConfig;
use falcon_common::error::FalconError;
use falcon_common::types::{NodeAddr, ReplicaNum, ShardNum, ShardTarget};
use falcon_distributed::{QueueHealth, SenderStatus};
use tempfile::TempDir;

fn target(cluster: &str, shard: u32, replica: u32) -> ShardTarget {
    ShardTarget::new(cluster, ShardNum(shard), ReplicaNum(replica))
}

fn node(last_octet: u8) -> NodeAddr {
    NodeAddr::new(format!("127.0.0.{}", last_octet), 9000)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_per_shard_order_matches_enqueue_order() {
    let tmp = TempDir::new().unwrap();
    let mut config = two_shard_config(&tmp);
    config.clusters.push(ClusterConfig {
        name: "remote_only".into(),
        shards: vec![shard(vec![remote_node()], false)],
    });
    let (service, exec) = start_service(config);
    let table = dist_table();
    service.create_table(table_spec("remote_only")).unwrap();

    service.stop_sends(Some(&table)).unwrap();
    for chunk in 0..20i64 {
        service
            .insert(&table, int_rows(chunk * 10..chunk * 10 + 10))
            .await
            .unwrap();
    }
    let pending = service.pending_batches(&table, &target("remote_only", 1, 1)).unwrap();
    assert_eq!(pending.len(), 20);
    assert!(pending.windows(2).all(|w| w[0].seq < w[1].seq));

    service.start_sends(Some(&table)).unwrap();
    assert!(
        eventually(Duration::from_secs(10), || {
            exec.row_count(&remote_node(), &dest_table()) == 200
        })
        .await
    );
    assert_eq!(
        keys(&exec.rows(&remote_node(), &dest_table())),
        (0..200).collect::<Vec<_>>()
    );
    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replica_fan_out() {
    let tmp = TempDir::new().unwrap();
    let mut config = two_shard_config(&tmp);
    config.distributed.send_enabled_by_default = false;
    config.clusters.push(ClusterConfig {
        name: "replicated".into(),
        shards: vec![
            // Local shard with a remote peer: local execute plus one queued copy.
            shard(vec![local_node(), node(3)], false),
            // Remote shard, per-replica delivery.
            shard(vec![node(4), node(5)], false),
            // Remote shard replicating internally: first replica only.
            shard(vec![node(6), node(7)], true),
        ],
    });
    let (service, exec) = start_service(config);
    let table = dist_table();
    service.create_table(table_spec("replicated")).unwrap();

    // Keys 0, 1, 2 hit shards 1, 2, 3.
    let summary = service.insert(&table, int_rows(0..3)).await.unwrap();
    assert_eq!(summary.local_rows, 1);
    assert_eq!(summary.queued_rows, 4);
    assert_eq!(
        service.list_shard_directories(&table).unwrap(),
        BTreeSet::from([
            target("replicated", 1, 2),
            target("replicated", 2, 1),
            target("replicated", 2, 2),
            target("replicated", 3, 1),
        ])
    );

    service.flush(Some(&table), Duration::from_secs(10)).await.unwrap();
    assert_eq!(keys(&exec.rows(&local_node(), &dest_table())), vec![0]);
    assert_eq!(keys(&exec.rows(&node(3), &dest_table())), vec![0]);
    assert_eq!(keys(&exec.rows(&node(4), &dest_table())), vec![1]);
    assert_eq!(keys(&exec.rows(&node(5), &dest_table())), vec![1]);
    assert_eq!(keys(&exec.rows(&node(6), &dest_table())), vec![2]);
    assert_eq!(exec.row_count(&node(7), &dest_table()), 0);
    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_local_replica_queued_without_prefer_localhost() {
    let tmp = TempDir::new().unwrap();
    let mut config = two_shard_config(&tmp);
    config.distributed.prefer_localhost_replica = false;
    config.distributed.send_enabled_by_default = false;
    let (service, exec) = start_service(config);
    let table = dist_table();
    service.create_table(table_spec(CLUSTER)).unwrap();

    let summary = service.insert(&table, int_rows(0..10)).await.unwrap();
    assert_eq!(summary.local_rows, 0);
    assert_eq!(summary.queued_rows, 10);
    assert_eq!(service.list_shard_directories(&table).unwrap().len(), 2);
    assert_eq!(exec.total_rows(&dest_table()), 0);

    service.flush(None, Duration::from_secs(10)).await.unwrap();
    assert_eq!(exec.row_count(&local_node(), &dest_table()), 5);
    assert_eq!(exec.row_count(&remote_node(), &dest_table()), 5);
    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_shard_does_not_stall_others() {
    let tmp = TempDir::new().unwrap();
    let mut config = two_shard_config(&tmp);
    config.distributed.alert_after_failures = 3;
    config.clusters.push(ClusterConfig {
        name: "three_remote".into(),
        shards: vec![
            shard(vec![node(3)], false),
            shard(vec![node(4)], false),
            shard(vec![node(5)], false),
        ],
    });
    let (service, exec) = start_service(config);
    let table = dist_table();
    service.create_table(table_spec("three_remote")).unwrap();
    exec.set_unreachable(&node(4), true);

    service.insert(&table, int_rows(0..30)).await.unwrap();
    assert!(
        eventually(Duration::from_secs(5), || {
            exec.row_count(&node(3), &dest_table()) == 10
                && exec.row_count(&node(5), &dest_table()) == 10
        })
        .await
    );

    let failing = target("three_remote", 2, 1);
    assert!(
        eventually(Duration::from_secs(5), || {
            service.sender_states(&table).unwrap()[&failing].alerting
        })
        .await
    );
    assert_eq!(service.pending_batches(&table, &failing).unwrap().len(), 1);
    assert!(
        eventually(Duration::from_secs(5), || service.health() == QueueHealth::Alerting).await
    );

    match service.flush(Some(&table), Duration::from_millis(200)).await {
        Err(FalconError::FlushTimeout { pending, .. }) => assert_eq!(pending, 1),
        other => panic!("expected FlushTimeout, got {:?}", other),
    }

    exec.set_unreachable(&node(4), false);
    service.flush(Some(&table), Duration::from_secs(10)).await.unwrap();
    assert_eq!(exec.row_count(&node(4), &dest_table()), 10);
    let state = &service.sender_states(&table).unwrap()[&failing];
    assert_eq!(state.consecutive_failures, 0);
    assert!(!state.alerting);
    assert!(
        eventually(Duration::from_secs(5), || service.health() == QueueHealth::Healthy).await
    );
    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhausted_batch_moves_to_broken() {
    let tmp = TempDir::new().unwrap();
    let mut config = two_shard_config(&tmp);
    config.distributed.max_send_attempts = 3;
    let (service, exec) = start_service(config);
    let table = dist_table();
    service.create_table(table_spec(CLUSTER)).unwrap();
    let shard2 = target(CLUSTER, 2, 1);

    exec.fail_next(&remote_node(), 3);
    service.insert(&table, int_rows(0..2)).await.unwrap();
    service.insert(&table, int_rows(2..4)).await.unwrap();
    service.flush(Some(&table), Duration::from_secs(10)).await.unwrap();

    // The first batch was dead-lettered, the second went through.
    assert_eq!(keys(&exec.rows(&remote_node(), &dest_table())), vec![3]);
    let state = &service.sender_states(&table).unwrap()[&shard2];
    assert_eq!(state.batches_quarantined, 1);
    assert_eq!(state.batches_sent, 1);
    let broken = tmp.path().join("test/dist_foo/shard2_replica1/broken");
    assert_eq!(std::fs::read_dir(&broken).unwrap().count(), 1);

    // A directory holding quarantined batches is never reclaimed.
    let reports = service.run_cleanup_once();
    assert_eq!(reports[0].1.kept_broken, 1);
    assert!(service.list_shard_directories(&table).unwrap().contains(&shard2));
    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_resumes_pending_batches() {
    let tmp = TempDir::new().unwrap();
    let table = dist_table();
    let shard2 = target(CLUSTER, 2, 1);
    {
        let mut config = two_shard_config(&tmp);
        config.distributed.send_enabled_by_default = false;
        let (service, exec) = start_service(config);
        service.create_table(table_spec(CLUSTER)).unwrap();
        service.insert(&table, int_rows(0..20)).await.unwrap();
        service.insert(&table, int_rows(20..40)).await.unwrap();
        assert_eq!(exec.row_count(&remote_node(), &dest_table()), 0);
        service.shutdown().await;
    }

    let (service, exec) = start_service(two_shard_config(&tmp));
    let reopened = service.create_table(table_spec(CLUSTER)).unwrap();
    assert_eq!(reopened.sender_state(&shard2).map(|s| s.status), Some(SenderStatus::Running));
    service.flush(Some(&table), Duration::from_secs(10)).await.unwrap();
    assert_eq!(
        keys(&exec.rows(&remote_node(), &dest_table())),
        (0..40).filter(|k| k % 2 == 1).collect::<Vec<_>>()
    );

    // New batches continue the sequence.
    service.stop_sends(None).unwrap();
    let summary = service.insert(&table, int_rows(40..42)).await.unwrap();
    assert_eq!(summary.batches[0].seq, 3);
    service.shutdown().await;
}

#[tokio::test]
async fn test_sync_insert_bypasses_queue() {
    let tmp = TempDir::new().unwrap();
    let mut config = two_shard_config(&tmp);
    config.distributed.insert_distributed_sync = true;
    config.distributed.sync_insert_timeout_ms = 50;
    let (service, exec) = start_service(config);
    let table = dist_table();
    service.create_table(table_spec(CLUSTER)).unwrap();

    let summary = service.insert(&table, int_rows(0..10)).await.unwrap();
    assert_eq!(summary.sent_rows, 5);
    assert_eq!(exec.total_rows(&dest_table()), 10);
    assert!(service.list_shard_directories(&table).unwrap().is_empty());

    exec.set_delay(&remote_node(), Duration::from_millis(500));
    let err = service.insert(&table, int_rows(1..2)).await.unwrap_err();
    assert!(err.is_transient());
    assert!(err.to_string().contains("timed out"));
    service.shutdown().await;
}
