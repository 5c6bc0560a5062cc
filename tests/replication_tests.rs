//! enforce_replication: closing the gap between planned replica counts
//! and the replication factor.


use harness::{assert_job_locations_unique, TestCluster, PREFIX};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};

use cluster_supervisor::ids::JobIds;
use cluster_supervisor::jobs::JobCtx;
use cluster_supervisor::reconcile;

#[tokio::test]
async fn test_under_replicated_shard_gets_one_add_follower() {
    let mut cluster = TestCluster::new().await;
    for id in ["PRMR-A", "PRMR-B", "PRMR-C"] {
        cluster.add_db_server(id).await;
    }
    cluster.add_collection("d", "c", 3, &[("s1", &["PRMR-A"])]).await;
    cluster.set_current("d", "c", "s1", &["PRMR-A"]).await;

    cluster.tick().await;

    // Exactly one job, one follower at a time, shard not blocked yet.
    let jobs = cluster.jobs_of_type("ToDo", "addFollower").await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].1.get("shard").and_then(Value::as_str), Some("s1"));
    let followers = jobs[0].1.get("newFollower").and_then(Value::as_array).unwrap();
    assert_eq!(followers.len(), 1);
    let snapshot = cluster.snapshot().await;
    assert!(!snapshot.has("/Supervision/Shards/s1"));
    let version_before = snapshot.uint_at("/Plan/Version").unwrap();

    // Next tick: the job starts, the plan grows by one follower, the
    // version is bumped once.
    cluster.tick().await;
    assert_eq!(cluster.jobs_of_type("Pending", "addFollower").await.len(), 1);
    let plan = cluster.plan_servers("d", "c", "s1").await;
    assert_eq!(plan.len(), 2);
    assert_eq!(plan[0], "PRMR-A");
    assert!(["PRMR-B", "PRMR-C"].contains(&plan[1].as_str()));
    let snapshot = cluster.snapshot().await;
    assert_eq!(snapshot.uint_at("/Plan/Version"), Some(version_before + 1));
    assert_eq!(snapshot.string_at("/Supervision/Shards/s1"), Some(jobs[0].0.as_str()));
    assert_job_locations_unique(&cluster).await;
}

#[tokio::test]
async fn test_replication_converges_to_factor() {
    let mut cluster = TestCluster::new().await;
    let servers = ["PRMR-A", "PRMR-B", "PRMR-C", "PRMR-D"];
    for id in servers {
        cluster.add_db_server(id).await;
    }
    cluster.add_collection("d", "c", 3, &[("s1", &["PRMR-A"])]).await;
    cluster.set_current("d", "c", "s1", &["PRMR-A"]).await;

    for _ in 0..12 {
        cluster.tick().await;
        cluster.sync_current_to_plan().await;
        cluster.keep_alive(&servers).await;
        if cluster.plan_servers("d", "c", "s1").await.len() == 3
            && cluster.jobs_in("Pending").await.is_empty()
        {
            break;
        }
    }

    let plan = cluster.plan_servers("d", "c", "s1").await;
    assert_eq!(plan.len(), 3);
    assert_job_locations_unique(&cluster).await;
}

#[tokio::test]
async fn test_over_replicated_shard_gets_remove_follower() {
    let mut cluster = TestCluster::new().await;
    for id in ["PRMR-A", "PRMR-B", "PRMR-C"] {
        cluster.add_db_server(id).await;
    }
    cluster
        .add_collection("d", "c", 2, &[("s1", &["PRMR-A", "PRMR-B", "PRMR-C"])])
        .await;
    cluster
        .set_current("d", "c", "s1", &["PRMR-A", "PRMR-B", "PRMR-C"])
        .await;

    cluster.tick().await;
    let jobs = cluster.jobs_of_type("ToDo", "removeFollower").await;
    assert_eq!(jobs.len(), 1);
    // All followers are in sync, so the last planned one is picked.
    assert_eq!(jobs[0].1.get("server").and_then(Value::as_str), Some("PRMR-C"));

    cluster.tick().await;
    assert_eq!(
        cluster.plan_servers("d", "c", "s1").await,
        vec!["PRMR-A", "PRMR-B"]
    );
}

#[tokio::test]
async fn test_remove_follower_prefers_out_of_sync_replica() {
    let mut cluster = TestCluster::new().await;
    for id in ["PRMR-A", "PRMR-B", "PRMR-C"] {
        cluster.add_db_server(id).await;
    }
    cluster
        .add_collection("d", "c", 2, &[("s1", &["PRMR-A", "PRMR-B", "PRMR-C"])])
        .await;
    // PRMR-B never caught up.
    cluster.set_current("d", "c", "s1", &["PRMR-A", "PRMR-C"]).await;

    cluster.tick().await;
    let jobs = cluster.jobs_of_type("ToDo", "removeFollower").await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].1.get("server").and_then(Value::as_str), Some("PRMR-B"));
}

#[tokio::test]
async fn test_satellite_collection_replicates_everywhere() {
    let mut cluster = TestCluster::new().await;
    let servers = ["PRMR-A", "PRMR-B", "PRMR-C"];
    for id in servers {
        cluster.add_db_server(id).await;
    }
    // replicationFactor 0 means one replica per available server.
    cluster.add_collection("d", "sat", 0, &[("s1", &["PRMR-A"])]).await;
    cluster.set_current("d", "sat", "s1", &["PRMR-A"]).await;

    for _ in 0..12 {
        cluster.tick().await;
        cluster.sync_current_to_plan().await;
        cluster.keep_alive(&servers).await;
        if cluster.plan_servers("d", "sat", "s1").await.len() == 3 {
            break;
        }
    }
    assert_eq!(cluster.plan_servers("d", "sat", "s1").await.len(), 3);
}

#[tokio::test]
async fn test_blocked_shard_is_left_alone() {
    let mut cluster = TestCluster::new().await;
    for id in ["PRMR-A", "PRMR-B", "PRMR-C"] {
        cluster.add_db_server(id).await;
    }
    cluster.add_collection("d", "c", 3, &[("s1", &["PRMR-A"])]).await;
    cluster.seed("/Supervision/Shards/s1", json!("999")).await;

    cluster.tick().await;

    assert!(cluster.jobs_of_type("ToDo", "addFollower").await.is_empty());
}

#[tokio::test]
async fn test_clone_collections_are_not_reconciled_directly() {
    let mut cluster = TestCluster::new().await;
    for id in ["PRMR-A", "PRMR-B", "PRMR-C"] {
        cluster.add_db_server(id).await;
    }
    cluster
        .seed(
            "/Plan/Collections/d/shadow",
            json!({
                "replicationFactor": 3,
                "distributeShardsLike": "proto",
                "shards": {"s2": ["PRMR-A"]},
            }),
        )
        .await;
    cluster
        .add_collection("d", "proto", 1, &[("s1", &["PRMR-A"])])
        .await;

    cluster.tick().await;

    // The clone is under-replicated on paper, but only its prototype may
    // drive replication changes.
    assert!(cluster.jobs_of_type("ToDo", "addFollower").await.is_empty());
}

#[tokio::test]
async fn test_enforce_replication_is_idempotent() {
    let cluster = TestCluster::new().await;
    for id in ["PRMR-A", "PRMR-B", "PRMR-C"] {
        cluster.add_db_server(id).await;
    }
    cluster.add_collection("d", "c", 3, &[("s1", &["PRMR-A"])]).await;

    let mut job_ids = JobIds::new();
    job_ids.refill(&*cluster.agency, PREFIX).await.unwrap();
    let mut rng = StdRng::seed_from_u64(7);

    let snapshot = cluster.snapshot().await;
    let ctx = JobCtx {
        snapshot: &snapshot,
        agent: &*cluster.agency,
        prefix: PREFIX,
    };
    reconcile::enforce_replication(&ctx, &mut job_ids, &mut rng)
        .await
        .unwrap();
    assert_eq!(cluster.jobs_of_type("ToDo", "addFollower").await.len(), 1);

    // Second pass over a fresh snapshot with no intervening world
    // change: no new job.
    let snapshot = cluster.snapshot().await;
    let ctx = JobCtx {
        snapshot: &snapshot,
        agent: &*cluster.agency,
        prefix: PREFIX,
    };
    reconcile::enforce_replication(&ctx, &mut job_ids, &mut rng)
        .await
        .unwrap();
    assert_eq!(cluster.jobs_of_type("ToDo", "addFollower").await.len(), 1);
}
