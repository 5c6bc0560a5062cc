//! fix_prototype_chain: flattening transitive distributeShardsLike
//! chains.


use harness::{TestCluster, PREFIX};
use serde_json::json;

use cluster_supervisor::jobs::JobCtx;
use cluster_supervisor::reconcile;

async fn seed_chain(cluster: &TestCluster) {
    cluster.add_collection("d", "root", 2, &[("s1", &["PRMR-1", "PRMR-2"])]).await;
    cluster
        .seed(
            "/Plan/Collections/d/mid",
            json!({
                "replicationFactor": 2,
                "distributeShardsLike": "root",
                "shards": {"s2": ["PRMR-1", "PRMR-2"]},
            }),
        )
        .await;
    cluster
        .seed(
            "/Plan/Collections/d/leaf",
            json!({
                "replicationFactor": 2,
                "distributeShardsLike": "mid",
                "shards": {"s3": ["PRMR-1", "PRMR-2"]},
            }),
        )
        .await;
}

#[tokio::test]
async fn test_chain_is_flattened_to_root() {
    let mut cluster = TestCluster::new().await;
    seed_chain(&cluster).await;

    cluster.tick().await;

    let snapshot = cluster.snapshot().await;
    assert_eq!(
        snapshot.string_at("/Plan/Collections/d/leaf/distributeShardsLike"),
        Some("root")
    );
    assert_eq!(
        snapshot.string_at("/Plan/Collections/d/mid/distributeShardsLike"),
        Some("root")
    );
    assert!(!snapshot.has("/Plan/Collections/d/root/distributeShardsLike"));
}

#[tokio::test]
async fn test_rerun_after_resolution_is_a_noop() {
    let cluster = TestCluster::new().await;
    seed_chain(&cluster).await;

    let snapshot = cluster.snapshot().await;
    let ctx = JobCtx {
        snapshot: &snapshot,
        agent: &*cluster.agency,
        prefix: PREFIX,
    };
    reconcile::fix_prototype_chain(&ctx).await.unwrap();
    let after_first = cluster.agency.commit_index();

    let snapshot = cluster.snapshot().await;
    let ctx = JobCtx {
        snapshot: &snapshot,
        agent: &*cluster.agency,
        prefix: PREFIX,
    };
    reconcile::fix_prototype_chain(&ctx).await.unwrap();
    assert_eq!(cluster.agency.commit_index(), after_first);
}
