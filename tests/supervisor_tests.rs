//! Loop-level behaviors: schema migration and non-leader passivity.


use harness::TestCluster;
use serde_json::json;

#[tokio::test]
async fn test_legacy_failed_servers_layout_is_migrated() {
    let mut cluster = TestCluster::new().await;
    cluster
        .seed("/Target/FailedServers", json!(["PRMR-1", "PRMR-2"]))
        .await;

    cluster.tick().await;

    let snapshot = cluster.snapshot().await;
    assert_eq!(
        snapshot.array_at("/Target/FailedServers/PRMR-1").map(Vec::len),
        Some(0)
    );
    assert_eq!(
        snapshot.array_at("/Target/FailedServers/PRMR-2").map(Vec::len),
        Some(0)
    );

    // Re-running against the migrated layout changes nothing.
    let before = cluster.agency.commit_index();
    cluster.tick().await;
    assert_eq!(cluster.agency.commit_index(), before);
}

#[tokio::test]
async fn test_non_leader_never_writes() {
    let mut cluster = TestCluster::new().await;
    cluster.add_db_server("PRMR-1").await;
    cluster.add_db_server("PRMR-2").await;
    cluster.set_bad("PRMR-2", -6).await;
    cluster.agency.set_leading(false);

    let before = cluster.agency.commit_index();
    cluster.tick().await;
    cluster.tick().await;

    assert_eq!(cluster.agency.commit_index(), before);
    assert_eq!(cluster.health_status("PRMR-2").await.as_deref(), Some("BAD"));
    assert!(cluster.jobs_in("ToDo").await.is_empty());
}
