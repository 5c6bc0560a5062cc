//! Heartbeat evaluation: status transitions, grace periods, failover job
//! creation, stale-record cleanup and foxxmaster election.


use std::time::Duration;

use harness::{timestamp, TestCluster};
use serde_json::json;

use cluster_supervisor::jobs::parse_timestamp;
use cluster_supervisor::SupervisionConfig;

#[tokio::test]
async fn test_fresh_heartbeat_reports_good() {
    let mut cluster = TestCluster::new().await;
    cluster.add_db_server("PRMR-1").await;

    cluster.tick().await;

    assert_eq!(cluster.health_status("PRMR-1").await.as_deref(), Some("GOOD"));
    assert!(cluster.jobs_of_type("ToDo", "failedServer").await.is_empty());

    // The acknowledgement moved to the tick time.
    let transient = cluster.transient_view().await;
    let acked = transient
        .string_at("/Supervision/Health/PRMR-1/LastHeartbeatAcked")
        .and_then(parse_timestamp)
        .expect("acked timestamp");
    assert!(chrono::Utc::now().signed_duration_since(acked).num_seconds() < 2);
}

#[tokio::test]
async fn test_stale_within_grace_stays_bad() {
    let mut cluster = TestCluster::new().await;
    cluster.add_db_server("PRMR-1").await;
    cluster.add_db_server("PRMR-2").await;
    cluster.set_bad("PRMR-2", -2).await;

    cluster.tick().await;

    assert_eq!(cluster.health_status("PRMR-2").await.as_deref(), Some("BAD"));
    assert!(cluster.jobs_of_type("ToDo", "failedServer").await.is_empty());
}

#[tokio::test]
async fn test_bad_beyond_grace_fails_and_creates_job() {
    let mut cluster = TestCluster::new().await;
    cluster.add_db_server("PRMR-1").await;
    cluster.add_db_server("PRMR-2").await;
    cluster.set_bad("PRMR-2", -6).await;

    cluster.tick().await;

    assert_eq!(
        cluster.health_status("PRMR-2").await.as_deref(),
        Some("FAILED")
    );
    let jobs = cluster.jobs_of_type("ToDo", "failedServer").await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(
        jobs[0].1.get("server").and_then(|v| v.as_str()),
        Some("PRMR-2")
    );
    // The failover backlog entry was materialized in the same
    // transaction.
    let snapshot = cluster.snapshot().await;
    assert_eq!(
        snapshot.array_at("/Target/FailedServers/PRMR-2").map(Vec::len),
        Some(0)
    );
}

#[tokio::test]
async fn test_heartbeat_recovery_clears_backlog() {
    let mut cluster = TestCluster::new().await;
    cluster.add_db_server("PRMR-1").await;
    cluster.add_db_server("PRMR-2").await;
    cluster.set_bad("PRMR-2", -3).await;
    cluster
        .seed("/Target/FailedServers/PRMR-2", json!(["s1", "s2"]))
        .await;

    // A new heartbeat arrives while the server is still marked BAD.
    cluster.set_good("PRMR-2").await;
    cluster.set_status("PRMR-2", "BAD").await;
    cluster.tick().await;

    assert_eq!(cluster.health_status("PRMR-2").await.as_deref(), Some("GOOD"));
    let snapshot = cluster.snapshot().await;
    assert!(!snapshot.has("/Target/FailedServers/PRMR-2"));
}

#[tokio::test]
async fn test_failed_is_sticky_and_reenters_through_bad() {
    let mut cluster = TestCluster::new().await;
    cluster.add_db_server("PRMR-1").await;
    cluster.add_db_server("PRMR-2").await;
    cluster.set_bad("PRMR-2", -6).await;

    cluster.tick().await;
    assert_eq!(
        cluster.health_status("PRMR-2").await.as_deref(),
        Some("FAILED")
    );

    // Still no heartbeat: FAILED sticks, no second failover job.
    cluster.tick().await;
    assert_eq!(
        cluster.health_status("PRMR-2").await.as_deref(),
        Some("FAILED")
    );
    let failovers = cluster.jobs_of_type("ToDo", "failedServer").await.len()
        + cluster.jobs_of_type("Pending", "failedServer").await.len();
    assert_eq!(failovers, 1);

    // Fresh heartbeat: the server re-enters through BAD, never straight
    // to GOOD.
    cluster.set_good("PRMR-2").await;
    cluster.set_status("PRMR-2", "FAILED").await;
    cluster.tick().await;
    assert_eq!(cluster.health_status("PRMR-2").await.as_deref(), Some("BAD"));

    cluster.set_good("PRMR-2").await;
    cluster.set_status("PRMR-2", "BAD").await;
    cluster.tick().await;
    assert_eq!(cluster.health_status("PRMR-2").await.as_deref(), Some("GOOD"));
}

#[tokio::test]
async fn test_zero_grace_fails_on_first_stale_tick() {
    let mut cluster = TestCluster::with_config(
        SupervisionConfig::new(harness::PREFIX)
            .with_grace_period(Duration::from_secs(0))
            .with_random_seed(42),
    )
    .await;
    cluster.add_db_server("PRMR-1").await;
    cluster.add_db_server("PRMR-2").await;
    cluster.set_bad("PRMR-2", -1).await;

    cluster.tick().await;

    assert_eq!(
        cluster.health_status("PRMR-2").await.as_deref(),
        Some("FAILED")
    );
}

#[tokio::test]
async fn test_unplanned_health_records_are_removed() {
    let mut cluster = TestCluster::new().await;
    cluster.add_db_server("PRMR-1").await;
    cluster
        .seed(
            "/Supervision/Health/PRMR-gone",
            json!({"Status": "GOOD", "Role": "DBServer"}),
        )
        .await;

    cluster.tick().await;

    let snapshot = cluster.snapshot().await;
    assert!(!snapshot.has("/Supervision/Health/PRMR-gone"));
    assert!(snapshot.has("/Supervision/Health/PRMR-1"));
}

#[tokio::test]
async fn test_coordinator_failure_creates_no_job() {
    let mut cluster = TestCluster::new().await;
    cluster.add_coordinator("CRDN-1").await;
    cluster.add_coordinator("CRDN-2").await;
    cluster.set_bad("CRDN-2", -6).await;

    cluster.tick().await;

    assert_eq!(
        cluster.health_status("CRDN-2").await.as_deref(),
        Some("FAILED")
    );
    assert!(cluster.jobs_of_type("ToDo", "failedServer").await.is_empty());
}

#[tokio::test]
async fn test_foxxmaster_reelected_when_not_good() {
    let mut cluster = TestCluster::new().await;
    cluster.add_coordinator("CRDN-1").await;
    cluster.add_coordinator("CRDN-2").await;
    cluster.seed("/Current/Foxxmaster", json!("CRDN-1")).await;
    cluster.set_bad("CRDN-1", -2).await;

    cluster.tick().await;

    let snapshot = cluster.snapshot().await;
    assert_eq!(snapshot.string_at("/Current/Foxxmaster"), Some("CRDN-2"));
}

#[tokio::test]
async fn test_foxxmaster_kept_while_good() {
    let mut cluster = TestCluster::new().await;
    cluster.add_coordinator("CRDN-1").await;
    cluster.add_coordinator("CRDN-2").await;
    cluster.seed("/Current/Foxxmaster", json!("CRDN-2")).await;

    cluster.tick().await;

    let snapshot = cluster.snapshot().await;
    assert_eq!(snapshot.string_at("/Current/Foxxmaster"), Some("CRDN-2"));
}

#[tokio::test]
async fn test_no_mutation_before_leadership_stabilizes() {
    let mut cluster = TestCluster::new().await;
    cluster.add_db_server("PRMR-1").await;
    cluster.add_db_server("PRMR-2").await;
    cluster.set_bad("PRMR-2", -6).await;

    // Fresh leadership: within the grace period no status mutation and
    // no job creation happens.
    cluster.agency.set_leading(false);
    cluster.agency.set_leading(true);
    cluster.tick().await;
    assert_eq!(cluster.health_status("PRMR-2").await.as_deref(), Some("BAD"));
    assert!(cluster.jobs_of_type("ToDo", "failedServer").await.is_empty());

    // Stabilized leadership proceeds.
    cluster
        .agency
        .backdate_leadership(chrono::Duration::seconds(60));
    cluster.tick().await;
    assert_eq!(
        cluster.health_status("PRMR-2").await.as_deref(),
        Some("FAILED")
    );
}

#[tokio::test]
async fn test_heartbeat_timestamps_parse() {
    assert!(parse_timestamp(&timestamp(0)).is_some());
    assert!(parse_timestamp("not a timestamp").is_none());
}
