use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::agency::{Agency, WriteTransaction};
use crate::error::Result;
use crate::ids::JobIds;
use crate::jobs::{self, FailedServer};
use crate::paths::{self, ServerRole};
use crate::snapshot::Snapshot;

pub const HEALTH_STATUS_GOOD: &str = "GOOD";
pub const HEALTH_STATUS_BAD: &str = "BAD";
pub const HEALTH_STATUS_FAILED: &str = "FAILED";

/// Per-tick heartbeat evaluation of all planned DB servers and
/// coordinators.
///
/// Every server gets its health record refreshed on the transient tree
/// each tick; the record is persisted only when the status changed. The
/// BAD→FAILED transition of a DB server carries the FailedServer job
/// creation in the same persisted transaction.
pub struct HealthChecker<'a> {
    snapshot: &'a Snapshot,
    transient: &'a Snapshot,
    agent: &'a dyn Agency,
    prefix: &'a str,
    grace_period: Duration,
}

struct Evaluation {
    heartbeat_time: String,
    heartbeat_status: String,
    /// A new heartbeat arrived since the last evaluation.
    good: bool,
    beyond_grace: bool,
    last_acked: Option<String>,
    last_status: Option<String>,
    last_heartbeat_status: Option<String>,
}

impl<'a> HealthChecker<'a> {
    pub fn new(
        snapshot: &'a Snapshot,
        transient: &'a Snapshot,
        agent: &'a dyn Agency,
        prefix: &'a str,
        grace_period: Duration,
    ) -> Self {
        Self {
            snapshot,
            transient,
            agent,
            prefix,
            grace_period,
        }
    }

    pub async fn run(&self, job_ids: &mut JobIds) -> Result<()> {
        self.check_db_servers(job_ids).await?;
        self.check_coordinators().await?;
        Ok(())
    }

    fn evaluate(&self, server: &str) -> Evaluation {
        let sync_base = paths::join(paths::SYNC_SERVER_STATES, server);
        let health_base = paths::join(paths::HEALTH, server);
        let sync = self.transient.has(&sync_base);

        let heartbeat_time = self
            .transient
            .string_at(&paths::join(&sync_base, "time"))
            .unwrap_or_default()
            .to_string();
        let heartbeat_status = self
            .transient
            .string_at(&paths::join(&sync_base, "status"))
            .unwrap_or_default()
            .to_string();

        let field = |name: &str| {
            self.transient
                .string_at(&paths::join(&health_base, name))
                .map(str::to_string)
        };
        let last_sent = field("LastHeartbeatSent");
        let last_acked = field("LastHeartbeatAcked");
        let last_status = field("Status");
        let last_heartbeat_status = field("LastHeartbeatStatus");

        let good = sync && last_sent.as_deref() != Some(heartbeat_time.as_str());
        let beyond_grace = match last_acked.as_deref().and_then(jobs::parse_timestamp) {
            Some(acked) => Utc::now()
                .signed_duration_since(acked)
                .to_std()
                .map(|elapsed| elapsed > self.grace_period)
                .unwrap_or(false),
            None => true,
        };

        Evaluation {
            heartbeat_time,
            heartbeat_status,
            good,
            beyond_grace,
            last_acked,
            last_status,
            last_heartbeat_status,
        }
    }

    /// GOOD / BAD / FAILED for this tick. FAILED is sticky until a
    /// heartbeat arrives, and a failed server re-enters through BAD.
    fn next_status(eval: &Evaluation) -> &'static str {
        let was_failed = eval.last_status.as_deref() == Some(HEALTH_STATUS_FAILED);
        if eval.good {
            if was_failed {
                HEALTH_STATUS_BAD
            } else {
                HEALTH_STATUS_GOOD
            }
        } else if was_failed {
            HEALTH_STATUS_FAILED
        } else if eval.beyond_grace && eval.last_status.as_deref() == Some(HEALTH_STATUS_BAD) {
            HEALTH_STATUS_FAILED
        } else {
            HEALTH_STATUS_BAD
        }
    }

    fn record(&self, server: &str, role: ServerRole, eval: &Evaluation, status: &str) -> Value {
        let mut record = Map::new();
        record.insert(
            "LastHeartbeatSent".to_string(),
            json!(eval.heartbeat_time),
        );
        let acked = if eval.good {
            jobs::timestamp_now()
        } else {
            eval.last_acked.clone().unwrap_or_default()
        };
        record.insert("LastHeartbeatAcked".to_string(), json!(acked));
        record.insert(
            "LastHeartbeatStatus".to_string(),
            json!(eval.heartbeat_status),
        );
        record.insert("Status".to_string(), json!(status));
        record.insert("Role".to_string(), json!(role.as_str()));

        let short_name = self
            .snapshot
            .string_at(&paths::short_name(server))
            .unwrap_or("Unknown");
        record.insert("ShortName".to_string(), json!(short_name));

        let endpoint_path = format!(
            "{}/{}/endpoint",
            paths::CURRENT_SERVERS_REGISTERED,
            server
        );
        if let Some(endpoint) = self.snapshot.string_at(&endpoint_path) {
            record.insert("Endpoint".to_string(), json!(endpoint));
        }
        Value::Object(record)
    }

    async fn check_db_servers(&self, job_ids: &mut JobIds) -> Result<()> {
        let planned: Vec<String> = self
            .snapshot
            .children(paths::PLAN_DB_SERVERS)
            .map(|(name, _)| name.to_string())
            .collect();
        self.cleanup_stale_entries(ServerRole::DbServer, &planned)
            .await?;

        for server in &planned {
            let eval = self.evaluate(server);
            let status = Self::next_status(&eval);
            let record = self.record(server, ServerRole::DbServer, &eval, status);

            let mut persist = eval.last_heartbeat_status.as_deref()
                != Some(eval.heartbeat_status.as_str())
                || eval.last_status.as_deref() != Some(status);

            let health_path = paths::absolute(self.prefix, &paths::join(paths::HEALTH, server));
            let mut report = WriteTransaction::new().set(health_path, record);

            let failing = status == HEALTH_STATUS_FAILED
                && eval.last_status.as_deref() == Some(HEALTH_STATUS_BAD);
            if failing {
                tracing::warn!(server = %server, "DB server failed, creating failover job");
                persist = true;
                let job = FailedServer::new(job_ids.take(), "supervision", server.clone());
                let envelope = job.create_envelope(self.snapshot, self.prefix);
                report.ops.extend(envelope.ops);
                report.preconditions.extend(envelope.preconditions);
            } else if status == HEALTH_STATUS_BAD
                && eval.last_status.as_deref() != Some(HEALTH_STATUS_BAD)
            {
                tracing::warn!(server = %server, "DB server heartbeat is stale");
            }

            self.agent.transient(report.clone()).await?;
            if persist {
                let res = self.agent.transact(report).await?;
                if !res.applied() {
                    tracing::info!(server = %server, "Health status transaction rejected");
                    continue;
                }
            }

            // Back in business: retire the failover backlog.
            if eval.good
                && self
                    .snapshot
                    .has(&paths::join(paths::TARGET_FAILED_SERVERS, server))
            {
                let path = paths::absolute(
                    self.prefix,
                    &paths::join(paths::TARGET_FAILED_SERVERS, server),
                );
                self.agent
                    .single_write(WriteTransaction::new().delete(path))
                    .await?;
            }
        }
        Ok(())
    }

    async fn check_coordinators(&self) -> Result<()> {
        let planned: Vec<String> = self
            .snapshot
            .children(paths::PLAN_COORDINATORS)
            .map(|(name, _)| name.to_string())
            .collect();
        self.cleanup_stale_entries(ServerRole::Coordinator, &planned)
            .await?;

        let foxxmaster = self.snapshot.string_at(paths::FOXXMASTER).unwrap_or("");
        let mut foxxmaster_ok = false;
        let mut good_server: Option<String> = None;

        for server in &planned {
            let eval = self.evaluate(server);
            let status = Self::next_status(&eval);
            let record = self.record(server, ServerRole::Coordinator, &eval, status);

            if status == HEALTH_STATUS_GOOD {
                if good_server.is_none() {
                    good_server = Some(server.clone());
                }
                if server.as_str() == foxxmaster {
                    foxxmaster_ok = true;
                }
            }

            let persist = eval.last_heartbeat_status.as_deref()
                != Some(eval.heartbeat_status.as_str())
                || eval.last_status.as_deref() != Some(status);

            let health_path = paths::absolute(self.prefix, &paths::join(paths::HEALTH, server));
            let report = WriteTransaction::new().set(health_path, record);

            self.agent.transient(report.clone()).await?;
            if persist {
                self.agent.transact(report).await?;
            }
        }

        if !foxxmaster_ok {
            if let Some(server) = good_server {
                tracing::info!(server = %server, "Electing new foxxmaster");
                let tx = WriteTransaction::new()
                    .set(paths::absolute(self.prefix, paths::FOXXMASTER), json!(server));
                self.agent.single_write(tx).await?;
            }
        }
        Ok(())
    }

    /// Health entries for servers that left the plan are dropped, from
    /// both trees.
    async fn cleanup_stale_entries(&self, role: ServerRole, planned: &[String]) -> Result<()> {
        let mut stale: Vec<String> = self
            .snapshot
            .children(paths::HEALTH)
            .chain(self.transient.children(paths::HEALTH))
            .map(|(name, _)| name.to_string())
            .filter(|name| {
                ServerRole::from_id(name) == Some(role)
                    && !planned.iter().any(|p| p == name)
            })
            .collect();
        stale.sort();
        stale.dedup();
        if stale.is_empty() {
            return Ok(());
        }

        tracing::warn!(servers = ?stale, "Removing health records of unplanned servers");
        let mut tx = WriteTransaction::new();
        for server in &stale {
            tx = tx.delete(paths::absolute(self.prefix, &paths::join(paths::HEALTH, server)));
        }
        self.agent.transient(tx.clone()).await?;
        self.agent.single_write(tx).await?;
        Ok(())
    }
}
