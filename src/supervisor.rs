use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::agency::{Agency, WriteTransaction};
use crate::config::SupervisionConfig;
use crate::error::Result;
use crate::health::{HealthChecker, HEALTH_STATUS_GOOD};
use crate::ids::JobIds;
use crate::jobs::{self, JobCtx};
use crate::paths;
use crate::reconcile;
use crate::snapshot::Snapshot;

const INIT_POLL: Duration = Duration::from_secs(5);

/// The supervision control loop.
///
/// Exactly one supervisor task runs per process; only the agency leader
/// mutates cluster state, everybody else spins reading. All decisions are
/// taken against the snapshot refreshed at the top of each tick.
pub struct Supervisor {
    agent: Arc<dyn Agency>,
    config: SupervisionConfig,
    snapshot: Snapshot,
    transient: Snapshot,
    job_ids: JobIds,
    self_shutdown: bool,
    stop: bool,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(agent: Arc<dyn Agency>, config: SupervisionConfig) -> Self {
        Self {
            agent,
            config,
            snapshot: Snapshot::default(),
            transient: Snapshot::default(),
            job_ids: JobIds::new(),
            self_shutdown: false,
            stop: false,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token observed by the loop; cancelled on `begin_shutdown` and when
    /// the cluster-wide shutdown completes.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether the loop has concluded a cluster-wide shutdown.
    pub fn stopped(&self) -> bool {
        self.stop
    }

    /// Run until shutdown. Errors never escape: a failed tick is logged
    /// and the next one starts fresh.
    pub async fn run(&mut self) {
        // The supervision makes no sense before somebody initialized the
        // agency tree.
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            match self.agent.read_tree(&self.config.agency_prefix).await {
                Ok(snapshot) if snapshot.children("/").count() > 0 => break,
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Agency read failed"),
            }
            tracing::debug!("Waiting for the agency to initialize its data");
            tokio::select! {
                _ = tokio::time::sleep(INIT_POLL) => {}
                _ = self.shutdown.cancelled() => return,
            }
        }

        loop {
            if let Err(e) = self.run_once().await {
                tracing::warn!(error = %e, "Supervision tick failed");
            }
            if self.stop {
                tracing::info!("Cluster shutdown complete, stopping supervision");
                self.shutdown.cancel();
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.frequency) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    /// One supervision tick: refresh the views, evaluate health, then
    /// reconcile and advance jobs. Public so tests can drive the loop
    /// deterministically.
    pub async fn run_once(&mut self) -> Result<()> {
        let leading = self.agent.leading();
        if leading && self.job_ids.exhausted() {
            self.job_ids
                .refill(self.agent.as_ref(), &self.config.agency_prefix)
                .await?;
        }

        self.update_views().await?;
        let mut rng = self.tick_rng();

        // No status mutation before leadership has been stable for a full
        // grace period.
        let stable = leading && self.leader_stable();
        if stable {
            self.upgrade_agency().await?;
            let ctx = JobCtx {
                snapshot: &self.snapshot,
                agent: self.agent.as_ref(),
                prefix: &self.config.agency_prefix,
            };
            reconcile::fix_prototype_chain(&ctx).await?;
            HealthChecker::new(
                &self.snapshot,
                &self.transient,
                self.agent.as_ref(),
                &self.config.agency_prefix,
                self.config.grace_period,
            )
            .run(&mut self.job_ids)
            .await?;
        }

        if self.is_shutting_down() {
            self.handle_shutdown().await?;
        } else if self.self_shutdown {
            self.stop = true;
        } else if stable {
            let ctx = JobCtx {
                snapshot: &self.snapshot,
                agent: self.agent.as_ref(),
                prefix: &self.config.agency_prefix,
            };
            reconcile::shrink_cluster(&ctx, &mut self.job_ids).await?;
            reconcile::enforce_replication(&ctx, &mut self.job_ids, &mut rng).await?;
            self.work_jobs(&mut rng).await?;
        }
        Ok(())
    }

    async fn update_views(&mut self) -> Result<()> {
        self.snapshot = self.agent.read_tree(&self.config.agency_prefix).await?;
        self.transient = self
            .agent
            .read_transient(&self.config.agency_prefix)
            .await?;
        Ok(())
    }

    fn leader_stable(&self) -> bool {
        Utc::now()
            .signed_duration_since(self.agent.leader_since())
            .to_std()
            .map(|elapsed| elapsed > self.config.grace_period)
            .unwrap_or(false)
    }

    fn tick_rng(&self) -> StdRng {
        match self.config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.snapshot.bool_at(paths::SHUTDOWN).unwrap_or(false)
    }

    /// Advance all queued jobs, then all in-progress ones.
    async fn work_jobs(&self, rng: &mut StdRng) -> Result<()> {
        let ctx = JobCtx {
            snapshot: &self.snapshot,
            agent: self.agent.as_ref(),
            prefix: &self.config.agency_prefix,
        };
        let todo: Vec<String> = self
            .snapshot
            .children(paths::TARGET_TODO)
            .map(|(name, _)| name.to_string())
            .collect();
        let pending: Vec<String> = self
            .snapshot
            .children(paths::TARGET_PENDING)
            .map(|(name, _)| name.to_string())
            .collect();

        for job_id in todo.iter().chain(pending.iter()) {
            if !self.agent.leading() {
                return Err(crate::error::SupervisionError::NotLeader);
            }
            if let Err(e) = jobs::run_job(&ctx, job_id, rng).await {
                tracing::warn!(job_id = %job_id, error = %e, "Job made no progress");
            }
        }
        Ok(())
    }

    /// Cluster-wide shutdown: wait for every registered server to stop
    /// reporting GOOD, then clear the shutdown marker.
    async fn handle_shutdown(&mut self) -> Result<()> {
        self.self_shutdown = true;
        tracing::debug!("Waiting for servers to shut down");

        let mut servers_cleared = true;
        for (server, _) in self.snapshot.children(paths::CURRENT_SERVERS_REGISTERED) {
            if server == "Version" {
                continue;
            }
            if self.snapshot.string_at(&paths::health_status(server)) == Some(HEALTH_STATUS_GOOD)
            {
                tracing::debug!(server, "Server has not shut down yet");
                servers_cleared = false;
            }
        }

        if servers_cleared && self.agent.leading() {
            let tx = WriteTransaction::new()
                .delete(paths::absolute(&self.config.agency_prefix, paths::SHUTDOWN));
            let res = self.agent.single_write(tx).await?;
            if !res.applied() {
                tracing::error!("Failed to remove the shutdown marker");
            }
        }
        Ok(())
    }

    /// Idempotent migration of a legacy `/Target/FailedServers` list into
    /// the server → shards layout.
    async fn upgrade_agency(&self) -> Result<()> {
        let Some(Value::Array(entries)) = self.snapshot.lookup(paths::TARGET_FAILED_SERVERS)
        else {
            return Ok(());
        };

        let mut migrated = Map::new();
        for entry in entries {
            if let Some(server) = entry.as_str() {
                migrated.insert(server.to_string(), json!([]));
            }
        }
        tracing::info!("Migrating legacy layout of /Target/FailedServers");
        let tx = WriteTransaction::new().set(
            paths::absolute(&self.config.agency_prefix, paths::TARGET_FAILED_SERVERS),
            Value::Object(migrated),
        );
        self.agent.single_write(tx).await?;
        Ok(())
    }
}
