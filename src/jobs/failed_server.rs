use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::json;

use crate::agency::{Precondition, WriteTransaction};
use crate::error::Result;
use crate::health::{HEALTH_STATUS_BAD, HEALTH_STATUS_FAILED, HEALTH_STATUS_GOOD};
use crate::jobs::{
    self, abortable, available_servers, child_job_ids, pending_entry, Blocker, FailedFollower,
    FailedLeader, JobCtx, JobKind, UnassumedLeadership,
};
use crate::paths;
use crate::snapshot::Snapshot;

/// Failover umbrella for a failed DB server: one child job per hosted
/// shard. Created inside the same transaction as the BAD→FAILED health
/// transition.
#[derive(Debug, Clone)]
pub struct FailedServer {
    pub job_id: String,
    pub creator: String,
    pub server: String,
}

impl FailedServer {
    pub fn new(
        job_id: impl Into<String>,
        creator: impl Into<String>,
        server: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            creator: creator.into(),
            server: server.into(),
        }
    }

    pub(crate) fn from_agency(snapshot: &Snapshot, base: &str, job_id: &str) -> Result<Self> {
        Ok(Self {
            job_id: job_id.to_string(),
            creator: jobs::job_field(snapshot, base, job_id, "creator")?.to_string(),
            server: jobs::job_field(snapshot, base, job_id, "server")?.to_string(),
        })
    }

    /// The creation ops and preconditions, for merging into the health
    /// checker's status transaction: the ToDo entry plus the (empty)
    /// failover backlog, guarded by the server still being BAD and the
    /// backlog being unchanged since the snapshot.
    pub fn create_envelope(&self, snapshot: &Snapshot, prefix: &str) -> WriteTransaction {
        let todo_path = paths::join(paths::TARGET_TODO, &self.job_id);
        let backlog = paths::join(paths::TARGET_FAILED_SERVERS, &self.server);
        let entry = json!({
            "jobId": self.job_id,
            "type": "failedServer",
            "creator": self.creator,
            "timeCreated": jobs::timestamp_now(),
            "server": self.server,
        });

        let mut tx = WriteTransaction::new()
            .set(paths::absolute(prefix, &todo_path), entry)
            .set(paths::absolute(prefix, &backlog), json!([]))
            .require_old(
                paths::absolute(prefix, &paths::health_status(&self.server)),
                json!(HEALTH_STATUS_BAD),
            )
            .require_empty(paths::absolute(prefix, &todo_path));
        let backlog_root = paths::absolute(prefix, paths::TARGET_FAILED_SERVERS);
        match snapshot.lookup(paths::TARGET_FAILED_SERVERS) {
            Some(value) => {
                tx.preconditions
                    .push((backlog_root, Precondition::Old(value.clone())));
            }
            None => {
                tx.preconditions.push((backlog_root, Precondition::OldEmpty));
            }
        }
        tx
    }

    /// Stand-alone creation, for operator use; the supervisor itself
    /// always creates this job through the health checker's envelope.
    pub async fn create(&self, ctx: &JobCtx<'_>) -> Result<bool> {
        tracing::info!(job_id = %self.job_id, server = %self.server, "Todo: handle server failover");
        let res = ctx
            .agent
            .transact(self.create_envelope(ctx.snapshot, ctx.prefix))
            .await?;
        if !res.applied() {
            tracing::info!(job_id = %self.job_id, "Failed to insert job");
        }
        Ok(res.applied())
    }

    /// Block the server, move ToDo→Pending and expand one child per
    /// hosted shard.
    pub async fn start(&self, ctx: &JobCtx<'_>, rng: &mut StdRng) -> Result<bool> {
        let status = ctx.snapshot.string_at(&paths::health_status(&self.server));
        if status != Some(HEALTH_STATUS_FAILED) {
            tracing::info!(
                job_id = %self.job_id,
                server = %self.server,
                "Server is no longer failed, not starting failover"
            );
            jobs::finish(
                ctx,
                &self.job_id,
                None,
                false,
                Some("server is no longer failed"),
                Vec::new(),
            )
            .await?;
            return Ok(false);
        }

        // A job already holding the server yields only if it is abortable.
        let blocked = paths::join(paths::BLOCKED_SERVERS, &self.server);
        if let Some(holder) = ctx.snapshot.string_at(&blocked) {
            if !abortable(ctx.snapshot, holder) {
                return Ok(false);
            }
            if let Some(location) = jobs::locate(ctx.snapshot, holder) {
                let job = JobKind::from_agency(ctx.snapshot, location, holder)?;
                job.abort(ctx).await?;
            }
            return Ok(false);
        }

        let Some(pending) = pending_entry(ctx.snapshot, &self.job_id) else {
            tracing::info!(job_id = %self.job_id, "ToDo entry not in snapshot yet");
            return Ok(false);
        };

        let tx = WriteTransaction::new()
            .set(ctx.abs(&paths::join(paths::TARGET_PENDING, &self.job_id)), pending)
            .delete(ctx.abs(&paths::join(paths::TARGET_TODO, &self.job_id)))
            .set(ctx.abs(&blocked), json!(self.job_id))
            .require_empty(ctx.abs(&blocked));
        let res = ctx.agent.transact(tx).await?;
        if !res.applied() {
            tracing::info!(job_id = %self.job_id, "Start precondition failed");
            return Ok(false);
        }
        tracing::debug!(job_id = %self.job_id, server = %self.server, "Pending: server failover");

        self.expand_children(ctx, rng).await?;
        Ok(true)
    }

    /// One child per shard the failed server hosts. Clone collections are
    /// skipped; the prototype's child fans out over the whole group.
    async fn expand_children(&self, ctx: &JobCtx<'_>, rng: &mut StdRng) -> Result<()> {
        let available = available_servers(ctx.snapshot);
        let mut sub = 0;

        let databases: Vec<String> = ctx
            .snapshot
            .children(paths::PLAN_COLLECTIONS)
            .map(|(name, _)| name.to_string())
            .collect();

        for database in &databases {
            let db_path = paths::join(paths::PLAN_COLLECTIONS, database);
            let collections: Vec<String> = ctx
                .snapshot
                .children(&db_path)
                .map(|(name, _)| name.to_string())
                .collect();

            for collection in &collections {
                let col_path = paths::plan_collection(database, collection);
                let clone_path = paths::join(&col_path, "distributeShardsLike");
                if ctx
                    .snapshot
                    .string_at(&clone_path)
                    .is_some_and(|p| !p.is_empty())
                {
                    continue;
                }
                let Some(replication_factor) =
                    ctx.snapshot.uint_at(&paths::join(&col_path, "replicationFactor"))
                else {
                    tracing::debug!(collection = %collection, "No replicationFactor entry");
                    continue;
                };

                let current_col = format!(
                    "{}/{}/{}",
                    paths::CURRENT_COLLECTIONS,
                    database,
                    collection
                );
                let never_reported = ctx.snapshot.children(&current_col).count() == 0;

                let shards: Vec<(String, Vec<String>)> = ctx
                    .snapshot
                    .children(&paths::join(&col_path, "shards"))
                    .filter_map(|(name, node)| {
                        let servers: Vec<String> = node
                            .as_array()?
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect();
                        Some((name.to_string(), servers))
                    })
                    .collect();

                for (shard, planned) in &shards {
                    if !planned.contains(&self.server) {
                        continue;
                    }
                    let candidates: Vec<&String> = available
                        .iter()
                        .filter(|s| !planned.contains(*s))
                        .collect();

                    if never_reported {
                        let Some(target) = candidates.choose(rng) else {
                            tracing::warn!(shard = %shard, "No server available to assume leadership");
                            continue;
                        };
                        UnassumedLeadership::new(
                            format!("{}-{}", self.job_id, sub),
                            self.job_id.clone(),
                            database.clone(),
                            collection.clone(),
                            shard.clone(),
                            self.server.clone(),
                            (*target).clone(),
                        )
                        .create(ctx)
                        .await?;
                        sub += 1;
                        continue;
                    }

                    if replication_factor <= 1 {
                        continue;
                    }

                    if planned.first() == Some(&self.server) {
                        let Some(successor) = planned.get(1) else {
                            tracing::warn!(shard = %shard, "Failed leader has no follower to promote");
                            continue;
                        };
                        FailedLeader::new(
                            format!("{}-{}", self.job_id, sub),
                            self.job_id.clone(),
                            database.clone(),
                            collection.clone(),
                            shard.clone(),
                            self.server.clone(),
                            successor.clone(),
                        )
                        .create(ctx)
                        .await?;
                        sub += 1;
                    } else {
                        let Some(target) = candidates.choose(rng) else {
                            tracing::warn!(shard = %shard, "No replacement server available");
                            continue;
                        };
                        FailedFollower::new(
                            format!("{}-{}", self.job_id, sub),
                            self.job_id.clone(),
                            database.clone(),
                            collection.clone(),
                            shard.clone(),
                            self.server.clone(),
                            (*target).clone(),
                        )
                        .create(ctx)
                        .await?;
                        sub += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Finished once no child is open. A recovered server retires the
    /// children that have not started; Pending ones cannot be recalled.
    pub async fn status(&self, ctx: &JobCtx<'_>) -> Result<bool> {
        let healthy = ctx.snapshot.string_at(&paths::health_status(&self.server))
            == Some(HEALTH_STATUS_GOOD);

        let todo_children = child_job_ids(ctx.snapshot, paths::TARGET_TODO, &self.job_id);
        let pending_children = child_job_ids(ctx.snapshot, paths::TARGET_PENDING, &self.job_id);

        let mut open_todos = !todo_children.is_empty();
        if healthy && !todo_children.is_empty() {
            tracing::info!(
                job_id = %self.job_id,
                server = %self.server,
                "Server is healthy again, retiring unstarted children"
            );
            let mut tx = WriteTransaction::new();
            for child in &todo_children {
                tx = tx.delete(ctx.abs(&paths::join(paths::TARGET_TODO, child)));
            }
            let res = ctx.agent.transact(tx).await?;
            if !res.applied() {
                tracing::warn!(job_id = %self.job_id, "Could not retire unstarted children");
                return Ok(false);
            }
            open_todos = false;
        }

        if !open_todos && pending_children.is_empty() {
            return jobs::finish(
                ctx,
                &self.job_id,
                Some(Blocker::Server(&self.server)),
                true,
                None,
                Vec::new(),
            )
            .await;
        }
        Ok(false)
    }
}
