use serde_json::json;

use crate::error::Result;
use crate::jobs::{self, clones, pending_entry, Blocker, JobCtx};
use crate::paths;
use crate::snapshot::Snapshot;

/// Picks the planned follower to drop from an over-replicated shard: a
/// non-leader replica, preferring one the leader has not reported in sync.
pub fn select_follower(
    snapshot: &Snapshot,
    database: &str,
    collection: &str,
    shard: &str,
) -> Option<String> {
    let planned = snapshot.string_array_at(&paths::plan_shard(database, collection, shard))?;
    let current = snapshot
        .string_array_at(&paths::current_shard_servers(database, collection, shard))
        .unwrap_or_default();

    let followers = planned.get(1..)?;
    followers
        .iter()
        .find(|f| !current.contains(f))
        .or_else(|| followers.last())
        .cloned()
}

/// Removes a designated follower from a shard's plan. Created by
/// `enforce_replication` when a shard is over-replicated.
#[derive(Debug, Clone)]
pub struct RemoveFollower {
    pub job_id: String,
    pub creator: String,
    pub database: String,
    pub collection: String,
    pub shard: String,
    pub server: String,
}

impl RemoveFollower {
    pub fn new(
        job_id: impl Into<String>,
        creator: impl Into<String>,
        database: impl Into<String>,
        collection: impl Into<String>,
        shard: impl Into<String>,
        server: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            creator: creator.into(),
            database: database.into(),
            collection: collection.into(),
            shard: shard.into(),
            server: server.into(),
        }
    }

    pub(crate) fn from_agency(snapshot: &Snapshot, base: &str, job_id: &str) -> Result<Self> {
        Ok(Self {
            job_id: job_id.to_string(),
            creator: jobs::job_field(snapshot, base, job_id, "creator")?.to_string(),
            database: jobs::job_field(snapshot, base, job_id, "database")?.to_string(),
            collection: jobs::job_field(snapshot, base, job_id, "collection")?.to_string(),
            shard: jobs::job_field(snapshot, base, job_id, "shard")?.to_string(),
            server: jobs::job_field(snapshot, base, job_id, "server")?.to_string(),
        })
    }

    fn todo_entry(&self) -> serde_json::Value {
        json!({
            "jobId": self.job_id,
            "type": "removeFollower",
            "creator": self.creator,
            "timeCreated": jobs::timestamp_now(),
            "database": self.database,
            "collection": self.collection,
            "shard": self.shard,
            "server": self.server,
        })
    }

    pub async fn create(&self, ctx: &JobCtx<'_>) -> Result<bool> {
        tracing::info!(
            job_id = %self.job_id,
            shard = %self.shard,
            server = %self.server,
            "Todo: remove follower"
        );

        let todo_path = paths::join(paths::TARGET_TODO, &self.job_id);
        let mut tx = crate::agency::WriteTransaction::new()
            .set(ctx.abs(&todo_path), self.todo_entry())
            .require_empty(ctx.abs(&todo_path));

        let mut sub = 0;
        for clone in clones(ctx.snapshot, &self.database, &self.collection, &self.shard) {
            if clone.collection == self.collection && clone.shard == self.shard {
                continue;
            }
            let sibling = RemoveFollower::new(
                format!("{}-{}", self.job_id, sub),
                self.job_id.clone(),
                self.database.clone(),
                clone.collection,
                clone.shard,
                self.server.clone(),
            );
            let path = paths::join(paths::TARGET_TODO, &sibling.job_id);
            tx = tx.set(ctx.abs(&path), sibling.todo_entry());
            sub += 1;
        }

        let res = ctx.agent.transact(tx).await?;
        if !res.applied() {
            tracing::info!(job_id = %self.job_id, "Failed to insert job");
        }
        Ok(res.applied())
    }

    pub async fn start(&self, ctx: &JobCtx<'_>) -> Result<bool> {
        let plan_path = paths::plan_shard(&self.database, &self.collection, &self.shard);

        let Some(planned) = ctx.snapshot.string_array_at(&plan_path) else {
            jobs::finish(
                ctx,
                &self.job_id,
                None,
                false,
                Some("shard is no longer planned"),
                Vec::new(),
            )
            .await?;
            return Ok(false);
        };

        if planned.first() == Some(&self.server) {
            jobs::finish(
                ctx,
                &self.job_id,
                None,
                false,
                Some("cannot remove the shard leader"),
                Vec::new(),
            )
            .await?;
            return Ok(false);
        }
        if !planned.contains(&self.server) {
            // Nothing left to do.
            jobs::finish(ctx, &self.job_id, None, true, None, Vec::new()).await?;
            return Ok(false);
        }

        let Some(pending) = pending_entry(ctx.snapshot, &self.job_id) else {
            tracing::info!(job_id = %self.job_id, "ToDo entry not in snapshot yet");
            return Ok(false);
        };

        let desired: Vec<&String> = planned.iter().filter(|s| **s != self.server).collect();
        let blocked = paths::join(paths::BLOCKED_SHARDS, &self.shard);
        let tx = crate::agency::WriteTransaction::new()
            .set(ctx.abs(&paths::join(paths::TARGET_PENDING, &self.job_id)), pending)
            .delete(ctx.abs(&paths::join(paths::TARGET_TODO, &self.job_id)))
            .set(ctx.abs(&blocked), json!(self.job_id))
            .set(ctx.abs(&plan_path), json!(desired))
            .increment(ctx.abs(paths::PLAN_VERSION))
            .require_old(ctx.abs(&plan_path), json!(planned))
            .require_empty(ctx.abs(&blocked));

        let res = ctx.agent.transact(tx).await?;
        if res.applied() {
            tracing::info!(
                job_id = %self.job_id,
                shard = %self.shard,
                server = %self.server,
                "Pending: remove follower"
            );
        } else {
            tracing::info!(job_id = %self.job_id, "Start precondition failed");
        }
        Ok(res.applied())
    }

    /// Finished once the removed follower is no longer reported for the
    /// shard.
    pub async fn status(&self, ctx: &JobCtx<'_>) -> Result<bool> {
        let cur_path =
            paths::current_shard_servers(&self.database, &self.collection, &self.shard);
        let current = ctx.snapshot.string_array_at(&cur_path).unwrap_or_default();

        if !current.contains(&self.server) {
            return jobs::finish(
                ctx,
                &self.job_id,
                Some(Blocker::Shard(&self.shard)),
                true,
                None,
                Vec::new(),
            )
            .await;
        }
        Ok(false)
    }

    pub async fn abort(&self, ctx: &JobCtx<'_>) -> Result<()> {
        jobs::finish(
            ctx,
            &self.job_id,
            Some(Blocker::Shard(&self.shard)),
            false,
            Some("aborted"),
            Vec::new(),
        )
        .await?;
        Ok(())
    }
}
