use serde_json::json;

use crate::error::Result;
use crate::jobs::{
    self, clones, pending_entry, Blocker, JobCtx,
};
use crate::paths;
use crate::snapshot::Snapshot;

/// Adds one or more planned followers to a shard. Created by
/// `enforce_replication` when a shard is under-replicated, or as a
/// relocation child of a decommission job.
#[derive(Debug, Clone)]
pub struct AddFollower {
    pub job_id: String,
    pub creator: String,
    pub database: String,
    pub collection: String,
    pub shard: String,
    pub new_follower: Vec<String>,
}

impl AddFollower {
    pub fn new(
        job_id: impl Into<String>,
        creator: impl Into<String>,
        database: impl Into<String>,
        collection: impl Into<String>,
        shard: impl Into<String>,
        new_follower: Vec<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            creator: creator.into(),
            database: database.into(),
            collection: collection.into(),
            shard: shard.into(),
            new_follower,
        }
    }

    pub(crate) fn from_agency(snapshot: &Snapshot, base: &str, job_id: &str) -> Result<Self> {
        Ok(Self {
            job_id: job_id.to_string(),
            creator: jobs::job_field(snapshot, base, job_id, "creator")?.to_string(),
            database: jobs::job_field(snapshot, base, job_id, "database")?.to_string(),
            collection: jobs::job_field(snapshot, base, job_id, "collection")?.to_string(),
            shard: jobs::job_field(snapshot, base, job_id, "shard")?.to_string(),
            new_follower: jobs::job_field_array(snapshot, base, job_id, "newFollower")?,
        })
    }

    fn todo_entry(&self) -> serde_json::Value {
        json!({
            "jobId": self.job_id,
            "type": "addFollower",
            "creator": self.creator,
            "timeCreated": jobs::timestamp_now(),
            "database": self.database,
            "collection": self.collection,
            "shard": self.shard,
            "newFollower": self.new_follower,
        })
    }

    /// Write the ToDo entry, plus one sibling sub-job per cloned shard so
    /// the whole distribution group is adjusted uniformly.
    pub async fn create(&self, ctx: &JobCtx<'_>) -> Result<bool> {
        tracing::info!(
            job_id = %self.job_id,
            shard = %self.shard,
            followers = ?self.new_follower,
            "Todo: add follower"
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
            let sibling = AddFollower::new(
                format!("{}-{}", self.job_id, sub),
                self.job_id.clone(),
                self.database.clone(),
                clone.collection,
                clone.shard,
                self.new_follower.clone(),
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

    /// Move ToDo→Pending: append the followers to the plan, block the
    /// shard and bump the plan version, guarded by the placement the
    /// snapshot showed.
    pub async fn start(&self, ctx: &JobCtx<'_>) -> Result<bool> {
        let plan_path = paths::plan_shard(&self.database, &self.collection, &self.shard);
        let cur_path =
            paths::current_shard_servers(&self.database, &self.collection, &self.shard);

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
        let current = ctx.snapshot.string_array_at(&cur_path);

        for follower in &self.new_follower {
            let hosted = planned.contains(follower)
                || current.as_ref().is_some_and(|c| c.contains(follower));
            if hosted {
                jobs::finish(
                    ctx,
                    &self.job_id,
                    None,
                    false,
                    Some("new follower is already holding the shard"),
                    Vec::new(),
                )
                .await?;
                return Ok(false);
            }
        }

        let Some(pending) = pending_entry(ctx.snapshot, &self.job_id) else {
            tracing::info!(job_id = %self.job_id, "ToDo entry not in snapshot yet");
            return Ok(false);
        };

        let blocked = paths::join(paths::BLOCKED_SHARDS, &self.shard);
        let mut tx = crate::agency::WriteTransaction::new()
            .set(ctx.abs(&paths::join(paths::TARGET_PENDING, &self.job_id)), pending)
            .delete(ctx.abs(&paths::join(paths::TARGET_TODO, &self.job_id)))
            .set(ctx.abs(&blocked), json!(self.job_id));
        for follower in &self.new_follower {
            tx = tx.push(ctx.abs(&plan_path), json!(follower));
        }
        tx = tx
            .increment(ctx.abs(paths::PLAN_VERSION))
            .require_old(ctx.abs(&plan_path), json!(planned))
            .require_empty(ctx.abs(&blocked));
        tx = match current {
            Some(current) => tx.require_old(ctx.abs(&cur_path), json!(current)),
            None => tx.require_empty(ctx.abs(&cur_path)),
        };

        let res = ctx.agent.transact(tx).await?;
        if res.applied() {
            tracing::info!(
                job_id = %self.job_id,
                shard = %self.shard,
                followers = ?self.new_follower,
                "Pending: add follower"
            );
        } else {
            tracing::info!(job_id = %self.job_id, "Start precondition failed");
        }
        Ok(res.applied())
    }

    /// Finished once any of the new followers shows up in the reported
    /// placement.
    pub async fn status(&self, ctx: &JobCtx<'_>) -> Result<bool> {
        let cur_path =
            paths::current_shard_servers(&self.database, &self.collection, &self.shard);
        let current = ctx.snapshot.string_array_at(&cur_path).unwrap_or_default();

        if self.new_follower.iter().any(|f| current.contains(f)) {
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
