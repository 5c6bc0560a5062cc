use serde_json::json;

use crate::error::Result;
use crate::jobs::{self, clones, pending_entry, Blocker, JobCtx};
use crate::paths;
use crate::snapshot::Snapshot;

/// Handles a shard whose planned leader failed before anything was ever
/// reported to Current: the planned slot is handed to an available server
/// so leadership can be assumed at all. Child of FailedServer.
#[derive(Debug, Clone)]
pub struct UnassumedLeadership {
    pub job_id: String,
    pub creator: String,
    pub database: String,
    pub collection: String,
    pub shard: String,
    pub from_server: String,
    pub to_server: String,
}

impl UnassumedLeadership {
    pub fn new(
        job_id: impl Into<String>,
        creator: impl Into<String>,
        database: impl Into<String>,
        collection: impl Into<String>,
        shard: impl Into<String>,
        from_server: impl Into<String>,
        to_server: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            creator: creator.into(),
            database: database.into(),
            collection: collection.into(),
            shard: shard.into(),
            from_server: from_server.into(),
            to_server: to_server.into(),
        }
    }

    pub(crate) fn from_agency(snapshot: &Snapshot, base: &str, job_id: &str) -> Result<Self> {
        Ok(Self {
            job_id: job_id.to_string(),
            creator: jobs::job_field(snapshot, base, job_id, "creator")?.to_string(),
            database: jobs::job_field(snapshot, base, job_id, "database")?.to_string(),
            collection: jobs::job_field(snapshot, base, job_id, "collection")?.to_string(),
            shard: jobs::job_field(snapshot, base, job_id, "shard")?.to_string(),
            from_server: jobs::job_field(snapshot, base, job_id, "fromServer")?.to_string(),
            to_server: jobs::job_field(snapshot, base, job_id, "toServer")?.to_string(),
        })
    }

    fn todo_entry(&self) -> serde_json::Value {
        json!({
            "jobId": self.job_id,
            "type": "unassumedLeadership",
            "creator": self.creator,
            "timeCreated": jobs::timestamp_now(),
            "database": self.database,
            "collection": self.collection,
            "shard": self.shard,
            "fromServer": self.from_server,
            "toServer": self.to_server,
        })
    }

    pub async fn create(&self, ctx: &JobCtx<'_>) -> Result<bool> {
        tracing::info!(
            job_id = %self.job_id,
            shard = %self.shard,
            from = %self.from_server,
            to = %self.to_server,
            "Todo: reassign unassumed leadership"
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
            let sibling = UnassumedLeadership::new(
                format!("{}-{}", self.job_id, sub),
                self.job_id.clone(),
                self.database.clone(),
                clone.collection,
                clone.shard,
                self.from_server.clone(),
                self.to_server.clone(),
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
        if !planned.contains(&self.from_server) || planned.contains(&self.to_server) {
            jobs::finish(
                ctx,
                &self.job_id,
                None,
                false,
                Some("planned placement changed underneath the job"),
                Vec::new(),
            )
            .await?;
            return Ok(false);
        }

        let Some(pending) = pending_entry(ctx.snapshot, &self.job_id) else {
            tracing::info!(job_id = %self.job_id, "ToDo entry not in snapshot yet");
            return Ok(false);
        };

        let desired: Vec<&String> = planned
            .iter()
            .map(|s| if *s == self.from_server { &self.to_server } else { s })
            .collect();
        let blocked = paths::join(paths::BLOCKED_SHARDS, &self.shard);
        let tx = crate::agency::WriteTransaction::new()
            .set(ctx.abs(&paths::join(paths::TARGET_PENDING, &self.job_id)), pending)
            .delete(ctx.abs(&paths::join(paths::TARGET_TODO, &self.job_id)))
            .set(ctx.abs(&plan_path), json!(desired))
            .set(ctx.abs(&blocked), json!(self.job_id))
            .increment(ctx.abs(paths::PLAN_VERSION))
            .require_old(ctx.abs(&plan_path), json!(planned))
            .require_empty(ctx.abs(&blocked));

        let res = ctx.agent.transact(tx).await?;
        if res.applied() {
            tracing::info!(
                job_id = %self.job_id,
                shard = %self.shard,
                to = %self.to_server,
                "Pending: reassign unassumed leadership"
            );
        } else {
            tracing::info!(job_id = %self.job_id, "Start precondition failed");
        }
        Ok(res.applied())
    }

    /// Finished once some server reports the shard at all.
    pub async fn status(&self, ctx: &JobCtx<'_>) -> Result<bool> {
        let cur_path =
            paths::current_shard_servers(&self.database, &self.collection, &self.shard);
        let current = ctx.snapshot.string_array_at(&cur_path).unwrap_or_default();

        if !current.is_empty() {
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
}
