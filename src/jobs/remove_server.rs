use rand::rngs::StdRng;
use serde_json::json;

use crate::agency::WriteTransaction;
use crate::error::Result;
use crate::jobs::decommission::{feasibility_error, plan_relocations, strip_server_from_plan};
use crate::jobs::{self, child_job_ids, pending_entry, Blocker, JobCtx};
use crate::paths;
use crate::snapshot::Snapshot;

/// Withdraws a failed, data-less server from the cluster. Scheduled by
/// `shrink_cluster` when a failed server holds no shard that still
/// matters.
#[derive(Debug, Clone)]
pub struct RemoveServer {
    pub job_id: String,
    pub creator: String,
    pub server: String,
}

impl RemoveServer {
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

    fn todo_entry(&self) -> serde_json::Value {
        json!({
            "jobId": self.job_id,
            "type": "removeServer",
            "creator": self.creator,
            "timeCreated": jobs::timestamp_now(),
            "server": self.server,
        })
    }

    pub async fn create(&self, ctx: &JobCtx<'_>) -> Result<bool> {
        tracing::info!(job_id = %self.job_id, server = %self.server, "Todo: remove server");
        let todo_path = paths::join(paths::TARGET_TODO, &self.job_id);
        let tx = WriteTransaction::new()
            .set(ctx.abs(&todo_path), self.todo_entry())
            .require_empty(ctx.abs(&todo_path));
        let res = ctx.agent.transact(tx).await?;
        if !res.applied() {
            tracing::info!(job_id = %self.job_id, "Failed to insert job");
        }
        Ok(res.applied())
    }

    pub async fn start(&self, ctx: &JobCtx<'_>, rng: &mut StdRng) -> Result<bool> {
        // Decide everything over the snapshot before leaving ToDo.
        if let Some(reason) = feasibility_error(ctx.snapshot, &self.server) {
            jobs::finish(ctx, &self.job_id, None, false, Some(&reason), Vec::new()).await?;
            return Ok(false);
        }
        let Some(relocations) = plan_relocations(ctx.snapshot, &self.job_id, &self.server, rng)
        else {
            jobs::finish(
                ctx,
                &self.job_id,
                None,
                false,
                Some("could not schedule shard relocations"),
                Vec::new(),
            )
            .await?;
            return Ok(false);
        };

        let Some(pending) = pending_entry(ctx.snapshot, &self.job_id) else {
            tracing::info!(job_id = %self.job_id, "ToDo entry not in snapshot yet");
            return Ok(false);
        };

        let blocked = paths::join(paths::BLOCKED_SERVERS, &self.server);
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
        tracing::info!(job_id = %self.job_id, server = %self.server, "Pending: remove server");

        for relocation in relocations {
            relocation.create(ctx).await?;
        }
        Ok(true)
    }

    /// Once all relocations are done, force the server out of every plan
    /// and record it as cleaned.
    pub async fn status(&self, ctx: &JobCtx<'_>) -> Result<bool> {
        let open = !child_job_ids(ctx.snapshot, paths::TARGET_TODO, &self.job_id).is_empty()
            || !child_job_ids(ctx.snapshot, paths::TARGET_PENDING, &self.job_id).is_empty();
        if open {
            return Ok(false);
        }

        if !strip_server_from_plan(ctx, &self.job_id, &self.server).await? {
            return Ok(false);
        }
        jobs::finish(
            ctx,
            &self.job_id,
            Some(Blocker::Server(&self.server)),
            true,
            None,
            Vec::new(),
        )
        .await
    }
}
