pub mod add_follower;
pub mod clean_out_server;
pub mod decommission;
pub mod failed_follower;
pub mod failed_leader;
pub mod failed_server;
pub mod remove_follower;
pub mod remove_server;
pub mod unassumed_leadership;

pub use add_follower::AddFollower;
pub use clean_out_server::CleanOutServer;
pub use failed_follower::FailedFollower;
pub use failed_leader::FailedLeader;
pub use failed_server::FailedServer;
pub use remove_follower::RemoveFollower;
pub use remove_server::RemoveServer;
pub use unassumed_leadership::UnassumedLeadership;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::rngs::StdRng;
use serde_json::{json, Value};

use crate::agency::{Agency, Op, WriteTransaction};
use crate::error::{Result, SupervisionError};
use crate::paths;
use crate::snapshot::Snapshot;

/// Which of the four job namespaces currently holds a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobLocation {
    ToDo,
    Pending,
    Finished,
    Failed,
}

impl JobLocation {
    pub fn base(&self) -> &'static str {
        match self {
            JobLocation::ToDo => paths::TARGET_TODO,
            JobLocation::Pending => paths::TARGET_PENDING,
            JobLocation::Finished => paths::TARGET_FINISHED,
            JobLocation::Failed => paths::TARGET_FAILED,
        }
    }
}

/// Find a job by ID across the four namespaces.
pub fn locate(snapshot: &Snapshot, job_id: &str) -> Option<JobLocation> {
    [
        JobLocation::ToDo,
        JobLocation::Pending,
        JobLocation::Finished,
        JobLocation::Failed,
    ]
    .into_iter()
    .find(|loc| snapshot.has(&paths::join(loc.base(), job_id)))
}

/// Everything a job may touch during one tick. Jobs borrow the snapshot
/// and never outlive it.
pub struct JobCtx<'a> {
    pub snapshot: &'a Snapshot,
    pub agent: &'a dyn Agency,
    pub prefix: &'a str,
}

impl JobCtx<'_> {
    pub fn abs(&self, path: &str) -> String {
        paths::absolute(self.prefix, path)
    }
}

pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Planned DB servers that have not been cleaned out.
pub fn available_servers(snapshot: &Snapshot) -> Vec<String> {
    let mut servers: Vec<String> = snapshot
        .children(paths::PLAN_DB_SERVERS)
        .map(|(name, _)| name.to_string())
        .collect();
    if let Some(cleaned) = snapshot.string_array_at(paths::TARGET_CLEANED_SERVERS) {
        servers.retain(|s| !cleaned.contains(s));
    }
    servers
}

/// A member of a distribution group: one shard of one collection whose
/// placement follows the group's prototype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneShard {
    pub collection: String,
    pub shard: String,
}

pub(crate) fn resolve_prototype(snapshot: &Snapshot, database: &str, collection: &str) -> String {
    let mut current = collection.to_string();
    loop {
        let path = paths::join(
            &paths::plan_collection(database, &current),
            "distributeShardsLike",
        );
        match snapshot.string_at(&path) {
            Some(proto) if !proto.is_empty() => current = proto.to_string(),
            _ => return current,
        }
    }
}

/// The distribution group of a shard: the shard itself first, then the
/// sibling shard (same position) of every collection whose
/// `distributeShardsLike` transitively resolves to this collection.
pub fn clones(
    snapshot: &Snapshot,
    database: &str,
    collection: &str,
    shard: &str,
) -> Vec<CloneShard> {
    let mut group = vec![CloneShard {
        collection: collection.to_string(),
        shard: shard.to_string(),
    }];

    let shards_path = paths::join(&paths::plan_collection(database, collection), "shards");
    let Some(position) = snapshot
        .children(&shards_path)
        .position(|(name, _)| name == shard)
    else {
        return group;
    };

    let db_path = paths::join(paths::PLAN_COLLECTIONS, database);
    let followers: Vec<String> = snapshot
        .children(&db_path)
        .filter(|(name, _)| *name != collection)
        .filter(|(name, _)| resolve_prototype(snapshot, database, name) == collection)
        .map(|(name, _)| name.to_string())
        .collect();

    for follower in followers {
        let follower_shards = paths::join(&paths::plan_collection(database, &follower), "shards");
        if let Some((sibling, _)) = snapshot.children(&follower_shards).nth(position) {
            group.push(CloneShard {
                collection: follower,
                shard: sibling.to_string(),
            });
        }
    }
    group
}

/// Exclusive-claim marker released when a job finishes.
#[derive(Debug, Clone, Copy)]
pub enum Blocker<'a> {
    Shard(&'a str),
    Server(&'a str),
}

impl Blocker<'_> {
    pub fn path(&self) -> String {
        match self {
            Blocker::Shard(shard) => paths::join(paths::BLOCKED_SHARDS, shard),
            Blocker::Server(server) => paths::join(paths::BLOCKED_SERVERS, server),
        }
    }
}

/// The ToDo entry of `job_id` extended with a `timeStarted` stamp, ready
/// to be written under Pending.
pub(crate) fn pending_entry(snapshot: &Snapshot, job_id: &str) -> Option<Value> {
    let todo = snapshot
        .lookup(&paths::join(paths::TARGET_TODO, job_id))?
        .clone();
    let mut entry = todo.as_object()?.clone();
    entry.insert("timeStarted".to_string(), json!(timestamp_now()));
    Some(Value::Object(entry))
}

/// Move a job to Finished (or Failed) in a single guarded transaction,
/// releasing its block. `extra_ops` join the same transaction. Returns
/// whether the transition was committed.
pub async fn finish(
    ctx: &JobCtx<'_>,
    job_id: &str,
    blocker: Option<Blocker<'_>>,
    success: bool,
    reason: Option<&str>,
    extra_ops: Vec<(String, Op)>,
) -> Result<bool> {
    let Some(location) = locate(ctx.snapshot, job_id) else {
        tracing::warn!(job_id, "Cannot finish job, not found in agency");
        return Ok(false);
    };
    if matches!(location, JobLocation::Finished | JobLocation::Failed) {
        return Ok(false);
    }

    let source = paths::join(location.base(), job_id);
    let job = ctx.snapshot.get(&source)?.clone();
    let mut entry = job
        .as_object()
        .cloned()
        .unwrap_or_default();
    entry.insert("timeFinished".to_string(), json!(timestamp_now()));
    if let Some(reason) = reason {
        entry.insert("reason".to_string(), json!(reason));
    }

    let destination = if success {
        JobLocation::Finished
    } else {
        JobLocation::Failed
    };

    let mut tx = WriteTransaction::new()
        .set(ctx.abs(&paths::join(destination.base(), job_id)), Value::Object(entry))
        .delete(ctx.abs(&source))
        .require_old(ctx.abs(&source), job);
    if let Some(blocker) = blocker {
        tx = tx.delete(ctx.abs(&blocker.path()));
    }
    for (path, op) in extra_ops {
        tx.ops.push((path, op));
    }

    let res = ctx.agent.transact(tx).await?;
    if res.applied() {
        tracing::info!(job_id, success, "Job finished");
    } else {
        tracing::debug!(job_id, "Finish transition rejected, retrying next tick");
    }
    Ok(res.applied())
}

/// Sub-jobs of `job_id` currently stored under `base`.
pub(crate) fn child_job_ids(snapshot: &Snapshot, base: &str, job_id: &str) -> Vec<String> {
    let prefix = format!("{}-", job_id);
    snapshot
        .children(base)
        .filter(|(name, _)| name.starts_with(&prefix))
        .map(|(name, _)| name.to_string())
        .collect()
}

/// Whether the job holding a block may be aborted. Replication-repair and
/// clean-out jobs can; failure-handling jobs cannot.
pub fn abortable(snapshot: &Snapshot, job_id: &str) -> bool {
    let Some(location) = locate(snapshot, job_id) else {
        return false;
    };
    let type_path = paths::join(&paths::join(location.base(), job_id), "type");
    matches!(
        snapshot.string_at(&type_path),
        Some("addFollower") | Some("removeFollower") | Some("cleanOutServer")
    )
}

pub(crate) fn job_field<'a>(
    snapshot: &'a Snapshot,
    base: &str,
    job_id: &str,
    field: &str,
) -> Result<&'a str> {
    let path = paths::join(&paths::join(base, job_id), field);
    snapshot
        .string_at(&path)
        .ok_or_else(|| SupervisionError::MalformedJob {
            job_id: job_id.to_string(),
            reason: format!("missing field {}", field),
        })
}

pub(crate) fn job_field_array(
    snapshot: &Snapshot,
    base: &str,
    job_id: &str,
    field: &str,
) -> Result<Vec<String>> {
    let path = paths::join(&paths::join(base, job_id), field);
    snapshot
        .string_array_at(&path)
        .ok_or_else(|| SupervisionError::MalformedJob {
            job_id: job_id.to_string(),
            reason: format!("missing field {}", field),
        })
}

/// Leader slot must match; the follower sets must be equal regardless of
/// order.
pub(crate) fn same_servers(plan: &[String], current: &[String]) -> bool {
    if plan.len() != current.len() || plan.first() != current.first() {
        return false;
    }
    let mut a: Vec<&String> = plan.iter().skip(1).collect();
    let mut b: Vec<&String> = current.iter().skip(1).collect();
    a.sort();
    b.sort();
    a == b
}

/// A supervision job, reconstructed from its agency record.
#[derive(Debug)]
pub enum JobKind {
    AddFollower(AddFollower),
    RemoveFollower(RemoveFollower),
    FailedFollower(FailedFollower),
    FailedLeader(FailedLeader),
    UnassumedLeadership(UnassumedLeadership),
    FailedServer(FailedServer),
    RemoveServer(RemoveServer),
    CleanOutServer(CleanOutServer),
}

impl JobKind {
    pub fn from_agency(
        snapshot: &Snapshot,
        location: JobLocation,
        job_id: &str,
    ) -> Result<JobKind> {
        let base = location.base();
        let kind = job_field(snapshot, base, job_id, "type")?;
        match kind {
            "addFollower" => Ok(JobKind::AddFollower(AddFollower::from_agency(
                snapshot, base, job_id,
            )?)),
            "removeFollower" => Ok(JobKind::RemoveFollower(RemoveFollower::from_agency(
                snapshot, base, job_id,
            )?)),
            "failedFollower" => Ok(JobKind::FailedFollower(FailedFollower::from_agency(
                snapshot, base, job_id,
            )?)),
            "failedLeader" => Ok(JobKind::FailedLeader(FailedLeader::from_agency(
                snapshot, base, job_id,
            )?)),
            "unassumedLeadership" => Ok(JobKind::UnassumedLeadership(
                UnassumedLeadership::from_agency(snapshot, base, job_id)?,
            )),
            "failedServer" => Ok(JobKind::FailedServer(FailedServer::from_agency(
                snapshot, base, job_id,
            )?)),
            "removeServer" => Ok(JobKind::RemoveServer(RemoveServer::from_agency(
                snapshot, base, job_id,
            )?)),
            "cleanOutServer" => Ok(JobKind::CleanOutServer(CleanOutServer::from_agency(
                snapshot, base, job_id,
            )?)),
            other => Err(SupervisionError::MalformedJob {
                job_id: job_id.to_string(),
                reason: format!("unknown job type {}", other),
            }),
        }
    }

    pub async fn start(&self, ctx: &JobCtx<'_>, rng: &mut StdRng) -> Result<bool> {
        match self {
            JobKind::AddFollower(job) => job.start(ctx).await,
            JobKind::RemoveFollower(job) => job.start(ctx).await,
            JobKind::FailedFollower(job) => job.start(ctx).await,
            JobKind::FailedLeader(job) => job.start(ctx).await,
            JobKind::UnassumedLeadership(job) => job.start(ctx).await,
            JobKind::FailedServer(job) => job.start(ctx, rng).await,
            JobKind::RemoveServer(job) => job.start(ctx, rng).await,
            JobKind::CleanOutServer(job) => job.start(ctx, rng).await,
        }
    }

    pub async fn status(&self, ctx: &JobCtx<'_>) -> Result<bool> {
        match self {
            JobKind::AddFollower(job) => job.status(ctx).await,
            JobKind::RemoveFollower(job) => job.status(ctx).await,
            JobKind::FailedFollower(job) => job.status(ctx).await,
            JobKind::FailedLeader(job) => job.status(ctx).await,
            JobKind::UnassumedLeadership(job) => job.status(ctx).await,
            JobKind::FailedServer(job) => job.status(ctx).await,
            JobKind::RemoveServer(job) => job.status(ctx).await,
            JobKind::CleanOutServer(job) => job.status(ctx).await,
        }
    }

    pub async fn abort(&self, ctx: &JobCtx<'_>) -> Result<()> {
        match self {
            JobKind::AddFollower(job) => job.abort(ctx).await,
            JobKind::RemoveFollower(job) => job.abort(ctx).await,
            JobKind::CleanOutServer(job) => job.abort(ctx).await,
            _ => {
                tracing::warn!("Abort requested for a job type that cannot abort");
                Ok(())
            }
        }
    }
}

/// Advance one job by one step: ToDo entries attempt `start`, Pending
/// entries re-evaluate `status`. Malformed records move to Failed and are
/// never retried.
pub async fn run_job(ctx: &JobCtx<'_>, job_id: &str, rng: &mut StdRng) -> Result<()> {
    let Some(location) = locate(ctx.snapshot, job_id) else {
        return Ok(());
    };
    match JobKind::from_agency(ctx.snapshot, location, job_id) {
        Ok(job) => {
            match location {
                JobLocation::ToDo => {
                    job.start(ctx, rng).await?;
                }
                JobLocation::Pending => {
                    job.status(ctx).await?;
                }
                _ => {}
            }
            Ok(())
        }
        Err(SupervisionError::MalformedJob { reason, .. }) => {
            tracing::error!(job_id, %reason, "Malformed job record, moving to Failed");
            finish(ctx, job_id, None, false, Some(&reason), Vec::new()).await?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}
