//! Reconciliation policies: close the gap between planned and desired
//! shard replication, shrink the cluster toward its target size, and
//! flatten `distributeShardsLike` chains.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::json;

use crate::agency::{AgencyTransaction, TransactionOutcome, WriteTransaction};
use crate::error::Result;
use crate::health::HEALTH_STATUS_FAILED;
use crate::ids::JobIds;
use crate::jobs::{
    self, available_servers, remove_follower, AddFollower, CleanOutServer, JobCtx, RemoveFollower,
    RemoveServer,
};
use crate::paths;
use crate::snapshot::Snapshot;

/// Whether a replication-repair or shard-move job for this shard is
/// already queued.
fn repair_job_queued(snapshot: &Snapshot, shard: &str) -> bool {
    snapshot.children(paths::TARGET_TODO).any(|(_, job)| {
        let kind = job.get("type").and_then(|v| v.as_str());
        matches!(kind, Some("addFollower") | Some("removeFollower") | Some("moveShard"))
            && job.get("shard").and_then(|v| v.as_str()) == Some(shard)
    })
}

/// For every non-clone planned shard, schedule an AddFollower or
/// RemoveFollower when the planned replica count differs from the
/// effective replication factor. One follower is adjusted per job; the
/// policy converges over successive ticks.
pub async fn enforce_replication(
    ctx: &JobCtx<'_>,
    job_ids: &mut JobIds,
    rng: &mut StdRng,
) -> Result<()> {
    let snapshot = ctx.snapshot;
    let available = available_servers(snapshot);

    for (database, _) in snapshot.children(paths::PLAN_COLLECTIONS) {
        let db_path = paths::join(paths::PLAN_COLLECTIONS, database);
        for (collection, node) in snapshot.children(&db_path) {
            let Some(replication_factor) =
                node.get("replicationFactor").and_then(|v| v.as_u64())
            else {
                tracing::debug!(collection, "No replicationFactor entry");
                continue;
            };
            // Satellite collections replicate to every server.
            let desired = if replication_factor == 0 {
                available.len() as u64
            } else {
                replication_factor
            };

            if node
                .get("distributeShardsLike")
                .and_then(|v| v.as_str())
                .is_some_and(|p| !p.is_empty())
            {
                continue;
            }

            let shards_path = paths::join(&paths::plan_collection(database, collection), "shards");
            for (shard, shard_node) in snapshot.children(&shards_path) {
                let Some(planned) = shard_node.as_array() else {
                    continue;
                };
                let actual = planned.len() as u64;
                if actual == desired {
                    continue;
                }
                if repair_job_queued(snapshot, shard) {
                    tracing::debug!(
                        shard,
                        "Repair job already queued, not scheduling again"
                    );
                    continue;
                }
                if snapshot.has(&paths::join(paths::BLOCKED_SHARDS, shard)) {
                    continue;
                }

                if actual < desired {
                    let planned: Vec<&str> =
                        planned.iter().filter_map(|v| v.as_str()).collect();
                    let candidates: Vec<&String> = available
                        .iter()
                        .filter(|s| !planned.contains(&s.as_str()))
                        .collect();
                    let Some(target) = candidates.choose(rng) else {
                        tracing::warn!(shard, "Under-replicated but no server available");
                        continue;
                    };
                    AddFollower::new(
                        job_ids.take(),
                        "supervision",
                        database,
                        collection,
                        shard,
                        vec![(*target).clone()],
                    )
                    .create(ctx)
                    .await?;
                } else {
                    let Some(victim) =
                        remove_follower::select_follower(snapshot, database, collection, shard)
                    else {
                        continue;
                    };
                    RemoveFollower::new(
                        job_ids.take(),
                        "supervision",
                        database,
                        collection,
                        shard,
                        victim,
                    )
                    .create(ctx)
                    .await?;
                }
            }
        }
    }
    Ok(())
}

/// Schedule decommissions while the cluster is larger than its target.
/// Runs only when no job is queued or in progress.
pub async fn shrink_cluster(ctx: &JobCtx<'_>, job_ids: &mut JobIds) -> Result<()> {
    let snapshot = ctx.snapshot;
    if snapshot.children(paths::TARGET_TODO).count() != 0
        || snapshot.children(paths::TARGET_PENDING).count() != 0
    {
        return Ok(());
    }

    let Some(target) = snapshot.uint_at(paths::TARGET_NUM_DB_SERVERS) else {
        tracing::trace!("Targeted number of DB servers not set yet");
        return Ok(());
    };

    let all = available_servers(snapshot);
    if target >= all.len() as u64 {
        return Ok(());
    }
    if all.len() == 1 {
        tracing::debug!("Only one DB server left, refusing to shrink");
        return Ok(());
    }

    let server_failed = |server: &str| {
        snapshot.string_at(&paths::health_status(server)) == Some(HEALTH_STATUS_FAILED)
    };
    let mut healthy: Vec<String> = all
        .iter()
        .filter(|s| !server_failed(s.as_str()))
        .cloned()
        .collect();
    // A failed server is useless, and thus immediately removable, unless
    // it leads a shard or some shard it holds cannot spare a replica.
    let mut useless_failed: Vec<String> = all
        .iter()
        .filter(|s| server_failed(s.as_str()))
        .cloned()
        .collect();

    let mut max_replication_factor = 1;
    for (database, _) in snapshot.children(paths::PLAN_COLLECTIONS) {
        let db_path = paths::join(paths::PLAN_COLLECTIONS, database);
        for (collection, node) in snapshot.children(&db_path) {
            let Some(replication_factor) =
                node.get("replicationFactor").and_then(|v| v.as_u64())
            else {
                tracing::warn!(collection, "Cannot retrieve replication factor");
                return Ok(());
            };
            max_replication_factor = max_replication_factor.max(replication_factor);

            if useless_failed.is_empty() {
                continue;
            }
            let shards_path = paths::join(&paths::plan_collection(database, collection), "shards");
            for (_, shard_node) in snapshot.children(&shards_path) {
                let Some(servers) = shard_node.as_array() else {
                    continue;
                };
                for (position, server) in servers.iter().enumerate() {
                    let Some(server) = server.as_str() else {
                        continue;
                    };
                    let essential =
                        position == 0 || replication_factor >= healthy.len() as u64;
                    if essential {
                        useless_failed.retain(|s| s != server);
                    }
                }
            }
        }
    }

    if let Some(server) = useless_failed.last() {
        RemoveServer::new(job_ids.take(), "supervision", server.clone())
            .create(ctx)
            .await?;
        return Ok(());
    }

    if (healthy.len() as u64) > max_replication_factor && (healthy.len() as u64) > target {
        healthy.sort();
        if let Some(server) = healthy.last() {
            CleanOutServer::new(job_ids.take(), "supervision", server.clone())
                .create(ctx)
                .await?;
        }
    }
    Ok(())
}

/// Flatten transitive `distributeShardsLike` chains so every clone points
/// directly at its root prototype. One guarded transaction per entry;
/// rejected entries are reported and retried on a later tick.
pub async fn fix_prototype_chain(ctx: &JobCtx<'_>) -> Result<()> {
    let snapshot = ctx.snapshot;
    let mut batch = Vec::new();
    let mut touched = Vec::new();

    for (database, _) in snapshot.children(paths::PLAN_COLLECTIONS) {
        let db_path = paths::join(paths::PLAN_COLLECTIONS, database);
        for (collection, node) in snapshot.children(&db_path) {
            let Some(prototype) = node.get("distributeShardsLike").and_then(|v| v.as_str())
            else {
                continue;
            };
            if prototype.is_empty() {
                continue;
            }
            let root = jobs::resolve_prototype(snapshot, database, prototype);
            if root == prototype {
                continue;
            }
            let path = ctx.abs(&paths::join(
                &paths::plan_collection(database, collection),
                "distributeShardsLike",
            ));
            batch.push(AgencyTransaction::Write(
                WriteTransaction::new()
                    .set(path.clone(), json!(root))
                    .require_old(path, json!(prototype)),
            ));
            touched.push(format!("{}/{}", database, collection));
        }
    }

    if batch.is_empty() {
        return Ok(());
    }

    let outcomes = ctx.agent.general_transaction(batch).await?;
    for (collection, outcome) in touched.iter().zip(outcomes) {
        if outcome == TransactionOutcome::PreconditionFailed {
            tracing::warn!(
                collection = %collection,
                "Plan changed since resolution of distributeShardsLike"
            );
        }
    }
    Ok(())
}
