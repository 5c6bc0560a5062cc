//! Shared workflow of the two decommission jobs: feasibility checking,
//! relocation planning and the final strip-from-plan transaction.
//!
//! Feasibility and the relocation list are decided over the snapshot
//! before the job leaves ToDo, so nothing can fail between taking the
//! server block and scheduling the children.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::json;

use crate::agency::WriteTransaction;
use crate::error::Result;
use crate::jobs::{available_servers, AddFollower, JobCtx};
use crate::paths;
use crate::snapshot::Snapshot;

/// Why a decommission cannot proceed, if it cannot.
pub(crate) fn feasibility_error(snapshot: &Snapshot, server: &str) -> Option<String> {
    if !snapshot.has(&paths::join(paths::PLAN_DB_SERVERS, server)) {
        return Some(format!("no DB server {} in plan", server));
    }
    if let Some(cleaned) = snapshot.string_array_at(paths::TARGET_CLEANED_SERVERS) {
        if cleaned.iter().any(|s| s == server) {
            return Some(format!("server {} has been cleaned out already", server));
        }
    }

    let available = available_servers(snapshot);
    if available.len() <= 1 {
        return Some(format!("server {} is the last standing DB server", server));
    }
    let remaining = (available.len() - 1) as u64;

    let mut max_replication_factor = 1;
    for (database, _) in snapshot.children(paths::PLAN_COLLECTIONS) {
        let db_path = paths::join(paths::PLAN_COLLECTIONS, database);
        for (collection, _) in snapshot.children(&db_path) {
            let path = paths::join(
                &paths::plan_collection(database, collection),
                "replicationFactor",
            );
            if let Some(factor) = snapshot.uint_at(&path) {
                max_replication_factor = max_replication_factor.max(factor);
            }
        }
    }
    if max_replication_factor > remaining {
        return Some(format!(
            "cannot accommodate replication factor {} with {} servers remaining",
            max_replication_factor, remaining
        ));
    }
    None
}

/// One AddFollower child per shard the server holds, each targeting a
/// random server that does not hold the shard yet. `None` when some
/// shard has no possible destination.
pub(crate) fn plan_relocations(
    snapshot: &Snapshot,
    job_id: &str,
    server: &str,
    rng: &mut StdRng,
) -> Option<Vec<AddFollower>> {
    let available = available_servers(snapshot);
    let mut relocations = Vec::new();
    let mut sub = 0;

    for (database, _) in snapshot.children(paths::PLAN_COLLECTIONS) {
        let db_path = paths::join(paths::PLAN_COLLECTIONS, database);
        for (collection, node) in snapshot.children(&db_path) {
            if node
                .get("distributeShardsLike")
                .and_then(|v| v.as_str())
                .is_some_and(|p| !p.is_empty())
            {
                continue;
            }
            let replication_factor = node
                .get("replicationFactor")
                .and_then(|v| v.as_u64())
                .unwrap_or(1);

            let shards_path = paths::join(&paths::plan_collection(database, collection), "shards");
            for (shard, shard_node) in snapshot.children(&shards_path) {
                let Some(servers) = shard_node.as_array() else {
                    continue;
                };
                let planned: Vec<&str> = servers.iter().filter_map(|v| v.as_str()).collect();
                if !planned.contains(&server) {
                    continue;
                }
                // A surplus replica is already planned, likely left over
                // from an earlier decommission attempt.
                if planned.len() as u64 > replication_factor {
                    continue;
                }
                let candidates: Vec<&String> = available
                    .iter()
                    .filter(|s| !planned.contains(&s.as_str()))
                    .collect();
                let Some(target) = candidates.choose(rng) else {
                    tracing::error!(shard = %shard, "No destination server left for relocation");
                    return None;
                };

                relocations.push(AddFollower::new(
                    format!("{}-{}", job_id, sub),
                    job_id.to_string(),
                    database.to_string(),
                    collection.to_string(),
                    shard.to_string(),
                    vec![(*target).clone()],
                ));
                sub += 1;
            }
        }
    }
    Some(relocations)
}

/// Atomically remove the server from every planned shard, record it under
/// `/Target/CleanedServers` and bump the plan version, guarded by each
/// shard's old placement and by the job still holding the server.
pub(crate) async fn strip_server_from_plan(
    ctx: &JobCtx<'_>,
    job_id: &str,
    server: &str,
) -> Result<bool> {
    let mut tx = WriteTransaction::new().require_old(
        ctx.abs(&paths::join(paths::BLOCKED_SERVERS, server)),
        json!(job_id),
    );

    for (database, _) in ctx.snapshot.children(paths::PLAN_COLLECTIONS) {
        let db_path = paths::join(paths::PLAN_COLLECTIONS, database);
        for (collection, _) in ctx.snapshot.children(&db_path) {
            let shards_path = paths::join(&paths::plan_collection(database, collection), "shards");
            for (shard, node) in ctx.snapshot.children(&shards_path) {
                let Some(planned) = node.as_array() else {
                    continue;
                };
                if !planned.iter().any(|v| v.as_str() == Some(server)) {
                    continue;
                }
                let desired: Vec<&serde_json::Value> = planned
                    .iter()
                    .filter(|v| v.as_str() != Some(server))
                    .collect();
                let path = ctx.abs(&paths::plan_shard(database, collection, shard));
                tx = tx
                    .set(path.clone(), json!(desired))
                    .require_old(path, node.clone());
            }
        }
    }

    tx = tx
        .push(ctx.abs(paths::TARGET_CLEANED_SERVERS), json!(server))
        .increment(ctx.abs(paths::PLAN_VERSION));

    let res = ctx.agent.transact(tx).await?;
    if res.applied() {
        tracing::info!(server, "Server recorded in /Target/CleanedServers");
    }
    Ok(res.applied())
}
