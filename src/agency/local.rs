use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

use crate::agency::transaction::{
    AgencyTransaction, Op, Precondition, TransactionOutcome, WriteResult, WriteTransaction,
};
use crate::agency::Agency;
use crate::error::{Result, SupervisionError};
use crate::snapshot::Snapshot;

/// In-memory agency with the full op and precondition semantics.
///
/// Backs the integration tests and single-process embeddings. Writes are
/// linearized under one lock; the commit index is monotonic. Leadership
/// is a test control here — a real deployment observes it from the
/// consensus layer.
pub struct LocalAgency {
    state: Mutex<Store>,
}

struct Store {
    persistent: Value,
    transient: Value,
    commit_index: u64,
    leading: bool,
    leader_since: DateTime<Utc>,
}

impl Default for LocalAgency {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalAgency {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Store {
                persistent: Value::Object(Map::new()),
                transient: Value::Object(Map::new()),
                commit_index: 0,
                leading: true,
                leader_since: Utc::now(),
            }),
        }
    }

    pub fn set_leading(&self, leading: bool) {
        let mut state = self.state.lock().unwrap();
        if leading && !state.leading {
            state.leader_since = Utc::now();
        }
        state.leading = leading;
    }

    /// Shift the leadership acquisition time into the past, so grace-period
    /// gates open without waiting.
    pub fn backdate_leadership(&self, by: Duration) {
        let mut state = self.state.lock().unwrap();
        state.leader_since = state.leader_since - by;
    }

    /// Current commit index, for assertions on write counts.
    pub fn commit_index(&self) -> u64 {
        self.state.lock().unwrap().commit_index
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = root;
    for seg in segments(path) {
        node = node.as_object()?.get(seg)?;
    }
    Some(node)
}

/// Mutable handle on the node at `path`, creating intermediate objects
/// (and replacing non-objects on the way) when `create` is set.
fn lookup_mut<'a>(root: &'a mut Value, path: &str, create: bool) -> Option<&'a mut Value> {
    let mut node = root;
    for seg in segments(path) {
        if create {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            node = node
                .as_object_mut()
                .unwrap()
                .entry(seg.to_string())
                .or_insert(Value::Null);
        } else {
            node = node.as_object_mut()?.get_mut(seg)?;
        }
    }
    Some(node)
}

fn delete_at(root: &mut Value, path: &str) {
    let segs = segments(path);
    let Some((last, parents)) = segs.split_last() else {
        return;
    };
    let mut node = root;
    for seg in parents {
        match node.as_object_mut().and_then(|o| o.get_mut(*seg)) {
            Some(child) => node = child,
            None => return,
        }
    }
    if let Some(obj) = node.as_object_mut() {
        obj.shift_remove(*last);
    }
}

fn apply_op(root: &mut Value, path: &str, op: &Op) {
    match op {
        Op::Set(value) => {
            if let Some(node) = lookup_mut(root, path, true) {
                *node = value.clone();
            }
        }
        Op::Delete => delete_at(root, path),
        Op::Push(value) => {
            if let Some(node) = lookup_mut(root, path, true) {
                match node.as_array_mut() {
                    Some(array) => array.push(value.clone()),
                    None => *node = Value::Array(vec![value.clone()]),
                }
            }
        }
        Op::Erase(value) => {
            if let Some(array) = lookup_mut(root, path, false).and_then(Value::as_array_mut) {
                if let Some(pos) = array.iter().position(|v| v == value) {
                    array.remove(pos);
                }
            }
        }
        Op::Increment { step } => {
            if let Some(node) = lookup_mut(root, path, true) {
                let old = node.as_u64().unwrap_or(0);
                *node = Value::from(old + step);
            }
        }
    }
}

fn holds(root: &Value, path: &str, precondition: &Precondition) -> bool {
    match precondition {
        Precondition::Old(expected) => lookup(root, path) == Some(expected),
        Precondition::OldEmpty => lookup(root, path).is_none(),
        Precondition::IsArray => lookup(root, path).is_some_and(Value::is_array),
    }
}

impl Store {
    fn apply_write(&mut self, tx: &WriteTransaction) -> u64 {
        for (path, precondition) in &tx.preconditions {
            if !holds(&self.persistent, path, precondition) {
                return 0;
            }
        }
        for (path, op) in &tx.ops {
            apply_op(&mut self.persistent, path, op);
        }
        self.commit_index += 1;
        self.commit_index
    }
}

#[async_trait]
impl Agency for LocalAgency {
    async fn read_tree(&self, prefix: &str) -> Result<Snapshot> {
        let state = self.state.lock().unwrap();
        let subtree = lookup(&state.persistent, prefix)
            .cloned()
            .unwrap_or(Value::Object(Map::new()));
        Ok(Snapshot::new(subtree))
    }

    async fn read_transient(&self, prefix: &str) -> Result<Snapshot> {
        let state = self.state.lock().unwrap();
        let subtree = lookup(&state.transient, prefix)
            .cloned()
            .unwrap_or(Value::Object(Map::new()));
        Ok(Snapshot::new(subtree))
    }

    async fn transact(&self, tx: WriteTransaction) -> Result<WriteResult> {
        let mut state = self.state.lock().unwrap();
        if !state.leading {
            return Ok(WriteResult::rejected());
        }
        let index = state.apply_write(&tx);
        Ok(WriteResult {
            accepted: true,
            indices: vec![index],
        })
    }

    async fn transient(&self, tx: WriteTransaction) -> Result<WriteResult> {
        let mut state = self.state.lock().unwrap();
        for (path, precondition) in &tx.preconditions {
            if !holds(&state.transient, path, precondition) {
                return Ok(WriteResult {
                    accepted: true,
                    indices: vec![0],
                });
            }
        }
        for (path, op) in &tx.ops {
            apply_op(&mut state.transient, path, op);
        }
        Ok(WriteResult {
            accepted: true,
            indices: vec![1],
        })
    }

    async fn general_transaction(
        &self,
        batch: Vec<AgencyTransaction>,
    ) -> Result<Vec<TransactionOutcome>> {
        let mut state = self.state.lock().unwrap();
        if !state.leading {
            return Err(SupervisionError::NotLeader);
        }
        let mut outcomes = Vec::with_capacity(batch.len());
        for entry in &batch {
            match entry {
                AgencyTransaction::Write(tx) => {
                    let index = state.apply_write(tx);
                    outcomes.push(if index == 0 {
                        TransactionOutcome::PreconditionFailed
                    } else {
                        TransactionOutcome::Applied(index)
                    });
                }
                AgencyTransaction::Read(paths) => {
                    let values = paths
                        .iter()
                        .map(|p| lookup(&state.persistent, p).cloned())
                        .collect();
                    outcomes.push(TransactionOutcome::Read(values));
                }
            }
        }
        Ok(outcomes)
    }

    fn leading(&self) -> bool {
        self.state.lock().unwrap().leading
    }

    fn leader_since(&self) -> DateTime<Utc> {
        self.state.lock().unwrap().leader_since
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_creates_intermediate_objects() {
        let agency = LocalAgency::new();
        let res = agency
            .transact(WriteTransaction::new().set("/a/b/c", json!(1)))
            .await
            .unwrap();
        assert!(res.applied());
        let snap = agency.read_tree("/a").await.unwrap();
        assert_eq!(snap.uint_at("/b/c"), Some(1));
    }

    #[tokio::test]
    async fn test_push_erase_increment() {
        let agency = LocalAgency::new();
        agency
            .transact(
                WriteTransaction::new()
                    .push("/list", json!("x"))
                    .push("/list", json!("y"))
                    .increment("/counter")
                    .increment_by("/counter", 5),
            )
            .await
            .unwrap();
        agency
            .transact(WriteTransaction::new().erase("/list", json!("x")))
            .await
            .unwrap();
        let snap = agency.read_tree("/").await.unwrap();
        assert_eq!(snap.string_array_at("/list"), Some(vec!["y".to_string()]));
        assert_eq!(snap.uint_at("/counter"), Some(6));
    }

    #[tokio::test]
    async fn test_precondition_rejection_is_atomic() {
        let agency = LocalAgency::new();
        agency
            .transact(WriteTransaction::new().set("/k", json!("v")))
            .await
            .unwrap();
        let res = agency
            .transact(
                WriteTransaction::new()
                    .set("/k", json!("w"))
                    .set("/other", json!(1))
                    .require_old("/k", json!("stale")),
            )
            .await
            .unwrap();
        assert!(res.accepted);
        assert_eq!(res.indices, vec![0]);
        let snap = agency.read_tree("/").await.unwrap();
        assert_eq!(snap.string_at("/k"), Some("v"));
        assert!(!snap.has("/other"));
    }

    #[tokio::test]
    async fn test_old_empty_and_is_array() {
        let agency = LocalAgency::new();
        let res = agency
            .transact(
                WriteTransaction::new()
                    .set("/fresh", json!(true))
                    .require_empty("/fresh"),
            )
            .await
            .unwrap();
        assert!(res.applied());
        // Now occupied, same guard fails.
        let res = agency
            .transact(
                WriteTransaction::new()
                    .set("/fresh", json!(false))
                    .require_empty("/fresh"),
            )
            .await
            .unwrap();
        assert!(!res.applied());

        agency
            .transact(WriteTransaction::new().push("/arr", json!(1)))
            .await
            .unwrap();
        let res = agency
            .transact(
                WriteTransaction::new()
                    .push("/arr", json!(2))
                    .require_array("/arr"),
            )
            .await
            .unwrap();
        assert!(res.applied());
    }

    #[tokio::test]
    async fn test_non_leader_writes_rejected() {
        let agency = LocalAgency::new();
        agency.set_leading(false);
        let res = agency
            .transact(WriteTransaction::new().set("/k", json!(1)))
            .await
            .unwrap();
        assert!(!res.accepted);
        agency.set_leading(true);
        let res = agency
            .transact(WriteTransaction::new().set("/k", json!(1)))
            .await
            .unwrap();
        assert!(res.applied());
    }

    #[tokio::test]
    async fn test_general_transaction_mixed_batch() {
        let agency = LocalAgency::new();
        let outcomes = agency
            .general_transaction(vec![
                AgencyTransaction::Write(
                    WriteTransaction::new().increment_by("/Sync/LatestID", 100),
                ),
                AgencyTransaction::Read(vec!["/Sync/LatestID".to_string()]),
            ])
            .await
            .unwrap();
        assert_eq!(outcomes[0], TransactionOutcome::Applied(1));
        assert_eq!(
            outcomes[1],
            TransactionOutcome::Read(vec![Some(json!(100))])
        );
    }

    #[tokio::test]
    async fn test_transient_tree_is_separate() {
        let agency = LocalAgency::new();
        agency
            .transient(WriteTransaction::new().set("/hb", json!("t1")))
            .await
            .unwrap();
        assert!(agency.read_tree("/").await.unwrap().lookup("/hb").is_none());
        assert_eq!(
            agency.read_transient("/").await.unwrap().string_at("/hb"),
            Some("t1")
        );
    }
}
