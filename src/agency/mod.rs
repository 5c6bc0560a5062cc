pub mod local;
pub mod transaction;

pub use local::LocalAgency;
pub use transaction::{
    AgencyTransaction, Op, Precondition, TransactionOutcome, WriteResult, WriteTransaction,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::snapshot::Snapshot;

/// The agency seam consumed by the supervisor.
///
/// The agency is a strongly consistent hierarchical key-value tree with
/// transactional compare-and-swap writes; it linearizes all transactions,
/// so two supervisor incarnations racing on the same job will see exactly
/// one of them succeed. A volatile transient tree absorbs heartbeat-scale
/// churn without being replicated.
#[async_trait]
pub trait Agency: Send + Sync {
    /// A consistent snapshot of the replicated subtree under `prefix`.
    async fn read_tree(&self, prefix: &str) -> Result<Snapshot>;

    /// A snapshot of the transient subtree under `prefix`.
    async fn read_transient(&self, prefix: &str) -> Result<Snapshot>;

    /// Atomically apply a guarded transaction to the replicated tree.
    async fn transact(&self, tx: WriteTransaction) -> Result<WriteResult>;

    /// Apply a transaction to the volatile transient tree.
    async fn transient(&self, tx: WriteTransaction) -> Result<WriteResult>;

    /// Convenience write without preconditions.
    async fn single_write(&self, tx: WriteTransaction) -> Result<WriteResult> {
        self.transact(WriteTransaction {
            ops: tx.ops,
            preconditions: Vec::new(),
        })
        .await
    }

    /// Ordered list of independent transactions; per-entry success.
    async fn general_transaction(
        &self,
        batch: Vec<AgencyTransaction>,
    ) -> Result<Vec<TransactionOutcome>>;

    /// Whether this process currently holds agency leadership.
    fn leading(&self) -> bool;

    /// When the current leadership term was acquired.
    fn leader_since(&self) -> DateTime<Utc>;
}
