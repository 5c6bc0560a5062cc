use crate::agency::{Agency, AgencyTransaction, TransactionOutcome, WriteTransaction};
use crate::error::{Result, SupervisionError};
use crate::paths;

/// Number of IDs claimed per agency round-trip.
const BATCH: u64 = 10_000;

/// Batched monotonic job-ID allocator.
///
/// One guarded increment of `/Sync/LatestID` followed by a read of the new
/// top claims the half-open range `(top - BATCH, top]` for this process.
#[derive(Debug, Default)]
pub struct JobIds {
    next: u64,
    max: u64,
}

impl JobIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the owned range is used up (or was never claimed).
    pub fn exhausted(&self) -> bool {
        self.next == 0 || self.next == self.max
    }

    /// Claim the next batch from the agency.
    pub async fn refill(&mut self, agent: &dyn Agency, prefix: &str) -> Result<()> {
        let path = paths::absolute(prefix, paths::SYNC_LATEST_ID);
        let outcomes = agent
            .general_transaction(vec![
                AgencyTransaction::Write(WriteTransaction::new().increment_by(&path, BATCH)),
                AgencyTransaction::Read(vec![path.clone()]),
            ])
            .await?;

        let top = outcomes
            .get(1)
            .and_then(TransactionOutcome::read_values)
            .and_then(|values| values.first())
            .and_then(|value| value.as_ref())
            .and_then(|value| value.as_u64())
            .ok_or_else(|| {
                SupervisionError::Agency(format!("failed to acquire job IDs at {}", path))
            })?;

        self.max = top;
        self.next = top - BATCH;
        tracing::debug!(from = self.next + 1, to = self.max, "Claimed job ID range");
        Ok(())
    }

    /// Next job ID as the decimal string stored in the agency.
    pub fn take(&mut self) -> String {
        self.next += 1;
        self.next.to_string()
    }
}
