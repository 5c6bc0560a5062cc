use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single agency write operation, addressed by path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Write a value, creating intermediate objects as needed.
    Set(Value),
    /// Remove the key.
    Delete,
    /// Append to an array, creating it if absent.
    Push(Value),
    /// Remove one matching value from an array.
    Erase(Value),
    /// Add `step` to an unsigned integer, treating an absent key as 0.
    Increment { step: u64 },
}

/// Compare-and-swap guard evaluated against the agency state before any
/// op of the same transaction is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Precondition {
    /// The value at the path equals the given one.
    Old(Value),
    /// The path is absent.
    OldEmpty,
    /// The value at the path is an array.
    IsArray,
}

/// An atomic set of ops guarded by preconditions. If any precondition
/// fails, no op is applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteTransaction {
    pub ops: Vec<(String, Op)>,
    pub preconditions: Vec<(String, Precondition)>,
}

impl WriteTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: Value) -> Self {
        self.ops.push((path.into(), Op::Set(value)));
        self
    }

    pub fn delete(mut self, path: impl Into<String>) -> Self {
        self.ops.push((path.into(), Op::Delete));
        self
    }

    pub fn push(mut self, path: impl Into<String>, value: Value) -> Self {
        self.ops.push((path.into(), Op::Push(value)));
        self
    }

    pub fn erase(mut self, path: impl Into<String>, value: Value) -> Self {
        self.ops.push((path.into(), Op::Erase(value)));
        self
    }

    pub fn increment(mut self, path: impl Into<String>) -> Self {
        self.ops.push((path.into(), Op::Increment { step: 1 }));
        self
    }

    pub fn increment_by(mut self, path: impl Into<String>, step: u64) -> Self {
        self.ops.push((path.into(), Op::Increment { step }));
        self
    }

    pub fn require_old(mut self, path: impl Into<String>, value: Value) -> Self {
        self.preconditions.push((path.into(), Precondition::Old(value)));
        self
    }

    pub fn require_empty(mut self, path: impl Into<String>) -> Self {
        self.preconditions.push((path.into(), Precondition::OldEmpty));
        self
    }

    pub fn require_array(mut self, path: impl Into<String>) -> Self {
        self.preconditions.push((path.into(), Precondition::IsArray));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Result of a guarded write. `indices[i] == 0` means transaction `i` was
/// rejected by a precondition; a non-zero value is its commit index.
/// `accepted == false` means the agency refused the request outright
/// (e.g. it is not the leader).
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    pub accepted: bool,
    pub indices: Vec<u64>,
}

impl WriteResult {
    pub fn rejected() -> Self {
        Self {
            accepted: false,
            indices: Vec::new(),
        }
    }

    /// True when the transaction was both accepted and committed.
    pub fn applied(&self) -> bool {
        self.accepted && self.indices.first().is_some_and(|i| *i != 0)
    }
}

/// One entry of an ordered batch: either a guarded write or a read of a
/// list of paths. Entries succeed or fail independently.
#[derive(Debug, Clone)]
pub enum AgencyTransaction {
    Write(WriteTransaction),
    Read(Vec<String>),
}

/// Per-entry outcome of a `general_transaction` batch.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    Applied(u64),
    PreconditionFailed,
    /// Values at the requested paths, in request order; `None` for
    /// absent paths.
    Read(Vec<Option<Value>>),
}

impl TransactionOutcome {
    pub fn read_values(&self) -> Option<&Vec<Option<Value>>> {
        match self {
            TransactionOutcome::Read(values) => Some(values),
            _ => None,
        }
    }
}
