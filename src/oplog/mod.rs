//! Operation log: append-only, totally ordered record of proposed
//! structural operations.
//!
//! The master appends every proposal here before propagating it, and replays
//! ranges of it to members that missed earlier propagations.

pub mod memory;
pub mod wal;

pub use memory::MemoryOperationLog;
pub use wal::{FileOperationLog, ReplayOutcome};

use crate::common::Result;
use crate::master::operation::StructuralOperation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier assigned by the log on append; strictly increasing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogId(u64);

impl LogId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> LogId {
        LogId(self.0 + 1)
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable (id, operation) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: LogId,
    pub operation: StructuralOperation,
}

/// Durable, totally ordered log of structural operations
pub trait OperationLog: Send + Sync {
    /// Append an operation, returning its freshly assigned id
    fn append(&self, operation: &StructuralOperation) -> Result<LogId>;

    /// Entries with `from <= id <= to`, in ascending order
    fn iterate(&self, from: LogId, to: LogId) -> Result<Vec<LogEntry>>;

    /// Id of the last entry known to be durable
    fn last_persistent_id(&self) -> Option<LogId>;

    /// Push written entries to stable storage. Logs that are durable on
    /// append have nothing to do.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Slice of `entries` (sorted by id) falling in the inclusive range
pub(crate) fn range_of(entries: &[LogEntry], from: LogId, to: LogId) -> &[LogEntry] {
    if from > to {
        return &[];
    }
    let start = entries.partition_point(|e| e.id < from);
    let end = entries.partition_point(|e| e.id <= to);
    &entries[start..end]
}
