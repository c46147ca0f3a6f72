//! In-memory operation log

use super::{range_of, LogEntry, LogId, OperationLog};
use crate::common::Result;
use crate::master::operation::StructuralOperation;
use std::sync::Mutex;

/// Volatile log, every appended entry counts as persistent
#[derive(Default)]
pub struct MemoryOperationLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryOperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OperationLog for MemoryOperationLog {
    fn append(&self, operation: &StructuralOperation) -> Result<LogId> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let id = entries
            .last()
            .map(|e| e.id.next())
            .unwrap_or(LogId::new(0));
        entries.push(LogEntry {
            id,
            operation: operation.clone(),
        });
        Ok(id)
    }

    fn iterate(&self, from: LogId, to: LogId) -> Result<Vec<LogEntry>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(range_of(&entries, from, to).to_vec())
    }

    fn last_persistent_id(&self) -> Option<LogId> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.last().map(|e| e.id)
    }
}
