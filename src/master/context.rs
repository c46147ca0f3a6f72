//! Per-operation quorum and timeout tracking
//!
//! A `RequestContext` lives only while its operation is proposed. It is owned
//! by the master's serialized loop and never shared across tasks.

use crate::master::member::MemberRegistry;
use crate::master::operation::{NodeIdentity, StructuralOperation};
use crate::oplog::LogId;
use std::collections::HashSet;

/// Terminal result of a proposed operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Quorum reached, confirm sent to every member
    Committed(LogId),
    /// Retry budget exhausted without quorum
    Abandoned(LogId),
    /// Never made it into the log
    Failed(String),
}

/// Runs exactly once, on the serialized loop, when an operation terminates
pub type Completion = Box<dyn FnOnce(Outcome, &MemberRegistry) + Send + 'static>;

pub struct RequestContext {
    operation: StructuralOperation,
    quorum: usize,
    acks: HashSet<NodeIdentity>,
    reached: bool,
    ticks: u32,
    max_retries: u32,
    completion: Option<Completion>,
}

impl RequestContext {
    pub fn new(
        operation: StructuralOperation,
        quorum: usize,
        max_retries: u32,
        completion: Completion,
    ) -> Self {
        Self {
            operation,
            quorum,
            acks: HashSet::new(),
            reached: false,
            ticks: 0,
            max_retries,
            completion: Some(completion),
        }
    }

    pub fn operation(&self) -> &StructuralOperation {
        &self.operation
    }

    /// Register an acknowledgment.
    ///
    /// Returns true only on the call at which the number of distinct
    /// acknowledging nodes first reaches the quorum.
    pub fn ack(&mut self, node: NodeIdentity) -> bool {
        self.acks.insert(node);
        if !self.reached && self.acks.len() >= self.quorum {
            self.reached = true;
            return true;
        }
        false
    }

    pub fn has_acked(&self, node: &NodeIdentity) -> bool {
        self.acks.contains(node)
    }

    pub fn ack_count(&self) -> usize {
        self.acks.len()
    }

    /// Count one timeout tick; true once the retry budget is spent
    pub fn timeout(&mut self) -> bool {
        self.ticks += 1;
        self.ticks >= self.max_retries
    }

    /// Run the completion with the terminal outcome
    pub fn finish(mut self, outcome: Outcome, members: &MemberRegistry) {
        if let Some(completion) = self.completion.take() {
            completion(outcome, members);
        }
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("operation", &self.operation)
            .field("quorum", &self.quorum)
            .field("acks", &self.acks.len())
            .field("ticks", &self.ticks)
            .finish()
    }
}
