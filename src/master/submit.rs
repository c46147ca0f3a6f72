//! Structural submit commands
//!
//! Every command runs the same discipline: the configuration lock is already
//! held when `begin` is called, the precondition is checked against the
//! shared configuration, the mutation is proposed, and the lock is released
//! only once the proposal terminates. Failed preconditions are answered
//! right away and never reach the log.

use crate::common::validate_name;
use crate::master::configuration::SharedConfiguration;
use crate::master::context::{Completion, Outcome};
use crate::master::lock::LockGuard;
use crate::master::member::MemberRegistry;
use crate::master::operation::{
    NodeIdentity, SessionOperationId, StructuralOperation, SubmitResponse,
};
use std::collections::BTreeMap;
use tokio::sync::oneshot;

/// Lock serializing every configuration-changing proposal
pub const CONFIGURATION_RESOURCE: &str = "Configuration";

/// Capabilities the master lends to a command while it holds the lock
pub trait MasterContext {
    fn configuration(&self) -> SharedConfiguration;

    fn members(&self) -> &MemberRegistry;

    fn propose(&mut self, operation: StructuralOperation, completion: Completion);
}

/// Where the answer to a submit goes
#[derive(Debug)]
pub enum ReplyRoute {
    /// Through the member channel of the submitting node
    Remote(NodeIdentity),
    /// To a caller inside this process
    Local(oneshot::Sender<SubmitResponse>),
}

impl ReplyRoute {
    pub fn send(
        self,
        members: &MemberRegistry,
        operation_id: &SessionOperationId,
        response: SubmitResponse,
    ) {
        match self {
            ReplyRoute::Remote(node) => members.reply(&node, operation_id, response),
            ReplyRoute::Local(tx) => {
                // receiver dropped means the caller stopped waiting
                let _ = tx.send(response);
            }
        }
    }
}

/// A structural change request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitRequest {
    NodeJoin {
        identity: NodeIdentity,
    },
    CreateDatabase {
        name: String,
        database_type: String,
        configurations: BTreeMap<String, String>,
    },
    DropDatabase {
        name: String,
    },
}

impl SubmitRequest {
    /// Negative answer of the matching response type
    pub fn failure(&self, error: impl Into<String>) -> SubmitResponse {
        self.response(false, error.into())
    }

    fn response(&self, success: bool, error: String) -> SubmitResponse {
        match self {
            SubmitRequest::NodeJoin { .. } => SubmitResponse::NodeJoin { success, error },
            SubmitRequest::CreateDatabase { .. } => {
                SubmitResponse::CreateDatabase { success, error }
            }
            SubmitRequest::DropDatabase { .. } => SubmitResponse::DropDatabase { success, error },
        }
    }

    /// Run the command's critical section. `guard` is the configuration lock.
    pub fn begin(
        self,
        route: ReplyRoute,
        operation_id: SessionOperationId,
        guard: LockGuard,
        ctx: &mut dyn MasterContext,
    ) {
        let configuration = ctx.configuration();

        let rejection = match &self {
            SubmitRequest::NodeJoin { identity } => {
                if configuration.exists_node(identity) {
                    Some("Node Already Joined".to_string())
                } else if !configuration.can_add_node(identity) {
                    Some("Node Cannot Be Added".to_string())
                } else {
                    None
                }
            }
            SubmitRequest::CreateDatabase { name, .. } => match validate_name(name) {
                Err(e) => Some(e.to_string()),
                Ok(()) if configuration.exists_database(name) => {
                    Some("Database Already Exists".to_string())
                }
                Ok(()) => None,
            },
            SubmitRequest::DropDatabase { name } => {
                if configuration.exists_database(name) {
                    None
                } else {
                    Some("Database Does Not Exist".to_string())
                }
            }
        };

        if let Some(reason) = rejection {
            tracing::info!(%operation_id, request = ?self, "Submit rejected: {}", reason);
            drop(guard);
            route.send(ctx.members(), &operation_id, self.failure(reason));
            return;
        }

        let operation = self.operation(operation_id);
        let completion: Completion = Box::new(move |outcome, members| {
            guard.release();
            let response = match outcome {
                Outcome::Committed(_) => self.response(true, String::new()),
                Outcome::Abandoned(_) => self.failure("Operation timed out"),
                Outcome::Failed(reason) => self.failure(reason),
            };
            route.send(members, &operation_id, response);
        });
        ctx.propose(operation, completion);
    }

    fn operation(&self, operation_id: SessionOperationId) -> StructuralOperation {
        match self {
            SubmitRequest::NodeJoin { identity } => StructuralOperation::NodeJoin {
                identity: identity.clone(),
            },
            SubmitRequest::CreateDatabase {
                name,
                database_type,
                configurations,
            } => StructuralOperation::CreateDatabase {
                operation_id,
                name: name.clone(),
                database_type: database_type.clone(),
                configurations: configurations.clone(),
            },
            SubmitRequest::DropDatabase { name } => StructuralOperation::DropDatabase {
                operation_id,
                name: name.clone(),
            },
        }
    }
}
