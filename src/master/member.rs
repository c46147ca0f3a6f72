//! Connected members and the channel capability used to reach them

use crate::common::{Error, Result};
use crate::master::configuration::SharedConfiguration;
use crate::master::operation::{
    NodeIdentity, SessionOperationId, StructuralOperation, SubmitResponse,
};
use crate::oplog::LogId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Messages the master sends to a member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MemberMessage {
    Propagate {
        id: LogId,
        operation: StructuralOperation,
    },
    Confirm {
        id: LogId,
    },
    Reply {
        operation_id: SessionOperationId,
        response: SubmitResponse,
    },
    FullConfiguration {
        last_update_id: Option<LogId>,
        configuration: SharedConfiguration,
    },
}

/// Non-blocking capability to reach one peer.
///
/// Delivery reliability belongs to the implementation; an `Err` means the
/// message could not even be handed to the transport.
pub trait MemberChannel: Send + Sync {
    fn identity(&self) -> &NodeIdentity;

    fn send(&self, message: MemberMessage) -> Result<()>;

    fn propagate(&self, id: LogId, operation: &StructuralOperation) -> Result<()> {
        self.send(MemberMessage::Propagate {
            id,
            operation: operation.clone(),
        })
    }

    fn confirm(&self, id: LogId) -> Result<()> {
        self.send(MemberMessage::Confirm { id })
    }

    fn reply(&self, operation_id: &SessionOperationId, response: SubmitResponse) -> Result<()> {
        self.send(MemberMessage::Reply {
            operation_id: *operation_id,
            response,
        })
    }
}

/// In-process member fed through an unbounded tokio channel
pub struct ChannelMember {
    identity: NodeIdentity,
    tx: mpsc::UnboundedSender<MemberMessage>,
}

impl ChannelMember {
    pub fn new(identity: NodeIdentity) -> (Self, mpsc::UnboundedReceiver<MemberMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { identity, tx }, rx)
    }
}

impl MemberChannel for ChannelMember {
    fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    fn send(&self, message: MemberMessage) -> Result<()> {
        self.tx.send(message).map_err(|_| Error::ChannelClosed {
            node: self.identity.to_string(),
        })
    }
}

/// Connected members keyed by identity
#[derive(Default)]
pub struct MemberRegistry {
    members: HashMap<NodeIdentity, Arc<dyn MemberChannel>>,
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a member, replacing any previous channel for the identity
    pub fn connect(&mut self, member: Arc<dyn MemberChannel>) {
        let identity = member.identity().clone();
        if self.members.insert(identity.clone(), member).is_some() {
            tracing::info!(node = %identity, "Member reconnected");
        } else {
            tracing::info!(node = %identity, "Member connected");
        }
    }

    pub fn get(&self, identity: &NodeIdentity) -> Option<Arc<dyn MemberChannel>> {
        self.members.get(identity).cloned()
    }

    pub fn identities(&self) -> Vec<NodeIdentity> {
        let mut ids: Vec<NodeIdentity> = self.members.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Propagate to every member accepted by `filter`
    pub fn propagate_where<F>(&self, id: LogId, operation: &StructuralOperation, filter: F)
    where
        F: Fn(&NodeIdentity) -> bool,
    {
        for (identity, member) in &self.members {
            if !filter(identity) {
                continue;
            }
            if let Err(e) = member.propagate(id, operation) {
                tracing::warn!(node = %identity, log_id = %id, "Propagate failed: {}", e);
            }
        }
    }

    pub fn propagate_all(&self, id: LogId, operation: &StructuralOperation) {
        self.propagate_where(id, operation, |_| true);
    }

    pub fn confirm_all(&self, id: LogId) {
        for (identity, member) in &self.members {
            if let Err(e) = member.confirm(id) {
                tracing::warn!(node = %identity, log_id = %id, "Confirm failed: {}", e);
            }
        }
    }

    /// Reply to a remote requester, if it is still connected
    pub fn reply(
        &self,
        requester: &NodeIdentity,
        operation_id: &SessionOperationId,
        response: SubmitResponse,
    ) {
        match self.members.get(requester) {
            Some(member) => {
                if let Err(e) = member.reply(operation_id, response) {
                    tracing::warn!(node = %requester, %operation_id, "Reply failed: {}", e);
                }
            }
            None => {
                tracing::warn!(node = %requester, %operation_id, "Reply to unknown member dropped");
            }
        }
    }
}
