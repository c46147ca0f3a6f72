//! Structural master
//!
//! The master is responsible for:
//! - Accepting structural submits (node join, database create/drop)
//! - Validating them under the configuration lock
//! - Proposing them through the operation log
//! - Tracking acknowledgments until quorum, then confirming to all members
//! - Catching up lagging members by replay or full configuration

pub mod configuration;
pub mod context;
pub mod lock;
pub mod member;
pub mod operation;
pub mod server;
pub mod submit;

pub use configuration::{ConfigurationStore, MemoryConfigurationStore, SharedConfiguration};
pub use context::{Outcome, RequestContext};
pub use lock::{LockGuard, LockManager, MemoryLockManager};
pub use member::{ChannelMember, MemberChannel, MemberMessage, MemberRegistry};
pub use operation::{NodeIdentity, SessionOperationId, StructuralOperation, SubmitResponse};
pub use server::{MasterStatus, StructuralMaster};
pub use submit::{SubmitRequest, CONFIGURATION_RESOURCE};
