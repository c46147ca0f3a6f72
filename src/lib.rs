//! # structural-master
//!
//! Master-side coordinator for cluster-structural changes:
//! - Single serialized loop owning all coordination state
//! - Append-only operation log with monotonic ids
//! - Quorum commit with confirm fan-out
//! - Bounded retry and explicit abandonment of stuck proposals
//! - Catch-up of lagging members by log replay or full configuration
//!
//! ## Architecture
//!
//! ```text
//! submit ──► ┌──────────────────────────────┐
//!            │ Structural master loop       │
//!   ack ───► │  lock ► validate ► propose   │──► operation log
//!            │  quorum ► confirm ► reply    │
//!            └──────────────┬───────────────┘
//!                           │ propagate / confirm
//!         ┌─────────────────┼─────────────────┐
//!     ┌───▼────┐        ┌───▼────┐        ┌───▼────┐
//!     │ Node 1 │        │ Node 2 │        │ Node 3 │
//!     └────────┘        └────────┘        └────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use structural_master::master::{ChannelMember, NodeIdentity, SharedConfiguration};
//! use structural_master::{MasterConfig, StructuralMaster};
//!
//! # async fn run() -> structural_master::Result<()> {
//! let master = StructuralMaster::open(MasterConfig::default(), SharedConfiguration::new())?;
//! let (member, _inbox) = ChannelMember::new(NodeIdentity::new("node-2"));
//! master.connected(Arc::new(member))?;
//! let reply = master.join(NodeIdentity::new("node-3"))?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod master;
pub mod oplog;

// Re-export commonly used types
pub use common::{Error, MasterConfig, Result};
pub use master::StructuralMaster;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
