//! Structural configuration: cluster members and databases
//!
//! The master validates submit preconditions against the shared
//! configuration and applies each committed operation to it.

use crate::common::Result;
use crate::master::operation::{NodeIdentity, StructuralOperation};
use crate::oplog::LogId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

/// Database entry of the shared configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfiguration {
    pub database_type: String,
    pub configurations: BTreeMap<String, String>,
}

/// Cluster-wide structural state replicated to every member
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedConfiguration {
    nodes: BTreeSet<NodeIdentity>,
    databases: BTreeMap<String, DatabaseConfiguration>,
    /// Upper bound on cluster size, unbounded when absent
    #[serde(default)]
    max_nodes: Option<usize>,
}

impl SharedConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = Some(max_nodes);
        self
    }

    pub fn exists_node(&self, identity: &NodeIdentity) -> bool {
        self.nodes.contains(identity)
    }

    pub fn can_add_node(&self, identity: &NodeIdentity) -> bool {
        if self.exists_node(identity) {
            return false;
        }
        self.max_nodes.map_or(true, |max| self.nodes.len() < max)
    }

    pub fn exists_database(&self, name: &str) -> bool {
        self.databases.contains_key(name)
    }

    pub fn database(&self, name: &str) -> Option<&DatabaseConfiguration> {
        self.databases.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeIdentity> {
        self.nodes.iter()
    }

    pub fn database_names(&self) -> impl Iterator<Item = &str> {
        self.databases.keys().map(String::as_str)
    }

    /// Apply one operation; re-applying the same operation is a no-op
    pub fn apply(&mut self, operation: &StructuralOperation) {
        match operation {
            StructuralOperation::NodeJoin { identity } => {
                self.nodes.insert(identity.clone());
            }
            StructuralOperation::CreateDatabase {
                name,
                database_type,
                configurations,
                ..
            } => {
                self.databases
                    .entry(name.clone())
                    .or_insert_with(|| DatabaseConfiguration {
                        database_type: database_type.clone(),
                        configurations: configurations.clone(),
                    });
            }
            StructuralOperation::DropDatabase { name, .. } => {
                self.databases.remove(name);
            }
        }
    }
}

/// Store holding the structural configuration and the id it reflects
pub trait ConfigurationStore: Send + Sync {
    /// Snapshot of the current configuration
    fn shared_configuration(&self) -> SharedConfiguration;

    /// Id of the last operation applied
    fn last_update_id(&self) -> Option<LogId>;

    /// Apply a committed operation; ids at or below the last applied one are skipped
    fn apply(&self, id: LogId, operation: &StructuralOperation) -> Result<()>;
}

/// Volatile configuration store
#[derive(Default)]
pub struct MemoryConfigurationStore {
    state: RwLock<(SharedConfiguration, Option<LogId>)>,
}

impl MemoryConfigurationStore {
    pub fn new(initial: SharedConfiguration) -> Self {
        Self {
            state: RwLock::new((initial, None)),
        }
    }
}

impl ConfigurationStore for MemoryConfigurationStore {
    fn shared_configuration(&self) -> SharedConfiguration {
        self.state.read().unwrap_or_else(|e| e.into_inner()).0.clone()
    }

    fn last_update_id(&self) -> Option<LogId> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).1
    }

    fn apply(&self, id: LogId, operation: &StructuralOperation) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.1.is_some_and(|last| id <= last) {
            tracing::debug!(log_id = %id, "Skipping already applied operation");
            return Ok(());
        }
        state.0.apply(operation);
        state.1 = Some(id);
        tracing::debug!(log_id = %id, op = %operation, "Applied structural operation");
        Ok(())
    }
}
