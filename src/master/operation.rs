//! Structural operations and submit responses
//!
//! Every operation and response travels as a frame:
//! `[TYPE_ID: u32 BE][PAYLOAD: bincode]`. The type id is stable across
//! versions and is what receivers dispatch on.

use crate::common::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const NODE_JOIN_TYPE: u32 = 1;
pub const CREATE_DATABASE_TYPE: u32 = 2;
pub const DROP_DATABASE_TYPE: u32 = 3;

pub const CREATE_DATABASE_RESPONSE_TYPE: u32 = 101;
pub const DROP_DATABASE_RESPONSE_TYPE: u32 = 102;
pub const NODE_JOIN_RESPONSE_TYPE: u32 = 103;

/// Identity of a cluster node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIdentity(String);

impl NodeIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation token matching a submit to its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionOperationId(uuid::Uuid);

impl SessionOperationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionOperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionOperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A cluster-structural mutation replicated through the operation log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructuralOperation {
    NodeJoin {
        identity: NodeIdentity,
    },
    CreateDatabase {
        operation_id: SessionOperationId,
        name: String,
        database_type: String,
        configurations: BTreeMap<String, String>,
    },
    DropDatabase {
        operation_id: SessionOperationId,
        name: String,
    },
}

impl StructuralOperation {
    pub fn type_id(&self) -> u32 {
        match self {
            StructuralOperation::NodeJoin { .. } => NODE_JOIN_TYPE,
            StructuralOperation::CreateDatabase { .. } => CREATE_DATABASE_TYPE,
            StructuralOperation::DropDatabase { .. } => DROP_DATABASE_TYPE,
        }
    }

    /// Serialize the variant body, without the type id
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let payload = match self {
            StructuralOperation::NodeJoin { identity } => bincode::serialize(identity)?,
            StructuralOperation::CreateDatabase {
                operation_id,
                name,
                database_type,
                configurations,
            } => bincode::serialize(&(operation_id, name, database_type, configurations))?,
            StructuralOperation::DropDatabase { operation_id, name } => {
                bincode::serialize(&(operation_id, name))?
            }
        };
        Ok(payload)
    }

    /// Rebuild a variant from its type id and body
    pub fn decode_payload(type_id: u32, payload: &[u8]) -> Result<Self> {
        let op = match type_id {
            NODE_JOIN_TYPE => StructuralOperation::NodeJoin {
                identity: bincode::deserialize(payload)?,
            },
            CREATE_DATABASE_TYPE => {
                let (operation_id, name, database_type, configurations): (
                    SessionOperationId,
                    String,
                    String,
                    BTreeMap<String, String>,
                ) = bincode::deserialize(payload)?;
                StructuralOperation::CreateDatabase {
                    operation_id,
                    name,
                    database_type,
                    configurations,
                }
            }
            DROP_DATABASE_TYPE => {
                let (operation_id, name): (SessionOperationId, String) =
                    bincode::deserialize(payload)?;
                StructuralOperation::DropDatabase { operation_id, name }
            }
            other => return Err(Error::UnknownTypeId(other)),
        };
        Ok(op)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_frame(self.type_id(), &self.encode_payload()?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (type_id, payload) = decode_frame(bytes)?;
        Self::decode_payload(type_id, payload)
    }
}

impl fmt::Display for StructuralOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructuralOperation::NodeJoin { identity } => write!(f, "node-join({})", identity),
            StructuralOperation::CreateDatabase { name, .. } => {
                write!(f, "create-database({})", name)
            }
            StructuralOperation::DropDatabase { name, .. } => write!(f, "drop-database({})", name),
        }
    }
}

/// Reply to a structural submit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitResponse {
    NodeJoin { success: bool, error: String },
    CreateDatabase { success: bool, error: String },
    DropDatabase { success: bool, error: String },
}

impl SubmitResponse {
    pub fn type_id(&self) -> u32 {
        match self {
            SubmitResponse::CreateDatabase { .. } => CREATE_DATABASE_RESPONSE_TYPE,
            SubmitResponse::DropDatabase { .. } => DROP_DATABASE_RESPONSE_TYPE,
            SubmitResponse::NodeJoin { .. } => NODE_JOIN_RESPONSE_TYPE,
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            SubmitResponse::NodeJoin { success, .. }
            | SubmitResponse::CreateDatabase { success, .. }
            | SubmitResponse::DropDatabase { success, .. } => *success,
        }
    }

    pub fn error(&self) -> &str {
        match self {
            SubmitResponse::NodeJoin { error, .. }
            | SubmitResponse::CreateDatabase { error, .. }
            | SubmitResponse::DropDatabase { error, .. } => error,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = match self {
            SubmitResponse::NodeJoin { success, error }
            | SubmitResponse::CreateDatabase { success, error }
            | SubmitResponse::DropDatabase { success, error } => {
                bincode::serialize(&(success, error))?
            }
        };
        encode_frame(self.type_id(), &body)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (type_id, payload) = decode_frame(bytes)?;
        let (success, error): (bool, String) = match type_id {
            CREATE_DATABASE_RESPONSE_TYPE | DROP_DATABASE_RESPONSE_TYPE
            | NODE_JOIN_RESPONSE_TYPE => bincode::deserialize(payload)?,
            other => return Err(Error::UnknownTypeId(other)),
        };
        Ok(match type_id {
            CREATE_DATABASE_RESPONSE_TYPE => SubmitResponse::CreateDatabase { success, error },
            DROP_DATABASE_RESPONSE_TYPE => SubmitResponse::DropDatabase { success, error },
            _ => SubmitResponse::NodeJoin { success, error },
        })
    }
}

fn encode_frame(type_id: u32, payload: &[u8]) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(type_id);
    buf.put_slice(payload);
    Ok(buf.to_vec())
}

fn decode_frame(mut bytes: &[u8]) -> Result<(u32, &[u8])> {
    if bytes.remaining() < 4 {
        return Err(Error::Codec(format!(
            "frame too short: {} bytes",
            bytes.len()
        )));
    }
    let type_id = bytes.get_u32();
    Ok((type_id, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_ids_are_distinct() {
        let ops = [
            StructuralOperation::NodeJoin {
                identity: NodeIdentity::new("n1"),
            },
            StructuralOperation::CreateDatabase {
                operation_id: SessionOperationId::new(),
                name: "orders".into(),
                database_type: "plocal".into(),
                configurations: BTreeMap::new(),
            },
            StructuralOperation::DropDatabase {
                operation_id: SessionOperationId::new(),
                name: "orders".into(),
            },
        ];
        let ids: Vec<u32> = ops.iter().map(|op| op.type_id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_create_database_frame() {
        let mut configurations = BTreeMap::new();
        configurations.insert("replicas".to_string(), "3".to_string());
        let op = StructuralOperation::CreateDatabase {
            operation_id: SessionOperationId::new(),
            name: "orders".into(),
            database_type: "plocal".into(),
            configurations,
        };

        let bytes = op.encode().unwrap();
        assert_eq!(&bytes[..4], &CREATE_DATABASE_TYPE.to_be_bytes());
        assert_eq!(StructuralOperation::decode(&bytes).unwrap(), op);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut bytes = 77u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"junk");
        assert!(matches!(
            StructuralOperation::decode(&bytes),
            Err(Error::UnknownTypeId(77))
        ));
        assert!(matches!(
            SubmitResponse::decode(&bytes),
            Err(Error::UnknownTypeId(77))
        ));
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(matches!(
            StructuralOperation::decode(&[0, 1]),
            Err(Error::Codec(_))
        ));
    }

    #[test]
    fn test_response_keeps_variant() {
        let resp = SubmitResponse::CreateDatabase {
            success: false,
            error: "Database Already Exists".into(),
        };
        let decoded = SubmitResponse::decode(&resp.encode().unwrap()).unwrap();
        assert_eq!(decoded, resp);
        assert!(!decoded.is_success());
        assert_eq!(decoded.error(), "Database Already Exists");
    }
}
