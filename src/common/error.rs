//! Error types for the structural master

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Operation Log Errors ===
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    // === Codec Errors ===
    #[error("Unknown type id: {0}")]
    UnknownTypeId(u32),

    #[error("Codec error: {0}")]
    Codec(String),

    // === Coordination Errors ===
    #[error("Unknown member: {0}")]
    UnknownMember(String),

    #[error("Channel to {node} closed")]
    ChannelClosed { node: String },

    #[error("Resend to {node} failed at log id {log_id}: {reason}")]
    ResendFailed {
        node: String,
        log_id: u64,
        reason: String,
    },

    #[error("Master is shut down")]
    Shutdown,

    // === Lock Errors ===
    #[error("Timed out acquiring lock on {0}")]
    LockTimeout(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ChannelClosed { .. } | Error::LockTimeout(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
