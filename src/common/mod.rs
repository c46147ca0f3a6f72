//! Common utilities and types shared across the crate

pub mod config;
pub mod error;
pub mod utils;

pub use config::{MasterConfig, WalSyncPolicy};
pub use error::{Error, Result};
pub use utils::{crc32, retry_with_backoff, validate_name};
