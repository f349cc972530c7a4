//! Custom error types for the shipping agent.

use crate::store::StoreError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShipError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not a backup key: {0}")]
    NotABackupKey(String),

    #[error("Failed to parse '{0}'. Expected format: YYYYMMDD_HHMMSS (e.g. 20210824_072543)")]
    InvalidTimestamp(String),

    #[error("Invalid backup manifest {key}: {reason}")]
    InvalidManifest { key: String, reason: String },

    #[error("Object store error: {0}")]
    Store(#[from] StoreError),

    #[error(
        "Can only ship parts up to {max} bytes. \
         Current shipment would require parts with a size of {required} bytes."
    )]
    ChunkTooLarge { required: u64, max: u64 },

    #[error("Listing objects of remote {remote} timed out after {timeout:?}")]
    ListingTimeout { remote: String, timeout: Duration },

    #[error("Snapshot {0} is already being shipped")]
    AlreadyShipping(String),

    #[error("Daemon error: {0}")]
    Daemon(String),
}

impl ShipError {
    /// Store-level not-found, which idempotent operations treat as success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ShipError::Store(e) if e.is_not_found())
    }
}

pub type Result<T> = std::result::Result<T, ShipError>;
