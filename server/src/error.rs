//! Error taxonomy for the capture-to-storage data path.
//!
//! Packet- and flow-level variants are counted by their owning component and
//! never propagate; only [`CoreError::PersistenceFatal`], a startup
//! [`CoreError::ConfigInvalid`], and an exhausted
//! [`CoreError::InterfaceUnavailable`] reach `main` and map to an exit code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("interface unavailable: {0}")]
    InterfaceUnavailable(String),

    #[error("frame too short to be a valid packet ({len} bytes)")]
    MalformedShort { len: usize },

    #[error("packet rejected by parser: {0}")]
    ParseRejected(String),

    #[error("enrichment source unavailable: {0}")]
    EnrichmentUnavailable(String),

    #[error("persistence write failed, will retry: {0}")]
    PersistenceTransient(#[from] sqlx::Error),

    #[error("persistence unrecoverable: {0}")]
    PersistenceFatal(String),

    #[error("queue overflow in {stage}")]
    QueueOverflow { stage: &'static str },

    #[error("invalid configuration key `{key}`: {reason}")]
    ConfigInvalid { key: String, reason: String },
}

/// Process exit codes, per the external interface contract.
pub mod exit_code {
    pub const CLEAN: i32 = 0;
    pub const CONFIG_INVALID: i32 = 2;
    pub const INTERFACE_UNAVAILABLE: i32 = 3;
    pub const PERSISTENCE_UNRECOVERABLE: i32 = 4;
}
