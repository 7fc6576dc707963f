use thiserror::Error;

use crate::types::TransferStatus;

pub type FerryResult<T> = Result<T, FerryError>;

#[derive(Debug, Error)]
pub enum FerryError {
    #[error("source not found: {0}")]
    SourceNotFound(String),

    #[error("source not readable: {path}: {reason}")]
    SourceUnreadable { path: String, reason: String },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("transform error: {0}")]
    Transform(String),

    #[error("state store error: {0}")]
    StateStore(String),

    #[error("illegal status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: TransferStatus,
        to: TransferStatus,
    },

    #[error("unknown transfer: {0}")]
    UnknownTransfer(String),

    #[error("cannot resume {transfer_id}: {reason}")]
    CannotResume { transfer_id: String, reason: String },

    #[error("encryption requested but no transfer key is configured")]
    MissingKey,

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FerryError {
    /// True for digest mismatches (as opposed to I/O or transform failures).
    pub fn is_integrity(&self) -> bool {
        matches!(self, FerryError::Integrity { .. })
    }
}
