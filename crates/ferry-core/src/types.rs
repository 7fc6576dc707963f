use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default transfer unit: 1 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Lifecycle status of a whole transfer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Preparing,
    Transferring,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    /// Completed and Cancelled sessions accept no further mutation.
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Cancelled)
    }

    pub fn can_resume(self) -> bool {
        matches!(self, TransferStatus::Paused | TransferStatus::Failed)
    }

    /// Whether the status machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match self {
            Pending => matches!(next, Preparing | Failed | Cancelled),
            Preparing => matches!(next, Transferring | Paused | Failed | Cancelled),
            Transferring => matches!(next, Paused | Completed | Failed | Cancelled),
            Paused => matches!(next, Preparing | Cancelled),
            Failed => matches!(next, Preparing | Cancelled),
            Completed | Cancelled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Preparing => "preparing",
            TransferStatus::Transferring => "transferring",
            TransferStatus::Paused => "paused",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Transferring,
    Verifying,
    Completed,
    Failed,
}

impl ChunkStatus {
    /// A chunk holding a transfer slot right now
    pub fn is_in_flight(self) -> bool {
        matches!(self, ChunkStatus::Transferring | ChunkStatus::Verifying)
    }
}

/// Per-transfer options passed to `start_transfer`.
///
/// Also used as the `[transfer]` section of `ferry.toml`, where it supplies
/// the defaults the CLI starts from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    /// Explicit transfer id (a UUIDv4 is generated when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
    /// Size of each transfer unit in bytes (default: 1 MiB)
    pub chunk_size: u64,
    /// Per-session parallelism (default: 4)
    pub max_concurrent_chunks: usize,
    /// Retry budget per chunk (default: 3)
    pub max_retry_attempts: u32,
    /// Compress chunks with zstd before writing
    pub enable_compression: bool,
    /// Encrypt chunks (after compression) with the manager's transfer key
    pub enable_encryption: bool,
    /// Compute and check chunk and file digests
    pub verify_integrity: bool,
    /// zstd level used when compression is enabled (default: 3)
    pub compression_level: i32,
    /// Free-form caller metadata, persisted with the session
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            transfer_id: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_chunks: 4,
            max_retry_attempts: 3,
            enable_compression: false,
            enable_encryption: false,
            verify_integrity: true,
            compression_level: 3,
            metadata: BTreeMap::new(),
        }
    }
}

impl TransferOptions {
    /// True when any chunk transform (compression or encryption) is active.
    pub fn transforms_enabled(&self) -> bool {
        self.enable_compression || self.enable_encryption
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_reject_everything() {
        use TransferStatus::*;
        for next in [
            Pending,
            Preparing,
            Transferring,
            Paused,
            Completed,
            Failed,
            Cancelled,
        ] {
            assert!(!Completed.can_transition_to(next));
            assert!(!Cancelled.can_transition_to(next));
        }
    }

    #[test]
    fn resume_cycles_are_allowed() {
        use TransferStatus::*;
        assert!(Transferring.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Preparing));
        assert!(Failed.can_transition_to(Preparing));
        assert!(Preparing.can_transition_to(Transferring));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&TransferStatus::Transferring).unwrap();
        assert_eq!(json, "\"transferring\"");
        let back: ChunkStatus = serde_json::from_str("\"verifying\"").unwrap();
        assert_eq!(back, ChunkStatus::Verifying);
    }

    #[test]
    fn default_options() {
        let opts = TransferOptions::default();
        assert_eq!(opts.chunk_size, 1024 * 1024);
        assert_eq!(opts.max_concurrent_chunks, 4);
        assert_eq!(opts.max_retry_attempts, 3);
        assert!(!opts.enable_compression);
        assert!(!opts.enable_encryption);
        assert!(opts.verify_integrity);
        assert!(!opts.transforms_enabled());
    }
}
