//! Transfer session and chunk records
//!
//! A [`TransferSession`] is the unit that gets persisted: one JSON record per
//! transfer, rewritten after every state change. Chunks are addressed by
//! their index in `chunks`, which always equals their `sequence`.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use ferry_chunks::ByteRange;
use ferry_core::{ChunkStatus, FerryError, FerryResult, TransferOptions, TransferStatus};
use serde::{Deserialize, Serialize};

use crate::pipeline;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Where chunk bytes land in the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DestinationLayout {
    /// Chunk bytes are written verbatim at the chunk's source offset. The
    /// destination is a byte-identical copy of the source.
    Identity,
    /// Chunk `i` occupies `[i * slot_size, (i + 1) * slot_size)`: a
    /// little-endian u32 payload length, the transformed payload, zero padding.
    Slotted { slot_size: u64 },
}

impl DestinationLayout {
    /// Layout for a transfer with the given options.
    pub fn for_options(options: &TransferOptions) -> Self {
        if options.transforms_enabled() {
            DestinationLayout::Slotted {
                slot_size: pipeline::slot_size(
                    options.chunk_size,
                    options.enable_compression,
                    options.enable_encryption,
                ),
            }
        } else {
            DestinationLayout::Identity
        }
    }

    /// Byte length the destination is preallocated to.
    pub fn destination_size(&self, total_size: u64, chunk_count: u64) -> u64 {
        match self {
            DestinationLayout::Identity => total_size,
            DestinationLayout::Slotted { slot_size } => slot_size * chunk_count,
        }
    }

    /// Destination offset of the chunk at `sequence` starting at `source_offset`.
    pub fn chunk_offset(&self, sequence: u64, source_offset: u64) -> u64 {
        match self {
            DestinationLayout::Identity => source_offset,
            DestinationLayout::Slotted { slot_size } => sequence * slot_size,
        }
    }
}

/// One fixed-size unit of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferChunk {
    /// `{transfer_id}_chunk_{sequence:04}`
    pub chunk_id: String,
    pub sequence: u64,
    /// Byte offset in the source
    pub offset: u64,
    pub size: u64,
    /// Hex digest of the chunk's transformed bytes, when verification is on
    pub expected_hash: Option<String>,
    pub status: ChunkStatus,
    pub retry_count: u32,
    pub created_at: u64,
    pub completed_at: Option<u64>,
    /// Most recent failure, cleared when the chunk completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TransferChunk {
    pub fn new(transfer_id: &str, range: ByteRange, created_at: u64) -> Self {
        Self {
            chunk_id: format!("{transfer_id}_chunk_{:04}", range.sequence),
            sequence: range.sequence,
            offset: range.offset,
            size: range.size,
            expected_hash: None,
            status: ChunkStatus::Pending,
            retry_count: 0,
            created_at,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ChunkStatus::Completed
    }
}

/// Persistent record of one transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSession {
    pub transfer_id: String,
    pub source_path: String,
    pub destination_path: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub status: TransferStatus,
    pub chunks: Vec<TransferChunk>,
    pub max_concurrent_chunks: usize,
    pub max_retry_attempts: u32,
    pub enable_compression: bool,
    pub enable_encryption: bool,
    pub verify_integrity: bool,
    pub compression_level: i32,
    pub layout: DestinationLayout,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    /// Whole-source digest (identity layout with verification only)
    pub expected_file_hash: Option<String>,
    /// Whole-destination digest computed at the end of the transfer
    pub actual_file_hash: Option<String>,
    /// Why the session failed, when it did
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl TransferSession {
    /// New `Pending` session with one chunk per fixed-size range of the source.
    pub fn new(
        transfer_id: impl Into<String>,
        source_path: impl Into<String>,
        destination_path: impl Into<String>,
        total_size: u64,
        options: &TransferOptions,
    ) -> Self {
        let transfer_id = transfer_id.into();
        let now = now_millis();
        let chunks = ferry_chunks::partition(total_size, options.chunk_size)
            .into_iter()
            .map(|range| TransferChunk::new(&transfer_id, range, now))
            .collect();

        Self {
            transfer_id,
            source_path: source_path.into(),
            destination_path: destination_path.into(),
            total_size,
            chunk_size: options.chunk_size,
            status: TransferStatus::Pending,
            chunks,
            max_concurrent_chunks: options.max_concurrent_chunks,
            max_retry_attempts: options.max_retry_attempts,
            enable_compression: options.enable_compression,
            enable_encryption: options.enable_encryption,
            verify_integrity: options.verify_integrity,
            compression_level: options.compression_level,
            layout: DestinationLayout::for_options(options),
            created_at: now,
            started_at: None,
            completed_at: None,
            expected_file_hash: None,
            actual_file_hash: None,
            error_message: None,
            metadata: options.metadata.clone(),
        }
    }

    /// Move to `next`, refusing transitions the status machine forbids.
    pub fn set_status(&mut self, next: TransferStatus) -> FerryResult<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(FerryError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn transforms_enabled(&self) -> bool {
        self.enable_compression || self.enable_encryption
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunks.len() as u64
    }

    pub fn destination_size(&self) -> u64 {
        self.layout
            .destination_size(self.total_size, self.chunk_count())
    }

    /// Sum of completed chunk sizes
    pub fn transferred_size(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.is_completed())
            .map(|c| c.size)
            .sum()
    }

    pub fn completed_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_completed()).count()
    }

    pub fn all_chunks_completed(&self) -> bool {
        self.chunks.iter().all(TransferChunk::is_completed)
    }

    /// Indices of chunks that still have work to do, in sequence order.
    pub fn pending_indices(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_completed())
            .map(|(i, _)| i)
            .collect()
    }

    /// Return failed chunks to `Pending` with a fresh retry budget and no
    /// leftover error.
    pub fn reset_failed_chunks(&mut self) -> usize {
        let mut reset = 0;
        for chunk in self.chunks.iter_mut() {
            if chunk.status == ChunkStatus::Failed {
                chunk.status = ChunkStatus::Pending;
                chunk.retry_count = 0;
                chunk.error_message = None;
                reset += 1;
            }
        }
        reset
    }

    /// Return chunks caught mid-flight (by a crash or an aborted worker) to `Pending`.
    pub fn reset_interrupted_chunks(&mut self) -> usize {
        let mut reset = 0;
        for chunk in self.chunks.iter_mut() {
            if chunk.status.is_in_flight() {
                chunk.status = ChunkStatus::Pending;
                reset += 1;
            }
        }
        reset
    }

    /// Metadata value as a string, if present and a string.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}
