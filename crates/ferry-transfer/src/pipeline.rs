//! Chunk transform pipeline: compress → encrypt on the way out,
//! decrypt → decompress on the way back.
//!
//! Both transforms are deterministic, so the digest of a chunk's encoded
//! bytes can be computed before the transfer and checked while it runs.

use ferry_chunks::{compress_bound, compress_chunk, decompress_chunk, hash_bytes, hash_to_hex};
use ferry_core::{FerryError, FerryResult};
use ferry_crypto::{ChunkCipher, TransferKey, ENCRYPTION_OVERHEAD};
use rayon::prelude::*;

use crate::model::{TransferChunk, TransferSession};
use crate::store::ByteStore;

/// Length prefix in front of every slotted payload
pub const SLOT_HEADER_SIZE: u64 = 4;

/// Largest encoded form of a `chunk_size` input.
pub fn max_encoded_len(chunk_size: u64, compression: bool, encryption: bool) -> u64 {
    let mut len = if compression {
        compress_bound(chunk_size as usize) as u64
    } else {
        chunk_size
    };
    if encryption {
        len += ENCRYPTION_OVERHEAD as u64;
    }
    len
}

/// Slot size for the slotted destination layout.
pub fn slot_size(chunk_size: u64, compression: bool, encryption: bool) -> u64 {
    SLOT_HEADER_SIZE + max_encoded_len(chunk_size, compression, encryption)
}

/// Prefix a payload with its little-endian u32 length.
pub fn frame_slot(payload: &[u8]) -> FerryResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| FerryError::Transform(format!("payload too large for slot: {}", payload.len())))?;
    let mut framed = Vec::with_capacity(SLOT_HEADER_SIZE as usize + payload.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(payload);
    Ok(framed)
}

/// Extract the payload from a slot read back from the destination.
pub fn unframe_slot(slot: &[u8]) -> FerryResult<&[u8]> {
    let header: [u8; 4] = slot
        .get(..4)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| FerryError::Transform("slot shorter than its length header".into()))?;
    let len = u32::from_le_bytes(header) as usize;
    slot.get(4..4 + len).ok_or_else(|| {
        FerryError::Transform(format!(
            "slot payload length {len} exceeds slot of {} bytes",
            slot.len()
        ))
    })
}

/// The transforms configured for one session.
#[derive(Debug)]
pub struct ChunkPipeline {
    compression_level: Option<i32>,
    cipher: Option<ChunkCipher>,
}

impl ChunkPipeline {
    /// No transforms: encoded bytes are the source bytes.
    pub fn identity() -> Self {
        Self {
            compression_level: None,
            cipher: None,
        }
    }

    /// Pipeline for `session`. Encryption requires `key`.
    pub fn for_session(session: &TransferSession, key: Option<&TransferKey>) -> FerryResult<Self> {
        let compression_level = session
            .enable_compression
            .then_some(session.compression_level);
        let cipher = if session.enable_encryption {
            let key = key.ok_or(FerryError::MissingKey)?;
            Some(ChunkCipher::new(key, &session.transfer_id)?)
        } else {
            None
        };
        Ok(Self {
            compression_level,
            cipher,
        })
    }

    pub fn is_identity(&self) -> bool {
        self.compression_level.is_none() && self.cipher.is_none()
    }

    /// Apply compression then encryption to one chunk.
    pub fn encode(&self, sequence: u64, data: Vec<u8>) -> FerryResult<Vec<u8>> {
        let mut buf = data;
        if let Some(level) = self.compression_level {
            buf = compress_chunk(&buf, level).map_err(|e| FerryError::Transform(format!("{e:#}")))?;
        }
        if let Some(cipher) = &self.cipher {
            buf = cipher
                .encrypt_chunk(sequence, &buf)
                .map_err(|e| FerryError::Transform(format!("{e:#}")))?;
        }
        Ok(buf)
    }

    /// Undo `encode`. `chunk_size` bounds the decompressed output.
    pub fn decode(&self, sequence: u64, encoded: &[u8], chunk_size: usize) -> FerryResult<Vec<u8>> {
        let mut buf = match &self.cipher {
            Some(cipher) => cipher
                .decrypt_chunk(sequence, encoded)
                .map_err(|e| FerryError::Transform(format!("{e:#}")))?,
            None => encoded.to_vec(),
        };
        if self.compression_level.is_some() {
            buf = decompress_chunk(&buf, chunk_size)
                .map_err(|e| FerryError::Transform(format!("{e:#}")))?;
        }
        Ok(buf)
    }

    /// Hex digest of a chunk's encoded bytes.
    pub fn digest(encoded: &[u8]) -> String {
        hash_to_hex(&hash_bytes(encoded))
    }
}

/// Read and encode every chunk once, recording the digest each transfer
/// attempt must reproduce. Chunks are processed in parallel.
pub fn precompute_expected_hashes(
    source: &dyn ByteStore,
    pipeline: &ChunkPipeline,
    chunks: &mut [TransferChunk],
) -> FerryResult<()> {
    chunks.par_iter_mut().try_for_each(|chunk| {
        let data = source.read(chunk.offset, chunk.size as usize)?;
        let encoded = pipeline.encode(chunk.sequence, data)?;
        chunk.expected_hash = Some(ChunkPipeline::digest(&encoded));
        Ok(())
    })
}
