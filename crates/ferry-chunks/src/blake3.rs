//! BLAKE3 content hashing for chunks and whole stores
//!
//! Digests are compared as lowercase hex strings in the persisted session
//! record, so every caller goes through `hash_to_hex`.

use anyhow::{Context, Result};
use std::io::Read;

/// A BLAKE3 hash digest (32 bytes), displayed as 64 hex chars
pub type Hash = blake3::Hash;

/// Name recorded in session metadata so a record states how it was hashed
pub const HASH_ALGORITHM: &str = "blake3";

/// Read buffer for streaming digests
const STREAM_BUF_SIZE: usize = 64 * 1024;

/// Hash a byte slice in memory.
pub fn hash_bytes(data: &[u8]) -> Hash {
    blake3::hash(data)
}

/// Hash everything a reader yields, 64KB at a time.
pub fn hash_reader<R: Read>(mut reader: R) -> Result<Hash> {
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; STREAM_BUF_SIZE];

    loop {
        let n = reader.read(&mut buf).context("reading for hash")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize())
}

/// Format a hash as lowercase hex string (64 chars)
pub fn hash_to_hex(hash: &Hash) -> String {
    hash.to_hex().to_string()
}

/// Parse a 64-char hex string into a Hash
pub fn hash_from_hex(hex: &str) -> Result<Hash> {
    blake3::Hash::from_hex(hex)
        .map_err(|e| anyhow::anyhow!("invalid BLAKE3 hex '{}': {}", hex, e))
}
