//! zstd compression of a single chunk
//!
//! Each chunk is compressed as one independent zstd frame. The output must be
//! a pure function of (input, level): expected chunk digests are computed from
//! it long before the chunk is transferred.

use anyhow::{Context, Result};

/// Default zstd level for chunk compression
pub const DEFAULT_LEVEL: i32 = 3;

/// Compress one chunk into a single zstd frame.
pub fn compress_chunk(data: &[u8], level: i32) -> Result<Vec<u8>> {
    zstd::bulk::compress(data, level).context("zstd compress chunk")
}

/// Decompress one chunk frame. `max_size` bounds the output (the chunk size).
pub fn decompress_chunk(frame: &[u8], max_size: usize) -> Result<Vec<u8>> {
    zstd::bulk::decompress(frame, max_size).context("zstd decompress chunk")
}

/// Worst-case compressed size of `len` input bytes (incompressible data grows).
pub fn compress_bound(len: usize) -> usize {
    zstd::zstd_safe::compress_bound(len)
}
