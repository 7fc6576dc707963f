//! ferry-chunks: fixed-size partitioning, BLAKE3 hashing, and zstd chunk compression
//!
//! # Overview
//! - `blake3`: deterministic slice/stream hashing (chunk and whole-file digests)
//! - `partition`: split `[0, total_size)` into fixed-size, gap-free byte ranges
//! - `compress`: single-frame zstd compression of one chunk

pub mod blake3;
pub mod compress;
pub mod partition;

// Convenience re-exports for the most common operations
pub use blake3::{hash_bytes, hash_from_hex, hash_reader, hash_to_hex, Hash, HASH_ALGORITHM};
pub use compress::{compress_bound, compress_chunk, decompress_chunk};
pub use partition::{chunk_count, partition, ByteRange};
