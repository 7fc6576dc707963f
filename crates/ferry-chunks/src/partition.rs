//! Fixed-size partitioning of a byte range
//!
//! A transfer of `total_size` bytes is split into `ceil(total_size / chunk_size)`
//! ranges. Every range is `chunk_size` long except possibly the last, and the
//! ranges tile `[0, total_size)` exactly.

use serde::{Deserialize, Serialize};

/// One half-open byte range `[offset, offset + size)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    /// Zero-based position of this range in the partition
    pub sequence: u64,
    pub offset: u64,
    pub size: u64,
}

impl ByteRange {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Number of ranges `partition` produces. Zero for an empty input.
pub fn chunk_count(total_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size)
}

/// Split `[0, total_size)` into fixed-size ranges.
///
/// `chunk_size` must be non-zero; a zero chunk size yields no ranges.
pub fn partition(total_size: u64, chunk_size: u64) -> Vec<ByteRange> {
    let count = chunk_count(total_size, chunk_size);
    (0..count)
        .map(|sequence| {
            let offset = sequence * chunk_size;
            ByteRange {
                sequence,
                offset,
                size: chunk_size.min(total_size - offset),
            }
        })
        .collect()
}
