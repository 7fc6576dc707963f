//! Single-chunk transfer: read → encode → verify → write
//!
//! The handler makes exactly one attempt per call and records the outcome on
//! the chunk. Retries, backoff, and the retry budget belong to the manager.

use std::sync::Arc;

use ferry_core::{ChunkStatus, FerryError, FerryResult};
use tracing::{debug, warn};

use crate::handle::SessionHandle;
use crate::model::{now_millis, DestinationLayout};
use crate::pipeline::{frame_slot, ChunkPipeline};
use crate::store::ByteStore;

/// Why a chunk attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Encoded bytes did not match the expected digest
    Integrity,
    /// Reading the source or writing the destination failed
    Io,
    /// Compression or encryption failed
    Transform,
}

/// Result of one chunk attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Completed,
    Failed { kind: FailureKind, message: String },
}

impl ChunkOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ChunkOutcome::Completed)
    }
}

/// What one attempt needs to know about its chunk, copied out under the lock.
#[derive(Debug, Clone)]
struct ChunkWork {
    index: usize,
    chunk_id: String,
    sequence: u64,
    offset: u64,
    size: u64,
    expected_hash: Option<String>,
    layout: DestinationLayout,
}

/// Moves chunks of one session from its source to its destination.
#[derive(Debug, Clone)]
pub struct ChunkTransferHandler {
    source: Arc<dyn ByteStore>,
    destination: Arc<dyn ByteStore>,
    pipeline: Arc<ChunkPipeline>,
}

impl ChunkTransferHandler {
    pub fn new(
        source: Arc<dyn ByteStore>,
        destination: Arc<dyn ByteStore>,
        pipeline: Arc<ChunkPipeline>,
    ) -> Self {
        Self {
            source,
            destination,
            pipeline,
        }
    }

    /// Make one attempt at the chunk at `index`.
    ///
    /// The chunk is marked `Transferring`, then `Verifying` while its digest
    /// is checked, then `Completed` or `Failed`. `retry_count` is untouched.
    pub(crate) async fn transfer_chunk(&self, handle: &Arc<SessionHandle>, index: usize) -> ChunkOutcome {
        let Some(work) = begin_chunk(handle, index) else {
            return ChunkOutcome::Failed {
                kind: FailureKind::Io,
                message: format!("chunk {index} is not transferable"),
            };
        };

        let this = self.clone();
        let shared = Arc::clone(handle);
        let attempt = work.clone();
        let result = tokio::task::spawn_blocking(move || this.run_attempt(&shared, &attempt))
            .await
            .unwrap_or_else(|e| Err(FerryError::Other(anyhow::anyhow!("chunk worker died: {e}"))));

        match result {
            Ok(()) => {
                finish_chunk(handle, work.index, None);
                debug!(chunk_id = %work.chunk_id, size = work.size, "chunk completed");
                ChunkOutcome::Completed
            }
            Err(e) => {
                let message = e.to_string();
                finish_chunk(handle, work.index, Some(message.clone()));
                warn!(chunk_id = %work.chunk_id, "chunk attempt failed: {message}");
                ChunkOutcome::Failed {
                    kind: classify(&e),
                    message,
                }
            }
        }
    }

    fn run_attempt(&self, handle: &SessionHandle, work: &ChunkWork) -> FerryResult<()> {
        let data = self.source.read(work.offset, work.size as usize)?;
        let encoded = self.pipeline.encode(work.sequence, data)?;

        if let Some(expected) = &work.expected_hash {
            set_chunk_status(handle, work.index, ChunkStatus::Verifying);
            verify_encoded(expected, &encoded)?;
        }

        let dest_offset = work.layout.chunk_offset(work.sequence, work.offset);
        match work.layout {
            DestinationLayout::Identity => self.destination.write(dest_offset, &encoded)?,
            DestinationLayout::Slotted { .. } => {
                self.destination.write(dest_offset, &frame_slot(&encoded)?)?
            }
        }
        Ok(())
    }
}

/// Compare the digest of `encoded` against `expected`.
pub fn verify_encoded(expected: &str, encoded: &[u8]) -> FerryResult<()> {
    let actual = ChunkPipeline::digest(encoded);
    if actual == expected {
        Ok(())
    } else {
        Err(FerryError::Integrity {
            expected: expected.to_string(),
            actual,
        })
    }
}

fn classify(err: &FerryError) -> FailureKind {
    match err {
        FerryError::Integrity { .. } => FailureKind::Integrity,
        FerryError::Transform(_) | FerryError::MissingKey => FailureKind::Transform,
        _ => FailureKind::Io,
    }
}

fn begin_chunk(handle: &SessionHandle, index: usize) -> Option<ChunkWork> {
    let mut session = handle.lock();
    if session.status.is_terminal() {
        return None;
    }
    let verify = session.verify_integrity;
    let layout = session.layout;
    let chunk = session.chunks.get_mut(index)?;
    chunk.status = ChunkStatus::Transferring;
    Some(ChunkWork {
        index,
        chunk_id: chunk.chunk_id.clone(),
        sequence: chunk.sequence,
        offset: chunk.offset,
        size: chunk.size,
        expected_hash: if verify { chunk.expected_hash.clone() } else { None },
        layout,
    })
}

fn set_chunk_status(handle: &SessionHandle, index: usize, status: ChunkStatus) {
    let mut session = handle.lock();
    if session.status.is_terminal() {
        return;
    }
    if let Some(chunk) = session.chunks.get_mut(index) {
        chunk.status = status;
    }
}

fn finish_chunk(handle: &SessionHandle, index: usize, error: Option<String>) {
    let mut session = handle.lock();
    if session.status.is_terminal() {
        return;
    }
    let Some(chunk) = session.chunks.get_mut(index) else {
        return;
    };
    match error {
        None => {
            chunk.status = ChunkStatus::Completed;
            chunk.completed_at = Some(now_millis());
            chunk.error_message = None;
        }
        Some(message) => {
            chunk.status = ChunkStatus::Failed;
            chunk.error_message = Some(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransferSession;
    use crate::pipeline::{precompute_expected_hashes, unframe_slot};
    use crate::store::LocalFileStore;
    use ferry_core::{TransferOptions, TransferStatus};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        handle: Arc<SessionHandle>,
        handler: ChunkTransferHandler,
        source: Vec<u8>,
        dest: Arc<LocalFileStore>,
    }

    fn fixture(opts: TransferOptions) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let source: Vec<u8> = (0..10_000u32).map(|i| (i % 13) as u8).collect();
        let src_path = tmp.path().join("src.bin");
        fs::write(&src_path, &source).unwrap();

        let mut session = TransferSession::new(
            "handler-test",
            src_path.display().to_string(),
            tmp.path().join("dst.bin").display().to_string(),
            source.len() as u64,
            &opts,
        );
        let src = Arc::new(LocalFileStore::new(&src_path));
        let dest = Arc::new(LocalFileStore::new(tmp.path().join("dst.bin")));
        dest.resize(session.destination_size()).unwrap();

        let pipeline = Arc::new(ChunkPipeline::for_session(&session, None).unwrap());
        precompute_expected_hashes(src.as_ref(), &pipeline, &mut session.chunks).unwrap();

        Fixture {
            _tmp: tmp,
            handle: Arc::new(SessionHandle::new(session)),
            handler: ChunkTransferHandler::new(src, dest.clone(), pipeline),
            source,
            dest,
        }
    }

    fn opts(compress: bool) -> TransferOptions {
        TransferOptions {
            chunk_size: 4096,
            enable_compression: compress,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_identity_chunk_lands_at_offset() {
        let f = fixture(opts(false));
        let outcome = f.handler.transfer_chunk(&f.handle, 1).await;
        assert!(outcome.is_success());

        let chunk = f.handle.lock().chunks[1].clone();
        assert_eq!(chunk.status, ChunkStatus::Completed);
        assert!(chunk.completed_at.is_some());
        assert_eq!(chunk.retry_count, 0);
        assert_eq!(f.dest.read(4096, 4096).unwrap(), &f.source[4096..8192]);
    }

    #[tokio::test]
    async fn test_compressed_chunk_fills_its_slot() {
        let f = fixture(opts(true));
        assert!(f.handler.transfer_chunk(&f.handle, 2).await.is_success());

        let DestinationLayout::Slotted { slot_size } = f.handle.lock().layout else {
            panic!("expected slotted layout");
        };
        let slot = f.dest.read(2 * slot_size, slot_size as usize).unwrap();
        let payload = unframe_slot(&slot).unwrap();
        let plain = ferry_chunks::decompress_chunk(payload, 4096).unwrap();
        assert_eq!(plain, &f.source[8192..]);
    }

    #[tokio::test]
    async fn test_digest_mismatch_fails_without_write() {
        let f = fixture(opts(false));
        f.handle.lock().chunks[0].expected_hash = Some("00".repeat(32));

        let outcome = f.handler.transfer_chunk(&f.handle, 0).await;
        let ChunkOutcome::Failed { kind, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(kind, FailureKind::Integrity);

        let chunk = f.handle.lock().chunks[0].clone();
        assert_eq!(chunk.status, ChunkStatus::Failed);
        assert_eq!(chunk.retry_count, 0, "handler never touches the retry budget");
        assert!(chunk.error_message.unwrap().contains("integrity"));
        assert_eq!(f.dest.read(0, 4096).unwrap(), vec![0u8; 4096]);
    }

    #[tokio::test]
    async fn test_terminal_session_is_not_mutated() {
        let f = fixture(opts(false));
        f.handle.lock().status = TransferStatus::Cancelled;

        assert!(!f.handler.transfer_chunk(&f.handle, 0).await.is_success());
        assert_eq!(f.handle.lock().chunks[0].status, ChunkStatus::Pending);
    }

    #[test]
    fn test_verify_encoded_detects_bit_flip() {
        let data = vec![7u8; 1024];
        let expected = ChunkPipeline::digest(&data);
        assert!(verify_encoded(&expected, &data).is_ok());

        let mut flipped = data.clone();
        flipped[100] ^= 0x10;
        assert!(verify_encoded(&expected, &flipped).unwrap_err().is_integrity());
    }
}
