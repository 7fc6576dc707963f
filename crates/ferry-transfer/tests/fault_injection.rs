//! Integration test: retries, integrity failures, and concurrency bounds
//! using a store provider that injects faults and counts source reads.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use ferry_core::{ChunkStatus, TransferOptions, TransferStatus};
use ferry_crypto::generate_transfer_key;
use ferry_transfer::{JsonSessionStore, KeySource, SessionStateStore, TransferProgress};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_failures_are_retried_with_backoff() {
    let ws = Workspace::new(10 * MIB);
    let faults = Faults::new();
    // The seventh chunk fails twice before its write goes through.
    faults.fail_write_at(6 * MIB as u64, 2);
    let mgr = faulty_manager(&ws, &faults, KeySource::None);

    let opts = TransferOptions {
        max_retry_attempts: 3,
        ..options(MIB)
    };
    let id = mgr.start_transfer(ws.src(), ws.dst(), opts).await.unwrap();
    let session = mgr.wait_for(&id).await.unwrap();

    assert_eq!(session.status, TransferStatus::Completed);
    assert_eq!(session.chunks[6].retry_count, 2);
    assert_eq!(session.chunks[6].status, ChunkStatus::Completed);
    assert!(session.chunks[6].error_message.is_none());
    assert!(session
        .chunks
        .iter()
        .filter(|c| c.sequence != 6)
        .all(|c| c.retry_count == 0));
    assert_eq!(ws.dest_bytes(), ws.data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_retries_fail_the_session() {
    let ws = Workspace::new(512 * KIB);
    let faults = Faults::new();
    faults.fail_write_at(3 * 64 * KIB as u64, u32::MAX);
    let mgr = faulty_manager(&ws, &faults, KeySource::None);

    let opts = TransferOptions {
        max_retry_attempts: 2,
        max_concurrent_chunks: 1,
        ..options(64 * KIB)
    };
    let id = mgr.start_transfer(ws.src(), ws.dst(), opts).await.unwrap();
    let session = mgr.wait_for(&id).await.unwrap();

    assert_eq!(session.status, TransferStatus::Failed);
    let failed = &session.chunks[3];
    assert_eq!(failed.status, ChunkStatus::Failed);
    assert_eq!(failed.retry_count, 2);
    assert!(failed.error_message.as_deref().unwrap().contains("injected"));
    let reason = session.error_message.as_deref().unwrap();
    assert!(reason.contains(&failed.chunk_id), "{reason}");
    // Nothing after the failed chunk was scheduled with one worker.
    assert!(session.chunks[4..].iter().all(|c| c.status == ChunkStatus::Pending));

    let progress = mgr.get_progress(&id).unwrap();
    assert_eq!(progress.failed_chunks, 1);
    assert_eq!(progress.completed_chunks, 3);

    // Once the fault clears, resuming finishes the job with a fresh budget.
    faults.clear_write_faults();
    assert!(mgr.resume_transfer(&id).await);
    let resumed = mgr.get_session(&id).unwrap();
    assert!(resumed.chunks[3].error_message.is_none());
    assert_eq!(resumed.chunks[3].retry_count, 0);
    let record = JsonSessionStore::open(&ws.state_dir).unwrap().load(&id).unwrap();
    assert!(record.chunks.iter().all(|c| c.error_message.is_none()));
    let session = mgr.wait_for(&id).await.unwrap();
    assert_eq!(session.status, TransferStatus::Completed);
    assert_eq!(session.chunks[3].retry_count, 0);
    assert!(session.error_message.is_none());
    assert_eq!(ws.dest_bytes(), ws.data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn corrupted_chunk_is_detected_and_retried() {
    let ws = Workspace::new(8 * 64 * KIB);
    let faults = Faults::new();
    // Read 1 is the upfront digest pass; read 2 is the first transfer attempt.
    faults.corrupt_read_at(2 * 64 * KIB as u64, 2);
    let mgr = faulty_manager(&ws, &faults, KeySource::Key(generate_transfer_key()));

    let opts = TransferOptions {
        enable_compression: true,
        enable_encryption: true,
        max_retry_attempts: 3,
        ..options(64 * KIB)
    };
    let id = mgr.start_transfer(ws.src(), ws.dst(), opts).await.unwrap();
    let session = mgr.wait_for(&id).await.unwrap();

    assert_eq!(session.status, TransferStatus::Completed);
    assert_eq!(session.chunks[2].retry_count, 1);
    assert_eq!(faults.reads_at(2 * 64 * KIB as u64), 3);
    assert!(session
        .chunks
        .iter()
        .filter(|c| c.sequence != 2)
        .all(|c| c.retry_count == 0));

    let output = ws.path("unpacked.bin");
    mgr.unpack(&id, output.to_str().unwrap()).await.unwrap();
    assert_eq!(std::fs::read(&output).unwrap(), ws.data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn in_flight_chunks_never_exceed_the_session_limit() {
    let ws = Workspace::new(24 * 16 * KIB);
    let faults = Faults::new();
    faults.set_read_delay(Duration::from_millis(15));
    let mgr = faulty_manager(&ws, &faults, KeySource::None);

    let max_active = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&max_active);
    mgr.add_progress_observer(Arc::new(move |_: &str, p: &TransferProgress| {
        seen.fetch_max(p.active_chunks, Ordering::SeqCst);
    }));

    let opts = TransferOptions {
        max_concurrent_chunks: 3,
        verify_integrity: false,
        ..options(16 * KIB)
    };
    let id = mgr.start_transfer(ws.src(), ws.dst(), opts).await.unwrap();

    // Sample chunk states while the run is in progress, not only at publish time.
    let polled = Arc::new(AtomicUsize::new(0));
    let poller = {
        let mgr = mgr.clone();
        let id = id.clone();
        let polled = Arc::clone(&polled);
        tokio::spawn(async move {
            while let Some(p) = mgr.get_progress(&id) {
                polled.fetch_max(p.active_chunks, Ordering::SeqCst);
                if matches!(
                    p.status,
                    TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
                ) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };
    let session = mgr.wait_for(&id).await.unwrap();
    poller.await.unwrap();

    assert_eq!(session.status, TransferStatus::Completed);
    assert!(faults.max_concurrent_reads() <= 3, "{}", faults.max_concurrent_reads());
    assert!(faults.max_concurrent_reads() >= 2, "chunks should overlap");
    let active = polled.load(Ordering::SeqCst);
    assert!((2..=3).contains(&active), "active chunks peaked at {active}");
    assert!(max_active.load(Ordering::SeqCst) <= 3);
    assert_eq!(ws.dest_bytes(), ws.data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn only_one_session_transfers_at_a_time_with_one_slot() {
    let ws = Workspace::new(8 * 16 * KIB);
    let faults = Faults::new();
    faults.set_read_delay(Duration::from_millis(5));
    let mut settings = ws.settings();
    settings.max_concurrent_transfers = 1;
    let mgr = ferry_transfer::TransferManager::builder(settings)
        .store_provider(Arc::new(FaultyProvider::new(&ws.source, &faults)))
        .build()
        .unwrap();

    let transferring = Arc::new(std::sync::Mutex::new(std::collections::HashSet::new()));
    let overlap = Arc::new(AtomicUsize::new(0));
    {
        let transferring = Arc::clone(&transferring);
        let overlap = Arc::clone(&overlap);
        mgr.add_progress_observer(Arc::new(move |id: &str, p: &TransferProgress| {
            let mut set = transferring.lock().unwrap();
            if p.status == TransferStatus::Transferring {
                set.insert(id.to_string());
            } else {
                set.remove(id);
            }
            overlap.fetch_max(set.len(), Ordering::SeqCst);
        }));
    }

    let opts = TransferOptions {
        verify_integrity: false,
        ..options(16 * KIB)
    };
    let first = mgr
        .start_transfer(ws.src(), ws.path("a.bin").to_str().unwrap(), opts.clone())
        .await
        .unwrap();
    let second = mgr
        .start_transfer(ws.src(), ws.path("b.bin").to_str().unwrap(), opts)
        .await
        .unwrap();

    assert_eq!(mgr.wait_for(&first).await.unwrap().status, TransferStatus::Completed);
    assert_eq!(mgr.wait_for(&second).await.unwrap().status, TransferStatus::Completed);
    assert_eq!(overlap.load(Ordering::SeqCst), 1);
    assert_eq!(std::fs::read(ws.path("b.bin")).unwrap(), ws.data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn damaged_destination_fails_final_verification() {
    let ws = Workspace::new(8 * 16 * KIB);
    let faults = Faults::new();
    // The write of chunk 5 is reported as successful but lands damaged.
    faults.corrupt_write_at(5 * 16 * KIB as u64);
    let mgr = faulty_manager(&ws, &faults, KeySource::None);

    let id = mgr
        .start_transfer(ws.src(), ws.dst(), options(16 * KIB))
        .await
        .unwrap();
    let session = mgr.wait_for(&id).await.unwrap();

    assert_eq!(session.status, TransferStatus::Failed);
    assert!(session.all_chunks_completed(), "every chunk passed its own check");
    assert!(session.chunks.iter().all(|c| c.retry_count == 0));
    let expected = session.expected_file_hash.as_deref().unwrap();
    let actual = session.actual_file_hash.as_deref().unwrap();
    assert_ne!(expected, actual);
    assert!(session
        .error_message
        .as_deref()
        .unwrap()
        .contains("destination digest does not match"));
    assert!(session.completed_at.is_none());

    let record = JsonSessionStore::open(&ws.state_dir).unwrap().load(&id).unwrap();
    assert_eq!(record.status, TransferStatus::Failed);
    assert_eq!(record.actual_file_hash.as_deref(), Some(actual));
}
