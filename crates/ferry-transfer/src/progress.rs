//! Progress snapshots derived from a session record

use std::sync::Arc;
use std::time::Duration;

use ferry_core::{ChunkStatus, TransferStatus};
use serde::Serialize;

use crate::model::TransferSession;

/// Callback invoked with `(transfer_id, snapshot)` after every state change.
pub type ProgressObserver = Arc<dyn Fn(&str, &TransferProgress) + Send + Sync>;

/// Point-in-time view of a transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferProgress {
    pub transfer_id: String,
    pub status: TransferStatus,
    pub total_size: u64,
    /// Bytes in completed chunks
    pub transferred_size: u64,
    pub chunk_count: usize,
    pub completed_chunks: usize,
    pub failed_chunks: usize,
    /// Chunks currently transferring or verifying
    pub active_chunks: usize,
    /// 0..=100 by bytes (100 for an empty transfer)
    pub percent: f64,
    /// 0..=100 by chunk count (100 for an empty transfer)
    pub chunk_percent: f64,
    /// Bytes per second over the trailing window
    pub current_speed: f64,
    /// Bytes per second since the current run started
    pub average_speed: f64,
    /// Seconds left at `current_speed`, unknown while nothing is moving
    pub estimated_time_remaining: Option<f64>,
}

impl TransferProgress {
    /// Snapshot `session` as of `now_ms`, measuring speed over `window`.
    pub fn from_session(session: &TransferSession, now_ms: u64, window: Duration) -> Self {
        let mut completed_chunks = 0;
        let mut failed_chunks = 0;
        let mut active_chunks = 0;
        let mut transferred_size = 0u64;
        let mut recent_bytes = 0u64;

        let window_ms = window.as_millis() as u64;
        let window_start = now_ms.saturating_sub(window_ms);

        for chunk in &session.chunks {
            match chunk.status {
                ChunkStatus::Completed => {
                    completed_chunks += 1;
                    transferred_size += chunk.size;
                    if chunk.completed_at.is_some_and(|t| t > window_start) {
                        recent_bytes += chunk.size;
                    }
                }
                ChunkStatus::Failed => failed_chunks += 1,
                ChunkStatus::Transferring | ChunkStatus::Verifying => active_chunks += 1,
                ChunkStatus::Pending => {}
            }
        }

        let chunk_count = session.chunks.len();
        let percent = ratio(transferred_size as f64, session.total_size as f64);
        let chunk_percent = ratio(completed_chunks as f64, chunk_count as f64);

        let current_speed = if window_ms == 0 {
            0.0
        } else {
            recent_bytes as f64 / window.as_secs_f64()
        };

        let average_speed = match session.started_at {
            Some(started) if now_ms > started => {
                transferred_size as f64 / ((now_ms - started) as f64 / 1000.0)
            }
            _ => 0.0,
        };

        let remaining = session.total_size.saturating_sub(transferred_size);
        let estimated_time_remaining = if remaining == 0 {
            Some(0.0)
        } else if current_speed > 0.0 {
            Some(remaining as f64 / current_speed)
        } else {
            None
        };

        Self {
            transfer_id: session.transfer_id.clone(),
            status: session.status,
            total_size: session.total_size,
            transferred_size,
            chunk_count,
            completed_chunks,
            failed_chunks,
            active_chunks,
            percent,
            chunk_percent,
            current_speed,
            average_speed,
            estimated_time_remaining,
        }
    }
}

fn ratio(done: f64, total: f64) -> f64 {
    if total == 0.0 {
        100.0
    } else {
        done / total * 100.0
    }
}
