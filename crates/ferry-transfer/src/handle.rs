//! Shared, lockable state for one live session

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::model::TransferSession;
use crate::state::SessionLease;

/// Stop signal and completion flag of one execution run.
#[derive(Clone)]
pub(crate) struct RunControl {
    pub(crate) stop: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Held by an execution task. On drop it releases the session lease, then
/// flips the run's completion flag.
pub(crate) struct RunGuard {
    done: watch::Sender<bool>,
    lease: Option<SessionLease>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        drop(self.lease.take());
        self.done.send_replace(true);
    }
}

/// A session plus the locks and run control the manager needs around it.
///
/// The session mutex is never held across an await point.
pub(crate) struct SessionHandle {
    pub(crate) transfer_id: String,
    session: Mutex<TransferSession>,
    /// Serializes snapshot-and-save so records land in change order
    pub(crate) save_lock: tokio::sync::Mutex<()>,
    run: Mutex<Option<RunControl>>,
}

impl SessionHandle {
    pub(crate) fn new(session: TransferSession) -> Self {
        Self {
            transfer_id: session.transfer_id.clone(),
            session: Mutex::new(session),
            save_lock: tokio::sync::Mutex::new(()),
            run: Mutex::new(None),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TransferSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn snapshot(&self) -> TransferSession {
        self.lock().clone()
    }

    /// Register a new run owning `lease`. Returns its stop token and the
    /// guard the run task holds.
    pub(crate) fn begin_run(&self, lease: SessionLease) -> (CancellationToken, RunGuard) {
        let stop = CancellationToken::new();
        let (tx, rx) = watch::channel(false);
        *self.run.lock().unwrap_or_else(PoisonError::into_inner) = Some(RunControl {
            stop: stop.clone(),
            done: rx,
        });
        (
            stop,
            RunGuard {
                done: tx,
                lease: Some(lease),
            },
        )
    }

    fn current_run(&self) -> Option<RunControl> {
        self.run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.current_run().is_some_and(|run| !*run.done.borrow())
    }

    /// Wait for the current run (if any) to finish on its own.
    pub(crate) async fn wait_idle(&self) {
        if let Some(mut run) = self.current_run() {
            // A dropped sender means the run task is gone either way.
            let _ = run.done.wait_for(|done| *done).await;
        }
    }

    /// Signal the current run to stop, then wait for it to wind down.
    pub(crate) async fn stop_and_wait(&self) {
        if let Some(run) = self.current_run() {
            run.stop.cancel();
        }
        self.wait_idle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::TransferOptions;
    use std::sync::Arc;

    fn handle() -> Arc<SessionHandle> {
        let session = TransferSession::new("h", "/src", "/dst", 10, &TransferOptions::default());
        Arc::new(SessionHandle::new(session))
    }

    #[tokio::test]
    async fn test_idle_handle_waits_immediately() {
        let h = handle();
        assert!(!h.is_running());
        h.stop_and_wait().await;
    }

    #[tokio::test]
    async fn test_stop_and_wait_observes_guard_drop() {
        let h = handle();
        let (stop, guard) = h.begin_run(SessionLease::default());
        assert!(h.is_running());

        let task = tokio::spawn(async move {
            stop.cancelled().await;
            drop(guard);
        });

        h.stop_and_wait().await;
        assert!(!h.is_running());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_finished_run_releases_its_lease() {
        use crate::state::{JsonSessionStore, SessionStateStore};

        let tmp = tempfile::TempDir::new().unwrap();
        let store = JsonSessionStore::open(tmp.path()).unwrap();
        let h = handle();
        let lease = store.acquire_lease("h").unwrap().unwrap();
        let (_stop, guard) = h.begin_run(lease);
        assert!(store.acquire_lease("h").unwrap().is_none());

        drop(guard);
        h.wait_idle().await;
        assert!(store.acquire_lease("h").unwrap().is_some());
    }
}
