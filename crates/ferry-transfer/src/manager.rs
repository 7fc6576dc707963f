//! Transfer manager: session registry, execution, and lifecycle control
//!
//! Two nested gates bound concurrency: a manager-wide semaphore limits how
//! many sessions transfer at once, and each running session owns a semaphore
//! limiting its in-flight chunks. Permits are acquired before a worker is
//! spawned, as in a classic worker pool.
//!
//! Every state change is persisted (serialized per session) and then
//! published to progress observers.
//!
//! Setting up a run (start, resume) and tearing one down (pause, cancel)
//! happen under a per-id reservation, and a run holds the session's lease
//! from the state store until it ends, so neither another task nor another
//! process can drive the same session twice.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use ferry_chunks::HASH_ALGORITHM;
use ferry_core::config::{expand_tilde, ManagerConfig};
use ferry_core::{FerryError, FerryResult, TransferOptions, TransferStatus};
use ferry_crypto::TransferKey;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handle::{RunGuard, SessionHandle};
use crate::handler::{ChunkOutcome, ChunkTransferHandler};
use crate::keying::KeySource;
use crate::model::{now_millis, TransferSession};
use crate::pipeline::{precompute_expected_hashes, ChunkPipeline};
use crate::progress::{ProgressObserver, TransferProgress};
use crate::state::{validate_transfer_id, JsonSessionStore, SessionLease, SessionStateStore};
use crate::store::{digest_of_store, prepare_destination, ByteStore, LocalStoreProvider, StoreProvider};
use crate::unpack::unpack_destination;

/// Largest accepted chunk size (slot payload lengths are 32-bit)
pub const MAX_CHUNK_SIZE: u64 = 1024 * 1024 * 1024;

/// Runtime settings of a manager.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub state_dir: PathBuf,
    pub max_concurrent_transfers: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub progress_window: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from(&ManagerConfig::default())
    }
}

impl From<&ManagerConfig> for ManagerSettings {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            state_dir: expand_tilde(&config.state_dir),
            max_concurrent_transfers: config.max_concurrent_transfers,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(config.retry_max_delay_ms),
            progress_window: Duration::from_secs(config.progress_window_secs),
        }
    }
}

impl ManagerSettings {
    /// Wait before retry number `retry_count`: `base * 2^retry_count`, capped.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

/// Builder for [`TransferManager`].
pub struct TransferManagerBuilder {
    settings: ManagerSettings,
    state_store: Option<Arc<dyn SessionStateStore>>,
    stores: Arc<dyn StoreProvider>,
    keys: KeySource,
}

impl TransferManagerBuilder {
    /// Persist sessions somewhere other than a JSON store in `state_dir`.
    pub fn state_store(mut self, store: Arc<dyn SessionStateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn store_provider(mut self, stores: Arc<dyn StoreProvider>) -> Self {
        self.stores = stores;
        self
    }

    pub fn key_source(mut self, keys: KeySource) -> Self {
        self.keys = keys;
        self
    }

    pub fn build(self) -> FerryResult<TransferManager> {
        if self.settings.max_concurrent_transfers == 0 {
            return Err(FerryError::Config(
                "max_concurrent_transfers must be at least 1".into(),
            ));
        }
        let state_store = match self.state_store {
            Some(store) => store,
            None => Arc::new(JsonSessionStore::open(&self.settings.state_dir)?),
        };
        Ok(TransferManager {
            inner: Arc::new(Inner {
                transfer_slots: Arc::new(Semaphore::new(self.settings.max_concurrent_transfers)),
                settings: self.settings,
                state_store,
                stores: self.stores,
                keys: self.keys,
                sessions: Mutex::new(HashMap::new()),
                starting: Mutex::new(HashSet::new()),
                observers: RwLock::new(Vec::new()),
            }),
        })
    }
}

/// Owns every live transfer session. Cheap to clone.
#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<Inner>,
}

struct Inner {
    settings: ManagerSettings,
    state_store: Arc<dyn SessionStateStore>,
    stores: Arc<dyn StoreProvider>,
    keys: KeySource,
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
    /// Ids with a start, resume, pause, or cancel in progress
    starting: Mutex<HashSet<String>>,
    transfer_slots: Arc<Semaphore>,
    observers: RwLock<Vec<ProgressObserver>>,
}

impl TransferManager {
    pub fn builder(settings: ManagerSettings) -> TransferManagerBuilder {
        TransferManagerBuilder {
            settings,
            state_store: None,
            stores: Arc::new(LocalStoreProvider),
            keys: KeySource::None,
        }
    }

    /// Manager over local files with a JSON state store and no encryption key.
    pub fn new(settings: ManagerSettings) -> FerryResult<Self> {
        Self::builder(settings).build()
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    /// Create a session, compute expected digests, allocate the destination,
    /// and start transferring in the background. Returns the transfer id.
    pub async fn start_transfer(
        &self,
        source: &str,
        destination: &str,
        options: TransferOptions,
    ) -> FerryResult<String> {
        validate_options(&options)?;
        let transfer_id = options
            .transfer_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        validate_transfer_id(&transfer_id)?;
        let in_use = || FerryError::Config(format!("transfer id {transfer_id} is already in use"));
        let Some(_reservation) = self.inner.reserve(&transfer_id) else {
            return Err(in_use());
        };
        if self.inner.handle(&transfer_id).is_some() {
            return Err(in_use());
        }

        let source_store = self.inner.stores.open(source)?;
        let dest_store = self.inner.stores.open(destination)?;
        let state_store = Arc::clone(&self.inner.state_store);
        let keys = self.inner.keys.clone();
        let (source, destination) = (source.to_string(), destination.to_string());
        let id = transfer_id.clone();

        let (session, key, lease) = blocking(move || {
            let lease = state_store.acquire_lease(&id)?.ok_or_else(|| {
                FerryError::Config(format!("transfer id {id} is owned by another process"))
            })?;
            if state_store.load(&id).is_some() {
                return Err(FerryError::Config(format!(
                    "a session record for {id} already exists"
                )));
            }
            let total_size = measure_source(source_store.as_ref(), &source)?;

            let mut session = TransferSession::new(&id, &source, &destination, total_size, &options);
            session
                .metadata
                .insert("hash_algorithm".into(), HASH_ALGORITHM.into());
            if session.enable_compression {
                session
                    .metadata
                    .insert("compression_level".into(), session.compression_level.into());
            }
            let key = if session.enable_encryption {
                Some(keys.key_for_new_session(&mut session.metadata)?)
            } else {
                None
            };

            if session.verify_integrity {
                let pipeline = ChunkPipeline::for_session(&session, key.as_ref())?;
                precompute_expected_hashes(source_store.as_ref(), &pipeline, &mut session.chunks)?;
                if !session.transforms_enabled() {
                    session.expected_file_hash = Some(digest_of_store(source_store.as_ref())?);
                }
            }

            prepare_destination(dest_store.as_ref(), session.destination_size())?;
            session.set_status(TransferStatus::Preparing)?;
            Ok((session, key, lease))
        })
        .await?;

        info!(
            transfer_id = %transfer_id,
            source = %session.source_path,
            destination = %session.destination_path,
            total_size = session.total_size,
            chunks = session.chunks.len(),
            "transfer created"
        );

        let handle = self.inner.install(session);
        self.inner.publish(&handle).await;
        self.inner.launch(handle, key, lease);
        Ok(transfer_id)
    }

    /// Resume a paused or failed transfer from its persisted record.
    pub async fn try_resume_transfer(&self, transfer_id: &str) -> FerryResult<()> {
        let cannot = |reason: String| FerryError::CannotResume {
            transfer_id: transfer_id.to_string(),
            reason,
        };

        let Some(_reservation) = self.inner.reserve(transfer_id) else {
            return Err(cannot("transfer is being started or stopped".into()));
        };
        if self
            .inner
            .handle(transfer_id)
            .is_some_and(|h| h.is_running())
        {
            return Err(cannot("transfer is already running".into()));
        }

        let store = Arc::clone(&self.inner.state_store);
        let id = transfer_id.to_string();
        let claimed = blocking(move || {
            if store.load(&id).is_none() {
                return Ok(None);
            }
            Ok(Some(match store.acquire_lease(&id)? {
                Some(lease) => (Some(lease), store.load(&id)),
                None => (None, None),
            }))
        })
        .await
        .map_err(|e| cannot(e.to_string()))?;
        let (lease, loaded) = claimed.ok_or_else(|| cannot("no readable session record".into()))?;
        let lease = lease.ok_or_else(|| cannot("transfer is running in another process".into()))?;
        let session = loaded.ok_or_else(|| cannot("no readable session record".into()))?;
        if !session.status.can_resume() {
            return Err(cannot(format!("transfer is {}", session.status)));
        }

        let keys = self.inner.keys.clone();
        let (mut session, key) = blocking(move || {
            let key = keys.key_for_session(&session)?;
            Ok((session, key))
        })
        .await
        .map_err(|e| cannot(e.to_string()))?;

        let reset = session.reset_failed_chunks() + session.reset_interrupted_chunks();
        session.error_message = None;
        session.set_status(TransferStatus::Preparing)?;
        info!(
            transfer_id,
            remaining = session.pending_indices().len(),
            reset,
            "resuming transfer"
        );

        let handle = self.inner.install(session);
        self.inner.publish(&handle).await;
        self.inner.launch(handle, key, lease);
        Ok(())
    }

    /// [`try_resume_transfer`](Self::try_resume_transfer), reporting only success.
    pub async fn resume_transfer(&self, transfer_id: &str) -> bool {
        match self.try_resume_transfer(transfer_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(transfer_id, "resume refused: {e}");
                false
            }
        }
    }

    /// Stop scheduling new chunks, let in-flight attempts finish, and mark
    /// the session `Paused`. Returns false if it was not running here.
    pub async fn pause_transfer(&self, transfer_id: &str) -> bool {
        let Some(_reservation) = self.inner.reserve(transfer_id) else {
            return false;
        };
        let Some(handle) = self.inner.handle(transfer_id) else {
            return false;
        };
        if !handle.is_running() || !is_active(handle.lock().status) {
            return false;
        }

        handle.stop_and_wait().await;

        let paused = {
            let mut session = handle.lock();
            if is_active(session.status) {
                session.reset_interrupted_chunks();
                session.set_status(TransferStatus::Paused).is_ok()
            } else {
                false
            }
        };
        if paused {
            self.inner.publish(&handle).await;
            info!(transfer_id, "transfer paused");
        }
        paused
    }

    /// Stop the transfer, delete its destination and its state record.
    /// Completed transfers, and transfers owned by another process, cannot
    /// be cancelled.
    pub async fn cancel_transfer(&self, transfer_id: &str) -> bool {
        let Some(_reservation) = self.inner.reserve(transfer_id) else {
            warn!(transfer_id, "cancel refused: transfer is being started or stopped");
            return false;
        };
        let existing = self.inner.handle(transfer_id);
        if let Some(handle) = &existing {
            if handle.lock().status.is_terminal() {
                return false;
            }
            handle.stop_and_wait().await;
        }

        let store = Arc::clone(&self.inner.state_store);
        let id = transfer_id.to_string();
        let in_memory = existing.is_some();
        let claimed = blocking(move || {
            if !in_memory && store.load(&id).is_none() {
                return Ok(None);
            }
            let lease = store.acquire_lease(&id)?;
            let record = match &lease {
                Some(_) if !in_memory => store.load(&id),
                _ => None,
            };
            Ok(Some((lease, record)))
        })
        .await;
        let (lease, record) = match claimed {
            Ok(None) => return false,
            Ok(Some((Some(lease), record))) => (lease, record),
            Ok(Some((None, _))) => {
                warn!(transfer_id, "cancel refused: transfer is owned by another process");
                return false;
            }
            Err(e) => {
                warn!(transfer_id, "cancel refused: {e}");
                return false;
            }
        };

        let handle = match existing {
            Some(handle) => handle,
            None => match record {
                Some(session) if !session.status.is_terminal() => self.inner.install(session),
                _ => return false,
            },
        };

        let destination = {
            let mut session = handle.lock();
            session.reset_interrupted_chunks();
            if session.set_status(TransferStatus::Cancelled).is_err() {
                return false;
            }
            session.completed_at = Some(now_millis());
            session.destination_path.clone()
        };
        self.inner.notify(&handle);

        let stores = Arc::clone(&self.inner.stores);
        let state_store = Arc::clone(&self.inner.state_store);
        let id = transfer_id.to_string();
        let cleanup = blocking(move || {
            stores.open(&destination)?.remove()?;
            state_store.delete(&id)
        })
        .await;
        if let Err(e) = cleanup {
            warn!(transfer_id, "cleanup after cancel: {e}");
        }
        drop(lease);

        self.inner.sessions().remove(transfer_id);
        info!(transfer_id, "transfer cancelled");
        true
    }

    pub fn get_progress(&self, transfer_id: &str) -> Option<TransferProgress> {
        let handle = self.inner.handle(transfer_id)?;
        let progress = self.inner.progress_of(&handle);
        Some(progress)
    }

    pub fn get_session(&self, transfer_id: &str) -> Option<TransferSession> {
        self.inner.handle(transfer_id).map(|h| h.snapshot())
    }

    /// One session from memory, or else from the state store. Nothing is
    /// loaded into the manager and no record is rewritten.
    pub async fn inspect_transfer(&self, transfer_id: &str) -> Option<TransferSession> {
        if let Some(session) = self.get_session(transfer_id) {
            return Some(session);
        }
        let store = Arc::clone(&self.inner.state_store);
        let id = transfer_id.to_string();
        tokio::task::spawn_blocking(move || store.load(&id))
            .await
            .ok()
            .flatten()
    }

    /// Every session in memory plus every readable record in the state
    /// store, oldest first, without side effects.
    pub async fn inspect_transfers(&self) -> FerryResult<Vec<TransferSession>> {
        let mut sessions = self.list_transfers();
        let known: HashSet<String> = sessions.iter().map(|s| s.transfer_id.clone()).collect();
        let store = Arc::clone(&self.inner.state_store);
        let stored = blocking(move || {
            Ok(store
                .list_ids()?
                .into_iter()
                .filter(|id| !known.contains(id))
                .filter_map(|id| store.load(&id))
                .collect::<Vec<_>>())
        })
        .await?;
        sessions.extend(stored);
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.transfer_id.cmp(&b.transfer_id))
        });
        Ok(sessions)
    }

    /// Progress of a session snapshot, using this manager's speed window.
    pub fn progress_for(&self, session: &TransferSession) -> TransferProgress {
        TransferProgress::from_session(session, now_millis(), self.inner.settings.progress_window)
    }

    /// Snapshots of every session this manager knows about, oldest first.
    pub fn list_transfers(&self) -> Vec<TransferSession> {
        let handles: Vec<_> = self.inner.sessions().values().cloned().collect();
        let mut sessions: Vec<TransferSession> = handles.iter().map(|h| h.snapshot()).collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.transfer_id.cmp(&b.transfer_id))
        });
        sessions
    }

    /// Forget completed sessions that finished at least `older_than` ago,
    /// in memory and in the state store. Returns how many were removed.
    pub async fn cleanup_completed(&self, older_than: Duration) -> FerryResult<usize> {
        let cutoff = now_millis().saturating_sub(older_than.as_millis() as u64);
        let expired = move |s: &TransferSession| {
            s.status == TransferStatus::Completed && s.completed_at.is_some_and(|t| t <= cutoff)
        };

        let (expired_live, known): (Vec<String>, HashSet<String>) = {
            let mut sessions = self.inner.sessions();
            let expired_live: Vec<String> = sessions
                .iter()
                .filter(|(_, h)| expired(&*h.lock()))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired_live {
                sessions.remove(id);
            }
            (expired_live, sessions.keys().cloned().collect())
        };

        let store = Arc::clone(&self.inner.state_store);
        let removed = blocking(move || {
            let mut removed = 0;
            for id in &expired_live {
                store.delete(id)?;
                removed += 1;
            }
            for id in store.list_ids()? {
                if known.contains(&id) || expired_live.contains(&id) {
                    continue;
                }
                if store.load(&id).is_some_and(|s| expired(&s)) {
                    store.delete(&id)?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await?;

        if removed > 0 {
            info!(removed, "completed transfers cleaned up");
        }
        Ok(removed)
    }

    /// Load every persisted session not already in memory. Sessions that
    /// were mid-run when their process died come back as `Paused`; sessions
    /// another live process is running are left alone.
    pub async fn recover(&self) -> FerryResult<usize> {
        let store = Arc::clone(&self.inner.state_store);
        let records = blocking(move || {
            let mut records = Vec::new();
            for id in store.list_ids()? {
                let Some(lease) = store.acquire_lease(&id)? else {
                    debug!(transfer_id = %id, "skipping session owned by a live process");
                    continue;
                };
                if let Some(session) = store.load(&id) {
                    records.push((session, lease));
                }
            }
            Ok(records)
        })
        .await?;

        let mut recovered = 0;
        for (mut session, _lease) in records {
            if self.inner.handle(&session.transfer_id).is_some() {
                continue;
            }
            let interrupted = is_active(session.status);
            if interrupted {
                session.reset_interrupted_chunks();
                session.set_status(TransferStatus::Paused)?;
                warn!(
                    transfer_id = %session.transfer_id,
                    "interrupted transfer recovered as paused"
                );
            }
            let handle = self.inner.install(session);
            if interrupted {
                self.inner.persist(&handle).await;
            }
            recovered += 1;
        }

        debug!(recovered, "session records recovered");
        Ok(recovered)
    }

    /// Register a callback for progress snapshots. Panics inside the callback
    /// are caught and logged.
    pub fn add_progress_observer(&self, observer: ProgressObserver) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Wait until the current run of a transfer ends (completion, failure,
    /// pause, or cancel) and return the final snapshot.
    pub async fn wait_for(&self, transfer_id: &str) -> Option<TransferSession> {
        let handle = self.inner.handle(transfer_id)?;
        handle.wait_idle().await;
        Some(handle.snapshot())
    }

    /// Decode a completed slotted destination back into plain bytes at `output`.
    pub async fn unpack(&self, transfer_id: &str, output: &str) -> FerryResult<u64> {
        let session = match self.get_session(transfer_id) {
            Some(s) => s,
            None => {
                let store = Arc::clone(&self.inner.state_store);
                let id = transfer_id.to_string();
                tokio::task::spawn_blocking(move || store.load(&id))
                    .await
                    .ok()
                    .flatten()
                    .ok_or_else(|| FerryError::UnknownTransfer(transfer_id.to_string()))?
            }
        };

        let keys = self.inner.keys.clone();
        let stores = Arc::clone(&self.inner.stores);
        let output = output.to_string();
        blocking(move || {
            let key = keys.key_for_session(&session)?;
            unpack_destination(&session, key.as_ref(), stores.as_ref(), &output)
        })
        .await
    }
}

impl Inner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionHandle>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, transfer_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions().get(transfer_id).cloned()
    }

    /// Claim `transfer_id` for a lifecycle change. `None` while another
    /// change of the same session is in progress.
    fn reserve(&self, transfer_id: &str) -> Option<Reservation<'_>> {
        let mut starting = self.starting.lock().unwrap_or_else(PoisonError::into_inner);
        if !starting.insert(transfer_id.to_string()) {
            return None;
        }
        Some(Reservation {
            starting: &self.starting,
            transfer_id: transfer_id.to_string(),
        })
    }

    /// Register `session`, replacing the contents of an existing handle.
    fn install(&self, session: TransferSession) -> Arc<SessionHandle> {
        let mut sessions = self.sessions();
        match sessions.get(&session.transfer_id) {
            Some(handle) => {
                let handle = Arc::clone(handle);
                *handle.lock() = session;
                handle
            }
            None => {
                let handle = Arc::new(SessionHandle::new(session));
                sessions.insert(handle.transfer_id.clone(), Arc::clone(&handle));
                handle
            }
        }
    }

    /// Bring a persisted-only session into memory.
    async fn load_handle(&self, transfer_id: &str) -> Option<Arc<SessionHandle>> {
        let store = Arc::clone(&self.state_store);
        let id = transfer_id.to_string();
        let session = tokio::task::spawn_blocking(move || store.load(&id))
            .await
            .ok()
            .flatten()?;
        Some(self.install(session))
    }

    fn progress_of(&self, handle: &SessionHandle) -> TransferProgress {
        TransferProgress::from_session(&handle.lock(), now_millis(), self.settings.progress_window)
    }

    /// Persist, then notify observers.
    async fn publish(&self, handle: &SessionHandle) {
        self.persist(handle).await;
        self.notify(handle);
    }

    async fn persist(&self, handle: &SessionHandle) {
        // Snapshot under the save lock so records are written in change order.
        let _order = handle.save_lock.lock().await;
        let snapshot = handle.snapshot();
        let store = Arc::clone(&self.state_store);
        match tokio::task::spawn_blocking(move || store.save(&snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(transfer_id = %handle.transfer_id, "persisting session: {e}"),
            Err(e) => warn!(transfer_id = %handle.transfer_id, "persist task failed: {e}"),
        }
    }

    fn notify(&self, handle: &SessionHandle) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if observers.is_empty() {
            return;
        }
        let progress = self.progress_of(handle);
        for observer in observers {
            let call = catch_unwind(AssertUnwindSafe(|| (*observer)(&progress.transfer_id, &progress)));
            if call.is_err() {
                warn!(transfer_id = %progress.transfer_id, "progress observer panicked");
            }
        }
    }

    /// Start a background run of `handle`.
    fn launch(self: &Arc<Self>, handle: Arc<SessionHandle>, key: Option<TransferKey>, lease: SessionLease) {
        let (stop, guard) = handle.begin_run(lease);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.execute(handle, stop, key, guard).await;
        });
    }

    async fn execute(
        self: Arc<Self>,
        handle: Arc<SessionHandle>,
        stop: CancellationToken,
        key: Option<TransferKey>,
        _guard: RunGuard,
    ) {
        let permit = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!(transfer_id = %handle.transfer_id, "stopped while queued");
                return;
            }
            permit = Arc::clone(&self.transfer_slots).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
        };

        if let Err(e) = self.run_session(&handle, &stop, key).await {
            error!(transfer_id = %handle.transfer_id, "transfer failed: {e}");
            self.fail_session(&handle, e.to_string()).await;
        }
        drop(permit);
    }

    async fn run_session(
        self: &Arc<Self>,
        handle: &Arc<SessionHandle>,
        stop: &CancellationToken,
        key: Option<TransferKey>,
    ) -> FerryResult<()> {
        let session = {
            let mut session = handle.lock();
            session.set_status(TransferStatus::Transferring)?;
            session.started_at = Some(now_millis());
            session.clone()
        };
        self.publish(handle).await;

        let source = self.stores.open(&session.source_path)?;
        let destination = self.stores.open(&session.destination_path)?;
        let pipeline = Arc::new(ChunkPipeline::for_session(&session, key.as_ref())?);
        {
            let destination = Arc::clone(&destination);
            let len = session.destination_size();
            blocking(move || Ok(prepare_destination(destination.as_ref(), len)?)).await?;
        }
        let handler = ChunkTransferHandler::new(source, Arc::clone(&destination), pipeline);

        let work = session.pending_indices();
        info!(
            transfer_id = %session.transfer_id,
            pending = work.len(),
            total = session.chunks.len(),
            "transferring"
        );

        let chunk_slots = Arc::new(Semaphore::new(session.max_concurrent_chunks));
        let halt = stop.child_token();
        let mut workers = JoinSet::new();

        for index in work {
            let permit = tokio::select! {
                biased;
                _ = halt.cancelled() => break,
                permit = Arc::clone(&chunk_slots).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let inner = Arc::clone(self);
            let handle = Arc::clone(handle);
            let handler = handler.clone();
            let halt = halt.clone();
            workers.spawn(async move {
                let _permit = permit;
                inner.drive_chunk(&handle, &handler, index, &halt).await;
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(transfer_id = %session.transfer_id, "chunk worker panicked: {e}");
            }
        }

        if stop.is_cancelled() {
            debug!(transfer_id = %session.transfer_id, "run stopped");
            return Ok(());
        }
        self.finish(handle, destination).await
    }

    /// Attempt one chunk until it completes, its retry budget runs out, or
    /// the run is halted.
    async fn drive_chunk(
        &self,
        handle: &Arc<SessionHandle>,
        handler: &ChunkTransferHandler,
        index: usize,
        halt: &CancellationToken,
    ) {
        loop {
            if halt.is_cancelled() {
                return;
            }
            let outcome = handler.transfer_chunk(handle, index).await;
            let retry = match &outcome {
                ChunkOutcome::Completed => None,
                ChunkOutcome::Failed { message, .. } => Some(self.plan_retry(handle, index, message)),
            };
            self.publish(handle).await;

            match retry {
                None => return,
                Some(Some(delay)) => {
                    tokio::select! {
                        _ = halt.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Some(None) => {
                    halt.cancel();
                    return;
                }
            }
        }
    }

    /// Spend one retry of the chunk's budget and return the backoff, or
    /// record the session error and return `None` once the budget is gone.
    fn plan_retry(&self, handle: &SessionHandle, index: usize, message: &str) -> Option<Duration> {
        let mut session = handle.lock();
        let max = session.max_retry_attempts;
        let chunk = session.chunks.get_mut(index)?;

        if chunk.retry_count < max {
            chunk.retry_count += 1;
            let delay = self.settings.backoff(chunk.retry_count);
            warn!(
                chunk_id = %chunk.chunk_id,
                attempt = chunk.retry_count,
                max,
                delay_ms = delay.as_millis() as u64,
                "retrying chunk"
            );
            return Some(delay);
        }

        let reason = format!(
            "chunk {} failed after {} retries: {message}",
            chunk.chunk_id, chunk.retry_count
        );
        error!("{reason}");
        if session.error_message.is_none() {
            session.error_message = Some(reason);
        }
        None
    }

    /// Decide the outcome of a run that was not stopped.
    async fn finish(&self, handle: &SessionHandle, destination: Arc<dyn ByteStore>) -> FerryResult<()> {
        let (complete, verify_file) = {
            let session = handle.lock();
            (
                session.all_chunks_completed(),
                session.verify_integrity
                    && !session.transforms_enabled()
                    && session.expected_file_hash.is_some(),
            )
        };

        let actual = if complete && verify_file {
            Some(blocking(move || Ok(digest_of_store(destination.as_ref())?)).await?)
        } else {
            None
        };

        let status = {
            let mut session = handle.lock();
            if !complete {
                let unfinished = session.chunks.len() - session.completed_chunks();
                if session.error_message.is_none() {
                    session.error_message = Some(format!("{unfinished} chunks did not complete"));
                }
                session.set_status(TransferStatus::Failed)?;
            } else if let Some(actual) = actual {
                let matches = session.expected_file_hash.as_deref() == Some(actual.as_str());
                session.actual_file_hash = Some(actual);
                if matches {
                    session.set_status(TransferStatus::Completed)?;
                    session.completed_at = Some(now_millis());
                } else {
                    session.error_message =
                        Some("destination digest does not match the source".into());
                    session.set_status(TransferStatus::Failed)?;
                }
            } else {
                session.set_status(TransferStatus::Completed)?;
                session.completed_at = Some(now_millis());
            }
            session.status
        };
        self.publish(handle).await;

        match status {
            TransferStatus::Completed => info!(transfer_id = %handle.transfer_id, "transfer completed"),
            _ => warn!(
                transfer_id = %handle.transfer_id,
                reason = handle.lock().error_message.as_deref().unwrap_or("unknown"),
                "transfer failed"
            ),
        }
        Ok(())
    }

    async fn fail_session(&self, handle: &SessionHandle, reason: String) {
        let changed = {
            let mut session = handle.lock();
            session.reset_interrupted_chunks();
            if session.status.can_transition_to(TransferStatus::Failed) {
                session.error_message = Some(reason);
                session.status = TransferStatus::Failed;
                true
            } else {
                false
            }
        };
        if changed {
            self.publish(handle).await;
        }
    }
}

/// Held for the duration of one lifecycle change of a session.
struct Reservation<'a> {
    starting: &'a Mutex<HashSet<String>>,
    transfer_id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.starting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.transfer_id);
    }
}

fn is_active(status: TransferStatus) -> bool {
    matches!(status, TransferStatus::Preparing | TransferStatus::Transferring)
}

fn validate_options(options: &TransferOptions) -> FerryResult<()> {
    if options.chunk_size == 0 || options.chunk_size > MAX_CHUNK_SIZE {
        return Err(FerryError::Config(format!(
            "chunk_size must be between 1 and {MAX_CHUNK_SIZE} bytes"
        )));
    }
    if options.max_concurrent_chunks == 0 {
        return Err(FerryError::Config(
            "max_concurrent_chunks must be at least 1".into(),
        ));
    }
    Ok(())
}

/// Size of a readable source, or the matching source error.
fn measure_source(store: &dyn ByteStore, path: &str) -> FerryResult<u64> {
    if !store.exists() {
        return Err(FerryError::SourceNotFound(path.to_string()));
    }
    let unreadable = |e: std::io::Error| FerryError::SourceUnreadable {
        path: path.to_string(),
        reason: e.to_string(),
    };
    let size = store.size().map_err(unreadable)?;
    if size > 0 {
        store.read(0, 1).map_err(unreadable)?;
    }
    Ok(size)
}

/// Run blocking work on the blocking pool.
async fn blocking<T, F>(f: F) -> FerryResult<T>
where
    F: FnOnce() -> FerryResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FerryError::Other(anyhow::anyhow!("blocking task failed: {e}")))?
}
