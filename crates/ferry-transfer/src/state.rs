//! Session state store: one JSON record per transfer
//!
//! Records live at `<state_dir>/<transfer_id>.json` and are replaced
//! atomically (write temp, fsync, rename), so a crash mid-save leaves either
//! the previous record or the new one. A record that is missing or does not
//! parse loads as `None`; the caller decides what that means.
//!
//! A running transfer also holds an OS lock on `<transfer_id>.lock`, so
//! other processes sharing the directory can tell a live session from one
//! whose owner died. The lock goes away with its process.

use std::fs::{self, File, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use ferry_core::{FerryError, FerryResult};
use tracing::{debug, warn};

use crate::model::TransferSession;

/// Persistence seam for session records.
pub trait SessionStateStore: Send + Sync {
    /// Replace the record for `session.transfer_id`.
    fn save(&self, session: &TransferSession) -> FerryResult<()>;
    /// Load a record. Missing or unreadable records yield `None`.
    fn load(&self, transfer_id: &str) -> Option<TransferSession>;
    /// Remove a record. Removing a missing record is not an error.
    fn delete(&self, transfer_id: &str) -> FerryResult<()>;
    /// Ids of all stored records.
    fn list_ids(&self) -> FerryResult<Vec<String>>;
    /// Claim exclusive ownership of `transfer_id` for the life of the
    /// returned lease. `None` means another owner holds it.
    ///
    /// Stores without cross-process ownership hand out unguarded leases.
    fn acquire_lease(&self, transfer_id: &str) -> FerryResult<Option<SessionLease>> {
        validate_transfer_id(transfer_id)?;
        Ok(Some(SessionLease::default()))
    }
}

/// Ownership of one session record, released on drop.
#[derive(Debug, Default)]
pub struct SessionLease {
    _lock: Option<File>,
}

/// Transfer ids become file names, so they are restricted to a safe alphabet.
pub fn validate_transfer_id(transfer_id: &str) -> FerryResult<()> {
    let valid = !transfer_id.is_empty()
        && transfer_id.len() <= 128
        && !transfer_id.starts_with('.')
        && transfer_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(FerryError::Config(format!(
            "invalid transfer id {transfer_id:?}: use letters, digits, '-', '_' or '.'"
        )))
    }
}

/// Directory of `<transfer_id>.json` files.
#[derive(Debug, Clone)]
pub struct JsonSessionStore {
    dir: PathBuf,
}

impl JsonSessionStore {
    /// Open (and create if needed) a state directory.
    pub fn open(dir: impl Into<PathBuf>) -> FerryResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating state dir: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, transfer_id: &str) -> PathBuf {
        self.dir.join(format!("{transfer_id}.json"))
    }

    pub fn lock_path(&self, transfer_id: &str) -> PathBuf {
        self.dir.join(format!("{transfer_id}.lock"))
    }
}

impl SessionStateStore for JsonSessionStore {
    fn save(&self, session: &TransferSession) -> FerryResult<()> {
        validate_transfer_id(&session.transfer_id)?;
        let path = self.record_path(&session.transfer_id);
        let json = serde_json::to_vec_pretty(session)
            .map_err(|e| FerryError::StateStore(format!("serializing session: {e}")))?;

        let tmp_path = path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &path)
        };
        write().map_err(|e| {
            FerryError::StateStore(format!("writing {}: {e}", path.display()))
        })?;

        debug!(transfer_id = %session.transfer_id, status = %session.status, "session saved");
        Ok(())
    }

    fn load(&self, transfer_id: &str) -> Option<TransferSession> {
        validate_transfer_id(transfer_id).ok()?;
        let path = self.record_path(transfer_id);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), "reading session record: {e}");
                return None;
            }
        };
        match serde_json::from_slice::<TransferSession>(&bytes) {
            Ok(session) if session.transfer_id == transfer_id => Some(session),
            Ok(session) => {
                warn!(
                    path = %path.display(),
                    found = %session.transfer_id,
                    "session record holds a different transfer id"
                );
                None
            }
            Err(e) => {
                warn!(path = %path.display(), "corrupt session record: {e}");
                None
            }
        }
    }

    fn delete(&self, transfer_id: &str) -> FerryResult<()> {
        validate_transfer_id(transfer_id)?;
        let path = self.record_path(transfer_id);
        match fs::remove_file(&path) {
            Ok(()) => debug!(transfer_id, "session record deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(FerryError::StateStore(format!(
                    "deleting {}: {e}",
                    path.display()
                )))
            }
        }
        if let Err(e) = fs::remove_file(self.lock_path(transfer_id)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(transfer_id, "removing lock file: {e}");
            }
        }
        Ok(())
    }

    fn list_ids(&self) -> FerryResult<Vec<String>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            FerryError::StateStore(format!("listing {}: {e}", self.dir.display()))
        })?;

        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let id = name.strip_suffix(".json")?;
                validate_transfer_id(id).ok()?;
                Some(id.to_string())
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn acquire_lease(&self, transfer_id: &str) -> FerryResult<Option<SessionLease>> {
        validate_transfer_id(transfer_id)?;
        let path = self.lock_path(transfer_id);
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| FerryError::StateStore(format!("opening {}: {e}", path.display())))?;
        match file.try_lock() {
            Ok(()) => Ok(Some(SessionLease { _lock: Some(file) })),
            Err(TryLockError::WouldBlock) => {
                debug!(transfer_id, "session is owned elsewhere");
                Ok(None)
            }
            Err(TryLockError::Error(e)) => Err(FerryError::StateStore(format!(
                "locking {}: {e}",
                path.display()
            ))),
        }
    }
}
