//! Shared fixtures: temp workspaces and a fault-injecting store provider.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferry_core::{FerryResult, TransferOptions};
use ferry_transfer::{
    ByteStore, KeySource, LocalFileStore, ManagerSettings, StoreProvider, TransferManager,
};
use tempfile::TempDir;

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * 1024;

/// Deterministic, poorly compressible bytes.
pub fn sample_data(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

pub struct Workspace {
    pub tmp: TempDir,
    pub source: PathBuf,
    pub dest: PathBuf,
    pub state_dir: PathBuf,
    pub data: Vec<u8>,
}

impl Workspace {
    pub fn new(len: usize) -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let data = sample_data(len, 0x5eed);
        let source = tmp.path().join("source.bin");
        std::fs::write(&source, &data).expect("write source");
        Self {
            dest: tmp.path().join("out/dest.bin"),
            state_dir: tmp.path().join("state"),
            source,
            tmp,
            data,
        }
    }

    pub fn src(&self) -> &str {
        self.source.to_str().expect("utf-8 path")
    }

    pub fn dst(&self) -> &str {
        self.dest.to_str().expect("utf-8 path")
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.tmp.path().join(name)
    }

    pub fn dest_bytes(&self) -> Vec<u8> {
        std::fs::read(&self.dest).expect("read destination")
    }

    pub fn record_path(&self, transfer_id: &str) -> PathBuf {
        self.state_dir.join(format!("{transfer_id}.json"))
    }

    pub fn settings(&self) -> ManagerSettings {
        test_settings(&self.state_dir)
    }
}

pub fn test_settings(state_dir: &Path) -> ManagerSettings {
    ManagerSettings {
        state_dir: state_dir.to_path_buf(),
        max_concurrent_transfers: 3,
        retry_base_delay: Duration::from_millis(5),
        retry_max_delay: Duration::from_millis(40),
        progress_window: Duration::from_secs(10),
    }
}

pub fn options(chunk_size: usize) -> TransferOptions {
    TransferOptions {
        chunk_size: chunk_size as u64,
        ..Default::default()
    }
}

pub fn manager(ws: &Workspace) -> TransferManager {
    TransferManager::new(ws.settings()).expect("manager")
}

pub fn faulty_manager(ws: &Workspace, faults: &Arc<Faults>, keys: KeySource) -> TransferManager {
    TransferManager::builder(ws.settings())
        .store_provider(Arc::new(FaultyProvider::new(&ws.source, faults)))
        .key_source(keys)
        .build()
        .expect("manager")
}

/// Fault plan and counters shared by every store a [`FaultyProvider`] opens.
///
/// Source reads are counted per offset; faults on reads apply to the source
/// only, faults on writes to any other store.
#[derive(Default)]
pub struct Faults {
    /// Destination offset → number of writes at that offset that fail
    pub fail_writes: Mutex<HashMap<u64, u32>>,
    /// Destination offsets whose next write silently lands with a flipped bit
    pub corrupt_writes: Mutex<HashSet<u64>>,
    /// Source offset → ordinal (1-based) of the read at that offset to corrupt
    pub corrupt_read: Mutex<HashMap<u64, u32>>,
    /// Sleep inside every source read
    pub read_delay: Mutex<Duration>,
    reads: Mutex<HashMap<u64, u32>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Faults {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_write_at(&self, offset: u64, times: u32) {
        self.fail_writes.lock().unwrap().insert(offset, times);
    }

    pub fn corrupt_write_at(&self, offset: u64) {
        self.corrupt_writes.lock().unwrap().insert(offset);
    }

    pub fn corrupt_read_at(&self, offset: u64, ordinal: u32) {
        self.corrupt_read.lock().unwrap().insert(offset, ordinal);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = delay;
    }

    pub fn clear_write_faults(&self) {
        self.fail_writes.lock().unwrap().clear();
    }

    pub fn reads_at(&self, offset: u64) -> u32 {
        self.reads.lock().unwrap().get(&offset).copied().unwrap_or(0)
    }

    pub fn total_reads(&self) -> u32 {
        self.reads.lock().unwrap().values().sum()
    }

    pub fn max_concurrent_reads(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

pub struct FaultyProvider {
    source: PathBuf,
    faults: Arc<Faults>,
}

impl FaultyProvider {
    pub fn new(source: &Path, faults: &Arc<Faults>) -> Self {
        Self {
            source: source.to_path_buf(),
            faults: Arc::clone(faults),
        }
    }
}

impl StoreProvider for FaultyProvider {
    fn open(&self, location: &str) -> FerryResult<Arc<dyn ByteStore>> {
        Ok(Arc::new(FaultyStore {
            inner: LocalFileStore::new(location),
            is_source: Path::new(location) == self.source,
            faults: Arc::clone(&self.faults),
        }))
    }
}

pub struct FaultyStore {
    inner: LocalFileStore,
    is_source: bool,
    faults: Arc<Faults>,
}

impl std::fmt::Debug for FaultyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyStore")
            .field("path", &self.inner.path())
            .finish()
    }
}

impl ByteStore for FaultyStore {
    fn read(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        if !self.is_source {
            return self.inner.read(offset, len);
        }

        let ordinal = {
            let mut reads = self.faults.reads.lock().unwrap();
            let n = reads.entry(offset).or_insert(0);
            *n += 1;
            *n
        };

        let now = self.faults.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.faults.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.faults.read_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let result = self.inner.read(offset, len);
        self.faults.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut data = result?;
        let corrupt = self.faults.corrupt_read.lock().unwrap().get(&offset) == Some(&ordinal);
        if corrupt && !data.is_empty() {
            data[0] ^= 0x01;
        }
        Ok(data)
    }

    fn write(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        if let Some(remaining) = self.faults.fail_writes.lock().unwrap().get_mut(&offset) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(io::Error::other(format!("injected write failure at {offset}")));
            }
        }
        if self.faults.corrupt_writes.lock().unwrap().remove(&offset) && !data.is_empty() {
            let mut damaged = data.to_vec();
            damaged[0] ^= 0x01;
            return self.inner.write(offset, &damaged);
        }
        self.inner.write(offset, data)
    }

    fn size(&self) -> io::Result<u64> {
        self.inner.size()
    }

    fn resize(&self, len: u64) -> io::Result<()> {
        self.inner.resize(len)
    }

    fn exists(&self) -> bool {
        self.inner.exists()
    }

    fn remove(&self) -> io::Result<()> {
        self.inner.remove()
    }
}
