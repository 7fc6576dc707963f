//! Byte stores: random-access reads and writes against a transfer endpoint
//!
//! The manager never touches the filesystem directly. Sources and
//! destinations are opened through a [`StoreProvider`], which lets tests swap
//! in stores that fail, corrupt, or count operations.
//!
//! All methods are blocking; callers run them on the blocking thread pool.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ferry_core::FerryResult;
use tracing::debug;

/// Random-access byte storage backing one side of a transfer.
pub trait ByteStore: Send + Sync + std::fmt::Debug {
    /// Read exactly `len` bytes starting at `offset`.
    fn read(&self, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    /// Write all of `data` at `offset`. The store must already exist.
    fn write(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Current size in bytes.
    fn size(&self) -> io::Result<u64>;

    /// Create the store if missing, then truncate or zero-extend it to `len`.
    fn resize(&self, len: u64) -> io::Result<()>;

    fn exists(&self) -> bool;

    /// Delete the store. Deleting a missing store is not an error.
    fn remove(&self) -> io::Result<()>;
}

/// Opens byte stores by location string (a path for [`LocalStoreProvider`]).
pub trait StoreProvider: Send + Sync {
    fn open(&self, location: &str) -> FerryResult<Arc<dyn ByteStore>>;
}

/// Plain local files.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalStoreProvider;

impl StoreProvider for LocalStoreProvider {
    fn open(&self, location: &str) -> FerryResult<Arc<dyn ByteStore>> {
        Ok(Arc::new(LocalFileStore::new(location)))
    }
}

/// A local file addressed by path. Every operation opens the file afresh, so
/// concurrent chunk workers never share a cursor.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    path: PathBuf,
}

impl LocalFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteStore for LocalFileStore {
    fn read(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut file = fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    fn resize(&self, len: u64) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?;
        file.set_len(len)?;
        Ok(())
    }

    fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn remove(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Make sure the destination exists with exactly `len` bytes.
///
/// A destination that already has the right size is left alone, so a resumed
/// transfer keeps the chunks it wrote earlier. Returns true if anything changed.
pub fn prepare_destination(store: &dyn ByteStore, len: u64) -> io::Result<bool> {
    if store.exists() && store.size()? == len {
        debug!(?store, len, "destination already allocated");
        return Ok(false);
    }
    store.resize(len)?;
    debug!(?store, len, "destination allocated");
    Ok(true)
}

/// Sequential `Read` over a byte store, for streaming digests.
pub struct StoreReader<'a> {
    store: &'a dyn ByteStore,
    pos: u64,
    len: u64,
}

/// Largest single read issued by [`StoreReader`]
const READ_BLOCK: usize = 1024 * 1024;

impl<'a> StoreReader<'a> {
    pub fn new(store: &'a dyn ByteStore) -> io::Result<Self> {
        let len = store.size()?;
        Ok(Self { store, pos: 0, len })
    }
}

impl Read for StoreReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len - self.pos;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(READ_BLOCK).min(remaining as usize);
        let data = self.store.read(self.pos, want)?;
        buf[..data.len()].copy_from_slice(&data);
        self.pos += data.len() as u64;
        Ok(data.len())
    }
}

/// BLAKE3 hex digest of a store's full contents.
pub fn digest_of_store(store: &dyn ByteStore) -> anyhow::Result<String> {
    let reader = StoreReader::new(store)?;
    let hash = ferry_chunks::hash_reader(reader)?;
    Ok(ferry_chunks::hash_to_hex(&hash))
}
