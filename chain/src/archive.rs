//! External storage collaborators.
//!
//! - [`ContentArchive`]: content-addressed blob store. `get(put(x)) == x`,
//!   addresses are SHA-256 of the content.
//! - [`StateBackend`]: key-value store holding one committed
//!   [`SubnetAggregatedDatum`] per `(subnet, epoch)`. Commits replace whole
//!   records; readers never see a partial datum.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::{ChainError, Result};
use crate::round::SubnetAggregatedDatum;
use crate::types::{Epoch, Hash, SubnetId};

// ---------------------------------------------------------------------------
// ContentArchive
// ---------------------------------------------------------------------------

pub trait ContentArchive: Send + Sync + fmt::Debug {
    /// Store `bytes` and return their content hash.
    fn put(&self, bytes: &[u8]) -> Result<Hash>;

    /// Fetch the blob stored under `content_hash`.
    fn get(&self, content_hash: &Hash) -> Result<Vec<u8>>;

    fn name(&self) -> &str;
}

/// Build the archive described by the storage config.
pub fn open_archive(config: &StorageConfig) -> Result<Arc<dyn ContentArchive>> {
    match &config.archive_dir {
        Some(dir) => Ok(Arc::new(FsArchive::open(dir)?)),
        None => Ok(Arc::new(MemoryArchive::new())),
    }
}

/// In-process archive. Availability can be switched off to simulate an
/// unreachable remote store.
#[derive(Debug)]
pub struct MemoryArchive {
    blobs: RwLock<HashMap<Hash, Vec<u8>>>,
    available: AtomicBool,
    writes: AtomicU64,
}

impl Default for MemoryArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            writes: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Successful writes so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Replace the blob under `content_hash` without re-addressing it.
    /// Simulates a faulty or malicious archive node.
    pub fn tamper(&self, content_hash: &Hash, bytes: Vec<u8>) {
        self.blobs.write().insert(*content_hash, bytes);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(ChainError::StorageUnavailable("memory archive offline".into()))
        }
    }
}

impl ContentArchive for MemoryArchive {
    fn put(&self, bytes: &[u8]) -> Result<Hash> {
        self.ensure_available()?;
        let content_hash = Hash::compute(bytes);
        self.blobs
            .write()
            .entry(content_hash)
            .or_insert_with(|| bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(content_hash)
    }

    fn get(&self, content_hash: &Hash) -> Result<Vec<u8>> {
        self.ensure_available()?;
        self.blobs
            .read()
            .get(content_hash)
            .cloned()
            .ok_or_else(|| ChainError::ArchiveMiss(content_hash.to_hex()))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Filesystem archive: one file per blob, named by the hex content hash.
#[derive(Debug)]
pub struct FsArchive {
    root: PathBuf,
}

impl FsArchive {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, content_hash: &Hash) -> PathBuf {
        self.root.join(content_hash.to_hex())
    }
}

impl ContentArchive for FsArchive {
    fn put(&self, bytes: &[u8]) -> Result<Hash> {
        let content_hash = Hash::compute(bytes);
        let path = self.blob_path(&content_hash);
        if path.exists() {
            return Ok(content_hash);
        }

        // Write then rename so a crash never leaves a truncated blob under
        // its final name.
        let tmp = path.with_extension("tmp");
        let write = || -> io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|err| {
            warn!(path = %path.display(), error = %err, "archive write failed");
            ChainError::StorageUnavailable(format!("{}: {err}", path.display()))
        })?;

        debug!(hash = %content_hash, size = bytes.len(), "blob archived");
        Ok(content_hash)
    }

    fn get(&self, content_hash: &Hash) -> Result<Vec<u8>> {
        let path = self.blob_path(content_hash);
        fs::read(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => ChainError::ArchiveMiss(content_hash.to_hex()),
            _ => ChainError::StorageUnavailable(format!("{}: {err}", path.display())),
        })
    }

    fn name(&self) -> &str {
        "filesystem"
    }
}

// ---------------------------------------------------------------------------
// StateBackend
// ---------------------------------------------------------------------------

pub trait StateBackend: Send + Sync + fmt::Debug {
    /// Atomically store `datum`, replacing any record for the same key.
    fn commit(&self, datum: SubnetAggregatedDatum) -> Result<()>;

    fn read(&self, subnet_id: SubnetId, epoch: Epoch) -> Result<Option<SubnetAggregatedDatum>>;

    /// Record with the highest epoch for `subnet_id`.
    fn latest(&self, subnet_id: SubnetId) -> Result<Option<SubnetAggregatedDatum>>;
}

#[derive(Debug)]
pub struct MemoryStateBackend {
    datums: RwLock<BTreeMap<(SubnetId, Epoch), SubnetAggregatedDatum>>,
    available: AtomicBool,
}

impl Default for MemoryStateBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self {
            datums: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.datums.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.datums.read().is_empty()
    }

    /// Every committed datum, ordered by subnet then epoch.
    pub fn all(&self) -> Vec<SubnetAggregatedDatum> {
        self.datums.read().values().cloned().collect()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChainError::StorageUnavailable("state backend offline".into()))
        }
    }
}

impl StateBackend for MemoryStateBackend {
    fn commit(&self, datum: SubnetAggregatedDatum) -> Result<()> {
        self.ensure_available()?;
        self.datums
            .write()
            .insert((datum.subnet_id, datum.epoch), datum);
        Ok(())
    }

    fn read(&self, subnet_id: SubnetId, epoch: Epoch) -> Result<Option<SubnetAggregatedDatum>> {
        self.ensure_available()?;
        Ok(self.datums.read().get(&(subnet_id, epoch)).cloned())
    }

    fn latest(&self, subnet_id: SubnetId) -> Result<Option<SubnetAggregatedDatum>> {
        self.ensure_available()?;
        Ok(self
            .datums
            .read()
            .range((subnet_id, 0)..=(subnet_id, Epoch::MAX))
            .next_back()
            .map(|(_, datum)| datum.clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
