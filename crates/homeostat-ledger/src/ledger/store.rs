//! Ledger durability collaborators
//!
//! The ledger itself lives in memory; a [`LedgerStore`] receives every
//! appended entry. Write failures propagate to the caller, which treats them
//! as unrecoverable.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use homeostat_common::{LedgerError, Result};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::entry::LedgerEntry;

/// Entries buffered by the file store before an implicit flush
pub const DEFAULT_FLUSH_EVERY: usize = 100;

/// Ledger entry sink
pub trait LedgerStore: Send + Sync {
    /// Persist one appended entry
    fn persist(&self, entry: &LedgerEntry) -> Result<()>;

    /// Flush pending entries to durable storage
    fn flush(&self) -> Result<()>;
}

/// In-memory store (for tests and ephemeral nodes)
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    entries: RwLock<Vec<LedgerEntry>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything persisted so far
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn persist(&self, entry: &LedgerEntry) -> Result<()> {
        self.entries.write().push(entry.clone());
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// JSON-lines file store: one persisted-shape entry per line
pub struct JsonlLedgerStore {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    pending: Mutex<usize>,
    flush_every: usize,
}

impl JsonlLedgerStore {
    /// Open (or create) a store appending to `path`
    pub fn open(path: impl AsRef<Path>, flush_every: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| store_error(&path, e))?;

        info!(path = %path.display(), "Opened ledger store");

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            pending: Mutex::new(0),
            flush_every: flush_every.max(1),
        })
    }

    /// Path backing this store
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every entry from a JSON-lines file (empty when the file is absent)
    pub fn load(path: impl AsRef<Path>) -> Result<Vec<LedgerEntry>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(path).map_err(|e| store_error(path, e))?;
        let mut entries = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| store_error(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: LedgerEntry = serde_json::from_str(&line).map_err(|e| {
                LedgerError::Store(format!(
                    "{}:{}: invalid entry: {}",
                    path.display(),
                    line_no + 1,
                    e
                ))
            })?;
            entries.push(entry);
        }

        debug!(path = %path.display(), count = entries.len(), "Loaded ledger entries");
        Ok(entries)
    }
}

impl LedgerStore for JsonlLedgerStore {
    fn persist(&self, entry: &LedgerEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        {
            let mut writer = self.writer.lock();
            writer
                .write_all(line.as_bytes())
                .and_then(|_| writer.write_all(b"\n"))
                .map_err(|e| store_error(&self.path, e))?;
        }

        let mut pending = self.pending.lock();
        *pending += 1;
        if *pending >= self.flush_every {
            drop(pending);
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush().map_err(|e| store_error(&self.path, e))?;
        let mut pending = self.pending.lock();
        if *pending > 0 {
            debug!(path = %self.path.display(), count = *pending, "Flushed ledger store");
        }
        *pending = 0;
        Ok(())
    }
}

fn store_error(path: &Path, err: std::io::Error) -> homeostat_common::HomeostatError {
    LedgerError::Store(format!("{}: {}", path.display(), err)).into()
}
