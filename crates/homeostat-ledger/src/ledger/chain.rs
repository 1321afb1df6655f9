//! Hash-chained ledger

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use homeostat_common::crypto::merkle::hash_leaf;
use homeostat_common::crypto::{
    chain_digest, decode_digest, MerkleProof, MerkleTree, GENESIS_PREVIOUS_HASH, HASH_SIZE,
};
use homeostat_common::{unix_seconds, HomeostatError, LedgerError, Result, VERSION};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::entry::{EntryKind, LedgerEntry};
use super::store::{JsonlLedgerStore, LedgerStore};
use crate::LedgerConfig;

/// Message carried by every genesis entry
const GENESIS_MESSAGE: &str = "homeostat ledger genesis";

/// Integrity fingerprint of a whole chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerManifest {
    /// Merkle root over every entry hash (hex)
    pub merkle_root: String,
    /// Number of entries, genesis included
    pub chain_length: u64,
}

/// Append-only chain of [`LedgerEntry`] values
pub struct Ledger {
    entries: Vec<LedgerEntry>,
    store: Option<Arc<dyn LedgerStore>>,
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("chain_length", &self.entries.len())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    /// In-memory ledger holding only the genesis entry
    pub fn new() -> Self {
        // Keys in canonical (sorted) order; neither value needs escaping
        let canonical = format!(
            r#"{{"message":"{}","version":"{}"}}"#,
            GENESIS_MESSAGE, VERSION
        );
        let genesis = LedgerEntry {
            index: 0,
            timestamp: unix_seconds(),
            kind: EntryKind::Genesis,
            payload: serde_json::json!({ "message": GENESIS_MESSAGE, "version": VERSION }),
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            hash: chain_digest(GENESIS_PREVIOUS_HASH, canonical.as_bytes()),
        };

        Self {
            entries: vec![genesis],
            store: None,
        }
    }

    /// Fresh ledger whose genesis and later entries go to `store`
    pub fn with_store(store: Arc<dyn LedgerStore>) -> Result<Self> {
        let mut ledger = Self::new();
        for entry in &ledger.entries {
            store.persist(entry)?;
        }
        ledger.store = Some(store);
        Ok(ledger)
    }

    /// Rebuild a ledger from exported entries, refusing a broken chain
    pub fn restore(entries: Vec<LedgerEntry>) -> Result<Self> {
        if entries.is_empty() {
            return Ok(Self::new());
        }

        let ledger = Self {
            entries,
            store: None,
        };
        ledger.ensure_intact()?;
        debug!(chain_length = ledger.entries.len(), "Restored ledger");
        Ok(ledger)
    }

    /// Open the ledger described by `config`.
    ///
    /// Without a path the ledger is in-memory. With one, existing entries are
    /// loaded and verified, and new entries are appended to the same file.
    pub fn open(config: &LedgerConfig) -> Result<Self> {
        let Some(path) = &config.path else {
            return Ok(Self::new());
        };

        let existing = JsonlLedgerStore::load(path)?;
        let store: Arc<dyn LedgerStore> =
            Arc::new(JsonlLedgerStore::open(path, config.flush_every)?);

        let ledger = if existing.is_empty() {
            Self::with_store(store)?
        } else {
            let mut ledger = Self::restore(existing)?;
            ledger.attach_store(store);
            ledger
        };

        info!(
            path = %path.display(),
            chain_length = ledger.chain_length(),
            "Ledger opened"
        );
        Ok(ledger)
    }

    /// Route future appends to `store` (existing entries are not re-persisted)
    pub fn attach_store(&mut self, store: Arc<dyn LedgerStore>) {
        self.store = Some(store);
    }

    /// Append an entry, chaining it onto the current tip.
    ///
    /// The entry is persisted before it becomes visible; a store failure
    /// leaves the chain unchanged.
    pub fn append(&mut self, kind: EntryKind, payload: serde_json::Value) -> Result<LedgerEntry> {
        let previous_hash = self
            .entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS_PREVIOUS_HASH.to_string());

        let hash = LedgerEntry::digest(&previous_hash, &payload)?;
        let entry = LedgerEntry {
            index: self.entries.len() as u64,
            timestamp: unix_seconds(),
            kind,
            payload,
            previous_hash,
            hash,
        };

        if let Some(store) = &self.store {
            store.persist(&entry)?;
        }

        trace!(index = entry.index, kind = %entry.kind, "Ledger append");
        self.entries.push(entry.clone());
        Ok(entry)
    }

    /// Serialize `payload` and append it
    pub fn record<T: Serialize>(&mut self, kind: EntryKind, payload: &T) -> Result<LedgerEntry> {
        let value = serde_json::to_value(payload)?;
        self.append(kind, value)
    }

    /// Check every entry: contiguous indices, previous-hash linkage and
    /// recomputed hashes. Returns the first violation found.
    pub fn ensure_intact(&self) -> Result<()> {
        for (position, entry) in self.entries.iter().enumerate() {
            let index = position as u64;
            let violation = |reason: String| -> HomeostatError {
                LedgerError::Integrity { index, reason }.into()
            };

            if entry.index != index {
                return Err(violation(format!("index field is {}", entry.index)));
            }

            let expected_previous = match position {
                0 => GENESIS_PREVIOUS_HASH,
                _ => self.entries[position - 1].hash.as_str(),
            };
            if entry.previous_hash != expected_previous {
                return Err(violation("previous hash does not link".to_string()));
            }

            if entry.compute_hash()? != entry.hash {
                return Err(violation("hash mismatch".to_string()));
            }
        }
        Ok(())
    }

    /// Whether the whole chain verifies
    pub fn verify_chain(&self) -> bool {
        match self.ensure_intact() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Ledger verification failed");
                false
            }
        }
    }

    /// Number of entries, genesis included
    pub fn chain_length(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Merkle root over the chain plus its length
    pub fn manifest(&self) -> LedgerManifest {
        let root = self
            .merkle_tree()
            .root()
            .map(hex::encode)
            .unwrap_or_else(|| GENESIS_PREVIOUS_HASH.to_string());

        LedgerManifest {
            merkle_root: root,
            chain_length: self.chain_length(),
        }
    }

    /// Inclusion proof for the entry at `index` against the current manifest
    pub fn prove(&self, index: u64) -> Result<MerkleProof> {
        let len = self.chain_length();
        if index >= len {
            return Err(LedgerError::IndexOutOfRange { index, len }.into());
        }
        self.merkle_tree()
            .proof(index)
            .ok_or_else(|| LedgerError::IndexOutOfRange { index, len }.into())
    }

    /// Merkle leaf for an entry: its decoded hash
    pub fn leaf_hash(entry: &LedgerEntry) -> [u8; HASH_SIZE] {
        decode_digest(&entry.hash).unwrap_or_else(|| hash_leaf(entry.hash.as_bytes()))
    }

    fn merkle_tree(&self) -> MerkleTree {
        MerkleTree::build(self.entries.iter().map(Self::leaf_hash).collect())
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Entries with indices in `range`, clamped to the chain
    pub fn entries_in(&self, range: Range<u64>) -> &[LedgerEntry] {
        let len = self.entries.len();
        let start = usize::try_from(range.start).unwrap_or(len).min(len);
        let end = usize::try_from(range.end).unwrap_or(len).min(len);
        &self.entries[start..end.max(start)]
    }

    pub fn get(&self, index: u64) -> Option<&LedgerEntry> {
        usize::try_from(index).ok().and_then(|i| self.entries.get(i))
    }

    pub fn latest(&self) -> Option<&LedgerEntry> {
        self.entries.last()
    }

    /// Owned copy of the chain, suitable for [`Ledger::restore`]
    pub fn export(&self) -> Vec<LedgerEntry> {
        self.entries.clone()
    }

    /// Flush the attached store, if any
    pub fn flush(&self) -> Result<()> {
        match &self.store {
            Some(store) => store.flush(),
            None => Ok(()),
        }
    }
}

/// Cloneable handle serializing appends from several writers
#[derive(Debug, Clone, Default)]
pub struct SharedLedger(Arc<Mutex<Ledger>>);

impl SharedLedger {
    pub fn new(ledger: Ledger) -> Self {
        Self(Arc::new(Mutex::new(ledger)))
    }

    pub fn append(&self, kind: EntryKind, payload: serde_json::Value) -> Result<LedgerEntry> {
        self.0.lock().append(kind, payload)
    }

    pub fn record<T: Serialize>(&self, kind: EntryKind, payload: &T) -> Result<LedgerEntry> {
        self.0.lock().record(kind, payload)
    }

    pub fn verify_chain(&self) -> bool {
        self.0.lock().verify_chain()
    }

    pub fn ensure_intact(&self) -> Result<()> {
        self.0.lock().ensure_intact()
    }

    pub fn chain_length(&self) -> u64 {
        self.0.lock().chain_length()
    }

    pub fn manifest(&self) -> LedgerManifest {
        self.0.lock().manifest()
    }

    pub fn prove(&self, index: u64) -> Result<MerkleProof> {
        self.0.lock().prove(index)
    }

    pub fn get(&self, index: u64) -> Option<LedgerEntry> {
        self.0.lock().get(index).cloned()
    }

    pub fn latest(&self) -> Option<LedgerEntry> {
        self.0.lock().latest().cloned()
    }

    pub fn export(&self) -> Vec<LedgerEntry> {
        self.0.lock().export()
    }

    pub fn flush(&self) -> Result<()> {
        self.0.lock().flush()
    }

    /// Run `f` with the ledger locked
    pub fn with<R>(&self, f: impl FnOnce(&Ledger) -> R) -> R {
        f(&self.0.lock())
    }
}
