//! # Homeostat Ledger
//!
//! Hash-chained, append-only record of every beat: the pulse, each scoring
//! core's result and the chosen action.
//!
//! ## Chain
//!
//! ```text
//! hash(n) = BLAKE3(hash(n-1) ‖ canonical(payload(n)))
//! hash(-1) = 00…00 (64 hex zeros)
//! ```
//!
//! Tampering with a payload, reordering entries or deleting one breaks either
//! a recomputed hash or the previous-hash linkage, and `verify_chain` reports
//! it. The ledger never repairs a broken chain.
//!
//! ## Components
//!
//! - **Ledger**: in-memory chain, manifest and inclusion proofs
//! - **SharedLedger**: mutex-serialized handle for multiple writers
//! - **LedgerStore**: durability collaborator (memory, JSON-lines file)

pub mod ledger;

pub use ledger::chain::{Ledger, LedgerManifest, SharedLedger};
pub use ledger::entry::{EntryKind, LedgerEntry};
pub use ledger::store::{JsonlLedgerStore, LedgerStore, MemoryLedgerStore};

use serde::{Deserialize, Serialize};

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// JSON-lines file backing the ledger (in-memory only when unset)
    pub path: Option<std::path::PathBuf>,
    /// Entries buffered before the file store flushes
    pub flush_every: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: None,
            flush_every: ledger::store::DEFAULT_FLUSH_EVERY,
        }
    }
}
