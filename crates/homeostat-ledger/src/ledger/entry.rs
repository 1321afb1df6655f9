//! Ledger entries
//!
//! The serialized form of [`LedgerEntry`] is also the persisted shape:
//! `{index, timestamp, kind, payload, previous_hash, hash}`.

use std::fmt;

use homeostat_common::crypto::{canonical_json, chain_digest};
use homeostat_common::Result;
use serde::{Deserialize, Serialize};

/// What a ledger entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    /// First entry of every chain
    Genesis,
    /// A generated pulse
    Pulse,
    /// One scoring core's result
    CoreResult,
    /// The action selected for a beat
    Action,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::Genesis => write!(f, "genesis"),
            EntryKind::Pulse => write!(f, "pulse"),
            EntryKind::CoreResult => write!(f, "core-result"),
            EntryKind::Action => write!(f, "action"),
        }
    }
}

/// Single entry in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Position in the chain, starting at 0
    pub index: u64,
    /// Append time (Unix seconds)
    pub timestamp: f64,
    /// Entry kind
    pub kind: EntryKind,
    /// Recorded payload
    pub payload: serde_json::Value,
    /// Hash of the previous entry (hex)
    pub previous_hash: String,
    /// `BLAKE3(previous_hash ‖ canonical(payload))` (hex)
    pub hash: String,
}

impl LedgerEntry {
    /// Recompute this entry's hash from its payload and previous-hash pointer
    pub fn compute_hash(&self) -> Result<String> {
        Self::digest(&self.previous_hash, &self.payload)
    }

    /// Hash for a payload chained onto `previous_hash`
    pub fn digest(previous_hash: &str, payload: &serde_json::Value) -> Result<String> {
        let bytes = canonical_json(payload)?;
        Ok(chain_digest(previous_hash, &bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homeostat_common::crypto::GENESIS_PREVIOUS_HASH;
    use serde_json::json;

    #[test]
    fn test_kind_serialization() {
        assert_eq!(serde_json::to_value(EntryKind::CoreResult).unwrap(), json!("core-result"));
        assert_eq!(EntryKind::CoreResult.to_string(), "core-result");
    }

    #[test]
    fn test_digest_ignores_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{ "y": 2, "x": 1 }"#).unwrap();
        assert_eq!(
            LedgerEntry::digest(GENESIS_PREVIOUS_HASH, &a).unwrap(),
            LedgerEntry::digest(GENESIS_PREVIOUS_HASH, &b).unwrap()
        );
    }

    #[test]
    fn test_persisted_shape() {
        let payload = json!({"action": "NOOP"});
        let entry = LedgerEntry {
            index: 3,
            timestamp: 1.5,
            kind: EntryKind::Action,
            hash: LedgerEntry::digest(GENESIS_PREVIOUS_HASH, &payload).unwrap(),
            payload,
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
        };
        let value = serde_json::to_value(&entry).unwrap();
        for key in ["index", "timestamp", "kind", "payload", "previous_hash", "hash"] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(value["kind"], "action");
    }
}
