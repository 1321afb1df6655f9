//! Hashing primitives for Homeostat
//!
//! This module provides:
//! - Canonical JSON encoding so equal payloads always hash identically
//! - The chained digest used by ledger entries
//! - Merkle tree operations for ledger manifests

pub mod merkle;

pub use merkle::{MerkleProof, MerkleTree, ProofStep, Side, HASH_SIZE};

use crate::Result;

/// Previous-hash pointer of the genesis entry (64 zero hex characters)
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Serialize a JSON value canonically.
///
/// `serde_json::Value` objects are backed by a sorted map, so keys come out
/// in lexicographic order, and the compact writer emits no whitespace.
pub fn canonical_json(value: &serde_json::Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Chained digest: `BLAKE3(previous_hash ‖ payload_bytes)` as lowercase hex
pub fn chain_digest(previous_hash: &str, payload_bytes: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(payload_bytes);
    hasher.finalize().to_hex().to_string()
}

/// Decode a 64-character hex digest into raw bytes
pub fn decode_digest(digest: &str) -> Option<[u8; HASH_SIZE]> {
    let bytes = hex::decode(digest).ok()?;
    bytes.try_into().ok()
}
