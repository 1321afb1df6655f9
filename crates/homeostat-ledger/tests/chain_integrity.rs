//! Chain integrity tests
//!
//! Tampering, reordering and deletion must all be caught by verification,
//! and a tampered chain must be refused on restore.

use homeostat_common::{HomeostatError, LedgerError};
use homeostat_ledger::{
    EntryKind, JsonlLedgerStore, Ledger, LedgerConfig, LedgerEntry, LedgerStore,
};
use proptest::prelude::*;
use serde_json::json;

fn beat_entries(beats: usize) -> Vec<LedgerEntry> {
    let mut ledger = Ledger::new();
    for beat in 0..beats {
        ledger
            .append(EntryKind::Pulse, json!({ "beat": beat, "value": 0.0042 }))
            .unwrap();
        ledger
            .append(EntryKind::Action, json!({ "beat": beat, "action": "NOOP" }))
            .unwrap();
    }
    ledger.export()
}

fn integrity_index(result: homeostat_common::Result<Ledger>) -> u64 {
    match result {
        Err(HomeostatError::Ledger(LedgerError::Integrity { index, .. })) => index,
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("tampered chain was accepted"),
    }
}

#[test]
fn test_export_restore_round_trip() {
    let entries = beat_entries(5);
    let restored = Ledger::restore(entries.clone()).unwrap();
    assert_eq!(restored.chain_length(), 11);
    assert_eq!(restored.export(), entries);
    assert!(restored.verify_chain());
}

#[test]
fn test_tampered_payload_refused() {
    let mut entries = beat_entries(5);
    entries[4].payload["action"] = json!("QUARANTINE");
    assert_eq!(integrity_index(Ledger::restore(entries)), 4);
}

#[test]
fn test_reordered_entries_refused() {
    let mut entries = beat_entries(5);
    entries.swap(3, 4);
    assert_eq!(integrity_index(Ledger::restore(entries)), 3);
}

#[test]
fn test_deleted_entry_refused() {
    let mut entries = beat_entries(5);
    entries.remove(6);
    assert_eq!(integrity_index(Ledger::restore(entries)), 6);
}

#[test]
fn test_rehashed_forgery_breaks_linkage() {
    let mut entries = beat_entries(3);
    entries[2].payload = json!({ "forged": true });
    entries[2].hash = entries[2].compute_hash().unwrap();
    assert_eq!(integrity_index(Ledger::restore(entries)), 3);
}

#[test]
fn test_open_resumes_file_backed_chain() {
    let path = std::env::temp_dir().join(format!("homeostat-ledger-{}.jsonl", uuid::Uuid::now_v7()));
    let config = LedgerConfig {
        path: Some(path.clone()),
        flush_every: 1,
    };

    let first_manifest = {
        let mut ledger = Ledger::open(&config).unwrap();
        ledger.append(EntryKind::Pulse, json!({ "value": 0.0042 })).unwrap();
        ledger.flush().unwrap();
        ledger.manifest()
    };

    let mut ledger = Ledger::open(&config).unwrap();
    assert_eq!(ledger.manifest(), first_manifest);
    ledger.append(EntryKind::Action, json!({ "action": "NOOP" })).unwrap();
    ledger.flush().unwrap();

    let on_disk = JsonlLedgerStore::load(&path).unwrap();
    let hashes = |entries: &[LedgerEntry]| entries.iter().map(|e| e.hash.clone()).collect::<Vec<_>>();
    assert_eq!(hashes(&on_disk), hashes(ledger.entries()));
    assert!(Ledger::restore(on_disk).unwrap().verify_chain());

    std::fs::remove_file(&path).ok();
}

#[test]
fn test_tampered_file_fails_open() {
    let path = std::env::temp_dir().join(format!("homeostat-ledger-{}.jsonl", uuid::Uuid::now_v7()));
    let mut entries = beat_entries(2);
    entries[1].payload = json!({ "value": 1.0 });
    {
        let store = JsonlLedgerStore::open(&path, 1).unwrap();
        for entry in &entries {
            store.persist(entry).unwrap();
        }
    }

    let config = LedgerConfig {
        path: Some(path.clone()),
        flush_every: 1,
    };
    assert_eq!(integrity_index(Ledger::open(&config)), 1);

    std::fs::remove_file(&path).ok();
}

proptest! {
    #[test]
    fn prop_any_payload_mutation_detected(
        beats in 1usize..20,
        victim in any::<prop::sample::Index>(),
        value in any::<i64>(),
    ) {
        let mut entries = beat_entries(beats);
        let i = victim.index(entries.len());
        let replacement = json!({ "mutated": value });
        prop_assume!(entries[i].payload != replacement);
        entries[i].payload = replacement;
        prop_assert!(Ledger::restore(entries).is_err());
    }

    #[test]
    fn prop_every_entry_provable(beats in 1usize..30) {
        let ledger = Ledger::restore(beat_entries(beats)).unwrap();
        let root = ledger.manifest().merkle_root;
        for entry in ledger.entries() {
            let proof = ledger.prove(entry.index).unwrap();
            prop_assert_eq!(proof.root_hex(), root.clone());
            prop_assert!(proof.verify(&Ledger::leaf_hash(entry)));
        }
    }
}
