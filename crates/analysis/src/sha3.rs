//! Pre-known keccak256 constant substitution.
//!
//! Optimizing compilers constant-fold the `keccak256(key ++ slot)` of
//! frequently-used mapping accesses, leaving a bare 32-byte constant in the
//! bytecode. A side table maps such constants back to `(key, index)` pairs
//! so slot recovery still works. Entries are verified against a real
//! keccak256 of the 64-byte preimage at load time; mismatching entries are
//! dropped with a warning.

use std::collections::HashMap;
use std::path::Path;

use ethereum_types::U256;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use sha3::{Digest, Keccak256};
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
struct RawEntry {
    key: u64,
    index: u64,
}

/// Mapping from a folded keccak256 output to the `(key, slot)` preimage.
#[derive(Debug, Clone, Default)]
pub struct Sha3Table {
    entries: FxHashMap<U256, (U256, U256)>,
}

fn parse_hash(raw: &str) -> Option<U256> {
    let trimmed = raw.trim().trim_start_matches("0x");
    U256::from_str_radix(trimmed, 16).ok()
}

/// keccak256 of the 64-byte `key ++ index` preimage, the shape Solidity
/// uses for mapping slots.
pub fn mapping_slot_hash(key: U256, index: U256) -> U256 {
    let mut preimage = [0u8; 64];
    preimage[..32].copy_from_slice(&key.to_big_endian());
    preimage[32..].copy_from_slice(&index.to_big_endian());
    let digest = Keccak256::digest(preimage);
    U256::from_big_endian(&digest)
}

impl Sha3Table {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, hash: &U256) -> Option<(U256, U256)> {
        self.entries.get(hash).copied()
    }

    pub fn insert(&mut self, hash: U256, key: U256, index: U256) {
        self.entries.insert(hash, (key, index));
    }

    /// Parse a `hash → {key, index}` JSON document, keeping only entries
    /// whose hash matches the keccak256 of their claimed preimage.
    pub fn from_json(raw: &str) -> Result<Sha3Table, serde_json::Error> {
        let parsed: HashMap<String, RawEntry> = serde_json::from_str(raw)?;
        let mut table = Sha3Table::default();
        for (hash_str, entry) in parsed {
            let Some(hash) = parse_hash(&hash_str) else {
                warn!(hash = %hash_str, "sha3 table entry with unparseable hash dropped");
                continue;
            };
            let key = U256::from(entry.key);
            let index = U256::from(entry.index);
            if mapping_slot_hash(key, index) != hash {
                warn!(hash = %hash_str, "sha3 table entry does not hash to its preimage, dropped");
                continue;
            }
            table.insert(hash, key, index);
        }
        Ok(table)
    }

    /// Load `sha3_mappings.json` from `dir` when present; an absent file is
    /// an empty table, a malformed one is an error.
    pub fn load_from_dir(dir: &Path) -> Result<Sha3Table, serde_json::Error> {
        let path = dir.join("sha3_mappings.json");
        match std::fs::read_to_string(&path) {
            Ok(raw) => Sha3Table::from_json(&raw),
            Err(_) => Ok(Sha3Table::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verified_entry_survives_loading() {
        let hash = mapping_slot_hash(U256::from(7), U256::from(1));
        let raw = format!(r#"{{ "{hash:#x}": {{ "key": 7, "index": 1 }} }}"#);
        let table = Sha3Table::from_json(&raw).unwrap();
        assert_eq!(table.lookup(&hash), Some((U256::from(7), U256::from(1))));
    }

    #[test]
    fn mismatching_entry_is_dropped() {
        let raw = format!(r#"{{ "{:#x}": {{ "key": 7, "index": 1 }} }}"#, U256::from(1234));
        let table = Sha3Table::from_json(&raw).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn known_vector() {
        // keccak256(uint256(0) ++ uint256(0)), the slot of mapping(0 => ..)[0]
        let hash = mapping_slot_hash(U256::zero(), U256::zero());
        let expected = parse_hash("ad3228b676f7d3cd4284a5443f17f1962b36e491b30a40b2405849e597ba5fb5").unwrap();
        assert_eq!(hash, expected);
    }
}
