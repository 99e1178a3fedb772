//! Recovered EVM-level variables.
//!
//! A storage location, a calldata parameter or a transaction/block
//! property. Canonical `State` records are owned by the [`VarRegistry`];
//! trees refer to them through a [`StateRef`] handle carrying only the
//! path-sensitive parts (map/array keys and the SSA-like store generation),
//! so a type widened by a later path is visible everywhere the state is
//! mentioned.

use ethereum_types::U256;
use rustc_hash::{FxHashMap, FxHashSet};

use sema_lift::disasm::Language;
use sema_lift::value::Loc;

use crate::tree::TreeId;
use crate::types::{EvmType, WORD_BYTES};

/// Handle to a canonical state record in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId(pub u32);

/// A canonical storage variable.
#[derive(Debug, Clone)]
pub struct StateInfo {
    /// Slot index (a full 256-bit word: constant-folded hashed slots are
    /// huge).
    pub index: U256,
    /// Byte offset from the word's big end; `None` for dynamic values.
    pub offset: Option<u32>,
    /// Byte length inside the word; `None` for dynamic values.
    pub length: Option<u32>,
    pub ty: EvmType,
    pub is_public: bool,
    /// Accessor selector, for recovered public variables.
    pub signature: String,
    pub name: Option<String>,
    /// Path-sensitive store generations: rendered key string → locations
    /// of stores to that element, in path order.
    pub counts_mapping: FxHashMap<String, Vec<Loc>>,
}

impl StateInfo {
    pub fn is_dynamic_slot(&self) -> bool {
        self.offset.is_none() && self.length.is_none()
    }

    /// Count of stores at or before `loc` for the given element.
    pub fn counts_at(&self, keys_str: &str, loc: Loc) -> u32 {
        self.counts_mapping
            .get(keys_str)
            .map(|locs| locs.iter().take_while(|l| **l <= loc).count())
            .unwrap_or(0) as u32
    }
}

/// A use of a storage variable on one path: the canonical record plus the
/// keys addressing the element and the store generation at the use site.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRef {
    pub id: StateId,
    pub keys: Vec<TreeId>,
    pub counts: u32,
}

/// A calldata parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgRef {
    /// Word index of the parameter, or the raw byte offset when it is not
    /// head-aligned; -1 stands for the whole calldata.
    pub index: i64,
    pub is_dynamic: bool,
    /// Sub-field selector (`length`, `offset`) for dynamic parameters.
    pub keys: String,
}

impl ArgRef {
    /// Map a raw calldata byte offset to a parameter index: head words
    /// start at byte 4 and are 32 bytes apart.
    pub fn from_byte_offset(offset: i64, is_dynamic: bool, keys: String) -> ArgRef {
        let index = if offset >= 4 && (offset - 4) % 0x20 == 0 {
            (offset - 4) / 0x20
        } else {
            offset
        };
        ArgRef {
            index,
            is_dynamic,
            keys,
        }
    }
}

/// A recovered EVM-level variable.
#[derive(Debug, Clone, PartialEq)]
pub enum EvmVar {
    State(StateRef),
    Arg(ArgRef),
    /// A transaction or block property (`CALLER`, `TIMESTAMP`, …), or a
    /// bare constant standing in for one.
    Property(String),
}

impl EvmVar {
    pub fn as_state(&self) -> Option<&StateRef> {
        match self {
            EvmVar::State(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_arg(&self) -> Option<&ArgRef> {
        match self {
            EvmVar::Arg(a) => Some(a),
            _ => None,
        }
    }

    /// Whether the variable's recovered type is dynamically sized.
    pub fn is_dynamic(&self, registry: &VarRegistry) -> bool {
        match self {
            EvmVar::State(s) => {
                let mut ty = registry.state(s.id).ty.clone();
                ty.is_dynamic()
            }
            EvmVar::Arg(a) => a.is_dynamic,
            EvmVar::Property(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArgInfo {
    pub index: i64,
    pub is_dynamic: bool,
    pub keys: String,
}

/// Owner of the canonical state set, shared by every path of a run.
#[derive(Debug, Clone)]
pub struct VarRegistry {
    pub states: Vec<StateInfo>,
    /// Slots claimed by a dynamic value; any other packing proposal for
    /// the slot yields to the dynamic entry.
    pub dynamic_occupied: FxHashSet<U256>,
    pub args: Vec<ArgInfo>,
    /// Memoized tree-render → recovered variable.
    pub memo: FxHashMap<String, EvmVar>,
    pub language: Language,
}

impl Default for VarRegistry {
    fn default() -> Self {
        VarRegistry {
            states: Vec::new(),
            dynamic_occupied: FxHashSet::default(),
            args: Vec::new(),
            memo: FxHashMap::default(),
            language: Language::Solidity,
        }
    }
}

impl VarRegistry {
    pub fn new(language: Language) -> Self {
        VarRegistry {
            language,
            ..Default::default()
        }
    }

    pub fn state(&self, id: StateId) -> &StateInfo {
        &self.states[id.0 as usize]
    }

    pub fn state_mut(&mut self, id: StateId) -> &mut StateInfo {
        &mut self.states[id.0 as usize]
    }

    /// Canonicalize a recovered state. A slot already claimed as dynamic
    /// absorbs every proposal; a dynamic proposal replaces whatever static
    /// packing was recorded for the slot (keeping name and visibility);
    /// otherwise distinct packings of one slot coexist.
    pub fn get_or_insert_state(
        &mut self,
        index: U256,
        offset: Option<u32>,
        length: Option<u32>,
        ty: EvmType,
    ) -> StateId {
        let candidate_dynamic = offset.is_none() && length.is_none();
        for (i, info) in self.states.iter_mut().enumerate() {
            if info.index != index {
                continue;
            }
            if self.dynamic_occupied.contains(&index) {
                return StateId(i as u32);
            }
            if !candidate_dynamic && info.offset == offset && info.length == length {
                return StateId(i as u32);
            }
            if candidate_dynamic {
                info.offset = None;
                info.length = None;
                info.ty = ty;
                self.dynamic_occupied.insert(index);
                return StateId(i as u32);
            }
        }
        if candidate_dynamic {
            self.dynamic_occupied.insert(index);
        }
        self.states.push(StateInfo {
            index,
            offset,
            length,
            ty,
            is_public: false,
            signature: String::new(),
            name: None,
            counts_mapping: FxHashMap::default(),
        });
        StateId((self.states.len() - 1) as u32)
    }

    /// Canonicalize a calldata parameter; a dynamic sighting upgrades the
    /// stored record, and the first-seen keys win.
    pub fn get_or_insert_arg(&mut self, candidate: ArgRef) -> ArgRef {
        for info in &mut self.args {
            if info.index == candidate.index {
                if candidate.is_dynamic {
                    info.is_dynamic = true;
                }
                return ArgRef {
                    index: info.index,
                    is_dynamic: info.is_dynamic,
                    keys: info.keys.clone(),
                };
            }
        }
        self.args.push(ArgInfo {
            index: candidate.index,
            is_dynamic: candidate.is_dynamic,
            keys: candidate.keys.clone(),
        });
        candidate
    }

    /// Forget per-path state between paths.
    pub fn reset_path_sensitive(&mut self) {
        for state in &mut self.states {
            state.counts_mapping.clear();
        }
    }
}

/// Convert a low-end byte offset (as bit-shift analysis produces) into the
/// big-endian byte position stored on the state record.
pub fn big_endian_offset(low_offset: u32, length: u32) -> Option<u32> {
    WORD_BYTES.checked_sub(low_offset + length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeHints;

    fn plain_type(length: u32) -> EvmType {
        EvmType::new(TypeHints::default(), Some(length))
    }

    #[test]
    fn equal_packings_canonicalize_to_one_record() {
        let mut reg = VarRegistry::default();
        let a = reg.get_or_insert_state(U256::zero(), Some(0), Some(32), plain_type(32));
        let b = reg.get_or_insert_state(U256::zero(), Some(0), Some(32), plain_type(32));
        assert_eq!(a, b);
        assert_eq!(reg.states.len(), 1);
    }

    #[test]
    fn packed_fields_of_one_slot_coexist() {
        let mut reg = VarRegistry::default();
        let low = reg.get_or_insert_state(U256::from(5), Some(16), Some(16), plain_type(16));
        let high = reg.get_or_insert_state(U256::from(5), Some(0), Some(16), plain_type(16));
        assert_ne!(low, high);
        assert_eq!(reg.states.len(), 2);
    }

    #[test]
    fn dynamic_proposal_wins_the_slot() {
        let mut reg = VarRegistry::default();
        let first = reg.get_or_insert_state(U256::one(), Some(0), Some(32), plain_type(32));
        reg.state_mut(first).name = Some("supply".to_string());
        let dynamic = reg.get_or_insert_state(U256::one(), None, None, EvmType::default());
        assert_eq!(first, dynamic);
        assert!(reg.state(first).is_dynamic_slot());
        assert_eq!(reg.state(first).name.as_deref(), Some("supply"));
        // Once dynamic, later packings collapse onto the dynamic record.
        let late = reg.get_or_insert_state(U256::one(), Some(0), Some(16), plain_type(16));
        assert_eq!(late, first);
    }

    #[test]
    fn arg_byte_offsets_become_indices() {
        assert_eq!(ArgRef::from_byte_offset(4, false, String::new()).index, 0);
        assert_eq!(ArgRef::from_byte_offset(0x24, false, String::new()).index, 1);
        assert_eq!(ArgRef::from_byte_offset(7, false, String::new()).index, 7);
    }

    #[test]
    fn counts_follow_store_locations() {
        let mut info = StateInfo {
            index: U256::zero(),
            offset: Some(0),
            length: Some(32),
            ty: plain_type(32),
            is_public: false,
            signature: String::new(),
            name: None,
            counts_mapping: FxHashMap::default(),
        };
        info.counts_mapping.insert(String::new(), vec![3, 8]);
        assert_eq!(info.counts_at("", 2), 0);
        assert_eq!(info.counts_at("", 3), 1);
        assert_eq!(info.counts_at("", 9), 2);
    }
}
