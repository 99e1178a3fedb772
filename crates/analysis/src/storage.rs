//! Storage-variable recovery.
//!
//! Given a tree rooted at an `SLOAD` (or a constant slot index), the
//! backward pass walks the index expression to recover the slot and the
//! map/array keys addressing it, and the forward pass inspects the load's
//! consumers (masks, shifts, sign extensions) to recover the byte window
//! and type of the packed field. `SSTORE` values are matched against the
//! masked-OR update pattern compilers emit, possibly nested when several
//! packed fields are written in one store.

use ethereum_types::U256;

use sema_lift::opcodes::Opcode;
use sema_lift::value::Loc;

use crate::errors::AnalysisError;
use crate::render::{render_keys, render_tree};
use crate::solver::PathChecker;
use crate::tree::{NodeKind, TreeArena, TreeId};
use crate::types::{EvmType, TypeHints, WORD_BYTES};
use crate::vars::{ArgRef, EvmVar, StateRef, VarRegistry};

/// The shared analysis state of one run: the tree arena, the canonical
/// variable registry and the path feasibility checker.
#[derive(Debug, Default)]
pub struct Analyzer {
    pub arena: TreeArena,
    pub registry: VarRegistry,
    pub checker: PathChecker,
}

/// Hex digits of a constant, unpadded and without the `0x` prefix.
fn hex_digits(value: U256) -> String {
    format!("{value:x}")
}

/// True for masks of the shape `0x0…0f…f`.
fn is_low_mask(value: U256) -> bool {
    !value.is_zero() && hex_digits(value).bytes().all(|b| b == b'f')
}

/// Count of `f` digits in the mask, i.e. the masked nibble count.
fn mask_nibbles(value: U256) -> u32 {
    hex_digits(value).bytes().filter(|b| *b == b'f').count() as u32
}

/// True for `0x10…0`-shaped constants (a power of 256 used as a shift).
fn is_shift_constant(value: U256) -> bool {
    let digits = hex_digits(value);
    let mut bytes = digits.bytes();
    bytes.next() == Some(b'1') && bytes.all(|b| b == b'0')
}

/// `log2(value) / 8` when value is a power of two, as the byte offset a
/// `DIV 2^k` encodes.
fn shift_byte_offset(value: U256) -> Option<u32> {
    if value.is_zero() {
        return None;
    }
    let tz = value.trailing_zeros();
    ((value >> tz) == U256::one()).then_some(tz / 8)
}

impl Analyzer {
    pub fn new(arena: TreeArena, registry: VarRegistry) -> Self {
        Analyzer {
            arena,
            registry,
            checker: PathChecker::default(),
        }
    }

    /// Clear per-path scratch state between paths.
    pub fn reset_path_sensitive(&mut self) {
        self.registry.reset_path_sensitive();
        self.checker.reset();
    }

    fn render(&self, tree: TreeId) -> String {
        render_tree(&self.arena, &self.registry, tree, true, true)
    }

    // ─── Forward analysis: offset and length inside the slot ───────────

    /// Inspect the consumers of an `SLOAD` to recover the low-end byte
    /// offset and length of the loaded field. Returns the outermost tree
    /// of the access pattern (the node the recovered variable aliases).
    fn forward_analysis(
        &mut self,
        tree: TreeId,
        hints: &mut TypeHints,
        from_sstore: bool,
    ) -> Result<(Option<u32>, Option<u32>, TreeId), AnalysisError> {
        let node = self.arena.node(tree);
        if node.kind.is_op(Opcode::SLOAD) {
            match node.father {
                None => Ok((Some(0), Some(WORD_BYTES), tree)),
                Some(father) => match &self.arena.node(father).kind {
                    NodeKind::Op(Opcode::AND) => self.forward_and(father, hints, from_sstore),
                    NodeKind::Op(Opcode::DIV) => self.forward_div(father, hints),
                    _ => Ok((Some(0), Some(WORD_BYTES), tree)),
                },
            }
        } else if node.kind.as_const().is_some() {
            Ok((Some(0), Some(WORD_BYTES), tree))
        } else {
            Err(AnalysisError::OutOfRules(format!(
                "forward analysis over {}",
                node.kind.label()
            )))
        }
    }

    /// `SLOAD → AND mask`.
    fn forward_and(
        &mut self,
        and_tree: TreeId,
        hints: &mut TypeHints,
        from_sstore: bool,
    ) -> Result<(Option<u32>, Option<u32>, TreeId), AnalysisError> {
        let mask = self
            .arena
            .const_son(and_tree)
            .and_then(|s| self.arena.const_of(s));
        if !from_sstore {
            if let Some(mask) = mask {
                let digits = hex_digits(mask);
                if digits.len() == 64 {
                    hints.is_higher_order = true;
                }
                if mask == U256::one() {
                    // A one-bit mask over a slot is the in-place short
                    // string/bytes flag.
                    hints.is_dynamic = true;
                    return Ok((None, None, and_tree));
                }
                let length = mask_nibbles(mask) / 2;
                return Ok((Some(0), Some(length), and_tree));
            }
            // AND(SLOAD, SUB ..): the dynamic-length masking idiom.
            let sons = &self.arena.node(and_tree).sons;
            if sons.len() == 2 {
                let labels: Vec<bool> = sons
                    .iter()
                    .map(|s| {
                        let k = &self.arena.node(*s).kind;
                        k.is_op(Opcode::SLOAD) || k.is_op(Opcode::SUB)
                    })
                    .collect();
                let has_sload = sons.iter().any(|s| self.arena.node(*s).kind.is_op(Opcode::SLOAD));
                let has_sub = sons.iter().any(|s| self.arena.node(*s).kind.is_op(Opcode::SUB));
                if labels.iter().all(|b| *b) && has_sload && has_sub {
                    hints.is_dynamic = true;
                    return Ok((None, None, and_tree));
                }
            }
            return Err(AnalysisError::OutOfRules(
                "SLOAD under AND with a non-constant mask".to_string(),
            ));
        }

        // Store side: the mask keeps the rest of the slot, so the field is
        // where its zeros are: trailing f nibbles give the offset, the zero
        // run above them the length.
        let Some(mask) = mask else {
            return Err(AnalysisError::OutOfRules(
                "store keep-mask is not constant".to_string(),
            ));
        };
        let padded = format!("{mask:064x}");
        let offset_nibbles = padded.bytes().rev().take_while(|b| *b == b'f').count();
        let length_nibbles = padded
            .bytes()
            .rev()
            .skip(offset_nibbles)
            .take_while(|b| *b == b'0')
            .count();
        if offset_nibbles % 2 != 0 || length_nibbles % 2 != 0 {
            return Err(AnalysisError::OutOfRules(format!(
                "keep-mask not byte aligned: {padded}"
            )));
        }
        Ok((
            Some((offset_nibbles / 2) as u32),
            Some((length_nibbles / 2) as u32),
            and_tree,
        ))
    }

    /// `SLOAD → DIV 2^k`, optionally refined by the grandfather.
    fn forward_div(
        &mut self,
        div_tree: TreeId,
        hints: &mut TypeHints,
    ) -> Result<(Option<u32>, Option<u32>, TreeId), AnalysisError> {
        let divisor = self
            .arena
            .node(div_tree)
            .sons
            .get(1)
            .and_then(|s| self.arena.const_of(*s))
            .ok_or_else(|| AnalysisError::OutOfRules("DIV divisor not constant".to_string()))?;
        let offset = shift_byte_offset(divisor)
            .ok_or_else(|| AnalysisError::OutOfRules("DIV divisor is not a power of two".to_string()))?;

        let Some(grandfather) = self.arena.node(div_tree).father else {
            return Ok((Some(offset), Some(WORD_BYTES), div_tree));
        };
        match self.arena.node(grandfather).kind.clone() {
            NodeKind::Op(Opcode::SIGNEXTEND) => {
                hints.is_signed = true;
                let bits = self
                    .arena
                    .node(grandfather)
                    .sons
                    .first()
                    .and_then(|s| self.arena.const_of(*s))
                    .ok_or_else(|| {
                        AnalysisError::OutOfRules("SIGNEXTEND width not constant".to_string())
                    })?;
                let length = u32::try_from(bits)
                    .map_err(|_| AnalysisError::OutOfRules("SIGNEXTEND width too large".to_string()))?
                    + 1;
                Ok((Some(offset), Some(length), grandfather))
            }
            NodeKind::Op(Opcode::AND) => {
                if let Some(ggf) = self.arena.node(grandfather).father {
                    if self.arena.node(ggf).kind.is_op(Opcode::ISZERO) {
                        hints.is_bool = true;
                    }
                }
                let mask = self
                    .arena
                    .const_son(grandfather)
                    .and_then(|s| self.arena.const_of(s))
                    .ok_or_else(|| AnalysisError::OutOfRules("AND mask not constant".to_string()))?;
                Ok((Some(offset), Some(mask_nibbles(mask) / 2), grandfather))
            }
            NodeKind::Op(Opcode::MUL) => {
                hints.is_higher_order = true;
                let mask = self
                    .arena
                    .const_son(grandfather)
                    .and_then(|s| self.arena.const_of(s))
                    .ok_or_else(|| AnalysisError::OutOfRules("MUL shift not constant".to_string()))?;
                let zeros = hex_digits(mask).bytes().filter(|b| *b == b'0').count() as u32;
                Ok((Some(offset), Some(WORD_BYTES - zeros / 2), grandfather))
            }
            kind => Err(AnalysisError::OutOfRules(format!(
                "SLOAD -> DIV -> {} is not a known pattern",
                kind.label()
            ))),
        }
    }

    // ─── Backward analysis: slot index and keys ────────────────────────

    /// Recover the slot index and the key trees addressing it.
    pub fn backward_analysis(
        &mut self,
        tree: TreeId,
        hints: &mut TypeHints,
    ) -> Result<(U256, Vec<TreeId>), AnalysisError> {
        let start = if self.arena.node(tree).kind.is_op(Opcode::SLOAD) {
            self.arena.node(tree).sons[0]
        } else {
            tree
        };
        let mut keys = Vec::new();
        let index = self.handle_index(start, hints, &mut keys)?;
        Ok((index, keys))
    }

    /// Solidity's slot grammar, one production per node shape:
    /// `T v` → slot; `T[10] v` → slot + n; `T[] v` → SHA3(slot) + n;
    /// `mapping v` → SHA3(key . slot).
    fn handle_index(
        &mut self,
        root: TreeId,
        hints: &mut TypeHints,
        keys: &mut Vec<TreeId>,
    ) -> Result<U256, AnalysisError> {
        let kind = self.arena.node(root).kind.clone();
        if kind.is_op(Opcode::SHA3) {
            return self.handle_sha3(root, hints, keys);
        }
        if kind.is_op(Opcode::ADD) {
            return self.handle_add(root, hints, keys);
        }
        match kind.as_const() {
            Some(value) => Ok(value),
            None => {
                hints.is_array = true;
                Ok(U256::zero())
            }
        }
    }

    fn handle_sha3(
        &mut self,
        root: TreeId,
        hints: &mut TypeHints,
        keys: &mut Vec<TreeId>,
    ) -> Result<U256, AnalysisError> {
        let sons = self.arena.node(root).sons.clone();
        match sons.len() {
            2 => {
                hints.is_mapping = true;
                hints.is_array = false;
                // Vyper hashes (slot, key); Solidity hashes (key, slot).
                let (key, slot) = if self.registry.language == sema_lift::disasm::Language::Vyper {
                    (sons[1], sons[0])
                } else {
                    (sons[0], sons[1])
                };
                keys.insert(0, key);
                self.handle_index(slot, hints, keys)
            }
            1 => {
                hints.is_array = true;
                hints.is_mapping = false;
                hints.is_dynamic = true;
                self.handle_index(sons[0], hints, keys)
            }
            n => Err(AnalysisError::OutOfRules(format!(
                "SHA3 with {n} operands in a slot expression"
            ))),
        }
    }

    /// Find the `SHA3` beneath a chain of `ADD`s, with the sibling index
    /// expression accumulated on the way down.
    fn add_has_sha3(&self, root: TreeId) -> Option<(TreeId, TreeId)> {
        let node = self.arena.node(root);
        if !node.kind.is_op(Opcode::ADD) || node.sons.len() != 2 {
            return None;
        }
        let (l, r) = (node.sons[0], node.sons[1]);
        if self.arena.node(l).kind.is_op(Opcode::SHA3) {
            return Some((l, r));
        }
        if self.arena.node(r).kind.is_op(Opcode::SHA3) {
            return Some((r, l));
        }
        if self.arena.node(l).kind.is_op(Opcode::ADD) {
            return self.add_has_sha3(l);
        }
        if self.arena.node(r).kind.is_op(Opcode::ADD) {
            return self.add_has_sha3(r);
        }
        None
    }

    fn handle_add(
        &mut self,
        root: TreeId,
        hints: &mut TypeHints,
        keys: &mut Vec<TreeId>,
    ) -> Result<U256, AnalysisError> {
        hints.is_array = true;
        if let Some((sha3_node, index_key)) = self.add_has_sha3(root) {
            hints.is_dynamic = true;
            keys.insert(0, index_key);
            return self.handle_index(sha3_node, hints, keys);
        }

        // The optimizer sometimes folds SHA3(slot) to a 32-byte constant
        // next to the element SLOAD: rebuild the hash node in place.
        let sons = self.arena.node(root).sons.clone();
        if sons.len() == 2 {
            for (const_side, sload_side) in [(sons[0], sons[1]), (sons[1], sons[0])] {
                let is_wide_const = self
                    .arena
                    .const_of(const_side)
                    .is_some_and(|v| hex_digits(v).len() == 64);
                if is_wide_const && self.arena.node(sload_side).kind.is_op(Opcode::SLOAD) {
                    hints.is_dynamic = true;
                    let hash_sons = self.arena.node(sload_side).sons.clone();
                    let rebuilt = self.arena.op(Opcode::SHA3, hash_sons);
                    let idx = if sons[0] == const_side { 0 } else { 1 };
                    self.arena.replace_son(root, idx, rebuilt);
                    return self.handle_index(rebuilt, hints, keys);
                }
            }
        }

        // Static array: the base is the right operand.
        let last = *sons.last().ok_or_else(|| {
            AnalysisError::OutOfRules("ADD without operands in a slot expression".to_string())
        })?;
        self.handle_index(last, hints, keys)
    }

    // ─── SLOAD analysis: the combined recovery ─────────────────────────

    /// Recover the state variable a load (or bare slot expression)
    /// addresses. Returns the reference (counts unfilled) and the
    /// outermost tree of the access pattern.
    pub fn sload_analysis(
        &mut self,
        tree: TreeId,
        from_sstore: bool,
    ) -> Result<(StateRef, TreeId), AnalysisError> {
        let mut hints = TypeHints::default();
        let (index, raw_keys) = self.backward_analysis(tree, &mut hints)?;
        let (mut offset, mut length, forward_tree) =
            match self.forward_analysis(tree, &mut hints, from_sstore) {
                Ok(result) => result,
                Err(_) => (Some(0), Some(WORD_BYTES), tree),
            };
        if hints.is_dynamic {
            offset = None;
            length = None;
        }
        // A static mapping element types as its element; the keys on the
        // reference carry the mapping structure.
        let mut type_hints = hints;
        if type_hints.is_mapping && !type_hints.is_dynamic {
            type_hints.is_mapping = false;
        }

        let mut ty = EvmType::new(type_hints, length);
        let stored = if ty.is_elementary() && !ty.is_dynamic() {
            match (offset, length) {
                (Some(o), Some(l)) => {
                    let be = crate::vars::big_endian_offset(o, l);
                    (be, be.is_some().then_some(l))
                }
                _ => (None, None),
            }
        } else {
            (None, None)
        };
        let id = self
            .registry
            .get_or_insert_state(index, stored.0, stored.1, ty);

        let mut keys = Vec::with_capacity(raw_keys.len());
        for key in raw_keys {
            keys.push(self.set_alias(key)?);
        }

        Ok((StateRef { id, keys, counts: 0 }, forward_tree))
    }

    // ─── Calldata analysis ─────────────────────────────────────────────

    fn calldata_backward(
        &mut self,
        root: TreeId,
        hints: &mut TypeHints,
    ) -> Result<i64, AnalysisError> {
        let son = *self
            .arena
            .node(root)
            .sons
            .first()
            .ok_or_else(|| AnalysisError::OutOfRules("CALLDATALOAD without operand".to_string()))?;
        if let Some(value) = self.arena.const_of(son) {
            return i64::try_from(value)
                .map_err(|_| AnalysisError::OutOfRules("calldata offset too large".to_string()));
        }
        if self.arena.node(son).kind.is_op(Opcode::ADD) {
            // Dynamic-parameter traffic: chase the innermost head load.
            hints.is_dynamic = true;
            hints.is_length = true;
            let mut dep = root;
            loop {
                let add = self.arena.node(dep).sons[0];
                let add_sons = self.arena.node(add).sons.clone();
                let mut loads = Vec::new();
                for add_son in add_sons {
                    loads.extend(self.arena.collect_ops(add_son, Opcode::CALLDATALOAD));
                }
                let Some(first) = loads.first().copied() else {
                    break;
                };
                dep = first;
                let dep_son = self.arena.node(dep).sons.first().copied();
                let son_is_add =
                    dep_son.is_some_and(|s| self.arena.node(s).kind.is_op(Opcode::ADD));
                if !son_is_add {
                    break;
                }
            }
            if dep != root && self.arena.node(dep).kind.is_op(Opcode::CALLDATALOAD) {
                return self.calldata_backward(dep, hints);
            }
            return Err(AnalysisError::OutOfRules(
                "calldata offset expression not recognized".to_string(),
            ));
        }
        Err(AnalysisError::OutOfRules(
            "calldata offset is neither constant nor ADD".to_string(),
        ))
    }

    /// Recover the parameter a `CALLDATALOAD` tree addresses.
    pub fn calldata_analysis(&mut self, tree: TreeId) -> Result<ArgRef, AnalysisError> {
        let mut hints = TypeHints::default();
        let offset = self.calldata_backward(tree, &mut hints)?;
        let keys = if hints.is_length { "length" } else { "" }.to_string();
        let arg = ArgRef::from_byte_offset(offset, hints.is_dynamic, keys);
        Ok(self.registry.get_or_insert_arg(arg))
    }

    // ─── SSTORE analysis ───────────────────────────────────────────────

    /// Match the masked-OR update pattern and return one `(state, value)`
    /// pair per packed field written by the store.
    pub fn sstore_analysis(
        &mut self,
        key_tree: TreeId,
        value_tree: TreeId,
    ) -> Result<Vec<(StateRef, TreeId)>, AnalysisError> {
        let mut updates = Vec::new();
        let value_kind = self.arena.node(value_tree).kind.clone();

        if value_kind.is_op(Opcode::OR) {
            let ors = self.arena.collect_ops(value_tree, Opcode::OR);
            let mut prev_sload_tree: Option<TreeId> = None;
            for (sstore_time, vtree) in ors.iter().rev().copied().enumerate() {
                // An optimizer may fold several stores into one OR chain;
                // peel the layer the previous iteration consumed.
                if sstore_time > 0 {
                    if let Some(sload_tree) = prev_sload_tree {
                        let peel = ors[ors.len() - sstore_time];
                        self.arena.overwrite(peel, sload_tree);
                    }
                }
                let sons = self.arena.node(vtree).sons.clone();
                if sons.len() != 2 {
                    return Err(AnalysisError::OutOfRules(
                        "OR with unexpected arity in a store value".to_string(),
                    ));
                }
                let mut hints = TypeHints::default();
                let (expected_index, _) = self.backward_analysis(key_tree, &mut hints)?;

                // The masked load and the shifted value sit on either side
                // of the OR; try both orders, then fall back to the store
                // key itself.
                let mut vv_tree = sons[0];
                let mut recovered = self.handle_or_side(sons[1])?;
                let mut sload_tree = recovered.as_ref().map(|(_, t)| *t);
                let matches_key = |this: &Self, r: &Option<(StateRef, TreeId)>| {
                    r.as_ref()
                        .is_some_and(|(s, _)| this.registry.state(s.id).index == expected_index)
                };
                if !matches_key(self, &recovered) {
                    recovered = self.handle_or_side(sons[0])?;
                    sload_tree = recovered.as_ref().map(|(_, t)| *t);
                    vv_tree = sons[1];
                    if !matches_key(self, &recovered) {
                        let (state, _) = self.sload_analysis(key_tree, false)?;
                        recovered = Some((state, vtree));
                        sload_tree = None;
                        vv_tree = vtree;
                    }
                }
                let Some((state, _)) = recovered else {
                    return Err(AnalysisError::OutOfRules(
                        "store value OR side is not a masked load".to_string(),
                    ));
                };
                prev_sload_tree = sload_tree;

                let value = self.extract_written_value(vv_tree, &state)?;
                self.arena.node_mut(value).father = None;
                updates.push((state, value));
            }
            return Ok(updates);
        }

        if value_kind.is_op(Opcode::AND) {
            let sload_son = self
                .arena
                .find_son(value_tree, |n| n.kind.is_op(Opcode::SLOAD));
            if let Some(sload_son) = sload_son {
                let mut hints = TypeHints::default();
                let (right_index, _) = self.backward_analysis(sload_son, &mut hints)?;
                let mut hints = TypeHints::default();
                let (left_index, _) = self.backward_analysis(key_tree, &mut hints)?;
                if right_index == left_index {
                    // Masking the slot's own value: the field is being
                    // cleared.
                    let other = self
                        .arena
                        .find_son(value_tree, |n| !n.kind.is_op(Opcode::SLOAD));
                    let (state, _) = self.sload_analysis(sload_son, true)?;
                    let length = self.registry.state(state.id).length;
                    let zeroes_out = match (length, other.and_then(|o| self.arena.const_of(o))) {
                        (Some(len), Some(mask)) => {
                            hex_digits(mask).bytes().filter(|b| *b == b'0').count() as u32
                                == len * 2
                        }
                        _ => false,
                    };
                    let value = if zeroes_out {
                        self.arena.constant(U256::zero())
                    } else {
                        value_tree
                    };
                    self.arena.node_mut(value).father = None;
                    updates.push((state, value));
                    return Ok(updates);
                }
            }
            let (state, _) = self.sload_analysis(key_tree, false)?;
            self.arena.node_mut(value_tree).father = None;
            updates.push((state, value_tree));
            return Ok(updates);
        }

        // No masking: the whole slot is overwritten.
        let (state, _) = self.sload_analysis(key_tree, false)?;
        let value = self.truncate_packed_const(value_tree, &state);
        self.arena.node_mut(value).father = None;
        updates.push((state, value));
        Ok(updates)
    }

    /// `AND(SLOAD(slot), keep_mask)` on one side of the update OR.
    fn handle_or_side(
        &mut self,
        tree: TreeId,
    ) -> Result<Option<(StateRef, TreeId)>, AnalysisError> {
        if !self.arena.node(tree).kind.is_op(Opcode::AND) {
            return Ok(None);
        }
        let Some(sload_son) = self
            .arena
            .find_son(tree, |n| n.kind.is_op(Opcode::SLOAD))
        else {
            return Ok(None);
        };
        let (state, _) = self.sload_analysis(sload_son, true)?;
        Ok(Some((state, sload_son)))
    }

    /// Unwrap the written value from its alignment scaffolding
    /// (`MUL` shift, bool double-negation, `DIV` for `bytesM`).
    fn extract_written_value(
        &mut self,
        vv_tree: TreeId,
        state: &StateRef,
    ) -> Result<TreeId, AnalysisError> {
        if self.arena.node(vv_tree).kind.is_op(Opcode::MUL) {
            let sons = self.arena.node(vv_tree).sons.clone();
            for son in &sons {
                if let Some(value) = self.unwrap_mul_side(*son)? {
                    return Ok(value);
                }
            }
            // MUL by a plain power-of-256 shift: take the other operand.
            if sons.len() == 2 {
                let l = self.arena.const_of(sons[0]);
                let r = self.arena.const_of(sons[1]);
                if l.is_some_and(is_shift_constant) {
                    return Ok(sons[1]);
                }
                if r.is_some_and(is_shift_constant) {
                    return Ok(sons[0]);
                }
            }
            return Err(AnalysisError::OutOfRules(
                "store value MUL side not recognized".to_string(),
            ));
        }
        Ok(self.truncate_packed_const(vv_tree, state))
    }

    fn unwrap_mul_side(&mut self, side: TreeId) -> Result<Option<TreeId>, AnalysisError> {
        let kind = self.arena.node(side).kind.clone();
        if kind.is_op(Opcode::AND) {
            // int<M> stores sign-extend before masking.
            if let Some(sx) = self
                .arena
                .find_son(side, |n| n.kind.is_op(Opcode::SIGNEXTEND))
            {
                let sons = self.arena.node(sx).sons.clone();
                return Ok(sons.get(1).copied());
            }
            return Ok(Some(side));
        }
        if kind.is_op(Opcode::ISZERO) {
            // bool stores double-negate.
            let inner = self
                .arena
                .find_son(side, |n| n.kind.is_op(Opcode::ISZERO))
                .ok_or_else(|| {
                    AnalysisError::OutOfRules("single ISZERO in a store value".to_string())
                })?;
            return Ok(self.arena.node(inner).sons.first().copied());
        }
        if kind.is_op(Opcode::DIV) {
            return Ok(self.arena.node(side).sons.first().copied());
        }
        Ok(None)
    }

    /// A constant written over a packed field may still carry the
    /// neighbouring bytes; shift them away.
    fn truncate_packed_const(&mut self, value: TreeId, state: &StateRef) -> TreeId {
        let info = self.registry.state(state.id);
        let (Some(offset), Some(length)) = (info.offset, info.length) else {
            return value;
        };
        if offset + length == WORD_BYTES {
            return value;
        }
        let Some(constant) = self.arena.const_of(value) else {
            return value;
        };
        let low_bytes = WORD_BYTES - offset - length;
        if hex_digits(constant).len() > (low_bytes * 2) as usize {
            return self.arena.constant(constant >> (low_bytes * 8));
        }
        value
    }

    // ─── Alias assignment ──────────────────────────────────────────────

    /// First `SLOAD` beneath the tree, whose location anchors the store
    /// generation of the read.
    fn first_sload_loc(&self, tree: TreeId) -> Option<Loc> {
        self.arena
            .collect_ops(tree, Opcode::SLOAD)
            .first()
            .and_then(|s| self.arena.node(*s).loc)
    }

    /// Store generation of a read through `access_tree`.
    pub fn compute_counts(&self, state: &StateRef, access_tree: TreeId) -> u32 {
        let Some(loc) = self.first_sload_loc(access_tree) else {
            return 0;
        };
        let keys_str = render_keys(&self.arena, &self.registry, &state.keys);
        self.registry.state(state.id).counts_at(&keys_str, loc)
    }

    /// Walk a tree, recognizing storage loads, calldata parameters and
    /// transaction properties, attaching an [`EvmVar`] alias to each
    /// recognized subtree. Returns the (possibly rewritten) root after
    /// type-cast removal.
    pub fn set_alias(&mut self, tree: TreeId) -> Result<TreeId, AnalysisError> {
        let mut states = Vec::new();
        let mut args = Vec::new();
        let mut properties = Vec::new();

        let mut queue = vec![tree];
        while let Some(current) = queue.pop() {
            let current_str = self.render(current);
            if let Some(memoized) = self.registry.memo.get(&current_str).cloned() {
                let alias = match memoized {
                    EvmVar::State(state) => {
                        let mut state = state;
                        state.counts = self.compute_counts(&state, current);
                        EvmVar::State(state)
                    }
                    other => other,
                };
                self.arena.node_mut(current).alias = Some(alias.clone());
                match alias {
                    EvmVar::State(_) => states.push(alias),
                    EvmVar::Arg(_) => args.push(alias),
                    EvmVar::Property(_) => properties.push(alias),
                }
                continue;
            }

            let kind = self.arena.node(current).kind.clone();
            match &kind {
                NodeKind::Op(Opcode::SLOAD) => {
                    let (mut state, forward_tree) = self.sload_analysis(current, false)?;
                    let forward_str = self.render(forward_tree);
                    self.registry
                        .memo
                        .insert(forward_str, EvmVar::State(state.clone()));
                    state.counts = self.compute_counts(&state, forward_tree);
                    let alias = EvmVar::State(state);
                    self.arena.node_mut(forward_tree).alias = Some(alias.clone());
                    self.arena
                        .node_mut(forward_tree)
                        .contained_states
                        .push(alias.clone());
                    states.push(alias);
                }
                NodeKind::Op(Opcode::CALLDATALOAD) => {
                    let arg = self.calldata_analysis(current)?;
                    let alias = EvmVar::Arg(arg);
                    self.registry.memo.insert(current_str, alias.clone());
                    self.arena.node_mut(current).alias = Some(alias.clone());
                    args.push(alias);
                }
                NodeKind::Source {
                    op: Opcode::CALLDATACOPY,
                    ..
                } => {
                    if let Some(alias) = self.calldatacopy_alias(current)? {
                        let alias = EvmVar::Arg(alias);
                        self.registry.memo.insert(current_str, alias.clone());
                        self.arena.node_mut(current).alias = Some(alias.clone());
                        args.push(alias);
                    }
                }
                NodeKind::Op(op) if op.is_property() => {
                    let alias = EvmVar::Property(kind.label());
                    self.registry.memo.insert(current_str, alias.clone());
                    self.arena.node_mut(current).alias = Some(alias.clone());
                    properties.push(alias);
                }
                NodeKind::Const(_) => {
                    let alias = EvmVar::Property(kind.label());
                    self.registry.memo.insert(current_str, alias.clone());
                    self.arena.node_mut(current).alias = Some(alias.clone());
                    properties.push(alias);
                }
                _ => {
                    queue.extend(self.arena.node(current).sons.iter().copied());
                }
            }
        }

        let tree = self.type_cast_removal(tree);
        let root = self.arena.node_mut(tree);
        root.contained_states = states;
        root.contained_args = args;
        root.contained_properties = properties;
        Ok(tree)
    }

    /// The aliasing rules for `CALLDATACOPY` sources: Vyper copies single
    /// parameters, Solidity copies dynamic tails and whole calldata.
    fn calldatacopy_alias(&mut self, current: TreeId) -> Result<Option<ArgRef>, AnalysisError> {
        let sons = self.arena.node(current).sons.clone();
        if sons.len() != 2 {
            return Ok(None);
        }
        let (src, len) = (sons[0], sons[1]);
        if self.arena.node(len).kind.is_op(Opcode::CALLDATALOAD) {
            return self.calldata_analysis(len).map(Some);
        }
        if self.arena.const_of(src) == Some(U256::zero())
            && self.arena.node(len).kind.is_op(Opcode::CALLDATASIZE)
        {
            return Ok(Some(self.registry.get_or_insert_arg(ArgRef {
                index: -1,
                is_dynamic: true,
                keys: String::new(),
            })));
        }
        if self.arena.node(src).kind.is_op(Opcode::ADD) {
            let loads = self.arena.collect_ops(src, Opcode::CALLDATALOAD);
            for load in loads {
                let Some(father) = self.arena.node(load).father else {
                    continue;
                };
                if !self.arena.node(father).kind.is_op(Opcode::ADD) {
                    continue;
                }
                let fsons = self.arena.node(father).sons.clone();
                if fsons.len() != 2 {
                    continue;
                }
                if self.arena.const_of(fsons[0]) == Some(U256::from(4)) {
                    return self.calldata_analysis(fsons[1]).map(Some);
                }
                if self.arena.const_of(fsons[1]) == Some(U256::from(4)) {
                    return self.calldata_analysis(fsons[0]).map(Some);
                }
            }
            return Ok(None);
        }
        if let Some(offset) = self.arena.const_of(src) {
            let offset = i64::try_from(offset)
                .map_err(|_| AnalysisError::OutOfRules("calldata copy offset too large".to_string()))?;
            return Ok(Some(self.registry.get_or_insert_arg(
                ArgRef::from_byte_offset(offset, false, String::new()),
            )));
        }
        Ok(None)
    }

    // ─── Type-cast removal ─────────────────────────────────────────────

    /// Strip the canonical cast scaffolding from a tree: `AND x 0x0…f…f`,
    /// `SIGNEXTEND n x`, `ISZERO ISZERO x` (marking one-byte fields bool),
    /// `SHR/SAR 0 x`. Arithmetic over aliased state widens its type to
    /// numeric. Rewrites happen through the whole tree; a new root may be
    /// returned.
    pub fn type_cast_removal(&mut self, tree: TreeId) -> TreeId {
        let tree = self.string_bytes_shift_removal(tree);
        let tree = self.cast_removal_step(tree);
        let mut queue = vec![tree];
        while let Some(current) = queue.pop() {
            let sons = self.arena.node(current).sons.clone();
            for (idx, son) in sons.into_iter().enumerate() {
                let replaced = self.cast_removal_step(son);
                self.arena.replace_son(current, idx, replaced);
                queue.push(replaced);
            }
        }
        tree
    }

    fn cast_removal_step(&mut self, tree: TreeId) -> TreeId {
        let mut current = tree;
        loop {
            if self.arena.node(current).alias.is_some() {
                return current;
            }
            let kind = self.arena.node(current).kind.clone();
            let sons = self.arena.node(current).sons.clone();
            match &kind {
                NodeKind::Op(Opcode::ISZERO) if sons.len() == 1 => {
                    let inner = sons[0];
                    if !self.arena.node(inner).kind.is_op(Opcode::ISZERO) {
                        return current;
                    }
                    let Some(value) = self.arena.node(inner).sons.first().copied() else {
                        return current;
                    };
                    // A double-negated one-byte field is a flag.
                    if let Some(EvmVar::State(state)) = self.arena.node(value).alias.clone() {
                        let info = self.registry.state_mut(state.id);
                        if info.length == Some(1) {
                            let mut ty = info.ty.clone();
                            if ty.is_elementary() {
                                info.ty.widen_to_bool();
                            }
                        }
                    }
                    current = value;
                }
                NodeKind::Op(Opcode::AND) if sons.len() == 2 => {
                    let l = self.arena.const_of(sons[0]);
                    let r = self.arena.const_of(sons[1]);
                    if l.is_some_and(is_low_mask) {
                        current = sons[1];
                    } else if r.is_some_and(is_low_mask) {
                        current = sons[0];
                    } else {
                        return current;
                    }
                }
                NodeKind::Op(Opcode::SIGNEXTEND) if sons.len() == 2 => {
                    current = sons[1];
                }
                NodeKind::Op(
                    Opcode::ADD
                    | Opcode::MUL
                    | Opcode::SUB
                    | Opcode::DIV
                    | Opcode::SDIV
                    | Opcode::MOD
                    | Opcode::SMOD
                    | Opcode::EXP,
                ) => {
                    for son in &sons {
                        if let Some(EvmVar::State(state)) = self.arena.node(*son).alias.clone() {
                            self.registry.state_mut(state.id).ty.widen_to_computable();
                        }
                    }
                    return current;
                }
                NodeKind::Op(Opcode::SHR | Opcode::SAR) if sons.len() == 2 => {
                    if self.arena.const_of(sons[0]) == Some(U256::zero()) {
                        current = sons[1];
                    } else {
                        return current;
                    }
                }
                _ => return current,
            }
        }
    }

    /// Strip the `(0x100 ** (0x20 - len))`-based shifting Solidity wraps
    /// around short string/bytes stores.
    fn string_bytes_shift_removal(&mut self, tree: TreeId) -> TreeId {
        if !self.arena.node(tree).kind.is_op(Opcode::OR) {
            return tree;
        }
        let sons = self.arena.node(tree).sons.clone();
        if sons.len() != 2 {
            return tree;
        }
        let and_side = sons
            .iter()
            .copied()
            .find(|s| self.arena.node(*s).kind.is_op(Opcode::AND));
        let Some(and_side) = and_side else {
            return tree;
        };
        let and_sons = self.arena.node(and_side).sons.clone();
        if and_sons.len() != 2 {
            return tree;
        }
        for (candidate, other) in [(and_sons[0], and_sons[1]), (and_sons[1], and_sons[0])] {
            let dynamic_arg = matches!(
                self.arena.node(candidate).alias.as_ref(),
                Some(EvmVar::Arg(arg)) if arg.is_dynamic
            );
            if !dynamic_arg || !self.arena.node(other).kind.is_op(Opcode::NOT) {
                continue;
            }
            let Some(not_son) = self.arena.node(other).sons.first().copied() else {
                continue;
            };
            if self
                .render(not_son)
                .starts_with("((0x100 ** (0x20 - ")
            {
                return candidate;
            }
        }
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TreeArena;

    fn analyzer() -> Analyzer {
        Analyzer::new(TreeArena::default(), VarRegistry::default())
    }

    /// SLOAD(index) tree.
    fn sload_of(arena: &mut TreeArena, index: u64) -> TreeId {
        let idx = arena.constant(U256::from(index));
        arena.op(Opcode::SLOAD, vec![idx])
    }

    #[test]
    fn bare_slot_recovers_full_word() {
        let mut a = analyzer();
        let load = sload_of(&mut a.arena, 3);
        let (state, forward) = a.sload_analysis(load, false).unwrap();
        assert_eq!(forward, load);
        let info = a.registry.state(state.id);
        assert_eq!(info.index, U256::from(3));
        assert_eq!(info.offset, Some(0));
        assert_eq!(info.length, Some(32));
        assert!(state.keys.is_empty());
    }

    #[test]
    fn mapping_access_recovers_key_and_slot() {
        let mut a = analyzer();
        let caller = a.arena.op(Opcode::CALLER, Vec::new());
        let slot = a.arena.constant(U256::from(2));
        let hash = a.arena.op(Opcode::SHA3, vec![caller, slot]);
        let load = a.arena.op(Opcode::SLOAD, vec![hash]);
        let (state, _) = a.sload_analysis(load, false).unwrap();
        let info = a.registry.state(state.id);
        assert_eq!(info.index, U256::from(2));
        // The element types as a full word; the key carries the mapping
        // structure.
        let mut ty = a.registry.state(state.id).ty.clone();
        assert!(ty.is_elementary());
        assert_eq!(info.length, Some(32));
        assert_eq!(state.keys.len(), 1);
        assert!(a.arena.node(state.keys[0]).kind.is_op(Opcode::CALLER));
    }

    #[test]
    fn dynamic_array_element() {
        let mut a = analyzer();
        let slot = a.arena.constant(U256::from(4));
        let base = a.arena.op(Opcode::SHA3, vec![slot]);
        let c = a.arena.constant(U256::from(4));
        let idx = a.arena.op(Opcode::CALLDATALOAD, vec![c]);
        let addr = a.arena.op(Opcode::ADD, vec![base, idx]);
        let load = a.arena.op(Opcode::SLOAD, vec![addr]);
        let (state, _) = a.sload_analysis(load, false).unwrap();
        let info = a.registry.state(state.id);
        assert_eq!(info.index, U256::from(4));
        let mut ty = info.ty.clone();
        assert!(ty.is_array());
        assert!(ty.is_dynamic());
        assert_eq!(state.keys.len(), 1);
    }

    #[test]
    fn packed_field_through_div_and_mask() {
        // AND(DIV(SLOAD(5), 2^128), 0xff..ff [16 bytes])
        let mut a = analyzer();
        let load = sload_of(&mut a.arena, 5);
        let shift = a.arena.constant(U256::one() << 128);
        let div = a.arena.op(Opcode::DIV, vec![load, shift]);
        let mask = a.arena.constant((U256::one() << 128) - 1);
        let _masked = a.arena.op(Opcode::AND, vec![div, mask]);
        let (state, forward) = a.sload_analysis(load, false).unwrap();
        let info = a.registry.state(state.id);
        // low offset 16, length 16 → stored big-endian offset 0
        assert_eq!(info.offset, Some(0));
        assert_eq!(info.length, Some(16));
        assert_eq!(forward, _masked);
    }

    #[test]
    fn low_field_through_plain_mask() {
        let mut a = analyzer();
        let load = sload_of(&mut a.arena, 5);
        let mask = a.arena.constant((U256::one() << 128) - 1);
        let masked = a.arena.op(Opcode::AND, vec![load, mask]);
        let (state, forward) = a.sload_analysis(load, false).unwrap();
        assert_eq!(forward, masked);
        let info = a.registry.state(state.id);
        // low offset 0, length 16 → stored big-endian offset 16
        assert_eq!(info.offset, Some(16));
        assert_eq!(info.length, Some(16));
    }

    #[test]
    fn signed_field_through_signextend() {
        // SIGNEXTEND(15, DIV(SLOAD(1), 1))
        let mut a = analyzer();
        let load = sload_of(&mut a.arena, 1);
        let one = a.arena.constant(U256::one());
        let div = a.arena.op(Opcode::DIV, vec![load, one]);
        let bits = a.arena.constant(U256::from(15));
        let _sx = a.arena.op(Opcode::SIGNEXTEND, vec![bits, div]);
        let (state, _) = a.sload_analysis(load, false).unwrap();
        let info = a.registry.state(state.id);
        assert_eq!(info.length, Some(16));
        assert!(info.ty.hints.is_signed);
    }

    #[test]
    fn one_bit_mask_means_dynamic() {
        let mut a = analyzer();
        let load = sload_of(&mut a.arena, 7);
        let one = a.arena.constant(U256::one());
        let _masked = a.arena.op(Opcode::AND, vec![load, one]);
        let (state, _) = a.sload_analysis(load, false).unwrap();
        let info = a.registry.state(state.id);
        assert!(info.is_dynamic_slot());
        assert!(a.registry.dynamic_occupied.contains(&U256::from(7)));
    }

    #[test]
    fn whole_slot_store_has_no_masking() {
        let mut a = analyzer();
        let key = a.arena.constant(U256::zero());
        let value = a.arena.op(Opcode::CALLVALUE, Vec::new());
        let updates = a.sstore_analysis(key, value).unwrap();
        assert_eq!(updates.len(), 1);
        let (state, written) = &updates[0];
        assert_eq!(a.registry.state(state.id).index, U256::zero());
        assert_eq!(*written, value);
    }

    #[test]
    fn masked_or_store_recovers_field_and_value() {
        // SSTORE(5, OR(AND(SLOAD(5), keep_mask_low16), MUL(CALLVALUE, 2^128)))
        let mut a = analyzer();
        let key = a.arena.constant(U256::from(5));
        let load = sload_of(&mut a.arena, 5);
        let keep = a.arena.constant((U256::one() << 128) - 1);
        let masked = a.arena.op(Opcode::AND, vec![load, keep]);
        let value = a.arena.op(Opcode::CALLVALUE, Vec::new());
        let vmask = a.arena.constant(!((U256::one() << 128) - 1));
        let aligned = a.arena.op(Opcode::AND, vec![value, vmask]);
        let shift = a.arena.constant(U256::one() << 128);
        let shifted = a.arena.op(Opcode::MUL, vec![aligned, shift]);
        let or = a.arena.op(Opcode::OR, vec![shifted, masked]);
        let updates = a.sstore_analysis(key, or).unwrap();
        assert_eq!(updates.len(), 1);
        let (state, _written) = &updates[0];
        let info = a.registry.state(state.id);
        // keep mask has 16 trailing f bytes → written field at low offset
        // 16, length 16 → big-endian offset 0
        assert_eq!(info.offset, Some(0));
        assert_eq!(info.length, Some(16));
    }

    #[test]
    fn clearing_store_yields_zero_value() {
        // SSTORE(2, AND(SLOAD(2), 0xff..00 mask clearing a 16-byte low field))
        let mut a = analyzer();
        let key = a.arena.constant(U256::from(2));
        let load = sload_of(&mut a.arena, 2);
        let mask = a.arena.constant(!((U256::one() << 128) - 1));
        let and = a.arena.op(Opcode::AND, vec![load, mask]);
        let updates = a.sstore_analysis(key, and).unwrap();
        assert_eq!(updates.len(), 1);
        let (_, written) = &updates[0];
        assert_eq!(a.arena.const_of(*written), Some(U256::zero()));
    }

    #[test]
    fn cast_removal_unwraps_masks_and_signextend() {
        let mut a = analyzer();
        let caller = a.arena.op(Opcode::CALLER, Vec::new());
        let mask = a.arena.constant((U256::one() << 160) - 1);
        let and = a.arena.op(Opcode::AND, vec![caller, mask]);
        assert_eq!(a.cast_removal_step(and), caller);

        let bits = a.arena.constant(U256::from(15));
        let sx = a.arena.op(Opcode::SIGNEXTEND, vec![bits, caller]);
        assert_eq!(a.cast_removal_step(sx), caller);

        let i1 = a.arena.op(Opcode::ISZERO, vec![caller]);
        let i2 = a.arena.op(Opcode::ISZERO, vec![i1]);
        assert_eq!(a.cast_removal_step(i2), caller);
    }
}
