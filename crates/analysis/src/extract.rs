//! Semantic-unit extraction.
//!
//! Walks the blocks of one lifted path in order, maintaining the stack of
//! live guards and a variable → guards dependency map. `JUMPI`s become
//! classified conditions; `SSTORE`s, calls, creations and self-destructs
//! become behaviors paired with the guards they depend on. The feasibility
//! checker runs before each behavior whenever new constraints were added;
//! a refuted prefix abandons the whole path.

use ethereum_types::U256;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use sema_lift::cfg::ExitSpec;
use sema_lift::memory::MemValue;
use sema_lift::opcodes::Opcode;
use sema_lift::tac::{TacOp, TacPath};
use sema_lift::value::{VarId, VarKind};

use crate::errors::AnalysisError;
use crate::post;
use crate::render::{render_keys, render_var};
use crate::solver::Verdict;
use crate::storage::Analyzer;
use crate::tree::{expanded_condition_tree, tree_from_var, CStates, NodeKind, TreeId};
use crate::units::{Behavior, BehaviorKind, Condition, SemanticUnit};
use crate::vars::EvmVar;

/// Pop every guard whose scope ended at `current_ident`, including guards
/// of self-looping blocks (which never outlive their own block).
fn drop_stale_conditions(
    live: &mut Vec<usize>,
    all: &[Condition],
    current_ident: usize,
    exits: &FxHashMap<usize, ExitSpec>,
) {
    let mut cut = None;
    for (i, idx) in live.iter().enumerate() {
        let owner = all[*idx].block_ident;
        match exits.get(&owner) {
            Some(ExitSpec::SelfLoop) => {
                cut = Some(i);
                break;
            }
            Some(ExitSpec::Exit(exit)) if *exit == current_ident || *exit == owner => {
                cut = Some(i);
                break;
            }
            _ => {}
        }
    }
    if let Some(i) = cut {
        live.truncate(i);
    }
}

/// Dependency key of an operand: the source variable's canonical name.
fn dep_key(path: &TacPath, value: &MemValue) -> String {
    match value {
        MemValue::Var(v) => path.pool.name(*v),
        MemValue::Cell(cell) => {
            let mut innermost = cell;
            while let sema_lift::memory::CellValue::Slice(inner) = &innermost.value {
                innermost = inner;
            }
            match &innermost.value {
                sema_lift::memory::CellValue::Var(v) => path.pool.name(*v),
                _ => String::new(),
            }
        }
    }
}

struct Extraction<'a> {
    analyzer: &'a mut Analyzer,
    all_conditions: Vec<Condition>,
    live: Vec<usize>,
    var_deps: FxHashMap<String, FxHashSet<usize>>,
    units: Vec<SemanticUnit>,
    path_idents: String,
    check_feasibility: bool,
    function_tag: String,
}

impl<'a> Extraction<'a> {
    /// Guards a behavior depends on: the live stack, guards reached
    /// through the operands' def-use chains, and guards reached through
    /// the states the live guards mention.
    fn expanded_conditions(&self, path: &TacPath, op: &TacOp) -> Vec<usize> {
        let mut out = self.live.clone();
        for arg in &op.args {
            let key = path.pool.name(*arg);
            if let Some(deps) = self.var_deps.get(&key) {
                for dep in deps {
                    if !out.contains(dep) {
                        out.push(*dep);
                    }
                }
            }
        }
        for value in &op.values {
            let key = dep_key(path, value);
            if let Some(deps) = self.var_deps.get(&key) {
                for dep in deps {
                    if !out.contains(dep) {
                        out.push(*dep);
                    }
                }
            }
        }
        for idx in &self.live {
            let condition = &self.all_conditions[*idx];
            let states = self
                .analyzer
                .arena
                .node(condition.tree)
                .contained_states
                .clone();
            for state in states {
                let key = render_var(&self.analyzer.arena, &self.analyzer.registry, &state, true, true);
                if let Some(deps) = self.var_deps.get(&key) {
                    for dep in deps {
                        if !out.contains(dep) {
                            out.push(*dep);
                        }
                    }
                }
            }
        }
        out
    }

    fn snapshot(&self, indices: &[usize]) -> Vec<Condition> {
        indices
            .iter()
            .map(|i| self.all_conditions[*i].clone())
            .collect()
    }

    fn push_unit(&mut self, conditions: Vec<Condition>, behavior: Behavior) {
        let mut belong = std::collections::BTreeSet::new();
        belong.insert(self.function_tag.clone());
        self.units.push(SemanticUnit {
            conditions,
            behavior,
            belong_functions: belong,
            with_loops: false,
        });
    }

    /// Run the checker if constraints were added since the last check.
    fn check_if_needed(&mut self) -> Result<(), AnalysisError> {
        if !self.check_feasibility || !self.analyzer.checker.after_add_constraints {
            return Ok(());
        }
        self.analyzer.checker.after_add_constraints = false;
        if self.analyzer.checker.check(&self.path_idents) == Verdict::Unsat {
            return Err(AnalysisError::InfeasiblePath);
        }
        Ok(())
    }

    /// Alias a tree, translating analysis misses into a skipped tree.
    fn alias(&mut self, tree: TreeId) -> Result<TreeId, AnalysisError> {
        self.analyzer.set_alias(tree)
    }

    /// The `ecrecover`/`sha256` special case: a state compared against (or
    /// assigned from) the return of a precompile call is a `bytes32`.
    fn widen_precompile_result(&mut self, callreturn_pc: usize, state_var: &EvmVar) {
        let EvmVar::State(state) = state_var else {
            return;
        };
        for unit in &self.units {
            if !unit.behavior.behavior_pcs.contains(&callreturn_pc) {
                continue;
            }
            let rhs = render_var(
                &self.analyzer.arena,
                &self.analyzer.registry,
                &unit.behavior.rhs,
                false,
                false,
            );
            if rhs == "0x1" || rhs == "0x2" {
                self.analyzer
                    .registry
                    .state_mut(state.id)
                    .ty
                    .widen_to_bytes(32);
                return;
            }
        }
    }
}

/// Extract the semantic units of one lifted path. The path must have been
/// attributed to a function already. On an infeasible path the path is
/// marked illegal and no units are returned.
pub fn extract_semantic_units(
    analyzer: &mut Analyzer,
    path: &mut TacPath,
    function_tag: &str,
    exit_blocks: &FxHashMap<usize, ExitSpec>,
    check_feasibility: bool,
) -> Result<Vec<SemanticUnit>, AnalysisError> {
    let check_feasibility = check_feasibility && !path.from_transaction;
    let language = analyzer.registry.language;
    let mut extraction = Extraction {
        analyzer,
        all_conditions: Vec::new(),
        live: Vec::new(),
        var_deps: FxHashMap::default(),
        units: Vec::new(),
        path_idents: String::new(),
        check_feasibility,
        function_tag: function_tag.to_string(),
    };

    let blocks = path.blocks.clone();
    for (block_idx, block) in blocks.iter().enumerate().skip(path.entry_index) {
        drop_stale_conditions(
            &mut extraction.live,
            &extraction.all_conditions,
            block.ident(),
            exit_blocks,
        );

        for op_idx in block.op_start..block.op_end {
            let op = path.ops[op_idx].clone();

            if let Some(lhs) = op.lhs {
                let mut may: FxHashSet<usize> = FxHashSet::default();
                for idx in &extraction.live {
                    may.insert(*idx);
                    let condition = &extraction.all_conditions[*idx];
                    for used in [condition.dst_var, condition.cond_var] {
                        if let Some(deps) = extraction.var_deps.get(&path.pool.name(used)) {
                            may.extend(deps.iter().copied());
                        }
                    }
                }
                for arg in &op.args {
                    if path.pool.get(*arg).def_site.is_some() {
                        if let Some(deps) = extraction.var_deps.get(&path.pool.name(*arg)) {
                            may.extend(deps.iter().copied());
                        }
                    }
                }
                extraction.var_deps.insert(path.pool.name(lhs), may);
            }

            let step = match op.opcode {
                Opcode::JUMPI => {
                    match handle_jumpi(&mut extraction, path, &blocks, block_idx, &op) {
                        Ok(true) => Ok(()),
                        Ok(false) => Err(AnalysisError::InfeasiblePath),
                        Err(e) => Err(e),
                    }
                }
                Opcode::SSTORE => handle_sstore(&mut extraction, path, &op),
                opcode if opcode.is_call() => handle_call(&mut extraction, path, &op),
                Opcode::CREATE | Opcode::CREATE2 => handle_create(&mut extraction, path, &op),
                Opcode::SELFDESTRUCT => handle_selfdestruct(&mut extraction, path, &op),
                _ => Ok(()),
            };
            match step {
                Ok(()) => {}
                Err(AnalysisError::InfeasiblePath) => {
                    path.illegal = true;
                    return Ok(Vec::new());
                }
                Err(e) => return Err(e),
            }
        }
    }

    if extraction.check_feasibility
        && extraction.analyzer.checker.check(&extraction.path_idents) == Verdict::Unsat
    {
        path.illegal = true;
        return Ok(Vec::new());
    }

    let units = std::mem::take(&mut extraction.units);
    let analyzer = extraction.analyzer;
    Ok(post::process_units(analyzer, units, exit_blocks, language))
}

/// Returns `Ok(false)` when a constant condition contradicts the taken
/// branch (the path is infeasible on its face).
fn handle_jumpi(
    extraction: &mut Extraction<'_>,
    path: &TacPath,
    blocks: &[sema_lift::tac::TacBlock],
    block_idx: usize,
    op: &TacOp,
) -> Result<bool, AnalysisError> {
    if op.args.len() < 2 {
        return Ok(true);
    }
    let (dst_var, cond_var) = (op.args[0], op.args[1]);
    let dest_const = path.pool.const_value(dst_var);
    let next_pc = blocks
        .get(block_idx + 1)
        .and_then(|b| path.ops.get(b.op_start))
        .map(|first| first.pc);
    let need_opposite = match (next_pc, dest_const) {
        (Some(pc), Some(dest)) => U256::from(pc) != dest,
        _ => true,
    };

    if let Some(cond) = path.pool.const_value(cond_var) {
        if cond == U256::from(u64::from(need_opposite)) {
            return Ok(false);
        }
        return Ok(true);
    }

    let block_ident = blocks[block_idx].ident();
    if extraction.check_feasibility {
        extraction
            .path_idents
            .push_str(&format!("{:#x}-{}", block_ident, u8::from(need_opposite)));
    }

    let tree = tree_from_var(&mut extraction.analyzer.arena, path, cond_var, need_opposite);
    let cstates = extraction.analyzer.arena.node(tree).cstates;

    // Return-check guards over the path's own effects clutter the output;
    // skip them entirely.
    if cstates.intersects(CStates::ON_CALLS | CStates::ON_CREATES | CStates::ON_SELFDESTRUCT) {
        return Ok(true);
    }

    let aliased = extraction.alias(tree)?;

    if cstates.contains(CStates::ON_EXTCODESIZE) {
        // `if (extcodesize(s) > 0)` tells us `s` holds a contract.
        let first_son = extraction.analyzer.arena.node(aliased).sons.first().copied();
        if let Some(son) = first_son {
            if let Some(EvmVar::State(state)) = extraction.analyzer.arena.node(son).alias.clone() {
                if state.keys.is_empty() {
                    let info = extraction.analyzer.registry.state_mut(state.id);
                    let mut ty = info.ty.clone();
                    if ty.is_elementary() {
                        info.ty.widen_to_contract();
                    }
                }
            }
        }
        let expanded = expanded_condition_tree(&mut extraction.analyzer.arena, aliased);
        push_condition(extraction, expanded, op, dst_var, cond_var, block_ident, cstates);
        return Ok(true);
    }

    let expanded = expanded_condition_tree(&mut extraction.analyzer.arena, aliased);

    if cstates.contains(CStates::ON_SLOAD) && cstates.contains(CStates::ON_CALLRETURN) {
        rewrite_precompile_comparisons(extraction, expanded);
    }

    push_condition(extraction, expanded, op, dst_var, cond_var, block_ident, cstates);
    if extraction.check_feasibility {
        extraction.analyzer.checker.add_constraint(
            &extraction.analyzer.arena,
            &extraction.analyzer.registry,
            expanded,
        );
    }
    Ok(true)
}

fn push_condition(
    extraction: &mut Extraction<'_>,
    tree: TreeId,
    op: &TacOp,
    dst_var: VarId,
    cond_var: VarId,
    block_ident: usize,
    cstates: CStates,
) {
    extraction.all_conditions.push(Condition {
        tree,
        condition_pc: op.pc,
        dst_var,
        cond_var,
        block_ident,
        cstates,
    });
    extraction.live.push(extraction.all_conditions.len() - 1);
}

/// `if (s == ecrecover(..))` and friends: the compared state is a raw hash.
fn rewrite_precompile_comparisons(extraction: &mut Extraction<'_>, tree: TreeId) {
    let eq_nodes = extraction.analyzer.arena.collect_ops(tree, Opcode::EQ);
    for eq in eq_nodes {
        let sons = extraction.analyzer.arena.node(eq).sons.clone();
        if sons.len() != 2 {
            continue;
        }
        for (side, other) in [(sons[0], sons[1]), (sons[1], sons[0])] {
            let kind = extraction.analyzer.arena.node(side).kind.clone();
            let NodeKind::CallReturn { pc, .. } = kind else {
                continue;
            };
            let Some(alias) = extraction.analyzer.arena.node(other).alias.clone() else {
                continue;
            };
            extraction.widen_precompile_result(pc, &alias);
        }
    }
}

fn handle_sstore(
    extraction: &mut Extraction<'_>,
    path: &TacPath,
    op: &TacOp,
) -> Result<(), AnalysisError> {
    extraction.check_if_needed()?;

    let conditions = extraction.expanded_conditions(path, op);
    let key_tree = tree_from_var(&mut extraction.analyzer.arena, path, op.args[0], false);
    let value_tree = tree_from_var(&mut extraction.analyzer.arena, path, op.args[1], false);

    let updates = match extraction.analyzer.sstore_analysis(key_tree, value_tree) {
        Ok(updates) => updates,
        Err(AnalysisError::OutOfRules(reason)) => {
            debug!(pc = op.pc, reason, "sstore analysis out of rules");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    for (mut state, value) in updates {
        let value_alias = extraction.alias(value)?;
        let keys_str = render_keys(
            &extraction.analyzer.arena,
            &extraction.analyzer.registry,
            &state.keys,
        );
        let info = extraction.analyzer.registry.state_mut(state.id);
        info.counts_mapping.entry(keys_str.clone()).or_default().push(op.loc);
        state.counts = info.counts_mapping[&keys_str].len() as u32;

        let rhs = EvmVar::State(state.clone());
        let state_name = render_var(
            &extraction.analyzer.arena,
            &extraction.analyzer.registry,
            &rhs,
            true,
            true,
        );
        if extraction.check_feasibility {
            extraction.analyzer.checker.add_sstore(
                &extraction.analyzer.arena,
                &extraction.analyzer.registry,
                &state_name,
                value_alias,
            );
        }
        extraction
            .var_deps
            .insert(state_name, conditions.iter().copied().collect());

        // A value taken straight from call return data may come from a
        // hashing precompile.
        if let NodeKind::CallReturn { pc, .. } = extraction.analyzer.arena.node(value_alias).kind {
            extraction.widen_precompile_result(pc, &rhs);
        }

        let snapshot = extraction.snapshot(&conditions);
        extraction.push_unit(
            snapshot,
            Behavior {
                rhs,
                lhs: vec![value_alias],
                kind: BehaviorKind::Sstore,
                behavior_pcs: vec![op.pc],
                block_ident: op.block_entry,
            },
        );
    }
    Ok(())
}

/// Truncate a first call argument to its 4-byte selector.
fn truncate_selector(extraction: &mut Extraction<'_>, tree: TreeId) -> TreeId {
    let Some(value) = extraction.analyzer.arena.const_of(tree) else {
        return tree;
    };
    let digits = format!("{value:x}");
    if digits.len() <= 8 {
        return tree;
    }
    let shifted = value >> ((digits.len() - 8) * 4);
    extraction.analyzer.arena.constant(shifted)
}

fn handle_call(
    extraction: &mut Extraction<'_>,
    path: &TacPath,
    op: &TacOp,
) -> Result<(), AnalysisError> {
    extraction.check_if_needed()?;

    let conditions = extraction.expanded_conditions(path, op);
    let with_value = matches!(op.opcode, Opcode::CALL | Opcode::CALLCODE);
    let head_len = if with_value { 5 } else { 4 };
    if op.values.len() < 2 {
        return Ok(());
    }

    let mut lhs = Vec::new();
    if with_value {
        if let Some(value) = op.values.get(2) {
            let tree = mem_value_tree(extraction, path, value);
            lhs.push(extraction.alias(tree)?);
        }
    }
    for (i, arg) in op.values.iter().skip(head_len).enumerate() {
        let tree = mem_value_tree(extraction, path, arg);
        let tree = if i == 0 {
            truncate_selector(extraction, tree)
        } else {
            tree
        };
        lhs.push(extraction.alias(tree)?);
    }
    let addr_tree = mem_value_tree(extraction, path, &op.values[1]);
    let addr_alias = extraction.alias(addr_tree)?;

    // An address that gets called is a contract.
    if let Some(EvmVar::State(state)) = extraction.analyzer.arena.node(addr_alias).alias.clone() {
        if state.keys.is_empty() {
            let info = extraction.analyzer.registry.state_mut(state.id);
            let mut ty = info.ty.clone();
            if ty.is_elementary() {
                info.ty.widen_to_contract();
            }
        }
    }

    let rhs = match extraction.analyzer.arena.node(addr_alias).alias.clone() {
        Some(alias) => alias,
        None => EvmVar::Property(extraction.analyzer.arena.node(addr_alias).kind.label()),
    };

    let kind = match op.opcode {
        Opcode::CALL => BehaviorKind::Call,
        Opcode::CALLCODE => BehaviorKind::CallCode,
        Opcode::DELEGATECALL => BehaviorKind::DelegateCall,
        _ => BehaviorKind::StaticCall,
    };
    let snapshot = extraction.snapshot(&conditions);
    extraction.push_unit(
        snapshot,
        Behavior {
            rhs,
            lhs,
            kind,
            behavior_pcs: vec![op.pc],
            block_ident: op.block_entry,
        },
    );
    Ok(())
}

fn mem_value_tree(
    extraction: &mut Extraction<'_>,
    path: &TacPath,
    value: &MemValue,
) -> TreeId {
    match value {
        MemValue::Var(v) => tree_from_var(&mut extraction.analyzer.arena, path, *v, false),
        MemValue::Cell(cell) => {
            // Constant slices become constants; anything else digs into
            // the slice source.
            if let Some(constant) = cell.const_value(&path.pool) {
                extraction.analyzer.arena.constant(constant)
            } else {
                let mut innermost = cell;
                while let sema_lift::memory::CellValue::Slice(inner) = &innermost.value {
                    innermost = inner;
                }
                match &innermost.value {
                    sema_lift::memory::CellValue::Var(v) => {
                        let v = *v;
                        let pool = &path.pool;
                        match &pool.get(pool.resolve(v)).kind {
                            VarKind::DataCopy { op, pc } => {
                                let offset = word_tree(extraction, path, innermost.offset);
                                let length = word_tree(extraction, path, innermost.length);
                                extraction.analyzer.arena.add(
                                    NodeKind::Source { op: *op, pc: *pc },
                                    vec![offset, length],
                                )
                            }
                            VarKind::CallReturn { op, pc } => {
                                let offset = word_tree(extraction, path, innermost.offset);
                                let length = word_tree(extraction, path, innermost.length);
                                extraction.analyzer.arena.add(
                                    NodeKind::CallReturn { op: *op, pc: *pc },
                                    vec![offset, length],
                                )
                            }
                            _ => tree_from_var(&mut extraction.analyzer.arena, path, v, false),
                        }
                    }
                    _ => extraction.analyzer.arena.constant(U256::zero()),
                }
            }
        }
    }
}

fn word_tree(
    extraction: &mut Extraction<'_>,
    path: &TacPath,
    word: sema_lift::memory::Word,
) -> TreeId {
    match word {
        sema_lift::memory::Word::Const(v) => extraction.analyzer.arena.constant(v),
        sema_lift::memory::Word::Var(v) => {
            tree_from_var(&mut extraction.analyzer.arena, path, v, false)
        }
    }
}

fn handle_create(
    extraction: &mut Extraction<'_>,
    path: &TacPath,
    op: &TacOp,
) -> Result<(), AnalysisError> {
    extraction.check_if_needed()?;

    let conditions = extraction.expanded_conditions(path, op);
    if op.values.is_empty() {
        return Ok(());
    }
    let mut lhs = Vec::new();
    let value_tree = mem_value_tree(extraction, path, &op.values[0]);
    lhs.push(extraction.alias(value_tree)?);

    let code_start = if op.opcode == Opcode::CREATE { 3 } else { 4 };
    for arg in op.values.iter().skip(code_start) {
        let tree = mem_value_tree(extraction, path, arg);
        lhs.push(extraction.alias(tree)?);
    }
    if op.opcode == Opcode::CREATE2 {
        if let Some(salt) = op.values.get(3) {
            let tree = mem_value_tree(extraction, path, salt);
            lhs.push(extraction.alias(tree)?);
        }
    }

    let kind = if op.opcode == Opcode::CREATE {
        BehaviorKind::Create
    } else {
        BehaviorKind::Create2
    };
    let snapshot = extraction.snapshot(&conditions);
    extraction.push_unit(
        snapshot,
        Behavior {
            rhs: EvmVar::Property("newContract".to_string()),
            lhs,
            kind,
            behavior_pcs: vec![op.pc],
            block_ident: op.block_entry,
        },
    );
    Ok(())
}

fn handle_selfdestruct(
    extraction: &mut Extraction<'_>,
    path: &TacPath,
    op: &TacOp,
) -> Result<(), AnalysisError> {
    extraction.check_if_needed()?;

    let conditions = extraction.expanded_conditions(path, op);
    if op.values.is_empty() {
        return Ok(());
    }
    let addr_tree = mem_value_tree(extraction, path, &op.values[0]);
    let addr_alias = extraction.alias(addr_tree)?;
    let rhs = match extraction.analyzer.arena.node(addr_alias).alias.clone() {
        Some(alias) => alias,
        None => EvmVar::Property(extraction.analyzer.arena.node(addr_alias).kind.label()),
    };

    // What leaves is the contract's whole balance.
    let address = extraction.analyzer.arena.op(Opcode::ADDRESS, Vec::new());
    let balance = extraction.analyzer.arena.op(Opcode::BALANCE, vec![address]);

    let snapshot = extraction.snapshot(&conditions);
    extraction.push_unit(
        snapshot,
        Behavior {
            rhs,
            lhs: vec![balance],
            kind: BehaviorKind::SelfDestruct,
            behavior_pcs: vec![op.pc],
            block_ident: op.block_entry,
        },
    );
    Ok(())
}
