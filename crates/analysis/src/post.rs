//! Post-processing of extracted units.
//!
//! Dynamic values (string/bytes/array) are written as several raw stores —
//! length word, data words, index arithmetic. This pass merges those
//! stores back into one logical unit per dynamic variable, turns array
//! writes into `PUSH` operations, drops the bookkeeping (length
//! increments, length-check guards) and prunes conditions that only
//! reiterate the written operands.

use rustc_hash::FxHashMap;

use sema_lift::cfg::ExitSpec;
use sema_lift::disasm::Language;
use sema_lift::opcodes::Opcode;

use crate::render::{render_tree, render_var};
use crate::storage::Analyzer;
use crate::tree::TreeId;
use crate::units::{Behavior, BehaviorKind, SemanticUnit};
use crate::vars::EvmVar;

/// `OR(ADD(x, x), …)`: the canonical dynamic-length increment.
fn is_or_add(analyzer: &Analyzer, unit: &SemanticUnit) -> bool {
    if unit.behavior.lhs.len() != 1 {
        return false;
    }
    let root = unit.behavior.lhs[0];
    if !analyzer.arena.node(root).kind.is_op(Opcode::OR) {
        return false;
    }
    let Some(first) = analyzer.arena.node(root).sons.first().copied() else {
        return false;
    };
    if !analyzer.arena.node(first).kind.is_op(Opcode::ADD) {
        return false;
    }
    let sons = analyzer.arena.node(first).sons.clone();
    sons.len() == 2
        && render_tree(&analyzer.arena, &analyzer.registry, sons[0], true, true)
            == render_tree(&analyzer.arena, &analyzer.registry, sons[1], true, true)
}

/// A store that only bumps a dynamic value's length word.
fn is_update_length(analyzer: &Analyzer, unit: &SemanticUnit) -> bool {
    unit.behavior.rhs.is_dynamic(&analyzer.registry) && is_or_add(analyzer, unit)
}

/// False for comparisons over dynamic parameters; those are length
/// checks, not semantics.
fn sat_tree(analyzer: &Analyzer, tree: TreeId) -> bool {
    let node = analyzer.arena.node(tree);
    if node.sons.is_empty() {
        return true;
    }
    if node.sons.len() == 2
        && matches!(
            node.kind,
            crate::tree::NodeKind::Op(Opcode::GT | Opcode::LT | Opcode::EQ)
        )
    {
        let dynamic_side = node.sons.iter().any(|s| {
            matches!(
                analyzer.arena.node(*s).alias.as_ref(),
                Some(EvmVar::Arg(arg)) if arg.is_dynamic
            )
        });
        if dynamic_side {
            return false;
        }
    }
    node.sons
        .clone()
        .into_iter()
        .all(|s| sat_tree(analyzer, s))
}

fn prune_length_checks(analyzer: &Analyzer, unit: &mut SemanticUnit) {
    unit.conditions.retain(|c| sat_tree(analyzer, c.tree));
}

/// Does the unit touch any dynamically-typed value?
fn touches_dynamics(analyzer: &Analyzer, unit: &SemanticUnit) -> bool {
    if unit.behavior.rhs.is_dynamic(&analyzer.registry) {
        return true;
    }
    for lhs in &unit.behavior.lhs {
        let node = analyzer.arena.node(*lhs);
        if node
            .alias
            .as_ref()
            .is_some_and(|a| a.is_dynamic(&analyzer.registry))
        {
            return true;
        }
        for arg in node.contained_args.iter().chain(node.contained_states.iter()) {
            if arg.is_dynamic(&analyzer.registry) {
                return true;
            }
        }
    }
    false
}

/// Rendered names of the unit's dynamic operands, the cover set for
/// condition pruning.
fn dynamic_operand_names(analyzer: &Analyzer, unit: &SemanticUnit) -> Vec<String> {
    let mut names = Vec::new();
    if unit.behavior.rhs.is_dynamic(&analyzer.registry) {
        names.push(render_var(
            &analyzer.arena,
            &analyzer.registry,
            &unit.behavior.rhs,
            false,
            true,
        ));
    }
    for lhs in &unit.behavior.lhs {
        let node = analyzer.arena.node(*lhs);
        if let Some(alias) = &node.alias {
            if alias.is_dynamic(&analyzer.registry) {
                names.push(render_var(&analyzer.arena, &analyzer.registry, alias, false, true));
            }
        }
        for var in node.contained_args.iter().chain(node.contained_states.iter()) {
            if var.is_dynamic(&analyzer.registry) {
                names.push(render_var(&analyzer.arena, &analyzer.registry, var, false, true));
            }
        }
    }
    names
}

/// Drop conditions whose variables are all inside `cover`.
fn drop_covered_conditions(analyzer: &Analyzer, unit: &mut SemanticUnit, cover: &[String]) {
    unit.conditions.retain(|c| {
        let node = analyzer.arena.node(c.tree);
        let mentioned: Vec<String> = node
            .contained_states
            .iter()
            .chain(node.contained_args.iter())
            .map(|v| render_var(&analyzer.arena, &analyzer.registry, v, false, true))
            .collect();
        if mentioned.is_empty() {
            return true;
        }
        !mentioned.iter().all(|m| cover.contains(m))
    });
}

/// Post-process the units extracted from one path.
pub fn process_units(
    analyzer: &mut Analyzer,
    units: Vec<SemanticUnit>,
    exit_blocks: &FxHashMap<usize, ExitSpec>,
    language: Language,
) -> Vec<SemanticUnit> {
    let mut finished: Vec<SemanticUnit> = Vec::new();
    let mut dynamic_stores: FxHashMap<String, Vec<SemanticUnit>> = FxHashMap::default();
    let mut dynamic_order: Vec<String> = Vec::new();
    let mut with_dynamics: Vec<SemanticUnit> = Vec::new();

    for unit in units {
        let dynamic_sstore = unit.behavior.kind == BehaviorKind::Sstore
            && unit.behavior.rhs.is_dynamic(&analyzer.registry);
        if dynamic_sstore {
            let key = render_var(
                &analyzer.arena,
                &analyzer.registry,
                &unit.behavior.rhs,
                false,
                false,
            );
            if !dynamic_stores.contains_key(&key) {
                dynamic_order.push(key.clone());
            }
            dynamic_stores.entry(key).or_default().push(unit);
        } else if touches_dynamics(analyzer, &unit) {
            if unit.behavior.kind == BehaviorKind::Sstore {
                if let EvmVar::State(state) = &unit.behavior.rhs {
                    analyzer.registry.state_mut(state.id).ty.widen_to_string();
                }
            }
            with_dynamics.push(unit);
        } else {
            let mut unit = unit;
            unit.conditions.retain(|c| {
                !matches!(exit_blocks.get(&c.block_ident), Some(ExitSpec::SelfLoop))
                    && !matches!(
                        exit_blocks.get(&c.block_ident),
                        Some(ExitSpec::Exit(e)) if *e == c.block_ident
                    )
            });
            if !is_update_length(analyzer, &unit) {
                prune_length_checks(analyzer, &mut unit);
                finished.push(unit);
            }
        }
    }

    // Merge the raw stores of each dynamic variable into one unit.
    let mut merged_units: Vec<SemanticUnit> = Vec::new();
    for key in dynamic_order {
        let group = dynamic_stores.remove(&key).unwrap_or_default();
        if group.is_empty() {
            continue;
        }
        let behavior_pcs: Vec<usize> = group
            .iter()
            .flat_map(|u| u.behavior.behavior_pcs.iter().copied())
            .collect();
        let last = group.last().unwrap_or_else(|| unreachable!());
        let first = &group[0];

        let rhs_is_array = {
            let mut ty = match &first.behavior.rhs {
                EvmVar::State(state) => analyzer.registry.state(state.id).ty.clone(),
                _ => continue,
            };
            ty.is_array()
        };

        let (rhs, lhs, kind) = if rhs_is_array {
            // An array write is an append; the element index keys are
            // bookkeeping.
            let mut rhs = last.behavior.rhs.clone();
            if let EvmVar::State(state) = &mut rhs {
                state.keys.clear();
            }
            (rhs, last.behavior.lhs.clone(), BehaviorKind::Push)
        } else {
            // string/bytes: the appended data hides inside the ADD(x, x)
            // length idiom of the first store.
            let mut lhs = vec![first.behavior.lhs[0]];
            if language != Language::Vyper {
                let adds = analyzer
                    .arena
                    .collect_ops(first.behavior.lhs[0], Opcode::ADD);
                for add in adds {
                    let sons = analyzer.arena.node(add).sons.clone();
                    if sons.len() == 2
                        && render_tree(&analyzer.arena, &analyzer.registry, sons[0], true, true)
                            == render_tree(&analyzer.arena, &analyzer.registry, sons[1], true, true)
                    {
                        if let Some(EvmVar::Arg(arg)) =
                            analyzer.arena.node(sons[0]).alias.clone()
                        {
                            let mut arg = arg;
                            arg.keys.clear();
                            analyzer.arena.node_mut(sons[0]).alias = Some(EvmVar::Arg(arg));
                        }
                        lhs = vec![sons[0]];
                        break;
                    }
                }
            }
            (first.behavior.rhs.clone(), lhs, BehaviorKind::Sstore)
        };

        let mut unit = SemanticUnit {
            conditions: last.conditions.clone(),
            behavior: Behavior {
                rhs,
                lhs,
                kind,
                behavior_pcs,
                block_ident: last.behavior.block_ident,
            },
            belong_functions: last.belong_functions.clone(),
            with_loops: false,
        };
        let mut cover = vec![render_var(
            &analyzer.arena,
            &analyzer.registry,
            &unit.behavior.rhs,
            false,
            true,
        )];
        for lhs in &unit.behavior.lhs {
            cover.push(render_tree(&analyzer.arena, &analyzer.registry, *lhs, false, true));
        }
        drop_covered_conditions(analyzer, &mut unit, &cover);
        merged_units.push(unit);
    }

    // Vyper writes each dynamic value twice per assignment; consecutive
    // merged units with identical pc sets are duplicates.
    if language == Language::Vyper && !merged_units.is_empty() {
        let mut deduped = vec![merged_units[0].clone()];
        let mut base_pcs = merged_units[0].behavior.behavior_pcs.clone();
        for unit in merged_units.into_iter().skip(1) {
            if unit.behavior.behavior_pcs == base_pcs {
                continue;
            }
            base_pcs = unit.behavior.behavior_pcs.clone();
            deduped.push(unit);
        }
        merged_units = deduped;
    }

    for mut unit in merged_units {
        if !is_update_length(analyzer, &unit) {
            prune_length_checks(analyzer, &mut unit);
            finished.push(unit);
        }
    }

    for mut unit in with_dynamics {
        let cover = dynamic_operand_names(analyzer, &unit);
        drop_covered_conditions(analyzer, &mut unit, &cover);
        if !is_update_length(analyzer, &unit) {
            prune_length_checks(analyzer, &mut unit);
            finished.push(unit);
        }
    }

    finished
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EvmType;
    use crate::units::Condition;
    use crate::vars::{StateRef, VarRegistry};
    use crate::tree::{CStates, TreeArena};
    use ethereum_types::U256;
    use sema_lift::value::VarId;
    use std::collections::BTreeSet;

    fn unit_for(
        rhs: EvmVar,
        lhs: Vec<TreeId>,
        kind: BehaviorKind,
        pcs: Vec<usize>,
    ) -> SemanticUnit {
        let mut belong = BTreeSet::new();
        belong.insert("0xa9059cbb_transfer".to_string());
        SemanticUnit {
            conditions: Vec::new(),
            behavior: Behavior {
                rhs,
                lhs,
                kind,
                behavior_pcs: pcs,
                block_ident: 0,
            },
            belong_functions: belong,
            with_loops: false,
        }
    }

    fn dynamic_state(analyzer: &mut Analyzer, index: u64, array: bool) -> EvmVar {
        let hints = crate::types::TypeHints {
            is_array: array,
            is_dynamic: true,
            is_bytes: !array,
            ..Default::default()
        };
        let id = analyzer.registry.get_or_insert_state(
            U256::from(index),
            None,
            None,
            EvmType::new(hints, None),
        );
        EvmVar::State(StateRef {
            id,
            keys: Vec::new(),
            counts: 0,
        })
    }

    #[test]
    fn array_stores_merge_into_push() {
        let mut analyzer = Analyzer::new(TreeArena::default(), VarRegistry::default());
        let rhs = dynamic_state(&mut analyzer, 6, true);
        let x = analyzer.arena.op(Opcode::CALLVALUE, Vec::new());
        let first = unit_for(rhs.clone(), vec![x], BehaviorKind::Sstore, vec![10]);
        let second = unit_for(rhs, vec![x], BehaviorKind::Sstore, vec![14]);
        let out = process_units(
            &mut analyzer,
            vec![first, second],
            &FxHashMap::default(),
            Language::Solidity,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].behavior.kind, BehaviorKind::Push);
        assert_eq!(out[0].behavior.behavior_pcs, vec![10, 14]);
    }

    #[test]
    fn length_increment_store_is_dropped() {
        let mut analyzer = Analyzer::new(TreeArena::default(), VarRegistry::default());
        let rhs = dynamic_state(&mut analyzer, 2, false);
        // OR(ADD(x, x), junk)
        let x = analyzer.arena.op(Opcode::CALLVALUE, Vec::new());
        let x2 = analyzer.arena.op(Opcode::CALLVALUE, Vec::new());
        let add = analyzer.arena.op(Opcode::ADD, vec![x, x2]);
        let junk = analyzer.arena.constant(U256::one());
        let or = analyzer.arena.op(Opcode::OR, vec![add, junk]);
        let unit = unit_for(rhs, vec![or], BehaviorKind::Sstore, vec![20]);
        // The merged unit keeps the doubled operand, and is not emitted as
        // a separate length update.
        let out = process_units(
            &mut analyzer,
            vec![unit],
            &FxHashMap::default(),
            Language::Solidity,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].behavior.kind, BehaviorKind::Sstore);
        assert!(analyzer.arena.node(out[0].behavior.lhs[0]).kind.is_op(Opcode::CALLVALUE));
    }

    #[test]
    fn length_check_conditions_are_pruned() {
        let mut analyzer = Analyzer::new(TreeArena::default(), VarRegistry::default());
        // condition: Arg0.length > 4, a length check on a dynamic arg
        let arg_leaf = analyzer.arena.op(Opcode::CALLDATASIZE, Vec::new());
        analyzer.arena.node_mut(arg_leaf).alias = Some(EvmVar::Arg(crate::vars::ArgRef {
            index: 0,
            is_dynamic: true,
            keys: "length".to_string(),
        }));
        let four = analyzer.arena.constant(U256::from(4));
        let gt = analyzer.arena.op(Opcode::GT, vec![arg_leaf, four]);
        let id = analyzer.registry.get_or_insert_state(
            U256::zero(),
            Some(0),
            Some(32),
            EvmType::default(),
        );
        let rhs = EvmVar::State(StateRef { id, keys: Vec::new(), counts: 0 });
        let value = analyzer.arena.op(Opcode::CALLVALUE, Vec::new());
        let mut unit = unit_for(rhs, vec![value], BehaviorKind::Sstore, vec![5]);
        unit.conditions.push(Condition {
            tree: gt,
            condition_pc: 1,
            dst_var: VarId(0),
            cond_var: VarId(0),
            block_ident: 0,
            cstates: CStates::empty(),
        });
        let out = process_units(
            &mut analyzer,
            vec![unit],
            &FxHashMap::default(),
            Language::Solidity,
        );
        assert_eq!(out.len(), 1);
        assert!(out[0].conditions.is_empty());
    }
}
