//! Public state-variable recovery.
//!
//! A compiler-generated accessor is a path that ends in `RETURN`, touches
//! no state-affecting op, and funnels one storage variable (or, for Vyper,
//! a run of consecutive slots) to the return buffer keyed only by calldata
//! arguments. Recognizing those paths names the variable after the
//! accessor and marks it public.

use tracing::debug;

use sema_lift::disasm::Language;
use sema_lift::opcodes::Opcode;
use sema_lift::tac::TacPath;
use sema_lift::value::Loc;

use crate::errors::AnalysisError;
use crate::functions::Function;
use crate::render::render_tree;
use crate::storage::Analyzer;
use crate::tree::tree_from_var;
use crate::vars::{EvmVar, StateRef};

/// Forward def-use chains from `start`: every chain of ops reached by
/// following each result's use sites, explored with an explicit stack.
fn forward_chains(path: &TacPath, start: Loc) -> Vec<Vec<Loc>> {
    let mut chains = Vec::new();
    // (op, next use index to explore) frames of the current chain.
    let mut frames: Vec<(Loc, usize)> = vec![(start, 0)];
    while let Some((loc, use_idx)) = frames.pop() {
        let uses: Vec<Loc> = match path.ops[loc].lhs {
            Some(lhs) => path.pool.get(lhs).use_sites.clone(),
            None => Vec::new(),
        };
        if use_idx == 0 && uses.is_empty() {
            let mut chain: Vec<Loc> = frames.iter().map(|(l, _)| *l).collect();
            chain.push(loc);
            chains.push(chain);
            continue;
        }
        if use_idx >= uses.len() {
            continue;
        }
        frames.push((loc, use_idx + 1));
        let next = uses[use_idx];
        if path.ops[next].lhs.is_some() {
            frames.push((next, 0));
        } else {
            let chain: Vec<Loc> = frames.iter().map(|(l, _)| *l).collect();
            chains.push(chain);
        }
    }
    chains
}

/// A chain flowing through a comparison is a guard, not a value return.
fn chain_is_plain(path: &TacPath, chain: &[Loc]) -> bool {
    !chain.iter().any(|loc| {
        matches!(
            path.ops[*loc].opcode,
            Opcode::LT | Opcode::GT | Opcode::SLT | Opcode::SGT | Opcode::EQ
        )
    })
}

/// One storage variable per accessor: same slot for Solidity, a
/// consecutive (or equal) run for Vyper, and all keys must be calldata
/// parameters (Vyper tuples may also use constant member offsets).
fn states_form_accessor(analyzer: &Analyzer, states: &[StateRef], language: Language) -> bool {
    let Some(first) = states.first() else {
        return false;
    };
    let base = analyzer.registry.state(first.id).index;
    for (i, state) in states.iter().enumerate() {
        let index = analyzer.registry.state(state.id).index;
        match language {
            Language::Solidity => {
                if index != base {
                    return false;
                }
                let keys_ok = state.keys.iter().all(|k| {
                    matches!(
                        analyzer.arena.node(*k).alias.as_ref(),
                        Some(EvmVar::Arg(_))
                    )
                });
                if !keys_ok {
                    return false;
                }
            }
            Language::Vyper => {
                let expected = base + ethereum_types::U256::from(i as u64);
                if index != expected && index != base {
                    return false;
                }
                let keys_ok = state.keys.iter().all(|k| {
                    matches!(
                        analyzer.arena.node(*k).alias.as_ref(),
                        Some(EvmVar::Arg(_) | EvmVar::Property(_))
                    )
                });
                if !keys_ok {
                    return false;
                }
            }
        }
    }
    true
}

/// Scan one state-free returning path for the accessor shape; on success
/// the recovered variable is named and marked public.
pub fn extract_state_variables(
    analyzer: &mut Analyzer,
    path: &TacPath,
    function: &Function,
) -> Result<(), AnalysisError> {
    let Some(last_block) = path.blocks.last() else {
        return Ok(());
    };
    if path.last_op_of(last_block).opcode != Opcode::RETURN {
        return Ok(());
    }

    let language = analyzer.registry.language;
    let mut recovered: Vec<StateRef> = Vec::new();

    for op in &path.ops {
        if op.opcode != Opcode::SLOAD {
            continue;
        }
        let chains = forward_chains(path, op.loc);
        let mut chain_states: Vec<StateRef> = Vec::new();
        for chain in chains {
            if !chain_is_plain(path, &chain) {
                continue;
            }
            let Some(&final_loc) = chain.last() else {
                continue;
            };
            let Some(final_lhs) = path.ops[final_loc].lhs else {
                continue;
            };
            let visiting_tree = tree_from_var(&mut analyzer.arena, path, final_lhs, false);
            let rendered = render_tree(&analyzer.arena, &analyzer.registry, visiting_tree, true, true);
            if let Some(EvmVar::State(state)) = analyzer.registry.memo.get(&rendered).cloned() {
                recovered.push(state);
            }

            let sload_trees = analyzer.arena.collect_ops(visiting_tree, Opcode::SLOAD);
            for sload_tree in sload_trees {
                let (state, forward_tree) = analyzer.sload_analysis(sload_tree, false)?;
                let forward_rendered =
                    render_tree(&analyzer.arena, &analyzer.registry, forward_tree, true, true);
                analyzer
                    .registry
                    .memo
                    .insert(forward_rendered, EvmVar::State(state.clone()));
                chain_states.push(state);
            }

            if states_form_accessor(analyzer, &chain_states, language) {
                recovered.append(&mut chain_states);
            } else {
                return Ok(());
            }
        }
    }

    if recovered.is_empty() || !states_form_accessor(analyzer, &recovered, language) {
        return Ok(());
    }

    // Name the variable after the accessor, stripping a `get` prefix.
    let mut name = function.name.clone();
    if name.to_lowercase().starts_with("get") && name.len() > 3 {
        name = name[3..].to_string();
    }
    let first = recovered[0].clone();
    let info = analyzer.registry.state_mut(first.id);
    if !name.starts_with("0x") {
        info.name = Some(name);
    }
    info.signature = function.signature.clone();
    info.is_public = true;
    debug!(
        signature = %function.signature,
        index = %analyzer.registry.state(first.id).index,
        "recovered public state variable"
    );

    // A Vyper accessor spanning several slots is a packed string.
    if recovered.len() > 1 && language == Language::Vyper {
        for state in &recovered {
            analyzer.registry.state_mut(state.id).ty.widen_to_string();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TreeArena;
    use crate::vars::VarRegistry;
    use sema_lift::cfg::Cfg;
    use sema_lift::destack::transform_path;
    use sema_lift::disasm::disassemble;
    use sema_lift::explorer::{resolve_dynamic_edges, ExploreLimits};

    fn lift(hex_str: &str) -> TacPath {
        let mut cfg = Cfg::from_ops(disassemble(hex_str));
        cfg.resolve_static_edges();
        resolve_dynamic_edges(&mut cfg, ExploreLimits::default());
        let evm_path = cfg.paths[0].clone();
        transform_path(&mut cfg, &evm_path, None)
            .unwrap()
            .into_iter()
            .next()
            .unwrap()
    }

    #[test]
    fn accessor_names_the_variable() {
        // PUSH1 3; SLOAD; PUSH1 0; MSTORE; PUSH1 32; PUSH1 0; RETURN
        let path = lift("60035460005260206000f3");
        let mut analyzer = Analyzer::new(TreeArena::default(), VarRegistry::default());
        let function = Function {
            signature: "0x12345678".to_string(),
            name: "getOwner".to_string(),
        };
        extract_state_variables(&mut analyzer, &path, &function).unwrap();
        let state = analyzer
            .registry
            .states
            .iter()
            .find(|s| s.index == ethereum_types::U256::from(3))
            .expect("state recovered");
        assert!(state.is_public);
        assert_eq!(state.name.as_deref(), Some("Owner"));
        assert_eq!(state.signature, "0x12345678");
    }

    #[test]
    fn guarded_return_is_not_an_accessor() {
        // SLOAD flows into an EQ before returning: not a plain accessor.
        // PUSH1 3; SLOAD; PUSH1 1; EQ; PUSH1 0; MSTORE; PUSH1 32; PUSH1 0; RETURN
        let path = lift("60035460011460005260206000f3");
        let mut analyzer = Analyzer::new(TreeArena::default(), VarRegistry::default());
        let function = Function {
            signature: "0xabcdef01".to_string(),
            name: "check".to_string(),
        };
        extract_state_variables(&mut analyzer, &path, &function).unwrap();
        assert!(analyzer.registry.states.iter().all(|s| !s.is_public));
    }
}
