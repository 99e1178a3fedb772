//! Canonical textual forms.
//!
//! Trees, variables, conditions and behaviors are deduplicated and
//! memoized by their rendered text, so the rendering here must be stable
//! and independent of map iteration order. One routine per tagged variant;
//! everything else hashes the string.

use rustc_hash::FxHashMap;

use sema_lift::opcodes::Opcode;

use crate::tree::{NodeKind, TreeArena, TreeId};
use crate::vars::{EvmVar, VarRegistry};

/// Infix formats for the binary operators in guard positions.
fn binary_format(op: Opcode) -> Option<&'static str> {
    Some(match op {
        Opcode::GT | Opcode::SGT => ">",
        Opcode::LT | Opcode::SLT => "<",
        Opcode::EQ => "==",
        Opcode::ADD => "+",
        Opcode::SUB => "-",
        Opcode::MUL => "*",
        Opcode::DIV => "/",
        Opcode::MOD => "%",
        Opcode::AND => "&",
        Opcode::OR => "|",
        Opcode::EXP => "**",
        _ => return None,
    })
}

/// Negated comparison renderings used directly under `ISZERO`.
fn negated_format(op: Opcode) -> Option<&'static str> {
    Some(match op {
        Opcode::GT | Opcode::SGT => "<=",
        Opcode::LT | Opcode::SLT => ">=",
        Opcode::EQ => "!=",
        _ => return None,
    })
}

/// Render a tree. `with_counts`/`with_keys` apply to the root's alias only;
/// descendants always render fully qualified.
pub fn render_tree(
    arena: &TreeArena,
    registry: &VarRegistry,
    id: TreeId,
    with_counts: bool,
    with_keys: bool,
) -> String {
    let mut cache: FxHashMap<TreeId, String> = FxHashMap::default();
    render_with_cache(arena, registry, id, with_counts, with_keys, &mut cache)
}

fn render_with_cache(
    arena: &TreeArena,
    registry: &VarRegistry,
    root: TreeId,
    with_counts: bool,
    with_keys: bool,
    cache: &mut FxHashMap<TreeId, String>,
) -> String {
    // Post-order over an explicit stack; sons are rendered (and cached)
    // before their father composes them.
    let mut stack: Vec<(TreeId, bool)> = vec![(root, false)];
    while let Some((id, expanded)) = stack.pop() {
        if cache.contains_key(&id) {
            continue;
        }
        let node = arena.node(id);
        if node.alias.is_some() || node.sons.is_empty() {
            let text = if let Some(alias) = &node.alias {
                render_var(arena, registry, alias, true, true)
            } else {
                node.kind.label()
            };
            cache.insert(id, text);
            continue;
        }
        if !expanded {
            stack.push((id, true));
            for son in node.sons.iter().rev() {
                stack.push((*son, false));
            }
            continue;
        }
        let text = compose(arena, registry, id, cache);
        cache.insert(id, text);
    }

    // Root honors the requested qualification.
    let root_node = arena.node(root);
    if let Some(alias) = &root_node.alias {
        render_var(arena, registry, alias, with_counts, with_keys)
    } else {
        cache.get(&root).cloned().unwrap_or_default()
    }
}

fn compose(
    arena: &TreeArena,
    registry: &VarRegistry,
    id: TreeId,
    cache: &FxHashMap<TreeId, String>,
) -> String {
    let node = arena.node(id);
    let son_text = |s: TreeId| cache.get(&s).cloned().unwrap_or_default();
    match &node.kind {
        NodeKind::Op(Opcode::ISZERO) if node.sons.len() == 1 => {
            let son = node.sons[0];
            let son_node = arena.node(son);
            if son_node.alias.is_none() && son_node.sons.len() == 2 {
                if let NodeKind::Op(op) = &son_node.kind {
                    if let Some(sym) = negated_format(*op) {
                        return format!(
                            "({} {} {})",
                            son_text(son_node.sons[0]),
                            sym,
                            son_text(son_node.sons[1])
                        );
                    }
                }
            }
            format!("(0 == {})", son_text(son))
        }
        NodeKind::Op(Opcode::SIGNEXTEND) if node.sons.len() == 2 => {
            format!(
                "(SIGNEXTEND({},{}))",
                son_text(node.sons[1]),
                son_text(node.sons[0])
            )
        }
        NodeKind::Op(op) if node.sons.len() == 2 && binary_format(*op).is_some() => {
            let sym = binary_format(*op).unwrap_or_default();
            format!("({} {} {})", son_text(node.sons[0]), sym, son_text(node.sons[1]))
        }
        kind => {
            let sons: Vec<String> = node.sons.iter().map(|s| son_text(*s)).collect();
            format!("{}({})", kind.label(), sons.join(","))
        }
    }
}

/// Render a recovered variable.
pub fn render_var(
    arena: &TreeArena,
    registry: &VarRegistry,
    var: &EvmVar,
    with_counts: bool,
    with_keys: bool,
) -> String {
    match var {
        EvmVar::Property(name) => name.clone(),
        EvmVar::Arg(arg) => {
            if with_keys && !arg.keys.is_empty() {
                format!("Arg{}.{}", arg.index, arg.keys)
            } else if arg.index >= 0 {
                format!("Arg{}", arg.index)
            } else {
                "Args".to_string()
            }
        }
        EvmVar::State(state_ref) => {
            let info = registry.state(state_ref.id);
            let keys_str = if with_keys {
                render_keys(arena, registry, &state_ref.keys)
            } else {
                String::new()
            };
            let mut text = if let Some(name) = &info.name {
                format!("{name}{keys_str}")
            } else {
                match (info.offset, info.length) {
                    (Some(0), Some(32)) | (None, _) | (_, None) => {
                        format!("S({}){keys_str}", info.index)
                    }
                    (Some(offset), Some(length)) => {
                        format!("S({})({}:{}){keys_str}", info.index, offset, offset + length)
                    }
                }
            };
            if with_counts {
                text.push_str(&format!("_{}", state_ref.counts));
            }
            text
        }
    }
}

/// The bracketed key-list suffix used both for display and as the
/// `counts_mapping` key.
pub fn render_keys(arena: &TreeArena, registry: &VarRegistry, keys: &[TreeId]) -> String {
    let mut out = String::new();
    for key in keys {
        out.push('[');
        out.push_str(&render_tree(arena, registry, *key, true, true));
        out.push(']');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EvmType, TypeHints};
    use crate::vars::{ArgRef, StateRef};
    use ethereum_types::U256;

    #[test]
    fn comparison_renders_infix() {
        let mut arena = TreeArena::default();
        let registry = VarRegistry::default();
        let caller = arena.op(Opcode::CALLER, Vec::new());
        let c = arena.constant(U256::from(0xaa));
        let eq = arena.op(Opcode::EQ, vec![caller, c]);
        assert_eq!(render_tree(&arena, &registry, eq, true, true), "(CALLER == 0xaa)");
        let not = arena.op(Opcode::ISZERO, vec![eq]);
        assert_eq!(render_tree(&arena, &registry, not, true, true), "(CALLER != 0xaa)");
    }

    #[test]
    fn nullary_and_nary_render_as_calls() {
        let mut arena = TreeArena::default();
        let registry = VarRegistry::default();
        let zero = arena.constant(U256::zero());
        let sload = arena.op(Opcode::SLOAD, vec![zero]);
        assert_eq!(render_tree(&arena, &registry, sload, true, true), "SLOAD(0x0)");
        let ts = arena.op(Opcode::TIMESTAMP, Vec::new());
        assert_eq!(render_tree(&arena, &registry, ts, true, true), "TIMESTAMP");
    }

    #[test]
    fn state_rendering_shows_packing_and_counts() {
        let mut arena = TreeArena::default();
        let mut registry = VarRegistry::default();
        let id = registry.get_or_insert_state(
            U256::from(5),
            Some(16),
            Some(16),
            EvmType::new(TypeHints::default(), Some(16)),
        );
        let var = EvmVar::State(StateRef {
            id,
            keys: Vec::new(),
            counts: 1,
        });
        assert_eq!(render_var(&arena, &registry, &var, true, true), "S(5)(16:32)_1");
        assert_eq!(render_var(&arena, &registry, &var, false, true), "S(5)(16:32)");
        let caller = arena.op(Opcode::CALLER, Vec::new());
        let keyed = EvmVar::State(StateRef {
            id,
            keys: vec![caller],
            counts: 0,
        });
        assert_eq!(
            render_var(&arena, &registry, &keyed, false, true),
            "S(5)(16:32)[CALLER]"
        );
    }

    #[test]
    fn arg_rendering() {
        let arena = TreeArena::default();
        let registry = VarRegistry::default();
        let arg = EvmVar::Arg(ArgRef {
            index: 1,
            is_dynamic: true,
            keys: "length".to_string(),
        });
        assert_eq!(render_var(&arena, &registry, &arg, false, true), "Arg1.length");
        assert_eq!(render_var(&arena, &registry, &arg, false, false), "Arg1");
    }
}
