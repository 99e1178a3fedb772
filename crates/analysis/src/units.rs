//! Semantic units: guarded behavior records.
//!
//! A [`Condition`] is a normalized guard attached to a block; a
//! [`Behavior`] is one externally-observable effect; a [`SemanticUnit`]
//! pairs a behavior with the conditions governing it and the functions it
//! belongs to. Units are deduplicated by their rendered textual form, and
//! serialized as one JSON object per line.

use std::collections::BTreeSet;

use serde_json::{json, Value};

use sema_lift::value::VarId;

use crate::render::{render_tree, render_var};
use crate::tree::{CStates, NodeKind, TreeArena, TreeId};
use crate::vars::{EvmVar, VarRegistry};

/// A guard observed at a `JUMPI`, normalized to boolean shape.
#[derive(Debug, Clone)]
pub struct Condition {
    pub tree: TreeId,
    pub condition_pc: usize,
    pub dst_var: VarId,
    pub cond_var: VarId,
    pub block_ident: usize,
    pub cstates: CStates,
}

/// The effect kind of a behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BehaviorKind {
    Sstore,
    Create,
    Create2,
    Call,
    CallCode,
    DelegateCall,
    StaticCall,
    SelfDestruct,
    /// Dynamic array append, produced by the post-processor.
    Push,
}

impl BehaviorKind {
    pub fn name(&self) -> &'static str {
        match self {
            BehaviorKind::Sstore => "SSTORE",
            BehaviorKind::Create => "CREATE",
            BehaviorKind::Create2 => "CREATE2",
            BehaviorKind::Call => "CALL",
            BehaviorKind::CallCode => "CALLCODE",
            BehaviorKind::DelegateCall => "DELEGATECALL",
            BehaviorKind::StaticCall => "STATICCALL",
            BehaviorKind::SelfDestruct => "SELFDESTRUCT",
            BehaviorKind::Push => "PUSH",
        }
    }
}

/// One externally-observable effect.
#[derive(Debug, Clone)]
pub struct Behavior {
    /// The written state, called address, or beneficiary.
    pub rhs: EvmVar,
    /// Written value, call arguments, creation code.
    pub lhs: Vec<TreeId>,
    pub kind: BehaviorKind,
    pub behavior_pcs: Vec<usize>,
    pub block_ident: usize,
}

/// A guarded behavior with the functions it was observed in.
#[derive(Debug, Clone)]
pub struct SemanticUnit {
    pub conditions: Vec<Condition>,
    pub behavior: Behavior,
    pub belong_functions: BTreeSet<String>,
    /// The unit collapsed several loop iterations.
    pub with_loops: bool,
}

impl Condition {
    /// Canonical text, the dedup key.
    pub fn rendered(&self, arena: &TreeArena, registry: &VarRegistry) -> String {
        render_tree(arena, registry, self.tree, true, true)
    }
}

impl Behavior {
    pub fn rendered(&self, arena: &TreeArena, registry: &VarRegistry) -> String {
        let lhs: Vec<String> = self
            .lhs
            .iter()
            .map(|t| render_tree(arena, registry, *t, true, true))
            .collect();
        format!(
            "{} {} {}",
            self.kind.name(),
            lhs.join(","),
            render_var(arena, registry, &self.rhs, true, true)
        )
    }
}

impl SemanticUnit {
    /// Canonical text over conditions, behavior and functions; structural
    /// equality is equality of this string.
    pub fn rendered(&self, arena: &TreeArena, registry: &VarRegistry) -> String {
        let mut out = String::new();
        for condition in &self.conditions {
            out.push_str(&condition.rendered(arena, registry));
            out.push('\n');
        }
        out.push_str(&self.behavior.rendered(arena, registry));
        for function in &self.belong_functions {
            out.push('\n');
            out.push_str(function);
        }
        out
    }
}

// ─── JSON output ────────────────────────────────────────────────────────

fn cstates_json(cstates: CStates) -> Value {
    json!({
        "check_on_sload": cstates.contains(CStates::ON_SLOAD),
        "check_on_caller": cstates.contains(CStates::ON_CALLER),
        "check_on_callvalue": cstates.contains(CStates::ON_CALLVALUE),
        "check_on_extcodesize": cstates.contains(CStates::ON_EXTCODESIZE),
        "check_on_calldatasize": cstates.contains(CStates::ON_CALLDATASIZE),
        "check_on_calls": cstates.contains(CStates::ON_CALLS),
        "check_on_creates": cstates.contains(CStates::ON_CREATES),
        "check_on_selfdestruct": cstates.contains(CStates::ON_SELFDESTRUCT),
        "check_on_callreturn": cstates.contains(CStates::ON_CALLRETURN),
    })
}

/// Serialize a recovered variable.
pub fn dump_var(arena: &TreeArena, registry: &VarRegistry, var: &EvmVar) -> Value {
    match var {
        EvmVar::Property(name) => json!({
            "variableType": "EVMProperty",
            "name": name,
        }),
        EvmVar::Arg(arg) => json!({
            "variableType": "EVMArg",
            "index": arg.index,
            "is_dynamic": arg.is_dynamic,
            "keys": arg.keys,
        }),
        EvmVar::State(state) => {
            let info = registry.state(state.id);
            let keys: Vec<Value> = state
                .keys
                .iter()
                .map(|k| dump_tree(arena, registry, *k))
                .collect();
            let counts_mapping: serde_json::Map<String, Value> = {
                let mut sorted: Vec<(&String, &Vec<usize>)> = info.counts_mapping.iter().collect();
                sorted.sort();
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), json!(v)))
                    .collect()
            };
            json!({
                "variableType": "EVMState",
                "index": info.index.to_string(),
                "offset": info.offset,
                "length": info.length,
                "type": { "type_name": info.ty.to_string() },
                "is_public": info.is_public,
                "signature": info.signature,
                "counts": state.counts,
                "counts_mapping": counts_mapping,
                "name": info.name,
                "keys": keys,
            })
        }
    }
}

/// Serialize a tree recursively: `{name, alias_evm_variable,
/// contained_evm_states, sons}`.
pub fn dump_tree(arena: &TreeArena, registry: &VarRegistry, id: TreeId) -> Value {
    // Explicit stack, post-order: sons are serialized before the father.
    let mut done: rustc_hash::FxHashMap<TreeId, Value> = rustc_hash::FxHashMap::default();
    let mut stack = vec![(id, false)];
    while let Some((current, expanded)) = stack.pop() {
        if done.contains_key(&current) {
            continue;
        }
        let node = arena.node(current);
        if !expanded && !node.sons.is_empty() {
            stack.push((current, true));
            for son in node.sons.iter().rev() {
                stack.push((*son, false));
            }
            continue;
        }
        let sons: Vec<Value> = node
            .sons
            .iter()
            .map(|s| done.get(s).cloned().unwrap_or(Value::Null))
            .collect();
        let alias = node
            .alias
            .as_ref()
            .map(|a| dump_var(arena, registry, a))
            .unwrap_or(Value::Null);
        let contained: Vec<Value> = node
            .contained_states
            .iter()
            .map(|s| dump_var(arena, registry, s))
            .collect();
        done.insert(
            current,
            json!({
                "name": node.kind.label(),
                "alias_evm_variable": alias,
                "contained_evm_states": contained,
                "sons": sons,
            }),
        );
    }
    done.remove(&id).unwrap_or(Value::Null)
}

/// Parse a serialized tree back into the arena (analyzer-state reload).
pub fn load_tree(arena: &mut TreeArena, value: &Value) -> Option<TreeId> {
    let name = value.get("name")?.as_str()?;
    let sons_value = value.get("sons")?.as_array()?;
    let mut sons = Vec::with_capacity(sons_value.len());
    for son in sons_value {
        sons.push(load_tree(arena, son)?);
    }
    let kind = parse_node_label(name);
    Some(arena.add(kind, sons))
}

/// Reverse of [`NodeKind::label`].
fn parse_node_label(label: &str) -> NodeKind {
    use std::str::FromStr;
    if let Some(hex_part) = label.strip_prefix("0x") {
        if let Ok(value) = ethereum_types::U256::from_str_radix(hex_part, 16) {
            return NodeKind::Const(value);
        }
    }
    if let Some((head, pc_part)) = label.split_once('@') {
        if let Some(pc) = pc_part
            .strip_prefix("0x")
            .and_then(|p| usize::from_str_radix(p, 16).ok())
        {
            if let Some(call) = head.strip_suffix("RETURN") {
                if let Ok(op) = sema_lift::opcodes::Opcode::from_str(call) {
                    return NodeKind::CallReturn { op, pc };
                }
            }
            if let Ok(op) = sema_lift::opcodes::Opcode::from_str(head) {
                return NodeKind::Source { op, pc };
            }
        }
    }
    match sema_lift::opcodes::Opcode::from_str(label) {
        Ok(op) => NodeKind::Op(op),
        Err(_) => NodeKind::Opaque(label.to_string()),
    }
}

/// Serialize one condition.
pub fn dump_condition(arena: &TreeArena, registry: &VarRegistry, condition: &Condition) -> Value {
    json!({
        "optree": dump_tree(arena, registry, condition.tree),
        "condition_pc": format!("{:#x}", condition.condition_pc),
        "cstates": cstates_json(condition.cstates),
    })
}

/// Serialize one semantic unit as the NDJSON object the downstream
/// description and graph tools consume.
pub fn dump_unit(arena: &TreeArena, registry: &VarRegistry, unit: &SemanticUnit) -> Value {
    let conditions: Vec<Value> = unit
        .conditions
        .iter()
        .map(|c| dump_condition(arena, registry, c))
        .collect();
    let lhs: Vec<Value> = unit
        .behavior
        .lhs
        .iter()
        .map(|t| dump_tree(arena, registry, *t))
        .collect();
    let pcs: Vec<String> = unit
        .behavior
        .behavior_pcs
        .iter()
        .map(|pc| format!("{pc:#x}"))
        .collect();
    json!({
        "conditions": conditions,
        "behavior": {
            "rhs": dump_var(arena, registry, &unit.behavior.rhs),
            "lhs": lhs,
            "behavior_type": unit.behavior.kind.name(),
            "behavior_pcs": pcs,
        },
        "belong_functions": unit.belong_functions.iter().collect::<Vec<_>>(),
        "with_loops": unit.with_loops,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::U256;
    use sema_lift::opcodes::Opcode;

    #[test]
    fn tree_roundtrips_through_json() {
        let mut arena = TreeArena::default();
        let registry = VarRegistry::default();
        let caller = arena.op(Opcode::CALLER, Vec::new());
        let c = arena.constant(U256::from(0xaau64));
        let eq = arena.op(Opcode::EQ, vec![caller, c]);
        let dumped = dump_tree(&arena, &registry, eq);
        assert_eq!(dumped["name"], "EQ");
        assert_eq!(dumped["sons"][0]["name"], "CALLER");
        assert_eq!(dumped["sons"][1]["name"], "0xaa");

        let reloaded = load_tree(&mut arena, &dumped).unwrap();
        assert!(arena.node(reloaded).kind.is_op(Opcode::EQ));
        assert_eq!(
            arena.const_of(arena.node(reloaded).sons[1]),
            Some(U256::from(0xaau64))
        );
    }

    #[test]
    fn source_labels_roundtrip() {
        let mut arena = TreeArena::default();
        let kind = parse_node_label("CALLDATACOPY@0x1f");
        assert!(matches!(
            kind,
            NodeKind::Source {
                op: Opcode::CALLDATACOPY,
                pc: 0x1f
            }
        ));
        let kind = parse_node_label("STATICCALLRETURN@0x2a");
        assert!(matches!(
            kind,
            NodeKind::CallReturn {
                op: Opcode::STATICCALL,
                pc: 0x2a
            }
        ));
        let id = arena.add(kind, Vec::new());
        assert!(arena.node(id).cstates.contains(CStates::ON_CALLRETURN));
    }
}
