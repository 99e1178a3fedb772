//! End-to-end scenarios: hand-assembled runtime bytecode through the whole
//! pipeline, checked against the expected semantic units.

use ethereum_types::U256;
use rustc_hash::FxHashMap;

use sema_analysis::pipeline::{analyze_bytecode, AnalysisOptions, AnalysisResult};
use sema_analysis::render::{render_tree, render_var};
use sema_analysis::sha3::Sha3Table;
use sema_analysis::units::{BehaviorKind, SemanticUnit};
use sema_analysis::vars::EvmVar;

fn run(bytecode: &str) -> AnalysisResult {
    analyze_bytecode(
        bytecode,
        &AnalysisOptions::default(),
        Sha3Table::default(),
        &FxHashMap::default(),
    )
}

fn behavior_text(result: &AnalysisResult, unit: &SemanticUnit) -> String {
    unit.behavior
        .rendered(&result.analyzer.arena, &result.analyzer.registry)
}

/// `if (msg.sender == 0xaa…aa) storage[0] = 1;`
#[test]
fn guarded_store_by_caller() {
    // CALLER; PUSH20 aa…; EQ; PUSH1 0x1b; JUMPI; STOP;
    // 0x1b: JUMPDEST; PUSH1 1; PUSH1 0; SSTORE; STOP
    let guard_addr = hex_literal::hex!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    let bytecode = format!("3373{}14601b57005b600160005500", hex::encode(guard_addr));
    let result = run(&bytecode);

    assert_eq!(result.units.len(), 1);
    let unit = &result.units[0];
    assert_eq!(unit.behavior.kind, BehaviorKind::Sstore);
    assert_eq!(unit.conditions.len(), 1);

    let condition = render_tree(
        &result.analyzer.arena,
        &result.analyzer.registry,
        unit.conditions[0].tree,
        true,
        true,
    );
    assert!(condition.contains("CALLER"), "condition: {condition}");
    assert!(condition.contains(&"aa".repeat(20)), "condition: {condition}");

    let EvmVar::State(state) = &unit.behavior.rhs else {
        panic!("rhs is not a state");
    };
    let info = result.analyzer.registry.state(state.id);
    assert_eq!(info.index, U256::zero());
    assert_eq!(info.offset, Some(0));
    assert_eq!(info.length, Some(32));
    let value = render_tree(
        &result.analyzer.arena,
        &result.analyzer.registry,
        unit.behavior.lhs[0],
        true,
        true,
    );
    assert_eq!(value, "0x1");
}

/// `balances[msg.sender] = balances[msg.sender] + amount`
#[test]
fn mapping_write_with_calldata_amount() {
    // CALLER; PUSH1 0; MSTORE; PUSH1 1; PUSH1 0x20; MSTORE;
    // PUSH1 0x40; PUSH1 0; SHA3; DUP1; SLOAD;
    // PUSH1 4; CALLDATALOAD; ADD; SWAP1; SSTORE; STOP
    let result = run("336000526001602052604060002080546004350190550000");

    assert_eq!(result.units.len(), 1);
    let unit = &result.units[0];
    assert_eq!(unit.behavior.kind, BehaviorKind::Sstore);
    assert!(unit.conditions.is_empty());

    let EvmVar::State(state) = &unit.behavior.rhs else {
        panic!("rhs is not a state");
    };
    let info = result.analyzer.registry.state(state.id);
    assert_eq!(info.index, U256::one());
    assert_eq!(info.length, Some(32));
    assert_eq!(info.ty.to_string(), "uint256");
    assert_eq!(state.keys.len(), 1);
    assert!(result
        .analyzer
        .arena
        .node(state.keys[0])
        .kind
        .is_op(sema_lift::opcodes::Opcode::CALLER));

    let value = render_tree(
        &result.analyzer.arena,
        &result.analyzer.registry,
        unit.behavior.lhs[0],
        true,
        true,
    );
    assert!(value.contains("Arg0"), "value: {value}");
    assert!(value.contains('+'), "value: {value}");
}

/// `target.call{value: msg.value}("")` with the target read from slot 0.
#[test]
fn external_call_with_value_widens_address() {
    // retLen/retOff/argsLen/argsOff = 0; CALLVALUE; PUSH1 0; SLOAD; GAS;
    // CALL; POP; STOP
    let result = run("6000600060006000346000545af15000");

    assert_eq!(result.units.len(), 1);
    let unit = &result.units[0];
    assert_eq!(unit.behavior.kind, BehaviorKind::Call);

    // lhs[0] is the transferred value.
    let value_node = &result.analyzer.arena.node(unit.behavior.lhs[0]);
    let value_label = match &value_node.alias {
        Some(alias) => render_var(
            &result.analyzer.arena,
            &result.analyzer.registry,
            alias,
            true,
            true,
        ),
        None => value_node.kind.label(),
    };
    assert_eq!(value_label, "CALLVALUE");

    // The called address is the slot-0 state, widened to a contract.
    let EvmVar::State(state) = &unit.behavior.rhs else {
        panic!("rhs is not a state: {:?}", unit.behavior.rhs);
    };
    let info = result.analyzer.registry.state(state.id);
    assert_eq!(info.index, U256::zero());
    assert_eq!(info.ty.to_string(), "user_define_contract");
}

/// Two `uint128` fields of slot 5 written by one `SSTORE`.
#[test]
fn packed_slot_store_splits_into_two_units() {
    let keep_high = format!("{}{}", "ff".repeat(16), "00".repeat(16));
    let keep_low = format!("{}{}", "00".repeat(16), "ff".repeat(16));
    let shift = format!("01{}", "00".repeat(16));
    // PUSH1 0x2a; PUSH32 keepHigh; PUSH1 5; SLOAD; AND; OR;
    // PUSH32 keepLow; AND; PUSH1 7; PUSH17 2^128; MUL; OR;
    // PUSH1 5; SSTORE; STOP
    let bytecode =
        format!("602a7f{keep_high}60055416177f{keep_low}16600770{shift}021760055500");
    let result = run(&bytecode);

    let stores: Vec<&SemanticUnit> = result
        .units
        .iter()
        .filter(|u| u.behavior.kind == BehaviorKind::Sstore)
        .collect();
    assert_eq!(stores.len(), 2, "units: {:#?}", result
        .units
        .iter()
        .map(|u| behavior_text(&result, u))
        .collect::<Vec<_>>());

    let same_pc: Vec<Vec<usize>> = stores.iter().map(|u| u.behavior.behavior_pcs.clone()).collect();
    assert_eq!(same_pc[0], same_pc[1]);

    let mut windows = Vec::new();
    for unit in &stores {
        let EvmVar::State(state) = &unit.behavior.rhs else {
            panic!("rhs is not a state");
        };
        let info = result.analyzer.registry.state(state.id);
        assert_eq!(info.index, U256::from(5));
        assert_eq!(info.length, Some(16));
        windows.push(info.offset.unwrap());
    }
    windows.sort();
    assert_eq!(windows, vec![0, 16]);

    // The written values are the unshifted field values.
    let values: Vec<String> = stores
        .iter()
        .map(|u| {
            render_tree(
                &result.analyzer.arena,
                &result.analyzer.registry,
                u.behavior.lhs[0],
                true,
                true,
            )
        })
        .collect();
    assert!(values.contains(&"0x2a".to_string()), "values: {values:?}");
    assert!(values.contains(&"0x7".to_string()), "values: {values:?}");
}

/// `arr.push(x)`: the length bump and the element store merge into one
/// `PUSH` unit.
#[test]
fn dynamic_array_push_merges_to_push_unit() {
    // PUSH1 5; SLOAD; DUP1; PUSH1 1; ADD; PUSH1 5; SSTORE;
    // PUSH1 5; PUSH1 0; MSTORE; PUSH1 0x20; PUSH1 0; SHA3; ADD;
    // PUSH1 0x2a; SWAP1; SSTORE; STOP
    let result = run("600554806001016005556005600052602060002001602a905500");

    assert_eq!(result.units.len(), 1);
    let unit = &result.units[0];
    assert_eq!(unit.behavior.kind, BehaviorKind::Push);
    assert_eq!(unit.behavior.behavior_pcs.len(), 2);

    let EvmVar::State(state) = &unit.behavior.rhs else {
        panic!("rhs is not a state");
    };
    assert!(state.keys.is_empty());
    let info = result.analyzer.registry.state(state.id);
    assert_eq!(info.index, U256::from(5));
    assert!(info.is_dynamic_slot());

    let value = render_tree(
        &result.analyzer.arena,
        &result.analyzer.registry,
        unit.behavior.lhs[0],
        true,
        true,
    );
    assert_eq!(value, "0x2a");
}

/// `require(x == 1); require(x == 2); storage[0] = 1` — nothing past the
/// second require is reachable.
#[test]
fn contradictory_requires_prune_the_path() {
    // 0: PUSH1 4; CALLDATALOAD; PUSH1 1; EQ; PUSH1 0x0e; JUMPI;
    //    PUSH1 0; PUSH1 0; REVERT
    // 0x0e: JUMPDEST; PUSH1 4; CALLDATALOAD; PUSH1 2; EQ; PUSH1 0x1d; JUMPI;
    //    PUSH1 0; PUSH1 0; REVERT
    // 0x1d: JUMPDEST; PUSH1 1; PUSH1 0; SSTORE; STOP
    let result = run(
        "600435600114600e5760006000fd5b600435600214601d5760006000fd5b600160005500",
    );
    assert!(result.units.is_empty(), "units: {:#?}", result
        .units
        .iter()
        .map(|u| behavior_text(&result, u))
        .collect::<Vec<_>>());
}

/// The same bytecode yields the same unit set on every run.
#[test]
fn pipeline_is_deterministic() {
    let bytecode = format!("3373{}14601b57005b600160005500", "aa".repeat(20));
    let first = run(&bytecode);
    let second = run(&bytecode);
    let render = |r: &AnalysisResult| -> Vec<String> {
        r.units
            .iter()
            .map(|u| u.rendered(&r.analyzer.arena, &r.analyzer.registry))
            .collect()
    };
    assert_eq!(render(&first), render(&second));
}

/// Every `SSTORE` on a surviving path shows up in some unit's pcs.
#[test]
fn sstore_completeness_over_branches() {
    // CALLVALUE; PUSH1 0x0a; JUMPI; PUSH1 1; PUSH1 0; SSTORE; STOP;
    // 0x0a: JUMPDEST; PUSH1 2; PUSH1 1; SSTORE; STOP
    let result = run("34600a576001600055005b600260015500");
    let mut pcs: Vec<usize> = result
        .units
        .iter()
        .flat_map(|u| u.behavior.behavior_pcs.iter().copied())
        .collect();
    pcs.sort_unstable();
    // SSTOREs at pc 8 (fallthrough arm) and pc 15 (jump arm).
    assert_eq!(pcs, vec![8, 15]);
}

/// Cstates invariant over every condition the pipeline produced: a node's
/// bits are the OR of its own and its sons'.
#[test]
fn condition_cstates_match_tree_contents() {
    let bytecode = format!("3373{}14601b57005b600160005500", "aa".repeat(20));
    let result = run(&bytecode);
    assert!(!result.units.is_empty());
    for unit in &result.units {
        for condition in &unit.conditions {
            let mut queue = vec![condition.tree];
            while let Some(id) = queue.pop() {
                let node = result.analyzer.arena.node(id);
                let mut from_sons = sema_analysis::tree::CStates::empty();
                for son in &node.sons {
                    from_sons |= result.analyzer.arena.node(*son).cstates;
                }
                assert!(node.cstates.contains(from_sons), "cstates not monotone");
                queue.extend(node.sons.iter().copied());
            }
        }
    }
}
