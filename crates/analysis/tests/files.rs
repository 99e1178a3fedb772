//! File-level integration: the working-directory contract of the static
//! and transaction analyzers.

use std::fs;
use std::path::PathBuf;

use sema_analysis::pipeline::{static_analysis, transaction_analysis, AnalysisOptions};

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("sema-test-{tag}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

#[test]
fn static_analysis_writes_units_and_state() {
    let dir = scratch_dir("static");
    let address = "0x00000000000000000000000000000000000000a1";
    let bytecode = format!("3373{}14601b57005b600160005500", "aa".repeat(20));
    fs::write(dir.join(format!("{address}.hex")), format!("0x{bytecode}\n")).unwrap();

    let result = static_analysis(address, &dir, &AnalysisOptions::default()).unwrap();
    assert_eq!(result.units.len(), 1);

    let units_raw = fs::read_to_string(dir.join("semantic_units.json")).unwrap();
    let lines: Vec<&str> = units_raw.lines().filter(|l| !l.trim().is_empty()).collect();
    assert_eq!(lines.len(), 1);
    let unit: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(unit["behavior"]["behavior_type"], "SSTORE");
    assert_eq!(unit["behavior"]["rhs"]["variableType"], "EVMState");
    assert_eq!(unit["behavior"]["behavior_pcs"][0], "0x20");
    assert_eq!(unit["conditions"][0]["cstates"]["check_on_caller"], true);

    let analyzer_raw = fs::read_to_string(dir.join("evm_analyzer.json")).unwrap();
    let dump: serde_json::Value = serde_json::from_str(&analyzer_raw).unwrap();
    assert!(dump["EVMVariables"]["evm_states"].as_array().is_some());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn missing_bytecode_is_fatal() {
    let dir = scratch_dir("missing");
    let result = static_analysis("0xdeadbeef", &dir, &AnalysisOptions::default());
    assert!(result.is_err());
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn transaction_analysis_follows_the_witnessed_path() {
    let dir = scratch_dir("tx");
    // Trace of the guarded-store contract taking the jump.
    let addr_imm = "aa".repeat(20);
    let steps = serde_json::json!([
        {"pc": "0x0", "op": "CALLER", "values": []},
        {"pc": "0x1", "op": "PUSH20", "values": [format!("0x{addr_imm}")]},
        {"pc": "0x16", "op": "EQ", "values": []},
        {"pc": "0x17", "op": "PUSH1", "values": ["0x1b"]},
        {"pc": "0x19", "op": "JUMPI", "values": []},
        {"pc": "0x1b", "op": "JUMPDEST", "values": []},
        {"pc": "0x1c", "op": "PUSH1", "values": ["0x1"]},
        {"pc": "0x1e", "op": "PUSH1", "values": ["0x0"]},
        {"pc": "0x20", "op": "SSTORE", "values": ["0x0", "0x1"]},
        {"pc": "0x21", "op": "STOP", "values": []},
    ]);
    let tx = "0xfeedbead";
    fs::write(
        dir.join(format!("{tx}.trace.json")),
        serde_json::to_string(&steps).unwrap(),
    )
    .unwrap();

    let result = transaction_analysis(tx, &dir).unwrap();
    assert_eq!(result.units.len(), 1);
    assert_eq!(result.units[0].behavior.behavior_pcs, vec![0x20]);

    let raw = fs::read_to_string(dir.join("transaction_semantic_units.json")).unwrap();
    assert_eq!(raw.lines().count(), 1);

    let _ = fs::remove_dir_all(&dir);
}
