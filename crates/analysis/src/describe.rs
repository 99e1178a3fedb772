//! Natural-language rendering of semantic units.
//!
//! One guarded sentence per unit, grouped by function, derived entirely
//! from the serialized unit structure so it can run over a units file
//! without re-analysis.

use std::collections::BTreeMap;

use serde_json::{json, Value};

fn describe_variable(var: &Value) -> String {
    match var.get("variableType").and_then(Value::as_str) {
        Some("EVMState") => {
            if let Some(name) = var.get("name").and_then(Value::as_str) {
                return name.to_string();
            }
            let index = var.get("index").and_then(Value::as_str).unwrap_or("?");
            let keys = var.get("keys").and_then(Value::as_array);
            match keys {
                Some(keys) if !keys.is_empty() => {
                    let rendered: Vec<String> = keys.iter().map(describe_tree).collect();
                    format!("storage[{index}][{}]", rendered.join("]["))
                }
                _ => format!("storage[{index}]"),
            }
        }
        Some("EVMArg") => {
            let index = var.get("index").and_then(Value::as_i64).unwrap_or(-1);
            if index < 0 {
                "the call data".to_string()
            } else {
                format!("argument {index}")
            }
        }
        Some("EVMProperty") => match var.get("name").and_then(Value::as_str) {
            Some("CALLER") => "the sender".to_string(),
            Some("CALLVALUE") => "the paid amount".to_string(),
            Some("TIMESTAMP") => "the block timestamp".to_string(),
            Some("ORIGIN") => "the transaction origin".to_string(),
            Some("newContract") => "a new contract".to_string(),
            Some(other) => other.to_string(),
            None => "?".to_string(),
        },
        _ => "?".to_string(),
    }
}

fn describe_tree(tree: &Value) -> String {
    if let Some(alias) = tree.get("alias_evm_variable") {
        if !alias.is_null() {
            return describe_variable(alias);
        }
    }
    let name = tree.get("name").and_then(Value::as_str).unwrap_or("?");
    let sons: Vec<String> = tree
        .get("sons")
        .and_then(Value::as_array)
        .map(|sons| sons.iter().map(describe_tree).collect())
        .unwrap_or_default();
    match (name, sons.len()) {
        (_, 0) => name.to_string(),
        ("EQ", 2) => format!("{} equals {}", sons[0], sons[1]),
        ("LT", 2) | ("SLT", 2) => format!("{} is below {}", sons[0], sons[1]),
        ("GT", 2) | ("SGT", 2) => format!("{} is above {}", sons[0], sons[1]),
        ("ISZERO", 1) => format!("{} is zero", sons[0]),
        ("ADD", 2) => format!("{} plus {}", sons[0], sons[1]),
        ("SUB", 2) => format!("{} minus {}", sons[0], sons[1]),
        ("MUL", 2) => format!("{} times {}", sons[0], sons[1]),
        ("SLOAD", 1) => format!("storage[{}]", sons[0]),
        _ => format!("{name}({})", sons.join(", ")),
    }
}

fn describe_condition(condition: &Value) -> String {
    // ISZERO(ISZERO(x)) is the truthiness wrapper; describe the inner x.
    let mut tree = &condition["optree"];
    loop {
        let is_wrap = tree["name"] == "ISZERO"
            && tree["sons"].as_array().is_some_and(|s| s.len() == 1)
            && tree["sons"][0]["name"] == "ISZERO";
        if !is_wrap {
            break;
        }
        tree = &tree["sons"][0]["sons"][0];
    }
    let described = describe_tree(tree);
    let is_comparison = matches!(
        tree["name"].as_str(),
        Some("EQ" | "LT" | "GT" | "SLT" | "SGT" | "ISZERO")
    );
    if is_comparison {
        described
    } else {
        format!("{described} is nonzero")
    }
}

fn describe_behavior(behavior: &Value) -> String {
    let rhs = describe_variable(&behavior["rhs"]);
    let lhs: Vec<String> = behavior["lhs"]
        .as_array()
        .map(|trees| trees.iter().map(describe_tree).collect())
        .unwrap_or_default();
    let first = lhs.first().cloned().unwrap_or_else(|| "?".to_string());
    match behavior["behavior_type"].as_str() {
        Some("SSTORE") => format!("sets {rhs} to {first}"),
        Some("PUSH") => format!("appends {first} to {rhs}"),
        Some("CALL") | Some("CALLCODE") => {
            if lhs.len() > 1 {
                format!(
                    "calls {rhs} with value {first} and arguments {}",
                    lhs[1..].join(", ")
                )
            } else {
                format!("calls {rhs} with value {first}")
            }
        }
        Some("DELEGATECALL") => format!("delegates execution to {rhs}"),
        Some("STATICCALL") => format!("statically calls {rhs}"),
        Some("CREATE") | Some("CREATE2") => "deploys a new contract".to_string(),
        Some("SELFDESTRUCT") => format!("destroys the contract, sending its balance to {rhs}"),
        _ => format!("performs an effect on {rhs}"),
    }
}

/// Render one unit as a sentence.
pub fn describe_unit(unit: &Value) -> String {
    let mut sentence = String::new();
    if let Some(conditions) = unit["conditions"].as_array() {
        if !conditions.is_empty() {
            let rendered: Vec<String> = conditions.iter().map(describe_condition).collect();
            sentence.push_str(&format!("When {}, the contract ", rendered.join(" and ")));
        }
    }
    if sentence.is_empty() {
        sentence.push_str("The contract ");
    }
    sentence.push_str(&describe_behavior(&unit["behavior"]));
    sentence.push('.');
    sentence
}

/// Group the unit descriptions by function.
pub fn describe_units(units: &[Value]) -> Value {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for unit in units {
        let sentence = describe_unit(unit);
        let functions = unit["belong_functions"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        if functions.is_empty() {
            grouped.entry("0x".to_string()).or_default().push(sentence);
            continue;
        }
        for function in functions {
            let tag = function.as_str().unwrap_or("0x").to_string();
            grouped.entry(tag).or_default().push(sentence.clone());
        }
    }
    json!(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_store_reads_naturally() {
        let unit = json!({
            "conditions": [{
                "optree": {
                    "name": "EQ",
                    "alias_evm_variable": null,
                    "contained_evm_states": [],
                    "sons": [
                        {"name": "CALLER", "alias_evm_variable": {"variableType": "EVMProperty", "name": "CALLER"}, "contained_evm_states": [], "sons": []},
                        {"name": "0xaa", "alias_evm_variable": null, "contained_evm_states": [], "sons": []}
                    ]
                },
                "condition_pc": "0x10",
                "cstates": {}
            }],
            "behavior": {
                "rhs": {"variableType": "EVMState", "index": "0", "offset": 0, "length": 32,
                        "type": {"type_name": "uint256"}, "is_public": false, "signature": "",
                        "counts": 1, "counts_mapping": {}, "name": "owner", "keys": []},
                "lhs": [{"name": "0x1", "alias_evm_variable": null, "contained_evm_states": [], "sons": []}],
                "behavior_type": "SSTORE",
                "behavior_pcs": ["0x20"]
            },
            "belong_functions": ["0x12345678_set"]
        });
        let sentence = describe_unit(&unit);
        assert_eq!(
            sentence,
            "When the sender equals 0xaa, the contract sets owner to 0x1."
        );
    }

    #[test]
    fn truthiness_wrapper_is_unwrapped() {
        let unit = json!({
            "conditions": [{
                "optree": {
                    "name": "ISZERO",
                    "alias_evm_variable": null,
                    "contained_evm_states": [],
                    "sons": [{
                        "name": "ISZERO",
                        "alias_evm_variable": null,
                        "contained_evm_states": [],
                        "sons": [{"name": "CALLVALUE", "alias_evm_variable": {"variableType": "EVMProperty", "name": "CALLVALUE"}, "contained_evm_states": [], "sons": []}]
                    }]
                },
                "condition_pc": "0x4",
                "cstates": {}
            }],
            "behavior": {
                "rhs": {"variableType": "EVMProperty", "name": "CALLER"},
                "lhs": [{"name": "CALLVALUE", "alias_evm_variable": {"variableType": "EVMProperty", "name": "CALLVALUE"}, "contained_evm_states": [], "sons": []}],
                "behavior_type": "CALL",
                "behavior_pcs": ["0x30"]
            },
            "belong_functions": []
        });
        let sentence = describe_unit(&unit);
        assert!(sentence.starts_with("When the paid amount is nonzero, the contract calls"));
    }
}
