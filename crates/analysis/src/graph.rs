//! Typed behavior graph.
//!
//! Turns a semantic-unit NDJSON stream into a DAG: function, condition,
//! behavior and variable nodes, with `contains`, `guards`, `writes` and
//! `reads` edges. The graph is consumed by visualization tooling and is
//! deliberately plain JSON.

use rustc_hash::FxHashMap;
use serde_json::{json, Value};

/// Node categories of the behavior graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Function,
    Condition,
    Behavior,
    Variable,
}

impl NodeKind {
    fn name(&self) -> &'static str {
        match self {
            NodeKind::Function => "function",
            NodeKind::Condition => "condition",
            NodeKind::Behavior => "behavior",
            NodeKind::Variable => "variable",
        }
    }
}

#[derive(Debug, Default)]
struct GraphBuilder {
    nodes: Vec<Value>,
    edges: Vec<Value>,
    ids: FxHashMap<(String, String), usize>,
}

impl GraphBuilder {
    fn node(&mut self, kind: NodeKind, label: &str) -> usize {
        let key = (kind.name().to_string(), label.to_string());
        if let Some(id) = self.ids.get(&key) {
            return *id;
        }
        let id = self.nodes.len();
        self.nodes.push(json!({
            "id": id,
            "kind": kind.name(),
            "label": label,
        }));
        self.ids.insert(key, id);
        id
    }

    fn edge(&mut self, from: usize, to: usize, kind: &str) {
        self.edges.push(json!({
            "from": from,
            "to": to,
            "kind": kind,
        }));
    }
}

fn variable_label(var: &Value) -> Option<String> {
    match var.get("variableType")?.as_str()? {
        "EVMState" => {
            let name = var.get("name").and_then(Value::as_str);
            Some(match name {
                Some(name) => name.to_string(),
                None => format!("S({})", var.get("index")?.as_str().unwrap_or("?")),
            })
        }
        "EVMArg" => Some(format!("Arg{}", var.get("index")?.as_i64().unwrap_or(-1))),
        "EVMProperty" => Some(var.get("name")?.as_str()?.to_string()),
        _ => None,
    }
}

/// Variables mentioned anywhere inside a serialized tree.
fn tree_variables(tree: &Value, out: &mut Vec<String>) {
    if let Some(alias) = tree.get("alias_evm_variable") {
        if !alias.is_null() {
            if let Some(label) = variable_label(alias) {
                out.push(label);
            }
        }
    }
    if let Some(contained) = tree.get("contained_evm_states").and_then(Value::as_array) {
        for state in contained {
            if let Some(label) = variable_label(state) {
                out.push(label);
            }
        }
    }
    if let Some(sons) = tree.get("sons").and_then(Value::as_array) {
        for son in sons {
            tree_variables(son, out);
        }
    }
}

fn condition_label(condition: &Value) -> String {
    // Rendered guards are not in the serialized form; the pc names the
    // guard uniquely.
    format!(
        "cond@{}",
        condition
            .get("condition_pc")
            .and_then(Value::as_str)
            .unwrap_or("?")
    )
}

/// Build the graph JSON from parsed semantic units.
pub fn build_graph(units: &[Value]) -> Value {
    let mut builder = GraphBuilder::default();

    for unit in units {
        let behavior = &unit["behavior"];
        let behavior_label = format!(
            "{}@{}",
            behavior["behavior_type"].as_str().unwrap_or("?"),
            behavior["behavior_pcs"][0].as_str().unwrap_or("?"),
        );
        let behavior_node = builder.node(NodeKind::Behavior, &behavior_label);

        for function in unit["belong_functions"].as_array().into_iter().flatten() {
            let function_node =
                builder.node(NodeKind::Function, function.as_str().unwrap_or("0x"));
            builder.edge(function_node, behavior_node, "contains");
        }

        if let Some(conditions) = unit["conditions"].as_array() {
            for condition in conditions {
                let condition_node = builder.node(NodeKind::Condition, &condition_label(condition));
                builder.edge(condition_node, behavior_node, "guards");
                let mut read = Vec::new();
                tree_variables(&condition["optree"], &mut read);
                for label in read {
                    let variable_node = builder.node(NodeKind::Variable, &label);
                    builder.edge(condition_node, variable_node, "reads");
                }
            }
        }

        if let Some(label) = variable_label(&behavior["rhs"]) {
            let variable_node = builder.node(NodeKind::Variable, &label);
            builder.edge(behavior_node, variable_node, "writes");
        }
        if let Some(lhs) = behavior["lhs"].as_array() {
            for tree in lhs {
                let mut read = Vec::new();
                tree_variables(tree, &mut read);
                for label in read {
                    let variable_node = builder.node(NodeKind::Variable, &label);
                    builder.edge(behavior_node, variable_node, "reads");
                }
            }
        }
    }

    json!({
        "nodes": builder.nodes,
        "edges": builder.edges,
    })
}

/// Parse an NDJSON unit stream.
pub fn parse_units(raw: &str) -> Vec<Value> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}
