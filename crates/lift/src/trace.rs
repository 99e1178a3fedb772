//! Concrete execution-trace ingestion.
//!
//! A trace is a JSON list of step records `{pc, op, values}` as emitted by a
//! struct-logger. Steps below the outermost frame are filtered out by
//! tracking a virtual call depth, and the surviving steps become the same
//! operation stream the static disassembler produces, so the rest of the
//! pipeline is oblivious to the source.

use std::str::FromStr;

use ethereum_types::U256;
use serde::Deserialize;
use tracing::debug;

use crate::disasm::Operation;
use crate::opcodes::Opcode;

/// One step of a raw trace.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceStep {
    /// Program counter, hex-encoded.
    pub pc: String,
    /// Opcode mnemonic.
    pub op: String,
    /// Stack operand values, hex-encoded, top first.
    #[serde(default)]
    pub values: Vec<String>,
}

fn parse_hex_u256(raw: &str) -> Option<U256> {
    let trimmed = raw.trim().trim_start_matches("0x");
    if trimmed.is_empty() {
        return Some(U256::zero());
    }
    U256::from_str_radix(trimmed, 16).ok()
}

fn parse_hex_usize(raw: &str) -> Option<usize> {
    parse_hex_u256(raw).and_then(|v| usize::try_from(v).ok())
}

/// Keep only the steps of the outermost call frame.
///
/// The virtual depth starts at 1, bumps when a call/create op hands control
/// away (detected by the next step restarting at pc 0) and drops when a
/// frame sees its terminating op.
pub fn keep_depth_one(steps: &[TraceStep]) -> Vec<&TraceStep> {
    let mut kept = Vec::new();
    let mut depth: i64 = 0;
    let mut may_enter = true;

    for step in steps {
        let pc = parse_hex_usize(&step.pc).unwrap_or(usize::MAX);
        if may_enter && pc == 0 {
            depth += 1;
        }
        if depth == 1 {
            kept.push(step);
        }
        match step.op.as_str() {
            "CALL" | "CALLCODE" | "DELEGATECALL" | "STATICCALL" | "CREATE" | "CREATE2" => {
                may_enter = true;
            }
            other => {
                if matches!(other, "RETURN" | "STOP" | "REVERT" | "INVALID" | "SELFDESTRUCT") {
                    depth -= 1;
                }
                may_enter = false;
            }
        }
    }
    kept
}

/// Convert filtered steps into an operation stream.
pub fn operations_from_trace(steps: &[TraceStep]) -> Vec<Operation> {
    let depth_one = keep_depth_one(steps);
    let mut ops = Vec::with_capacity(depth_one.len());
    for step in depth_one {
        let Some(pc) = parse_hex_usize(&step.pc) else {
            debug!(pc = %step.pc, "trace step with unparseable pc skipped");
            continue;
        };
        let opcode = Opcode::from_str(&step.op).unwrap_or(Opcode::MISSING);
        let values: Vec<U256> = step
            .values
            .iter()
            .filter_map(|v| parse_hex_u256(v))
            .collect();
        let imm = if opcode == Opcode::PUSH0 {
            Some(U256::zero())
        } else if opcode.is_push() {
            values.first().copied()
        } else {
            None
        };
        let mut op = Operation::new(pc, opcode);
        op.imm = imm;
        op.trace_values = values;
        ops.push(op);
    }
    ops
}

/// Parse a raw trace JSON document.
pub fn parse_trace(raw: &str) -> Result<Vec<TraceStep>, serde_json::Error> {
    serde_json::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(pc: usize, op: &str, values: &[&str]) -> TraceStep {
        TraceStep {
            pc: format!("{pc:#x}"),
            op: op.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn filters_inner_frames() {
        let steps = vec![
            step(0, "PUSH1", &["0x60"]),
            step(2, "CALL", &[]),
            // inner frame
            step(0, "PUSH1", &["0x1"]),
            step(2, "STOP", &[]),
            // back outside
            step(3, "SSTORE", &["0x0", "0x1"]),
            step(4, "STOP", &[]),
        ];
        let ops = operations_from_trace(&steps);
        let pcs: Vec<usize> = ops.iter().map(|op| op.pc).collect();
        assert_eq!(pcs, vec![0, 2, 3, 4]);
        assert_eq!(ops[2].opcode, Opcode::SSTORE);
        assert_eq!(ops[2].trace_values.len(), 2);
    }

    #[test]
    fn push_value_comes_from_trace() {
        let steps = vec![step(0, "PUSH2", &["0x1234"]), step(3, "STOP", &[])];
        let ops = operations_from_trace(&steps);
        assert_eq!(ops[0].imm, Some(U256::from(0x1234)));
    }

    #[test]
    fn unknown_mnemonic_becomes_missing() {
        let steps = vec![step(0, "FROBNICATE", &[])];
        let ops = operations_from_trace(&steps);
        assert_eq!(ops[0].opcode, Opcode::MISSING);
    }

    #[test]
    fn parses_json_document() {
        let raw = r#"[{"pc":"0x0","op":"PUSH1","values":["0x80"]},{"pc":"0x2","op":"STOP","values":[]}]"#;
        let steps = parse_trace(raw).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].op, "PUSH1");
    }
}
