//! Function splitting.
//!
//! Compilers open every external function with a short dispatcher window,
//! a selector comparison closed by a `JUMPI`. Each recognized window maps
//! a selector to the body entry block; a path belongs to the last
//! dispatcher it traversed whose target is the path's next block, and to
//! the `"0x"` fallback otherwise.

use std::path::Path;

use ethereum_types::U256;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::debug;

use sema_lift::cfg::{BasicBlock, Cfg};
use sema_lift::opcodes::Opcode;
use sema_lift::tac::TacPath;

/// A recognized external function.
#[derive(Debug, Clone)]
pub struct Function {
    /// `0x`-prefixed, zero-padded 8-hex-digit selector; bare `"0x"` for
    /// the fallback.
    pub signature: String,
    pub name: String,
}

impl Function {
    pub fn tag(&self) -> String {
        format!("{}_{}", self.signature, self.name)
    }
}

/// Outcome of matching one block against the dispatcher windows.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DispatchMatch {
    None,
    /// `(selector_hex, body_entry_pc)`; selector `"0x"` marks the
    /// calldata-size guard before the fallback body.
    Hit(String, usize),
}

fn op_is(block: &BasicBlock, idx_from_end: usize, opcode: Opcode) -> bool {
    let n = block.ops.len();
    n > idx_from_end && block.ops[n - 1 - idx_from_end].opcode == opcode
}

fn imm_from_end(block: &BasicBlock, idx_from_end: usize) -> Option<U256> {
    let n = block.ops.len();
    block.ops.get(n.checked_sub(1 + idx_from_end)?)?.imm
}

fn push_from_end(block: &BasicBlock, idx_from_end: usize) -> bool {
    let n = block.ops.len();
    n > idx_from_end && block.ops[n - 1 - idx_from_end].opcode.is_push()
}

fn short_push_from_end(block: &BasicBlock, idx_from_end: usize) -> bool {
    let n = block.ops.len();
    n > idx_from_end
        && matches!(
            block.ops[n - 1 - idx_from_end].opcode,
            Opcode::PUSH1 | Opcode::PUSH2 | Opcode::PUSH3 | Opcode::PUSH4
        )
}

fn selector_hex(value: U256) -> String {
    format!("{value:#x}")
}

/// Match the known compiler dispatcher windows against the tail of a
/// block. Windows are tried longest first, mirroring how the specific
/// Vyper shape shadows the generic Solidity ones.
fn check_dispatcher(block: &BasicBlock) -> DispatchMatch {
    let n = block.ops.len();

    // Vyper: PUSH sel; PUSH1 0; MLOAD; EQ; ISZERO; PUSH dest; JUMPI
    if n >= 7
        && push_from_end(block, 6)
        && op_is(block, 5, Opcode::PUSH1)
        && imm_from_end(block, 5) == Some(U256::zero())
        && op_is(block, 4, Opcode::MLOAD)
        && op_is(block, 3, Opcode::EQ)
        && op_is(block, 2, Opcode::ISZERO)
        && push_from_end(block, 1)
        && op_is(block, 0, Opcode::JUMPI)
    {
        let selector = imm_from_end(block, 6).unwrap_or_default();
        if !selector.is_zero() {
            return DispatchMatch::Hit(selector_hex(selector), block.last_op().pc + 1);
        }
        return DispatchMatch::None;
    }

    if n >= 6 {
        // PUSH1 4; CALLDATASIZE; LT; ISZERO; PUSH dest; JUMPI: the
        // short-calldata guard in front of the fallback.
        if op_is(block, 5, Opcode::PUSH1)
            && imm_from_end(block, 5) == Some(U256::from(4))
            && op_is(block, 4, Opcode::CALLDATASIZE)
            && op_is(block, 3, Opcode::LT)
            && op_is(block, 2, Opcode::ISZERO)
            && push_from_end(block, 1)
            && op_is(block, 0, Opcode::JUMPI)
        {
            return DispatchMatch::Hit("0x".to_string(), block.last_op().pc + 1);
        }
        // DUP1; PUSH sel; EQ; ISZERO; PUSH dest; JUMPI
        if op_is(block, 5, Opcode::DUP1)
            && short_push_from_end(block, 4)
            && op_is(block, 3, Opcode::EQ)
            && op_is(block, 2, Opcode::ISZERO)
            && push_from_end(block, 1)
            && op_is(block, 0, Opcode::JUMPI)
        {
            let selector = imm_from_end(block, 4).unwrap_or_default();
            if !selector.is_zero() {
                return DispatchMatch::Hit(selector_hex(selector), block.last_op().pc + 1);
            }
            return DispatchMatch::None;
        }
        // PUSH sel; DUP2; EQ; ISZERO; PUSH dest; JUMPI
        if short_push_from_end(block, 5)
            && op_is(block, 4, Opcode::DUP2)
            && op_is(block, 3, Opcode::EQ)
            && op_is(block, 2, Opcode::ISZERO)
            && push_from_end(block, 1)
            && op_is(block, 0, Opcode::JUMPI)
        {
            let selector = imm_from_end(block, 5).unwrap_or_default();
            if !selector.is_zero() {
                return DispatchMatch::Hit(selector_hex(selector), block.last_op().pc + 1);
            }
            return DispatchMatch::None;
        }
    }

    if n >= 5 {
        // PUSH1 4; CALLDATASIZE; LT; PUSH dest; JUMPI: guard without the
        // ISZERO, jumping straight to the fallback body.
        if op_is(block, 4, Opcode::PUSH1)
            && imm_from_end(block, 4) == Some(U256::from(4))
            && op_is(block, 3, Opcode::CALLDATASIZE)
            && op_is(block, 2, Opcode::LT)
            && push_from_end(block, 1)
            && op_is(block, 0, Opcode::JUMPI)
        {
            let dest = imm_from_end(block, 1).and_then(|v| usize::try_from(v).ok());
            if let Some(dest) = dest {
                return DispatchMatch::Hit("0x".to_string(), dest);
            }
        }
        // DUP1; PUSH sel; EQ; PUSH dest; JUMPI: positive match jumps to
        // the body.
        if op_is(block, 4, Opcode::DUP1)
            && short_push_from_end(block, 3)
            && op_is(block, 2, Opcode::EQ)
            && push_from_end(block, 1)
            && op_is(block, 0, Opcode::JUMPI)
        {
            let selector = imm_from_end(block, 3).unwrap_or_default();
            let dest = imm_from_end(block, 1).and_then(|v| usize::try_from(v).ok());
            if let (false, Some(dest)) = (selector.is_zero(), dest) {
                return DispatchMatch::Hit(selector_hex(selector), dest);
            }
            return DispatchMatch::None;
        }
        // PUSH sel; DUP2; EQ; PUSH dest; JUMPI
        if short_push_from_end(block, 4)
            && op_is(block, 3, Opcode::DUP2)
            && op_is(block, 2, Opcode::EQ)
            && push_from_end(block, 1)
            && op_is(block, 0, Opcode::JUMPI)
        {
            let selector = imm_from_end(block, 4).unwrap_or_default();
            let dest = imm_from_end(block, 1).and_then(|v| usize::try_from(v).ok());
            if let (false, Some(dest)) = (selector.is_zero(), dest) {
                return DispatchMatch::Hit(selector_hex(selector), dest);
            }
            return DispatchMatch::None;
        }
    }

    // CALLDATASIZE; ISZERO; PUSH dest; JUMPI: the empty-calldata receive
    // guard.
    if n >= 4
        && op_is(block, 3, Opcode::CALLDATASIZE)
        && op_is(block, 2, Opcode::ISZERO)
        && push_from_end(block, 1)
        && op_is(block, 0, Opcode::JUMPI)
    {
        let dest = imm_from_end(block, 1).and_then(|v| usize::try_from(v).ok());
        if let Some(dest) = dest {
            return DispatchMatch::Hit("0x".to_string(), dest);
        }
    }

    DispatchMatch::None
}

/// `0x`-prefixed selector padded to 8 hex digits.
fn pad_signature(selector: &str) -> String {
    if selector == "0x" {
        return selector.to_string();
    }
    let digits = selector.trim_start_matches("0x");
    format!("0x{:0>8}", digits)
}

/// Attribute each lifted path to its function: the latest recognized
/// dispatcher whose body entry is the path's next block. Sets
/// `path.function` and `path.entry_index`, and returns the function list.
pub fn analyze_functions(
    cfg: &Cfg,
    paths: &mut [TacPath],
    signature_names: &FxHashMap<String, String>,
) -> Vec<Function> {
    let mut functions: Vec<Function> = Vec::new();
    let mut by_signature: FxHashMap<String, usize> = FxHashMap::default();
    let mut window_cache: FxHashMap<usize, DispatchMatch> = FxHashMap::default();

    for path in paths.iter_mut() {
        if path.blocks.is_empty() {
            continue;
        }
        let mut current: Option<(String, usize)> = None;
        let mut current_idx = -1i64;
        for (idx, tac_block) in path.blocks.iter().enumerate() {
            let block = cfg.block(tac_block.evm_block);
            let matched = window_cache
                .entry(block.ident())
                .or_insert_with(|| check_dispatcher(block))
                .clone();
            if let DispatchMatch::Hit(selector, body_entry) = matched {
                current = Some((selector, body_entry));
                current_idx = idx as i64;
            }
        }
        let entry_index = (current_idx + 1) as usize;
        let selector = match current {
            Some((selector, body_entry)) => {
                let next_entry = path.blocks.get(entry_index).map(|b| b.entry);
                if next_entry == Some(body_entry) {
                    selector
                } else {
                    "0x".to_string()
                }
            }
            None => "0x".to_string(),
        };
        let signature = pad_signature(&selector);
        let name = signature_names
            .get(&signature)
            .cloned()
            .unwrap_or_else(|| signature.clone());

        let function_idx = *by_signature.entry(signature.clone()).or_insert_with(|| {
            functions.push(Function { signature, name });
            functions.len() - 1
        });
        path.function = Some(function_idx);
        path.entry_index = entry_index;
    }

    debug!(functions = functions.len(), "function attribution finished");
    functions
}

/// Load `unique_signatures.json` (`selector → ["name(args)", …]`) from the
/// working directory, when present.
pub fn load_signature_names(dir: &Path) -> FxHashMap<String, String> {
    let mut names = FxHashMap::default();
    let raw = match std::fs::read_to_string(dir.join("unique_signatures.json")) {
        Ok(raw) => raw,
        Err(_) => return names,
    };
    let Ok(parsed) = serde_json::from_str::<FxHashMap<String, Value>>(&raw) else {
        return names;
    };
    for (selector, entry) in parsed {
        let full = match &entry {
            Value::Array(list) => list.first().and_then(|v| v.as_str()),
            Value::String(s) => Some(s.as_str()),
            _ => None,
        };
        if let Some(full) = full {
            let base = full.split('(').next().unwrap_or(full);
            names.insert(pad_signature(&selector), base.to_string());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use sema_lift::disasm::disassemble;

    fn block_of(hex_str: &str) -> BasicBlock {
        let cfg = Cfg::from_ops(disassemble(hex_str));
        cfg.blocks.into_iter().next().unwrap()
    }

    #[test]
    fn solidity_negative_dispatch_window() {
        // DUP1; PUSH4 sel; EQ; ISZERO; PUSH1 dest; JUMPI
        let block = block_of("8063a9059cbb1415601057");
        match check_dispatcher(&block) {
            DispatchMatch::Hit(selector, body) => {
                assert_eq!(selector, "0xa9059cbb");
                // ISZERO form: the body is the fallthrough.
                assert_eq!(body, block.last_op().pc + 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn solidity_positive_dispatch_window() {
        // DUP1; PUSH4 sel; EQ; PUSH1 0x2a; JUMPI
        let block = block_of("8063a9059cbb14602a57");
        assert_eq!(
            check_dispatcher(&block),
            DispatchMatch::Hit("0xa9059cbb".to_string(), 0x2a)
        );
    }

    #[test]
    fn calldata_guard_maps_to_fallback() {
        // PUSH1 4; CALLDATASIZE; LT; PUSH1 0x30; JUMPI
        let block = block_of("60043610603057");
        assert_eq!(
            check_dispatcher(&block),
            DispatchMatch::Hit("0x".to_string(), 0x30)
        );
    }

    #[test]
    fn vyper_window() {
        // PUSH4 sel; PUSH1 0; MLOAD; EQ; ISZERO; PUSH2 dest; JUMPI
        let block = block_of("63a9059cbb60005114156101bc57");
        match check_dispatcher(&block) {
            DispatchMatch::Hit(selector, _) => assert_eq!(selector, "0xa9059cbb"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn signatures_are_zero_padded() {
        assert_eq!(pad_signature("0xa9059cbb"), "0xa9059cbb");
        assert_eq!(pad_signature("0x1249c58b"), "0x1249c58b");
        assert_eq!(pad_signature("0x53a04"), "0x00053a04");
        assert_eq!(pad_signature("0x"), "0x");
    }

    #[test]
    fn non_dispatcher_blocks_do_not_match() {
        let block = block_of("6001600201600055");
        assert_eq!(check_dispatcher(&block), DispatchMatch::None);
    }
}
