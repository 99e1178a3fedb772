//! Bytecode disassembly.
//!
//! Decodes a runtime-bytecode hex stream into an address-ordered operation
//! list, stripping the compiler metadata trailer first so swarm/IPFS hashes
//! are not disassembled as code.

use bytes::Bytes;
use ethereum_types::U256;

use crate::opcodes::Opcode;

/// A single decoded EVM operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Program counter of the operation.
    pub pc: usize,
    pub opcode: Opcode,
    /// Push immediate, if any.
    pub imm: Option<U256>,
    /// Stack operand values witnessed in a concrete trace. Empty for
    /// statically disassembled code.
    pub trace_values: Vec<U256>,
}

impl Operation {
    pub fn new(pc: usize, opcode: Opcode) -> Self {
        Operation {
            pc,
            opcode,
            imm: None,
            trace_values: Vec::new(),
        }
    }

    pub fn with_imm(pc: usize, opcode: Opcode, imm: U256) -> Self {
        Operation {
            pc,
            opcode,
            imm: Some(imm),
            trace_values: Vec::new(),
        }
    }
}

/// Source language guess for the contract, from its calldata-handling
/// prologue. Vyper swaps the `SHA3(key, slot)` operand order and changes a
/// few post-processing rules downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Language {
    #[default]
    Solidity,
    Vyper,
}

/// Known metadata trailer shapes, oldest solc first. Each entry is a list of
/// segments: literal marker bytes alternating with runs of arbitrary hex of
/// a fixed nibble count.
#[derive(Debug, Clone, Copy)]
enum Seg {
    Lit(&'static str),
    Hex(usize),
}

const TRAILERS: &[&[Seg]] = &[
    // solc 0.4.17..0.5.8: bzzr0 swarm hash
    &[Seg::Lit("a165627a7a72305820"), Seg::Hex(64), Seg::Lit("0029")],
    // same, experimental ABIEncoderV2
    &[
        Seg::Lit("a265627a7a72305820"),
        Seg::Hex(64),
        Seg::Lit("6c6578706572696d656e74616cf50037"),
    ],
    // solc 0.5.9..0.5.11: bzzr0 + solc version
    &[
        Seg::Lit("a265627a7a72305820"),
        Seg::Hex(64),
        Seg::Lit("64736f6c6343"),
        Seg::Hex(6),
        Seg::Lit("0032"),
    ],
    // same, experimental
    &[
        Seg::Lit("a365627a7a72305820"),
        Seg::Hex(64),
        Seg::Lit("6c6578706572696d656e74616cf564736f6c6343"),
        Seg::Hex(6),
        Seg::Lit("0040"),
    ],
    // solc 0.5.12..0.5.15: bzzr1 + solc version
    &[
        Seg::Lit("a265627a7a72315820"),
        Seg::Hex(64),
        Seg::Lit("64736f6c6343"),
        Seg::Hex(6),
        Seg::Lit("0032"),
    ],
    // same, experimental
    &[
        Seg::Lit("a365627a7a72315820"),
        Seg::Hex(64),
        Seg::Lit("6c6578706572696d656e74616cf564736f6c6343"),
        Seg::Hex(6),
        Seg::Lit("0040"),
    ],
    // solc 0.6.0..0.6.1: ipfs + solc version
    &[
        Seg::Lit("a264697066735822"),
        Seg::Hex(68),
        Seg::Lit("64736f6c6343"),
        Seg::Hex(6),
        Seg::Lit("0032"),
    ],
    // solc >= 0.6.2
    &[
        Seg::Lit("a264697066735822"),
        Seg::Hex(68),
        Seg::Lit("64736f6c6343"),
        Seg::Hex(6),
        Seg::Lit("0033"),
    ],
];

fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Try to match one trailer shape starting at `pos`; returns the length of
/// the matched span.
fn match_trailer(hex_str: &str, pos: usize, segs: &[Seg]) -> Option<usize> {
    let mut cursor = pos;
    for seg in segs {
        match seg {
            Seg::Lit(lit) => {
                if !hex_str[cursor..].starts_with(lit) {
                    return None;
                }
                cursor += lit.len();
            }
            Seg::Hex(n) => {
                let end = cursor.checked_add(*n)?;
                if end > hex_str.len() || !is_hex(&hex_str[cursor..end]) {
                    return None;
                }
                cursor = end;
            }
        }
    }
    Some(cursor - pos)
}

/// Strip a recognized compiler metadata trailer from a hex string.
///
/// Returns the code before the trailer. Anything after the matched trailer
/// (constructor-appended data, a second concatenated contract) is dropped
/// along with it, matching how the trailer terminates the code body.
pub fn strip_metadata(hex_str: &str) -> &str {
    for segs in TRAILERS {
        let Seg::Lit(marker) = segs[0] else {
            continue;
        };
        let mut search_from = 0;
        while let Some(found) = hex_str[search_from..].find(marker) {
            let pos = search_from + found;
            if match_trailer(hex_str, pos, segs).is_some() {
                return &hex_str[..pos];
            }
            search_from = pos + 1;
        }
    }
    hex_str
}

/// Normalize raw file contents into a plain even-length hex string:
/// trims whitespace, drops a `0x` prefix, pads an odd length with one `0`
/// nibble.
pub fn normalize_hex(raw: &str) -> String {
    let mut s = raw.trim().trim_start_matches("0x").to_string();
    if s.len() % 2 != 0 {
        s.push('0');
    }
    s
}

/// Disassemble a hex bytecode string into operations.
///
/// `PUSH_n` consumes the next `n` bytes as its immediate; a truncated
/// immediate at the end of the stream is zero-padded on the right, the way
/// the EVM itself reads past the end of code.
pub fn disassemble(hex_str: &str) -> Vec<Operation> {
    let normalized = normalize_hex(hex_str);
    let stripped = strip_metadata(&normalized);
    let code = Bytes::from(hex::decode(stripped).unwrap_or_else(|_| {
        // Non-hex garbage: decode the longest valid even prefix.
        let valid = stripped
            .find(|c: char| !c.is_ascii_hexdigit())
            .unwrap_or(stripped.len());
        hex::decode(&stripped[..valid & !1]).unwrap_or_default()
    }));
    disassemble_bytes(&code)
}

/// Disassemble raw bytes into operations.
pub fn disassemble_bytes(code: &[u8]) -> Vec<Operation> {
    let mut ops = Vec::new();
    let mut pc = 0usize;
    while pc < code.len() {
        let opcode = Opcode::from_byte(code[pc]);
        let width = opcode.push_width();
        if opcode.is_push() {
            let start = pc + 1;
            let end = (start + width).min(code.len());
            let mut imm_bytes = [0u8; 32];
            let available = end - start;
            imm_bytes[32 - width..32 - width + available].copy_from_slice(&code[start..end]);
            ops.push(Operation::with_imm(
                pc,
                opcode,
                U256::from_big_endian(&imm_bytes),
            ));
        } else {
            ops.push(Operation::new(pc, opcode));
        }
        pc += 1 + width;
    }
    ops
}

/// Guess the source language from the dispatcher prologue: Vyper loads the
/// selector with `PUSH1 0; CALLDATALOAD; PUSH_n; MSTORE`, Solidity never
/// does.
pub fn detect_language(ops: &[Operation]) -> Language {
    for window in ops.windows(4) {
        let [a, b, c, d] = window else { continue };
        if a.opcode == Opcode::PUSH1
            && a.imm == Some(U256::zero())
            && b.opcode == Opcode::CALLDATALOAD
            && c.opcode.is_push()
            && d.opcode == Opcode::MSTORE
        {
            return Language::Vyper;
        }
    }
    Language::Solidity
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn disassembles_raw_bytes() {
        // PUSH1 0x60; PUSH1 0x40; MSTORE; STOP
        let ops = disassemble_bytes(&hex!("604060405200"));
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[2].opcode, Opcode::MSTORE);
        assert_eq!(ops[3].opcode, Opcode::STOP);
    }

    #[test]
    fn disassembles_push_immediates() {
        // PUSH1 0x60 PUSH1 0x40 MSTORE
        let ops = disassemble("6060604052");
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].opcode, Opcode::PUSH1);
        assert_eq!(ops[0].imm, Some(U256::from(0x60)));
        assert_eq!(ops[1].pc, 2);
        assert_eq!(ops[2].opcode, Opcode::MSTORE);
        assert_eq!(ops[2].pc, 4);
    }

    #[test]
    fn pads_truncated_push() {
        // PUSH4 with only two immediate bytes left
        let ops = disassemble("63abcd");
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].imm, Some(U256::from(0xabcd0000u64)));
    }

    #[test]
    fn odd_length_is_right_padded() {
        let ops = disassemble("0x601");
        assert_eq!(ops[0].imm, Some(U256::from(0x10)));
    }

    #[test]
    fn strips_bzzr0_trailer() {
        let code = "6001600255";
        let trailer = format!("a165627a7a72305820{}0029", "ab".repeat(32));
        let ops = disassemble(&format!("{code}{trailer}"));
        assert_eq!(ops.len(), 3);
        assert_eq!(ops.last().unwrap().opcode, Opcode::SSTORE);
    }

    #[test]
    fn strips_ipfs_trailer() {
        let code = "600160025500";
        let trailer = format!("a264697066735822{}64736f6c63430008110033", "cd".repeat(34));
        let ops = disassemble(&format!("{code}{trailer}"));
        assert_eq!(ops.last().unwrap().opcode, Opcode::STOP);
    }

    #[test]
    fn keeps_unrecognized_tail() {
        let ops = disassemble("600160025560");
        // trailing truncated PUSH1 still decodes
        assert_eq!(ops.last().unwrap().opcode, Opcode::PUSH1);
    }

    #[test]
    fn detects_vyper_prologue() {
        // PUSH1 0; CALLDATALOAD; PUSH29 ..; SWAP1; DIV; PUSH2 ..; MSTORE: not a hit
        // PUSH1 0; CALLDATALOAD; PUSH1 0; MSTORE: hit
        let hit = disassemble("600035600052");
        assert_eq!(detect_language(&hit), Language::Vyper);
        let miss = disassemble("6080604052600436106049576000357c01");
        assert_eq!(detect_language(&miss), Language::Solidity);
    }
}
