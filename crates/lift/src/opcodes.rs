//! EVM opcode catalogue.
//!
//! One immutable descriptor per opcode byte: stack arity, push-immediate
//! width, control-flow class and the classification predicates the rest of
//! the pipeline keys on. Unknown bytes decode to [`Opcode::MISSING`] so a
//! partially-damaged byte stream still disassembles positionally.

use std::fmt;

use strum::EnumString;

/// Control-flow class of an opcode, as seen by the block builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowClass {
    /// Execution continues at the next instruction.
    Sequential,
    /// Unconditional `JUMP`.
    Jump,
    /// `JUMPI`: jump or fall through.
    CondJump,
    /// `STOP`, `RETURN`, `SELFDESTRUCT`: the path completed.
    HaltNormal,
    /// `REVERT`, `INVALID`, `MISSING`: the path aborted.
    HaltAbnormal,
}

/// An EVM operation code, plus the pseudo-ops the lifted stream uses.
///
/// The discriminants of the real opcodes are their byte values. `MISSING`,
/// `CONST`, `NOP` and `LOG` never appear in bytecode: `MISSING` stands in
/// for undecodable bytes, and the other three are produced by the
/// destackifier (`CONST` assignments, empty blocks, canonicalized `LOG_n`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumString)]
#[allow(clippy::upper_case_acronyms)]
pub enum Opcode {
    // Stop and arithmetic
    STOP = 0x00,
    ADD = 0x01,
    MUL = 0x02,
    SUB = 0x03,
    DIV = 0x04,
    SDIV = 0x05,
    MOD = 0x06,
    SMOD = 0x07,
    ADDMOD = 0x08,
    MULMOD = 0x09,
    EXP = 0x0A,
    SIGNEXTEND = 0x0B,

    // Comparison and bitwise logic
    LT = 0x10,
    GT = 0x11,
    SLT = 0x12,
    SGT = 0x13,
    EQ = 0x14,
    ISZERO = 0x15,
    AND = 0x16,
    OR = 0x17,
    XOR = 0x18,
    NOT = 0x19,
    BYTE = 0x1A,
    SHL = 0x1B,
    SHR = 0x1C,
    SAR = 0x1D,

    #[strum(serialize = "SHA3", serialize = "KECCAK256")]
    SHA3 = 0x20,

    // Environmental information
    ADDRESS = 0x30,
    BALANCE = 0x31,
    ORIGIN = 0x32,
    CALLER = 0x33,
    CALLVALUE = 0x34,
    CALLDATALOAD = 0x35,
    CALLDATASIZE = 0x36,
    CALLDATACOPY = 0x37,
    CODESIZE = 0x38,
    CODECOPY = 0x39,
    GASPRICE = 0x3A,
    EXTCODESIZE = 0x3B,
    EXTCODECOPY = 0x3C,
    RETURNDATASIZE = 0x3D,
    RETURNDATACOPY = 0x3E,
    EXTCODEHASH = 0x3F,

    // Block information
    BLOCKHASH = 0x40,
    COINBASE = 0x41,
    TIMESTAMP = 0x42,
    NUMBER = 0x43,
    #[strum(serialize = "PREVRANDAO", serialize = "DIFFICULTY")]
    PREVRANDAO = 0x44,
    GASLIMIT = 0x45,
    CHAINID = 0x46,
    SELFBALANCE = 0x47,
    BASEFEE = 0x48,
    BLOBHASH = 0x49,
    BLOBBASEFEE = 0x4A,

    // Stack, memory, storage and flow
    POP = 0x50,
    MLOAD = 0x51,
    MSTORE = 0x52,
    MSTORE8 = 0x53,
    SLOAD = 0x54,
    SSTORE = 0x55,
    JUMP = 0x56,
    JUMPI = 0x57,
    PC = 0x58,
    MSIZE = 0x59,
    GAS = 0x5A,
    JUMPDEST = 0x5B,
    TLOAD = 0x5C,
    TSTORE = 0x5D,
    MCOPY = 0x5E,

    // Push operations
    PUSH0 = 0x5F,
    PUSH1 = 0x60,
    PUSH2 = 0x61,
    PUSH3 = 0x62,
    PUSH4 = 0x63,
    PUSH5 = 0x64,
    PUSH6 = 0x65,
    PUSH7 = 0x66,
    PUSH8 = 0x67,
    PUSH9 = 0x68,
    PUSH10 = 0x69,
    PUSH11 = 0x6A,
    PUSH12 = 0x6B,
    PUSH13 = 0x6C,
    PUSH14 = 0x6D,
    PUSH15 = 0x6E,
    PUSH16 = 0x6F,
    PUSH17 = 0x70,
    PUSH18 = 0x71,
    PUSH19 = 0x72,
    PUSH20 = 0x73,
    PUSH21 = 0x74,
    PUSH22 = 0x75,
    PUSH23 = 0x76,
    PUSH24 = 0x77,
    PUSH25 = 0x78,
    PUSH26 = 0x79,
    PUSH27 = 0x7A,
    PUSH28 = 0x7B,
    PUSH29 = 0x7C,
    PUSH30 = 0x7D,
    PUSH31 = 0x7E,
    PUSH32 = 0x7F,

    // Duplication operations
    DUP1 = 0x80,
    DUP2 = 0x81,
    DUP3 = 0x82,
    DUP4 = 0x83,
    DUP5 = 0x84,
    DUP6 = 0x85,
    DUP7 = 0x86,
    DUP8 = 0x87,
    DUP9 = 0x88,
    DUP10 = 0x89,
    DUP11 = 0x8A,
    DUP12 = 0x8B,
    DUP13 = 0x8C,
    DUP14 = 0x8D,
    DUP15 = 0x8E,
    DUP16 = 0x8F,

    // Swap operations
    SWAP1 = 0x90,
    SWAP2 = 0x91,
    SWAP3 = 0x92,
    SWAP4 = 0x93,
    SWAP5 = 0x94,
    SWAP6 = 0x95,
    SWAP7 = 0x96,
    SWAP8 = 0x97,
    SWAP9 = 0x98,
    SWAP10 = 0x99,
    SWAP11 = 0x9A,
    SWAP12 = 0x9B,
    SWAP13 = 0x9C,
    SWAP14 = 0x9D,
    SWAP15 = 0x9E,
    SWAP16 = 0x9F,

    // Logging operations
    LOG0 = 0xA0,
    LOG1 = 0xA1,
    LOG2 = 0xA2,
    LOG3 = 0xA3,
    LOG4 = 0xA4,

    // System operations
    CREATE = 0xF0,
    CALL = 0xF1,
    CALLCODE = 0xF2,
    RETURN = 0xF3,
    DELEGATECALL = 0xF4,
    CREATE2 = 0xF5,
    STATICCALL = 0xFA,
    REVERT = 0xFD,
    INVALID = 0xFE,
    SELFDESTRUCT = 0xFF,

    // Pseudo-ops (never decoded from bytecode)
    /// An undecodable byte.
    MISSING = 0x100,
    /// A constant assignment in the lifted stream.
    CONST = 0x101,
    /// Placeholder for a block with no lifted operations.
    NOP = 0x102,
    /// Canonical form of `LOG0`..`LOG4`.
    LOG = 0x103,
}

impl Opcode {
    /// Decode a bytecode byte. Bytes with no assigned opcode become
    /// [`Opcode::MISSING`].
    pub fn from_byte(byte: u8) -> Opcode {
        use Opcode::*;
        match byte {
            0x00 => STOP,
            0x01 => ADD,
            0x02 => MUL,
            0x03 => SUB,
            0x04 => DIV,
            0x05 => SDIV,
            0x06 => MOD,
            0x07 => SMOD,
            0x08 => ADDMOD,
            0x09 => MULMOD,
            0x0A => EXP,
            0x0B => SIGNEXTEND,
            0x10 => LT,
            0x11 => GT,
            0x12 => SLT,
            0x13 => SGT,
            0x14 => EQ,
            0x15 => ISZERO,
            0x16 => AND,
            0x17 => OR,
            0x18 => XOR,
            0x19 => NOT,
            0x1A => BYTE,
            0x1B => SHL,
            0x1C => SHR,
            0x1D => SAR,
            0x20 => SHA3,
            0x30 => ADDRESS,
            0x31 => BALANCE,
            0x32 => ORIGIN,
            0x33 => CALLER,
            0x34 => CALLVALUE,
            0x35 => CALLDATALOAD,
            0x36 => CALLDATASIZE,
            0x37 => CALLDATACOPY,
            0x38 => CODESIZE,
            0x39 => CODECOPY,
            0x3A => GASPRICE,
            0x3B => EXTCODESIZE,
            0x3C => EXTCODECOPY,
            0x3D => RETURNDATASIZE,
            0x3E => RETURNDATACOPY,
            0x3F => EXTCODEHASH,
            0x40 => BLOCKHASH,
            0x41 => COINBASE,
            0x42 => TIMESTAMP,
            0x43 => NUMBER,
            0x44 => PREVRANDAO,
            0x45 => GASLIMIT,
            0x46 => CHAINID,
            0x47 => SELFBALANCE,
            0x48 => BASEFEE,
            0x49 => BLOBHASH,
            0x4A => BLOBBASEFEE,
            0x50 => POP,
            0x51 => MLOAD,
            0x52 => MSTORE,
            0x53 => MSTORE8,
            0x54 => SLOAD,
            0x55 => SSTORE,
            0x56 => JUMP,
            0x57 => JUMPI,
            0x58 => PC,
            0x59 => MSIZE,
            0x5A => GAS,
            0x5B => JUMPDEST,
            0x5C => TLOAD,
            0x5D => TSTORE,
            0x5E => MCOPY,
            0x5F => PUSH0,
            b @ 0x60..=0x7F => PUSH_TABLE[usize::from(b - 0x60)],
            b @ 0x80..=0x8F => DUP_TABLE[usize::from(b - 0x80)],
            b @ 0x90..=0x9F => SWAP_TABLE[usize::from(b - 0x90)],
            0xA0 => LOG0,
            0xA1 => LOG1,
            0xA2 => LOG2,
            0xA3 => LOG3,
            0xA4 => LOG4,
            0xF0 => CREATE,
            0xF1 => CALL,
            0xF2 => CALLCODE,
            0xF3 => RETURN,
            0xF4 => DELEGATECALL,
            0xF5 => CREATE2,
            0xFA => STATICCALL,
            0xFD => REVERT,
            0xFE => INVALID,
            0xFF => SELFDESTRUCT,
            _ => MISSING,
        }
    }

    /// Number of operands popped from the stack.
    pub fn pops(&self) -> usize {
        use Opcode::*;
        match self {
            ADD | MUL | SUB | DIV | SDIV | MOD | SMOD | EXP | SIGNEXTEND | LT | GT | SLT | SGT
            | EQ | AND | OR | XOR | BYTE | SHL | SHR | SAR | SHA3 | MSTORE | MSTORE8 | SSTORE
            | JUMPI | RETURN | REVERT | TSTORE => 2,
            ADDMOD | MULMOD | CALLDATACOPY | CODECOPY | RETURNDATACOPY | CREATE | MCOPY => 3,
            ISZERO | NOT | BALANCE | CALLDATALOAD | EXTCODESIZE | EXTCODEHASH | BLOCKHASH
            | BLOBHASH | POP | MLOAD | SLOAD | JUMP | TLOAD | SELFDESTRUCT => 1,
            EXTCODECOPY | CREATE2 => 4,
            DELEGATECALL | STATICCALL => 6,
            CALL | CALLCODE => 7,
            LOG0 => 2,
            LOG1 => 3,
            LOG2 => 4,
            LOG3 => 5,
            LOG4 => 6,
            op if op.is_dup() => op.dup_depth(),
            // SWAP_n touches the top n+1 slots without a net change
            op if op.is_swap() => op.swap_depth(),
            _ => 0,
        }
    }

    /// Number of results pushed onto the stack.
    pub fn pushes(&self) -> usize {
        use Opcode::*;
        match self {
            STOP | CALLDATACOPY | CODECOPY | EXTCODECOPY | RETURNDATACOPY | POP | MSTORE
            | MSTORE8 | SSTORE | JUMP | JUMPI | JUMPDEST | TSTORE | MCOPY | LOG0 | LOG1 | LOG2
            | LOG3 | LOG4 | RETURN | REVERT | INVALID | SELFDESTRUCT | MISSING | NOP | LOG => 0,
            op if op.is_dup() => op.dup_depth() + 1,
            op if op.is_swap() => op.swap_depth(),
            _ => 1,
        }
    }

    /// Width in bytes of the push immediate (0 for everything but
    /// `PUSH1`..`PUSH32`).
    pub fn push_width(&self) -> usize {
        let code = *self as usize;
        if (0x60..=0x7F).contains(&code) {
            code - 0x5F
        } else {
            0
        }
    }

    /// Control-flow class.
    pub fn flow(&self) -> FlowClass {
        use Opcode::*;
        match self {
            JUMP => FlowClass::Jump,
            JUMPI => FlowClass::CondJump,
            STOP | RETURN | SELFDESTRUCT => FlowClass::HaltNormal,
            REVERT | INVALID | MISSING => FlowClass::HaltAbnormal,
            _ => FlowClass::Sequential,
        }
    }

    /// True iff the op closes a basic block.
    pub fn alters_flow(&self) -> bool {
        self.flow() != FlowClass::Sequential
    }

    /// True iff execution cannot continue past the op.
    pub fn halts(&self) -> bool {
        matches!(self.flow(), FlowClass::HaltNormal | FlowClass::HaltAbnormal)
    }

    /// True iff the op aborts the transaction (`REVERT`/`INVALID`/undecoded).
    pub fn halts_abnormally(&self) -> bool {
        self.flow() == FlowClass::HaltAbnormal
    }

    pub fn is_push(&self) -> bool {
        (Opcode::PUSH0..=Opcode::PUSH32).contains(self)
    }

    pub fn is_dup(&self) -> bool {
        (Opcode::DUP1..=Opcode::DUP16).contains(self)
    }

    pub fn is_swap(&self) -> bool {
        (Opcode::SWAP1..=Opcode::SWAP16).contains(self)
    }

    pub fn is_log(&self) -> bool {
        (Opcode::LOG0..=Opcode::LOG4).contains(self)
    }

    /// `DUP_n` → n.
    pub fn dup_depth(&self) -> usize {
        *self as usize - Opcode::DUP1 as usize + 1
    }

    /// `SWAP_n` → n.
    pub fn swap_depth(&self) -> usize {
        *self as usize - Opcode::SWAP1 as usize + 1
    }

    /// True iff the op is a value computation the destackifier may
    /// constant-fold with 256-bit modular semantics.
    pub fn is_arithmetic(&self) -> bool {
        use Opcode::*;
        matches!(
            self,
            ADD | MUL
                | SUB
                | DIV
                | SDIV
                | MOD
                | SMOD
                | ADDMOD
                | MULMOD
                | EXP
                | SIGNEXTEND
                | LT
                | GT
                | SLT
                | SGT
                | EQ
                | ISZERO
                | AND
                | OR
                | XOR
                | NOT
                | BYTE
                | SHL
                | SHR
                | SAR
        )
    }

    /// True iff the op produces an externally-observable effect.
    pub fn affects_state(&self) -> bool {
        use Opcode::*;
        matches!(
            self,
            SSTORE | CREATE | CREATE2 | CALL | CALLCODE | DELEGATECALL | STATICCALL | SELFDESTRUCT
        )
    }

    /// True iff the op is an external call.
    pub fn is_call(&self) -> bool {
        use Opcode::*;
        matches!(self, CALL | CALLCODE | DELEGATECALL | STATICCALL)
    }

    /// True iff the op reads a transaction or block property (no operands,
    /// one result, value fixed for the whole transaction).
    pub fn is_property(&self) -> bool {
        use Opcode::*;
        matches!(
            self,
            ADDRESS
                | ORIGIN
                | CALLER
                | CALLVALUE
                | CALLDATASIZE
                | CODESIZE
                | GASPRICE
                | RETURNDATASIZE
                | COINBASE
                | TIMESTAMP
                | NUMBER
                | PREVRANDAO
                | GASLIMIT
                | CHAINID
                | SELFBALANCE
                | BASEFEE
                | BLOBBASEFEE
                | MSIZE
                | GAS
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

// Range-indexed sub-tables keep `from_byte` free of 96 near-identical arms.
const PUSH_TABLE: [Opcode; 32] = [
    Opcode::PUSH1,
    Opcode::PUSH2,
    Opcode::PUSH3,
    Opcode::PUSH4,
    Opcode::PUSH5,
    Opcode::PUSH6,
    Opcode::PUSH7,
    Opcode::PUSH8,
    Opcode::PUSH9,
    Opcode::PUSH10,
    Opcode::PUSH11,
    Opcode::PUSH12,
    Opcode::PUSH13,
    Opcode::PUSH14,
    Opcode::PUSH15,
    Opcode::PUSH16,
    Opcode::PUSH17,
    Opcode::PUSH18,
    Opcode::PUSH19,
    Opcode::PUSH20,
    Opcode::PUSH21,
    Opcode::PUSH22,
    Opcode::PUSH23,
    Opcode::PUSH24,
    Opcode::PUSH25,
    Opcode::PUSH26,
    Opcode::PUSH27,
    Opcode::PUSH28,
    Opcode::PUSH29,
    Opcode::PUSH30,
    Opcode::PUSH31,
    Opcode::PUSH32,
];

const DUP_TABLE: [Opcode; 16] = [
    Opcode::DUP1,
    Opcode::DUP2,
    Opcode::DUP3,
    Opcode::DUP4,
    Opcode::DUP5,
    Opcode::DUP6,
    Opcode::DUP7,
    Opcode::DUP8,
    Opcode::DUP9,
    Opcode::DUP10,
    Opcode::DUP11,
    Opcode::DUP12,
    Opcode::DUP13,
    Opcode::DUP14,
    Opcode::DUP15,
    Opcode::DUP16,
];

const SWAP_TABLE: [Opcode; 16] = [
    Opcode::SWAP1,
    Opcode::SWAP2,
    Opcode::SWAP3,
    Opcode::SWAP4,
    Opcode::SWAP5,
    Opcode::SWAP6,
    Opcode::SWAP7,
    Opcode::SWAP8,
    Opcode::SWAP9,
    Opcode::SWAP10,
    Opcode::SWAP11,
    Opcode::SWAP12,
    Opcode::SWAP13,
    Opcode::SWAP14,
    Opcode::SWAP15,
    Opcode::SWAP16,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn byte_roundtrip_for_real_opcodes() {
        for byte in 0u16..=0xFF {
            let op = Opcode::from_byte(byte as u8);
            if op != Opcode::MISSING {
                assert_eq!(op as usize, usize::from(byte), "byte {byte:#x}");
            }
        }
    }

    #[test]
    fn push_widths() {
        assert_eq!(Opcode::PUSH0.push_width(), 0);
        assert_eq!(Opcode::PUSH1.push_width(), 1);
        assert_eq!(Opcode::PUSH20.push_width(), 20);
        assert_eq!(Opcode::PUSH32.push_width(), 32);
        assert_eq!(Opcode::ADD.push_width(), 0);
    }

    #[test]
    fn stack_arity() {
        assert_eq!(Opcode::ADD.pops(), 2);
        assert_eq!(Opcode::ADD.pushes(), 1);
        assert_eq!(Opcode::CALL.pops(), 7);
        assert_eq!(Opcode::DELEGATECALL.pops(), 6);
        assert_eq!(Opcode::LOG3.pops(), 5);
        assert_eq!(Opcode::DUP3.dup_depth(), 3);
        assert_eq!(Opcode::SWAP16.swap_depth(), 16);
    }

    #[test]
    fn flow_classes() {
        assert_eq!(Opcode::JUMP.flow(), FlowClass::Jump);
        assert_eq!(Opcode::JUMPI.flow(), FlowClass::CondJump);
        assert_eq!(Opcode::STOP.flow(), FlowClass::HaltNormal);
        assert_eq!(Opcode::SELFDESTRUCT.flow(), FlowClass::HaltNormal);
        assert_eq!(Opcode::REVERT.flow(), FlowClass::HaltAbnormal);
        assert_eq!(Opcode::INVALID.flow(), FlowClass::HaltAbnormal);
        assert!(!Opcode::MSTORE.alters_flow());
    }

    #[test]
    fn mnemonic_aliases_parse() {
        assert_eq!(Opcode::from_str("SHA3").unwrap(), Opcode::SHA3);
        assert_eq!(Opcode::from_str("KECCAK256").unwrap(), Opcode::SHA3);
        assert_eq!(Opcode::from_str("DIFFICULTY").unwrap(), Opcode::PREVRANDAO);
        assert!(Opcode::from_str("NOTANOP").is_err());
    }

    #[test]
    fn unknown_bytes_are_missing() {
        assert_eq!(Opcode::from_byte(0x0C), Opcode::MISSING);
        assert_eq!(Opcode::from_byte(0xEF), Opcode::MISSING);
    }
}
