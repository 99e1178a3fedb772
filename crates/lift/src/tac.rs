//! Three-address code.
//!
//! The destackifier lowers each path's blocks into a flat stream of
//! [`TacOp`]s owned by a [`TacPath`]. Operations are addressed by their
//! index in that stream (`Loc`), which is what variable def/use sites
//! refer to.

use ethereum_types::U256;

use crate::cfg::BlockId;
use crate::memory::MemValue;
use crate::opcodes::Opcode;
use crate::value::{Loc, VarId, VarPool};

/// One lifted operation.
#[derive(Debug, Clone)]
pub struct TacOp {
    pub opcode: Opcode,
    /// Stack operands, in pop order.
    pub args: Vec<VarId>,
    /// Extra operand snapshot for effectful ops: the interesting head
    /// arguments followed by the memory slices they reference (call
    /// arguments, hashed bytes, creation code).
    pub values: Vec<MemValue>,
    /// Concrete operand values witnessed in a trace; empty for static runs.
    pub trace_values: Vec<U256>,
    /// Program counter of the source EVM instruction.
    pub pc: usize,
    /// Index of this op in the owning path's stream.
    pub loc: Loc,
    /// Entry pc of the block the op belongs to.
    pub block_entry: usize,
    /// Result variable for value-producing ops.
    pub lhs: Option<VarId>,
}

/// A block of the lifted path: a window into [`TacPath::ops`].
#[derive(Debug, Clone)]
pub struct TacBlock {
    pub entry: usize,
    pub exit: usize,
    pub evm_block: BlockId,
    pub op_start: Loc,
    pub op_end: Loc,
}

impl TacBlock {
    pub fn ident(&self) -> usize {
        self.entry
    }
}

/// A fully lifted path: TAC blocks over a shared op stream plus the
/// variable pool the stream references.
#[derive(Debug, Clone, Default)]
pub struct TacPath {
    pub blocks: Vec<TacBlock>,
    pub ops: Vec<TacOp>,
    pub pool: VarPool,
    /// True iff a constant `JUMPI` condition contradicted the branch the
    /// path takes, or the feasibility checker refuted the path.
    pub illegal: bool,
    pub from_transaction: bool,
    /// Index of the first block of the function body (past the
    /// dispatcher), set by the function analyzer.
    pub entry_index: usize,
    /// Index into the recognized function list, set by the function
    /// analyzer.
    pub function: Option<usize>,
}

impl TacPath {
    pub fn op(&self, loc: Loc) -> &TacOp {
        &self.ops[loc]
    }

    /// Ops of one block.
    pub fn block_ops(&self, block: &TacBlock) -> &[TacOp] {
        &self.ops[block.op_start..block.op_end]
    }

    /// The closing op of a block. Blocks always hold at least a `NOP`.
    pub fn last_op_of(&self, block: &TacBlock) -> &TacOp {
        &self.ops[block.op_end - 1]
    }

    /// Stable identity: the block entry sequence.
    pub fn key(&self) -> Vec<usize> {
        self.blocks.iter().map(|b| b.entry).collect()
    }

    pub fn has_state_affecting_op(&self) -> bool {
        self.ops.iter().any(|op| op.opcode.affects_state())
    }
}
