//! Symbolic values.
//!
//! Every value the destackifier manipulates is a [`VarId`] into a per-path
//! [`VarPool`]. A variable is either a 256-bit constant or a named symbolic
//! value; symbolic variables carry their unique definition site and an
//! append-only list of use sites, which later phases walk as def-use chains.

use std::fmt;

use ethereum_types::U256;

use crate::errors::PathError;
use crate::memory::DynamicCell;
use crate::opcodes::Opcode;

/// Index of a TAC operation inside the flat op list of a lifted path.
pub type Loc = usize;

/// Handle to a variable inside a [`VarPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

/// How a symbolic variable came to exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarKind {
    /// A constant. Rendered as its hex value.
    Const,
    /// Produced by a stack-pushing operation; named `V<seq>@<pc>@<entry>`.
    Stack {
        seq: u32,
        pc: usize,
        block_entry: usize,
    },
    /// An opaque external data source written into memory
    /// (`CALLDATACOPY@pc`, `CODECOPY@pc`, …).
    DataCopy { op: Opcode, pc: usize },
    /// Return data of an external call (`CALLRETURN@pc`, `STATICCALLRETURN@pc`, …).
    CallReturn { op: Opcode, pc: usize },
}

/// What is currently known about a variable's value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VarBinding {
    #[default]
    Unknown,
    Const(U256),
    /// Copies another variable (memory load of a plain value).
    Var(VarId),
    /// Holds a slice of an external memory source.
    Cell(Box<DynamicCell>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarData {
    pub kind: VarKind,
    pub binding: VarBinding,
    /// The single TAC op that defined this variable, if any.
    pub def_site: Option<Loc>,
    /// Every TAC op that consumed this variable, in lift order.
    pub use_sites: Vec<Loc>,
}

/// Owner of all variables created while lifting one path.
#[derive(Debug, Clone, Default)]
pub struct VarPool {
    vars: Vec<VarData>,
    next_seq: u32,
}

impl VarPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, data: VarData) -> VarId {
        let id = VarId(u32::try_from(self.vars.len()).unwrap_or(u32::MAX));
        self.vars.push(data);
        id
    }

    /// A fresh constant variable.
    pub fn constant(&mut self, value: U256) -> VarId {
        self.alloc(VarData {
            kind: VarKind::Const,
            binding: VarBinding::Const(value),
            def_site: None,
            use_sites: Vec::new(),
        })
    }

    /// A fresh stack variable named by the next free sequence number.
    pub fn fresh(&mut self, pc: usize, block_entry: usize) -> VarId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.alloc(VarData {
            kind: VarKind::Stack {
                seq,
                pc,
                block_entry,
            },
            binding: VarBinding::Unknown,
            def_site: None,
            use_sites: Vec::new(),
        })
    }

    /// A fresh external memory source (`<OP>@pc`).
    pub fn data_copy(&mut self, op: Opcode, pc: usize) -> VarId {
        self.alloc(VarData {
            kind: VarKind::DataCopy { op, pc },
            binding: VarBinding::Unknown,
            def_site: None,
            use_sites: Vec::new(),
        })
    }

    /// A fresh external call-return source (`<OP>RETURN@pc`).
    pub fn call_return(&mut self, op: Opcode, pc: usize) -> VarId {
        self.alloc(VarData {
            kind: VarKind::CallReturn { op, pc },
            binding: VarBinding::Unknown,
            def_site: None,
            use_sites: Vec::new(),
        })
    }

    pub fn get(&self, id: VarId) -> &VarData {
        &self.vars[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: VarId) -> &mut VarData {
        &mut self.vars[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Follow `Var` bindings until the last variable of the copy chain.
    pub fn resolve(&self, mut id: VarId) -> VarId {
        while let VarBinding::Var(next) = self.get(id).binding {
            if next == id {
                break;
            }
            id = next;
        }
        id
    }

    /// Constant value of the variable, following copy chains.
    pub fn const_value(&self, id: VarId) -> Option<U256> {
        match &self.get(self.resolve(id)).binding {
            VarBinding::Const(v) => Some(*v),
            VarBinding::Cell(cell) => cell.const_value(self),
            _ => None,
        }
    }

    pub fn is_const(&self, id: VarId) -> bool {
        self.const_value(id).is_some()
    }

    pub fn set_binding(&mut self, id: VarId, binding: VarBinding) {
        self.get_mut(id).binding = binding;
    }

    pub fn set_def_site(&mut self, id: VarId, loc: Loc) {
        self.get_mut(id).def_site = Some(loc);
    }

    pub fn add_use_site(&mut self, id: VarId, loc: Loc) {
        self.get_mut(id).use_sites.push(loc);
    }

    /// Canonical name of the variable. Constants render as bare hex.
    pub fn name(&self, id: VarId) -> String {
        let data = self.get(id);
        match &data.kind {
            VarKind::Const => match data.binding {
                VarBinding::Const(v) => format!("{v:#x}"),
                _ => "C".to_string(),
            },
            VarKind::Stack {
                seq,
                pc,
                block_entry,
            } => format!("V{seq}@{pc:#x}@{block_entry:#x}"),
            VarKind::DataCopy { op, pc } => format!("{op}@{pc:#x}"),
            VarKind::CallReturn { op, pc } => format!("{op}RETURN@{pc:#x}"),
        }
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// ─── 256-bit modular arithmetic ─────────────────────────────────────────

const WORD_BITS: usize = 256;

fn is_negative(v: U256) -> bool {
    v.bit(WORD_BITS - 1)
}

/// Two's complement negation.
fn neg(v: U256) -> U256 {
    (!v).overflowing_add(U256::one()).0
}

fn abs(v: U256) -> U256 {
    if is_negative(v) { neg(v) } else { v }
}

fn bool_word(b: bool) -> U256 {
    if b { U256::one() } else { U256::zero() }
}

/// Evaluate an arithmetic opcode over constant operands with EVM semantics:
/// wrap-around at 2^256, two's complement for the signed variants, zero for
/// division or modulo by zero.
pub fn fold(op: Opcode, args: &[U256]) -> Option<U256> {
    use Opcode::*;
    let a = |i: usize| args.get(i).copied().unwrap_or_default();
    Some(match (op, args.len()) {
        (ADD, 2) => a(0).overflowing_add(a(1)).0,
        (MUL, 2) => a(0).overflowing_mul(a(1)).0,
        (SUB, 2) => a(0).overflowing_sub(a(1)).0,
        (DIV, 2) => a(0).checked_div(a(1)).unwrap_or_default(),
        (SDIV, 2) => {
            let (l, r) = (a(0), a(1));
            if r.is_zero() {
                U256::zero()
            } else {
                let q = abs(l).checked_div(abs(r)).unwrap_or_default();
                if is_negative(l) != is_negative(r) { neg(q) } else { q }
            }
        }
        (MOD, 2) => a(0).checked_rem(a(1)).unwrap_or_default(),
        (SMOD, 2) => {
            let (l, r) = (a(0), a(1));
            if r.is_zero() {
                U256::zero()
            } else {
                let m = abs(l).checked_rem(abs(r)).unwrap_or_default();
                if is_negative(l) { neg(m) } else { m }
            }
        }
        (ADDMOD, 3) => {
            if a(2).is_zero() {
                U256::zero()
            } else {
                let sum = ethereum_types::U512::from(a(0)) + ethereum_types::U512::from(a(1));
                (sum % a(2)).try_into().unwrap_or_default()
            }
        }
        (MULMOD, 3) => {
            if a(2).is_zero() {
                U256::zero()
            } else {
                (a(0).full_mul(a(1)) % a(2)).try_into().unwrap_or_default()
            }
        }
        (EXP, 2) => a(0).overflowing_pow(a(1)).0,
        (SIGNEXTEND, 2) => {
            let bits = a(0);
            let value = a(1);
            if bits >= U256::from(31) {
                value
            } else {
                let test_bit = bits.low_u64() as usize * 8 + 7;
                let mask = (U256::one() << test_bit) - U256::one();
                if value.bit(test_bit) {
                    value | !mask
                } else {
                    value & mask
                }
            }
        }
        (LT, 2) => bool_word(a(0) < a(1)),
        (GT, 2) => bool_word(a(0) > a(1)),
        (SLT, 2) => {
            let (l, r) = (a(0), a(1));
            bool_word(match (is_negative(l), is_negative(r)) {
                (true, false) => true,
                (false, true) => false,
                _ => l < r,
            })
        }
        (SGT, 2) => {
            let (l, r) = (a(0), a(1));
            bool_word(match (is_negative(l), is_negative(r)) {
                (true, false) => false,
                (false, true) => true,
                _ => l > r,
            })
        }
        (EQ, 2) => bool_word(a(0) == a(1)),
        (ISZERO, 1) => bool_word(a(0).is_zero()),
        (AND, 2) => a(0) & a(1),
        (OR, 2) => a(0) | a(1),
        (XOR, 2) => a(0) ^ a(1),
        (NOT, 1) => !a(0),
        (BYTE, 2) => {
            let i = a(0);
            if i >= U256::from(32) {
                U256::zero()
            } else {
                let shift = (31 - i.low_u64() as usize) * 8;
                (a(1) >> shift) & U256::from(0xffu64)
            }
        }
        (SHL, 2) => {
            let shift = a(0);
            if shift >= U256::from(WORD_BITS) {
                U256::zero()
            } else {
                a(1) << shift.low_u64() as usize
            }
        }
        (SHR, 2) => {
            let shift = a(0);
            if shift >= U256::from(WORD_BITS) {
                U256::zero()
            } else {
                a(1) >> shift.low_u64() as usize
            }
        }
        (SAR, 2) => {
            let shift = a(0);
            let value = a(1);
            if shift >= U256::from(WORD_BITS) {
                if is_negative(value) { !U256::zero() } else { U256::zero() }
            } else {
                let n = shift.low_u64() as usize;
                let shifted = value >> n;
                if is_negative(value) && n > 0 {
                    shifted | (!U256::zero() << (WORD_BITS - n))
                } else {
                    shifted
                }
            }
        }
        _ => return None,
    })
}

// ─── Symbolic variable stack ────────────────────────────────────────────

/// The destackifier's bounded variable stack.
#[derive(Debug, Clone, Default)]
pub struct VariableStack {
    items: Vec<VarId>,
}

impl VariableStack {
    pub const MAX_SIZE: usize = 1024;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, var: VarId) -> Result<(), PathError> {
        if self.items.len() >= Self::MAX_SIZE {
            return Err(PathError::StackSizeOverflow {
                size: self.items.len() + 1,
                max: Self::MAX_SIZE,
            });
        }
        self.items.push(var);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<VarId, PathError> {
        self.items.pop().ok_or(PathError::StackUnderflow)
    }

    /// Pop `n` items; first-popped elements inhabit low indices.
    pub fn pop_many(&mut self, n: usize) -> Result<Vec<VarId>, PathError> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.pop()?);
        }
        Ok(out)
    }

    pub fn push_many(&mut self, vars: &[VarId]) -> Result<(), PathError> {
        for var in vars {
            self.push(*var)?;
        }
        Ok(())
    }

    pub fn peek(&self, n: usize) -> Result<VarId, PathError> {
        if n >= self.items.len() {
            return Err(PathError::StackUnderflow);
        }
        Ok(self.items[self.items.len() - 1 - n])
    }

    /// Place a copy of `stack[n-1]` on top.
    pub fn dup(&mut self, n: usize) -> Result<(), PathError> {
        let var = self.peek(n - 1)?;
        self.push(var)
    }

    /// Swap the top with `stack[n]`.
    pub fn swap(&mut self, n: usize) -> Result<(), PathError> {
        if n >= self.items.len() {
            return Err(PathError::StackUnderflow);
        }
        let top = self.items.len() - 1;
        self.items.swap(top, top - n);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(v: u64) -> U256 {
        U256::from(v)
    }

    #[test]
    fn add_wraps_mod_2_256() {
        let max = !U256::zero();
        assert_eq!(fold(Opcode::ADD, &[max, u(1)]).unwrap(), U256::zero());
        assert_eq!(fold(Opcode::ADD, &[u(2), u(3)]).unwrap(), u(5));
    }

    #[test]
    fn signed_division() {
        let minus_six = neg(u(6));
        assert_eq!(fold(Opcode::SDIV, &[minus_six, u(2)]).unwrap(), neg(u(3)));
        assert_eq!(fold(Opcode::SDIV, &[u(6), u(0)]).unwrap(), U256::zero());
        assert_eq!(fold(Opcode::SMOD, &[neg(u(7)), u(3)]).unwrap(), neg(u(1)));
    }

    #[test]
    fn signed_comparisons() {
        let minus_one = neg(u(1));
        assert_eq!(fold(Opcode::SLT, &[minus_one, u(0)]).unwrap(), u(1));
        assert_eq!(fold(Opcode::SGT, &[minus_one, u(0)]).unwrap(), u(0));
        assert_eq!(fold(Opcode::LT, &[minus_one, u(0)]).unwrap(), u(0));
    }

    #[test]
    fn signextend_widens_sign_bit() {
        // byte 0 of 0xff has its high bit set
        let r = fold(Opcode::SIGNEXTEND, &[u(0), u(0xff)]).unwrap();
        assert_eq!(r, !U256::zero());
        let r = fold(Opcode::SIGNEXTEND, &[u(0), u(0x7f)]).unwrap();
        assert_eq!(r, u(0x7f));
    }

    #[test]
    fn shifts_saturate_past_word_width() {
        assert_eq!(fold(Opcode::SHL, &[u(256), u(1)]).unwrap(), U256::zero());
        assert_eq!(fold(Opcode::SHR, &[u(300), !U256::zero()]).unwrap(), U256::zero());
        assert_eq!(fold(Opcode::SAR, &[u(300), neg(u(1))]).unwrap(), !U256::zero());
        assert_eq!(fold(Opcode::SHL, &[u(4), u(1)]).unwrap(), u(16));
    }

    #[test]
    fn mulmod_uses_wide_intermediate() {
        let max = !U256::zero();
        // (2^256-1)^2 mod 7 computed without wrapping the product
        let r = fold(Opcode::MULMOD, &[max, max, u(7)]).unwrap();
        let expected: U256 = (max.full_mul(max) % U256::from(7u64)).try_into().unwrap();
        assert_eq!(r, expected);
    }

    #[test]
    fn stack_discipline() {
        let mut pool = VarPool::new();
        let mut stack = VariableStack::new();
        let a = pool.constant(u(1));
        let b = pool.constant(u(2));
        stack.push(a).unwrap();
        stack.push(b).unwrap();
        stack.swap(1).unwrap();
        assert_eq!(stack.pop().unwrap(), a);
        stack.dup(1).unwrap();
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.pop().unwrap(), b);
        assert_eq!(stack.pop().unwrap(), b);
        assert!(matches!(stack.pop(), Err(PathError::StackUnderflow)));
    }

    #[test]
    fn stack_overflow_is_hard_error() {
        let mut pool = VarPool::new();
        let mut stack = VariableStack::new();
        let v = pool.constant(u(0));
        for _ in 0..VariableStack::MAX_SIZE {
            stack.push(v).unwrap();
        }
        assert!(matches!(
            stack.push(v),
            Err(PathError::StackSizeOverflow { .. })
        ));
    }
}
