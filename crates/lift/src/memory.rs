//! Lightweight symbolic memory model.
//!
//! Memory is tracked per byte: every byte holds a [`DynamicCell`] naming the
//! value it came from, the byte's offset inside that source and a length.
//! Constant-offset reads greedily coalesce adjacent bytes of the same source
//! back into wider slices; symbolic-offset traffic is kept in a sparse
//! side-map keyed by the offset variable. Requests the model cannot resolve
//! raise a recoverable error and the caller discards the path.

use ethereum_types::U256;
use rustc_hash::FxHashMap;

use crate::errors::PathError;
use crate::value::{VarBinding, VarId, VarPool};

/// Word size of a memory cell in bytes.
pub const CELL_SIZE: usize = 32;

/// A constant or a symbolic variable, used for slice offsets and lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Word {
    Const(U256),
    Var(VarId),
}

impl Word {
    pub fn from_var(pool: &VarPool, id: VarId) -> Word {
        match pool.const_value(id) {
            Some(v) => Word::Const(v),
            None => Word::Var(pool.resolve(id)),
        }
    }

    pub fn const_value(&self, pool: &VarPool) -> Option<U256> {
        match self {
            Word::Const(v) => Some(*v),
            Word::Var(id) => pool.const_value(*id),
        }
    }

    pub fn const_usize(&self, pool: &VarPool) -> Option<usize> {
        self.const_value(pool)
            .and_then(|v| usize::try_from(v).ok())
    }
}

/// The value part of a memory slice: either a plain variable or a nested
/// slice of another source (a copy of a copy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellValue {
    Var(VarId),
    Slice(Box<DynamicCell>),
}

impl CellValue {
    /// Value equality as the coalescer sees it: equal constants are equal
    /// regardless of identity, symbolic values must be the same variable.
    fn coalesce_eq(&self, other: &CellValue, pool: &VarPool) -> bool {
        match (self, other) {
            (CellValue::Var(a), CellValue::Var(b)) => {
                if a == b {
                    return true;
                }
                match (pool.const_value(*a), pool.const_value(*b)) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                }
            }
            (CellValue::Slice(a), CellValue::Slice(b)) => a == b,
            _ => false,
        }
    }

    fn is_zero_const(&self, pool: &VarPool) -> bool {
        matches!(self, CellValue::Var(id) if pool.const_value(*id) == Some(U256::zero()))
    }
}

/// A (possibly symbolic) slice of a value: `value[offset .. offset+length]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicCell {
    pub value: CellValue,
    pub offset: Word,
    pub length: Word,
}

impl DynamicCell {
    pub fn new(value: CellValue, offset: Word, length: Word) -> Self {
        DynamicCell {
            value,
            offset,
            length,
        }
    }

    fn byte_of(value: CellValue, index: usize) -> Self {
        DynamicCell {
            value,
            offset: Word::Const(U256::from(index)),
            length: Word::Const(U256::one()),
        }
    }

    fn zero(pool: &mut VarPool) -> Self {
        DynamicCell::byte_of(CellValue::Var(pool.constant(U256::zero())), 0)
    }

    /// The concrete value of the slice, when value, offset and length are
    /// all constants. A zero-length slice has no value.
    pub fn const_value(&self, pool: &VarPool) -> Option<U256> {
        let value = match &self.value {
            CellValue::Var(id) => pool.const_value(*id)?,
            CellValue::Slice(inner) => inner.const_value(pool)?,
        };
        let offset = self.offset.const_usize(pool)?;
        let length = self.length.const_usize(pool)?;
        if length == 0 || offset + length > CELL_SIZE {
            return None;
        }
        let bytes = value.to_big_endian();
        let mut out = [0u8; CELL_SIZE];
        out[CELL_SIZE - length..].copy_from_slice(&bytes[offset..offset + length]);
        Some(U256::from_big_endian(&out))
    }

    fn extend_length(&mut self, pool: &VarPool) -> Result<(), PathError> {
        match self.length.const_value(pool) {
            Some(len) => {
                self.length = Word::Const(len + U256::one());
                Ok(())
            }
            None => Err(PathError::MemoryLengthExtend(
                "slice length is not constant".to_string(),
            )),
        }
    }
}

/// One item of a resolved memory read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemValue {
    Var(VarId),
    Cell(DynamicCell),
}

impl MemValue {
    pub fn const_value(&self, pool: &VarPool) -> Option<U256> {
        match self {
            MemValue::Var(id) => pool.const_value(*id),
            MemValue::Cell(cell) => cell.const_value(pool),
        }
    }
}

/// Key of the sparse side-map: constants compare by value, symbolic offsets
/// by identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum MemKey {
    Const(U256),
    Var(VarId),
}

impl MemKey {
    fn of(pool: &VarPool, id: VarId) -> MemKey {
        match pool.const_value(id) {
            Some(v) => MemKey::Const(v),
            None => MemKey::Var(pool.resolve(id)),
        }
    }

    fn of_word(pool: &VarPool, word: Word) -> MemKey {
        match word {
            Word::Const(v) => MemKey::Const(v),
            Word::Var(id) => MemKey::of(pool, id),
        }
    }
}

/// The per-path memory state.
#[derive(Debug, Clone, Default)]
pub struct EvmMemory {
    /// Dense byte cells for constant-offset traffic.
    list: Vec<DynamicCell>,
    /// Sparse `offset → length → value` map for symbolic traffic.
    mapping: FxHashMap<MemKey, FxHashMap<MemKey, CellValue>>,
}

impl EvmMemory {
    pub fn new() -> Self {
        Self::default()
    }

    fn grow_to(&mut self, pool: &mut VarPool, size: usize) {
        while self.list.len() < size {
            let zero = DynamicCell::zero(pool);
            self.list.push(zero);
        }
    }

    /// Store `value` at `offset` covering `length` bytes (32 when `None`).
    pub fn mstore(
        &mut self,
        pool: &mut VarPool,
        offset: VarId,
        value: CellValue,
        length: Option<Word>,
    ) {
        let length = length.unwrap_or(Word::Const(U256::from(CELL_SIZE)));
        let offset_const = pool.const_value(offset).and_then(|v| usize::try_from(v).ok());
        let length_const = length.const_usize(pool);
        match (offset_const, length_const) {
            (Some(o), Some(l)) => {
                self.grow_to(pool, o + l);
                for i in 0..l {
                    self.list[o + i] = DynamicCell::byte_of(value.clone(), i);
                }
            }
            _ => {
                let okey = MemKey::of(pool, offset);
                let lkey = MemKey::of_word(pool, length);
                self.mapping.entry(okey).or_default().insert(lkey, value);
            }
        }
    }

    /// Load `length` bytes (32 when `None`) from `offset`.
    ///
    /// Returns the list of source slices spanning the request, coalesced
    /// wherever adjacent bytes continue the same source.
    pub fn mload(
        &mut self,
        pool: &mut VarPool,
        offset: VarId,
        length: Option<Word>,
    ) -> Result<Vec<MemValue>, PathError> {
        let length = length.unwrap_or(Word::Const(U256::from(CELL_SIZE)));
        let okey = MemKey::of(pool, offset);

        // Sparse traffic first: a prior symbolic write wins even for
        // constant offsets.
        if let Some(lengths) = self.mapping.get(&okey) {
            let lkey = MemKey::of_word(pool, length);
            if let Some(value) = lengths.get(&lkey) {
                return Ok(vec![cell_to_mem_value(value.clone(), length)]);
            }
            // Same offset, different span: re-window the stored slice.
            if let Some(value) = lengths.values().next() {
                return match value {
                    CellValue::Slice(cell) => {
                        let mut cell = (**cell).clone();
                        cell.length = length;
                        Ok(vec![MemValue::Cell(cell)])
                    }
                    CellValue::Var(_) => Err(PathError::MemoryUnresolvable(
                        "symbolic write re-read with a different length".to_string(),
                    )),
                };
            }
        }

        let offset_const = pool.const_value(offset).and_then(|v| usize::try_from(v).ok());
        if offset_const.is_none() {
            // Never-written symbolic offset: materialize a zero and remember
            // it so later reads agree.
            let zero = CellValue::Var(pool.constant(U256::zero()));
            let lkey = MemKey::of_word(pool, length);
            self.mapping
                .entry(okey)
                .or_default()
                .insert(lkey, zero.clone());
            return Ok(vec![cell_to_mem_value(zero, length)]);
        }

        let Some(length_const) = length.const_usize(pool) else {
            return Err(PathError::MemoryUnresolvable(
                "constant offset with symbolic length".to_string(),
            ));
        };
        let o = offset_const.unwrap_or_default();
        if length_const == 0 {
            return Ok(Vec::new());
        }

        self.grow_to(pool, o + length_const);

        // Coalesce adjacent bytes of the same source.
        let mut slices: Vec<DynamicCell> = vec![self.list[o].clone()];
        for i in 1..length_const {
            let cell = &self.list[o + i];
            let last = slices.last_mut().unwrap_or_else(|| unreachable!());
            if cell.value.coalesce_eq(&last.value, pool) {
                if cell.value.is_zero_const(pool) && last.value.is_zero_const(pool) {
                    last.extend_length(pool)?;
                } else {
                    let cell_off = cell.offset.const_value(pool);
                    let last_off = last.offset.const_value(pool);
                    let last_len = last.length.const_value(pool);
                    match (cell_off, last_off, last_len) {
                        (Some(co), Some(lo), Some(ll)) => {
                            if co == lo + ll {
                                last.extend_length(pool)?;
                            } else {
                                slices.push(cell.clone());
                            }
                        }
                        _ => {
                            return Err(PathError::MemoryLengthExtend(
                                "non-contiguous symbolic slice".to_string(),
                            ));
                        }
                    }
                }
            } else {
                slices.push(cell.clone());
            }
        }

        Ok(slices
            .into_iter()
            .map(|slice| resolve_slice(slice, pool))
            .collect())
    }

    /// Number of dense bytes currently modeled. Test-visible.
    pub fn dense_len(&self) -> usize {
        self.list.len()
    }
}

/// Wrap a sparse-map value into the mload result shape.
fn cell_to_mem_value(value: CellValue, length: Word) -> MemValue {
    match value {
        CellValue::Var(id) => MemValue::Var(id),
        CellValue::Slice(cell) => {
            let mut cell = *cell;
            cell.length = length;
            MemValue::Cell(cell)
        }
    }
}

/// Collapse a coalesced slice to the raw value when it covers an entire
/// aligned word, and re-window nested copies.
fn resolve_slice(slice: DynamicCell, pool: &VarPool) -> MemValue {
    let offset = slice.offset.const_value(pool);
    let length = slice.length.const_value(pool);
    match &slice.value {
        CellValue::Var(id) => {
            if offset == Some(U256::zero()) && length == Some(U256::from(CELL_SIZE)) {
                MemValue::Var(*id)
            } else {
                MemValue::Cell(slice)
            }
        }
        CellValue::Slice(inner) => {
            let (Some(offset), Some(length)) = (offset, length) else {
                return MemValue::Cell(slice);
            };
            let inner_off = inner.offset.const_value(pool);
            let inner_len = inner.length.const_value(pool);
            let (Some(inner_off), Some(inner_len)) = (inner_off, inner_len) else {
                return MemValue::Cell(slice);
            };
            if inner_off + inner_len >= offset + length {
                let mut rewindowed = (**inner).clone();
                rewindowed.offset = Word::Const(offset + inner_off);
                rewindowed.length = Word::Const(length);
                MemValue::Cell(rewindowed)
            } else {
                MemValue::Cell(slice)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_var(
        mem: &mut EvmMemory,
        pool: &mut VarPool,
        offset: u64,
        var: VarId,
        length: Option<u64>,
    ) {
        let off = pool.constant(U256::from(offset));
        mem.mstore(
            pool,
            off,
            CellValue::Var(var),
            length.map(|l| Word::Const(U256::from(l))),
        );
    }

    fn load(mem: &mut EvmMemory, pool: &mut VarPool, offset: u64, length: u64) -> Vec<MemValue> {
        let off = pool.constant(U256::from(offset));
        mem.mload(pool, off, Some(Word::Const(U256::from(length))))
            .unwrap()
    }

    #[test]
    fn word_roundtrip() {
        let mut pool = VarPool::new();
        let mut mem = EvmMemory::new();
        let v = pool.fresh(0, 0);
        store_var(&mut mem, &mut pool, 0x40, v, None);
        let loaded = load(&mut mem, &mut pool, 0x40, 32);
        assert_eq!(loaded, vec![MemValue::Var(v)]);
    }

    #[test]
    fn subword_roundtrip_lengths() {
        for len in [1u64, 8, 20, 32] {
            let mut pool = VarPool::new();
            let mut mem = EvmMemory::new();
            let v = pool.fresh(0, 0);
            store_var(&mut mem, &mut pool, 0, v, Some(len));
            let loaded = load(&mut mem, &mut pool, 0, len);
            assert_eq!(loaded.len(), 1, "length {len}");
            match &loaded[0] {
                MemValue::Var(id) => {
                    assert_eq!(len, 32);
                    assert_eq!(*id, v);
                }
                MemValue::Cell(cell) => {
                    assert_eq!(cell.value, CellValue::Var(v));
                    assert_eq!(cell.length.const_value(&pool), Some(U256::from(len)));
                }
            }
        }
    }

    #[test]
    fn constant_store_reads_back_concrete() {
        let mut pool = VarPool::new();
        let mut mem = EvmMemory::new();
        let c = pool.constant(U256::from(0xdeadbeefu64));
        store_var(&mut mem, &mut pool, 0, c, None);
        let loaded = load(&mut mem, &mut pool, 0, 32);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].const_value(&pool), Some(U256::from(0xdeadbeefu64)));
    }

    #[test]
    fn unwritten_memory_reads_zero() {
        let mut pool = VarPool::new();
        let mut mem = EvmMemory::new();
        let loaded = load(&mut mem, &mut pool, 0x20, 32);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].const_value(&pool), Some(U256::zero()));
    }

    #[test]
    fn adjacent_words_stay_separate() {
        let mut pool = VarPool::new();
        let mut mem = EvmMemory::new();
        let a = pool.fresh(0, 0);
        let b = pool.fresh(1, 0);
        store_var(&mut mem, &mut pool, 0, a, None);
        store_var(&mut mem, &mut pool, 32, b, None);
        let loaded = load(&mut mem, &mut pool, 0, 64);
        assert_eq!(loaded, vec![MemValue::Var(a), MemValue::Var(b)]);
    }

    #[test]
    fn partial_overwrite_splits_slices() {
        let mut pool = VarPool::new();
        let mut mem = EvmMemory::new();
        let a = pool.fresh(0, 0);
        let b = pool.fresh(1, 0);
        store_var(&mut mem, &mut pool, 0, a, None);
        store_var(&mut mem, &mut pool, 0, b, Some(1));
        let loaded = load(&mut mem, &mut pool, 0, 32);
        assert_eq!(loaded.len(), 2);
        match &loaded[0] {
            MemValue::Cell(cell) => assert_eq!(cell.value, CellValue::Var(b)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn symbolic_offset_goes_to_side_map() {
        let mut pool = VarPool::new();
        let mut mem = EvmMemory::new();
        let off = pool.fresh(0, 0);
        let v = pool.fresh(1, 0);
        mem.mstore(&mut pool, off, CellValue::Var(v), None);
        let loaded = mem.mload(&mut pool, off, None).unwrap();
        assert_eq!(loaded, vec![MemValue::Var(v)]);
        assert_eq!(mem.dense_len(), 0);
    }
}
