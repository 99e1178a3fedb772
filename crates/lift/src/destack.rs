//! The destackifier: per-block conversion of stack machine code into
//! three-address code.
//!
//! Most instructions map over directly. `POP`/`DUP`/`SWAP` only permute the
//! symbolic stack and emit nothing; `PUSH` becomes a `CONST` assignment;
//! `LOG0..LOG4` collapse into one canonical `LOG`; memory traffic goes
//! through the byte-level model so later phases see the data that calls,
//! hashes and creations actually consumed. Arithmetic over constant
//! operands is folded on the spot with 256-bit modular semantics.

use bytes::Bytes;
use ethereum_types::U256;
use tracing::debug;

use crate::cfg::{BlockId, Cfg, EvmPath};
use crate::disasm::Operation;
use crate::errors::PathError;
use crate::memory::{CellValue, DynamicCell, EvmMemory, MemValue, Word};
use crate::opcodes::Opcode;
use crate::tac::{TacBlock, TacOp, TacPath};
use crate::value::{VarBinding, VarId, VariableStack};

/// Stack, memory and counters carried across the blocks of one path.
#[derive(Debug, Clone, Default)]
pub struct Destackifier {
    stack: VariableStack,
    memory: EvmMemory,
    ext_calls: usize,
    /// The runtime bytecode, consulted to concretize `CODECOPY`.
    code: Option<Bytes>,
}

impl Destackifier {
    pub fn new(code: Option<Bytes>) -> Self {
        Destackifier {
            code,
            ..Default::default()
        }
    }

    /// Lift one EVM block onto the end of `path`.
    pub fn convert_block(
        &mut self,
        path: &mut TacPath,
        cfg: &Cfg,
        block_id: BlockId,
    ) -> Result<(), PathError> {
        let block = cfg.block(block_id);
        let entry = block.entry;
        let op_start = path.ops.len();

        for op in &block.ops {
            self.handle_op(path, op, entry)?;
        }

        if path.ops.len() == op_start {
            // Nothing lifted (pure stack shuffling): keep a placeholder so
            // every block has a closing op.
            let loc = path.ops.len();
            path.ops.push(TacOp {
                opcode: Opcode::NOP,
                args: Vec::new(),
                values: Vec::new(),
                trace_values: Vec::new(),
                pc: entry,
                loc,
                block_entry: entry,
                lhs: None,
            });
        }

        let last = block.last_op();
        path.blocks.push(TacBlock {
            entry,
            exit: last.pc + last.opcode.push_width(),
            evm_block: block_id,
            op_start,
            op_end: path.ops.len(),
        });
        Ok(())
    }

    fn push_op(
        &mut self,
        path: &mut TacPath,
        opcode: Opcode,
        args: Vec<VarId>,
        values: Vec<MemValue>,
        pc: usize,
        block_entry: usize,
        lhs: Option<VarId>,
        trace_values: Vec<U256>,
    ) {
        let loc = path.ops.len();
        if let Some(lhs) = lhs {
            path.pool.set_def_site(lhs, loc);
        }
        for arg in &args {
            path.pool.add_use_site(*arg, loc);
        }
        path.ops.push(TacOp {
            opcode,
            args,
            values,
            trace_values,
            pc,
            loc,
            block_entry,
            lhs,
        });
    }

    fn handle_op(
        &mut self,
        path: &mut TacPath,
        op: &Operation,
        entry: usize,
    ) -> Result<(), PathError> {
        let opcode = op.opcode;

        if opcode.is_swap() {
            return self.stack.swap(opcode.swap_depth());
        }
        if opcode.is_dup() {
            return self.stack.dup(opcode.dup_depth());
        }
        if opcode == Opcode::POP {
            self.stack.pop()?;
            return Ok(());
        }
        if opcode == Opcode::JUMPDEST {
            return Ok(());
        }

        let pc = op.pc;
        let needs_lhs = opcode.pushes() == 1;
        let lhs = needs_lhs.then(|| path.pool.fresh(pc, entry));

        if opcode.is_push() {
            let value = op.imm.unwrap_or_default();
            let arg = path.pool.constant(value);
            let lhs = lhs.unwrap_or_else(|| path.pool.fresh(pc, entry));
            path.pool.set_binding(lhs, VarBinding::Const(value));
            self.push_op(
                path,
                Opcode::CONST,
                vec![arg],
                Vec::new(),
                pc,
                entry,
                Some(lhs),
                op.trace_values.clone(),
            );
            self.stack.push(lhs)?;
            return Ok(());
        }

        match opcode {
            Opcode::MISSING => {
                self.push_op(
                    path,
                    Opcode::MISSING,
                    Vec::new(),
                    Vec::new(),
                    pc,
                    entry,
                    None,
                    op.trace_values.clone(),
                );
            }
            op_ if op_.is_log() => {
                let args = self.stack.pop_many(op_.pops())?;
                self.push_op(
                    path,
                    Opcode::LOG,
                    args,
                    Vec::new(),
                    pc,
                    entry,
                    None,
                    op.trace_values.clone(),
                );
            }
            Opcode::MLOAD => {
                let offset = self.stack.pop()?;
                let lhs = lhs.unwrap_or_else(|| path.pool.fresh(pc, entry));
                let loaded = self.memory.mload(&mut path.pool, offset, None)?;
                if let Some(first) = loaded.into_iter().next() {
                    let binding = match first {
                        MemValue::Var(v) => match path.pool.const_value(v) {
                            Some(c) => VarBinding::Const(c),
                            None => VarBinding::Var(v),
                        },
                        MemValue::Cell(cell) => match cell.const_value(&path.pool) {
                            Some(c) => VarBinding::Const(c),
                            None => VarBinding::Cell(Box::new(cell)),
                        },
                    };
                    path.pool.set_binding(lhs, binding);
                }
                self.push_op(
                    path,
                    Opcode::MLOAD,
                    vec![offset],
                    Vec::new(),
                    pc,
                    entry,
                    Some(lhs),
                    op.trace_values.clone(),
                );
                self.stack.push(lhs)?;
                return Ok(());
            }
            Opcode::MSTORE | Opcode::MSTORE8 => {
                let offset = self.stack.pop()?;
                let value = self.stack.pop()?;
                let length = (opcode == Opcode::MSTORE8).then(|| Word::Const(U256::one()));
                self.memory
                    .mstore(&mut path.pool, offset, CellValue::Var(value), length);
                self.push_op(
                    path,
                    opcode,
                    vec![offset, value],
                    vec![MemValue::Var(offset), MemValue::Var(value)],
                    pc,
                    entry,
                    None,
                    op.trace_values.clone(),
                );
            }
            Opcode::CALLDATACOPY | Opcode::RETURNDATACOPY => {
                let dst = self.stack.pop()?;
                let src = self.stack.pop()?;
                let len = self.stack.pop()?;
                self.store_external_copy(path, opcode, pc, dst, src, len);
                self.push_op(
                    path,
                    opcode,
                    vec![dst, src, len],
                    Vec::new(),
                    pc,
                    entry,
                    None,
                    op.trace_values.clone(),
                );
            }
            Opcode::CODECOPY => {
                let dst = self.stack.pop()?;
                let src = self.stack.pop()?;
                let len = self.stack.pop()?;
                self.copy_code(path, pc, dst, src, len);
                self.push_op(
                    path,
                    opcode,
                    vec![dst, src, len],
                    Vec::new(),
                    pc,
                    entry,
                    None,
                    op.trace_values.clone(),
                );
            }
            Opcode::EXTCODECOPY => {
                let addr = self.stack.pop()?;
                let dst = self.stack.pop()?;
                let src = self.stack.pop()?;
                let len = self.stack.pop()?;
                self.store_external_copy(path, opcode, pc, dst, src, len);
                self.push_op(
                    path,
                    opcode,
                    vec![addr, dst, src, len],
                    Vec::new(),
                    pc,
                    entry,
                    None,
                    op.trace_values.clone(),
                );
            }
            op_ if op_.is_call() => {
                let args = self.stack.pop_many(op_.pops())?;
                let lhs = lhs.unwrap_or_else(|| path.pool.fresh(pc, entry));
                // CALL/CALLCODE carry a value operand; the delegate pair
                // does not.
                let (args_offset, args_length, ret_offset, ret_length, head_len) =
                    if args.len() == 7 {
                        (args[3], args[4], args[5], args[6], 5)
                    } else {
                        (args[2], args[3], args[4], args[5], 4)
                    };
                let mut values: Vec<MemValue> =
                    args[..head_len].iter().map(|v| MemValue::Var(*v)).collect();
                let args_off_word = Word::from_var(&path.pool, args_offset);
                let args_len_word = Word::from_var(&path.pool, args_length);
                let ret_len = Word::from_var(&path.pool, ret_length);
                let call_args = self
                    .memory
                    .mload(&mut path.pool, args_offset, Some(args_len_word))?;
                let ret_var = path.pool.call_return(op_, pc);
                let ret_cell = DynamicCell::new(CellValue::Var(ret_var), args_off_word, args_len_word);
                self.memory.mstore(
                    &mut path.pool,
                    ret_offset,
                    CellValue::Slice(Box::new(ret_cell)),
                    Some(ret_len),
                );
                values.extend(call_args);
                self.push_op(
                    path,
                    op_,
                    args,
                    values,
                    pc,
                    entry,
                    Some(lhs),
                    op.trace_values.clone(),
                );
                self.ext_calls += 1;
                self.stack.push(lhs)?;
                return Ok(());
            }
            Opcode::RETURNDATASIZE => {
                let lhs = lhs.unwrap_or_else(|| path.pool.fresh(pc, entry));
                if self.ext_calls == 0 {
                    // No call yet: the buffer is empty by definition.
                    path.pool.set_binding(lhs, VarBinding::Const(U256::zero()));
                }
                self.push_op(
                    path,
                    opcode,
                    Vec::new(),
                    Vec::new(),
                    pc,
                    entry,
                    Some(lhs),
                    op.trace_values.clone(),
                );
                self.stack.push(lhs)?;
                return Ok(());
            }
            Opcode::CREATE | Opcode::CREATE2 => {
                let args = self.stack.pop_many(opcode.pops())?;
                let lhs = lhs.unwrap_or_else(|| path.pool.fresh(pc, entry));
                let mut values: Vec<MemValue> = args.iter().map(|v| MemValue::Var(*v)).collect();
                let code_len = Word::from_var(&path.pool, args[2]);
                let code_args = self.memory.mload(&mut path.pool, args[1], Some(code_len))?;
                values.extend(code_args);
                self.push_op(
                    path,
                    opcode,
                    args,
                    values,
                    pc,
                    entry,
                    Some(lhs),
                    op.trace_values.clone(),
                );
                self.stack.push(lhs)?;
                return Ok(());
            }
            Opcode::SELFDESTRUCT => {
                let addr = self.stack.pop()?;
                self.push_op(
                    path,
                    opcode,
                    vec![addr],
                    vec![MemValue::Var(addr)],
                    pc,
                    entry,
                    None,
                    op.trace_values.clone(),
                );
            }
            Opcode::SHA3 => {
                let offset = self.stack.pop()?;
                let length = self.stack.pop()?;
                let lhs = lhs.unwrap_or_else(|| path.pool.fresh(pc, entry));
                let len_word = Word::from_var(&path.pool, length);
                let hashed = self.memory.mload(&mut path.pool, offset, Some(len_word))?;
                let mut values = vec![MemValue::Var(offset), MemValue::Var(length)];
                values.extend(hashed);
                self.push_op(
                    path,
                    opcode,
                    vec![offset, length],
                    values,
                    pc,
                    entry,
                    Some(lhs),
                    op.trace_values.clone(),
                );
                self.stack.push(lhs)?;
                return Ok(());
            }
            Opcode::PC => {
                let lhs = lhs.unwrap_or_else(|| path.pool.fresh(pc, entry));
                path.pool.set_binding(lhs, VarBinding::Const(U256::from(pc)));
                self.push_op(
                    path,
                    opcode,
                    Vec::new(),
                    Vec::new(),
                    pc,
                    entry,
                    Some(lhs),
                    op.trace_values.clone(),
                );
                self.stack.push(lhs)?;
                return Ok(());
            }
            _ => {
                let args = self.stack.pop_many(opcode.pops())?;
                if let Some(lhs) = lhs {
                    if opcode.is_arithmetic() {
                        let consts: Option<Vec<U256>> =
                            args.iter().map(|a| path.pool.const_value(*a)).collect();
                        if let Some(consts) = consts {
                            if let Some(folded) = crate::value::fold(opcode, &consts) {
                                path.pool.set_binding(lhs, VarBinding::Const(folded));
                            }
                        }
                    }
                    self.push_op(
                        path,
                        opcode,
                        args,
                        Vec::new(),
                        pc,
                        entry,
                        Some(lhs),
                        op.trace_values.clone(),
                    );
                    self.stack.push(lhs)?;
                    return Ok(());
                }
                self.push_op(
                    path,
                    opcode,
                    args,
                    Vec::new(),
                    pc,
                    entry,
                    None,
                    op.trace_values.clone(),
                );
            }
        }
        Ok(())
    }

    /// Write an opaque `<OP>@pc` slice over `[dst, dst+len)`.
    fn store_external_copy(
        &mut self,
        path: &mut TacPath,
        opcode: Opcode,
        pc: usize,
        dst: VarId,
        src: VarId,
        len: VarId,
    ) {
        let source = path.pool.data_copy(opcode, pc);
        let cell = DynamicCell::new(
            CellValue::Var(source),
            Word::from_var(&path.pool, src),
            Word::from_var(&path.pool, len),
        );
        let length = Word::from_var(&path.pool, len);
        self.memory.mstore(
            &mut path.pool,
            dst,
            CellValue::Slice(Box::new(cell)),
            Some(length),
        );
    }

    /// `CODECOPY` with constant operands materializes the code words as
    /// constants; otherwise it degrades to an opaque copy.
    fn copy_code(&mut self, path: &mut TacPath, pc: usize, dst: VarId, src: VarId, len: VarId) {
        let src_const = path.pool.const_value(src).and_then(|v| usize::try_from(v).ok());
        let len_const = path.pool.const_value(len).and_then(|v| usize::try_from(v).ok());
        let dst_const = path.pool.const_value(dst).and_then(|v| usize::try_from(v).ok());
        if let (Some(code), Some(src_c), Some(len_c), Some(dst_c)) =
            (self.code.clone(), src_const, len_const, dst_const)
        {
            for word in 0..len_c / 32 {
                let mut bytes = [0u8; 32];
                let from = src_c + word * 32;
                for (i, byte) in bytes.iter_mut().enumerate() {
                    *byte = code.get(from + i).copied().unwrap_or(0);
                }
                let value = path.pool.constant(U256::from_big_endian(&bytes));
                let offset = path.pool.constant(U256::from(dst_c + word * 32));
                self.memory
                    .mstore(&mut path.pool, offset, CellValue::Var(value), None);
            }
        } else {
            self.store_external_copy(path, Opcode::CODECOPY, pc, dst, src, len);
        }
    }
}

/// A constant-condition `JUMPI` that contradicts the branch the path takes
/// makes the whole path illegal.
fn branch_contradicted(path: &TacPath, block: &TacBlock, next_entry: usize) -> bool {
    let last = path.last_op_of(block);
    if last.opcode != Opcode::JUMPI || last.args.len() < 2 {
        return false;
    }
    let dest = path.pool.const_value(last.args[0]);
    let cond = path.pool.const_value(last.args[1]);
    if let (Some(dest), Some(cond)) = (dest, cond) {
        let takes_jump = U256::from(next_entry) == dest;
        return !cond.is_zero() != takes_jump;
    }
    false
}

/// Lift one explored path to TAC.
///
/// When the path's final block closes with a constant-destination jump the
/// light explorer could not resolve, the edge is added to the CFG here and
/// the path is extended breadth-first with the destackifier's full state —
/// this is where memory-dependent dispatch tables get uncovered. A constant
/// destination that is not a `JUMPDEST` rewrites the op into a `REVERT`.
///
/// Returns the lifted paths (several when the extension forks), minus any
/// that pass through revert-carrying blocks.
pub fn transform_path(
    cfg: &mut Cfg,
    evm_path: &EvmPath,
    code: Option<Bytes>,
) -> Result<Vec<TacPath>, PathError> {
    let mut path = TacPath {
        from_transaction: evm_path.from_transaction,
        ..Default::default()
    };
    let mut destack = Destackifier::new(code);

    for (idx, &block_id) in evm_path.blocks.iter().enumerate() {
        destack.convert_block(&mut path, cfg, block_id)?;
        if let Some(&next) = evm_path.blocks.get(idx + 1) {
            let block = path.blocks.last().unwrap_or_else(|| unreachable!()).clone();
            if branch_contradicted(&path, &block, cfg.block(next).entry) {
                path.illegal = true;
                return Ok(Vec::new());
            }
        }
    }

    let mut finished: Vec<TacPath> = Vec::new();
    let mut extended = false;

    let tail = path
        .blocks
        .last()
        .map(|b| (b.evm_block, path.last_op_of(b).clone()));
    if let Some((src, last)) = tail {
        let is_jump = matches!(last.opcode, Opcode::JUMP | Opcode::JUMPI);
        let const_dest = is_jump
            .then(|| last.args.first())
            .flatten()
            .and_then(|arg| path.pool.const_value(*arg))
            .and_then(|d| usize::try_from(d).ok());
        if let Some(dest) = const_dest {
            if let Some(dest_block) = cfg.jump_dest(dest) {
                debug!(dest = format_args!("{dest:#x}"), "late-resolved jump, extending path");
                cfg.add_edge(src, dest_block);
                extended = true;
                let mut forks = 0usize;
                let mut queue = vec![(path.clone(), destack.clone(), dest_block)];
                while let Some((mut fork, mut fork_destack, current)) = queue.pop() {
                    forks += 1;
                    if forks > 1024 {
                        debug!("path extension fork budget exhausted");
                        break;
                    }
                    fork_destack.convert_block(&mut fork, cfg, current)?;
                    let block = cfg.block(current);
                    if block.succs.is_empty() {
                        if !block.last_op().opcode.halts_abnormally() {
                            finished.push(fork);
                        }
                        continue;
                    }
                    for succ in block
                        .succs
                        .iter()
                        .copied()
                        .filter(|s| !cfg.block(*s).last_op().opcode.halts_abnormally())
                    {
                        queue.push((fork.clone(), fork_destack.clone(), succ));
                    }
                }
            } else {
                // Constant destination without a JUMPDEST: an abort in
                // disguise.
                let loc = last.loc;
                path.ops[loc] = TacOp {
                    opcode: Opcode::REVERT,
                    args: Vec::new(),
                    values: Vec::new(),
                    trace_values: Vec::new(),
                    pc: last.pc,
                    loc,
                    block_entry: last.block_entry,
                    lhs: None,
                };
                cfg.blocks[src.0].has_revert = true;
            }
        }
    }

    if !extended {
        finished.push(path);
    }

    Ok(finished
        .into_iter()
        .filter(|p| {
            !p.illegal
                && !p
                    .blocks
                    .iter()
                    .any(|b| cfg.block(b.evm_block).has_revert)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::disassemble;
    use crate::explorer::{resolve_dynamic_edges, ExploreLimits};

    fn lift_one(hex_str: &str) -> (Cfg, TacPath) {
        let mut cfg = Cfg::from_ops(disassemble(hex_str));
        cfg.resolve_static_edges();
        resolve_dynamic_edges(&mut cfg, ExploreLimits::default());
        assert!(!cfg.paths.is_empty(), "no feasible path");
        let evm_path = cfg.paths[0].clone();
        let paths = transform_path(&mut cfg, &evm_path, None).unwrap();
        assert_eq!(paths.len(), 1);
        let path = paths.into_iter().next().unwrap();
        (cfg, path)
    }

    #[test]
    fn push_becomes_const_assignment() {
        let (_, path) = lift_one("6001600255");
        let kinds: Vec<Opcode> = path.ops.iter().map(|op| op.opcode).collect();
        assert_eq!(kinds, vec![Opcode::CONST, Opcode::CONST, Opcode::SSTORE]);
        let sstore = &path.ops[2];
        assert_eq!(path.pool.const_value(sstore.args[0]), Some(U256::from(2)));
        assert_eq!(path.pool.const_value(sstore.args[1]), Some(U256::one()));
    }

    #[test]
    fn every_lifted_variable_has_one_def_site() {
        let (_, path) = lift_one("60016002016000525900");
        for op in &path.ops {
            if let Some(lhs) = op.lhs {
                assert_eq!(path.pool.get(lhs).def_site, Some(op.loc));
            }
        }
    }

    #[test]
    fn constant_arithmetic_folds() {
        // PUSH1 2; PUSH1 3; ADD; PUSH1 0; SSTORE
        let (_, path) = lift_one("6002600301600055");
        let sstore = path.ops.iter().find(|op| op.opcode == Opcode::SSTORE).unwrap();
        assert_eq!(path.pool.const_value(sstore.args[1]), Some(U256::from(5)));
    }

    #[test]
    fn log_is_canonicalized() {
        // PUSH1 0; PUSH1 0; LOG0
        let (_, path) = lift_one("60006000a000");
        assert!(path.ops.iter().any(|op| op.opcode == Opcode::LOG));
        assert!(path.ops.iter().all(|op| op.opcode != Opcode::LOG0));
    }

    #[test]
    fn mstore_mload_roundtrip_links_value() {
        // PUSH1 7; PUSH1 0; MSTORE; PUSH1 0; MLOAD; PUSH1 0; SSTORE
        let (_, path) = lift_one("600760005260005160005500");
        let sstore = path.ops.iter().find(|op| op.opcode == Opcode::SSTORE).unwrap();
        assert_eq!(path.pool.const_value(sstore.args[1]), Some(U256::from(7)));
    }

    #[test]
    fn returndatasize_is_zero_before_any_call() {
        let (_, path) = lift_one("3d60005500");
        let sstore = path.ops.iter().find(|op| op.opcode == Opcode::SSTORE).unwrap();
        assert_eq!(path.pool.const_value(sstore.args[1]), Some(U256::zero()));
    }

    #[test]
    fn contradicted_constant_branch_is_illegal() {
        // PUSH1 0 (cond); PUSH1 8 (dest); JUMPI; STOP; 8: JUMPDEST; STOP
        // cond is 0, so taking the jump contradicts it.
        let mut cfg = Cfg::from_ops(disassemble("60006008570000005b00"));
        cfg.resolve_static_edges();
        resolve_dynamic_edges(&mut cfg, ExploreLimits::default());
        // Find the path that takes the jump to 8.
        let jumping = cfg
            .paths
            .iter()
            .find(|p| p.key(&cfg).contains(&8))
            .cloned();
        if let Some(evm_path) = jumping {
            let lifted = transform_path(&mut cfg, &evm_path, None).unwrap();
            assert!(lifted.is_empty());
        }
    }
}
