//! Dynamic jump resolution and path enumeration.
//!
//! A breadth-first worklist walks `(path, depth)` pairs, executing each
//! block on a light symbolic stack whose only job is to keep jump
//! destinations concrete: `PUSH`/`DUP`/`SWAP`/`POP`/`PC` and `AND` are
//! modeled precisely, everything else clobbers its results to unknown.
//! Resolved destinations become CFG edges; paths that reach a normal halt
//! are collected for lifting.

use ethereum_types::U256;
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::cfg::{BlockId, Cfg, EvmPath};
use crate::disasm::Operation;
use crate::opcodes::Opcode;

/// Exploration budgets. The defaults match the analysis-wide caps: a path
/// may traverse each directed edge at most `loop_uncover_times` times, hold
/// at most `loop_depth` blocks, and the whole walk visits at most
/// `block_limit` blocks.
#[derive(Debug, Clone, Copy)]
pub struct ExploreLimits {
    pub loop_uncover_times: u32,
    pub loop_depth: usize,
    pub block_limit: usize,
}

impl Default for ExploreLimits {
    fn default() -> Self {
        ExploreLimits {
            loop_uncover_times: 16,
            loop_depth: 256,
            block_limit: 200_000,
        }
    }
}

/// The light stack: concrete entries where resolvable, `None` elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LightStack {
    items: Vec<Option<U256>>,
}

/// Raised when the light stack over- or under-flows; the current worklist
/// entry is dropped.
#[derive(Debug)]
pub(crate) struct LightStackFault;

impl LightStack {
    const MAX_SIZE: usize = 1024;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn peek(&self) -> Option<U256> {
        self.items.last().copied().flatten()
    }

    fn pop(&mut self) -> Result<Option<U256>, LightStackFault> {
        self.items.pop().ok_or(LightStackFault)
    }

    fn push(&mut self, value: Option<U256>) -> Result<(), LightStackFault> {
        self.items.push(value);
        if self.items.len() > Self::MAX_SIZE {
            return Err(LightStackFault);
        }
        Ok(())
    }

    pub(crate) fn execute(&mut self, op: &Operation) -> Result<(), LightStackFault> {
        let opcode = op.opcode;
        if opcode == Opcode::PC {
            self.push(Some(U256::from(op.pc)))?;
        } else if opcode.is_push() {
            self.push(Some(op.imm.unwrap_or_default()))?;
        } else if opcode.is_dup() {
            let depth = opcode.dup_depth();
            if depth > self.items.len() {
                return Err(LightStackFault);
            }
            let value = self.items[self.items.len() - depth];
            self.push(value)?;
        } else if opcode.is_swap() {
            let depth = opcode.swap_depth();
            if depth >= self.items.len() {
                return Err(LightStackFault);
            }
            let top = self.items.len() - 1;
            self.items.swap(top, top - depth);
        } else if opcode == Opcode::POP {
            self.pop()?;
        } else if opcode == Opcode::AND {
            let a = self.pop()?;
            let b = self.pop()?;
            let value = match (a, b) {
                (Some(a), Some(b)) => Some(a & b),
                _ => None,
            };
            self.push(value)?;
        } else {
            for _ in 0..opcode.pops() {
                self.pop()?;
            }
            for _ in 0..opcode.pushes() {
                self.push(None)?;
            }
        }
        Ok(())
    }
}

/// Walk the CFG from its root, resolving computed jumps and enumerating
/// maximal feasible paths. Newly resolved edges are added to `cfg`; the
/// collected paths land in `cfg.paths`.
pub fn resolve_dynamic_edges(cfg: &mut Cfg, limits: ExploreLimits) {
    let Some(root) = cfg.root else {
        return;
    };

    let mut queue: Vec<(EvmPath, LightStack, usize)> = vec![(EvmPath::new(root), LightStack::new(), 0)];
    let mut queue_head = 0usize;
    let mut visited: FxHashSet<(usize, usize, LightStack)> = FxHashSet::default();

    let mut block_count = 0usize;
    let mut stack_faults = 0usize;
    let mut depth_exceeded = 0usize;

    while queue_head < queue.len() {
        let (path, mut stack, depth) = queue[queue_head].clone();
        queue_head += 1;

        let current = *path.blocks.last().unwrap_or(&root);
        let block = cfg.block(current).clone();

        // Execute everything but the closing op, then peek for a computed
        // destination.
        let mut faulted = false;
        for op in &block.ops[..block.ops.len().saturating_sub(1)] {
            if stack.execute(op).is_err() {
                faulted = true;
                break;
            }
        }
        if faulted {
            stack_faults += 1;
            continue;
        }

        let last = block.last_op().clone();
        let mut jump_dest: Option<BlockId> = None;
        if last.opcode == Opcode::JUMP {
            if let Some(dest) = stack.peek().and_then(|d| usize::try_from(d).ok()) {
                if let Some(dest_block) = cfg.jump_dest(dest) {
                    cfg.add_edge(current, dest_block);
                    jump_dest = Some(dest_block);
                }
            }
        }

        block_count += 1;
        if block_count >= limits.block_limit {
            warn!(
                block_count,
                stack_faults, depth_exceeded, "explorer block budget exhausted"
            );
            break;
        }

        if stack.execute(&last).is_err() {
            stack_faults += 1;
            continue;
        }

        // A dead end over non-aborting successors means the path is maximal.
        let live_succs: Vec<BlockId> = cfg
            .block(current)
            .succs
            .iter()
            .copied()
            .filter(|s| !cfg.block(*s).last_op().opcode.halts_abnormally())
            .collect();
        if live_succs.is_empty() && !last.opcode.halts_abnormally() {
            cfg.paths.push(path.clone());
        }

        if depth >= limits.loop_depth {
            depth_exceeded += 1;
            continue;
        }

        if last.opcode != Opcode::JUMP {
            for succ in live_succs {
                let key = (block.ident(), cfg.block(succ).ident(), stack.clone());
                if visited.insert(key) {
                    let mut next = path.clone();
                    if next.push_block(succ, limits.loop_uncover_times) {
                        queue.push((next, stack.clone(), depth + 1));
                    }
                }
            }
        } else if let Some(dest) = jump_dest {
            let key = (block.ident(), cfg.block(dest).ident(), stack.clone());
            if visited.insert(key) {
                let mut next = path.clone();
                if next.push_block(dest, limits.loop_uncover_times) {
                    queue.push((next, stack, depth + 1));
                }
            }
        }
    }

    debug!(
        paths = cfg.paths.len(),
        block_count, stack_faults, depth_exceeded, "dynamic edge resolution finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::disassemble;

    fn explore(hex_str: &str) -> Cfg {
        let mut cfg = Cfg::from_ops(disassemble(hex_str));
        cfg.resolve_static_edges();
        resolve_dynamic_edges(&mut cfg, ExploreLimits::default());
        cfg
    }

    #[test]
    fn resolves_computed_jump_through_pop() {
        // 0: PUSH1 7; 2: PUSH1 0; 4: POP; 5: JUMP; 6: STOP; 7: JUMPDEST; 8: STOP
        let cfg = explore("600760005056005b00");
        let root = cfg.root.unwrap();
        let dest = cfg.jump_dest(7).unwrap();
        assert!(cfg.block(root).succs.contains(&dest));
        assert_eq!(cfg.paths.len(), 1);
        assert_eq!(cfg.paths[0].key(&cfg), vec![0, 7]);
    }

    #[test]
    fn and_is_modeled_precisely() {
        // 0: PUSH1 0xff; 2: PUSH1 7; 4: AND; 5: JUMP; 6: STOP; 7: JUMPDEST; 8: STOP
        let cfg = explore("60ff60071656005b00");
        let root = cfg.root.unwrap();
        let dest = cfg.jump_dest(7).unwrap();
        assert!(cfg.block(root).succs.contains(&dest));
    }

    #[test]
    fn jumpi_explores_both_branches() {
        // 0: PUSH1 0; 2: CALLDATALOAD; 3: PUSH1 8; 5: JUMPI; 6: STOP; 7: STOP; 8: JUMPDEST; 9: STOP
        let cfg = explore("60003560085700005b00");
        // Both the fallthrough and the target halt normally.
        assert_eq!(cfg.paths.len(), 2);
    }

    #[test]
    fn paths_to_revert_are_not_emitted() {
        // 0: PUSH1 0; 2: PUSH1 0; 4: REVERT
        let cfg = explore("60006000fd");
        assert!(cfg.paths.is_empty());
    }
}
