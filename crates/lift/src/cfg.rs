//! Basic blocks and the control-flow graph.
//!
//! Blocks are split at flow-altering operations and before `JUMPDEST`s.
//! Static edges come from `PUSH; JUMP[I]` pairs and fallthroughs; dynamic
//! edges are added by the explorer as it resolves computed destinations.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::disasm::Operation;
use crate::opcodes::Opcode;

/// Index of a block inside its [`Cfg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

/// A contiguous run of operations with single entry and single exit.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// Program counter of the first operation.
    pub entry: usize,
    /// Program counter of the last operation.
    pub exit: usize,
    pub ops: Vec<Operation>,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    /// The false branch of a closing `JUMPI`, also present in `succs`.
    pub fallthrough: Option<BlockId>,
    pub has_state_affecting_op: bool,
    pub has_invalid: bool,
    pub has_revert: bool,
    /// Some successor contains an `INVALID`.
    pub falls_to_invalid: bool,
    /// Some successor contains a `REVERT`.
    pub falls_to_revert: bool,
}

impl BasicBlock {
    fn new(entry: usize) -> Self {
        BasicBlock {
            entry,
            exit: entry,
            ops: Vec::new(),
            preds: Vec::new(),
            succs: Vec::new(),
            fallthrough: None,
            has_state_affecting_op: false,
            has_invalid: false,
            has_revert: false,
            falls_to_invalid: false,
            falls_to_revert: false,
        }
    }

    pub fn last_op(&self) -> &Operation {
        // A block always holds at least one operation by construction.
        self.ops.last().unwrap_or_else(|| unreachable!())
    }

    /// Entry program counter; doubles as the block's stable identity.
    pub fn ident(&self) -> usize {
        self.entry
    }
}

/// How a `JUMPI` guard stops applying further down the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSpec {
    /// The guard protects an abort; it holds for the rest of the path.
    Stay,
    /// The guard's block repeats before joining: a self-loop.
    SelfLoop,
    /// The guard is popped when the path reaches this block entry.
    Exit(usize),
}

/// The contract's control-flow graph.
#[derive(Debug, Clone, Default)]
pub struct Cfg {
    pub blocks: Vec<BasicBlock>,
    /// Block entry pc → block.
    pub by_entry: FxHashMap<usize, BlockId>,
    pub root: Option<BlockId>,
    /// Feasible paths collected by the explorer, root to normal halt.
    pub paths: Vec<EvmPath>,
}

impl Cfg {
    /// Split an operation stream into basic blocks and index them.
    pub fn from_ops(ops: Vec<Operation>) -> Cfg {
        let mut blocks: Vec<BasicBlock> = Vec::new();
        let mut current: Option<BasicBlock> = None;

        for op in ops {
            // JUMPDEST opens a block unless it is already first.
            if op.opcode == Opcode::JUMPDEST {
                if let Some(block) = current.take() {
                    if !block.ops.is_empty() {
                        blocks.push(block);
                    }
                }
            }
            let block = current.get_or_insert_with(|| BasicBlock::new(op.pc));
            block.exit = op.pc;
            if op.opcode.affects_state() {
                block.has_state_affecting_op = true;
            }
            if op.opcode == Opcode::INVALID {
                block.has_invalid = true;
            }
            if op.opcode == Opcode::REVERT {
                block.has_revert = true;
            }
            let closes = op.opcode.alters_flow();
            block.ops.push(op);
            if closes {
                blocks.push(current.take().unwrap_or_else(|| unreachable!()));
            }
        }
        if let Some(block) = current {
            if !block.ops.is_empty() {
                blocks.push(block);
            }
        }

        let mut by_entry = FxHashMap::default();
        for (i, block) in blocks.iter().enumerate() {
            by_entry.insert(block.entry, BlockId(i));
        }
        let root = by_entry.get(&0).copied();
        Cfg {
            blocks,
            by_entry,
            root,
            paths: Vec::new(),
        }
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0]
    }

    /// Look up a jump destination; only blocks opening with `JUMPDEST`
    /// qualify.
    pub fn jump_dest(&self, pc: usize) -> Option<BlockId> {
        let id = *self.by_entry.get(&pc)?;
        (self.blocks[id.0].ops[0].opcode == Opcode::JUMPDEST).then_some(id)
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        if !self.blocks[from.0].succs.contains(&to) {
            self.blocks[from.0].succs.push(to);
        }
        if !self.blocks[to.0].preds.contains(&from) {
            self.blocks[to.0].preds.push(from);
        }
    }

    /// Add the edges derivable without symbolic execution: `PUSH; JUMP[I]`
    /// destinations and fallthroughs.
    pub fn resolve_static_edges(&mut self) {
        let last_entry = self.blocks.iter().map(|b| b.entry).max();
        for id in 0..self.blocks.len() {
            let id = BlockId(id);
            let block = &self.blocks[id.0];
            let last = block.last_op().clone();
            match last.opcode {
                Opcode::JUMP => {
                    if let Some(dest) = self.pushed_dest(id) {
                        self.add_edge(id, dest);
                    }
                }
                Opcode::JUMPI => {
                    if let Some(fall) = self.by_entry.get(&(last.pc + 1)).copied() {
                        self.add_edge(id, fall);
                        self.blocks[id.0].fallthrough = Some(fall);
                    }
                    if let Some(dest) = self.pushed_dest(id) {
                        self.add_edge(id, dest);
                    }
                }
                op if op.halts() => {}
                _ if Some(block.entry) == last_entry => {}
                op => {
                    let next_pc = last.pc + 1 + op.push_width();
                    if let Some(fall) = self.by_entry.get(&next_pc).copied() {
                        self.add_edge(id, fall);
                        self.blocks[id.0].fallthrough = Some(fall);
                    }
                }
            }
        }
    }

    /// Destination named by a `PUSH` immediately preceding the closing
    /// jump, when it lands on a `JUMPDEST`.
    fn pushed_dest(&self, id: BlockId) -> Option<BlockId> {
        let block = &self.blocks[id.0];
        if block.ops.len() < 2 {
            return None;
        }
        let prev = &block.ops[block.ops.len() - 2];
        if !prev.opcode.is_push() {
            return None;
        }
        let dest = usize::try_from(prev.imm?).ok()?;
        self.jump_dest(dest)
    }

    /// Propagate revert/invalid reachability one edge backwards.
    pub fn update_fallthrough_kinds(&mut self) {
        let mut updates = Vec::new();
        for (i, block) in self.blocks.iter().enumerate() {
            let mut invalid = false;
            let mut revert = false;
            for succ in &block.succs {
                invalid |= self.blocks[succ.0].has_invalid;
                revert |= self.blocks[succ.0].has_revert;
            }
            updates.push((i, invalid, revert));
        }
        for (i, invalid, revert) in updates {
            self.blocks[i].falls_to_invalid = invalid;
            self.blocks[i].falls_to_revert = revert;
        }
    }

    /// For every `JUMPI` block, find where its condition stops applying:
    /// the first block common to every continuation of the guard, looking
    /// at most `lookahead` blocks ahead on each visiting path.
    pub fn resolve_exit_blocks(&self, paths: &[EvmPath], lookahead: usize) -> FxHashMap<usize, ExitSpec> {
        let mut exits: FxHashMap<usize, ExitSpec> = FxHashMap::default();
        let mut chains: FxHashMap<usize, Vec<Vec<usize>>> = FxHashMap::default();
        let mut seen_chains: FxHashSet<(usize, Vec<usize>)> = FxHashSet::default();

        let mut ordered: Vec<&EvmPath> = paths.iter().collect();
        ordered.sort_by_key(|p| p.blocks.len());

        for path in ordered {
            for (idx, &block_id) in path.blocks.iter().enumerate() {
                let block = self.block(block_id);
                if block.last_op().opcode != Opcode::JUMPI {
                    continue;
                }
                let ident = block.ident();
                if block.falls_to_revert || block.falls_to_invalid {
                    exits.insert(ident, ExitSpec::Stay);
                    continue;
                }
                let mut chain = Vec::new();
                let mut self_loop = false;
                let horizon = (idx + lookahead).min(path.blocks.len());
                for &succ in &path.blocks[idx + 1..horizon] {
                    let succ_ident = self.block(succ).ident();
                    if succ_ident == ident {
                        exits.insert(ident, ExitSpec::SelfLoop);
                        self_loop = true;
                        break;
                    }
                    chain.push(succ_ident);
                }
                if !self_loop && seen_chains.insert((ident, chain.clone())) {
                    chains.entry(ident).or_default().push(chain);
                }
            }
        }

        for (ident, chain_list) in chains {
            if chain_list.len() < 2 {
                continue;
            }
            let mut common: FxHashSet<usize> = chain_list[0].iter().copied().collect();
            for chain in &chain_list[1..] {
                let set: FxHashSet<usize> = chain.iter().copied().collect();
                common.retain(|b| set.contains(b));
            }
            if let Some(join) = chain_list[0].iter().find(|b| common.contains(b)) {
                exits.insert(ident, ExitSpec::Exit(*join));
            }
        }

        exits
    }
}

/// A sequence of blocks from the CFG root to a normal halt, with the
/// per-edge traversal counts that bound loop unrolling.
#[derive(Debug, Clone, Default)]
pub struct EvmPath {
    pub blocks: Vec<BlockId>,
    pub edge_count: FxHashMap<(BlockId, BlockId), u32>,
    pub from_transaction: bool,
}

impl EvmPath {
    pub fn new(first: BlockId) -> Self {
        EvmPath {
            blocks: vec![first],
            edge_count: FxHashMap::default(),
            from_transaction: false,
        }
    }

    /// Append a block, honoring the per-edge repetition bound. Returns
    /// false when the edge has already been unrolled `repeat_max` times.
    pub fn push_block(&mut self, block: BlockId, repeat_max: u32) -> bool {
        if let Some(&last) = self.blocks.last() {
            let count = self.edge_count.entry((last, block)).or_insert(0);
            if *count + 1 > repeat_max {
                return false;
            }
            *count += 1;
        }
        self.blocks.push(block);
        true
    }

    /// Stable identity of the path: its block entry sequence.
    pub fn key(&self, cfg: &Cfg) -> Vec<usize> {
        self.blocks.iter().map(|b| cfg.block(*b).ident()).collect()
    }

    pub fn has_state_affecting_op(&self, cfg: &Cfg) -> bool {
        self.blocks
            .iter()
            .any(|b| cfg.block(*b).has_state_affecting_op)
    }

    pub fn has_revert(&self, cfg: &Cfg) -> bool {
        self.blocks.iter().any(|b| cfg.block(*b).has_revert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::disassemble;

    #[test]
    fn blocks_close_on_flow_and_open_on_jumpdest() {
        // 0: PUSH1 8; 2: PUSH1 1; 4: JUMPI; 5: STOP; 6: JUMPDEST; 7: STOP
        let cfg = Cfg::from_ops(disassemble("6008600157005b00"));
        let entries: Vec<usize> = cfg.blocks.iter().map(|b| b.entry).collect();
        assert_eq!(entries, vec![0, 5, 6]);
        for block in &cfg.blocks {
            assert_eq!(block.ops[0].pc, block.entry);
        }
    }

    #[test]
    fn block_closure_property() {
        let cfg = Cfg::from_ops(disassemble("600160025560035b600455"));
        let total_ops: usize = cfg.blocks.iter().map(|b| b.ops.len()).sum();
        assert_eq!(total_ops, 7);
        let last_pc = cfg.blocks.last().unwrap().last_op().pc;
        for block in &cfg.blocks {
            let last = block.last_op();
            assert!(
                last.opcode.alters_flow() || last.pc == last_pc,
                "block at {:#x} neither alters flow nor ends the contract",
                block.entry
            );
        }
    }

    #[test]
    fn static_jump_edge_requires_jumpdest() {
        // 0: PUSH1 4; 2: JUMP; 3: STOP; 4: JUMPDEST; 5: STOP
        let mut cfg = Cfg::from_ops(disassemble("600456005b00"));
        cfg.resolve_static_edges();
        let root = cfg.root.unwrap();
        let dest = cfg.jump_dest(4).unwrap();
        assert_eq!(cfg.block(root).succs, vec![dest]);

        // jump into the middle of a push immediate resolves nowhere
        let mut cfg = Cfg::from_ops(disassemble("600156"));
        cfg.resolve_static_edges();
        assert!(cfg.block(cfg.root.unwrap()).succs.is_empty());
    }

    #[test]
    fn jumpi_gets_fallthrough_and_target() {
        // 0: PUSH1 0x08; 2: PUSH1 1; 4: JUMPI; 5..7: STOP; 8: JUMPDEST; 9: STOP
        let mut cfg = Cfg::from_ops(disassemble("60086001570000005b00"));
        cfg.resolve_static_edges();
        let root = cfg.root.unwrap();
        let block = cfg.block(root);
        assert_eq!(block.succs.len(), 2);
        let fall = block.fallthrough.unwrap();
        assert_eq!(cfg.block(fall).entry, 5);
    }

    #[test]
    fn path_edge_budget() {
        let mut path = EvmPath::new(BlockId(0));
        assert!(path.push_block(BlockId(1), 2));
        path.blocks.truncate(1);
        assert!(path.push_block(BlockId(1), 2));
        path.blocks.truncate(1);
        assert!(!path.push_block(BlockId(1), 2));
    }
}
