//! Expression trees.
//!
//! A lifted variable's value is reconstructed as a tree by following its
//! unique definition site backwards through the TAC stream. Nodes live in
//! an arena and point both down (`sons`) and up (`father`); in-place
//! rewrites allocate a new node and patch the father's son slot.
//!
//! Every node carries `cstates`, the OR of the semantic checks the subtree
//! performs (reads storage, inspects the caller, tests a call's return
//! value, …) — condition classification in the extractor is driven
//! entirely by these bits.

use bitflags::bitflags;
use ethereum_types::U256;

use sema_lift::memory::{CellValue, DynamicCell, MemValue, Word};
use sema_lift::opcodes::Opcode;
use sema_lift::tac::TacPath;
use sema_lift::value::{Loc, VarBinding, VarId, VarKind};

use crate::sha3::Sha3Table;
use crate::vars::EvmVar;

/// Handle to a node in a [`TreeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeId(pub u32);

bitflags! {
    /// Semantic checks a subtree performs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CStates: u16 {
        const ON_SLOAD = 1 << 0;
        const ON_CALLER = 1 << 1;
        const ON_CALLVALUE = 1 << 2;
        const ON_EXTCODESIZE = 1 << 3;
        const ON_CALLDATASIZE = 1 << 4;
        const ON_CALLS = 1 << 5;
        const ON_CREATES = 1 << 6;
        const ON_SELFDESTRUCT = 1 << 7;
        const ON_CALLRETURN = 1 << 8;
    }
}

/// What a node stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// A 256-bit constant.
    Const(U256),
    /// An EVM operation (`ADD`, `SLOAD`, `CALLER`, …).
    Op(Opcode),
    /// An opaque external memory source, labeled `<OP>@pc`.
    Source { op: Opcode, pc: usize },
    /// An external call's return data, labeled `<OP>RETURN@pc`.
    CallReturn { op: Opcode, pc: usize },
    /// A value with no recoverable structure, kept by name.
    Opaque(String),
}

impl NodeKind {
    /// Label of the node alone, without its sons.
    pub fn label(&self) -> String {
        match self {
            NodeKind::Const(v) => format!("{v:#x}"),
            NodeKind::Op(op) => op.to_string(),
            NodeKind::Source { op, pc } => format!("{op}@{pc:#x}"),
            NodeKind::CallReturn { op, pc } => format!("{op}RETURN@{pc:#x}"),
            NodeKind::Opaque(name) => name.clone(),
        }
    }

    fn own_cstates(&self) -> CStates {
        match self {
            NodeKind::Op(Opcode::SLOAD) => CStates::ON_SLOAD,
            NodeKind::Op(Opcode::CALLER) => CStates::ON_CALLER,
            NodeKind::Op(Opcode::CALLVALUE) => CStates::ON_CALLVALUE,
            NodeKind::Op(Opcode::EXTCODESIZE) => CStates::ON_EXTCODESIZE,
            NodeKind::Op(Opcode::CALLDATASIZE) => CStates::ON_CALLDATASIZE,
            NodeKind::Op(op) if op.is_call() => CStates::ON_CALLS,
            NodeKind::Op(Opcode::CREATE | Opcode::CREATE2) => CStates::ON_CREATES,
            NodeKind::Op(Opcode::SELFDESTRUCT) => CStates::ON_SELFDESTRUCT,
            NodeKind::CallReturn { .. } => CStates::ON_CALLRETURN,
            _ => CStates::empty(),
        }
    }

    pub fn as_const(&self) -> Option<U256> {
        match self {
            NodeKind::Const(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_op(&self, op: Opcode) -> bool {
        matches!(self, NodeKind::Op(o) if *o == op)
    }
}

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub kind: NodeKind,
    pub sons: Vec<TreeId>,
    pub father: Option<TreeId>,
    pub cstates: CStates,
    /// Construction-time zero flag driving the safe peepholes.
    pub is_zero: bool,
    /// Location of the defining TAC op, for SSA-generation counting.
    pub loc: Option<Loc>,
    /// A known keccak256 constant was substituted somewhere below.
    pub with_optimized: bool,
    /// The storage/calldata/property meaning of this subtree, once the
    /// variable analyzer has recognized it.
    pub alias: Option<EvmVar>,
    pub contained_states: Vec<EvmVar>,
    pub contained_args: Vec<EvmVar>,
    pub contained_properties: Vec<EvmVar>,
}

/// Arena of expression-tree nodes, shared across all paths of one run.
#[derive(Debug, Clone, Default)]
pub struct TreeArena {
    nodes: Vec<TreeNode>,
    pub sha3_table: Sha3Table,
}

impl TreeArena {
    pub fn new(sha3_table: Sha3Table) -> Self {
        TreeArena {
            nodes: Vec::new(),
            sha3_table,
        }
    }

    pub fn node(&self, id: TreeId) -> &TreeNode {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: TreeId) -> &mut TreeNode {
        &mut self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Allocate a node, wiring fathers and folding `cstates` upwards.
    /// Constants found in the SHA3 side-table are substituted on the spot.
    pub fn add(&mut self, kind: NodeKind, sons: Vec<TreeId>) -> TreeId {
        if let NodeKind::Const(value) = &kind {
            if let Some((key, index)) = self.sha3_table.lookup(value) {
                let key_leaf = self.add(NodeKind::Const(key), Vec::new());
                let index_leaf = self.add(NodeKind::Const(index), Vec::new());
                let id = self.add(NodeKind::Op(Opcode::SHA3), vec![key_leaf, index_leaf]);
                self.node_mut(id).with_optimized = true;
                return id;
            }
        }

        let mut cstates = kind.own_cstates();
        let mut with_optimized = false;
        for son in &sons {
            cstates |= self.node(*son).cstates;
            with_optimized |= self.node(*son).with_optimized;
        }
        let is_zero = kind.as_const().is_some_and(|v| v.is_zero());
        let id = TreeId(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        self.nodes.push(TreeNode {
            kind,
            sons: sons.clone(),
            father: None,
            cstates,
            is_zero,
            loc: None,
            with_optimized,
            alias: None,
            contained_states: Vec::new(),
            contained_args: Vec::new(),
            contained_properties: Vec::new(),
        });
        for son in sons {
            self.node_mut(son).father = Some(id);
        }
        id
    }

    pub fn constant(&mut self, value: U256) -> TreeId {
        self.add(NodeKind::Const(value), Vec::new())
    }

    pub fn op(&mut self, op: Opcode, sons: Vec<TreeId>) -> TreeId {
        self.add(NodeKind::Op(op), sons)
    }

    /// Overwrite `dst` with the content of `src`, keeping `dst`'s identity
    /// and father. Sons of `src` are re-parented onto `dst`.
    pub fn overwrite(&mut self, dst: TreeId, src: TreeId) {
        let father = self.node(dst).father;
        let mut copy = self.node(src).clone();
        copy.father = father;
        let sons = copy.sons.clone();
        self.nodes[dst.0 as usize] = copy;
        for son in sons {
            self.node_mut(son).father = Some(dst);
        }
    }

    /// Replace the `idx`-th son of `father` with `new_son`.
    pub fn replace_son(&mut self, father: TreeId, idx: usize, new_son: TreeId) {
        let old = self.node(father).sons[idx];
        if old == new_son {
            return;
        }
        self.node_mut(father).sons[idx] = new_son;
        self.node_mut(new_son).father = Some(father);
    }

    pub fn const_of(&self, id: TreeId) -> Option<U256> {
        self.node(id).kind.as_const()
    }

    pub fn is_const(&self, id: TreeId) -> bool {
        self.const_of(id).is_some()
    }

    /// First direct son matching `pred`.
    pub fn find_son(&self, id: TreeId, pred: impl Fn(&TreeNode) -> bool) -> Option<TreeId> {
        self.node(id).sons.iter().copied().find(|s| pred(self.node(*s)))
    }

    /// First direct constant son.
    pub fn const_son(&self, id: TreeId) -> Option<TreeId> {
        self.find_son(id, |n| n.kind.as_const().is_some())
    }

    /// First direct son that is *not* a constant.
    pub fn non_const_son(&self, id: TreeId) -> Option<TreeId> {
        self.find_son(id, |n| n.kind.as_const().is_none())
    }

    /// All descendants (including `id`) whose kind matches `pred`,
    /// depth-first with the last son explored first. `stop_on_alias`
    /// refuses to descend below aliased nodes.
    pub fn collect(
        &self,
        id: TreeId,
        pred: impl Fn(&TreeNode) -> bool,
        stop_on_alias: bool,
    ) -> Vec<TreeId> {
        let mut found = Vec::new();
        let mut queue = vec![id];
        while let Some(current) = queue.pop() {
            let node = self.node(current);
            if pred(node) {
                found.push(current);
            }
            if stop_on_alias && node.alias.is_some() {
                continue;
            }
            queue.extend(node.sons.iter().copied());
        }
        found
    }

    pub fn collect_ops(&self, id: TreeId, op: Opcode) -> Vec<TreeId> {
        self.collect(id, |n| n.kind.is_op(op), false)
    }
}

// ─── Construction from def-use chains ───────────────────────────────────

/// What a pending construction step consumes.
#[derive(Debug, Clone)]
enum Operand {
    Const(U256),
    Var(VarId),
    Cell(DynamicCell),
}

impl Operand {
    fn from_mem(value: &MemValue) -> Operand {
        match value {
            MemValue::Var(v) => Operand::Var(*v),
            MemValue::Cell(cell) => Operand::Cell(cell.clone()),
        }
    }

    fn from_word(word: Word) -> Operand {
        match word {
            Word::Const(v) => Operand::Const(v),
            Word::Var(v) => Operand::Var(v),
        }
    }
}

#[derive(Debug)]
enum Task {
    Expand(Operand),
    Reduce {
        kind: NodeKind,
        n_sons: usize,
        loc: Option<Loc>,
        /// Apply the constant-propagation peepholes of the source opcode.
        peephole: Option<Opcode>,
    },
}

/// Build the expression tree of `var` by walking definition sites, with an
/// explicit work stack — deep bytecode routinely produces trees far past
/// any sane recursion depth.
///
/// `need_opposite` is set when the `JUMPI` fallthrough is taken: the tree
/// is wrapped in `ISZERO` (or an outer `ISZERO` is peeled).
pub fn tree_from_var(
    arena: &mut TreeArena,
    path: &TacPath,
    var: VarId,
    need_opposite: bool,
) -> TreeId {
    let mut tasks = vec![Task::Expand(Operand::Var(var))];
    let mut results: Vec<TreeId> = Vec::new();

    while let Some(task) = tasks.pop() {
        match task {
            Task::Reduce {
                kind,
                n_sons,
                loc,
                peephole,
            } => {
                let sons: Vec<TreeId> = results.split_off(results.len() - n_sons);
                let id = match peephole {
                    Some(op) => reduce_with_peephole(arena, op, sons),
                    None => arena.add(kind, sons),
                };
                if arena.node(id).loc.is_none() {
                    arena.node_mut(id).loc = loc;
                }
                results.push(id);
            }
            Task::Expand(operand) => expand(arena, path, operand, &mut tasks, &mut results),
        }
    }

    let root = results.pop().unwrap_or_else(|| arena.constant(U256::zero()));

    if !need_opposite {
        arena.node_mut(root).is_zero = false;
        root
    } else if arena.node(root).kind.is_op(Opcode::ISZERO) {
        arena.node(root).sons.first().copied().unwrap_or(root)
    } else {
        let loc = arena.node(root).loc;
        let wrapped = arena.op(Opcode::ISZERO, vec![root]);
        arena.node_mut(wrapped).loc = loc;
        wrapped
    }
}

fn expand(
    arena: &mut TreeArena,
    path: &TacPath,
    operand: Operand,
    tasks: &mut Vec<Task>,
    results: &mut Vec<TreeId>,
) {
    match operand {
        Operand::Const(value) => {
            let id = arena.constant(value);
            results.push(id);
        }
        Operand::Cell(cell) => expand_cell(arena, path, cell, None, false, tasks, results),
        Operand::Var(var) => {
            let pool = &path.pool;
            let resolved = pool.resolve(var);
            if let Some(value) = pool.const_value(resolved) {
                let id = arena.constant(value);
                results.push(id);
                return;
            }
            let data = pool.get(resolved);
            match (&data.kind, &data.binding, data.def_site) {
                // A value loaded from memory that resolved to a slice.
                (_, VarBinding::Cell(cell), def) => {
                    let loc = def.map(|d| path.op(d).loc);
                    expand_cell(arena, path, (**cell).clone(), loc, true, tasks, results);
                }
                (VarKind::DataCopy { op, pc }, _, _) => {
                    let id = arena.add(NodeKind::Source { op: *op, pc: *pc }, Vec::new());
                    results.push(id);
                }
                (VarKind::CallReturn { op, pc }, _, _) => {
                    let id = arena.add(NodeKind::CallReturn { op: *op, pc: *pc }, Vec::new());
                    results.push(id);
                }
                (_, _, Some(def)) => expand_defined(arena, path, def, tasks, results),
                _ => {
                    // No definition and no structure: keep the name.
                    let id = arena.add(NodeKind::Opaque(pool.name(resolved)), Vec::new());
                    results.push(id);
                }
            }
        }
    }
}

/// Expand a variable through its defining TAC op.
fn expand_defined(
    arena: &mut TreeArena,
    path: &TacPath,
    def: Loc,
    tasks: &mut Vec<Task>,
    results: &mut Vec<TreeId>,
) {
    let inst = path.op(def);
    match inst.opcode {
        Opcode::CONST => {
            let value = inst
                .lhs
                .and_then(|lhs| path.pool.const_value(lhs))
                .unwrap_or_default();
            let id = arena.constant(value);
            results.push(id);
        }
        Opcode::MLOAD => {
            // The binding-based shortcut handles resolved loads; reaching
            // here means the load stayed opaque, so keep the MLOAD node.
            let operand = inst
                .args
                .first()
                .map(|a| Operand::Var(*a))
                .unwrap_or(Operand::Const(U256::zero()));
            tasks.push(Task::Reduce {
                kind: NodeKind::Op(Opcode::MLOAD),
                n_sons: 1,
                loc: Some(inst.loc),
                peephole: None,
            });
            tasks.push(Task::Expand(operand));
        }
        opcode => {
            let operands: Vec<Operand> = if !inst.values.is_empty() {
                let values = if opcode == Opcode::SHA3 {
                    &inst.values[2.min(inst.values.len())..]
                } else {
                    &inst.values[..]
                };
                values.iter().map(Operand::from_mem).collect()
            } else {
                inst.args.iter().map(|a| Operand::Var(*a)).collect()
            };
            tasks.push(Task::Reduce {
                kind: NodeKind::Op(opcode),
                n_sons: operands.len(),
                loc: Some(inst.loc),
                peephole: opcode.is_arithmetic().then_some(opcode),
            });
            // Reversed so the first operand completes first.
            for operand in operands.into_iter().rev() {
                tasks.push(Task::Expand(operand));
            }
        }
    }
}

/// Expand a memory slice. Loads keep the slice window as sons; plain value
/// operands drop a constant window and dig into the value.
fn expand_cell(
    arena: &mut TreeArena,
    path: &TacPath,
    cell: DynamicCell,
    loc: Option<Loc>,
    as_load: bool,
    tasks: &mut Vec<Task>,
    results: &mut Vec<TreeId>,
) {
    let pool = &path.pool;
    if let Some(value) = cell.const_value(pool) {
        let id = arena.constant(value);
        results.push(id);
        return;
    }

    // Find the innermost source of nested copies.
    let mut innermost = &cell;
    while let CellValue::Slice(inner) = &innermost.value {
        innermost = inner;
    }
    let CellValue::Var(source) = &innermost.value else {
        unreachable!()
    };
    let source = *source;

    let window_const = cell.offset.const_value(pool).is_some()
        && cell.length.const_value(pool).is_some();

    if !as_load && window_const {
        // Constant window over a plain value: the value itself.
        tasks.push(Task::Expand(Operand::Var(source)));
        return;
    }

    let source_kind = match &pool.get(pool.resolve(source)).kind {
        VarKind::DataCopy { op, pc } => Some(NodeKind::Source { op: *op, pc: *pc }),
        VarKind::CallReturn { op, pc } => Some(NodeKind::CallReturn { op: *op, pc: *pc }),
        _ => None,
    };
    match source_kind {
        Some(kind) => {
            tasks.push(Task::Reduce {
                kind,
                n_sons: 2,
                loc,
                peephole: None,
            });
            tasks.push(Task::Expand(Operand::from_word(innermost.length)));
            tasks.push(Task::Expand(Operand::from_word(innermost.offset)));
        }
        None => {
            // A windowed view of an ordinary value: dig into the value.
            tasks.push(Task::Expand(Operand::Var(source)));
        }
    }
}

/// The always-safe constant-propagation peepholes applied at construction:
/// `ADD x 0 → x`, `SUB x 0 → x`, `MUL 0 _ → 0`, `DIV 0 _ → 0`.
fn reduce_with_peephole(arena: &mut TreeArena, op: Opcode, sons: Vec<TreeId>) -> TreeId {
    if sons.len() == 2 {
        let zero0 = arena.node(sons[0]).is_zero;
        let zero1 = arena.node(sons[1]).is_zero;
        match op {
            Opcode::DIV if zero0 => return arena.constant(U256::zero()),
            Opcode::MUL if zero0 || zero1 => return arena.constant(U256::zero()),
            Opcode::ADD if zero0 => return sons[1],
            Opcode::ADD | Opcode::SUB if zero1 => return sons[0],
            _ => {}
        }
    }
    arena.op(op, sons)
}

/// Normalize a guard to a boolean-rooted shape: trees not already rooted at
/// a comparison get wrapped in `ISZERO ISZERO`, preserving the contained
/// variable lists on the new root.
pub fn expanded_condition_tree(arena: &mut TreeArena, tree: TreeId) -> TreeId {
    let node = arena.node(tree);
    let boolean_root = matches!(
        &node.kind,
        NodeKind::Op(
            Opcode::GT
                | Opcode::ISZERO
                | Opcode::EQ
                | Opcode::LT
                | Opcode::SLT
                | Opcode::SGT
                | Opcode::XOR
        )
    );
    if node.alias.is_none() && boolean_root {
        return tree;
    }
    let contained_states = node.contained_states.clone();
    let contained_args = node.contained_args.clone();
    let contained_properties = node.contained_properties.clone();
    let inner = arena.op(Opcode::ISZERO, vec![tree]);
    let outer = arena.op(Opcode::ISZERO, vec![inner]);
    let root = arena.node_mut(outer);
    root.contained_states = contained_states;
    root.contained_args = contained_args;
    root.contained_properties = contained_properties;
    outer
}

#[cfg(test)]
mod tests {
    use super::*;
    use sema_lift::cfg::Cfg;
    use sema_lift::destack::transform_path;
    use sema_lift::disasm::disassemble;
    use sema_lift::explorer::{resolve_dynamic_edges, ExploreLimits};
    use sema_lift::value::fold;

    fn lift(hex_str: &str) -> (Cfg, TacPath) {
        let mut cfg = Cfg::from_ops(disassemble(hex_str));
        cfg.resolve_static_edges();
        resolve_dynamic_edges(&mut cfg, ExploreLimits::default());
        let evm_path = cfg.paths[0].clone();
        let paths = transform_path(&mut cfg, &evm_path, None).unwrap();
        (cfg, paths.into_iter().next().unwrap())
    }

    #[test]
    fn cstates_propagate_upwards() {
        // CALLER; SLOAD(0): EQ reads both
        // PUSH1 0; SLOAD; CALLER; EQ; PUSH1 0; SSTORE (index 0, value = eq)
        let (_, path) = lift("600054331460005500");
        let sstore = path
            .ops
            .iter()
            .find(|op| op.opcode == Opcode::SSTORE)
            .unwrap();
        let mut arena = TreeArena::default();
        let tree = tree_from_var(&mut arena, &path, sstore.args[1], false);
        let cstates = arena.node(tree).cstates;
        assert!(cstates.contains(CStates::ON_SLOAD));
        assert!(cstates.contains(CStates::ON_CALLER));
        assert!(!cstates.contains(CStates::ON_CALLVALUE));
        // invariant: root cstates == own | OR(sons)
        let node = arena.node(tree);
        let mut expected = node.kind.own_cstates();
        for son in &node.sons {
            expected |= arena.node(*son).cstates;
        }
        assert_eq!(node.cstates, expected);
    }

    #[test]
    fn need_opposite_wraps_and_peels() {
        // ISZERO(CALLVALUE) as a JUMPI condition
        // CALLVALUE; ISZERO; PUSH1 7; JUMPI; STOP; STOP; 7: JUMPDEST; STOP
        let (_, path) = lift("341560075700005b00");
        let jumpi = path
            .ops
            .iter()
            .find(|op| op.opcode == Opcode::JUMPI)
            .unwrap();
        let mut arena = TreeArena::default();
        // Opposite of ISZERO(x) peels back to x.
        let peeled = tree_from_var(&mut arena, &path, jumpi.args[1], true);
        assert!(arena.node(peeled).kind.is_op(Opcode::CALLVALUE));
        // Plain build keeps the ISZERO.
        let kept = tree_from_var(&mut arena, &path, jumpi.args[1], false);
        assert!(arena.node(kept).kind.is_op(Opcode::ISZERO));
    }

    #[test]
    fn safe_peepholes_apply() {
        let mut arena = TreeArena::default();
        let zero = arena.constant(U256::zero());
        let x = arena.op(Opcode::CALLER, Vec::new());
        assert_eq!(reduce_with_peephole(&mut arena, Opcode::ADD, vec![zero, x]), x);
        let folded = reduce_with_peephole(&mut arena, Opcode::MUL, vec![zero, x]);
        assert_eq!(arena.const_of(folded), Some(U256::zero()));
        let kept = reduce_with_peephole(&mut arena, Opcode::SUB, vec![x, x]);
        assert!(arena.node(kept).kind.is_op(Opcode::SUB));
    }

    #[test]
    fn sha3_constants_are_substituted() {
        let mut table = Sha3Table::default();
        let hash = crate::sha3::mapping_slot_hash(U256::from(3), U256::from(1));
        table.insert(hash, U256::from(3), U256::from(1));
        let mut arena = TreeArena::new(table);
        let id = arena.constant(hash);
        let node = arena.node(id);
        assert!(node.kind.is_op(Opcode::SHA3));
        assert!(node.with_optimized);
        assert_eq!(arena.const_of(node.sons[0]), Some(U256::from(3)));
        assert_eq!(arena.const_of(node.sons[1]), Some(U256::from(1)));
    }

    #[test]
    fn folding_matches_reference_semantics() {
        // Deep chain: ((1 + 2) * 3) via bytecode constant folding equals fold()
        let (_, path) = lift("600160020160030260005500");
        let sstore = path
            .ops
            .iter()
            .find(|op| op.opcode == Opcode::SSTORE)
            .unwrap();
        let expect = fold(
            Opcode::MUL,
            &[U256::from(3), fold(Opcode::ADD, &[U256::from(2), U256::one()]).unwrap()],
        )
        .unwrap();
        assert_eq!(path.pool.const_value(sstore.args[1]), Some(expect));
    }
}
