//! Path feasibility checking.
//!
//! Guards are translated into an integer-theory approximation — leaves
//! become integer terms keyed by their rendered text, 256-bit modular
//! arithmetic is treated as unbounded integers — and fed to a small
//! incremental checker tracking constant bindings, term equalities,
//! disequalities and interval bounds. The checker only ever answers
//! `Unsat` when it can prove a contradiction; anything it cannot decide is
//! feasible, which is the safe direction for pruning.
//!
//! Background knowledge: `TIMESTAMP > 0`, and every term is non-negative
//! (the unsigned value domain).

use ethereum_types::U256;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use sema_lift::opcodes::Opcode;
use sema_lift::value::fold;

use crate::render::{render_tree, render_var};
use crate::tree::{NodeKind, TreeArena, TreeId};
use crate::vars::VarRegistry;

/// Interned solver term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TermId(u32);

/// An expression in the integer approximation.
#[derive(Debug, Clone, PartialEq)]
pub enum SmtExpr {
    Const(U256),
    Term(TermId),
    Op(Opcode, Vec<SmtExpr>),
    /// Anything the translation gave up on.
    Opaque,
}

/// Checker verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Sat,
    Unsat,
}

#[derive(Debug, Clone, Default)]
struct Bounds {
    lo: Option<U256>,
    hi: Option<U256>,
}

/// The incremental feasibility checker for one path.
#[derive(Debug)]
pub struct PathChecker {
    terms: FxHashMap<String, TermId>,
    /// Union-find parents for term equalities.
    parents: Vec<TermId>,
    consts: FxHashMap<TermId, U256>,
    diseq: FxHashSet<(TermId, U256)>,
    bounds: FxHashMap<TermId, Bounds>,
    contradiction: bool,
    /// Path prefixes already proven infeasible, kept across resets.
    infeasible_prefixes: FxHashSet<String>,
    /// Renders of constraints already pushed, to keep asserts idempotent.
    pushed: FxHashSet<String>,
    /// Set on `add_constraint`; the extractor checks before the next
    /// behavior and clears it.
    pub after_add_constraints: bool,
}

impl Default for PathChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl PathChecker {
    pub fn new() -> Self {
        let mut checker = PathChecker {
            terms: FxHashMap::default(),
            parents: Vec::new(),
            consts: FxHashMap::default(),
            diseq: FxHashSet::default(),
            bounds: FxHashMap::default(),
            contradiction: false,
            infeasible_prefixes: FxHashSet::default(),
            pushed: FxHashSet::default(),
            after_add_constraints: false,
        };
        checker.push_background();
        checker
    }

    /// Drop all per-path state; the infeasible-prefix cache survives.
    pub fn reset(&mut self) {
        let prefixes = std::mem::take(&mut self.infeasible_prefixes);
        *self = PathChecker::new();
        self.infeasible_prefixes = prefixes;
    }

    fn push_background(&mut self) {
        let ts = self.term("TIMESTAMP");
        self.assert_lower_bound(ts, U256::one());
    }

    fn term(&mut self, name: &str) -> TermId {
        if let Some(id) = self.terms.get(name) {
            return *id;
        }
        let id = TermId(self.parents.len() as u32);
        self.parents.push(id);
        self.terms.insert(name.to_string(), id);
        id
    }

    fn find(&mut self, mut id: TermId) -> TermId {
        while self.parents[id.0 as usize] != id {
            let parent = self.parents[id.0 as usize];
            self.parents[id.0 as usize] = self.parents[parent.0 as usize];
            id = parent;
        }
        id
    }

    fn union(&mut self, a: TermId, b: TermId) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        match (self.consts.get(&ra).copied(), self.consts.get(&rb).copied()) {
            (Some(x), Some(y)) if x != y => {
                self.contradiction = true;
                return;
            }
            (Some(x), None) => {
                self.parents[rb.0 as usize] = ra;
                self.check_value_fits(rb, x);
            }
            _ => {
                self.parents[ra.0 as usize] = rb;
                if let Some(y) = self.consts.get(&rb).copied() {
                    self.check_value_fits(ra, y);
                }
            }
        }
    }

    fn check_value_fits(&mut self, id: TermId, value: U256) {
        if self.diseq.contains(&(id, value)) {
            self.contradiction = true;
        }
        if let Some(bounds) = self.bounds.get(&id) {
            if bounds.lo.is_some_and(|lo| value < lo) || bounds.hi.is_some_and(|hi| value > hi) {
                self.contradiction = true;
            }
        }
    }

    fn bind_const(&mut self, id: TermId, value: U256) {
        let root = self.find(id);
        match self.consts.get(&root).copied() {
            Some(existing) if existing != value => self.contradiction = true,
            Some(_) => {}
            None => {
                self.check_value_fits(root, value);
                self.check_value_fits(id, value);
                self.consts.insert(root, value);
            }
        }
    }

    fn assert_lower_bound(&mut self, id: TermId, lo: U256) {
        let root = self.find(id);
        if let Some(value) = self.consts.get(&root).copied() {
            if value < lo {
                self.contradiction = true;
            }
            return;
        }
        let entry = self.bounds.entry(root).or_default();
        if entry.lo.is_none_or(|old| lo > old) {
            entry.lo = Some(lo);
        }
        if entry.hi.is_some_and(|hi| hi < lo) {
            self.contradiction = true;
        }
    }

    fn assert_upper_bound(&mut self, id: TermId, hi: U256) {
        let root = self.find(id);
        if let Some(value) = self.consts.get(&root).copied() {
            if value > hi {
                self.contradiction = true;
            }
            return;
        }
        let entry = self.bounds.entry(root).or_default();
        if entry.hi.is_none_or(|old| hi < old) {
            entry.hi = Some(hi);
        }
        if entry.lo.is_some_and(|lo| lo > hi) {
            self.contradiction = true;
        }
    }

    fn assert_diseq(&mut self, id: TermId, value: U256) {
        let root = self.find(id);
        if self.consts.get(&root).copied() == Some(value) {
            self.contradiction = true;
            return;
        }
        self.diseq.insert((root, value));
    }

    // ─── Expression evaluation ─────────────────────────────────────────

    /// Partially evaluate: substitute bound constants and fold arithmetic.
    fn eval(&mut self, expr: &SmtExpr) -> SmtExpr {
        match expr {
            SmtExpr::Const(v) => SmtExpr::Const(*v),
            SmtExpr::Term(id) => {
                let root = self.find(*id);
                match self.consts.get(&root) {
                    Some(v) => SmtExpr::Const(*v),
                    None => SmtExpr::Term(root),
                }
            }
            SmtExpr::Op(op, args) => {
                let evaluated: Vec<SmtExpr> = args.iter().map(|a| self.eval(a)).collect();
                let consts: Option<Vec<U256>> = evaluated
                    .iter()
                    .map(|e| match e {
                        SmtExpr::Const(v) => Some(*v),
                        _ => None,
                    })
                    .collect();
                if let Some(consts) = consts {
                    if let Some(folded) = fold(*op, &consts) {
                        return SmtExpr::Const(folded);
                    }
                }
                SmtExpr::Op(*op, evaluated)
            }
            SmtExpr::Opaque => SmtExpr::Opaque,
        }
    }

    /// Assert that `expr` evaluates to a non-zero (true) value.
    pub fn assert_true(&mut self, expr: &SmtExpr) {
        let expr = self.eval(expr);
        match expr {
            SmtExpr::Const(v) => {
                if v.is_zero() {
                    self.contradiction = true;
                }
            }
            SmtExpr::Term(id) => self.assert_diseq(id, U256::zero()),
            SmtExpr::Op(op, args) => match (op, args.as_slice()) {
                (Opcode::ISZERO, [inner]) => self.assert_false(inner.clone()),
                (Opcode::EQ, [a, b]) => self.assert_eq(a.clone(), b.clone()),
                (Opcode::LT | Opcode::GT, [a, b]) => {
                    let (small, large) = if op == Opcode::LT { (a, b) } else { (b, a) };
                    match (small, large) {
                        (SmtExpr::Term(t), SmtExpr::Const(c)) => {
                            if c.is_zero() {
                                self.contradiction = true;
                            } else {
                                self.assert_upper_bound(*t, *c - U256::one());
                            }
                        }
                        (SmtExpr::Const(c), SmtExpr::Term(t)) => {
                            if *c == U256::MAX {
                                self.contradiction = true;
                            } else {
                                self.assert_lower_bound(*t, *c + U256::one());
                            }
                        }
                        _ => {}
                    }
                }
                (Opcode::AND, [a, b]) => {
                    // 0/1 guard flags: bitwise AND behaves as conjunction.
                    self.assert_true(&a.clone());
                    self.assert_true(&b.clone());
                }
                _ => {}
            },
            SmtExpr::Opaque => {}
        }
    }

    /// Assert that `expr` evaluates to zero (false).
    fn assert_false(&mut self, expr: SmtExpr) {
        let expr = self.eval(&expr);
        match expr {
            SmtExpr::Const(v) => {
                if !v.is_zero() {
                    self.contradiction = true;
                }
            }
            SmtExpr::Term(id) => self.bind_const(id, U256::zero()),
            SmtExpr::Op(op, args) => match (op, args.as_slice()) {
                (Opcode::ISZERO, [inner]) => self.assert_true(&inner.clone()),
                (Opcode::EQ, [SmtExpr::Term(t), SmtExpr::Const(c)])
                | (Opcode::EQ, [SmtExpr::Const(c), SmtExpr::Term(t)]) => {
                    self.assert_diseq(*t, *c);
                }
                (Opcode::EQ, [SmtExpr::Term(a), SmtExpr::Term(b)]) => {
                    let (ra, rb) = (self.find(*a), self.find(*b));
                    if ra == rb {
                        self.contradiction = true;
                    }
                }
                // !(a < b) ⇒ a >= b; only the const cases are tracked.
                (Opcode::LT | Opcode::GT, [a, b]) => {
                    let (small, large) = if op == Opcode::LT { (a, b) } else { (b, a) };
                    match (small, large) {
                        (SmtExpr::Term(t), SmtExpr::Const(c)) => self.assert_lower_bound(*t, *c),
                        (SmtExpr::Const(c), SmtExpr::Term(t)) => self.assert_upper_bound(*t, *c),
                        _ => {}
                    }
                }
                _ => {}
            },
            SmtExpr::Opaque => {}
        }
    }

    fn assert_eq(&mut self, a: SmtExpr, b: SmtExpr) {
        let a = self.eval(&a);
        let b = self.eval(&b);
        match (a, b) {
            (SmtExpr::Const(x), SmtExpr::Const(y)) => {
                if x != y {
                    self.contradiction = true;
                }
            }
            (SmtExpr::Term(t), SmtExpr::Const(c)) | (SmtExpr::Const(c), SmtExpr::Term(t)) => {
                self.bind_const(t, c);
            }
            (SmtExpr::Term(a), SmtExpr::Term(b)) => self.union(a, b),
            _ => {}
        }
    }

    // ─── Public interface ──────────────────────────────────────────────

    /// Translate and assert one expanded guard tree.
    pub fn add_constraint(&mut self, arena: &TreeArena, registry: &VarRegistry, tree: TreeId) {
        let rendered = render_tree(arena, registry, tree, true, true);
        if !self.pushed.insert(rendered) {
            return;
        }
        let expr = self.convert(arena, registry, tree);
        self.assert_true(&expr);
        self.after_add_constraints = true;
    }

    /// Record a store: the state's current generation equals the stored
    /// value.
    pub fn add_sstore(
        &mut self,
        arena: &TreeArena,
        registry: &VarRegistry,
        state_name: &str,
        value: TreeId,
    ) {
        let lhs = SmtExpr::Term(self.term(state_name));
        let rhs = self.convert(arena, registry, value);
        let rendered = format!("{state_name} := {}", render_tree(arena, registry, value, true, true));
        if !self.pushed.insert(rendered) {
            return;
        }
        self.assert_eq(lhs, rhs);
    }

    /// Check the accumulated constraints. `path_prefix` identifies the
    /// branch decisions so far; once a prefix is refuted it is refuted for
    /// good.
    pub fn check(&mut self, path_prefix: &str) -> Verdict {
        if self.infeasible_prefixes.contains(path_prefix) {
            return Verdict::Unsat;
        }
        if self.contradiction {
            debug!(path_prefix, "constraints refuted");
            self.infeasible_prefixes.insert(path_prefix.to_string());
            return Verdict::Unsat;
        }
        Verdict::Sat
    }

    /// Non-`int` typed variables are known non-negative; addresses are
    /// known non-zero.
    pub fn push_type_constraint(&mut self, type_name: &str, var_name: &str) {
        if type_name.starts_with("int") {
            return;
        }
        let id = self.term(var_name);
        if type_name == "address" {
            self.assert_lower_bound(id, U256::one());
        }
    }

    /// Translate a tree into the integer approximation.
    pub fn convert(&mut self, arena: &TreeArena, registry: &VarRegistry, tree: TreeId) -> SmtExpr {
        let node = arena.node(tree);
        if let Some(alias) = &node.alias {
            let name = render_var(arena, registry, alias, true, true);
            if let Some(value) = name.strip_prefix("0x") {
                if let Ok(constant) = U256::from_str_radix(value, 16) {
                    return SmtExpr::Const(constant);
                }
            }
            return SmtExpr::Term(self.term(&name));
        }
        match &node.kind {
            NodeKind::Const(v) => SmtExpr::Const(*v),
            NodeKind::Op(op) if is_translated_op(*op) => {
                let args = node
                    .sons
                    .clone()
                    .into_iter()
                    .map(|s| self.convert(arena, registry, s))
                    .collect();
                SmtExpr::Op(*op, args)
            }
            _ => {
                // An uninterpreted leaf: one fresh integer per rendered
                // form, so equal trees share a term.
                let name = render_tree(arena, registry, tree, true, true);
                SmtExpr::Term(self.term(&name))
            }
        }
    }
}

fn is_translated_op(op: Opcode) -> bool {
    use Opcode::*;
    matches!(
        op,
        ADD | SUB | MUL | DIV | SDIV | MOD | LT | GT | SLT | SGT | EQ | ISZERO | AND | OR | NOT
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_and_registry() -> (TreeArena, VarRegistry) {
        (TreeArena::default(), VarRegistry::default())
    }

    /// EQ(CALLDATALOAD(4), value): an `Arg0 == value` guard.
    fn arg_eq(arena: &mut TreeArena, value: u64) -> TreeId {
        let offset = arena.constant(U256::from(4));
        let load = arena.op(Opcode::CALLDATALOAD, vec![offset]);
        let v = arena.constant(U256::from(value));
        arena.op(Opcode::EQ, vec![load, v])
    }

    #[test]
    fn contradictory_equalities_are_unsat() {
        let (mut arena, registry) = arena_and_registry();
        let mut checker = PathChecker::new();
        let first = arg_eq(&mut arena, 1);
        let second = arg_eq(&mut arena, 2);
        checker.add_constraint(&arena, &registry, first);
        assert_eq!(checker.check("a"), Verdict::Sat);
        checker.add_constraint(&arena, &registry, second);
        assert_eq!(checker.check("a-b"), Verdict::Unsat);
        // The refuted prefix stays refuted after a reset.
        checker.reset();
        assert_eq!(checker.check("a-b"), Verdict::Unsat);
    }

    #[test]
    fn equality_then_disequality_is_unsat() {
        let (mut arena, registry) = arena_and_registry();
        let mut checker = PathChecker::new();
        let eq = arg_eq(&mut arena, 5);
        checker.add_constraint(&arena, &registry, eq);
        let eq_again = arg_eq(&mut arena, 5);
        let neq = arena.op(Opcode::ISZERO, vec![eq_again]);
        checker.add_constraint(&arena, &registry, neq);
        assert_eq!(checker.check("p"), Verdict::Unsat);
    }

    #[test]
    fn bounds_refute_impossible_ranges() {
        let (mut arena, registry) = arena_and_registry();
        let mut checker = PathChecker::new();
        // CALLVALUE < 5
        let cv = arena.op(Opcode::CALLVALUE, Vec::new());
        let five = arena.constant(U256::from(5));
        let lt = arena.op(Opcode::LT, vec![cv, five]);
        checker.add_constraint(&arena, &registry, lt);
        assert_eq!(checker.check("x"), Verdict::Sat);
        // CALLVALUE == 9
        let cv2 = arena.op(Opcode::CALLVALUE, Vec::new());
        let nine = arena.constant(U256::from(9));
        let eq = arena.op(Opcode::EQ, vec![cv2, nine]);
        checker.add_constraint(&arena, &registry, eq);
        assert_eq!(checker.check("x-y"), Verdict::Unsat);
    }

    #[test]
    fn unknown_structure_stays_feasible() {
        let (mut arena, registry) = arena_and_registry();
        let mut checker = PathChecker::new();
        let a = arena.op(Opcode::CALLVALUE, Vec::new());
        let b = arena.op(Opcode::GASPRICE, Vec::new());
        let mul = arena.op(Opcode::MUL, vec![a, b]);
        let zero = arena.constant(U256::zero());
        let gt = arena.op(Opcode::GT, vec![mul, zero]);
        checker.add_constraint(&arena, &registry, gt);
        assert_eq!(checker.check("q"), Verdict::Sat);
    }

    #[test]
    fn timestamp_background_is_loaded() {
        let (mut arena, registry) = arena_and_registry();
        let mut checker = PathChecker::new();
        let ts = arena.op(Opcode::TIMESTAMP, Vec::new());
        let zero = arena.constant(U256::zero());
        let eq = arena.op(Opcode::EQ, vec![ts, zero]);
        checker.add_constraint(&arena, &registry, eq);
        assert_eq!(checker.check("bg"), Verdict::Unsat);
    }

    #[test]
    fn folded_arithmetic_feeds_comparisons() {
        let (mut arena, registry) = arena_and_registry();
        let mut checker = PathChecker::new();
        // (2 + 3) == 6 is false on its face
        let two = arena.constant(U256::from(2));
        let three = arena.constant(U256::from(3));
        let sum = arena.op(Opcode::ADD, vec![two, three]);
        let six = arena.constant(U256::from(6));
        let eq = arena.op(Opcode::EQ, vec![sum, six]);
        checker.add_constraint(&arena, &registry, eq);
        assert_eq!(checker.check("f"), Verdict::Unsat);
    }
}
