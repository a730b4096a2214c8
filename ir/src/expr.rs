//! Expression nodes and the interning arena.
//!
//! Expressions are immutable once interned. Structurally identical nodes
//! share one [`ExprId`], so id equality doubles as a cheap structural
//! equality and rewrites preserve sharing through a memo table.

use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;

use crate::types::ConstValue;
use crate::ScalarType;

/// Index of an expression node in its [`ExprArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

/// A loop variable, reduction-domain variable, or free parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

/// Identifier of a pipeline stage. Allocated by the pipeline graph; the IR
/// only treats it as an opaque key for reads, stores and allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Not,
    Sqrt,
    Sin,
    Cos,
    Exp,
    Abs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    Eq,
    Ne,
    Lt,
    Le,
    And,
    Or,
}

impl BinaryOp {
    /// True for operators that are commutative and associative over their
    /// operand type, which is what makes a read-modify-write update lowerable
    /// to a single atomic instruction instead of a CAS retry loop.
    pub fn is_associative_commutative(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Mul | BinaryOp::Min | BinaryOp::Max | BinaryOp::And | BinaryOp::Or
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(self, BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le)
    }
}

/// Expression node. Closed sum type; passes dispatch by exhaustive match.
///
/// `Ramp` and `Broadcast` are vector forms that only appear after the
/// vectorization rewrite in concurrency lowering; everything upstream is
/// scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Const(ConstValue),
    Var(VarId),
    Cast(ScalarType, ExprId),
    Unary(UnaryOp, ExprId),
    Binary(BinaryOp, ExprId, ExprId),
    Select { cond: ExprId, then_val: ExprId, else_val: ExprId },
    /// Steady-state hint for loop partitioning. Semantically transparent.
    Likely(ExprId),
    /// Read of another stage's storage at the given index expressions.
    Read { stage: StageId, indices: SmallVec<[ExprId; 4]> },
    Ramp { base: ExprId, stride: ExprId, lanes: u32 },
    Broadcast { value: ExprId, lanes: u32 },
}

/// Interning arena for expressions plus the variable name table.
#[derive(Debug, Default, Clone)]
pub struct ExprArena {
    nodes: Vec<Expr>,
    interner: HashMap<Expr, ExprId>,
    var_names: Vec<String>,
}

impl ExprArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a node, returning the id of the existing structural duplicate
    /// if there is one.
    pub fn intern(&mut self, e: Expr) -> ExprId {
        if let Some(id) = self.interner.get(&e) {
            return *id;
        }
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(e.clone());
        self.interner.insert(e, id);
        id
    }

    pub fn get(&self, id: ExprId) -> &Expr {
        &self.nodes[id.0 as usize]
    }

    /// Allocate a fresh variable. Names are for diagnostics only; identity is
    /// the id, so two vars may share a display name.
    pub fn new_var(&mut self, name: impl Into<String>) -> VarId {
        let id = VarId(self.var_names.len() as u32);
        self.var_names.push(name.into());
        id
    }

    pub fn var_name(&self, v: VarId) -> &str {
        &self.var_names[v.0 as usize]
    }

    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    pub fn constant(&mut self, c: ConstValue) -> ExprId {
        self.intern(Expr::Const(c))
    }

    pub fn int(&mut self, v: i64) -> ExprId {
        self.constant(ConstValue::Int(v))
    }

    pub fn float(&mut self, v: f64) -> ExprId {
        self.constant(ConstValue::Float(v))
    }

    pub fn boolean(&mut self, v: bool) -> ExprId {
        self.constant(ConstValue::Bool(v))
    }

    pub fn var(&mut self, v: VarId) -> ExprId {
        self.intern(Expr::Var(v))
    }

    pub fn unary(&mut self, op: UnaryOp, a: ExprId) -> ExprId {
        self.intern(Expr::Unary(op, a))
    }

    pub fn binary(&mut self, op: BinaryOp, a: ExprId, b: ExprId) -> ExprId {
        self.intern(Expr::Binary(op, a, b))
    }

    pub fn add(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.binary(BinaryOp::Add, a, b)
    }

    pub fn sub(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.binary(BinaryOp::Sub, a, b)
    }

    pub fn mul(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.binary(BinaryOp::Mul, a, b)
    }

    pub fn div(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.binary(BinaryOp::Div, a, b)
    }

    pub fn modulo(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.binary(BinaryOp::Mod, a, b)
    }

    pub fn min(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.binary(BinaryOp::Min, a, b)
    }

    pub fn max(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.binary(BinaryOp::Max, a, b)
    }

    pub fn lt(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.binary(BinaryOp::Lt, a, b)
    }

    pub fn le(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.binary(BinaryOp::Le, a, b)
    }

    pub fn eq(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.binary(BinaryOp::Eq, a, b)
    }

    pub fn and(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.binary(BinaryOp::And, a, b)
    }

    pub fn or(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.binary(BinaryOp::Or, a, b)
    }

    pub fn neg(&mut self, a: ExprId) -> ExprId {
        self.unary(UnaryOp::Neg, a)
    }

    pub fn not(&mut self, a: ExprId) -> ExprId {
        self.unary(UnaryOp::Not, a)
    }

    pub fn select(&mut self, cond: ExprId, then_val: ExprId, else_val: ExprId) -> ExprId {
        self.intern(Expr::Select { cond, then_val, else_val })
    }

    pub fn likely(&mut self, e: ExprId) -> ExprId {
        self.intern(Expr::Likely(e))
    }

    pub fn read(&mut self, stage: StageId, indices: impl IntoIterator<Item = ExprId>) -> ExprId {
        self.intern(Expr::Read { stage, indices: indices.into_iter().collect() })
    }

    pub fn cast(&mut self, ty: ScalarType, e: ExprId) -> ExprId {
        self.intern(Expr::Cast(ty, e))
    }

    pub fn ramp(&mut self, base: ExprId, stride: ExprId, lanes: u32) -> ExprId {
        self.intern(Expr::Ramp { base, stride, lanes })
    }

    pub fn broadcast(&mut self, value: ExprId, lanes: u32) -> ExprId {
        self.intern(Expr::Broadcast { value, lanes })
    }

    /// `var + c`, a common shorthand in bounds construction.
    pub fn var_plus(&mut self, v: VarId, c: i64) -> ExprId {
        let ve = self.var(v);
        if c == 0 {
            return ve;
        }
        let ce = self.int(c);
        self.add(ve, ce)
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn as_const(&self, id: ExprId) -> Option<ConstValue> {
        match self.get(id) {
            Expr::Const(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_const_int(&self, id: ExprId) -> Option<i64> {
        self.as_const(id).and_then(|c| c.as_int())
    }

    pub fn is_const_zero(&self, id: ExprId) -> bool {
        match self.as_const(id) {
            Some(ConstValue::Int(v)) => v == 0,
            Some(ConstValue::Float(f)) => f == 0.0,
            _ => false,
        }
    }

    /// Number of vector lanes (1 for scalar expressions).
    pub fn lanes(&self, id: ExprId) -> u32 {
        match self.get(id) {
            Expr::Ramp { lanes, .. } | Expr::Broadcast { lanes, .. } => *lanes,
            Expr::Cast(_, a) | Expr::Unary(_, a) | Expr::Likely(a) => self.lanes(*a),
            Expr::Binary(_, a, b) => self.lanes(*a).max(self.lanes(*b)),
            Expr::Select { cond, then_val, else_val } => {
                self.lanes(*cond).max(self.lanes(*then_val)).max(self.lanes(*else_val))
            }
            Expr::Read { indices, .. } => indices.iter().map(|i| self.lanes(*i)).max().unwrap_or(1),
            Expr::Const(_) | Expr::Var(_) => 1,
        }
    }

    /// Collect free variables of `root` into `out`.
    pub fn collect_free_vars(&self, root: ExprId, out: &mut HashSet<VarId>) {
        let mut stack = vec![root];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            match self.get(id) {
                Expr::Var(v) => {
                    out.insert(*v);
                }
                Expr::Const(_) => {}
                Expr::Cast(_, a) | Expr::Unary(_, a) | Expr::Likely(a) => stack.push(*a),
                Expr::Binary(_, a, b) => {
                    stack.push(*a);
                    stack.push(*b);
                }
                Expr::Select { cond, then_val, else_val } => {
                    stack.push(*cond);
                    stack.push(*then_val);
                    stack.push(*else_val);
                }
                Expr::Read { indices, .. } => stack.extend(indices.iter().copied()),
                Expr::Ramp { base, stride, .. } => {
                    stack.push(*base);
                    stack.push(*stride);
                }
                Expr::Broadcast { value, .. } => stack.push(*value),
            }
        }
    }

    pub fn free_vars(&self, root: ExprId) -> HashSet<VarId> {
        let mut out = HashSet::new();
        self.collect_free_vars(root, &mut out);
        out
    }

    pub fn references_var(&self, root: ExprId, v: VarId) -> bool {
        self.free_vars(root).contains(&v)
    }

    /// Collect the stages read anywhere under `root`.
    pub fn collect_reads(&self, root: ExprId, out: &mut Vec<(StageId, SmallVec<[ExprId; 4]>)>) {
        let mut stack = vec![root];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            match self.get(id) {
                Expr::Read { stage, indices } => {
                    out.push((*stage, indices.clone()));
                    stack.extend(indices.iter().copied());
                }
                Expr::Const(_) | Expr::Var(_) => {}
                Expr::Cast(_, a) | Expr::Unary(_, a) | Expr::Likely(a) => stack.push(*a),
                Expr::Binary(_, a, b) => {
                    stack.push(*a);
                    stack.push(*b);
                }
                Expr::Select { cond, then_val, else_val } => {
                    stack.push(*cond);
                    stack.push(*then_val);
                    stack.push(*else_val);
                }
                Expr::Ramp { base, stride, .. } => {
                    stack.push(*base);
                    stack.push(*stride);
                }
                Expr::Broadcast { value, .. } => stack.push(*value),
            }
        }
    }

    // ------------------------------------------------------------------
    // Rewriting
    // ------------------------------------------------------------------

    /// Bottom-up rewrite. Children are rebuilt first, then `f` may replace the
    /// rebuilt node. A memo table keeps sharing intact and bounds the work on
    /// DAG-shaped expressions.
    pub fn rewrite(&mut self, root: ExprId, f: &mut dyn FnMut(&mut ExprArena, ExprId) -> Option<ExprId>) -> ExprId {
        let mut memo: HashMap<ExprId, ExprId> = HashMap::new();
        self.rewrite_memo(root, f, &mut memo)
    }

    fn rewrite_memo(
        &mut self,
        id: ExprId,
        f: &mut dyn FnMut(&mut ExprArena, ExprId) -> Option<ExprId>,
        memo: &mut HashMap<ExprId, ExprId>,
    ) -> ExprId {
        if let Some(done) = memo.get(&id) {
            return *done;
        }
        let node = self.get(id).clone();
        let rebuilt = match node {
            Expr::Const(_) | Expr::Var(_) => id,
            Expr::Cast(ty, a) => {
                let a2 = self.rewrite_memo(a, f, memo);
                if a2 == a {
                    id
                } else {
                    self.cast(ty, a2)
                }
            }
            Expr::Unary(op, a) => {
                let a2 = self.rewrite_memo(a, f, memo);
                if a2 == a {
                    id
                } else {
                    self.unary(op, a2)
                }
            }
            Expr::Likely(a) => {
                let a2 = self.rewrite_memo(a, f, memo);
                if a2 == a {
                    id
                } else {
                    self.likely(a2)
                }
            }
            Expr::Binary(op, a, b) => {
                let a2 = self.rewrite_memo(a, f, memo);
                let b2 = self.rewrite_memo(b, f, memo);
                if a2 == a && b2 == b {
                    id
                } else {
                    self.binary(op, a2, b2)
                }
            }
            Expr::Select { cond, then_val, else_val } => {
                let c2 = self.rewrite_memo(cond, f, memo);
                let t2 = self.rewrite_memo(then_val, f, memo);
                let e2 = self.rewrite_memo(else_val, f, memo);
                if c2 == cond && t2 == then_val && e2 == else_val {
                    id
                } else {
                    self.select(c2, t2, e2)
                }
            }
            Expr::Read { stage, indices } => {
                let new: SmallVec<[ExprId; 4]> = indices.iter().map(|i| self.rewrite_memo(*i, f, memo)).collect();
                if new == indices {
                    id
                } else {
                    self.intern(Expr::Read { stage, indices: new })
                }
            }
            Expr::Ramp { base, stride, lanes } => {
                let b2 = self.rewrite_memo(base, f, memo);
                let s2 = self.rewrite_memo(stride, f, memo);
                if b2 == base && s2 == stride {
                    id
                } else {
                    self.ramp(b2, s2, lanes)
                }
            }
            Expr::Broadcast { value, lanes } => {
                let v2 = self.rewrite_memo(value, f, memo);
                if v2 == value {
                    id
                } else {
                    self.broadcast(v2, lanes)
                }
            }
        };
        let result = f(self, rebuilt).unwrap_or(rebuilt);
        memo.insert(id, result);
        result
    }

    /// Replace every occurrence of the given variables.
    pub fn substitute(&mut self, root: ExprId, subs: &HashMap<VarId, ExprId>) -> ExprId {
        if subs.is_empty() {
            return root;
        }
        self.rewrite(root, &mut |arena, id| match arena.get(id) {
            Expr::Var(v) => subs.get(v).copied(),
            _ => None,
        })
    }

    pub fn substitute_var(&mut self, root: ExprId, var: VarId, with: ExprId) -> ExprId {
        let mut subs = HashMap::new();
        subs.insert(var, with);
        self.substitute(root, &subs)
    }

    /// Remove `Likely` wrappers, leaving their payloads.
    pub fn strip_likely(&mut self, root: ExprId) -> ExprId {
        self.rewrite(root, &mut |arena, id| match arena.get(id) {
            Expr::Likely(inner) => Some(*inner),
            _ => None,
        })
    }

    pub fn contains_likely(&self, root: ExprId) -> bool {
        let mut stack = vec![root];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            match self.get(id) {
                Expr::Likely(_) => return true,
                Expr::Const(_) | Expr::Var(_) => {}
                Expr::Cast(_, a) | Expr::Unary(_, a) => stack.push(*a),
                Expr::Binary(_, a, b) => {
                    stack.push(*a);
                    stack.push(*b);
                }
                Expr::Select { cond, then_val, else_val } => {
                    stack.push(*cond);
                    stack.push(*then_val);
                    stack.push(*else_val);
                }
                Expr::Read { indices, .. } => stack.extend(indices.iter().copied()),
                Expr::Ramp { base, stride, .. } => {
                    stack.push(*base);
                    stack.push(*stride);
                }
                Expr::Broadcast { value, .. } => stack.push(*value),
            }
        }
        false
    }
}
