//! The lowered loop/allocation statement tree.
//!
//! This is the target-independent form handed to a backend (or to the
//! reference interpreter): nested range loops with concurrency tags,
//! allocate scopes with concrete or folded extents, produce/consume regions,
//! atomic/CAS store forms, and async task boundaries with explicit
//! semaphore synchronization.

use smallvec::SmallVec;

use crate::expr::{BinaryOp, ExprArena, ExprId, StageId, VarId};
use crate::types::ScalarType;

/// Concurrency tag on a loop.
///
/// `Parallel` survives to the final tree as the fork-join construct;
/// `Vectorized`/`Unrolled` are rewritten away by concurrency lowering and
/// must not appear in a fully lowered module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ForKind {
    Serial,
    Parallel,
    Vectorized(u32),
    Unrolled(u32),
}

/// How a store synchronizes with concurrent writers of the same location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicKind {
    /// Proven-disjoint or purely serial write.
    NonAtomic,
    /// Single atomic read-modify-write with the given commutative/associative
    /// operator; the stored value must be `read(loc) op operand`.
    Rmw(BinaryOp),
    /// Compare-and-swap retry loop: re-read, recompute, re-attempt.
    CasLoop,
}

/// One dimension of an allocation: logical min/extent plus an optional
/// circular-buffer fold. Folded dimensions are addressed modulo the fold.
#[derive(Debug, Clone)]
pub struct AllocDim {
    pub min: ExprId,
    pub extent: ExprId,
    pub fold: Option<i64>,
}

/// Counting semaphore id used by async producer/consumer handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemId(pub u32);

/// Statement node of the lowered tree. Owned, unshared.
#[derive(Debug, Clone)]
pub enum Stmt {
    /// Empty statement, the unit of `Block`.
    NoOp,
    Block(Vec<Stmt>),
    For {
        var: VarId,
        min: ExprId,
        extent: ExprId,
        kind: ForKind,
        body: Box<Stmt>,
    },
    If {
        cond: ExprId,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    /// Write one value (or a vector of values) into a stage's storage.
    Store {
        stage: StageId,
        indices: SmallVec<[ExprId; 4]>,
        value: ExprId,
        atomic: AtomicKind,
        /// Lane predicate from the `Predicate` tail policy; lanes where it is
        /// false are not written.
        predicate: Option<ExprId>,
    },
    /// Storage scope for a stage; freed when the body exits.
    Allocate {
        stage: StageId,
        ty: ScalarType,
        dims: SmallVec<[AllocDim; 4]>,
        body: Box<Stmt>,
    },
    /// Marks the sub-tree that computes values of `stage`.
    Produce { stage: StageId, body: Box<Stmt> },
    /// Marks the sub-tree that may read values of `stage`.
    Consume { stage: StageId, body: Box<Stmt> },
    /// Async task boundary: producer and consumer run concurrently,
    /// synchronized only through `Acquire`/`Release` on shared semaphores.
    Fork { producer: Box<Stmt>, consumer: Box<Stmt> },
    /// Block until `sem >= count`, then subtract and run the body.
    Acquire { sem: SemId, count: u32, body: Box<Stmt> },
    /// Add `count` to `sem`, waking blocked acquirers.
    Release { sem: SemId, count: u32 },
    /// Runtime check emitted by bounds instrumentation; aborts the pipeline
    /// invocation when the condition is false.
    Assert { cond: ExprId, message: String },
}

impl Stmt {
    pub fn block(stmts: Vec<Stmt>) -> Stmt {
        let mut flat = Vec::with_capacity(stmts.len());
        for s in stmts {
            match s {
                Stmt::NoOp => {}
                Stmt::Block(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Stmt::NoOp,
            1 => flat.pop().unwrap(),
            _ => Stmt::Block(flat),
        }
    }

    /// Rebuild this tree with every embedded expression mapped through `f`.
    pub fn map_exprs(&self, arena: &mut ExprArena, f: &mut dyn FnMut(&mut ExprArena, ExprId) -> ExprId) -> Stmt {
        match self {
            Stmt::NoOp => Stmt::NoOp,
            Stmt::Block(stmts) => Stmt::Block(stmts.iter().map(|s| s.map_exprs(arena, f)).collect()),
            Stmt::For { var, min, extent, kind, body } => Stmt::For {
                var: *var,
                min: f(arena, *min),
                extent: f(arena, *extent),
                kind: *kind,
                body: Box::new(body.map_exprs(arena, f)),
            },
            Stmt::If { cond, then_branch, else_branch } => Stmt::If {
                cond: f(arena, *cond),
                then_branch: Box::new(then_branch.map_exprs(arena, f)),
                else_branch: else_branch.as_ref().map(|e| Box::new(e.map_exprs(arena, f))),
            },
            Stmt::Store { stage, indices, value, atomic, predicate } => Stmt::Store {
                stage: *stage,
                indices: indices.iter().map(|i| f(arena, *i)).collect(),
                value: f(arena, *value),
                atomic: *atomic,
                predicate: predicate.map(|p| f(arena, p)),
            },
            Stmt::Allocate { stage, ty, dims, body } => Stmt::Allocate {
                stage: *stage,
                ty: *ty,
                dims: dims
                    .iter()
                    .map(|d| AllocDim { min: f(arena, d.min), extent: f(arena, d.extent), fold: d.fold })
                    .collect(),
                body: Box::new(body.map_exprs(arena, f)),
            },
            Stmt::Produce { stage, body } => {
                Stmt::Produce { stage: *stage, body: Box::new(body.map_exprs(arena, f)) }
            }
            Stmt::Consume { stage, body } => {
                Stmt::Consume { stage: *stage, body: Box::new(body.map_exprs(arena, f)) }
            }
            Stmt::Fork { producer, consumer } => Stmt::Fork {
                producer: Box::new(producer.map_exprs(arena, f)),
                consumer: Box::new(consumer.map_exprs(arena, f)),
            },
            Stmt::Acquire { sem, count, body } => {
                Stmt::Acquire { sem: *sem, count: *count, body: Box::new(body.map_exprs(arena, f)) }
            }
            Stmt::Release { sem, count } => Stmt::Release { sem: *sem, count: *count },
            Stmt::Assert { cond, message } => {
                Stmt::Assert { cond: f(arena, *cond), message: message.clone() }
            }
        }
    }

    /// Substitute a variable in every embedded expression.
    pub fn substitute_var(&self, arena: &mut ExprArena, var: VarId, with: ExprId) -> Stmt {
        self.map_exprs(arena, &mut |arena, e| {
            let s = arena.substitute_var(e, var, with);
            crate::simplify::simplify(arena, s)
        })
    }

    /// Visit every statement node, outer before inner.
    pub fn walk(&self, f: &mut dyn FnMut(&Stmt)) {
        f(self);
        match self {
            Stmt::NoOp | Stmt::Release { .. } | Stmt::Store { .. } | Stmt::Assert { .. } => {}
            Stmt::Block(stmts) => {
                for s in stmts {
                    s.walk(f);
                }
            }
            Stmt::For { body, .. }
            | Stmt::Allocate { body, .. }
            | Stmt::Produce { body, .. }
            | Stmt::Consume { body, .. }
            | Stmt::Acquire { body, .. } => body.walk(f),
            Stmt::If { then_branch, else_branch, .. } => {
                then_branch.walk(f);
                if let Some(e) = else_branch {
                    e.walk(f);
                }
            }
            Stmt::Fork { producer, consumer } => {
                producer.walk(f);
                consumer.walk(f);
            }
        }
    }
}
