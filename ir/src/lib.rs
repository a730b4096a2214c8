//! Expression and loop-tree IR for the fresnel lowering engine.
//!
//! Every node kind is a closed tagged variant dispatched by exhaustive match.
//! Expressions live in an [`ExprArena`] and are referenced by [`ExprId`];
//! rewrites build new nodes instead of mutating shared ones, so structural
//! sharing is explicit copy-on-write. Statements form an owned tree: they are
//! linear and unshared, so arena indirection buys nothing there.
//!
//! # Module Organization
//!
//! - [`types`] - Scalar types and typed constants
//! - [`expr`] - Expression nodes, the arena, substitution and rewriting
//! - [`interval`] - Symbolic intervals, regions, interval arithmetic
//! - [`linear`] - Affine form extraction used by monotonicity and
//!   disjointness proofs
//! - [`simplify`] - Rule-based expression simplification
//! - [`stmt`] - The lowered loop/allocation statement tree
//! - [`pretty`] - Human-readable printing of expressions and statements

pub mod expr;
pub mod interval;
pub mod linear;
pub mod pretty;
pub mod simplify;
pub mod stmt;
pub mod types;

#[cfg(test)]
mod test;

pub use expr::{BinaryOp, Expr, ExprArena, ExprId, StageId, UnaryOp, VarId};
pub use interval::{bounds_of_expr, Interval, Region, Scope};
pub use linear::{linear_of_expr, LinearExpr};
pub use pretty::{ExprDisplay, StmtDisplay};
pub use simplify::{can_prove_le, simplify};
pub use stmt::{AllocDim, AtomicKind, ForKind, SemId, Stmt};
pub use types::{ConstValue, ScalarType};
