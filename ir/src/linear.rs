//! Affine (linear integer) form extraction.
//!
//! Several proofs in the lowering passes only fire for expressions of the
//! shape `c1*v1 + c2*v2 + ... + k`: sliding-window monotonicity, partition
//! crossing points, parallel-store disjointness. This module extracts that
//! form where it exists; everything else declines, and the callers fall back
//! to the conservative path (the optimization is skipped, never correctness).

use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::expr::{BinaryOp, Expr, ExprArena, ExprId, UnaryOp, VarId};
use crate::types::ConstValue;

/// `sum(coeffs[v] * v) + constant` over integer variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinearExpr {
    pub coeffs: BTreeMap<VarId, i64>,
    pub constant: i64,
}

impl LinearExpr {
    pub fn constant(c: i64) -> Self {
        LinearExpr { coeffs: BTreeMap::new(), constant: c }
    }

    pub fn var(v: VarId) -> Self {
        let mut coeffs = BTreeMap::new();
        coeffs.insert(v, 1);
        LinearExpr { coeffs, constant: 0 }
    }

    pub fn coeff(&self, v: VarId) -> i64 {
        self.coeffs.get(&v).copied().unwrap_or(0)
    }

    /// `Some(k)` when no variable survives.
    pub fn as_constant(&self) -> Option<i64> {
        self.coeffs.is_empty().then_some(self.constant)
    }

    pub fn add(&self, other: &LinearExpr) -> LinearExpr {
        let mut out = self.clone();
        out.constant += other.constant;
        for (v, c) in &other.coeffs {
            let e = out.coeffs.entry(*v).or_insert(0);
            *e += c;
            if *e == 0 {
                out.coeffs.remove(v);
            }
        }
        out
    }

    pub fn scale(&self, k: i64) -> LinearExpr {
        if k == 0 {
            return LinearExpr::constant(0);
        }
        LinearExpr {
            coeffs: self.coeffs.iter().map(|(v, c)| (*v, c * k)).collect(),
            constant: self.constant * k,
        }
    }

    pub fn sub(&self, other: &LinearExpr) -> LinearExpr {
        self.add(&other.scale(-1))
    }

    /// Range of the form over a box of per-variable bounds. `None` if any
    /// referenced variable is missing from `bounds`.
    pub fn eval_bounds(&self, bounds: &HashMap<VarId, (i64, i64)>) -> Option<(i64, i64)> {
        let mut lo = self.constant;
        let mut hi = self.constant;
        for (v, c) in &self.coeffs {
            let (vl, vh) = *bounds.get(v)?;
            if *c >= 0 {
                lo += c * vl;
                hi += c * vh;
            } else {
                lo += c * vh;
                hi += c * vl;
            }
        }
        Some((lo, hi))
    }

    /// Rebuild an expression equal to this form.
    pub fn to_expr(&self, arena: &mut ExprArena) -> ExprId {
        let mut acc = arena.int(self.constant);
        for (v, c) in &self.coeffs {
            let ve = arena.var(*v);
            let term = if *c == 1 {
                ve
            } else {
                let ce = arena.int(*c);
                arena.mul(ce, ve)
            };
            acc = arena.add(acc, term);
        }
        acc
    }
}

/// Extract the affine integer form of `e`, if it has one.
///
/// `Likely` wrappers are transparent. Multiplication requires one constant
/// side; division, modulo, min/max, selects and reads all decline.
pub fn linear_of_expr(arena: &ExprArena, e: ExprId) -> Option<LinearExpr> {
    match arena.get(e) {
        Expr::Const(ConstValue::Int(c)) => Some(LinearExpr::constant(*c)),
        Expr::Const(_) => None,
        Expr::Var(v) => Some(LinearExpr::var(*v)),
        Expr::Likely(a) => linear_of_expr(arena, *a),
        Expr::Cast(ty, a) if ty.is_int() => linear_of_expr(arena, *a),
        Expr::Cast(..) => None,
        Expr::Unary(UnaryOp::Neg, a) => Some(linear_of_expr(arena, *a)?.scale(-1)),
        Expr::Unary(..) => None,
        Expr::Binary(BinaryOp::Add, a, b) => {
            Some(linear_of_expr(arena, *a)?.add(&linear_of_expr(arena, *b)?))
        }
        Expr::Binary(BinaryOp::Sub, a, b) => {
            Some(linear_of_expr(arena, *a)?.sub(&linear_of_expr(arena, *b)?))
        }
        Expr::Binary(BinaryOp::Mul, a, b) => {
            let la = linear_of_expr(arena, *a);
            let lb = linear_of_expr(arena, *b);
            match (la, lb) {
                (Some(la), Some(lb)) => match (la.as_constant(), lb.as_constant()) {
                    (Some(ca), _) => Some(lb.scale(ca)),
                    (_, Some(cb)) => Some(la.scale(cb)),
                    _ => None,
                },
                _ => None,
            }
        }
        Expr::Binary(..) | Expr::Select { .. } | Expr::Read { .. } | Expr::Ramp { .. } | Expr::Broadcast { .. } => {
            None
        }
    }
}
