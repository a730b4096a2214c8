//! Symbolic intervals, regions, and monotone interval arithmetic.
//!
//! Bounds are inclusive on both ends; `None` means unbounded in that
//! direction. Interval endpoints are expressions, so a region can stay
//! parameterized by loop variables outer to the position it was derived at.
//! A variable with no binding in the scope is treated as the point interval
//! `[v, v]`, which is exactly what keeps per-iteration regions symbolic in
//! their enclosing loop indices.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::expr::{BinaryOp, Expr, ExprArena, ExprId, UnaryOp, VarId};
use crate::simplify::simplify;
use crate::types::ConstValue;

/// Variable bindings used when bounding an expression.
pub type Scope = HashMap<VarId, Interval>;

/// Inclusive symbolic interval. `None` = unbounded on that side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub min: Option<ExprId>,
    pub max: Option<ExprId>,
}

impl Interval {
    pub fn everything() -> Self {
        Interval { min: None, max: None }
    }

    pub fn point(e: ExprId) -> Self {
        Interval { min: Some(e), max: Some(e) }
    }

    pub fn bounded(min: ExprId, max: ExprId) -> Self {
        Interval { min: Some(min), max: Some(max) }
    }

    pub fn is_bounded(&self) -> bool {
        self.min.is_some() && self.max.is_some()
    }

    /// `max - min + 1`, simplified. `None` if either side is unbounded.
    pub fn extent(&self, arena: &mut ExprArena) -> Option<ExprId> {
        let (min, max) = (self.min?, self.max?);
        let d = arena.sub(max, min);
        let one = arena.int(1);
        let e = arena.add(d, one);
        Some(simplify(arena, e))
    }

    /// Smallest interval containing both inputs.
    pub fn union(&self, other: &Interval, arena: &mut ExprArena) -> Interval {
        let min = match (self.min, other.min) {
            (Some(a), Some(b)) => {
                let m = arena.min(a, b);
                Some(simplify(arena, m))
            }
            _ => None,
        };
        let max = match (self.max, other.max) {
            (Some(a), Some(b)) => {
                let m = arena.max(a, b);
                Some(simplify(arena, m))
            }
            _ => None,
        };
        Interval { min, max }
    }

    /// Largest interval contained in both inputs. Unbounded sides defer to
    /// the other operand.
    pub fn intersect(&self, other: &Interval, arena: &mut ExprArena) -> Interval {
        let min = match (self.min, other.min) {
            (Some(a), Some(b)) => {
                let m = arena.max(a, b);
                Some(simplify(arena, m))
            }
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        };
        let max = match (self.max, other.max) {
            (Some(a), Some(b)) => {
                let m = arena.min(a, b);
                Some(simplify(arena, m))
            }
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        };
        Interval { min, max }
    }

    /// Substitute variables in both endpoints.
    pub fn substitute(&self, arena: &mut ExprArena, subs: &HashMap<VarId, ExprId>) -> Interval {
        let map = |arena: &mut ExprArena, e: Option<ExprId>| {
            e.map(|e| {
                let s = arena.substitute(e, subs);
                simplify(arena, s)
            })
        };
        Interval { min: map(arena, self.min), max: map(arena, self.max) }
    }
}

/// Per-dimension intervals describing the subset of a stage's index space
/// some caller needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region(pub SmallVec<[Interval; 4]>);

impl Region {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn union(&self, other: &Region, arena: &mut ExprArena) -> Region {
        debug_assert_eq!(self.len(), other.len());
        Region(self.0.iter().zip(other.0.iter()).map(|(a, b)| a.union(b, arena)).collect())
    }

    pub fn substitute(&self, arena: &mut ExprArena, subs: &HashMap<VarId, ExprId>) -> Region {
        Region(self.0.iter().map(|i| i.substitute(arena, subs)).collect())
    }
}

impl std::ops::Index<usize> for Region {
    type Output = Interval;

    fn index(&self, i: usize) -> &Interval {
        &self.0[i]
    }
}

fn add_bounds(arena: &mut ExprArena, a: Option<ExprId>, b: Option<ExprId>) -> Option<ExprId> {
    match (a, b) {
        (Some(a), Some(b)) => {
            let s = arena.add(a, b);
            Some(simplify(arena, s))
        }
        _ => None,
    }
}

fn sub_bounds(arena: &mut ExprArena, a: Option<ExprId>, b: Option<ExprId>) -> Option<ExprId> {
    match (a, b) {
        (Some(a), Some(b)) => {
            let s = arena.sub(a, b);
            Some(simplify(arena, s))
        }
        _ => None,
    }
}

fn scale_bound(arena: &mut ExprArena, e: Option<ExprId>, c: i64) -> Option<ExprId> {
    e.map(|e| {
        let ce = arena.int(c);
        let m = arena.mul(e, ce);
        simplify(arena, m)
    })
}

fn div_bound(arena: &mut ExprArena, e: Option<ExprId>, c: i64) -> Option<ExprId> {
    e.map(|e| {
        let ce = arena.int(c);
        let d = arena.div(e, ce);
        simplify(arena, d)
    })
}

/// Bound `e` over `scope` with one level of monotone interval arithmetic:
/// affine forms get exact bounds, everything else is interval-extended
/// conservatively, and anything data-dependent (a stage read) is unbounded.
pub fn bounds_of_expr(arena: &mut ExprArena, e: ExprId, scope: &Scope) -> Interval {
    match arena.get(e).clone() {
        Expr::Const(_) => Interval::point(e),
        Expr::Var(v) => match scope.get(&v) {
            Some(i) => i.clone(),
            // Unbound variables are symbolic points: the caller decides later
            // whether a free variable is legal at its position.
            None => Interval::point(e),
        },
        Expr::Cast(_, a) | Expr::Likely(a) => bounds_of_expr(arena, a, scope),
        Expr::Unary(UnaryOp::Neg, a) => {
            let i = bounds_of_expr(arena, a, scope);
            Interval { min: scale_bound(arena, i.max, -1), max: scale_bound(arena, i.min, -1) }
        }
        Expr::Unary(_, _) => Interval::everything(),
        Expr::Binary(op, a, b) => {
            let ia = bounds_of_expr(arena, a, scope);
            let ib = bounds_of_expr(arena, b, scope);
            bounds_of_binary(arena, op, &ia, &ib, b)
        }
        Expr::Select { cond, then_val, else_val } => {
            let c = simplify(arena, cond);
            match arena.as_const(c) {
                Some(ConstValue::Bool(true)) => bounds_of_expr(arena, then_val, scope),
                Some(ConstValue::Bool(false)) => bounds_of_expr(arena, else_val, scope),
                _ => {
                    let it = bounds_of_expr(arena, then_val, scope);
                    let ie = bounds_of_expr(arena, else_val, scope);
                    it.union(&ie, arena)
                }
            }
        }
        // Data-dependent indexing: unbounded unless clamped by min/max above.
        Expr::Read { .. } => Interval::everything(),
        Expr::Ramp { base, stride, lanes } => {
            let ib = bounds_of_expr(arena, base, scope);
            match arena.as_const_int(stride) {
                Some(s) => {
                    let span = s * (lanes as i64 - 1);
                    let shifted =
                        Interval { min: offset_bound(arena, ib.min, span), max: offset_bound(arena, ib.max, span) };
                    ib.union(&shifted, arena)
                }
                None => Interval::everything(),
            }
        }
        Expr::Broadcast { value, .. } => bounds_of_expr(arena, value, scope),
    }
}

fn offset_bound(arena: &mut ExprArena, e: Option<ExprId>, c: i64) -> Option<ExprId> {
    e.map(|e| {
        let ce = arena.int(c);
        let s = arena.add(e, ce);
        simplify(arena, s)
    })
}

fn bounds_of_binary(arena: &mut ExprArena, op: BinaryOp, ia: &Interval, ib: &Interval, b_expr: ExprId) -> Interval {
    match op {
        BinaryOp::Add => Interval {
            min: add_bounds(arena, ia.min, ib.min),
            max: add_bounds(arena, ia.max, ib.max),
        },
        BinaryOp::Sub => Interval {
            min: sub_bounds(arena, ia.min, ib.max),
            max: sub_bounds(arena, ia.max, ib.min),
        },
        BinaryOp::Mul => {
            // Exact when one side is a known constant; otherwise fold only
            // fully-constant corners and give up beyond that.
            if let Some(c) = point_const(arena, ib) {
                return scaled(arena, ia, c);
            }
            if let Some(c) = point_const(arena, ia) {
                return scaled(arena, ib, c);
            }
            match (const_corners(arena, ia), const_corners(arena, ib)) {
                (Some((al, ah)), Some((bl, bh))) => {
                    let products = [al * bl, al * bh, ah * bl, ah * bh];
                    let lo = *products.iter().min().unwrap();
                    let hi = *products.iter().max().unwrap();
                    Interval::bounded(arena.int(lo), arena.int(hi))
                }
                _ => Interval::everything(),
            }
        }
        BinaryOp::Div => match arena.as_const_int(b_expr) {
            Some(c) if c > 0 => Interval { min: div_bound(arena, ia.min, c), max: div_bound(arena, ia.max, c) },
            Some(c) if c < 0 => Interval { min: div_bound(arena, ia.max, c), max: div_bound(arena, ia.min, c) },
            _ => Interval::everything(),
        },
        BinaryOp::Mod => match arena.as_const_int(b_expr) {
            // Euclidean remainder lands in [0, |c| - 1] regardless of sign of
            // the dividend.
            Some(c) if c != 0 => Interval::bounded(arena.int(0), arena.int(c.abs() - 1)),
            _ => Interval::everything(),
        },
        // min/max clamp an unbounded side: `max(x, 0)` is bounded below even
        // when `x` is not, which is what makes clamped data-dependent
        // indexing finite.
        BinaryOp::Min => Interval {
            min: combine_strict(arena, BinaryOp::Min, ia.min, ib.min),
            max: combine_loose(arena, BinaryOp::Min, ia.max, ib.max),
        },
        BinaryOp::Max => Interval {
            min: combine_loose(arena, BinaryOp::Max, ia.min, ib.min),
            max: combine_strict(arena, BinaryOp::Max, ia.max, ib.max),
        },
        // Boolean results never feed allocation sizing.
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::And | BinaryOp::Or => {
            Interval::everything()
        }
    }
}

/// An unbounded operand makes the combined bound unbounded.
fn combine_strict(arena: &mut ExprArena, op: BinaryOp, a: Option<ExprId>, b: Option<ExprId>) -> Option<ExprId> {
    match (a, b) {
        (Some(a), Some(b)) => {
            let e = arena.binary(op, a, b);
            Some(simplify(arena, e))
        }
        _ => None,
    }
}

/// An unbounded operand defers to the other side (`min(x, +inf) = x`).
fn combine_loose(arena: &mut ExprArena, op: BinaryOp, a: Option<ExprId>, b: Option<ExprId>) -> Option<ExprId> {
    match (a, b) {
        (Some(a), Some(b)) => {
            let e = arena.binary(op, a, b);
            Some(simplify(arena, e))
        }
        (Some(a), None) | (None, Some(a)) => Some(a),
        (None, None) => None,
    }
}

fn point_const(arena: &ExprArena, i: &Interval) -> Option<i64> {
    match (i.min, i.max) {
        (Some(a), Some(b)) if a == b => arena.as_const_int(a),
        _ => None,
    }
}

fn const_corners(arena: &ExprArena, i: &Interval) -> Option<(i64, i64)> {
    match (i.min, i.max) {
        (Some(a), Some(b)) => Some((arena.as_const_int(a)?, arena.as_const_int(b)?)),
        _ => None,
    }
}

fn scaled(arena: &mut ExprArena, i: &Interval, c: i64) -> Interval {
    match c.cmp(&0) {
        std::cmp::Ordering::Greater => {
            Interval { min: scale_bound(arena, i.min, c), max: scale_bound(arena, i.max, c) }
        }
        std::cmp::Ordering::Less => Interval { min: scale_bound(arena, i.max, c), max: scale_bound(arena, i.min, c) },
        std::cmp::Ordering::Equal => {
            let zero = arena.int(0);
            Interval::point(zero)
        }
    }
}
