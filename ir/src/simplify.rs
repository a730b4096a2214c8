//! Rule-based expression simplification.
//!
//! One bottom-up pass; each node applies local rules to a fixpoint after its
//! children are simplified. The rule set is deliberately small: constant
//! folding plus the algebraic identities the lowering passes rely on to keep
//! bound expressions from snowballing.

use crate::expr::{BinaryOp, Expr, ExprArena, ExprId, UnaryOp};
use crate::linear::linear_of_expr;
use crate::types::{floor_div, floor_mod, ConstValue};

/// Simplify `e` and return the (possibly unchanged) id.
pub fn simplify(arena: &mut ExprArena, e: ExprId) -> ExprId {
    arena.rewrite(e, &mut |arena, id| {
        let mut cur = id;
        // Local fixpoint: each rule application may expose another.
        for _ in 0..8 {
            match simplify_node(arena, cur) {
                Some(next) if next != cur => cur = next,
                _ => break,
            }
        }
        (cur != id).then_some(cur)
    })
}

/// Try to prove `a <= b` without any variable bindings: the difference must
/// cancel to a constant, either syntactically or as an affine form.
pub fn can_prove_le(arena: &mut ExprArena, a: ExprId, b: ExprId) -> bool {
    if a == b {
        return true;
    }
    let d = arena.sub(b, a);
    let d = simplify(arena, d);
    if let Some(c) = arena.as_const_int(d) {
        return c >= 0;
    }
    match linear_of_expr(arena, d) {
        Some(l) => l.as_constant().map(|c| c >= 0).unwrap_or(false),
        None => false,
    }
}

fn simplify_node(arena: &mut ExprArena, id: ExprId) -> Option<ExprId> {
    match arena.get(id).clone() {
        Expr::Unary(op, a) => simplify_unary(arena, op, a),
        Expr::Binary(op, a, b) => simplify_binary(arena, op, a, b),
        Expr::Select { cond, then_val, else_val } => {
            match arena.as_const(cond) {
                Some(ConstValue::Bool(true)) => return Some(then_val),
                Some(ConstValue::Bool(false)) => return Some(else_val),
                _ => {}
            }
            (then_val == else_val).then_some(then_val)
        }
        Expr::Cast(ty, a) => match arena.as_const(a) {
            Some(ConstValue::Int(v)) if ty.is_int() => Some(arena.int(v)),
            Some(ConstValue::Int(v)) if ty.is_float() => Some(arena.float(v as f64)),
            Some(ConstValue::Float(v)) if ty.is_float() => Some(arena.float(v)),
            _ => None,
        },
        Expr::Const(_) | Expr::Var(_) | Expr::Likely(_) | Expr::Read { .. } | Expr::Ramp { .. }
        | Expr::Broadcast { .. } => None,
    }
}

fn simplify_unary(arena: &mut ExprArena, op: UnaryOp, a: ExprId) -> Option<ExprId> {
    if let Some(c) = arena.as_const(a) {
        match (op, c) {
            (UnaryOp::Neg, ConstValue::Int(v)) => return Some(arena.int(-v)),
            (UnaryOp::Neg, ConstValue::Float(v)) => return Some(arena.float(-v)),
            (UnaryOp::Not, ConstValue::Bool(v)) => return Some(arena.boolean(!v)),
            (UnaryOp::Abs, ConstValue::Int(v)) => return Some(arena.int(v.abs())),
            (UnaryOp::Abs, ConstValue::Float(v)) => return Some(arena.float(v.abs())),
            (UnaryOp::Sqrt, ConstValue::Float(v)) => return Some(arena.float(v.sqrt())),
            (UnaryOp::Sin, ConstValue::Float(v)) => return Some(arena.float(v.sin())),
            (UnaryOp::Cos, ConstValue::Float(v)) => return Some(arena.float(v.cos())),
            (UnaryOp::Exp, ConstValue::Float(v)) => return Some(arena.float(v.exp())),
            _ => {}
        }
    }
    // not(not(x)) => x
    if op == UnaryOp::Not {
        if let Expr::Unary(UnaryOp::Not, inner) = arena.get(a) {
            return Some(*inner);
        }
    }
    None
}

fn simplify_binary(arena: &mut ExprArena, op: BinaryOp, a: ExprId, b: ExprId) -> Option<ExprId> {
    if let (Some(ca), Some(cb)) = (arena.as_const(a), arena.as_const(b)) {
        if let Some(folded) = fold_const(arena, op, ca, cb) {
            return Some(folded);
        }
    }

    // Affine cancellation: `x - (x - 1)` and friends collapse to constants
    // even when no syntactic rule applies.
    if matches!(op, BinaryOp::Add | BinaryOp::Sub) {
        if let (Some(la), Some(lb)) = (linear_of_expr(arena, a), linear_of_expr(arena, b)) {
            let l = if op == BinaryOp::Add { la.add(&lb) } else { la.sub(&lb) };
            if let Some(c) = l.as_constant() {
                return Some(arena.int(c));
            }
        }
    }

    match op {
        BinaryOp::Add => {
            if arena.is_const_zero(b) {
                return Some(a);
            }
            if arena.is_const_zero(a) {
                return Some(b);
            }
            // Constants to the right: (c + x) => (x + c).
            if arena.as_const(a).is_some() && arena.as_const(b).is_none() {
                return Some(arena.add(b, a));
            }
            // ((x + c1) + c2) => (x + (c1 + c2))
            if let Some(c2) = arena.as_const_int(b) {
                if let Expr::Binary(BinaryOp::Add, x, c1e) = arena.get(a).clone() {
                    if let Some(c1) = arena.as_const_int(c1e) {
                        let c = arena.int(c1 + c2);
                        return Some(arena.add(x, c));
                    }
                }
            }
            None
        }
        BinaryOp::Sub => {
            if arena.is_const_zero(b) {
                return Some(a);
            }
            if a == b {
                return Some(arena.int(0));
            }
            // (x - c) => (x + (-c)) so the Add rules can merge chains.
            if let Some(c) = arena.as_const_int(b) {
                let nc = arena.int(-c);
                return Some(arena.add(a, nc));
            }
            None
        }
        BinaryOp::Mul => {
            if let Some(1) = arena.as_const_int(b) {
                return Some(a);
            }
            if let Some(1) = arena.as_const_int(a) {
                return Some(b);
            }
            if arena.as_const_int(a) == Some(0) || arena.as_const_int(b) == Some(0) {
                return Some(arena.int(0));
            }
            // Constants to the right.
            if arena.as_const(a).is_some() && arena.as_const(b).is_none() {
                return Some(arena.mul(b, a));
            }
            None
        }
        BinaryOp::Div => {
            if let Some(1) = arena.as_const_int(b) {
                return Some(a);
            }
            // (x * c1) / c2 => x * (c1 / c2) when c2 divides c1 exactly.
            if let Some(c2) = arena.as_const_int(b) {
                if c2 > 0 {
                    if let Expr::Binary(BinaryOp::Mul, x, c1e) = arena.get(a).clone() {
                        if let Some(c1) = arena.as_const_int(c1e) {
                            if c1 % c2 == 0 {
                                let c = arena.int(c1 / c2);
                                return Some(arena.mul(x, c));
                            }
                        }
                    }
                }
            }
            None
        }
        BinaryOp::Mod => {
            if let Some(1) = arena.as_const_int(b) {
                return Some(arena.int(0));
            }
            // (x * c1) % c2 => 0 when c2 divides c1.
            if let Some(c2) = arena.as_const_int(b) {
                if c2 > 0 {
                    if let Expr::Binary(BinaryOp::Mul, _, c1e) = arena.get(a) {
                        if let Some(c1) = arena.as_const_int(*c1e) {
                            if c1 % c2 == 0 {
                                return Some(arena.int(0));
                            }
                        }
                    }
                }
            }
            None
        }
        BinaryOp::Min | BinaryOp::Max => {
            if a == b {
                return Some(a);
            }
            // min(min(x, c1), c2) => min(x, min(c1, c2)); same for max.
            if let Some(c2) = arena.as_const_int(b) {
                if let Expr::Binary(inner_op, x, c1e) = arena.get(a).clone() {
                    if inner_op == op {
                        if let Some(c1) = arena.as_const_int(c1e) {
                            let c = if op == BinaryOp::Min { c1.min(c2) } else { c1.max(c2) };
                            let ce = arena.int(c);
                            return Some(arena.binary(op, x, ce));
                        }
                    }
                }
            }
            // Affine difference decides min/max exactly.
            if let (Some(la), Some(lb)) = (linear_of_expr(arena, a), linear_of_expr(arena, b)) {
                if let Some(d) = lb.sub(&la).as_constant() {
                    let a_wins = if op == BinaryOp::Min { d >= 0 } else { d <= 0 };
                    return Some(if a_wins { a } else { b });
                }
            }
            None
        }
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le => {
            if a == b {
                return Some(arena.boolean(matches!(op, BinaryOp::Eq | BinaryOp::Le)));
            }
            // Affine difference turns the comparison into a constant.
            if let (Some(la), Some(lb)) = (linear_of_expr(arena, a), linear_of_expr(arena, b)) {
                if let Some(d) = lb.sub(&la).as_constant() {
                    // d = b - a
                    let val = match op {
                        BinaryOp::Eq => d == 0,
                        BinaryOp::Ne => d != 0,
                        BinaryOp::Lt => d > 0,
                        BinaryOp::Le => d >= 0,
                        _ => unreachable!(),
                    };
                    return Some(arena.boolean(val));
                }
            }
            None
        }
        BinaryOp::And => match (arena.as_const(a), arena.as_const(b)) {
            (Some(ConstValue::Bool(true)), _) => Some(b),
            (_, Some(ConstValue::Bool(true))) => Some(a),
            (Some(ConstValue::Bool(false)), _) | (_, Some(ConstValue::Bool(false))) => Some(arena.boolean(false)),
            _ => (a == b).then_some(a),
        },
        BinaryOp::Or => match (arena.as_const(a), arena.as_const(b)) {
            (Some(ConstValue::Bool(false)), _) => Some(b),
            (_, Some(ConstValue::Bool(false))) => Some(a),
            (Some(ConstValue::Bool(true)), _) | (_, Some(ConstValue::Bool(true))) => Some(arena.boolean(true)),
            _ => (a == b).then_some(a),
        },
    }
}

fn fold_const(arena: &mut ExprArena, op: BinaryOp, a: ConstValue, b: ConstValue) -> Option<ExprId> {
    use ConstValue::*;
    let out = match (op, a, b) {
        (BinaryOp::Add, Int(x), Int(y)) => Int(x + y),
        (BinaryOp::Sub, Int(x), Int(y)) => Int(x - y),
        (BinaryOp::Mul, Int(x), Int(y)) => Int(x * y),
        (BinaryOp::Div, Int(x), Int(y)) if y != 0 => Int(floor_div(x, y)),
        (BinaryOp::Mod, Int(x), Int(y)) if y != 0 => Int(floor_mod(x, y)),
        (BinaryOp::Min, Int(x), Int(y)) => Int(x.min(y)),
        (BinaryOp::Max, Int(x), Int(y)) => Int(x.max(y)),
        (BinaryOp::Eq, Int(x), Int(y)) => Bool(x == y),
        (BinaryOp::Ne, Int(x), Int(y)) => Bool(x != y),
        (BinaryOp::Lt, Int(x), Int(y)) => Bool(x < y),
        (BinaryOp::Le, Int(x), Int(y)) => Bool(x <= y),
        (BinaryOp::Add, Float(x), Float(y)) => Float(x + y),
        (BinaryOp::Sub, Float(x), Float(y)) => Float(x - y),
        (BinaryOp::Mul, Float(x), Float(y)) => Float(x * y),
        (BinaryOp::Div, Float(x), Float(y)) => Float(x / y),
        (BinaryOp::Min, Float(x), Float(y)) => Float(x.min(y)),
        (BinaryOp::Max, Float(x), Float(y)) => Float(x.max(y)),
        (BinaryOp::Eq, Float(x), Float(y)) => Bool(x == y),
        (BinaryOp::Ne, Float(x), Float(y)) => Bool(x != y),
        (BinaryOp::Lt, Float(x), Float(y)) => Bool(x < y),
        (BinaryOp::Le, Float(x), Float(y)) => Bool(x <= y),
        (BinaryOp::And, Bool(x), Bool(y)) => Bool(x && y),
        (BinaryOp::Or, Bool(x), Bool(y)) => Bool(x || y),
        (BinaryOp::Eq, Bool(x), Bool(y)) => Bool(x == y),
        (BinaryOp::Ne, Bool(x), Bool(y)) => Bool(x != y),
        _ => return None,
    };
    Some(arena.constant(out))
}
