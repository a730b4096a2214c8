//! Loop partitioning.
//!
//! A conditional carrying a `likely` hint marks a steady state: the value
//! branch expected to dominate (or a condition expected to hold) across the
//! bulk of the iteration space. When the condition's crossing points solve
//! as affine functions of the loop variable, the loop splits into up to
//! three consecutive sub-loops - prologue, steady state, epilogue - and the
//! conditional simplifies away entirely in the steady state. An unsolvable
//! condition degenerates to the unpartitioned loop: an optimization missed,
//! never an error.
//!
//! Applied innermost-first; the consumed hint is stripped from the other
//! sub-loops, so an outer loop never re-partitions the same conditional.

use fresnel_ir::{
    linear_of_expr, simplify, BinaryOp, Expr, ExprArena, ExprId, ForKind, Stmt, VarId,
};

use crate::ctx::{LowerCtx, LowerState};
use crate::error::Result;

#[tracing::instrument(skip_all)]
pub fn partition_loops(ctx: &mut LowerCtx, stmt: Stmt) -> Result<Stmt> {
    let out = walk(&mut ctx.arena, stmt);
    ctx.advance_states(LowerState::Folded, LowerState::Partitioned);
    Ok(out)
}

fn walk(arena: &mut ExprArena, stmt: Stmt) -> Stmt {
    match stmt {
        Stmt::For { var, min, extent, kind, body } => {
            // Innermost first: a conditional collapsible at an inner level
            // must not be re-partitioned further out.
            let body = walk(arena, *body);
            try_partition(arena, var, min, extent, kind, body)
        }
        Stmt::Block(stmts) => Stmt::Block(stmts.into_iter().map(|s| walk(arena, s)).collect()),
        Stmt::If { cond, then_branch, else_branch } => Stmt::If {
            cond,
            then_branch: Box::new(walk(arena, *then_branch)),
            else_branch: else_branch.map(|e| Box::new(walk(arena, *e))),
        },
        Stmt::Allocate { stage, ty, dims, body } => {
            Stmt::Allocate { stage, ty, dims, body: Box::new(walk(arena, *body)) }
        }
        Stmt::Produce { stage, body } => Stmt::Produce { stage, body: Box::new(walk(arena, *body)) },
        Stmt::Consume { stage, body } => Stmt::Consume { stage, body: Box::new(walk(arena, *body)) },
        Stmt::Acquire { sem, count, body } => {
            Stmt::Acquire { sem, count, body: Box::new(walk(arena, *body)) }
        }
        Stmt::Fork { producer, consumer } => Stmt::Fork {
            producer: Box::new(walk(arena, *producer)),
            consumer: Box::new(walk(arena, *consumer)),
        },
        other => other,
    }
}

/// A likely-hinted conditional found in a loop body.
enum Hinted {
    /// `select(cond, t, f)` where the likely branch is `t` (then_likely) or `f`.
    SelectBranch { select: ExprId, cond: ExprId, then_likely: bool },
    /// A condition site that is exactly `likely(inner)`.
    CondLikely { site: ExprId, inner: ExprId },
}

fn try_partition(
    arena: &mut ExprArena,
    var: VarId,
    min: ExprId,
    extent: ExprId,
    kind: ForKind,
    body: Stmt,
) -> Stmt {
    let original = |arena: &mut ExprArena, body: Stmt| Stmt::For {
        var,
        min,
        extent: simplify(arena, extent),
        kind,
        body: Box::new(body),
    };

    let candidates = collect_hinted(arena, &body);
    for hinted in candidates {
        let (cond, want_true) = match &hinted {
            Hinted::SelectBranch { cond, then_likely, .. } => (*cond, *then_likely),
            Hinted::CondLikely { inner, .. } => (*inner, true),
        };
        let Some((steady_lo, steady_hi)) = solve_steady(arena, cond, var, want_true) else {
            continue;
        };

        // The crossing bounds become loop headers: they may only reference
        // variables defined outside this loop.
        let mut inner_vars = std::collections::HashSet::new();
        inner_vars.insert(var);
        collect_loop_vars(&body, &mut inner_vars);
        let out_of_scope = steady_lo
            .iter()
            .chain(steady_hi.iter())
            .any(|e| arena.free_vars(*e).iter().any(|v| inner_vars.contains(v)));
        if out_of_scope {
            continue;
        }

        // Clamp the crossing points into the loop range.
        let one = arena.int(1);
        let end = arena.add(min, extent); // one past the last iteration
        let pro_end = match steady_lo {
            Some(lo) => {
                let capped = arena.min(lo, end);
                let e = arena.max(capped, min);
                simplify(arena, e)
            }
            None => min,
        };
        let epi_start = match steady_hi {
            Some(hi) => {
                let past = arena.add(hi, one);
                let capped = arena.max(past, pro_end);
                let e = arena.min(capped, end);
                simplify(arena, e)
            }
            None => simplify(arena, end),
        };

        let pro_extent = {
            let e = arena.sub(pro_end, min);
            simplify(arena, e)
        };
        let steady_extent = {
            let e = arena.sub(epi_start, pro_end);
            simplify(arena, e)
        };
        let epi_extent = {
            let e = arena.sub(end, epi_start);
            simplify(arena, e)
        };

        // The split must leave a provably meaningful steady state.
        if matches!(arena.as_const_int(steady_extent), Some(n) if n <= 0) {
            continue;
        }

        let steady_body = specialize_steady(arena, &body, &hinted);
        let edge_body = strip_likely_stmt(arena, &body);

        let mut parts = Vec::new();
        if !is_const_nonpositive(arena, pro_extent) {
            parts.push(Stmt::For {
                var,
                min,
                extent: pro_extent,
                kind,
                body: Box::new(edge_body.clone()),
            });
        }
        parts.push(Stmt::For { var, min: pro_end, extent: steady_extent, kind, body: Box::new(steady_body) });
        if !is_const_nonpositive(arena, epi_extent) {
            parts.push(Stmt::For { var, min: epi_start, extent: epi_extent, kind, body: Box::new(edge_body) });
        }
        tracing::debug!(var = arena.var_name(var), pieces = parts.len(), "loop partitioned");
        return Stmt::block(parts);
    }
    original(arena, body)
}

fn is_const_nonpositive(arena: &ExprArena, e: ExprId) -> bool {
    matches!(arena.as_const_int(e), Some(n) if n <= 0)
}

/// All likely-hinted conditionals in the body, in discovery order.
fn collect_hinted(arena: &ExprArena, body: &Stmt) -> Vec<Hinted> {
    let mut exprs = Vec::new();
    collect_exprs(body, &mut exprs);
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for root in exprs {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            match arena.get(id) {
                Expr::Select { cond, then_val, else_val } => {
                    if let Expr::Likely(_) = arena.get(*then_val) {
                        out.push(Hinted::SelectBranch { select: id, cond: *cond, then_likely: true });
                    } else if let Expr::Likely(_) = arena.get(*else_val) {
                        out.push(Hinted::SelectBranch { select: id, cond: *cond, then_likely: false });
                    }
                    stack.extend([*cond, *then_val, *else_val]);
                }
                // A hinted condition site (if/select/predicate conditions all
                // land here when walking their expressions).
                Expr::Likely(inner) => {
                    if matches!(arena.get(*inner), Expr::Binary(BinaryOp::Lt | BinaryOp::Le, _, _)) {
                        out.push(Hinted::CondLikely { site: id, inner: *inner });
                    }
                    stack.push(*inner);
                }
                Expr::Cast(_, a) | Expr::Unary(_, a) => stack.push(*a),
                Expr::Binary(_, a, b) => stack.extend([*a, *b]),
                Expr::Read { indices, .. } => stack.extend(indices.iter().copied()),
                Expr::Ramp { base, stride, .. } => stack.extend([*base, *stride]),
                Expr::Broadcast { value, .. } => stack.push(*value),
                Expr::Const(_) | Expr::Var(_) => {}
            }
        }
    }
    out
}

fn collect_loop_vars(stmt: &Stmt, out: &mut std::collections::HashSet<VarId>) {
    match stmt {
        Stmt::For { var, body, .. } => {
            out.insert(*var);
            collect_loop_vars(body, out);
        }
        Stmt::Block(stmts) => {
            for s in stmts {
                collect_loop_vars(s, out);
            }
        }
        Stmt::If { then_branch, else_branch, .. } => {
            collect_loop_vars(then_branch, out);
            if let Some(e) = else_branch {
                collect_loop_vars(e, out);
            }
        }
        Stmt::Allocate { body, .. }
        | Stmt::Produce { body, .. }
        | Stmt::Consume { body, .. }
        | Stmt::Acquire { body, .. } => collect_loop_vars(body, out),
        Stmt::Fork { producer, consumer } => {
            collect_loop_vars(producer, out);
            collect_loop_vars(consumer, out);
        }
        _ => {}
    }
}

fn collect_exprs(stmt: &Stmt, out: &mut Vec<ExprId>) {
    match stmt {
        Stmt::NoOp | Stmt::Release { .. } => {}
        Stmt::Block(stmts) => {
            for s in stmts {
                collect_exprs(s, out);
            }
        }
        Stmt::For { min, extent, body, .. } => {
            out.extend([*min, *extent]);
            collect_exprs(body, out);
        }
        Stmt::If { cond, then_branch, else_branch } => {
            // An If condition that is exactly likely(c) is also a candidate.
            out.push(*cond);
            collect_exprs(then_branch, out);
            if let Some(e) = else_branch {
                collect_exprs(e, out);
            }
        }
        Stmt::Store { indices, value, predicate, .. } => {
            out.extend(indices.iter().copied());
            out.push(*value);
            out.extend(predicate.iter().copied());
        }
        Stmt::Allocate { dims, body, .. } => {
            out.extend(dims.iter().flat_map(|d| [d.min, d.extent]));
            collect_exprs(body, out);
        }
        Stmt::Produce { body, .. } | Stmt::Consume { body, .. } | Stmt::Acquire { body, .. } => {
            collect_exprs(body, out)
        }
        Stmt::Fork { producer, consumer } => {
            collect_exprs(producer, out);
            collect_exprs(consumer, out);
        }
        Stmt::Assert { cond, .. } => out.push(*cond),
    }
}

/// Solve for the maximal interval of `var` on which `cond` has truth value
/// `want_true`. Returns (lo, hi) with `None` meaning unbounded on that side;
/// `None` overall when the crossing is not affine in `var`.
fn solve_steady(
    arena: &mut ExprArena,
    cond: ExprId,
    var: VarId,
    want_true: bool,
) -> Option<(Option<ExprId>, Option<ExprId>)> {
    let (op, a, b) = match arena.get(cond) {
        Expr::Binary(op @ (BinaryOp::Lt | BinaryOp::Le), a, b) => (*op, *a, *b),
        _ => return None,
    };
    let la = linear_of_expr(arena, a)?;
    let lb = linear_of_expr(arena, b)?;
    let diff = lb.sub(&la); // cond compares 0 against diff = b - a
    let c = diff.coeff(var);
    if c == 0 {
        return None;
    }
    let mut rest = diff.clone();
    rest.coeffs.remove(&var);
    let rest_e = rest.to_expr(arena);

    // Lt holds iff diff >= 1; Le holds iff diff >= 0.
    let lower_threshold = if op == BinaryOp::Lt { 1 } else { 0 };

    if want_true {
        // c*var >= t - rest
        let t = arena.int(lower_threshold);
        let m = arena.sub(t, rest_e);
        Some(bound_from(arena, c, m, true))
    } else {
        // diff <= t - 1  <=>  c*var <= t - 1 - rest
        let t = arena.int(lower_threshold - 1);
        let m = arena.sub(t, rest_e);
        Some(bound_from(arena, c, m, false))
    }
}

/// Solve `c*var >= m` (ge = true) or `c*var <= m` (ge = false) for var,
/// normalizing to a positive divisor.
fn bound_from(arena: &mut ExprArena, c: i64, m: ExprId, ge: bool) -> (Option<ExprId>, Option<ExprId>) {
    let lower = ge == (c > 0);
    let (num, den) = if c > 0 {
        (m, c)
    } else {
        let neg = arena.neg(m);
        let neg = simplify(arena, neg);
        (neg, -c)
    };
    let den_e = arena.int(den);
    let bound = if lower {
        // var >= ceil(num / den)
        let dm1 = arena.int(den - 1);
        let padded = arena.add(num, dm1);
        let e = arena.div(padded, den_e);
        simplify(arena, e)
    } else {
        // var <= floor(num / den)
        let e = arena.div(num, den_e);
        simplify(arena, e)
    };
    if lower {
        (Some(bound), None)
    } else {
        (None, Some(bound))
    }
}

/// Steady-state body: the hinted conditional is resolved to its likely form
/// and vanishes.
fn specialize_steady(arena: &mut ExprArena, body: &Stmt, hinted: &Hinted) -> Stmt {
    let mapped = body.map_exprs(arena, &mut |arena, e| {
        let rewritten = arena.rewrite(e, &mut |arena, id| match hinted {
            Hinted::SelectBranch { select, then_likely, .. } if id == *select => {
                let Expr::Select { then_val, else_val, .. } = arena.get(id).clone() else {
                    return None;
                };
                let branch = if *then_likely { then_val } else { else_val };
                Some(arena.strip_likely(branch))
            }
            Hinted::CondLikely { site, .. } if id == *site => Some(arena.boolean(true)),
            _ => None,
        });
        simplify(arena, rewritten)
    });
    cleanup_stmt(arena, mapped)
}

fn strip_likely_stmt(arena: &mut ExprArena, body: &Stmt) -> Stmt {
    body.map_exprs(arena, &mut |arena, e| {
        let stripped = arena.strip_likely(e);
        simplify(arena, stripped)
    })
}

/// Remove statement-level conditionals whose condition became constant.
fn cleanup_stmt(arena: &mut ExprArena, stmt: Stmt) -> Stmt {
    match stmt {
        Stmt::If { cond, then_branch, else_branch } => {
            let then_branch = cleanup_stmt(arena, *then_branch);
            let else_branch = else_branch.map(|e| cleanup_stmt(arena, *e));
            match arena.as_const(cond).and_then(|c| c.as_bool()) {
                Some(true) => then_branch,
                Some(false) => else_branch.unwrap_or(Stmt::NoOp),
                None => Stmt::If {
                    cond,
                    then_branch: Box::new(then_branch),
                    else_branch: else_branch.map(Box::new),
                },
            }
        }
        Stmt::Block(stmts) => Stmt::block(stmts.into_iter().map(|s| cleanup_stmt(arena, s)).collect()),
        Stmt::For { var, min, extent, kind, body } => {
            Stmt::For { var, min, extent, kind, body: Box::new(cleanup_stmt(arena, *body)) }
        }
        Stmt::Allocate { stage, ty, dims, body } => {
            Stmt::Allocate { stage, ty, dims, body: Box::new(cleanup_stmt(arena, *body)) }
        }
        Stmt::Produce { stage, body } => Stmt::Produce { stage, body: Box::new(cleanup_stmt(arena, *body)) },
        Stmt::Consume { stage, body } => Stmt::Consume { stage, body: Box::new(cleanup_stmt(arena, *body)) },
        Stmt::Acquire { sem, count, body } => {
            Stmt::Acquire { sem, count, body: Box::new(cleanup_stmt(arena, *body)) }
        }
        Stmt::Fork { producer, consumer } => Stmt::Fork {
            producer: Box::new(cleanup_stmt(arena, *producer)),
            consumer: Box::new(cleanup_stmt(arena, *consumer)),
        },
        other => other,
    }
}
