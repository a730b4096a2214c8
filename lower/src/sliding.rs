//! Sliding-window analysis.
//!
//! When a stage's storage lives outside a serial loop but its values are
//! produced inside it, and the required region slides monotonically as the
//! loop advances, the production is rewritten to compute only the newly
//! required slice each iteration:
//!
//! ```text
//! new_min = select(v <= v.loop_min, min(v), likely(max(v - 1) + 1))
//! ```
//!
//! The warm-up iteration computes the full window; every later iteration
//! computes exactly the new values (the `likely` hint lets loop partitioning
//! peel the warm-up off). Monotonicity is certified from the affine form of
//! the region bounds in the loop variable; anything non-affine simply keeps
//! full recomputation. A region constant in the loop variable degenerates to
//! compute-once, which is exactly the reuse a store-outside/compute-inside
//! schedule asks for.

use std::collections::HashSet;

use fresnel_ir::{linear_of_expr, simplify, ExprId, ForKind, StageId, Stmt, VarId};

use crate::ctx::{LowerCtx, SlideInfo};
use crate::error::Result;

#[tracing::instrument(skip_all)]
pub fn sliding_window(ctx: &mut LowerCtx, stmt: Stmt) -> Result<Stmt> {
    let mut outside = HashSet::new();
    walk(ctx, stmt, &mut outside)
}

fn walk(ctx: &mut LowerCtx, stmt: Stmt, alloc_outside: &mut HashSet<StageId>) -> Result<Stmt> {
    Ok(match stmt {
        Stmt::Allocate { stage, ty, dims, body } => {
            alloc_outside.insert(stage);
            let body = walk(ctx, *body, alloc_outside)?;
            alloc_outside.remove(&stage);
            Stmt::Allocate { stage, ty, dims, body: Box::new(body) }
        }
        Stmt::For { var, min, extent, kind, body } => {
            let mut body = walk(ctx, *body, alloc_outside)?;
            if kind == ForKind::Serial {
                slide_produces_under(ctx, var, min, &mut body, alloc_outside)?;
            }
            Stmt::For { var, min, extent, kind, body: Box::new(body) }
        }
        Stmt::Block(stmts) => {
            let mut out = Vec::with_capacity(stmts.len());
            for s in stmts {
                out.push(walk(ctx, s, alloc_outside)?);
            }
            Stmt::Block(out)
        }
        Stmt::If { cond, then_branch, else_branch } => Stmt::If {
            cond,
            then_branch: Box::new(walk(ctx, *then_branch, alloc_outside)?),
            else_branch: match else_branch {
                Some(e) => Some(Box::new(walk(ctx, *e, alloc_outside)?)),
                None => None,
            },
        },
        Stmt::Produce { stage, body } => {
            Stmt::Produce { stage, body: Box::new(walk(ctx, *body, alloc_outside)?) }
        }
        Stmt::Consume { stage, body } => {
            Stmt::Consume { stage, body: Box::new(walk(ctx, *body, alloc_outside)?) }
        }
        Stmt::Acquire { sem, count, body } => {
            Stmt::Acquire { sem, count, body: Box::new(walk(ctx, *body, alloc_outside)?) }
        }
        Stmt::Fork { producer, consumer } => Stmt::Fork {
            producer: Box::new(walk(ctx, *producer, alloc_outside)?),
            consumer: Box::new(walk(ctx, *consumer, alloc_outside)?),
        },
        other @ (Stmt::NoOp | Stmt::Store { .. } | Stmt::Release { .. } | Stmt::Assert { .. }) => other,
    })
}

/// Rewrite every Produce directly under this loop (not nested in a deeper
/// loop) whose storage lives outside it.
fn slide_produces_under(
    ctx: &mut LowerCtx,
    loop_var: VarId,
    loop_min: ExprId,
    body: &mut Stmt,
    alloc_outside: &HashSet<StageId>,
) -> Result<()> {
    match body {
        Stmt::Block(stmts) => {
            for s in stmts {
                slide_produces_under(ctx, loop_var, loop_min, s, alloc_outside)?;
            }
        }
        Stmt::Consume { body, .. } | Stmt::If { then_branch: body, .. } | Stmt::Acquire { body, .. } => {
            slide_produces_under(ctx, loop_var, loop_min, body, alloc_outside)?;
        }
        Stmt::Produce { stage, body } => {
            let s = *stage;
            if alloc_outside.contains(&s)
                && !ctx.slid.contains_key(&s)
                && ctx.eff[s.0 as usize].updates.is_empty()
            {
                try_slide(ctx, s, loop_var, loop_min, body)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn try_slide(
    ctx: &mut LowerCtx,
    s: StageId,
    loop_var: VarId,
    loop_min: ExprId,
    produce_body: &mut Stmt,
) -> Result<()> {
    let dims: Vec<VarId> = ctx.pipeline.stage(s).dims.to_vec();

    // Per-dimension affine movement in the loop variable, where provable.
    let mut movement: Vec<Option<(ExprId, ExprId, i64, i64)>> = Vec::with_capacity(dims.len());
    for dim_var in &dims {
        let info = loop_bounds_of(produce_body, *dim_var).and_then(|(old_min, old_extent)| {
            let one = ctx.arena.int(1);
            let span = ctx.arena.sub(old_extent, one);
            let sum = ctx.arena.add(old_min, span);
            let old_max = simplify(&mut ctx.arena, sum);
            let lmin = linear_of_expr(&ctx.arena, old_min)?;
            let lmax = linear_of_expr(&ctx.arena, old_max)?;
            Some((old_min, old_max, lmin.coeff(loop_var), lmax.coeff(loop_var)))
        });
        movement.push(info);
    }

    // Prefer a strictly moving dimension. A dimension constant in the loop
    // variable degenerates to compute-once, but that collapses the whole
    // nest, so it is only sound when *every* dimension is invariant.
    let moving = dims.iter().enumerate().find(|(d, _)| {
        matches!(movement[*d], Some((_, _, cmin, cmax))
            if ((cmin >= 0 && cmax >= 0) || (cmin <= 0 && cmax <= 0)) && (cmin != 0 || cmax != 0))
    });
    let all_invariant =
        !dims.is_empty() && movement.iter().all(|m| matches!(m, Some((_, _, 0, 0))));
    let chosen = match (moving, all_invariant) {
        (Some((d, v)), _) => Some((d, *v)),
        (None, true) => Some((0, dims[0])),
        (None, false) => None,
    };

    if let Some((d, dim_var)) = chosen {
        let (old_min, old_max, cmin, cmax) = movement[d].expect("chosen dim has movement info");
        let increasing = cmin >= 0 && cmax >= 0;

        let one = ctx.arena.int(1);
        let loop_var_e = ctx.arena.var(loop_var);
        let prev_iter = ctx.arena.sub(loop_var_e, one);
        let warm_cond = ctx.arena.le(loop_var_e, loop_min);

        let (new_min, new_max) = if increasing {
            // Steady state starts one past the previous iteration's max.
            let prev_max = ctx.arena.substitute_var(old_max, loop_var, prev_iter);
            let steady = ctx.arena.add(prev_max, one);
            let steady = simplify(&mut ctx.arena, steady);
            let steady = ctx.arena.likely(steady);
            let min = ctx.arena.select(warm_cond, old_min, steady);
            (min, old_max)
        } else {
            let prev_min = ctx.arena.substitute_var(old_min, loop_var, prev_iter);
            let steady = ctx.arena.sub(prev_min, one);
            let steady = simplify(&mut ctx.arena, steady);
            let steady = ctx.arena.likely(steady);
            let max = ctx.arena.select(warm_cond, old_max, steady);
            (old_min, max)
        };

        let diff = ctx.arena.sub(new_max, new_min);
        let new_extent = ctx.arena.add(diff, one);
        let new_extent = simplify(&mut ctx.arena, new_extent);

        if set_loop_bounds(produce_body, dim_var, new_min, new_extent) {
            tracing::debug!(
                stage = ctx.stage_name(s),
                dim = d,
                over = ctx.arena.var_name(loop_var),
                increasing,
                "sliding window applied"
            );
            ctx.slid.insert(s, SlideInfo { loop_var, dim: d, increasing });
        }
    }
    Ok(())
}

/// (min, extent) of the first loop over `var`, searching through everything
/// but nested produce/consume boundaries.
fn loop_bounds_of(stmt: &Stmt, var: VarId) -> Option<(ExprId, ExprId)> {
    match stmt {
        Stmt::For { var: v, min, extent, .. } if *v == var => Some((*min, *extent)),
        Stmt::For { body, .. }
        | Stmt::Allocate { body, .. }
        | Stmt::Produce { body, .. }
        | Stmt::Consume { body, .. }
        | Stmt::Acquire { body, .. } => loop_bounds_of(body, var),
        Stmt::Block(stmts) => stmts.iter().find_map(|s| loop_bounds_of(s, var)),
        Stmt::If { then_branch, else_branch, .. } => loop_bounds_of(then_branch, var)
            .or_else(|| else_branch.as_ref().and_then(|e| loop_bounds_of(e, var))),
        _ => None,
    }
}

fn set_loop_bounds(stmt: &mut Stmt, var: VarId, new_min: ExprId, new_extent: ExprId) -> bool {
    match stmt {
        Stmt::For { var: v, min, extent, .. } if *v == var => {
            *min = new_min;
            *extent = new_extent;
            true
        }
        Stmt::For { body, .. }
        | Stmt::Allocate { body, .. }
        | Stmt::Produce { body, .. }
        | Stmt::Consume { body, .. }
        | Stmt::Acquire { body, .. } => set_loop_bounds(body, var, new_min, new_extent),
        Stmt::Block(stmts) => stmts.iter_mut().any(|s| set_loop_bounds(s, var, new_min, new_extent)),
        Stmt::If { then_branch, else_branch, .. } => {
            set_loop_bounds(then_branch, var, new_min, new_extent)
                || else_branch.as_mut().map(|e| set_loop_bounds(e, var, new_min, new_extent)).unwrap_or(false)
        }
        _ => false,
    }
}
