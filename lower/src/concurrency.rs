//! Concurrency lowering.
//!
//! Final rewrite of the abstract loop tags:
//!
//! - Parallel loops survive as the fork-join construct, but every store
//!   under one must either be proven disjoint across iterations (affine
//!   index analysis), live in storage private to the loop body, or carry an
//!   atomic annotation. Anything else is a `ParallelRace` error - safety is
//!   never silently assumed.
//! - Atomic annotations on provably disjoint (or unparallelized) stores are
//!   dropped: the non-contended plain store is preferred.
//! - Vectorized loops are replaced by `Ramp`-substituted wide bodies; a body
//!   that cannot widen (an inner loop or branch depending on the lane)
//!   scalarizes instead - correctness first, width second.
//! - Unrolled loops become literal copies of the body.

use std::collections::HashSet;

use fresnel_ir::{
    can_prove_le, simplify, AtomicKind, ExprArena, ExprId, ForKind, Interval, Scope, StageId, Stmt,
    VarId,
};

use crate::ctx::{LowerCtx, LowerState};
use crate::error::{Error, Result};

#[tracing::instrument(skip_all)]
pub fn lower_concurrency(ctx: &mut LowerCtx, stmt: Stmt) -> Result<Stmt> {
    let mut frames: Vec<ParallelFrame> = Vec::new();
    let stmt = check_parallel(ctx, stmt, &mut frames)?;
    let stmt = expand_loops(ctx, stmt)?;
    for s in &mut ctx.states {
        if *s >= LowerState::Nested && *s < LowerState::ConcurrencyLowered {
            *s = LowerState::ConcurrencyLowered;
        }
    }
    Ok(stmt)
}

/// One enclosing parallel loop: its variable, the loop variables bound
/// inside it so far, and the stages whose storage is private to its body.
struct ParallelFrame {
    var: VarId,
    inner: Scope,
    private_stages: HashSet<StageId>,
}

fn check_parallel(ctx: &mut LowerCtx, stmt: Stmt, frames: &mut Vec<ParallelFrame>) -> Result<Stmt> {
    Ok(match stmt {
        Stmt::For { var, min, extent, kind, body } => {
            let parallel = kind == ForKind::Parallel;
            if parallel {
                frames.push(ParallelFrame { var, inner: Scope::new(), private_stages: HashSet::new() });
            } else {
                let one = ctx.arena.int(1);
                let sum = ctx.arena.add(min, extent);
                let hi = ctx.arena.sub(sum, one);
                let hi = simplify(&mut ctx.arena, hi);
                let lo = simplify(&mut ctx.arena, min);
                for f in frames.iter_mut() {
                    f.inner.insert(var, Interval::bounded(lo, hi));
                }
            }
            let body = check_parallel(ctx, *body, frames)?;
            if parallel {
                frames.pop();
            } else {
                for f in frames.iter_mut() {
                    f.inner.remove(&var);
                }
            }
            Stmt::For { var, min, extent, kind, body: Box::new(body) }
        }
        Stmt::Allocate { stage, ty, dims, body } => {
            for f in frames.iter_mut() {
                f.private_stages.insert(stage);
            }
            let body = check_parallel(ctx, *body, frames)?;
            for f in frames.iter_mut() {
                f.private_stages.remove(&stage);
            }
            Stmt::Allocate { stage, ty, dims, body: Box::new(body) }
        }
        Stmt::Store { stage, indices, value, atomic, predicate } => {
            let mut contended = false;
            for i in 0..frames.len() {
                let frame = &frames[i];
                if frame.private_stages.contains(&stage) {
                    continue;
                }
                let scope = frame.inner.clone();
                let var = frame.var;
                if !stores_disjoint(&mut ctx.arena, &indices, var, &scope) {
                    contended = true;
                    if atomic == AtomicKind::NonAtomic {
                        return Err(Error::ParallelRace {
                            stage: ctx.stage_name(stage).to_string(),
                            var: ctx.arena.var_name(var).to_string(),
                        });
                    }
                }
            }
            // Prefer the plain store when no interleaving is possible.
            let atomic = if contended { atomic } else { AtomicKind::NonAtomic };
            Stmt::Store { stage, indices, value, atomic, predicate }
        }
        Stmt::Block(stmts) => {
            let mut out = Vec::with_capacity(stmts.len());
            for s in stmts {
                out.push(check_parallel(ctx, s, frames)?);
            }
            Stmt::Block(out)
        }
        Stmt::If { cond, then_branch, else_branch } => Stmt::If {
            cond,
            then_branch: Box::new(check_parallel(ctx, *then_branch, frames)?),
            else_branch: match else_branch {
                Some(e) => Some(Box::new(check_parallel(ctx, *e, frames)?)),
                None => None,
            },
        },
        Stmt::Produce { stage, body } => {
            Stmt::Produce { stage, body: Box::new(check_parallel(ctx, *body, frames)?) }
        }
        Stmt::Consume { stage, body } => {
            Stmt::Consume { stage, body: Box::new(check_parallel(ctx, *body, frames)?) }
        }
        Stmt::Acquire { sem, count, body } => {
            Stmt::Acquire { sem, count, body: Box::new(check_parallel(ctx, *body, frames)?) }
        }
        Stmt::Fork { producer, consumer } => Stmt::Fork {
            producer: Box::new(check_parallel(ctx, *producer, frames)?),
            consumer: Box::new(check_parallel(ctx, *consumer, frames)?),
        },
        other => other,
    })
}

/// Can two distinct iterations of `var` write the same location? Proven
/// impossible when some index dimension's image at iteration `v` ends
/// strictly before the image at `v + 1` begins (or the mirrored decreasing
/// form).
fn stores_disjoint(arena: &mut ExprArena, indices: &[ExprId], var: VarId, inner: &Scope) -> bool {
    for idx in indices {
        let iv = fresnel_ir::bounds_of_expr(arena, *idx, inner);
        let iv = crate::bounds::resolve_interval(arena, iv, inner);
        let (Some(lo), Some(hi)) = (iv.min, iv.max) else { continue };

        let one = arena.int(1);
        let ve = arena.var(var);
        let next = arena.add(ve, one);

        // Increasing: max(v) < min(v + 1).
        let next_lo = arena.substitute_var(lo, var, next);
        let hi_plus = arena.add(hi, one);
        let hi_plus = simplify(arena, hi_plus);
        if can_prove_le(arena, hi_plus, next_lo) {
            return true;
        }
        // Decreasing: max(v + 1) < min(v).
        let next_hi = arena.substitute_var(hi, var, next);
        let next_hi_plus = arena.add(next_hi, one);
        let next_hi_plus = simplify(arena, next_hi_plus);
        if can_prove_le(arena, next_hi_plus, lo) {
            return true;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Vectorize / unroll expansion
// ---------------------------------------------------------------------------

fn expand_loops(ctx: &mut LowerCtx, stmt: Stmt) -> Result<Stmt> {
    Ok(match stmt {
        Stmt::For { var, min, extent, kind, body } => {
            let body = expand_loops(ctx, *body)?;
            match kind {
                ForKind::Vectorized(n) => vectorize_loop(ctx, var, min, extent, n, body)?,
                ForKind::Unrolled(n) => unroll_loop(ctx, var, min, extent, n, body)?,
                _ => Stmt::For { var, min, extent, kind, body: Box::new(body) },
            }
        }
        Stmt::Block(stmts) => {
            let mut out = Vec::with_capacity(stmts.len());
            for s in stmts {
                out.push(expand_loops(ctx, s)?);
            }
            Stmt::block(out)
        }
        Stmt::If { cond, then_branch, else_branch } => Stmt::If {
            cond,
            then_branch: Box::new(expand_loops(ctx, *then_branch)?),
            else_branch: match else_branch {
                Some(e) => Some(Box::new(expand_loops(ctx, *e)?)),
                None => None,
            },
        },
        Stmt::Allocate { stage, ty, dims, body } => {
            Stmt::Allocate { stage, ty, dims, body: Box::new(expand_loops(ctx, *body)?) }
        }
        Stmt::Produce { stage, body } => Stmt::Produce { stage, body: Box::new(expand_loops(ctx, *body)?) },
        Stmt::Consume { stage, body } => Stmt::Consume { stage, body: Box::new(expand_loops(ctx, *body)?) },
        Stmt::Acquire { sem, count, body } => {
            Stmt::Acquire { sem, count, body: Box::new(expand_loops(ctx, *body)?) }
        }
        Stmt::Fork { producer, consumer } => Stmt::Fork {
            producer: Box::new(expand_loops(ctx, *producer)?),
            consumer: Box::new(expand_loops(ctx, *consumer)?),
        },
        other => other,
    })
}

fn constant_extent(ctx: &mut LowerCtx, extent: ExprId) -> Option<i64> {
    let e = simplify(&mut ctx.arena, extent);
    ctx.arena.as_const_int(e)
}

fn vectorize_loop(
    ctx: &mut LowerCtx,
    var: VarId,
    min: ExprId,
    extent: ExprId,
    n: u32,
    body: Stmt,
) -> Result<Stmt> {
    match constant_extent(ctx, extent) {
        Some(e) if e == n as i64 => {}
        _ => {
            return Err(Error::VectorizeNonConstant {
                var: ctx.arena.var_name(var).to_string(),
                what: "vectorized".to_string(),
                lanes: n,
            })
        }
    }
    let one = ctx.arena.int(1);
    let ramp = ctx.arena.ramp(min, one, n);
    let wide = body.substitute_var(&mut ctx.arena, var, ramp);
    if widens_cleanly(&ctx.arena, &wide) {
        Ok(wide)
    } else {
        // Lane-dependent control flow: keep the scalar loop.
        tracing::debug!(var = ctx.arena.var_name(var), "vector body scalarized");
        Ok(Stmt::For { var, min, extent, kind: ForKind::Serial, body: Box::new(body) })
    }
}

/// A widened body is clean when no statement-level construct depends on the
/// lane: branch conditions, loop bounds, allocation extents and assertions
/// must stay scalar.
fn widens_cleanly(arena: &ExprArena, stmt: &Stmt) -> bool {
    match stmt {
        Stmt::NoOp | Stmt::Release { .. } => true,
        Stmt::Block(stmts) => stmts.iter().all(|s| widens_cleanly(arena, s)),
        Stmt::For { min, extent, body, .. } => {
            arena.lanes(*min) == 1 && arena.lanes(*extent) == 1 && widens_cleanly(arena, body)
        }
        Stmt::If { cond, then_branch, else_branch } => {
            arena.lanes(*cond) == 1
                && widens_cleanly(arena, then_branch)
                && else_branch.as_ref().map(|e| widens_cleanly(arena, e)).unwrap_or(true)
        }
        Stmt::Store { .. } => true,
        Stmt::Allocate { dims, body, .. } => {
            dims.iter().all(|d| arena.lanes(d.min) == 1 && arena.lanes(d.extent) == 1)
                && widens_cleanly(arena, body)
        }
        Stmt::Produce { body, .. } | Stmt::Consume { body, .. } | Stmt::Acquire { body, .. } => {
            widens_cleanly(arena, body)
        }
        Stmt::Fork { producer, consumer } => widens_cleanly(arena, producer) && widens_cleanly(arena, consumer),
        Stmt::Assert { cond, .. } => arena.lanes(*cond) == 1,
    }
}

fn unroll_loop(
    ctx: &mut LowerCtx,
    var: VarId,
    min: ExprId,
    extent: ExprId,
    n: u32,
    body: Stmt,
) -> Result<Stmt> {
    match constant_extent(ctx, extent) {
        Some(e) if e == n as i64 => {}
        _ => {
            return Err(Error::VectorizeNonConstant {
                var: ctx.arena.var_name(var).to_string(),
                what: "unrolled".to_string(),
                lanes: n,
            })
        }
    }
    let mut copies = Vec::with_capacity(n as usize);
    for i in 0..n as i64 {
        let off = ctx.arena.int(i);
        let at = ctx.arena.add(min, off);
        let at = simplify(&mut ctx.arena, at);
        copies.push(body.substitute_var(&mut ctx.arena, var, at));
    }
    Ok(Stmt::block(copies))
}
