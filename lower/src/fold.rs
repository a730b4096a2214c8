//! Storage folding.
//!
//! A stage whose required window slides monotonically across an enclosing
//! loop does not need storage for its whole region: a circular buffer the
//! size of the maximum live window suffices, with every access rewritten
//! modulo the fold. The factor is either schedule-specified (validated
//! against the proven window) or computed: the exact maximum live window,
//! rounded up to a power of two only when a vectorized loop is in play on
//! the stage. Async stages get `window + advance` extra slack (at least
//! double buffering) so the producer may run ahead of the consumer.

use fresnel_graph::LoopTag;
use fresnel_ir::types::next_power_of_two;
use fresnel_ir::{
    bounds_of_expr, linear_of_expr, simplify, Expr, ExprArena, ExprId, Interval, Scope, StageId, Stmt,
    VarId,
};

use crate::bounds::{region_used_in, region_written_in, resolve_interval};
use crate::ctx::{LowerCtx, LowerState};
use crate::error::{Error, Result};

#[tracing::instrument(skip_all)]
pub fn fold_storage(ctx: &mut LowerCtx, stmt: Stmt) -> Result<Stmt> {
    let mut scope = Scope::new();
    let out = walk(ctx, stmt, &mut scope)?;
    ctx.advance_states(LowerState::Nested, LowerState::Folded);
    Ok(out)
}

fn walk(ctx: &mut LowerCtx, stmt: Stmt, scope: &mut Scope) -> Result<Stmt> {
    Ok(match stmt {
        Stmt::Allocate { stage, ty, mut dims, body } => {
            let body = walk(ctx, *body, scope)?;
            let folds = decide_folds(ctx, stage, &body, scope)?;
            let mut body = body;
            for (dim, factor) in folds {
                dims[dim].fold = Some(factor);
                dims[dim].extent = ctx.arena.int(factor);
                body = rewrite_accesses_mod(&mut ctx.arena, body, stage, dim, factor);
                tracing::debug!(stage = ctx.stage_name(stage), dim, factor, "storage folded");
            }
            Stmt::Allocate { stage, ty, dims, body: Box::new(body) }
        }
        Stmt::For { var, min, extent, kind, body } => {
            let lo = simplify(&mut ctx.arena, min);
            let one = ctx.arena.int(1);
            let sum = ctx.arena.add(min, extent);
            let hi = ctx.arena.sub(sum, one);
            let hi = simplify(&mut ctx.arena, hi);
            let prev = scope.insert(var, Interval::bounded(lo, hi));
            let body = walk(ctx, *body, scope)?;
            match prev {
                Some(p) => {
                    scope.insert(var, p);
                }
                None => {
                    scope.remove(&var);
                }
            }
            Stmt::For { var, min, extent, kind, body: Box::new(body) }
        }
        Stmt::Block(stmts) => {
            let mut out = Vec::with_capacity(stmts.len());
            for s in stmts {
                out.push(walk(ctx, s, scope)?);
            }
            Stmt::Block(out)
        }
        Stmt::If { cond, then_branch, else_branch } => Stmt::If {
            cond,
            then_branch: Box::new(walk(ctx, *then_branch, scope)?),
            else_branch: match else_branch {
                Some(e) => Some(Box::new(walk(ctx, *e, scope)?)),
                None => None,
            },
        },
        Stmt::Produce { stage, body } => Stmt::Produce { stage, body: Box::new(walk(ctx, *body, scope)?) },
        Stmt::Consume { stage, body } => Stmt::Consume { stage, body: Box::new(walk(ctx, *body, scope)?) },
        Stmt::Acquire { sem, count, body } => {
            Stmt::Acquire { sem, count, body: Box::new(walk(ctx, *body, scope)?) }
        }
        Stmt::Fork { producer, consumer } => Stmt::Fork {
            producer: Box::new(walk(ctx, *producer, scope)?),
            consumer: Box::new(walk(ctx, *consumer, scope)?),
        },
        other @ (Stmt::NoOp | Stmt::Store { .. } | Stmt::Release { .. } | Stmt::Assert { .. }) => other,
    })
}

/// The loop whose iterations reuse this allocation: the first loop under the
/// allocate body with a Produce of the stage directly inside it (not under a
/// deeper loop). Returns the loop var, its (min, extent), and a clone of its
/// body.
fn find_reuse_loop(stmt: &Stmt, stage: StageId) -> Option<(VarId, ExprId, ExprId, Stmt)> {
    match stmt {
        Stmt::For { var, min, extent, body, .. } => {
            if produce_directly_under(body, stage) {
                Some((*var, *min, *extent, (**body).clone()))
            } else {
                find_reuse_loop(body, stage)
            }
        }
        Stmt::Block(stmts) => stmts.iter().find_map(|s| find_reuse_loop(s, stage)),
        Stmt::If { then_branch, else_branch, .. } => find_reuse_loop(then_branch, stage)
            .or_else(|| else_branch.as_ref().and_then(|e| find_reuse_loop(e, stage))),
        Stmt::Allocate { body, .. }
        | Stmt::Produce { body, .. }
        | Stmt::Consume { body, .. }
        | Stmt::Acquire { body, .. } => find_reuse_loop(body, stage),
        Stmt::Fork { producer, consumer } => {
            find_reuse_loop(producer, stage).or_else(|| find_reuse_loop(consumer, stage))
        }
        _ => None,
    }
}

fn produce_directly_under(stmt: &Stmt, stage: StageId) -> bool {
    match stmt {
        Stmt::Produce { stage: s, .. } => *s == stage,
        Stmt::Block(stmts) => stmts.iter().any(|s| produce_directly_under(s, stage)),
        Stmt::Consume { body, .. } | Stmt::Acquire { body, .. } => produce_directly_under(body, stage),
        Stmt::If { then_branch, else_branch, .. } => {
            produce_directly_under(then_branch, stage)
                || else_branch.as_ref().map(|e| produce_directly_under(e, stage)).unwrap_or(false)
        }
        _ => false,
    }
}

/// Work out which dimensions of this allocation fold, and by how much.
fn decide_folds(
    ctx: &mut LowerCtx,
    stage: StageId,
    body: &Stmt,
    outer_scope: &Scope,
) -> Result<Vec<(usize, i64)>> {
    let explicit: Vec<(usize, i64)> = ctx.pipeline.stage(stage).func_schedule.folds.clone();
    let slid = ctx.slid.get(&stage).copied();
    let is_async = ctx.pipeline.stage(stage).func_schedule.is_async;

    let reuse = find_reuse_loop(body, stage);
    let window_info = match &reuse {
        Some((var, min, extent, loop_body)) => {
            windowed_touch(ctx, stage, *var, *min, *extent, loop_body, body, outer_scope)
        }
        None => whole_body_touch(ctx, stage, body, outer_scope),
    };

    let mut out = Vec::new();

    for (dim, factor) in &explicit {
        let window = match window_info.as_ref().and_then(|w| w.window(*dim)) {
            Some(w) => w,
            None => {
                return Err(Error::FoldNotProvable { stage: ctx.stage_name(stage).to_string(), dim: *dim })
            }
        };
        if *factor < window {
            return Err(Error::FoldFactorTooSmall {
                stage: ctx.stage_name(stage).to_string(),
                dim: *dim,
                factor: *factor,
                window,
            });
        }
        out.push((*dim, *factor));
    }

    // Automatic folding of the slid dimension.
    if let Some(info) = slid {
        if !explicit.iter().any(|(d, _)| *d == info.dim) {
            if let Some(w) = window_info.as_ref() {
                if let Some(window) = w.window(info.dim) {
                    let advance = if is_async { w.advance(info.dim).max(1) } else { 0 };
                    let mut factor = window + advance;
                    if vectorize_in_play(ctx, stage) {
                        factor = next_power_of_two(factor);
                    }
                    if is_async {
                        factor = factor.max(2);
                    }
                    out.push((info.dim, factor));
                } else if is_async {
                    return Err(Error::AsyncRequiresFold { stage: ctx.stage_name(stage).to_string() });
                }
            } else if is_async {
                return Err(Error::AsyncRequiresFold { stage: ctx.stage_name(stage).to_string() });
            }
        }
    } else if is_async {
        return Err(Error::AsyncRequiresFold { stage: ctx.stage_name(stage).to_string() });
    }

    Ok(out)
}

/// Per-dimension proven window and advance for one allocation.
struct TouchInfo {
    /// Constant maximum live width per dimension (None = not provable).
    windows: Vec<Option<i64>>,
    /// Per-iteration advance of the window per dimension.
    advances: Vec<i64>,
}

impl TouchInfo {
    fn window(&self, dim: usize) -> Option<i64> {
        self.windows.get(dim).copied().flatten()
    }

    fn advance(&self, dim: usize) -> i64 {
        self.advances.get(dim).copied().unwrap_or(0)
    }
}

/// Window analysis when a reuse loop exists: regions are derived over the
/// loop *body* (the loop variable stays symbolic), monotonicity is certified
/// from the affine form in the loop variable, and the width is then bounded
/// over the loop range and every enclosing loop.
#[allow(clippy::too_many_arguments)]
fn windowed_touch(
    ctx: &mut LowerCtx,
    stage: StageId,
    var: VarId,
    loop_min: ExprId,
    loop_extent: ExprId,
    loop_body: &Stmt,
    whole_body: &Stmt,
    outer_scope: &Scope,
) -> Option<TouchInfo> {
    // Every access must happen inside the reuse loop, otherwise values read
    // elsewhere could be clobbered by the wraparound.
    let total = crate::nest::count_reads(&ctx.arena, whole_body, stage);
    let inside = crate::nest::count_reads(&ctx.arena, loop_body, stage);
    if total != inside {
        return None;
    }

    let used = region_used_in(&mut ctx.arena, loop_body, stage);
    let written = region_written_in(&mut ctx.arena, loop_body, stage);
    let touched = match (used.clone(), written) {
        (Some(u), Some(w)) => u.union(&w, &mut ctx.arena),
        (Some(u), None) => u,
        (None, Some(w)) => w,
        (None, None) => return None,
    };

    let slid_here = ctx.slid.get(&stage).map(|i| i.loop_var == var).unwrap_or(false);

    let mut scope = outer_scope.clone();
    let one = ctx.arena.int(1);
    let sum = ctx.arena.add(loop_min, loop_extent);
    let hi = ctx.arena.sub(sum, one);
    let hi = simplify(&mut ctx.arena, hi);
    let lo = simplify(&mut ctx.arena, loop_min);
    scope.insert(var, Interval::bounded(lo, hi));

    let mut windows = Vec::with_capacity(touched.len());
    let mut advances = Vec::with_capacity(touched.len());
    for dim in 0..touched.len() {
        let iv = &touched[dim];
        let (window, advance) = match (iv.min, iv.max) {
            (Some(lo_e), Some(hi_e)) => {
                // Monotone movement: certified by the sliding pass, or from
                // the affine form directly.
                let monotone = slid_here || {
                    let lmin = linear_of_expr(&ctx.arena, lo_e);
                    let lmax = linear_of_expr(&ctx.arena, hi_e);
                    match (lmin, lmax) {
                        (Some(a), Some(b)) => {
                            let (ca, cb) = (a.coeff(var), b.coeff(var));
                            (ca >= 0 && cb >= 0) || (ca <= 0 && cb <= 0)
                        }
                        _ => false,
                    }
                };
                if !monotone {
                    (None, 0)
                } else {
                    let span = ctx.arena.sub(hi_e, lo_e);
                    let width = ctx.arena.add(span, one);
                    let width = simplify(&mut ctx.arena, width);
                    let bounded = bounds_of_expr(&mut ctx.arena, width, &scope);
                    let bounded = resolve_interval(&mut ctx.arena, bounded, &scope);
                    let w = bounded.max.and_then(|m| ctx.arena.as_const_int(m));

                    let adv = used
                        .as_ref()
                        .and_then(|u| u.0.get(dim))
                        .map(|u| {
                            let c = |e: Option<ExprId>| {
                                e.and_then(|e| linear_of_expr(&ctx.arena, e))
                                    .map(|l| l.coeff(var).abs())
                                    .unwrap_or(0)
                            };
                            c(u.min).max(c(u.max))
                        })
                        .unwrap_or(0);
                    (w, adv)
                }
            }
            _ => (None, 0),
        };
        windows.push(window);
        advances.push(advance);
    }
    Some(TouchInfo { windows, advances })
}

/// No reuse loop: the storage is private to one pass over the body, so any
/// fold covering the whole touched width is safe.
fn whole_body_touch(ctx: &mut LowerCtx, stage: StageId, body: &Stmt, outer_scope: &Scope) -> Option<TouchInfo> {
    let used = region_used_in(&mut ctx.arena, body, stage);
    let written = region_written_in(&mut ctx.arena, body, stage);
    let touched = match (used, written) {
        (Some(u), Some(w)) => u.union(&w, &mut ctx.arena),
        (Some(u), None) => u,
        (None, Some(w)) => w,
        (None, None) => return None,
    };
    let one = ctx.arena.int(1);
    let mut windows = Vec::with_capacity(touched.len());
    for iv in touched.0.iter() {
        let w = match (iv.min, iv.max) {
            (Some(lo), Some(hi)) => {
                let span = ctx.arena.sub(hi, lo);
                let width = ctx.arena.add(span, one);
                let width = simplify(&mut ctx.arena, width);
                let bounded = bounds_of_expr(&mut ctx.arena, width, outer_scope);
                let bounded = resolve_interval(&mut ctx.arena, bounded, outer_scope);
                bounded.max.and_then(|m| ctx.arena.as_const_int(m))
            }
            _ => None,
        };
        windows.push(w);
    }
    let advances = vec![0; windows.len()];
    Some(TouchInfo { windows, advances })
}

fn vectorize_in_play(ctx: &LowerCtx, stage: StageId) -> bool {
    ctx.resolved
        .stage(stage)
        .pure_dims
        .iter()
        .chain(ctx.resolved.stage(stage).update_dims.iter().flatten())
        .any(|d| matches!(d.tag, LoopTag::Vectorize(_)))
}

/// Rewrite every access to `stage` under `stmt` so index `dim` wraps modulo
/// the fold extent.
fn rewrite_accesses_mod(arena: &mut ExprArena, stmt: Stmt, stage: StageId, dim: usize, factor: i64) -> Stmt {
    let mapped = stmt.map_exprs(arena, &mut |arena, e| {
        arena.rewrite(e, &mut |arena, id| match arena.get(id).clone() {
            Expr::Read { stage: s, indices } if s == stage => {
                let mut indices = indices;
                if dim < indices.len() {
                    let f = arena.int(factor);
                    indices[dim] = arena.modulo(indices[dim], f);
                }
                Some(arena.intern(Expr::Read { stage: s, indices }))
            }
            _ => None,
        })
    });
    // Store indices live on the statement, not inside an expression.
    fold_store_indices(arena, mapped, stage, dim, factor)
}

fn fold_store_indices(arena: &mut ExprArena, stmt: Stmt, stage: StageId, dim: usize, factor: i64) -> Stmt {
    match stmt {
        Stmt::Store { stage: s, mut indices, value, atomic, predicate } => {
            if s == stage && dim < indices.len() {
                let f = arena.int(factor);
                indices[dim] = arena.modulo(indices[dim], f);
            }
            Stmt::Store { stage: s, indices, value, atomic, predicate }
        }
        Stmt::Block(stmts) => {
            Stmt::Block(stmts.into_iter().map(|s| fold_store_indices(arena, s, stage, dim, factor)).collect())
        }
        Stmt::For { var, min, extent, kind, body } => Stmt::For {
            var,
            min,
            extent,
            kind,
            body: Box::new(fold_store_indices(arena, *body, stage, dim, factor)),
        },
        Stmt::If { cond, then_branch, else_branch } => Stmt::If {
            cond,
            then_branch: Box::new(fold_store_indices(arena, *then_branch, stage, dim, factor)),
            else_branch: else_branch.map(|e| Box::new(fold_store_indices(arena, *e, stage, dim, factor))),
        },
        Stmt::Allocate { stage: a, ty, dims, body } => Stmt::Allocate {
            stage: a,
            ty,
            dims,
            body: Box::new(fold_store_indices(arena, *body, stage, dim, factor)),
        },
        Stmt::Produce { stage: p, body } => {
            Stmt::Produce { stage: p, body: Box::new(fold_store_indices(arena, *body, stage, dim, factor)) }
        }
        Stmt::Consume { stage: c, body } => {
            Stmt::Consume { stage: c, body: Box::new(fold_store_indices(arena, *body, stage, dim, factor)) }
        }
        Stmt::Acquire { sem, count, body } => {
            Stmt::Acquire { sem, count, body: Box::new(fold_store_indices(arena, *body, stage, dim, factor)) }
        }
        Stmt::Fork { producer, consumer } => Stmt::Fork {
            producer: Box::new(fold_store_indices(arena, *producer, stage, dim, factor)),
            consumer: Box::new(fold_store_indices(arena, *consumer, stage, dim, factor)),
        },
        other => other,
    }
}
