//! Bounds inference.
//!
//! Two layers share one interval-arithmetic core:
//!
//! - [`infer_root_regions`] processes stages in reverse topological order
//!   (consumers before producers) and computes the concrete whole-pipeline
//!   region of every realized stage: the image of each consumer's region
//!   under the call-site index expressions, unioned across call sites, with
//!   reduction-domain variables tightened by their provable predicate
//!   bounds. Pinned regions short-circuit inference but are checked to
//!   cover every required image.
//!
//! - [`region_used_in`] / [`region_written_in`] derive the same regions
//!   over a subtree of the synthesized loop nest, binding only the loop
//!   variables inside that subtree. Loop variables outer to the subtree stay
//!   symbolic, which is exactly the parameterized per-iteration region that
//!   loop-nest synthesis, sliding-window analysis and storage folding need.

use fresnel_ir::{
    bounds_of_expr, linear_of_expr, simplify, BinaryOp, Expr, ExprArena, ExprId, Interval, Region,
    Scope, StageId, Stmt, VarId,
};
use smallvec::SmallVec;

use crate::ctx::{LowerCtx, LowerState};
use crate::error::{internal, Error, Result};

/// Every expression of a stage after inline substitution.
pub fn eff_exprs(ctx: &LowerCtx, s: StageId) -> Vec<ExprId> {
    let eff = &ctx.eff[s.0 as usize];
    let mut out = vec![eff.pure_value];
    for u in &eff.updates {
        out.extend(u.args.iter().copied());
        out.push(u.value);
        if let Some(rd) = &u.rdom {
            out.extend(rd.vars.iter().flat_map(|(_, min, extent)| [*min, *extent]));
            if let Some(p) = rd.predicate {
                out.push(p);
            }
        }
    }
    out
}

/// Direct consumers of each stage over the inline-substituted expressions
/// (self-edges excluded). Inline stages are not consumers: their reads were
/// substituted into the realized stages that absorbed them.
pub fn eff_consumers(ctx: &LowerCtx) -> Vec<Vec<StageId>> {
    use fresnel_graph::Anchor;
    let mut consumers = vec![Vec::new(); ctx.pipeline.stages.len()];
    for s in ctx.pipeline.stage_ids() {
        if ctx.resolved.stage(s).compute == Anchor::Inline {
            continue;
        }
        let mut reads = Vec::new();
        for e in eff_exprs(ctx, s) {
            ctx.arena.collect_reads(e, &mut reads);
        }
        let mut callees: Vec<StageId> = reads.into_iter().map(|(t, _)| t).filter(|t| *t != s).collect();
        callees.sort();
        callees.dedup();
        for t in callees {
            consumers[t.0 as usize].push(s);
        }
    }
    consumers
}

/// A stage is realized when it is neither inline nor dead (unconsumed and
/// not the output).
pub fn is_realized(ctx: &LowerCtx, consumers: &[Vec<StageId>], output: StageId, s: StageId) -> bool {
    use fresnel_graph::Anchor;
    if ctx.resolved.stage(s).compute == Anchor::Inline {
        return false;
    }
    s == output || !consumers[s.0 as usize].is_empty()
}

#[tracing::instrument(skip_all)]
pub fn infer_root_regions(ctx: &mut LowerCtx, output: StageId, output_region: &[(i64, i64)]) -> Result<()> {
    let consumers = eff_consumers(ctx);
    let order: Vec<StageId> = ctx.resolved.order.iter().rev().copied().collect();

    for s in order {
        if !is_realized(ctx, &consumers, output, s) {
            continue;
        }
        let rank = ctx.pipeline.stage(s).rank();

        let mut region = if s == output {
            region_from_pairs(&mut ctx.arena, output_region)
        } else {
            let mut region: Option<Region> = None;
            for d in &consumers[s.0 as usize] {
                let scope = stage_root_scope(ctx, *d)?;
                accumulate_images(ctx, *d, s, &scope, &mut region)?;
            }
            region.ok_or_else(|| internal("bounds", ctx.stage_name(s), "consumed stage has no read images"))?
        };

        // One self-expansion step: update definitions may read the stage's
        // own storage at shifted indices.
        if !ctx.eff[s.0 as usize].updates.is_empty() {
            let scope = self_scope(ctx, s, &region);
            let mut with_self = Some(region.clone());
            accumulate_images(ctx, s, s, &scope, &mut with_self)?;
            region = with_self.expect("seeded with the base region");
        }

        // Pinned regions short-circuit inference but must cover everything
        // any consumer can touch.
        if let Some(pinned) = ctx.pipeline.stage(s).func_schedule.pinned.clone() {
            let required = concrete_region(ctx, s, &region)?;
            for (dim, ((pmin, pext), (rmin, rmax))) in pinned.iter().zip(&required).enumerate() {
                let pmax = pmin + pext - 1;
                if *pmin > *rmin || pmax < *rmax {
                    return Err(Error::PinnedRegionTooSmall {
                        stage: ctx.stage_name(s).to_string(),
                        dim,
                        pinned_min: *pmin,
                        pinned_max: pmax,
                        required_min: *rmin,
                        required_max: *rmax,
                    });
                }
            }
            region = region_from_pairs(&mut ctx.arena, &pinned);
        } else {
            let concrete = concrete_region(ctx, s, &region)?;
            region = region_from_minmax(&mut ctx.arena, &concrete);
        }

        if region.len() != rank {
            return Err(internal("bounds", ctx.stage_name(s), "region rank mismatch"));
        }
        tracing::debug!(stage = ctx.stage_name(s), region = ?describe_region(ctx, &region), "root region");
        ctx.root_regions[s.0 as usize] = region;
        ctx.states[s.0 as usize] = LowerState::Bounded;
    }
    Ok(())
}

fn describe_region(ctx: &LowerCtx, region: &Region) -> Vec<(Option<i64>, Option<i64>)> {
    region
        .0
        .iter()
        .map(|i| {
            (i.min.and_then(|e| ctx.arena.as_const_int(e)), i.max.and_then(|e| ctx.arena.as_const_int(e)))
        })
        .collect()
}

fn region_from_pairs(arena: &mut ExprArena, pairs: &[(i64, i64)]) -> Region {
    Region(
        pairs
            .iter()
            .map(|(min, extent)| {
                let lo = arena.int(*min);
                let hi = arena.int(min + extent - 1);
                Interval::bounded(lo, hi)
            })
            .collect(),
    )
}

fn region_from_minmax(arena: &mut ExprArena, pairs: &[(i64, i64)]) -> Region {
    Region(
        pairs
            .iter()
            .map(|(lo, hi)| {
                let lo = arena.int(*lo);
                let hi = arena.int(*hi);
                Interval::bounded(lo, hi)
            })
            .collect(),
    )
}

/// Resolve a region to concrete (min, max) pairs, or fail with the free
/// variable / unbounded dimension that prevents it.
fn concrete_region(ctx: &mut LowerCtx, s: StageId, region: &Region) -> Result<Vec<(i64, i64)>> {
    let mut out = Vec::with_capacity(region.len());
    for (dim, iv) in region.0.iter().enumerate() {
        let lo = iv.min.and_then(|e| ctx.arena.as_const_int(e));
        let hi = iv.max.and_then(|e| ctx.arena.as_const_int(e));
        match (lo, hi) {
            (Some(lo), Some(hi)) => out.push((lo, hi)),
            _ => {
                let detail = match (iv.min, iv.max) {
                    (None, _) | (_, None) => "interval is unbounded".to_string(),
                    (Some(e), _) => {
                        let vars = ctx.arena.free_vars(e);
                        let names: Vec<&str> = vars.iter().map(|v| ctx.arena.var_name(*v)).collect();
                        format!("free variables not tied to any loop: {}", names.join(", "))
                    }
                };
                return Err(Error::UnboundedRegion { stage: ctx.stage_name(s).to_string(), dim, detail });
            }
        }
    }
    Ok(out)
}

/// Scope binding every loop and reduction variable of a stage to its
/// whole-pipeline range.
fn stage_root_scope(ctx: &mut LowerCtx, d: StageId) -> Result<Scope> {
    let region = ctx.root_regions[d.0 as usize].clone();
    if region.is_empty() && ctx.pipeline.stage(d).rank() != 0 {
        return Err(internal("bounds", ctx.stage_name(d), "consumer processed before its own region"));
    }
    let mut scope = Scope::new();
    for (var, iv) in ctx.pipeline.stage(d).dims.clone().into_iter().zip(region.0.iter()) {
        scope.insert(var, iv.clone());
    }
    add_rdom_bindings(ctx, d, &mut scope);
    Ok(scope)
}

/// Scope used for a stage's self-reads: its own pure vars over the region
/// computed so far, plus its reduction domains.
fn self_scope(ctx: &mut LowerCtx, s: StageId, region: &Region) -> Scope {
    let mut scope = Scope::new();
    for (var, iv) in ctx.pipeline.stage(s).dims.clone().into_iter().zip(region.0.iter()) {
        scope.insert(var, iv.clone());
    }
    add_rdom_bindings(ctx, s, &mut scope);
    scope
}

fn add_rdom_bindings(ctx: &mut LowerCtx, d: StageId, scope: &mut Scope) {
    let updates = ctx.eff[d.0 as usize].updates.clone();
    for u in &updates {
        let Some(rd) = &u.rdom else { continue };
        for (var, min, extent) in &rd.vars {
            let lo = simplify(&mut ctx.arena, *min);
            let hi = {
                let sum = ctx.arena.add(*min, *extent);
                let one = ctx.arena.int(1);
                let e = ctx.arena.sub(sum, one);
                simplify(&mut ctx.arena, e)
            };
            scope.insert(*var, Interval::bounded(lo, hi));
        }
        if let Some(pred) = rd.predicate {
            tighten_scope_with_condition(&mut ctx.arena, scope, pred);
        }
    }
}

/// Union the images of every read of `target` in `reader`'s expressions
/// under `scope` into `acc`.
fn accumulate_images(
    ctx: &mut LowerCtx,
    reader: StageId,
    target: StageId,
    scope: &Scope,
    acc: &mut Option<Region>,
) -> Result<()> {
    let mut reads = Vec::new();
    for e in eff_exprs(ctx, reader) {
        ctx.arena.collect_reads(e, &mut reads);
    }
    for (stage, indices) in reads {
        if stage != target {
            continue;
        }
        let image = Region(
            indices
                .iter()
                .map(|idx| {
                    let iv = bounds_of_expr(&mut ctx.arena, *idx, scope);
                    resolve_interval(&mut ctx.arena, iv, scope)
                })
                .collect(),
        );
        *acc = Some(match acc.take() {
            Some(prev) => prev.union(&image, &mut ctx.arena),
            None => image,
        });
    }
    Ok(())
}

/// Iterate interval endpoints through the scope until they no longer
/// reference any bound variable. Terminates because scope bindings form a
/// DAG (inner loop bounds reference only outer variables).
pub fn resolve_interval(arena: &mut ExprArena, iv: Interval, scope: &Scope) -> Interval {
    let mut iv = iv;
    for _ in 0..32 {
        let mut changed = false;
        if let Some(min) = iv.min {
            if arena.free_vars(min).iter().any(|v| scope.contains_key(v)) {
                iv.min = bounds_of_expr(arena, min, scope).min;
                changed = true;
            }
        }
        if let Some(max) = iv.max {
            if arena.free_vars(max).iter().any(|v| scope.contains_key(v)) {
                iv.max = bounds_of_expr(arena, max, scope).max;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    iv
}

/// Tighten scope intervals with a (possibly conjunctive) boolean condition:
/// each conjunct that is affine in exactly one bound variable narrows that
/// variable's interval. Anything unprovable is skipped, never wrong.
pub fn tighten_scope_with_condition(arena: &mut ExprArena, scope: &mut Scope, cond: ExprId) {
    match arena.get(cond).clone() {
        Expr::Binary(BinaryOp::And, a, b) => {
            tighten_scope_with_condition(arena, scope, a);
            tighten_scope_with_condition(arena, scope, b);
        }
        Expr::Likely(inner) => tighten_scope_with_condition(arena, scope, inner),
        Expr::Binary(op @ (BinaryOp::Lt | BinaryOp::Le | BinaryOp::Eq), a, b) => {
            tighten_comparison(arena, scope, op, a, b);
        }
        _ => {}
    }
}

fn tighten_comparison(arena: &mut ExprArena, scope: &mut Scope, op: BinaryOp, a: ExprId, b: ExprId) {
    let (Some(la), Some(lb)) = (linear_of_expr(arena, a), linear_of_expr(arena, b)) else {
        return;
    };
    // a OP b  <=>  d >= t where d = b - a (for Lt t = 1, Le t = 0).
    let d = lb.sub(&la);
    let scoped: Vec<VarId> = d.coeffs.keys().filter(|v| scope.contains_key(v)).copied().collect();
    if scoped.len() != 1 {
        return;
    }
    let v = scoped[0];
    let c = d.coeff(v);
    let mut rest = d.clone();
    rest.coeffs.remove(&v);
    let Some(k) = rest.as_constant() else { return };

    let apply = |scope: &mut Scope, arena: &mut ExprArena, lo: Option<i64>, hi: Option<i64>| {
        let prev = scope.get(&v).cloned().expect("scoped variable present");
        let bound = Interval {
            min: lo.map(|x| arena.int(x)),
            max: hi.map(|x| arena.int(x)),
        };
        let tightened = prev.intersect(&bound, arena);
        scope.insert(v, tightened);
    };

    match op {
        BinaryOp::Eq => {
            // c*v + k == 0 has integer solutions only when c divides k.
            if c != 0 && (-k).rem_euclid(c) == 0 {
                let x = -k / c;
                apply(scope, arena, Some(x), Some(x));
            }
        }
        BinaryOp::Lt | BinaryOp::Le => {
            let t = if op == BinaryOp::Lt { 1 } else { 0 };
            // c*v >= t - k
            let m = t - k;
            if c > 0 {
                let lo = div_ceil_i64(m, c);
                apply(scope, arena, Some(lo), None);
            } else if c < 0 {
                let hi = fresnel_ir::types::floor_div(m, c);
                apply(scope, arena, None, Some(hi));
            }
        }
        _ => {}
    }
}

fn div_ceil_i64(a: i64, b: i64) -> i64 {
    fresnel_ir::types::floor_div(a + b - 1, b)
}

// ---------------------------------------------------------------------------
// Tree-based region derivation
// ---------------------------------------------------------------------------

/// The region of `stage` read anywhere under `stmt`, with only the loop
/// variables bound *inside* `stmt`; variables of enclosing loops stay
/// symbolic. `None` when nothing under `stmt` reads the stage.
pub fn region_used_in(arena: &mut ExprArena, stmt: &Stmt, stage: StageId) -> Option<Region> {
    let mut scope = Scope::new();
    let mut acc = None;
    walk_regions(arena, stmt, stage, &mut scope, &mut acc, false);
    acc
}

/// The box of `stage` written to anywhere under `stmt` (store indices only).
pub fn region_written_in(arena: &mut ExprArena, stmt: &Stmt, stage: StageId) -> Option<Region> {
    let mut scope = Scope::new();
    let mut acc = None;
    walk_regions(arena, stmt, stage, &mut scope, &mut acc, true);
    acc
}

fn walk_regions(
    arena: &mut ExprArena,
    stmt: &Stmt,
    stage: StageId,
    scope: &mut Scope,
    acc: &mut Option<Region>,
    writes: bool,
) {
    let mut visit_expr = |arena: &mut ExprArena, e: ExprId, scope: &Scope, acc: &mut Option<Region>| {
        if writes {
            return;
        }
        let mut reads = Vec::new();
        arena.collect_reads(e, &mut reads);
        for (s, indices) in reads {
            if s == stage {
                union_image(arena, &indices, scope, acc);
            }
        }
    };

    match stmt {
        Stmt::NoOp | Stmt::Release { .. } => {}
        Stmt::Block(stmts) => {
            for s in stmts {
                walk_regions(arena, s, stage, scope, acc, writes);
            }
        }
        Stmt::For { var, min, extent, body, .. } => {
            visit_expr(arena, *min, scope, acc);
            visit_expr(arena, *extent, scope, acc);
            let lo = simplify(arena, *min);
            let hi = {
                let sum = arena.add(*min, *extent);
                let one = arena.int(1);
                let e = arena.sub(sum, one);
                simplify(arena, e)
            };
            let prev = scope.insert(*var, Interval::bounded(lo, hi));
            walk_regions(arena, body, stage, scope, acc, writes);
            match prev {
                Some(p) => {
                    scope.insert(*var, p);
                }
                None => {
                    scope.remove(var);
                }
            }
        }
        Stmt::If { cond, then_branch, else_branch } => {
            visit_expr(arena, *cond, scope, acc);
            // The condition narrows what the then-branch can touch.
            let saved = scope.clone();
            tighten_scope_with_condition(arena, scope, *cond);
            walk_regions(arena, then_branch, stage, scope, acc, writes);
            *scope = saved;
            if let Some(e) = else_branch {
                walk_regions(arena, e, stage, scope, acc, writes);
            }
        }
        Stmt::Store { stage: s, indices, value, predicate, .. } => {
            if writes {
                if *s == stage {
                    union_image(arena, indices, scope, acc);
                }
            } else {
                for idx in indices {
                    visit_expr(arena, *idx, scope, acc);
                }
                visit_expr(arena, *value, scope, acc);
                if let Some(p) = predicate {
                    visit_expr(arena, *p, scope, acc);
                }
            }
        }
        Stmt::Allocate { dims, body, .. } => {
            for d in dims {
                visit_expr(arena, d.min, scope, acc);
                visit_expr(arena, d.extent, scope, acc);
            }
            walk_regions(arena, body, stage, scope, acc, writes);
        }
        Stmt::Produce { body, .. } | Stmt::Consume { body, .. } | Stmt::Acquire { body, .. } => {
            walk_regions(arena, body, stage, scope, acc, writes);
        }
        Stmt::Fork { producer, consumer } => {
            walk_regions(arena, producer, stage, scope, acc, writes);
            walk_regions(arena, consumer, stage, scope, acc, writes);
        }
        Stmt::Assert { cond, .. } => visit_expr(arena, *cond, scope, acc),
    }
}

fn union_image(arena: &mut ExprArena, indices: &SmallVec<[ExprId; 4]>, scope: &Scope, acc: &mut Option<Region>) {
    let image = Region(
        indices
            .iter()
            .map(|idx| {
                let iv = bounds_of_expr(arena, *idx, scope);
                resolve_interval(arena, iv, scope)
            })
            .collect(),
    );
    *acc = Some(match acc.take() {
        Some(prev) => prev.union(&image, arena),
        None => image,
    });
}
