//! Loop-nest synthesis.
//!
//! Builds the nested loop/allocate/produce/consume tree: the output stage at
//! root, every other realized stage injected at its compute anchor
//! (consumers first, so producers land physically before the uses they
//! feed), storage wrapped at the store anchor. Split/fuse/reorder rewrites
//! are applied here by substitution; tail policies decide what guards the
//! non-divisible remainder.

use std::collections::HashMap;

use fresnel_graph::{Anchor, Dim, DimRewrite, LoopTag, TailPolicy};
use fresnel_ir::{
    simplify, AllocDim, AtomicKind, Expr, ExprArena, ExprId, ForKind, Interval, Region, StageId, Stmt,
    VarId,
};
use smallvec::SmallVec;

use crate::bounds::{eff_consumers, is_realized, region_used_in, region_written_in};
use crate::ctx::{EffUpdate, LowerCtx, LowerState};
use crate::error::{internal, Error, Result};

#[tracing::instrument(skip_all)]
pub fn build_loop_nest(ctx: &mut LowerCtx, output: StageId) -> Result<Stmt> {
    let consumers = eff_consumers(ctx);

    // The output owns the root nest; its buffer is external, so no Allocate.
    let out_region = ctx.root_regions[output.0 as usize].clone();
    let mut tree = build_stage_nest(ctx, output, &out_region)?;
    ctx.states[output.0 as usize] = LowerState::Nested;

    // Consumers first: each injected producer wraps the uses it feeds.
    let order: Vec<StageId> = ctx.resolved.order.iter().rev().copied().collect();
    for s in order {
        if s == output || !is_realized(ctx, &consumers, output, s) {
            continue;
        }
        tree = inject_realization(ctx, tree, s)?;
        ctx.states[s.0 as usize] = LowerState::Nested;
    }
    Ok(tree)
}

// ---------------------------------------------------------------------------
// Per-stage nest construction
// ---------------------------------------------------------------------------

/// Loop bounds and substitutions for one definition after applying its
/// structural rewrites.
struct LoopPlan {
    /// (min, extent) per loop variable, including replaced ones.
    ranges: HashMap<VarId, (ExprId, ExprId)>,
    /// Replaced variable -> expression over the final loop variables.
    subs: HashMap<VarId, ExprId>,
    /// GuardWithIf conditions, to be wrapped around the innermost body.
    guards: Vec<ExprId>,
    /// Predicate-policy conditions, attached to the store.
    predicates: Vec<ExprId>,
    /// ShiftInward preconditions.
    asserts: Vec<(ExprId, String)>,
}

impl LoopPlan {
    fn apply(&self, arena: &mut ExprArena, e: ExprId) -> ExprId {
        let out = arena.substitute(e, &self.subs);
        simplify(arena, out)
    }
}

fn plan_loops(
    ctx: &mut LowerCtx,
    stage: StageId,
    rewrites: &[DimRewrite],
    initial_ranges: HashMap<VarId, (ExprId, ExprId)>,
) -> Result<LoopPlan> {
    let arena = &mut ctx.arena;
    let mut plan = LoopPlan {
        ranges: initial_ranges,
        subs: HashMap::new(),
        guards: Vec::new(),
        predicates: Vec::new(),
        asserts: Vec::new(),
    };

    for rw in rewrites {
        match rw {
            DimRewrite::Split { old, outer, inner, factor, tail } => {
                let (min_o, ext_o) = *plan.ranges.get(old).ok_or_else(|| {
                    internal("nest", ctx.pipeline.stage_name(stage), "split of a variable with no range")
                })?;
                let f = arena.int(*factor);
                let fm1 = arena.int(*factor - 1);
                let padded = arena.add(ext_o, fm1);
                let outer_ext = arena.div(padded, f);
                let outer_ext = simplify(arena, outer_ext);
                let zero = arena.int(0);
                plan.ranges.insert(*outer, (zero, outer_ext));
                plan.ranges.insert(*inner, (zero, f));

                let exact = arena
                    .as_const_int(ext_o)
                    .map(|e| e % *factor == 0)
                    .unwrap_or(false);

                let outer_var = arena.var(*outer);
                let inner_var = arena.var(*inner);
                let scaled = arena.mul(outer_var, f);
                let base = match (tail, exact) {
                    (TailPolicy::ShiftInward, false) => {
                        // Last outer iteration shifts down to stay in range.
                        let last = arena.sub(ext_o, f);
                        let clamped = arena.min(scaled, last);
                        let ge = arena.le(f, ext_o);
                        plan.asserts.push((
                            ge,
                            format!(
                                "shift-inward split of '{}' needs extent >= {factor}",
                                arena.var_name(*old)
                            ),
                        ));
                        clamped
                    }
                    _ => scaled,
                };
                let off = arena.add(base, inner_var);
                let reconstructed = arena.add(min_o, off);
                let reconstructed = simplify(arena, reconstructed);

                if !exact {
                    match tail {
                        TailPolicy::GuardWithIf | TailPolicy::Predicate => {
                            let one = arena.int(1);
                            let span = arena.sub(ext_o, one);
                            let max_o = arena.add(min_o, span);
                            let max_o = simplify(arena, max_o);
                            let cond = arena.le(reconstructed, max_o);
                            if *tail == TailPolicy::GuardWithIf {
                                plan.guards.push(cond);
                            } else {
                                plan.predicates.push(cond);
                            }
                        }
                        TailPolicy::RoundUp | TailPolicy::ShiftInward => {}
                    }
                }

                insert_substitution(arena, &mut plan.subs, *old, reconstructed);
            }
            DimRewrite::Fuse { outer, inner, fused } => {
                let (min_i, ext_i) = *plan.ranges.get(inner).ok_or_else(|| {
                    internal("nest", ctx.pipeline.stage_name(stage), "fuse of a variable with no range")
                })?;
                let (min_o, ext_o) = *plan.ranges.get(outer).ok_or_else(|| {
                    internal("nest", ctx.pipeline.stage_name(stage), "fuse of a variable with no range")
                })?;
                let zero = arena.int(0);
                let total = arena.mul(ext_i, ext_o);
                let total = simplify(arena, total);
                plan.ranges.insert(*fused, (zero, total));

                let fused_var = arena.var(*fused);
                let rem = arena.modulo(fused_var, ext_i);
                let inner_e = arena.add(min_i, rem);
                let inner_e = simplify(arena, inner_e);
                let quot = arena.div(fused_var, ext_i);
                let outer_e = arena.add(min_o, quot);
                let outer_e = simplify(arena, outer_e);
                insert_substitution(arena, &mut plan.subs, *inner, inner_e);
                insert_substitution(arena, &mut plan.subs, *outer, outer_e);
            }
            DimRewrite::Reorder { .. } => {}
        }
    }
    Ok(plan)
}

/// Add `var -> expr`, rewriting `var` inside every existing substitution so
/// a single application of the map is always enough.
fn insert_substitution(arena: &mut ExprArena, subs: &mut HashMap<VarId, ExprId>, var: VarId, expr: ExprId) {
    let keys: Vec<VarId> = subs.keys().copied().collect();
    for k in keys {
        let v = subs[&k];
        let rewritten = arena.substitute_var(v, var, expr);
        subs.insert(k, rewritten);
    }
    subs.insert(var, expr);
}

fn tag_to_kind(tag: LoopTag) -> ForKind {
    match tag {
        LoopTag::Serial => ForKind::Serial,
        // GPU tags lower like Parallel; target codegen is out of scope.
        LoopTag::Parallel | LoopTag::GpuBlock | LoopTag::GpuThread => ForKind::Parallel,
        LoopTag::Vectorize(n) => ForKind::Vectorized(n),
        LoopTag::Unroll(n) => ForKind::Unrolled(n),
    }
}

/// Wrap `body` in the loops of `dims` (innermost-first list, so iterate in
/// order, each wrap adds one level further out).
fn wrap_loops(ctx: &mut LowerCtx, stage: StageId, dims: &[Dim], plan: &LoopPlan, body: Stmt) -> Result<Stmt> {
    let mut out = body;
    for d in dims {
        let (min, extent) = *plan.ranges.get(&d.var).ok_or_else(|| {
            internal("nest", ctx.pipeline.stage_name(stage), "final dim with no planned range")
        })?;
        out = Stmt::For { var: d.var, min, extent, kind: tag_to_kind(d.tag), body: Box::new(out) };
    }
    Ok(out)
}

/// Build the produce body of one stage over `region`: the pure definition's
/// nest followed by each update's nest, in order. Update stage i completes
/// before update stage i+1 begins by construction.
pub fn build_stage_nest(ctx: &mut LowerCtx, s: StageId, region: &Region) -> Result<Stmt> {
    let stage = ctx.pipeline.stage(s);
    let rank = stage.rank();
    if region.len() != rank {
        return Err(internal("nest", ctx.stage_name(s), "region rank mismatch"));
    }
    let dims: Vec<VarId> = stage.dims.to_vec();
    let ty_rewrites = ctx.pipeline.stage(s).pure_schedule.rewrites.clone();
    let pure_dims = ctx.resolved.stage(s).pure_dims.clone();
    let update_dims = ctx.resolved.stage(s).update_dims.clone();
    let updates = ctx.eff[s.0 as usize].updates.clone();
    let pure_value = ctx.eff[s.0 as usize].pure_value;

    // Pure definition.
    let mut ranges = HashMap::new();
    for (var, iv) in dims.iter().zip(region.0.iter()) {
        let (min, extent) = interval_min_extent(ctx, s, iv)?;
        ranges.insert(*var, (min, extent));
    }
    let plan = plan_loops(ctx, s, &ty_rewrites, ranges)?;
    let indices: SmallVec<[ExprId; 4]> = dims
        .iter()
        .map(|v| {
            let e = ctx.arena.var(*v);
            plan.apply(&mut ctx.arena, e)
        })
        .collect();
    let value = plan.apply(&mut ctx.arena, pure_value);
    let store = Stmt::Store {
        stage: s,
        indices,
        value,
        atomic: AtomicKind::NonAtomic,
        predicate: combine_conds(&mut ctx.arena, &plan.predicates),
    };
    let body = guard_body(&mut ctx.arena, store, &plan.guards);
    let pure_nest = wrap_loops(ctx, s, &pure_dims, &plan, body)?;
    let pure_nest = prepend_asserts(pure_nest, &plan.asserts);

    let mut parts = vec![pure_nest];

    // Update definitions.
    for (i, u) in updates.iter().enumerate() {
        let nest = build_update_nest(ctx, s, region, u, i, &update_dims[i])?;
        parts.push(nest);
    }

    Ok(Stmt::Produce { stage: s, body: Box::new(Stmt::block(parts)) })
}

fn build_update_nest(
    ctx: &mut LowerCtx,
    s: StageId,
    region: &Region,
    u: &EffUpdate,
    update_index: usize,
    final_dims: &[Dim],
) -> Result<Stmt> {
    let stage_dims: Vec<VarId> = ctx.pipeline.stage(s).dims.to_vec();
    let rewrites = ctx.pipeline.stage(s).updates[update_index].schedule.rewrites.clone();

    let mut ranges = HashMap::new();
    // Pure vars of the update iterate over the stage's region.
    for (var, iv) in stage_dims.iter().zip(region.0.iter()) {
        let (min, extent) = interval_min_extent(ctx, s, iv)?;
        ranges.insert(*var, (min, extent));
    }
    // Reduction-domain vars iterate over their declared ranges.
    if let Some(rd) = &u.rdom {
        for (var, min, extent) in &rd.vars {
            ranges.insert(*var, (*min, *extent));
        }
    }

    let plan = plan_loops(ctx, s, &rewrites, ranges)?;
    let indices: SmallVec<[ExprId; 4]> = u.args.iter().map(|a| plan.apply(&mut ctx.arena, *a)).collect();
    let value = plan.apply(&mut ctx.arena, u.value);
    let atomic = if u.atomic { classify_rmw(&ctx.arena, s, &indices, value) } else { AtomicKind::NonAtomic };
    let store = Stmt::Store {
        stage: s,
        indices,
        value,
        atomic,
        predicate: combine_conds(&mut ctx.arena, &plan.predicates),
    };
    let mut body = guard_body(&mut ctx.arena, store, &plan.guards);
    if let Some(rd) = &u.rdom {
        if let Some(p) = rd.predicate {
            let p = plan.apply(&mut ctx.arena, p);
            body = Stmt::If { cond: p, then_branch: Box::new(body), else_branch: None };
        }
    }
    let nest = wrap_loops(ctx, s, final_dims, &plan, body)?;
    Ok(prepend_asserts(nest, &plan.asserts))
}

/// Recognize `stage[idx] = stage[idx] op operand` with an associative,
/// commutative `op`: lowers to one atomic instruction. Anything else that
/// was declared atomic takes the CAS retry path.
pub fn classify_rmw(arena: &ExprArena, stage: StageId, indices: &[ExprId], value: ExprId) -> AtomicKind {
    if let Expr::Binary(op, a, b) = arena.get(value) {
        if op.is_associative_commutative() {
            let is_self_read = |e: ExprId| match arena.get(e) {
                Expr::Read { stage: rs, indices: ri } => *rs == stage && ri.as_slice() == indices,
                _ => false,
            };
            let reads_stage = |e: ExprId| {
                let mut reads = Vec::new();
                arena.collect_reads(e, &mut reads);
                reads.iter().any(|(rs, _)| *rs == stage)
            };
            if is_self_read(*a) && !reads_stage(*b) {
                return AtomicKind::Rmw(*op);
            }
            if is_self_read(*b) && !reads_stage(*a) {
                return AtomicKind::Rmw(*op);
            }
        }
    }
    AtomicKind::CasLoop
}

fn interval_min_extent(ctx: &mut LowerCtx, s: StageId, iv: &Interval) -> Result<(ExprId, ExprId)> {
    let (Some(min), Some(max)) = (iv.min, iv.max) else {
        return Err(Error::UnboundedRegion {
            stage: ctx.stage_name(s).to_string(),
            dim: 0,
            detail: "interval is unbounded at its anchor".to_string(),
        });
    };
    let span = ctx.arena.sub(max, min);
    let one = ctx.arena.int(1);
    let extent = ctx.arena.add(span, one);
    let extent = simplify(&mut ctx.arena, extent);
    Ok((min, extent))
}

fn combine_conds(arena: &mut ExprArena, conds: &[ExprId]) -> Option<ExprId> {
    let mut it = conds.iter().copied();
    let first = it.next()?;
    Some(it.fold(first, |acc, c| arena.and(acc, c)))
}

fn guard_body(arena: &mut ExprArena, body: Stmt, guards: &[ExprId]) -> Stmt {
    match combine_conds(arena, guards) {
        Some(cond) => Stmt::If { cond, then_branch: Box::new(body), else_branch: None },
        None => body,
    }
}

fn prepend_asserts(body: Stmt, asserts: &[(ExprId, String)]) -> Stmt {
    if asserts.is_empty() {
        return body;
    }
    let mut parts: Vec<Stmt> =
        asserts.iter().map(|(cond, message)| Stmt::Assert { cond: *cond, message: message.clone() }).collect();
    parts.push(body);
    Stmt::block(parts)
}

// ---------------------------------------------------------------------------
// Realization injection
// ---------------------------------------------------------------------------

fn inject_realization(ctx: &mut LowerCtx, tree: Stmt, s: StageId) -> Result<Stmt> {
    let compute = ctx.resolved.stage(s).compute;
    let store = ctx.resolved.stage(s).store;

    match compute {
        Anchor::Inline => Err(internal("nest", ctx.stage_name(s), "inline stage reached injection")),
        Anchor::Root => {
            let region = ctx.root_regions[s.0 as usize].clone();
            let produce = build_stage_nest(ctx, s, &region)?;
            let alloc_region = allocation_region(ctx, s, &produce, &tree, &region)?;
            let body = Stmt::block(vec![produce, Stmt::Consume { stage: s, body: Box::new(tree) }]);
            Ok(make_allocate(ctx, s, &alloc_region, body)?)
        }
        Anchor::At { stage: host, var } => {
            let total_reads = count_reads(&ctx.arena, &tree, s);

            // Region as it stands at the anchor point: loops inside the
            // anchor body are bound, everything outer stays symbolic.
            let anchor_body = find_for_body(&tree, var).ok_or_else(|| Error::AnchorLoopNotFound {
                stage: ctx.stage_name(s).to_string(),
                host: ctx.stage_name(host).to_string(),
                var: ctx.arena.var_name(var).to_string(),
            })?;
            let inner_reads = count_reads(&ctx.arena, anchor_body, s);
            if inner_reads != total_reads || total_reads == 0 {
                return Err(Error::AnchorNotEnclosingConsumers {
                    stage: ctx.stage_name(s).to_string(),
                    anchor: format!("{}.{}", ctx.stage_name(host), ctx.arena.var_name(var)),
                });
            }
            let anchor_body = anchor_body.clone();
            let region = region_used_in(&mut ctx.arena, &anchor_body, s).ok_or_else(|| {
                internal("nest", ctx.stage_name(s), "anchored stage has uses but no readable region")
            })?;
            check_bounded(ctx, s, &region)?;

            let produce = build_stage_nest(ctx, s, &region)?;

            // Inject the production at the top of the anchor loop's body.
            let mut tree = tree;
            {
                let slot = find_for_body_mut(&mut tree, var)
                    .ok_or_else(|| internal("nest", ctx.stage_name(s), "anchor loop vanished"))?;
                let old = std::mem::replace(slot, Stmt::NoOp);
                *slot = Stmt::block(vec![produce, Stmt::Consume { stage: s, body: Box::new(old) }]);
            }

            // Storage at the store anchor.
            match store {
                Anchor::At { var: store_var, .. } if store_var != var => {
                    let subtree = find_for_body(&tree, store_var)
                        .ok_or_else(|| Error::AnchorLoopNotFound {
                            stage: ctx.stage_name(s).to_string(),
                            host: ctx.stage_name(host).to_string(),
                            var: ctx.arena.var_name(store_var).to_string(),
                        })?
                        .clone();
                    let alloc_region = subtree_allocation_region(ctx, s, &subtree)?;
                    let slot = find_for_body_mut(&mut tree, store_var)
                        .ok_or_else(|| internal("nest", ctx.stage_name(s), "store anchor loop vanished"))?;
                    let old = std::mem::replace(slot, Stmt::NoOp);
                    *slot = make_allocate(ctx, s, &alloc_region, old)?;
                }
                Anchor::Root => {
                    let alloc_region = subtree_allocation_region(ctx, s, &tree)?;
                    tree = make_allocate(ctx, s, &alloc_region, tree)?;
                }
                _ => {
                    // Store at the compute anchor: wrap right where we
                    // injected.
                    let subtree = find_for_body(&tree, var)
                        .ok_or_else(|| internal("nest", ctx.stage_name(s), "anchor loop vanished"))?
                        .clone();
                    let alloc_region = subtree_allocation_region(ctx, s, &subtree)?;
                    let slot = find_for_body_mut(&mut tree, var)
                        .ok_or_else(|| internal("nest", ctx.stage_name(s), "anchor loop vanished"))?;
                    let old = std::mem::replace(slot, Stmt::NoOp);
                    *slot = make_allocate(ctx, s, &alloc_region, old)?;
                }
            }
            Ok(tree)
        }
    }
}

/// Allocation must cover everything read *and* everything written (RoundUp
/// tails may compute past the required region).
fn allocation_region(
    ctx: &mut LowerCtx,
    s: StageId,
    produce: &Stmt,
    rest: &Stmt,
    required: &Region,
) -> Result<Region> {
    let mut region = required.clone();
    if let Some(w) = region_written_in(&mut ctx.arena, produce, s) {
        region = region.union(&w, &mut ctx.arena);
    }
    if let Some(r) = region_used_in(&mut ctx.arena, rest, s) {
        region = region.union(&r, &mut ctx.arena);
    }
    check_bounded(ctx, s, &region)?;
    Ok(region)
}

fn subtree_allocation_region(ctx: &mut LowerCtx, s: StageId, subtree: &Stmt) -> Result<Region> {
    let used = region_used_in(&mut ctx.arena, subtree, s);
    let written = region_written_in(&mut ctx.arena, subtree, s);
    let region = match (used, written) {
        (Some(u), Some(w)) => u.union(&w, &mut ctx.arena),
        (Some(u), None) => u,
        (None, Some(w)) => w,
        (None, None) => {
            return Err(internal("nest", ctx.stage_name(s), "storage scope contains no uses or stores"))
        }
    };
    check_bounded(ctx, s, &region)?;
    Ok(region)
}

fn check_bounded(ctx: &LowerCtx, s: StageId, region: &Region) -> Result<()> {
    for (dim, iv) in region.0.iter().enumerate() {
        if !iv.is_bounded() {
            return Err(Error::UnboundedRegion {
                stage: ctx.stage_name(s).to_string(),
                dim,
                detail: "interval is unbounded at its anchor".to_string(),
            });
        }
    }
    Ok(())
}

fn make_allocate(ctx: &mut LowerCtx, s: StageId, region: &Region, body: Stmt) -> Result<Stmt> {
    let ty = ctx.pipeline.stage(s).ty;
    let mut dims: SmallVec<[AllocDim; 4]> = SmallVec::new();
    for iv in region.0.iter() {
        let (min, extent) = interval_min_extent(ctx, s, iv)?;
        dims.push(AllocDim { min, extent, fold: None });
    }
    Ok(Stmt::Allocate { stage: s, ty, dims, body: Box::new(body) })
}

// ---------------------------------------------------------------------------
// Tree search helpers
// ---------------------------------------------------------------------------

/// First (pre-order) loop over `var`; returns its body.
pub fn find_for_body(stmt: &Stmt, var: VarId) -> Option<&Stmt> {
    match stmt {
        Stmt::For { var: v, body, .. } if *v == var => Some(body),
        Stmt::For { body, .. }
        | Stmt::Allocate { body, .. }
        | Stmt::Produce { body, .. }
        | Stmt::Consume { body, .. }
        | Stmt::Acquire { body, .. } => find_for_body(body, var),
        Stmt::Block(stmts) => stmts.iter().find_map(|s| find_for_body(s, var)),
        Stmt::If { then_branch, else_branch, .. } => find_for_body(then_branch, var)
            .or_else(|| else_branch.as_ref().and_then(|e| find_for_body(e, var))),
        Stmt::Fork { producer, consumer } => {
            find_for_body(producer, var).or_else(|| find_for_body(consumer, var))
        }
        Stmt::NoOp | Stmt::Store { .. } | Stmt::Release { .. } | Stmt::Assert { .. } => None,
    }
}

pub fn find_for_body_mut(stmt: &mut Stmt, var: VarId) -> Option<&mut Stmt> {
    match stmt {
        Stmt::For { var: v, body, .. } => {
            if *v == var {
                Some(body)
            } else {
                find_for_body_mut(body, var)
            }
        }
        Stmt::Allocate { body, .. }
        | Stmt::Produce { body, .. }
        | Stmt::Consume { body, .. }
        | Stmt::Acquire { body, .. } => find_for_body_mut(body, var),
        Stmt::Block(stmts) => stmts.iter_mut().find_map(|s| find_for_body_mut(s, var)),
        Stmt::If { then_branch, else_branch, .. } => {
            if find_for_body(then_branch, var).is_some() {
                find_for_body_mut(then_branch, var)
            } else {
                else_branch.as_mut().and_then(|e| find_for_body_mut(e, var))
            }
        }
        Stmt::Fork { producer, consumer } => {
            if find_for_body(producer, var).is_some() {
                find_for_body_mut(producer, var)
            } else {
                find_for_body_mut(consumer, var)
            }
        }
        Stmt::NoOp | Stmt::Store { .. } | Stmt::Release { .. } | Stmt::Assert { .. } => None,
    }
}

/// Number of syntactic reads of `stage` under `stmt`.
pub fn count_reads(arena: &ExprArena, stmt: &Stmt, stage: StageId) -> usize {
    let mut count = 0;
    let mut stmts = vec![stmt];
    while let Some(s) = stmts.pop() {
        let mut exprs: Vec<ExprId> = Vec::new();
        match s {
            Stmt::NoOp | Stmt::Release { .. } => {}
            Stmt::Block(inner) => stmts.extend(inner.iter()),
            Stmt::For { min, extent, body, .. } => {
                exprs.extend([*min, *extent]);
                stmts.push(body);
            }
            Stmt::If { cond, then_branch, else_branch } => {
                exprs.push(*cond);
                stmts.push(then_branch);
                if let Some(e) = else_branch {
                    stmts.push(e);
                }
            }
            Stmt::Store { indices, value, predicate, .. } => {
                exprs.extend(indices.iter().copied());
                exprs.push(*value);
                exprs.extend(predicate.iter().copied());
            }
            Stmt::Allocate { dims, body, .. } => {
                exprs.extend(dims.iter().flat_map(|d| [d.min, d.extent]));
                stmts.push(body);
            }
            Stmt::Produce { body, .. } | Stmt::Consume { body, .. } | Stmt::Acquire { body, .. } => {
                stmts.push(body)
            }
            Stmt::Fork { producer, consumer } => {
                stmts.push(producer);
                stmts.push(consumer);
            }
            Stmt::Assert { cond, .. } => exprs.push(*cond),
        }
        for e in exprs {
            let mut reads = Vec::new();
            arena.collect_reads(e, &mut reads);
            count += reads.iter().filter(|(s, _)| *s == stage).count();
        }
    }
    count
}
