//! Schedule resolution and validation.
//!
//! Runs once before lowering: resolves default anchors, applies the
//! structural dim rewrites, and rejects every schedule the lowering passes
//! are not prepared to honor. After this pass the schedule is a plain value
//! the passes read but never mutate.

use snafu::ensure;

use fresnel_ir::{StageId, VarId};

use crate::error::*;
use crate::schedule::{Anchor, Dim, DimRewrite, LoopTag, TailPolicy};
use crate::stage::Pipeline;

/// A stage's schedule after resolution: concrete anchors and final loop
/// orders for the pure definition and each update.
#[derive(Debug, Clone)]
pub struct ResolvedStage {
    pub compute: Anchor,
    pub store: Anchor,
    pub pure_dims: Vec<Dim>,
    pub update_dims: Vec<Vec<Dim>>,
}

/// Output of [`validate`].
#[derive(Debug, Clone)]
pub struct Resolved {
    pub stages: Vec<ResolvedStage>,
    /// Topological order of the call graph, producers first.
    pub order: Vec<StageId>,
}

impl Resolved {
    pub fn stage(&self, id: StageId) -> &ResolvedStage {
        &self.stages[id.0 as usize]
    }
}

pub fn validate(p: &Pipeline) -> Result<Resolved> {
    let output = p.output.ok_or_else(|| NoOutputSnafu.build())?;

    check_arities(p)?;

    let mut resolved = Vec::with_capacity(p.stages.len());
    for id in p.stage_ids() {
        resolved.push(resolve_stage(p, id, output)?);
    }

    check_anchor_targets(p, &resolved)?;
    check_anchor_cycles(p, &resolved)?;

    Ok(Resolved { stages: resolved, order: p.topo_order() })
}

fn check_arities(p: &Pipeline) -> Result<()> {
    for id in p.stage_ids() {
        let stage = p.stage(id);
        for e in p.stage_exprs(id) {
            let mut reads = Vec::new();
            p.arena.collect_reads(e, &mut reads);
            for (callee, indices) in reads {
                let callee_rank = p.stage(callee).rank();
                ensure!(
                    indices.len() == callee_rank,
                    ReadArityMismatchSnafu {
                        stage: &stage.name,
                        callee: p.stage_name(callee),
                        got: indices.len(),
                        rank: callee_rank,
                    }
                );
            }
        }
        for (i, u) in stage.updates.iter().enumerate() {
            ensure!(
                u.args.len() == stage.rank(),
                UpdateArityMismatchSnafu { stage: &stage.name, index: i, got: u.args.len(), rank: stage.rank() }
            );
        }
    }
    Ok(())
}

fn resolve_stage(p: &Pipeline, id: StageId, output: StageId) -> Result<ResolvedStage> {
    let stage = p.stage(id);
    let fs = &stage.func_schedule;

    let compute = fs.compute.unwrap_or({
        if id == output || !stage.updates.is_empty() {
            Anchor::Root
        } else {
            Anchor::Inline
        }
    });

    if compute == Anchor::Inline {
        ensure!(stage.updates.is_empty(), InlineWithUpdatesSnafu { stage: &stage.name });
        ensure!(id != output, OutputInlineSnafu { stage: &stage.name });
    }

    let store = fs.store.unwrap_or(compute);

    // Fold directives.
    for (dim, factor) in &fs.folds {
        ensure!(
            *factor > 0 && *dim < stage.rank(),
            FoldFactorNonPositiveSnafu { stage: &stage.name, dim: *dim, factor: *factor }
        );
    }

    // Pinned regions.
    if let Some(pinned) = &fs.pinned {
        ensure!(
            pinned.len() == stage.rank(),
            PinnedRegionRankMismatchSnafu { stage: &stage.name, got: pinned.len(), rank: stage.rank() }
        );
    }

    if fs.is_async {
        ensure!(matches!(compute, Anchor::At { .. }), AsyncWithoutAnchorSnafu { stage: &stage.name });
    }

    // Final loop orders.
    let initial: Vec<Dim> = stage.dims.iter().map(|v| Dim { var: *v, tag: LoopTag::Serial }).collect();
    let pure_dims = stage.pure_schedule.final_dims(&p.arena, &stage.name, &initial)?;

    let mut update_dims = Vec::with_capacity(stage.updates.len());
    for (i, u) in stage.updates.iter().enumerate() {
        for rw in &u.schedule.rewrites {
            if let DimRewrite::Split { old, tail, .. } = rw {
                if matches!(tail, TailPolicy::RoundUp | TailPolicy::ShiftInward) {
                    return TailPolicyUnsafeForUpdateSnafu {
                        stage: &stage.name,
                        index: i,
                        var: p.arena.var_name(*old),
                        policy: tail.to_string(),
                    }
                    .fail();
                }
            }
        }
        let init = update_initial_dims(p, id, i);
        update_dims.push(u.schedule.final_dims(&p.arena, &stage.name, &init)?);
    }

    Ok(ResolvedStage { compute, store, pure_dims, update_dims })
}

/// Initial loop order of an update definition: reduction-domain variables
/// innermost, then the pure variables that occur in the update, in storage
/// order.
pub fn update_initial_dims(p: &Pipeline, id: StageId, update: usize) -> Vec<Dim> {
    let stage = p.stage(id);
    let u = &stage.updates[update];
    let mut dims = Vec::new();
    if let Some(rd) = &u.rdom {
        for (v, _, _) in &rd.vars {
            dims.push(Dim { var: *v, tag: LoopTag::Serial });
        }
    }
    let mut free = std::collections::HashSet::new();
    for e in u.args.iter().copied().chain([u.value]) {
        p.arena.collect_free_vars(e, &mut free);
    }
    for v in &stage.dims {
        if free.contains(v) {
            dims.push(Dim { var: *v, tag: LoopTag::Serial });
        }
    }
    dims
}

/// Every `At` anchor must name an existing stage and one of its loop
/// variables, and the store anchor must be as coarse or coarser than the
/// compute anchor.
fn check_anchor_targets(p: &Pipeline, resolved: &[ResolvedStage]) -> Result<()> {
    for id in p.stage_ids() {
        let stage = p.stage(id);
        let rs = &resolved[id.0 as usize];

        let lookup = |anchor: &Anchor, what: &str| -> Result<Option<(StageId, VarId, usize)>> {
            match anchor {
                Anchor::Inline | Anchor::Root => Ok(None),
                Anchor::At { stage: at, var } => {
                    ensure!(
                        (at.0 as usize) < p.stages.len(),
                        UnknownStageSnafu { id: at.0, context: format!("{} anchor of '{}'", what, stage.name) }
                    );
                    let target = &resolved[at.0 as usize];
                    let pos = target
                        .pure_dims
                        .iter()
                        .chain(target.update_dims.iter().flatten())
                        .position(|d| d.var == *var);
                    match pos {
                        Some(pos) => Ok(Some((*at, *var, pos))),
                        None => UnknownVarSnafu {
                            stage: p.stage_name(*at),
                            var: p.arena.var_name(*var),
                            directive: format!("{} anchor of '{}'", what, stage.name),
                        }
                        .fail(),
                    }
                }
            }
        };

        let compute = lookup(&rs.compute, "compute")?;
        let store = lookup(&rs.store, "store")?;

        // Coarseness: Root is always coarse enough; an At-store requires the
        // same host stage at an equal-or-outer loop position.
        match (&rs.compute, &rs.store) {
            (Anchor::Inline | Anchor::Root, Anchor::At { .. }) => {
                return StoreAnchorFinerThanComputeSnafu {
                    stage: &stage.name,
                    store: rs.store.describe(&p.arena, |s| p.stage_name(s).to_string()),
                    compute: rs.compute.describe(&p.arena, |s| p.stage_name(s).to_string()),
                }
                .fail();
            }
            (Anchor::At { .. }, Anchor::At { .. }) => {
                let (cs, _, cpos) = compute.expect("compute anchor resolved");
                let (ss, _, spos) = store.expect("store anchor resolved");
                // Dim lists are innermost-first, so outer means a larger index.
                ensure!(
                    cs == ss && spos >= cpos,
                    StoreAnchorFinerThanComputeSnafu {
                        stage: &stage.name,
                        store: rs.store.describe(&p.arena, |s| p.stage_name(s).to_string()),
                        compute: rs.compute.describe(&p.arena, |s| p.stage_name(s).to_string()),
                    }
                );
            }
            _ => {}
        }
    }
    Ok(())
}

/// The compute-anchor graph must be acyclic: an anchor cannot nest a stage
/// inside itself, directly or transitively.
fn check_anchor_cycles(p: &Pipeline, resolved: &[ResolvedStage]) -> Result<()> {
    let n = p.stages.len();
    let mut state = vec![0u8; n];
    for start in 0..n {
        if state[start] != 0 {
            continue;
        }
        let mut path: Vec<usize> = vec![start];
        state[start] = 1;
        while let Some(&cur) = path.last() {
            let next = match resolved[cur].compute {
                Anchor::At { stage, .. } => Some(stage.0 as usize),
                _ => None,
            };
            match next {
                Some(nx) if state[nx] == 1 => {
                    let names: Vec<&str> =
                        path.iter().map(|i| p.stage_name(StageId(*i as u32))).chain([p.stage_name(StageId(nx as u32))]).collect();
                    return AnchorCycleSnafu { path: names.join(" -> ") }.fail();
                }
                Some(nx) if state[nx] == 0 => {
                    state[nx] = 1;
                    path.push(nx);
                }
                _ => {
                    // Fully explored from here down.
                    for i in path.drain(..) {
                        state[i] = 2;
                    }
                }
            }
        }
    }
    Ok(())
}
