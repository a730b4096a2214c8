//! Shared state of one lowering run.

use std::collections::HashMap;

use fresnel_graph::{Pipeline, ReductionDomain, Resolved};
use fresnel_ir::{ExprArena, ExprId, Region, StageId, VarId};
use smallvec::SmallVec;

use crate::LowerOptions;

/// Lowering status of one stage, in pass order. Terminal state is
/// `ConcurrencyLowered`; the optional passes may be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
pub enum LowerState {
    Unscheduled,
    Bounded,
    Nested,
    Folded,
    Partitioned,
    ConcurrencyLowered,
}

/// A stage's formulas with every inline-anchored callee substituted away.
#[derive(Debug, Clone)]
pub struct EffStage {
    pub pure_value: ExprId,
    pub updates: Vec<EffUpdate>,
}

#[derive(Debug, Clone)]
pub struct EffUpdate {
    pub args: SmallVec<[ExprId; 4]>,
    pub value: ExprId,
    pub rdom: Option<ReductionDomain>,
    pub atomic: bool,
}

/// Sliding-window certificate for one stage: the enclosing loop var, the
/// folded dimension, direction, and per-iteration advance of the window.
#[derive(Debug, Clone, Copy)]
pub struct SlideInfo {
    pub loop_var: VarId,
    pub dim: usize,
    pub increasing: bool,
}

/// Mutable state threaded through the lowering passes of one run.
pub struct LowerCtx<'p> {
    pub pipeline: &'p Pipeline,
    pub resolved: Resolved,
    /// Private copy of the pipeline's arena; the lowered module owns it.
    pub arena: ExprArena,
    pub options: LowerOptions,
    pub eff: Vec<EffStage>,
    /// Concrete whole-pipeline region per stage (empty for inline stages).
    pub root_regions: Vec<Region>,
    pub states: Vec<LowerState>,
    pub slid: HashMap<StageId, SlideInfo>,
    /// Initial semaphore values, indexed by `SemId`.
    pub semaphores: Vec<i64>,
}

impl<'p> LowerCtx<'p> {
    pub fn new(pipeline: &'p Pipeline, resolved: Resolved, options: LowerOptions) -> Self {
        let n = pipeline.stages.len();
        let eff = pipeline
            .stages
            .iter()
            .map(|s| EffStage {
                pure_value: s.pure_value,
                updates: s
                    .updates
                    .iter()
                    .map(|u| EffUpdate {
                        args: u.args.clone(),
                        value: u.value,
                        rdom: u.rdom.clone(),
                        atomic: u.atomic,
                    })
                    .collect(),
            })
            .collect();
        LowerCtx {
            pipeline,
            resolved,
            arena: pipeline.arena.clone(),
            options,
            eff,
            root_regions: vec![Region::default(); n],
            states: vec![LowerState::Unscheduled; n],
            slid: HashMap::new(),
            semaphores: Vec::new(),
        }
    }

    pub fn stage_name(&self, id: StageId) -> &str {
        self.pipeline.stage_name(id)
    }

    pub fn new_semaphore(&mut self, initial: i64) -> fresnel_ir::SemId {
        let id = fresnel_ir::SemId(self.semaphores.len() as u32);
        self.semaphores.push(initial);
        id
    }

    /// Advance every realized stage that reached `from` to `to`.
    pub fn advance_states(&mut self, from: LowerState, to: LowerState) {
        for s in &mut self.states {
            if *s == from {
                *s = to;
            }
        }
    }
}
