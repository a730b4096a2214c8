//! Stages, reduction domains, and the pipeline DAG.

use smallvec::SmallVec;

use fresnel_ir::{ExprArena, ExprId, ScalarType, StageId, VarId};

use crate::schedule::{Anchor, DimRewrite, FuncSchedule, LoopTag, StageSchedule, TailPolicy};

/// Auxiliary iteration set attached to an update definition. Each variable
/// has an integer min/extent; the optional predicate restricts the domain to
/// a non-rectangular subset.
#[derive(Debug, Clone, Default)]
pub struct ReductionDomain {
    pub vars: SmallVec<[(VarId, ExprId, ExprId); 2]>,
    pub predicate: Option<ExprId>,
}

/// One update definition: a read-modify-write rule over the stage's own
/// storage, iterated over the pure vars appearing in it plus the reduction
/// domain.
#[derive(Debug, Clone)]
pub struct UpdateDef {
    /// Left-hand-side index expressions, one per storage dimension.
    pub args: SmallVec<[ExprId; 4]>,
    pub value: ExprId,
    pub rdom: Option<ReductionDomain>,
    /// Honor collisions between concurrent reduction iterations with atomic
    /// or CAS sequences.
    pub atomic: bool,
    pub schedule: StageSchedule,
}

/// One pipeline node: a pure definition plus zero or more ordered updates.
#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub ty: ScalarType,
    /// Storage dimensions, innermost-first; also the pure definition's loop
    /// variables.
    pub dims: SmallVec<[VarId; 4]>,
    pub pure_value: ExprId,
    pub pure_schedule: StageSchedule,
    pub updates: Vec<UpdateDef>,
    pub func_schedule: FuncSchedule,
}

impl Stage {
    pub fn rank(&self) -> usize {
        self.dims.len()
    }
}

/// The pipeline DAG plus the expression arena all of its formulas live in.
#[derive(Debug, Default)]
pub struct Pipeline {
    pub arena: ExprArena,
    pub stages: Vec<Stage>,
    pub output: Option<StageId>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self, id: StageId) -> &Stage {
        &self.stages[id.0 as usize]
    }

    pub fn stage_mut(&mut self, id: StageId) -> &mut Stage {
        &mut self.stages[id.0 as usize]
    }

    pub fn stage_name(&self, id: StageId) -> &str {
        &self.stage(id).name
    }

    pub fn stage_ids(&self) -> impl Iterator<Item = StageId> {
        (0..self.stages.len() as u32).map(StageId)
    }

    pub fn new_var(&mut self, name: impl Into<String>) -> VarId {
        self.arena.new_var(name)
    }

    /// Add a stage with a pure definition. Loop variables are innermost-first.
    pub fn add_stage(
        &mut self,
        name: impl Into<String>,
        ty: ScalarType,
        dims: impl IntoIterator<Item = VarId>,
        pure_value: ExprId,
    ) -> StageId {
        let id = StageId(self.stages.len() as u32);
        self.stages.push(Stage {
            name: name.into(),
            ty,
            dims: dims.into_iter().collect(),
            pure_value,
            pure_schedule: StageSchedule::default(),
            updates: Vec::new(),
            func_schedule: FuncSchedule::default(),
        });
        id
    }

    /// Append an update definition; returns its index.
    pub fn add_update(
        &mut self,
        stage: StageId,
        args: impl IntoIterator<Item = ExprId>,
        value: ExprId,
        rdom: Option<ReductionDomain>,
    ) -> usize {
        let s = self.stage_mut(stage);
        s.updates.push(UpdateDef {
            args: args.into_iter().collect(),
            value,
            rdom,
            atomic: false,
            schedule: StageSchedule::default(),
        });
        s.updates.len() - 1
    }

    pub fn set_output(&mut self, stage: StageId) {
        self.output = Some(stage);
    }

    // ------------------------------------------------------------------
    // Schedule directives
    // ------------------------------------------------------------------

    pub fn compute_root(&mut self, s: StageId) {
        self.stage_mut(s).func_schedule.compute = Some(Anchor::Root);
    }

    pub fn compute_inline(&mut self, s: StageId) {
        self.stage_mut(s).func_schedule.compute = Some(Anchor::Inline);
    }

    pub fn compute_at(&mut self, s: StageId, at: StageId, var: VarId) {
        self.stage_mut(s).func_schedule.compute = Some(Anchor::At { stage: at, var });
    }

    pub fn store_root(&mut self, s: StageId) {
        self.stage_mut(s).func_schedule.store = Some(Anchor::Root);
    }

    pub fn store_at(&mut self, s: StageId, at: StageId, var: VarId) {
        self.stage_mut(s).func_schedule.store = Some(Anchor::At { stage: at, var });
    }

    pub fn fold_storage(&mut self, s: StageId, dim: usize, factor: i64) {
        self.stage_mut(s).func_schedule.folds.push((dim, factor));
    }

    pub fn set_async(&mut self, s: StageId) {
        self.stage_mut(s).func_schedule.is_async = true;
    }

    /// Pin the region (min, extent per dimension) for external-buffer interop.
    pub fn pin_region(&mut self, s: StageId, region: Vec<(i64, i64)>) {
        self.stage_mut(s).func_schedule.pinned = Some(region);
    }

    pub fn set_atomic(&mut self, s: StageId, update: usize) {
        self.stage_mut(s).updates[update].atomic = true;
    }

    /// Split `old` on the pure definition; returns (outer, inner).
    pub fn split(&mut self, s: StageId, old: VarId, factor: i64, tail: TailPolicy) -> (VarId, VarId) {
        let base = self.arena.var_name(old).to_string();
        let outer = self.arena.new_var(format!("{base}o"));
        let inner = self.arena.new_var(format!("{base}i"));
        self.stage_mut(s).pure_schedule.rewrites.push(DimRewrite::Split { old, outer, inner, factor, tail });
        (outer, inner)
    }

    pub fn split_update(
        &mut self,
        s: StageId,
        update: usize,
        old: VarId,
        factor: i64,
        tail: TailPolicy,
    ) -> (VarId, VarId) {
        let base = self.arena.var_name(old).to_string();
        let outer = self.arena.new_var(format!("{base}o"));
        let inner = self.arena.new_var(format!("{base}i"));
        self.stage_mut(s).updates[update]
            .schedule
            .rewrites
            .push(DimRewrite::Split { old, outer, inner, factor, tail });
        (outer, inner)
    }

    /// Fuse two pure loop variables; returns the fused variable.
    pub fn fuse(&mut self, s: StageId, outer: VarId, inner: VarId) -> VarId {
        let name = format!("{}_{}", self.arena.var_name(outer), self.arena.var_name(inner));
        let fused = self.arena.new_var(name);
        self.stage_mut(s).pure_schedule.rewrites.push(DimRewrite::Fuse { outer, inner, fused });
        fused
    }

    /// Reorder the pure loop variables (innermost-first, complete list).
    pub fn reorder(&mut self, s: StageId, order: &[VarId]) {
        self.stage_mut(s).pure_schedule.rewrites.push(DimRewrite::Reorder { order: order.to_vec() });
    }

    pub fn tag(&mut self, s: StageId, var: VarId, tag: LoopTag) {
        self.stage_mut(s).pure_schedule.tags.push((var, tag));
    }

    pub fn tag_update(&mut self, s: StageId, update: usize, var: VarId, tag: LoopTag) {
        self.stage_mut(s).updates[update].schedule.tags.push((var, tag));
    }

    /// Split by `n` and vectorize the inner var; returns (outer, inner).
    pub fn vectorize(&mut self, s: StageId, var: VarId, n: u32, tail: TailPolicy) -> (VarId, VarId) {
        let (outer, inner) = self.split(s, var, n as i64, tail);
        self.tag(s, inner, LoopTag::Vectorize(n));
        (outer, inner)
    }

    /// Split by `n` and unroll the inner var; returns (outer, inner).
    pub fn unroll(&mut self, s: StageId, var: VarId, n: u32, tail: TailPolicy) -> (VarId, VarId) {
        let (outer, inner) = self.split(s, var, n as i64, tail);
        self.tag(s, inner, LoopTag::Unroll(n));
        (outer, inner)
    }

    // ------------------------------------------------------------------
    // Call graph
    // ------------------------------------------------------------------

    /// Every expression belonging to a stage (pure value, update args and
    /// values, reduction predicates).
    pub fn stage_exprs(&self, id: StageId) -> Vec<ExprId> {
        let s = self.stage(id);
        let mut out = vec![s.pure_value];
        for u in &s.updates {
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

    /// Stages read by `id`, excluding the self-reads of its updates.
    pub fn callees(&self, id: StageId) -> Vec<StageId> {
        let mut reads = Vec::new();
        for e in self.stage_exprs(id) {
            self.arena.collect_reads(e, &mut reads);
        }
        let mut out: Vec<StageId> = reads.into_iter().map(|(s, _)| s).filter(|s| *s != id).collect();
        out.sort();
        out.dedup();
        out
    }

    /// Direct consumers of each stage (reverse call edges, self-edges
    /// excluded).
    pub fn consumer_map(&self) -> Vec<Vec<StageId>> {
        let mut consumers = vec![Vec::new(); self.stages.len()];
        for s in self.stage_ids() {
            for callee in self.callees(s) {
                consumers[callee.0 as usize].push(s);
            }
        }
        consumers
    }

    /// Topological order, producers first. The graph is a DAG by
    /// construction (reads require an already-created stage id); self-edges
    /// from update definitions are ignored.
    pub fn topo_order(&self) -> Vec<StageId> {
        let n = self.stages.len();
        let mut order = Vec::with_capacity(n);
        let mut state = vec![0u8; n]; // 0 = unvisited, 1 = in progress, 2 = done
        let mut stack: Vec<(StageId, usize)> = Vec::new();
        for root in self.stage_ids() {
            if state[root.0 as usize] != 0 {
                continue;
            }
            stack.push((root, 0));
            state[root.0 as usize] = 1;
            while let Some((node, idx)) = stack.pop() {
                let callees = self.callees(node);
                if idx < callees.len() {
                    stack.push((node, idx + 1));
                    let next = callees[idx];
                    if state[next.0 as usize] == 0 {
                        state[next.0 as usize] = 1;
                        stack.push((next, 0));
                    }
                } else {
                    state[node.0 as usize] = 2;
                    order.push(node);
                }
            }
        }
        order
    }
}
