//! Schedule-driven lowering engine.
//!
//! Turns (pipeline graph + per-stage schedule) into a single
//! target-independent loop/allocation tree, without ever letting the
//! schedule change the numerical result.
//!
//! # Pass pipeline
//!
//! 1. [`bounds`] - region inference (consumers before producers)
//! 2. [`nest`] - loop-nest synthesis honoring compute/store anchors
//! 3. [`sliding`] - sliding-window incremental-computation rewrite
//! 4. [`fold`] - circular-buffer storage folding
//! 5. [`partition`] - prologue/steady-state/epilogue loop splitting
//! 6. [`concurrency`] - vector/unroll/parallel/atomic lowering
//! 7. [`async_task`] - async producer/consumer handoff
//!
//! The engine itself is single-threaded, deterministic, and side-effect-free
//! over immutable inputs; what it produces is a concurrent runtime program.

pub mod bounds;
pub mod concurrency;
pub mod ctx;
pub mod error;
pub mod fold;
pub mod inline;
pub mod nest;
pub mod partition;
pub mod sliding;

#[path = "async.rs"]
pub mod async_task;

#[cfg(test)]
mod test;

use fresnel_graph::Pipeline;
use fresnel_ir::{ExprArena, ScalarType, StageId, Stmt, StmtDisplay};
use snafu::ResultExt;

pub use ctx::{LowerCtx, LowerState};
pub use error::{Error, Result};

/// Knobs for the optional transformation passes. Disabling a pass is always
/// semantics-preserving; the schedule-invariance tests rely on that.
#[derive(Debug, Clone, bon::Builder)]
pub struct LowerOptions {
    #[builder(default = true)]
    pub sliding_window: bool,
    #[builder(default = true)]
    pub partition_loops: bool,
}

impl Default for LowerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A fully lowered pipeline: the statement tree plus everything a backend
/// (or the reference interpreter) needs to execute it. Owns the expression
/// arena its tree references; nothing here outlives one compilation.
#[derive(Debug)]
pub struct Module {
    pub arena: ExprArena,
    pub stmt: Stmt,
    pub output: StageId,
    /// (min, extent) per dimension of the output stage.
    pub output_region: Vec<(i64, i64)>,
    pub stage_names: Vec<String>,
    pub stage_types: Vec<ScalarType>,
    /// Initial values of the async handoff semaphores, indexed by `SemId`.
    pub semaphores: Vec<i64>,
}

impl Module {
    pub fn stage_named(&self, name: &str) -> Option<StageId> {
        self.stage_names.iter().position(|n| n == name).map(|i| StageId(i as u32))
    }

    /// Pretty-print the lowered tree.
    pub fn pretty(&self) -> String {
        let names = |s: StageId| self.stage_names[s.0 as usize].clone();
        StmtDisplay::new(&self.arena, &self.stmt).with_names(&names).to_string()
    }
}

/// Lower a pipeline over the given output region ((min, extent) per output
/// dimension) into a concurrency-lowered module, or a diagnosed error.
#[tracing::instrument(skip_all, fields(stages = pipeline.stages.len()))]
pub fn lower(pipeline: &Pipeline, output_region: &[(i64, i64)], options: LowerOptions) -> Result<Module> {
    let resolved = fresnel_graph::validate(pipeline).context(error::ScheduleSnafu)?;
    let output = pipeline.output.expect("validated pipeline has an output");

    let mut ctx = LowerCtx::new(pipeline, resolved, options);

    inline::substitute_inline_stages(&mut ctx)?;
    bounds::infer_root_regions(&mut ctx, output, output_region)?;
    let stmt = nest::build_loop_nest(&mut ctx, output)?;
    let stmt = if ctx.options.sliding_window { sliding::sliding_window(&mut ctx, stmt)? } else { stmt };
    let stmt = fold::fold_storage(&mut ctx, stmt)?;
    let stmt = if ctx.options.partition_loops { partition::partition_loops(&mut ctx, stmt)? } else { stmt };
    let stmt = concurrency::lower_concurrency(&mut ctx, stmt)?;
    let stmt = async_task::lower_async(&mut ctx, stmt)?;

    tracing::debug!(tree = %StmtDisplay::new(&ctx.arena, &stmt), "lowering complete");

    Ok(Module {
        arena: ctx.arena,
        stmt,
        output,
        output_region: output_region.to_vec(),
        stage_names: pipeline.stages.iter().map(|s| s.name.clone()).collect(),
        stage_types: pipeline.stages.iter().map(|s| s.ty).collect(),
        semaphores: ctx.semaphores,
    })
}
