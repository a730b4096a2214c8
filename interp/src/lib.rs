//! Reference interpreter for lowered fresnel modules.
//!
//! `realize` = lower + allocate the output + execute. It exists so the
//! engine's observable contracts - schedule invariance, call-count
//! exactness under sliding windows, atomic reduction correctness, async
//! handoff ordering - run as real tests against real concurrency, not as
//! paper arguments.

pub mod buffer;
pub mod error;
pub mod exec;
pub mod value;

#[cfg(test)]
mod test;

use std::sync::Arc;

use snafu::{ResultExt, Snafu};

use fresnel_graph::Pipeline;
use fresnel_ir::{ConstValue, StageId};
use fresnel_lower::{lower, LowerOptions, Module};

pub use buffer::{BufDim, Buffer};
pub use error::Error;
pub use exec::{Executor, Semaphore, Stats};
pub use value::Value;

/// Failure of a whole pipeline invocation: either the schedule did not
/// lower, or the generated program signaled a runtime error.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RealizeError {
    #[snafu(display("lowering failed: {source}"))]
    Lower { source: fresnel_lower::Error },
    #[snafu(display("runtime failure: {source}"))]
    Runtime { source: error::Error },
}

/// A finished pipeline run: the output values plus execution statistics.
pub struct Realization {
    pub module: Module,
    output: Arc<Buffer>,
    store_counts: Vec<u64>,
}

impl Realization {
    pub fn value_at(&self, indices: &[i64]) -> ConstValue {
        let name = &self.module.stage_names[self.module.output.0 as usize];
        self.output.load(name, indices).expect("index inside the realized region")
    }

    pub fn int_at(&self, indices: &[i64]) -> i64 {
        self.value_at(indices).as_int().expect("integer output")
    }

    pub fn float_at(&self, indices: &[i64]) -> f64 {
        self.value_at(indices).as_float().expect("float output")
    }

    /// Number of sites computed (stores executed) for a stage.
    pub fn stores(&self, stage: StageId) -> u64 {
        self.store_counts[stage.0 as usize]
    }

    pub fn stores_of(&self, name: &str) -> u64 {
        let s = self.module.stage_named(name).expect("known stage name");
        self.stores(s)
    }
}

/// Lower the pipeline over `output_region` ((min, extent) per dimension)
/// and run it.
pub fn realize(
    pipeline: &Pipeline,
    output_region: &[(i64, i64)],
    options: LowerOptions,
) -> Result<Realization, RealizeError> {
    let module = lower(pipeline, output_region, options).context(LowerSnafu)?;
    run(module).context(RuntimeSnafu)
}

/// Execute an already-lowered module.
pub fn run(mut module: Module) -> Result<Realization, error::Error> {
    let output = module.output;
    let ty = module.stage_types[output.0 as usize];
    let name = module.stage_names[output.0 as usize].clone();

    // The external buffer must also cover sites a round-up tail may write.
    let mut dims: Vec<BufDim> = module
        .output_region
        .iter()
        .map(|(min, extent)| BufDim { min: *min, extent: *extent, fold: None })
        .collect();
    if let Some(written) = fresnel_lower::bounds::region_written_in(&mut module.arena, &module.stmt, output) {
        for (d, iv) in dims.iter_mut().zip(written.0.iter()) {
            let lo = iv.min.and_then(|e| module.arena.as_const_int(e));
            let hi = iv.max.and_then(|e| module.arena.as_const_int(e));
            if let (Some(lo), Some(hi)) = (lo, hi) {
                let new_min = d.min.min(lo);
                let new_max = (d.min + d.extent - 1).max(hi);
                d.min = new_min;
                d.extent = new_max - new_min + 1;
            }
        }
    }

    let buffer = Arc::new(Buffer::new(&name, ty, dims)?);
    let executor = Executor::new(&module);
    tracing::debug!(output = %name, semaphores = module.semaphores.len(), "executing lowered module");
    executor.run(Arc::clone(&buffer))?;
    let store_counts =
        (0..module.stage_names.len()).map(|i| executor.stats.stores(StageId(i as u32))).collect();
    Ok(Realization { module, output: buffer, store_counts })
}
