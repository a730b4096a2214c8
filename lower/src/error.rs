//! Lowering-time errors.
//!
//! Three tiers: schedule-validation errors (user-recoverable, raised with a
//! precise stage/directive reference), pass-through graph validation errors,
//! and internal invariant violations (compiler defects, never reachable from
//! valid input, never silently swallowed).

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Graph/schedule validation failed before lowering began.
    #[snafu(display("schedule validation: {source}"))]
    Schedule { source: fresnel_graph::Error },

    /// A region dimension could not be bounded: some index is not tied to
    /// any loop or reduction-domain variable.
    #[snafu(display("stage '{stage}': dimension {dim} of the required region cannot be bounded ({detail})"))]
    UnboundedRegion { stage: String, dim: usize, detail: String },

    /// A user-pinned region does not cover the provably required region.
    #[snafu(display(
        "stage '{stage}': pinned region [{pinned_min}, {pinned_max}] for dimension {dim} \
         does not cover the required [{required_min}, {required_max}]"
    ))]
    PinnedRegionTooSmall {
        stage: String,
        dim: usize,
        pinned_min: i64,
        pinned_max: i64,
        required_min: i64,
        required_max: i64,
    },

    /// A stage is computed at an anchor loop that does not enclose all of
    /// its consumers.
    #[snafu(display("stage '{stage}' is computed at '{anchor}', which does not enclose all of its uses"))]
    AnchorNotEnclosingConsumers { stage: String, anchor: String },

    /// The anchor loop variable was not found in the consumer's loop nest.
    #[snafu(display("stage '{stage}': anchor loop '{var}' was not found in the loop nest of '{host}'"))]
    AnchorLoopNotFound { stage: String, host: String, var: String },

    /// Explicit storage fold factor is smaller than the proven live window.
    #[snafu(display(
        "stage '{stage}': fold factor {factor} for dimension {dim} is smaller than the proven \
         maximum live window {window}"
    ))]
    FoldFactorTooSmall { stage: String, dim: usize, factor: i64, window: i64 },

    /// An explicit fold factor was given but the access pattern could not be
    /// proven monotone, so no live window exists to validate it against.
    #[snafu(display(
        "stage '{stage}': fold factor for dimension {dim} cannot be validated: the region is not \
         provably monotone in the enclosing loop"
    ))]
    FoldNotProvable { stage: String, dim: usize },

    /// Async handoff needs a folded, monotone sliding buffer.
    #[snafu(display(
        "stage '{stage}' is scheduled async but its region is not provably monotone in the \
         enclosing loop, so no buffered handoff can be built"
    ))]
    AsyncRequiresFold { stage: String },

    /// Async lowering hit a structure it cannot pipeline.
    #[snafu(display("stage '{stage}' cannot be lowered async: {detail}"))]
    AsyncUnsupported { stage: String, detail: String },

    /// A store under a parallel loop is neither provably disjoint across
    /// iterations nor atomic-annotated.
    #[snafu(display(
        "stage '{stage}': store under parallel loop '{var}' may collide across iterations; \
         prove disjointness or mark the update atomic"
    ))]
    ParallelRace { stage: String, var: String },

    /// Vectorized/unrolled loops need a compile-time-constant extent.
    #[snafu(display("loop '{var}' is {what} but its extent is not the compile-time constant {lanes}"))]
    VectorizeNonConstant { var: String, what: String, lanes: u32 },

    /// Invariant violated inside a lowering pass. Indicates a compiler
    /// defect, not a user error.
    #[snafu(display("internal error in pass {pass} (stage '{stage}'): {detail}"))]
    Internal { pass: String, stage: String, detail: String },
}

/// Shorthand for internal-invariant failures with pass/stage context.
pub fn internal(pass: &str, stage: &str, detail: impl Into<String>) -> Error {
    Error::Internal { pass: pass.to_string(), stage: stage.to_string(), detail: detail.into() }
}
