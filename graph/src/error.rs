//! Schedule and graph validation errors.
//!
//! Everything here is a compile-time, user-recoverable error: change the
//! schedule (or the pipeline declaration) and retry.

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Directive references a stage that does not exist.
    #[snafu(display("unknown stage id {id} referenced by {context}"))]
    UnknownStage { id: u32, context: String },

    /// Directive references a loop variable the stage does not have.
    #[snafu(display("stage '{stage}' has no loop variable '{var}' (directive: {directive})"))]
    UnknownVar { stage: String, var: String, directive: String },

    /// Read arity does not match the rank of the stage being read.
    #[snafu(display("stage '{stage}' reads '{callee}' with {got} indices, but it has rank {rank}"))]
    ReadArityMismatch { stage: String, callee: String, got: usize, rank: usize },

    /// Update lhs arity does not match the stage rank.
    #[snafu(display("update {index} of stage '{stage}' writes {got} indices, but the stage has rank {rank}"))]
    UpdateArityMismatch { stage: String, index: usize, got: usize, rank: usize },

    /// Split factor must be positive.
    #[snafu(display("split of '{var}' in stage '{stage}' has non-positive factor {factor}"))]
    SplitFactorNonPositive { stage: String, var: String, factor: i64 },

    /// RoundUp/ShiftInward recompute sites, which is unsound for
    /// read-modify-write updates.
    #[snafu(display("update {index} of stage '{stage}' splits '{var}' with tail policy {policy}, \
                     which may recompute sites; use GuardWithIf or Predicate"))]
    TailPolicyUnsafeForUpdate { stage: String, index: usize, var: String, policy: String },

    /// Reorder must name exactly the current loop variables.
    #[snafu(display("reorder on stage '{stage}' must be a permutation of its current loop variables"))]
    BadReorder { stage: String },

    /// A stage with update definitions cannot be inlined.
    #[snafu(display("stage '{stage}' has update definitions and cannot be scheduled inline"))]
    InlineWithUpdates { stage: String },

    /// The output stage cannot be inlined.
    #[snafu(display("output stage '{stage}' cannot be scheduled inline"))]
    OutputInline { stage: String },

    /// Compute anchors form a cycle.
    #[snafu(display("compute anchors form a cycle: {path}"))]
    AnchorCycle { path: String },

    /// The store anchor must be as coarse or coarser than the compute anchor.
    #[snafu(display("stage '{stage}': store anchor '{store}' is finer than compute anchor '{compute}'"))]
    StoreAnchorFinerThanCompute { stage: String, store: String, compute: String },

    /// Storage fold factor must be positive.
    #[snafu(display("stage '{stage}': fold factor {factor} for dimension {dim} is not positive"))]
    FoldFactorNonPositive { stage: String, dim: usize, factor: i64 },

    /// Pinned region rank must match the stage rank.
    #[snafu(display("stage '{stage}': pinned region has {got} dimensions, stage has rank {rank}"))]
    PinnedRegionRankMismatch { stage: String, got: usize, rank: usize },

    /// No output stage was declared.
    #[snafu(display("pipeline has no output stage"))]
    NoOutput,

    /// Async only makes sense for a stage computed inside a consumer.
    #[snafu(display("stage '{stage}' is marked async but is not computed at a consumer loop"))]
    AsyncWithoutAnchor { stage: String },
}
