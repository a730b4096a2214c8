//! Runtime errors of the reference interpreter.
//!
//! A pipeline invocation either completes or fails atomically as a whole:
//! any error aborts the run with no partial-result semantics.

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Access outside a stage's allocated region.
    #[snafu(display("stage '{stage}': index {index} outside [{min}, {min_plus_extent}) in dimension {dim}"))]
    OutOfBounds { stage: String, dim: usize, index: i64, min: i64, min_plus_extent: i64 },

    /// Bounds-check instrumentation fired.
    #[snafu(display("assertion failed: {message}"))]
    AssertFailed { message: String },

    /// Allocation would exceed the interpreter's memory cap.
    #[snafu(display("stage '{stage}': allocation of {cells} cells exceeds the cap of {cap}"))]
    AllocationTooLarge { stage: String, cells: u64, cap: u64 },

    /// Read of a stage with no live allocation at this point.
    #[snafu(display("stage '{stage}' read before any storage is live"))]
    NoLiveBuffer { stage: String },

    /// Expression evaluated to the wrong kind of value.
    #[snafu(display("type error evaluating expression: {detail}"))]
    TypeError { detail: String },

    /// The lowered tree violated an interpreter invariant; a compiler
    /// defect, not a user error.
    #[snafu(display("internal interpreter error: {detail}"))]
    Internal { detail: String },
}

pub fn internal(detail: impl Into<String>) -> Error {
    Error::Internal { detail: detail.into() }
}
