//! Pipeline graph and schedule model.
//!
//! This crate is data plus validation only: it owns the pipeline DAG
//! (stages, update definitions, reduction domains) and the per-stage
//! schedule directives, and resolves/validates them once before lowering
//! begins. Nothing here is mutated mid-pass; the lowering engine consumes
//! an immutable [`Pipeline`] plus the [`validate::Resolved`] schedule.

pub mod error;
pub mod schedule;
pub mod stage;
pub mod validate;


pub use error::{Error, Result};
pub use schedule::{Anchor, Dim, DimRewrite, FuncSchedule, LoopTag, StageSchedule, TailPolicy};
pub use stage::{Pipeline, ReductionDomain, Stage, UpdateDef};
pub use validate::{validate, Resolved, ResolvedStage};
