//! Per-stage schedule directives.
//!
//! A schedule is a first-class value keyed by stage identifier: authored
//! through the directive helpers on [`crate::Pipeline`], resolved once by
//! [`crate::validate`], and never mutated mid-pass.

use fresnel_ir::{ExprArena, StageId, VarId};

/// Concurrency/emission tag on one loop variable.
///
/// GPU block/thread tags are accepted in the model but lower like
/// `Parallel`: target-specific codegen is out of scope here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum LoopTag {
    Serial,
    Parallel,
    Vectorize(u32),
    Unroll(u32),
    GpuBlock,
    GpuThread,
}

/// What happens to iterations beyond the end of a loop whose extent does not
/// divide its split factor. Changes which sites may be *computed*, never
/// which values are *visible*.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum TailPolicy {
    /// Guard the body with `if (v <= max)`.
    GuardWithIf,
    /// Round the iteration count up; out-of-range sites are computed into
    /// storage the consumer never reads. Pure stages only.
    RoundUp,
    /// Shift the last outer iteration inward so it overlaps the previous
    /// one. Pure stages only.
    ShiftInward,
    /// Like GuardWithIf, but the condition is attached to the store as a
    /// lane predicate instead of a branch.
    Predicate,
}

/// One loop variable of a stage, with its concurrency tag.
/// Dim lists are ordered innermost-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dim {
    pub var: VarId,
    pub tag: LoopTag,
}

/// A structural rewrite of a stage's loop variables.
#[derive(Debug, Clone)]
pub enum DimRewrite {
    /// `old = outer * factor + inner`, `inner` zero-based in `[0, factor)`.
    Split { old: VarId, outer: VarId, inner: VarId, factor: i64, tail: TailPolicy },
    /// `fused` zero-based over `extent(outer) * extent(inner)`;
    /// `outer = fused / extent(inner)`, `inner = fused % extent(inner)`.
    Fuse { outer: VarId, inner: VarId, fused: VarId },
    /// Permutation of the current dim list (innermost-first, complete).
    Reorder { order: Vec<VarId> },
}

/// Where a stage is computed (and optionally where its storage lives).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// Substitute the formula at every call site; no loop, no storage.
    Inline,
    /// Own top-level loop nest sized to the full inferred region.
    Root,
    /// Immediately inside the loop over `var` of `stage`'s nest.
    At { stage: StageId, var: VarId },
}

impl Anchor {
    pub fn describe(&self, arena: &ExprArena, stage_name: impl Fn(StageId) -> String) -> String {
        match self {
            Anchor::Inline => "inline".to_string(),
            Anchor::Root => "root".to_string(),
            Anchor::At { stage, var } => format!("{}.{}", stage_name(*stage), arena.var_name(*var)),
        }
    }
}

/// Loop-shape directives for one definition (the pure definition or one
/// update definition) of a stage.
#[derive(Debug, Clone, Default)]
pub struct StageSchedule {
    pub rewrites: Vec<DimRewrite>,
    pub tags: Vec<(VarId, LoopTag)>,
}

/// Stage-level placement and storage directives.
#[derive(Debug, Clone, Default)]
pub struct FuncSchedule {
    /// None = default: Root for the output and for stages with updates,
    /// Inline otherwise.
    pub compute: Option<Anchor>,
    /// None = same as the compute anchor.
    pub store: Option<Anchor>,
    /// Explicit storage folds, (dimension index, factor).
    pub folds: Vec<(usize, i64)>,
    /// Run this stage's producer as an async task with a buffered handoff.
    pub is_async: bool,
    /// Externally pinned region (min, extent) per dimension; short-circuits
    /// inference but must cover every required image.
    pub pinned: Option<Vec<(i64, i64)>>,
}

impl StageSchedule {
    /// Apply the structural rewrites to an initial dim list, producing the
    /// final loop order (innermost-first). Directive errors are reported
    /// against `stage_name`.
    pub fn final_dims(
        &self,
        arena: &ExprArena,
        stage_name: &str,
        initial: &[Dim],
    ) -> crate::Result<Vec<Dim>> {
        use crate::error::{BadReorderSnafu, SplitFactorNonPositiveSnafu, UnknownVarSnafu};
        use snafu::ensure;

        let mut dims: Vec<Dim> = initial.to_vec();
        for rw in &self.rewrites {
            match rw {
                DimRewrite::Split { old, outer, inner, factor, .. } => {
                    ensure!(
                        *factor > 0,
                        SplitFactorNonPositiveSnafu {
                            stage: stage_name,
                            var: arena.var_name(*old),
                            factor: *factor,
                        }
                    );
                    let pos = dims.iter().position(|d| d.var == *old).ok_or_else(|| {
                        UnknownVarSnafu {
                            stage: stage_name.to_string(),
                            var: arena.var_name(*old).to_string(),
                            directive: "split".to_string(),
                        }
                        .build()
                    })?;
                    let tag = dims[pos].tag;
                    dims[pos] = Dim { var: *inner, tag };
                    dims.insert(pos + 1, Dim { var: *outer, tag: LoopTag::Serial });
                }
                DimRewrite::Fuse { outer, inner, fused } => {
                    let ipos = dims.iter().position(|d| d.var == *inner).ok_or_else(|| {
                        UnknownVarSnafu {
                            stage: stage_name.to_string(),
                            var: arena.var_name(*inner).to_string(),
                            directive: "fuse".to_string(),
                        }
                        .build()
                    })?;
                    let opos = dims.iter().position(|d| d.var == *outer).ok_or_else(|| {
                        UnknownVarSnafu {
                            stage: stage_name.to_string(),
                            var: arena.var_name(*outer).to_string(),
                            directive: "fuse".to_string(),
                        }
                        .build()
                    })?;
                    let tag = dims[ipos].tag;
                    dims[ipos] = Dim { var: *fused, tag };
                    dims.remove(opos);
                }
                DimRewrite::Reorder { order } => {
                    ensure!(order.len() == dims.len(), BadReorderSnafu { stage: stage_name });
                    let mut reordered = Vec::with_capacity(dims.len());
                    for v in order {
                        let d = dims.iter().find(|d| d.var == *v).ok_or_else(|| {
                            BadReorderSnafu { stage: stage_name.to_string() }.build()
                        })?;
                        reordered.push(*d);
                    }
                    ensure!(reordered.len() == dims.len(), BadReorderSnafu { stage: stage_name });
                    dims = reordered;
                }
            }
        }
        // Tags apply to the final loop order.
        let mut dims = dims;
        for (v, tag) in &self.tags {
            let d = dims.iter_mut().find(|d| d.var == *v).ok_or_else(|| {
                UnknownVarSnafu {
                    stage: stage_name.to_string(),
                    var: arena.var_name(*v).to_string(),
                    directive: "tag".to_string(),
                }
                .build()
            })?;
            d.tag = *tag;
        }
        Ok(dims)
    }
}
