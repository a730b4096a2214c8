use fresnel_graph::{LoopTag, Pipeline, ReductionDomain, TailPolicy};
use fresnel_ir::{AtomicKind, BinaryOp, Expr, ForKind, ScalarType, Stmt};

use crate::test::helpers::{collect_exprs, stencil_pipeline, stores_of};
use crate::{lower, Error, LowerOptions};

/// hist over 7 bins; one update accumulating 10k samples of g(r).
fn histogram_pipeline(parallel: bool) -> Pipeline {
    let mut p = Pipeline::new();
    let b = p.new_var("b");
    let zero = p.arena.int(0);
    let hist = p.add_stage("hist", ScalarType::Int64, [b], zero);

    let r = p.new_var("r");
    let rmin = p.arena.int(0);
    let rext = p.arena.int(10_000);
    let re = p.arena.var(r);
    let c31 = p.arena.int(31);
    let seven = p.arena.int(7);
    let scaled = p.arena.mul(re, c31);
    let bin = p.arena.modulo(scaled, seven);
    let rd = ReductionDomain { vars: [(r, rmin, rext)].into_iter().collect(), predicate: None };
    let self_read = p.arena.read(hist, [bin]);
    let one = p.arena.int(1);
    let bumped = p.arena.add(self_read, one);
    let u = p.add_update(hist, [bin], bumped, Some(rd));
    p.set_output(hist);
    p.set_atomic(hist, u);
    if parallel {
        p.tag_update(hist, u, r, LoopTag::Parallel);
    }
    p
}

#[test]
fn atomic_update_under_parallel_reduction_lowers_to_rmw() {
    let p = histogram_pipeline(true);
    let m = lower(&p, &[(0, 7)], LowerOptions::default()).unwrap();
    let stores = stores_of(&m, "hist");
    // Pure init store plus the update store.
    assert!(stores.contains(&AtomicKind::Rmw(BinaryOp::Add)), "{stores:?}\n{}", m.pretty());
}

#[test]
fn atomic_annotation_is_dropped_without_contention() {
    // Same histogram, serial reduction: the annotation is legal but a
    // non-contended plain store is preferred.
    let p = histogram_pipeline(false);
    let m = lower(&p, &[(0, 7)], LowerOptions::default()).unwrap();
    let stores = stores_of(&m, "hist");
    assert!(stores.iter().all(|a| *a == AtomicKind::NonAtomic), "{stores:?}");
}

#[test]
fn unannotated_colliding_parallel_store_is_a_race_error() {
    let mut p = histogram_pipeline(true);
    // Withdraw the annotation: the collision is now a diagnosed error.
    p.stage_mut(p.output.unwrap()).updates[0].atomic = false;
    let err = lower(&p, &[(0, 7)], LowerOptions::default()).unwrap_err();
    assert!(matches!(err, Error::ParallelRace { ref stage, .. } if stage == "hist"), "{err}");
}

#[test]
fn non_commutative_atomic_update_takes_the_cas_path() {
    // f(x) = f(x) * 2 - r is not a recognizable single-instruction RMW.
    let mut p = Pipeline::new();
    let x = p.new_var("x");
    let xe = p.arena.var(x);
    let zero = p.arena.int(0);
    let f = p.add_stage("f", ScalarType::Int64, [x], zero);

    let r = p.new_var("r");
    let rmin = p.arena.int(0);
    let rext = p.arena.int(100);
    let re = p.arena.var(r);
    let rd = ReductionDomain { vars: [(r, rmin, rext)].into_iter().collect(), predicate: None };
    let self_read = p.arena.read(f, [xe]);
    let two = p.arena.int(2);
    let doubled = p.arena.mul(self_read, two);
    let dec = p.arena.sub(doubled, re);
    let u = p.add_update(f, [xe], dec, Some(rd));
    p.set_atomic(f, u);
    p.tag_update(f, u, r, LoopTag::Parallel);
    p.set_output(f);

    let m = lower(&p, &[(0, 4)], LowerOptions::default()).unwrap();
    let stores = stores_of(&m, "f");
    assert!(stores.contains(&AtomicKind::CasLoop), "{stores:?}");
}

#[test]
fn disjoint_parallel_stores_stay_plain() {
    let (mut p, f, g, _, gx) = stencil_pipeline();
    p.compute_root(f);
    p.tag(g, gx, LoopTag::Parallel);
    let m = lower(&p, &[(0, 16)], LowerOptions::default()).unwrap();
    for a in stores_of(&m, "g") {
        assert_eq!(a, AtomicKind::NonAtomic);
    }
}

#[test]
fn sliding_producer_under_parallel_consumer_races() {
    // f stored once at root but computed per parallel iteration: iterations
    // write overlapping cells.
    let (mut p, f, g, gx) = crate::test::helpers::scan_pipeline();
    p.compute_at(f, g, gx);
    p.store_root(f);
    p.tag(g, gx, LoopTag::Parallel);
    let err = lower(&p, &[(0, 64)], LowerOptions::default()).unwrap_err();
    assert!(matches!(err, Error::ParallelRace { ref stage, .. } if stage == "f"), "{err}");
}

#[test]
fn vectorized_loop_becomes_ramped_stores() {
    let (mut p, f, g, _, gx) = stencil_pipeline();
    p.compute_root(f);
    let _ = p.vectorize(g, gx, 4, TailPolicy::RoundUp);
    let m = lower(&p, &[(0, 16)], LowerOptions::default()).unwrap();

    // No vectorized loop survives; the stores carry ramp indices.
    m.stmt.walk(&mut |s| {
        if let Stmt::For { kind, .. } = s {
            assert!(!matches!(kind, ForKind::Vectorized(_) | ForKind::Unrolled(_)));
        }
    });
    let mut exprs = Vec::new();
    collect_exprs(&m.stmt, &mut exprs);
    let has_ramp = exprs.iter().any(|e| matches!(m.arena.get(*e), Expr::Ramp { .. }));
    assert!(has_ramp, "{}", m.pretty());
}

#[test]
fn unrolled_loop_becomes_literal_copies() {
    let (mut p, f, g, _, gx) = stencil_pipeline();
    p.compute_root(f);
    let _ = p.unroll(g, gx, 4, TailPolicy::GuardWithIf);
    let m = lower(&p, &[(0, 16)], LowerOptions::default()).unwrap();
    let stores = stores_of(&m, "g");
    assert_eq!(stores.len(), 4, "four literal copies of the body\n{}", m.pretty());
}

#[test]
fn vectorize_without_split_needs_constant_extent() {
    let (mut p, f, g, _, gx) = stencil_pipeline();
    p.compute_root(f);
    p.tag(g, gx, LoopTag::Vectorize(4));
    let err = lower(&p, &[(0, 10)], LowerOptions::default()).unwrap_err();
    assert!(matches!(err, Error::VectorizeNonConstant { .. }), "{err}");
}

#[test]
fn gpu_tags_lower_like_parallel() {
    let (mut p, f, g, _, gx) = stencil_pipeline();
    p.compute_root(f);
    p.tag(g, gx, LoopTag::GpuBlock);
    let m = lower(&p, &[(0, 8)], LowerOptions::default()).unwrap();
    let mut kinds = Vec::new();
    m.stmt.walk(&mut |s| {
        if let Stmt::For { var, kind, .. } = s {
            if m.arena.var_name(*var) == "x" {
                kinds.push(*kind);
            }
        }
    });
    assert!(kinds.contains(&ForKind::Parallel));
}
