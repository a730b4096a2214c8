use fresnel_graph::Pipeline;
use fresnel_ir::ScalarType;

use crate::test::helpers::{find_allocate, stencil_pipeline};
use crate::{lower, Error, LowerOptions};

#[test]
fn producer_region_is_union_of_consumer_footprints() {
    // g reads f at x - 1 and x + 1 over x in [0, 10): f needs [-1, 10].
    let (mut p, f, _, _, _) = stencil_pipeline();
    p.compute_root(f);
    let m = lower(&p, &[(0, 10)], LowerOptions::default()).unwrap();
    let (mins, extents, _) = find_allocate(&m, "f").unwrap();
    assert_eq!(mins, vec![-1]);
    assert_eq!(extents, vec![12]);
}

#[test]
fn reduction_predicate_tightens_producer_region() {
    // t(x) = x; f(0) accumulates t(r) for r in [0, 100) where r < 10:
    // only t[0..10) is ever needed.
    let mut p = Pipeline::new();
    let tx = p.new_var("x");
    let txe = p.arena.var(tx);
    let t = p.add_stage("t", ScalarType::Int64, [tx], txe);
    p.compute_root(t);

    let fx = p.new_var("x");
    let fxe = p.arena.var(fx);
    let zero = p.arena.int(0);
    let f = p.add_stage("f", ScalarType::Int64, [fx], zero);
    let r = p.new_var("r");
    let rmin = p.arena.int(0);
    let rext = p.arena.int(100);
    let re = p.arena.var(r);
    let ten = p.arena.int(10);
    let pred = p.arena.lt(re, ten);
    let rd = fresnel_graph::ReductionDomain {
        vars: [(r, rmin, rext)].into_iter().collect(),
        predicate: Some(pred),
    };
    let self_read = p.arena.read(f, [fxe]);
    let tr = p.arena.read(t, [re]);
    let acc = p.arena.add(self_read, tr);
    p.add_update(f, [fxe], acc, Some(rd));
    p.set_output(f);

    let m = lower(&p, &[(0, 4)], LowerOptions::default()).unwrap();
    let (mins, extents, _) = find_allocate(&m, "t").unwrap();
    assert_eq!(mins, vec![0]);
    assert_eq!(extents, vec![10]);
}

#[test]
fn pinned_region_must_cover_required() {
    let (mut p, f, _, _, _) = stencil_pipeline();
    p.compute_root(f);
    // Required is [-1, 10]; a pin starting at 0 misses the left halo.
    p.pin_region(f, vec![(0, 12)]);
    let err = lower(&p, &[(0, 10)], LowerOptions::default()).unwrap_err();
    assert!(matches!(err, Error::PinnedRegionTooSmall { ref stage, dim: 0, .. } if stage == "f"), "{err}");
}

#[test]
fn pinned_region_overrides_inference_when_large_enough() {
    let (mut p, f, _, _, _) = stencil_pipeline();
    p.compute_root(f);
    p.pin_region(f, vec![(-4, 20)]);
    let m = lower(&p, &[(0, 10)], LowerOptions::default()).unwrap();
    let (mins, extents, _) = find_allocate(&m, "f").unwrap();
    assert_eq!(mins, vec![-4]);
    assert_eq!(extents, vec![20]);
}

#[test]
fn data_dependent_index_is_unbounded() {
    // g(x) = f(t(x)): nothing ties f's index to a loop interval.
    let mut p = Pipeline::new();
    let tx = p.new_var("x");
    let txe = p.arena.var(tx);
    let t = p.add_stage("t", ScalarType::Int64, [tx], txe);
    p.compute_root(t);

    let fx = p.new_var("x");
    let fxe = p.arena.var(fx);
    let f = p.add_stage("f", ScalarType::Int64, [fx], fxe);
    p.compute_root(f);

    let gx = p.new_var("x");
    let gxe = p.arena.var(gx);
    let tread = p.arena.read(t, [gxe]);
    let fread = p.arena.read(f, [tread]);
    let g = p.add_stage("g", ScalarType::Int64, [gx], fread);
    p.set_output(g);

    let err = lower(&p, &[(0, 8)], LowerOptions::default()).unwrap_err();
    assert!(matches!(err, Error::UnboundedRegion { ref stage, .. } if stage == "f"), "{err}");
}

#[test]
fn clamped_data_dependent_index_is_bounded() {
    // Clamping the same read with min/max restores a finite region.
    let mut p = Pipeline::new();
    let tx = p.new_var("x");
    let txe = p.arena.var(tx);
    let t = p.add_stage("t", ScalarType::Int64, [tx], txe);
    p.compute_root(t);

    let fx = p.new_var("x");
    let fxe = p.arena.var(fx);
    let f = p.add_stage("f", ScalarType::Int64, [fx], fxe);
    p.compute_root(f);

    let gx = p.new_var("x");
    let gxe = p.arena.var(gx);
    let tread = p.arena.read(t, [gxe]);
    let zero = p.arena.int(0);
    let seven = p.arena.int(7);
    let clamped_lo = p.arena.max(tread, zero);
    let clamped = p.arena.min(clamped_lo, seven);
    let fread = p.arena.read(f, [clamped]);
    let g = p.add_stage("g", ScalarType::Int64, [gx], fread);
    p.set_output(g);

    let m = lower(&p, &[(0, 8)], LowerOptions::default()).unwrap();
    let (mins, extents, _) = find_allocate(&m, "f").unwrap();
    assert_eq!(mins, vec![0]);
    assert_eq!(extents, vec![8]);
}
