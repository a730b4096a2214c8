use fresnel_graph::TailPolicy;
use fresnel_ir::{ScalarType, Stmt, UnaryOp};
use fresnel_lower::LowerOptions;

use crate::realize;
use crate::test::helpers::*;

#[test]
fn boundary_example_inlined() {
    // g(5,5) = (4+5) + (5+5) + (6+5) = 30 with f inlined.
    let (p, _, _) = boundary_pipeline();
    let r = realize(&p, &[(5, 1), (5, 1)], LowerOptions::default()).unwrap();
    assert_eq!(r.int_at(&[5, 5]), 30);
}

#[test]
fn boundary_example_computed_at_root() {
    let (mut p, f, _) = boundary_pipeline();
    p.compute_root(f);
    let r = realize(&p, &[(5, 1), (5, 1)], LowerOptions::default()).unwrap();
    assert_eq!(r.int_at(&[5, 5]), 30);
}

#[test]
fn sliding_window_calls_the_producer_exactly_once_per_site() {
    // g over [0, 100) needs f on [-1, 99]: 101 distinct sites, each
    // computed exactly once.
    let (mut p, f, g, gx) = scan_pipeline();
    p.compute_at(f, g, gx);
    p.store_root(f);
    let r = realize(&p, &[(0, 100)], LowerOptions::default()).unwrap();
    assert_eq!(r.stores_of("f"), 101, "no recomputation, no gaps");
    for x in 0..100 {
        assert_eq!(r.int_at(&[x]), 2 * x - 1);
    }
}

#[test]
fn sliding_window_call_count_is_exact_without_partitioning_too() {
    let (mut p, f, g, gx) = scan_pipeline();
    p.compute_at(f, g, gx);
    p.store_root(f);
    let opts = LowerOptions::builder().partition_loops(false).build();
    let r = realize(&p, &[(0, 100)], opts).unwrap();
    assert_eq!(r.stores_of("f"), 101);
    let _ = f;
    let _ = g;
}

#[test]
fn full_recomputation_when_sliding_is_disabled() {
    let (mut p, f, g, gx) = scan_pipeline();
    p.compute_at(f, g, gx);
    p.store_root(f);
    let opts = LowerOptions::builder().sliding_window(false).build();
    let r = realize(&p, &[(0, 100)], opts).unwrap();
    // Two sites per iteration, values still correct.
    assert_eq!(r.stores_of("f"), 200);
    for x in 0..100 {
        assert_eq!(r.int_at(&[x]), 2 * x - 1);
    }
    let _ = f;
    let _ = g;
}

#[test]
fn blur_scan_buffer_has_the_exact_width_and_fold() {
    // Radius r, output width w: the scan buffer spans w + 2r columns and
    // folds to the 2r + 1 live rows - never larger, never smaller.
    let (mut p, t, out, oy) = blur_pipeline(2);
    let (w, h) = (16, 12);
    p.compute_at(t, out, oy);
    p.store_root(t);
    let r = realize(&p, &[(0, w), (0, h)], LowerOptions::default()).unwrap();

    let mut alloc = None;
    r.module.stmt.walk(&mut |s| {
        if let Stmt::Allocate { stage, dims, .. } = s {
            if *stage == t && alloc.is_none() {
                let extents: Vec<i64> =
                    dims.iter().map(|d| r.module.arena.as_const_int(d.extent).unwrap()).collect();
                let folds: Vec<Option<i64>> = dims.iter().map(|d| d.fold).collect();
                alloc = Some((extents, folds));
            }
        }
    });
    let (extents, folds) = alloc.expect("t is realized into storage");
    assert_eq!(extents[0], w + 2 * 2, "scan buffer width is w + 2r exactly");
    assert_eq!(folds[0], None);
    assert_eq!(folds[1], Some(2 * 2 + 1), "rows fold to the live window");

    for x in 0..w {
        for y in 0..h {
            assert_eq!(r.int_at(&[x, y]), blur_reference(2, x, y));
        }
    }
}

#[test]
fn partitioned_select_matches_the_unpartitioned_values() {
    // select(x < 10, sin(x), likely(1.0)) over [0, 64).
    let mut p = fresnel_graph::Pipeline::new();
    let x = p.new_var("x");
    let xe = p.arena.var(x);
    let ten = p.arena.int(10);
    let cond = p.arena.lt(xe, ten);
    let xf = p.arena.cast(ScalarType::Float64, xe);
    let sin = p.arena.unary(UnaryOp::Sin, xf);
    let one = p.arena.float(1.0);
    let steady = p.arena.likely(one);
    let sel = p.arena.select(cond, sin, steady);
    let out = p.add_stage("out", ScalarType::Float64, [x], sel);
    p.set_output(out);

    let partitioned = realize(&p, &[(0, 64)], LowerOptions::default()).unwrap();
    let flat = realize(&p, &[(0, 64)], LowerOptions::builder().partition_loops(false).build()).unwrap();
    for i in 0..64 {
        let expect = if i < 10 { (i as f64).sin() } else { 1.0 };
        assert_eq!(partitioned.float_at(&[i]), expect);
        assert_eq!(flat.float_at(&[i]), expect);
    }
}

#[test]
fn reduction_with_predicate_restricts_the_domain() {
    // f(x) = 0; f(x) += r for r in [0, 20) where r <= x.
    let mut p = fresnel_graph::Pipeline::new();
    let x = p.new_var("x");
    let xe = p.arena.var(x);
    let zero = p.arena.int(0);
    let f = p.add_stage("f", ScalarType::Int64, [x], zero);

    let r = p.new_var("r");
    let rmin = p.arena.int(0);
    let rext = p.arena.int(20);
    let re = p.arena.var(r);
    let pred = p.arena.le(re, xe);
    let rd = fresnel_graph::ReductionDomain {
        vars: [(r, rmin, rext)].into_iter().collect(),
        predicate: Some(pred),
    };
    let self_read = p.arena.read(f, [xe]);
    let acc = p.arena.add(self_read, re);
    p.add_update(f, [xe], acc, Some(rd));
    p.set_output(f);

    let out = realize(&p, &[(0, 10)], LowerOptions::default()).unwrap();
    for x in 0..10i64 {
        assert_eq!(out.int_at(&[x]), x * (x + 1) / 2);
    }
}

#[test]
fn ordered_updates_apply_in_declaration_order() {
    // f(x) = x; then f(x) = f(x) * 2; then f(x) = f(x) + 1.
    let mut p = fresnel_graph::Pipeline::new();
    let x = p.new_var("x");
    let xe = p.arena.var(x);
    let f = p.add_stage("f", ScalarType::Int64, [x], xe);
    let self1 = p.arena.read(f, [xe]);
    let two = p.arena.int(2);
    let doubled = p.arena.mul(self1, two);
    p.add_update(f, [xe], doubled, None);
    let self2 = p.arena.read(f, [xe]);
    let one = p.arena.int(1);
    let bumped = p.arena.add(self2, one);
    p.add_update(f, [xe], bumped, None);
    p.set_output(f);

    let out = realize(&p, &[(0, 8)], LowerOptions::default()).unwrap();
    for x in 0..8i64 {
        assert_eq!(out.int_at(&[x]), x * 2 + 1);
    }
}

#[test]
fn tail_policies_agree_on_visible_output() {
    // Extent 10 split by 4: every policy computes the same visible values.
    let policies =
        [TailPolicy::GuardWithIf, TailPolicy::RoundUp, TailPolicy::ShiftInward, TailPolicy::Predicate];
    let mut outputs = Vec::new();
    for policy in policies {
        let (mut p, f, g, gx) = scan_pipeline();
        p.compute_root(f);
        let _ = p.split(g, gx, 4, policy);
        let r = realize(&p, &[(0, 10)], LowerOptions::default()).unwrap();
        outputs.push((policy, (0..10).map(|x| r.int_at(&[x])).collect::<Vec<_>>()));
        let _ = f;
        let _ = g;
    }
    for (policy, values) in &outputs {
        assert_eq!(values, &outputs[0].1, "policy {policy} diverged");
    }
    for (x, v) in outputs[0].1.iter().enumerate() {
        assert_eq!(*v, 2 * (x as i64) - 1);
    }
}

#[test]
fn vectorized_tail_policies_agree_on_visible_output() {
    // GuardWithIf makes the wide body lane-dependent, so it scalarizes;
    // the other policies stay wide. All four agree on what is visible.
    for policy in
        [TailPolicy::GuardWithIf, TailPolicy::RoundUp, TailPolicy::ShiftInward, TailPolicy::Predicate]
    {
        let (mut p, f, g, gx) = scan_pipeline();
        p.compute_root(f);
        let _ = p.vectorize(g, gx, 4, policy);
        let r = realize(&p, &[(0, 10)], LowerOptions::default()).unwrap();
        for x in 0..10 {
            assert_eq!(r.int_at(&[x]), 2 * x - 1, "policy {policy}");
        }
        let _ = f;
        let _ = g;
    }
}

#[test]
fn unrolled_split_matches_reference() {
    let (mut p, f, g, gx) = scan_pipeline();
    p.compute_root(f);
    let _ = p.unroll(g, gx, 4, TailPolicy::GuardWithIf);
    let r = realize(&p, &[(0, 10)], LowerOptions::default()).unwrap();
    for x in 0..10 {
        assert_eq!(r.int_at(&[x]), 2 * x - 1);
    }
    let _ = f;
    let _ = g;
}
