use fresnel_graph::{Pipeline, TailPolicy};
use fresnel_ir::{ForKind, ScalarType, Stmt};

use crate::test::helpers::{find_allocate, loops_over, produce_under_loop, stencil_pipeline};
use crate::{lower, Error, LowerOptions};

#[test]
fn root_realization_produces_before_consuming() {
    let (mut p, f, g, _, _) = stencil_pipeline();
    p.compute_root(f);
    let m = lower(&p, &[(0, 10)], LowerOptions::default()).unwrap();

    // Pre-order positions: f's produce must precede g's.
    let mut order = Vec::new();
    m.stmt.walk(&mut |s| {
        if let Stmt::Produce { stage, .. } = s {
            order.push(*stage);
        }
    });
    let fi = order.iter().position(|s| *s == f).unwrap();
    let gi = order.iter().position(|s| *s == g).unwrap();
    assert!(fi < gi, "producer must be emitted before its consumer");
}

#[test]
fn anchored_stage_is_injected_inside_the_anchor_loop() {
    let (mut p, f, g, _, gx) = stencil_pipeline();
    p.compute_at(f, g, gx);
    let m = lower(&p, &[(0, 10)], LowerOptions::default()).unwrap();
    assert!(produce_under_loop(&m, "f", "x"));
    // Per-iteration storage: three cells, x-1 ..= x+1.
    let (_, extents, _) = find_allocate(&m, "f").unwrap();
    assert_eq!(extents, vec![3]);
}

#[test]
fn store_coarser_than_compute_hoists_the_allocation() {
    // out(x, y) = f(x); f computed per x but stored per y.
    let mut p = Pipeline::new();
    let fx = p.new_var("x");
    let fxe = p.arena.var(fx);
    let f = p.add_stage("f", ScalarType::Int64, [fx], fxe);

    let ox = p.new_var("x");
    let oy = p.new_var("y");
    let oxe = p.arena.var(ox);
    let fread = p.arena.read(f, [oxe]);
    let out = p.add_stage("out", ScalarType::Int64, [ox, oy], fread);
    p.set_output(out);

    p.compute_at(f, out, ox);
    p.store_at(f, out, oy);
    let m = lower(&p, &[(0, 4), (0, 3)], LowerOptions::default()).unwrap();

    // The allocate must sit under y but outside x.
    let mut alloc_under_y = false;
    m.stmt.walk(&mut |s| {
        if let Stmt::For { var, body, .. } = s {
            if m.arena.var_name(*var) == "y" {
                if let Stmt::Allocate { stage, .. } = &**body {
                    alloc_under_y = *stage == f;
                }
            }
        }
    });
    assert!(alloc_under_y, "allocation belongs at the store anchor:\n{}", m.pretty());
    assert!(produce_under_loop(&m, "f", "x"));
}

#[test]
fn anchor_must_enclose_every_consumer() {
    // f is read both by g and by the output directly; computing f at g's
    // loop leaves the output's read outside the produced scope.
    let mut p = Pipeline::new();
    let fx = p.new_var("x");
    let fxe = p.arena.var(fx);
    let f = p.add_stage("f", ScalarType::Int64, [fx], fxe);

    let gx = p.new_var("x");
    let gxe = p.arena.var(gx);
    let fread = p.arena.read(f, [gxe]);
    let g = p.add_stage("g", ScalarType::Int64, [gx], fread);
    p.compute_root(g);

    let ox = p.new_var("x");
    let oxe = p.arena.var(ox);
    let gread = p.arena.read(g, [oxe]);
    let fread2 = p.arena.read(f, [oxe]);
    let sum = p.arena.add(gread, fread2);
    let out = p.add_stage("out", ScalarType::Int64, [ox], sum);
    p.set_output(out);

    p.compute_at(f, g, gx);
    let err = lower(&p, &[(0, 8)], LowerOptions::default()).unwrap_err();
    assert!(matches!(err, Error::AnchorNotEnclosingConsumers { ref stage, .. } if stage == "f"), "{err}");
}

#[test]
fn guarded_split_emits_a_tail_guard() {
    let (mut p, f, g, _, gx) = stencil_pipeline();
    p.compute_root(f);
    let _ = p.split(g, gx, 4, TailPolicy::GuardWithIf);
    // Extent 10 does not divide 4: the body must be guarded.
    let m = lower(&p, &[(0, 10)], LowerOptions::default()).unwrap();
    let mut guards = 0;
    m.stmt.walk(&mut |s| {
        if matches!(s, Stmt::If { .. }) {
            guards += 1;
        }
    });
    assert!(guards >= 1, "expected a tail guard:\n{}", m.pretty());

    // The outer loop runs ceil(10 / 4) = 3 iterations.
    let outer = loops_over(&m, "xo");
    assert_eq!(outer, vec![(Some(0), Some(3), ForKind::Serial)]);
}

#[test]
fn exact_split_needs_no_guard() {
    let (mut p, f, g, _, gx) = stencil_pipeline();
    p.compute_root(f);
    let _ = p.split(g, gx, 4, TailPolicy::GuardWithIf);
    let m = lower(&p, &[(0, 12)], LowerOptions::default()).unwrap();
    let mut guards = 0;
    m.stmt.walk(&mut |s| {
        if matches!(s, Stmt::If { .. }) {
            guards += 1;
        }
    });
    assert_eq!(guards, 0, "divisible split must not emit a guard:\n{}", m.pretty());
}

#[test]
fn shift_inward_split_emits_no_guard_but_asserts_extent() {
    let (mut p, f, g, _, gx) = stencil_pipeline();
    p.compute_root(f);
    let _ = p.split(g, gx, 4, TailPolicy::ShiftInward);
    let m = lower(&p, &[(0, 10)], LowerOptions::default()).unwrap();
    let mut ifs = 0;
    let mut asserts = 0;
    m.stmt.walk(&mut |s| match s {
        Stmt::If { .. } => ifs += 1,
        Stmt::Assert { .. } => asserts += 1,
        _ => {}
    });
    assert_eq!(ifs, 0);
    assert_eq!(asserts, 1);
}

#[test]
fn predicate_split_attaches_to_the_store() {
    let (mut p, f, g, _, gx) = stencil_pipeline();
    p.compute_root(f);
    let _ = p.split(g, gx, 4, TailPolicy::Predicate);
    let m = lower(&p, &[(0, 10)], LowerOptions::default()).unwrap();
    let mut predicated = 0;
    m.stmt.walk(&mut |s| {
        if matches!(s, Stmt::Store { predicate: Some(_), .. }) {
            predicated += 1;
        }
    });
    assert_eq!(predicated, 1, "{}", m.pretty());
}

#[test]
fn reorder_changes_emission_order() {
    let mut p = Pipeline::new();
    let x = p.new_var("x");
    let y = p.new_var("y");
    let xe = p.arena.var(x);
    let ye = p.arena.var(y);
    let sum = p.arena.add(xe, ye);
    let out = p.add_stage("out", ScalarType::Int64, [x, y], sum);
    p.set_output(out);
    // Default: x innermost. Reordered: y innermost.
    p.reorder(out, &[y, x]);
    let m = lower(&p, &[(0, 4), (0, 3)], LowerOptions::default()).unwrap();

    let mut outermost = None;
    m.stmt.walk(&mut |s| {
        if let Stmt::For { var, .. } = s {
            if outermost.is_none() {
                outermost = Some(m.arena.var_name(*var).to_string());
            }
        }
    });
    assert_eq!(outermost.as_deref(), Some("x"));
}

#[test]
fn fused_loop_covers_the_product_space() {
    let mut p = Pipeline::new();
    let x = p.new_var("x");
    let y = p.new_var("y");
    let xe = p.arena.var(x);
    let ye = p.arena.var(y);
    let sum = p.arena.add(xe, ye);
    let out = p.add_stage("out", ScalarType::Int64, [x, y], sum);
    p.set_output(out);
    let fused = p.fuse(out, y, x);
    let _ = fused;
    let m = lower(&p, &[(0, 4), (0, 3)], LowerOptions::default()).unwrap();
    let loops = loops_over(&m, "y_x");
    assert_eq!(loops, vec![(Some(0), Some(12), ForKind::Serial)]);
}
