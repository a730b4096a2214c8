use fresnel_graph::Pipeline;
use fresnel_ir::{Expr, ScalarType, Stmt};

use crate::test::helpers::{collect_exprs, find_allocate, scan_pipeline};
use crate::{lower, Error, LowerOptions};

fn no_partition() -> LowerOptions {
    LowerOptions::builder().partition_loops(false).build()
}

#[test_log::test]
fn sliding_rewrites_the_producer_loop_min() {
    let (mut p, f, g, gx) = scan_pipeline();
    p.compute_at(f, g, gx);
    p.store_root(f);
    let m = lower(&p, &[(0, 100)], no_partition()).unwrap();

    // The produce loop min must have become a warmup select carrying the
    // steady-state hint.
    let mut warmup_select = false;
    m.stmt.walk(&mut |s| {
        if let Stmt::For { min, .. } = s {
            if let Expr::Select { else_val, .. } = m.arena.get(*min) {
                if matches!(m.arena.get(*else_val), Expr::Likely(_)) {
                    warmup_select = true;
                }
            }
        }
    });
    assert!(warmup_select, "{}", m.pretty());
}

#[test]
fn sliding_without_partitioning_still_lowers() {
    // The warmup select is evaluated per iteration when partitioning is
    // off; both options must produce a tree.
    let (mut p, f, g, gx) = scan_pipeline();
    p.compute_at(f, g, gx);
    p.store_root(f);
    assert!(lower(&p, &[(0, 100)], LowerOptions::default()).is_ok());
    assert!(lower(&p, &[(0, 100)], no_partition()).is_ok());
}

#[test]
fn full_recomputation_kept_when_region_is_not_monotone() {
    // g reads f at both x and N-1-x: the window moves both ways, so the
    // rewrite must not fire and no fold happens.
    let mut p = Pipeline::new();
    let fx = p.new_var("x");
    let fxe = p.arena.var(fx);
    let f = p.add_stage("f", ScalarType::Int64, [fx], fxe);

    let gx = p.new_var("x");
    let gxe = p.arena.var(gx);
    let n1 = p.arena.int(15);
    let mirrored = p.arena.sub(n1, gxe);
    let r0 = p.arena.read(f, [gxe]);
    let r1 = p.arena.read(f, [mirrored]);
    let sum = p.arena.add(r0, r1);
    let g = p.add_stage("g", ScalarType::Int64, [gx], sum);
    p.set_output(g);

    p.compute_at(f, g, gx);
    p.store_root(f);
    let m = lower(&p, &[(0, 16)], LowerOptions::default()).unwrap();
    let (_, _, folds) = find_allocate(&m, "f").unwrap();
    assert_eq!(folds, vec![None], "non-monotone window must not fold");

    let mut exprs = Vec::new();
    collect_exprs(&m.stmt, &mut exprs);
    let any_likely = exprs.iter().any(|e| m.arena.contains_likely(*e));
    assert!(!any_likely, "no sliding hint expected");
}

#[test]
fn automatic_fold_is_the_exact_live_window() {
    // f read at x and x-1: the live window is two cells.
    let (mut p, f, g, gx) = scan_pipeline();
    p.compute_at(f, g, gx);
    p.store_root(f);
    let m = lower(&p, &[(0, 100)], LowerOptions::default()).unwrap();
    let (_, extents, folds) = find_allocate(&m, "f").unwrap();
    assert_eq!(folds, vec![Some(2)]);
    assert_eq!(extents, vec![2]);
}

#[test]
fn folded_accesses_wrap_modulo_the_fold() {
    let (mut p, f, g, gx) = scan_pipeline();
    p.compute_at(f, g, gx);
    p.store_root(f);
    let m = lower(&p, &[(0, 100)], LowerOptions::default()).unwrap();

    // Every read of f must go through a modulo by the fold extent.
    let mut exprs = Vec::new();
    collect_exprs(&m.stmt, &mut exprs);
    let mut wrapped_reads = 0;
    let mut seen = std::collections::HashSet::new();
    let mut stack = exprs;
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        match m.arena.get(id) {
            Expr::Read { stage, indices } if *stage == f => {
                if let Expr::Binary(fresnel_ir::BinaryOp::Mod, _, b) = m.arena.get(indices[0]) {
                    if m.arena.as_const_int(*b) == Some(2) {
                        wrapped_reads += 1;
                    }
                }
                stack.extend(indices.iter().copied());
            }
            Expr::Cast(_, a) | Expr::Unary(_, a) | Expr::Likely(a) => stack.push(*a),
            Expr::Binary(_, a, b) => stack.extend([*a, *b]),
            Expr::Select { cond, then_val, else_val } => stack.extend([*cond, *then_val, *else_val]),
            Expr::Read { indices, .. } => stack.extend(indices.iter().copied()),
            Expr::Ramp { base, stride, .. } => stack.extend([*base, *stride]),
            Expr::Broadcast { value, .. } => stack.push(*value),
            Expr::Const(_) | Expr::Var(_) => {}
        }
    }
    assert!(wrapped_reads >= 2, "{}", m.pretty());
}

#[test]
fn explicit_fold_factor_below_the_window_is_rejected() {
    // The per-iteration window spans x-1 ..= x: two live cells.
    let (mut p, f, g, gx) = scan_pipeline();
    p.compute_at(f, g, gx);
    p.store_root(f);
    p.fold_storage(f, 0, 1);
    let err = lower(&p, &[(0, 100)], LowerOptions::default()).unwrap_err();
    assert!(
        matches!(err, Error::FoldFactorTooSmall { ref stage, dim: 0, factor: 1, window: 2 } if stage == "f"),
        "{err}"
    );
}

#[test]
fn explicit_fold_factor_above_the_window_is_honored() {
    let (mut p, f, g, gx) = scan_pipeline();
    p.compute_at(f, g, gx);
    p.store_root(f);
    p.fold_storage(f, 0, 8);
    let m = lower(&p, &[(0, 100)], LowerOptions::default()).unwrap();
    let (_, extents, folds) = find_allocate(&m, "f").unwrap();
    assert_eq!(folds, vec![Some(8)]);
    assert_eq!(extents, vec![8]);
}

#[test]
fn explicit_fold_on_unprovable_window_is_rejected() {
    let mut p = Pipeline::new();
    let fx = p.new_var("x");
    let fxe = p.arena.var(fx);
    let f = p.add_stage("f", ScalarType::Int64, [fx], fxe);

    let gx = p.new_var("x");
    let gxe = p.arena.var(gx);
    let n1 = p.arena.int(15);
    let mirrored = p.arena.sub(n1, gxe);
    let r0 = p.arena.read(f, [gxe]);
    let r1 = p.arena.read(f, [mirrored]);
    let sum = p.arena.add(r0, r1);
    let g = p.add_stage("g", ScalarType::Int64, [gx], sum);
    p.set_output(g);

    p.compute_at(f, g, gx);
    p.store_root(f);
    p.fold_storage(f, 0, 4);
    let err = lower(&p, &[(0, 16)], LowerOptions::default()).unwrap_err();
    assert!(matches!(err, Error::FoldNotProvable { ref stage, dim: 0 } if stage == "f"), "{err}");
}
