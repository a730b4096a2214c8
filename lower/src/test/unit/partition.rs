use fresnel_graph::Pipeline;
use fresnel_ir::{ForKind, ScalarType, UnaryOp};

use crate::test::helpers::{loops_over, stmt_contains_select, stmt_contains_unary};
use crate::{lower, LowerOptions};

/// out(x) = select(x < 10, sin(x), likely(1.0)) over [0, n).
fn likely_pipeline(n: i64) -> (Pipeline, i64) {
    let mut p = Pipeline::new();
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
    (p, n)
}

#[test]
fn likely_select_splits_into_prologue_and_steady_state() {
    let (p, n) = likely_pipeline(100);
    let m = lower(&p, &[(0, n)], LowerOptions::default()).unwrap();

    let loops = loops_over(&m, "x");
    assert_eq!(
        loops,
        vec![
            (Some(0), Some(10), ForKind::Serial),
            (Some(10), Some(n - 10), ForKind::Serial),
        ],
        "{}",
        m.pretty()
    );
}

#[test]
fn steady_state_is_free_of_the_conditional() {
    let (p, n) = likely_pipeline(100);
    let m = lower(&p, &[(0, n)], LowerOptions::default()).unwrap();

    // Second x-loop = steady state: no select, no sin.
    let mut bodies = Vec::new();
    m.stmt.walk(&mut |s| {
        if let fresnel_ir::Stmt::For { var, body, .. } = s {
            if m.arena.var_name(*var) == "x" {
                bodies.push((**body).clone());
            }
        }
    });
    assert_eq!(bodies.len(), 2);
    assert!(stmt_contains_unary(&m, &bodies[0], UnaryOp::Sin), "prologue keeps the slow path");
    assert!(!stmt_contains_select(&m, &bodies[1]), "steady state must drop the select");
    assert!(!stmt_contains_unary(&m, &bodies[1], UnaryOp::Sin), "steady state must drop sin");
}

#[test]
fn unsolvable_condition_degenerates_to_one_loop() {
    // Condition on x*x is not affine: partitioning is skipped, never wrong.
    let mut p = Pipeline::new();
    let x = p.new_var("x");
    let xe = p.arena.var(x);
    let sq = p.arena.mul(xe, xe);
    let fifty = p.arena.int(50);
    let cond = p.arena.lt(sq, fifty);
    let a = p.arena.int(1);
    let b = p.arena.int(2);
    let likely_b = p.arena.likely(b);
    let sel = p.arena.select(cond, a, likely_b);
    let out = p.add_stage("out", ScalarType::Int64, [x], sel);
    p.set_output(out);

    let m = lower(&p, &[(0, 20)], LowerOptions::default()).unwrap();
    let loops = loops_over(&m, "x");
    assert_eq!(loops.len(), 1);
}

#[test]
fn likely_then_branch_gives_steady_then_epilogue() {
    // select(x < 90, likely(1), 2) over [0, 100): steady state first, then
    // a 10-iteration epilogue.
    let mut p = Pipeline::new();
    let x = p.new_var("x");
    let xe = p.arena.var(x);
    let ninety = p.arena.int(90);
    let cond = p.arena.lt(xe, ninety);
    let one = p.arena.int(1);
    let two = p.arena.int(2);
    let likely_one = p.arena.likely(one);
    let sel = p.arena.select(cond, likely_one, two);
    let out = p.add_stage("out", ScalarType::Int64, [x], sel);
    p.set_output(out);

    let m = lower(&p, &[(0, 100)], LowerOptions::default()).unwrap();
    let loops = loops_over(&m, "x");
    assert_eq!(
        loops,
        vec![(Some(0), Some(90), ForKind::Serial), (Some(90), Some(10), ForKind::Serial)],
        "{}",
        m.pretty()
    );
}

#[test]
fn likely_reduction_predicate_partitions_the_reduction_loop() {
    // f(x) = 0; f(x) += r for r in [0, 100) where likely(r < 90): the
    // steady state drops the predicate check entirely.
    let mut p = Pipeline::new();
    let x = p.new_var("x");
    let xe = p.arena.var(x);
    let zero = p.arena.int(0);
    let f = p.add_stage("f", ScalarType::Int64, [x], zero);

    let r = p.new_var("r");
    let rmin = p.arena.int(0);
    let rext = p.arena.int(100);
    let re = p.arena.var(r);
    let ninety = p.arena.int(90);
    let cond = p.arena.lt(re, ninety);
    let pred = p.arena.likely(cond);
    let rd = fresnel_graph::ReductionDomain {
        vars: [(r, rmin, rext)].into_iter().collect(),
        predicate: Some(pred),
    };
    let self_read = p.arena.read(f, [xe]);
    let acc = p.arena.add(self_read, re);
    p.add_update(f, [xe], acc, Some(rd));
    p.set_output(f);

    let m = lower(&p, &[(0, 4)], LowerOptions::default()).unwrap();
    let loops = loops_over(&m, "r");
    assert_eq!(
        loops,
        vec![(Some(0), Some(90), ForKind::Serial), (Some(90), Some(10), ForKind::Serial)],
        "{}",
        m.pretty()
    );
}

#[test]
fn no_hint_means_no_partitioning() {
    let mut p = Pipeline::new();
    let x = p.new_var("x");
    let xe = p.arena.var(x);
    let ten = p.arena.int(10);
    let cond = p.arena.lt(xe, ten);
    let a = p.arena.int(1);
    let b = p.arena.int(2);
    let sel = p.arena.select(cond, a, b);
    let out = p.add_stage("out", ScalarType::Int64, [x], sel);
    p.set_output(out);

    let m = lower(&p, &[(0, 100)], LowerOptions::default()).unwrap();
    assert_eq!(loops_over(&m, "x").len(), 1);
}
