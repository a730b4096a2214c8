use std::collections::HashMap;

use crate::expr::ExprArena;
use crate::linear::linear_of_expr;

#[test]
fn extracts_affine_form() {
    // 2*x + 3*y - 5
    let mut a = ExprArena::new();
    let x = a.new_var("x");
    let y = a.new_var("y");
    let xe = a.var(x);
    let ye = a.var(y);
    let two = a.int(2);
    let three = a.int(3);
    let five = a.int(5);
    let tx = a.mul(two, xe);
    let ty = a.mul(three, ye);
    let sum = a.add(tx, ty);
    let e = a.sub(sum, five);

    let l = linear_of_expr(&a, e).unwrap();
    assert_eq!(l.coeff(x), 2);
    assert_eq!(l.coeff(y), 3);
    assert_eq!(l.constant, -5);
}

#[test]
fn declines_nonlinear() {
    let mut a = ExprArena::new();
    let x = a.new_var("x");
    let xe = a.var(x);
    let sq = a.mul(xe, xe);
    assert!(linear_of_expr(&a, sq).is_none());
}

#[test]
fn likely_is_transparent() {
    let mut a = ExprArena::new();
    let x = a.new_var("x");
    let xe = a.var(x);
    let one = a.int(1);
    let inner = a.add(xe, one);
    let e = a.likely(inner);
    let l = linear_of_expr(&a, e).unwrap();
    assert_eq!(l.coeff(x), 1);
    assert_eq!(l.constant, 1);
}

#[test]
fn difference_cancels_shared_terms() {
    let mut a = ExprArena::new();
    let v = a.new_var("v");
    let ve = a.var(v);
    let one = a.int(1);
    let lhs = a.add(ve, one);
    let la = linear_of_expr(&a, lhs).unwrap();
    let lb = linear_of_expr(&a, ve).unwrap();
    assert_eq!(la.sub(&lb).as_constant(), Some(1));
}

#[test]
fn eval_bounds_over_box() {
    // 3*x - 2*y over x in [0, 4], y in [1, 2] => [3*0 - 2*2, 3*4 - 2*1]
    let mut a = ExprArena::new();
    let x = a.new_var("x");
    let y = a.new_var("y");
    let xe = a.var(x);
    let ye = a.var(y);
    let three = a.int(3);
    let two = a.int(2);
    let tx = a.mul(three, xe);
    let ty = a.mul(two, ye);
    let e = a.sub(tx, ty);

    let l = linear_of_expr(&a, e).unwrap();
    let mut bounds = HashMap::new();
    bounds.insert(x, (0, 4));
    bounds.insert(y, (1, 2));
    assert_eq!(l.eval_bounds(&bounds), Some((-4, 10)));
}
