use test_case::test_case;

use crate::expr::{BinaryOp, ExprArena};
use crate::simplify::{can_prove_le, simplify};

#[test]
fn add_zero_is_identity() {
    let mut a = ExprArena::new();
    let x = a.new_var("x");
    let xe = a.var(x);
    let zero = a.int(0);
    let e = a.add(xe, zero);
    assert_eq!(simplify(&mut a, e), xe);
}

#[test]
fn constant_chains_merge() {
    let mut a = ExprArena::new();
    let x = a.new_var("x");
    let xe = a.var(x);
    let one = a.int(1);
    let two = a.int(2);
    let e1 = a.add(xe, one);
    let e2 = a.add(e1, two);
    let got = simplify(&mut a, e2);
    let three = a.int(3);
    let want = a.add(xe, three);
    assert_eq!(got, want);
}

#[test]
fn sub_becomes_add_of_negative() {
    let mut a = ExprArena::new();
    let x = a.new_var("x");
    let xe = a.var(x);
    let one = a.int(1);
    let five = a.int(5);
    let e1 = a.add(xe, five);
    let e2 = a.sub(e1, one);
    let got = simplify(&mut a, e2);
    let four = a.int(4);
    let want = a.add(xe, four);
    assert_eq!(got, want);
}

#[test_case(BinaryOp::Div, 12, 4, 3)]
#[test_case(BinaryOp::Div, -7, 2, -4; "floor division rounds down")]
#[test_case(BinaryOp::Mod, -7, 2, 1; "euclidean remainder is nonnegative")]
#[test_case(BinaryOp::Min, 3, 5, 3)]
#[test_case(BinaryOp::Max, 3, 5, 5)]
fn integer_folding(op: BinaryOp, lhs: i64, rhs: i64, want: i64) {
    let mut a = ExprArena::new();
    let l = a.int(lhs);
    let r = a.int(rhs);
    let e = a.binary(op, l, r);
    let got = simplify(&mut a, e);
    assert_eq!(a.as_const_int(got), Some(want));
}

#[test]
fn select_folds_on_constant_condition() {
    let mut a = ExprArena::new();
    let t = a.boolean(true);
    let one = a.int(1);
    let two = a.int(2);
    let e = a.select(t, one, two);
    assert_eq!(simplify(&mut a, e), one);
}

#[test]
fn affine_comparison_folds() {
    // (x + 1) <= (x + 3) is true for every x.
    let mut a = ExprArena::new();
    let x = a.new_var("x");
    let xe = a.var(x);
    let one = a.int(1);
    let three = a.int(3);
    let lhs = a.add(xe, one);
    let rhs = a.add(xe, three);
    let e = a.le(lhs, rhs);
    let got = simplify(&mut a, e);
    assert_eq!(a.as_const(got).and_then(|c| c.as_bool()), Some(true));
}

#[test]
fn can_prove_le_cancels_variables() {
    let mut a = ExprArena::new();
    let v = a.new_var("v");
    let ve = a.var(v);
    let two = a.int(2);
    let lhs = a.mul(ve, two);
    let five = a.int(5);
    let rhs_base = a.mul(ve, two);
    let rhs = a.add(rhs_base, five);
    assert!(can_prove_le(&mut a, lhs, rhs));
    assert!(!can_prove_le(&mut a, rhs, lhs));
}

#[test]
fn mul_div_cancellation() {
    // (x * 8) / 4 => x * 2
    let mut a = ExprArena::new();
    let x = a.new_var("x");
    let xe = a.var(x);
    let eight = a.int(8);
    let four = a.int(4);
    let m = a.mul(xe, eight);
    let d = a.div(m, four);
    let got = simplify(&mut a, d);
    let two = a.int(2);
    let want = a.mul(xe, two);
    assert_eq!(got, want);
}
