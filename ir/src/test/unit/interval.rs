use crate::expr::ExprArena;
use crate::interval::{bounds_of_expr, Interval, Scope};

fn const_interval(a: &mut ExprArena, lo: i64, hi: i64) -> Interval {
    let lo = a.int(lo);
    let hi = a.int(hi);
    Interval::bounded(lo, hi)
}

#[test]
fn var_bounds_come_from_scope() {
    let mut a = ExprArena::new();
    let x = a.new_var("x");
    let xe = a.var(x);
    let one = a.int(1);
    let e = a.add(xe, one);

    let mut scope = Scope::new();
    scope.insert(x, const_interval(&mut a, 0, 9));

    let i = bounds_of_expr(&mut a, e, &scope);
    assert_eq!(i.min.and_then(|m| a.as_const_int(m)), Some(1));
    assert_eq!(i.max.and_then(|m| a.as_const_int(m)), Some(10));
}

#[test]
fn unbound_var_stays_symbolic() {
    let mut a = ExprArena::new();
    let y = a.new_var("y");
    let ye = a.var(y);
    let two = a.int(2);
    let e = a.sub(ye, two);

    let i = bounds_of_expr(&mut a, e, &Scope::new());
    // [y - 2, y - 2]: still parameterized by y.
    assert_eq!(i.min, i.max);
    let min = i.min.unwrap();
    assert!(a.references_var(min, y));
}

#[test]
fn subtraction_flips_sides() {
    let mut a = ExprArena::new();
    let x = a.new_var("x");
    let xe = a.var(x);
    let ten = a.int(10);
    let e = a.sub(ten, xe);

    let mut scope = Scope::new();
    scope.insert(x, const_interval(&mut a, 2, 5));

    let i = bounds_of_expr(&mut a, e, &scope);
    assert_eq!(i.min.and_then(|m| a.as_const_int(m)), Some(5));
    assert_eq!(i.max.and_then(|m| a.as_const_int(m)), Some(8));
}

#[test]
fn negative_scale_swaps_bounds() {
    let mut a = ExprArena::new();
    let x = a.new_var("x");
    let xe = a.var(x);
    let minus3 = a.int(-3);
    let e = a.mul(xe, minus3);

    let mut scope = Scope::new();
    scope.insert(x, const_interval(&mut a, 1, 4));

    let i = bounds_of_expr(&mut a, e, &scope);
    assert_eq!(i.min.and_then(|m| a.as_const_int(m)), Some(-12));
    assert_eq!(i.max.and_then(|m| a.as_const_int(m)), Some(-3));
}

#[test]
fn modulo_by_constant_is_one_period() {
    let mut a = ExprArena::new();
    let x = a.new_var("x");
    let xe = a.var(x);
    let seven = a.int(7);
    let e = a.modulo(xe, seven);

    let i = bounds_of_expr(&mut a, e, &Scope::new());
    assert_eq!(i.min.and_then(|m| a.as_const_int(m)), Some(0));
    assert_eq!(i.max.and_then(|m| a.as_const_int(m)), Some(6));
}

#[test]
fn data_dependent_read_is_unbounded() {
    let mut a = ExprArena::new();
    let s = crate::expr::StageId(0);
    let x = a.new_var("x");
    let xe = a.var(x);
    let r = a.read(s, [xe]);

    let i = bounds_of_expr(&mut a, r, &Scope::new());
    assert!(!i.is_bounded());
}

#[test]
fn union_takes_widest() {
    let mut a = ExprArena::new();
    let i1 = const_interval(&mut a, 0, 5);
    let i2 = const_interval(&mut a, 3, 9);
    let u = i1.union(&i2, &mut a);
    assert_eq!(u.min.and_then(|m| a.as_const_int(m)), Some(0));
    assert_eq!(u.max.and_then(|m| a.as_const_int(m)), Some(9));
}

#[test]
fn extent_is_inclusive() {
    let mut a = ExprArena::new();
    let i = const_interval(&mut a, -1, 100);
    let e = i.extent(&mut a).unwrap();
    assert_eq!(a.as_const_int(e), Some(102));
}
