//! Tiny pipeline builders and tree-inspection helpers shared by the pass
//! tests.

use fresnel_graph::Pipeline;
use fresnel_ir::{Expr, ExprId, ForKind, ScalarType, StageId, Stmt, UnaryOp, VarId};

use crate::Module;

/// f(x) = x; g(x) = f(x - 1) + f(x + 1); g is the output.
pub fn stencil_pipeline() -> (Pipeline, StageId, StageId, VarId, VarId) {
    let mut p = Pipeline::new();
    let fx = p.new_var("x");
    let fxe = p.arena.var(fx);
    let f = p.add_stage("f", ScalarType::Int64, [fx], fxe);

    let gx = p.new_var("x");
    let gxe = p.arena.var(gx);
    let one = p.arena.int(1);
    let left = p.arena.sub(gxe, one);
    let right = p.arena.add(gxe, one);
    let rl = p.arena.read(f, [left]);
    let rr = p.arena.read(f, [right]);
    let sum = p.arena.add(rl, rr);
    let g = p.add_stage("g", ScalarType::Int64, [gx], sum);
    p.set_output(g);
    (p, f, g, fx, gx)
}

/// f(x) = x; g(x) = f(x) + f(x - 1); the sliding-window workhorse.
pub fn scan_pipeline() -> (Pipeline, StageId, StageId, VarId) {
    let mut p = Pipeline::new();
    let fx = p.new_var("x");
    let fxe = p.arena.var(fx);
    let f = p.add_stage("f", ScalarType::Int64, [fx], fxe);

    let gx = p.new_var("x");
    let gxe = p.arena.var(gx);
    let one = p.arena.int(1);
    let prev = p.arena.sub(gxe, one);
    let r0 = p.arena.read(f, [gxe]);
    let r1 = p.arena.read(f, [prev]);
    let sum = p.arena.add(r0, r1);
    let g = p.add_stage("g", ScalarType::Int64, [gx], sum);
    p.set_output(g);
    (p, f, g, gx)
}

/// Allocation metadata for a stage: (mins, extents, folds), constants only.
pub fn find_allocate(module: &Module, name: &str) -> Option<(Vec<i64>, Vec<i64>, Vec<Option<i64>>)> {
    let stage = module.stage_named(name)?;
    let mut found = None;
    module.stmt.walk(&mut |s| {
        if let Stmt::Allocate { stage: a, dims, .. } = s {
            if *a == stage && found.is_none() {
                let mins = dims.iter().map(|d| module.arena.as_const_int(d.min).unwrap_or(i64::MIN)).collect();
                let extents =
                    dims.iter().map(|d| module.arena.as_const_int(d.extent).unwrap_or(i64::MIN)).collect();
                let folds = dims.iter().map(|d| d.fold).collect();
                found = Some((mins, extents, folds));
            }
        }
    });
    found
}

/// Every loop over a variable with this display name: (min, extent, kind),
/// with non-constant bounds reported as None.
pub fn loops_over(module: &Module, var_name: &str) -> Vec<(Option<i64>, Option<i64>, ForKind)> {
    let mut out = Vec::new();
    module.stmt.walk(&mut |s| {
        if let Stmt::For { var, min, extent, kind, .. } = s {
            if module.arena.var_name(*var) == var_name {
                out.push((module.arena.as_const_int(*min), module.arena.as_const_int(*extent), *kind));
            }
        }
    });
    out
}

pub fn count_loops(module: &Module) -> usize {
    let mut n = 0;
    module.stmt.walk(&mut |s| {
        if matches!(s, Stmt::For { .. }) {
            n += 1;
        }
    });
    n
}

/// Is there a Produce of `producer` nested anywhere under a loop over a
/// variable named `var_name`?
pub fn produce_under_loop(module: &Module, producer: &str, var_name: &str) -> bool {
    let Some(stage) = module.stage_named(producer) else { return false };
    let mut found = false;
    module.stmt.walk(&mut |s| {
        if let Stmt::For { var, body, .. } = s {
            if module.arena.var_name(*var) == var_name {
                body.walk(&mut |inner| {
                    if matches!(inner, Stmt::Produce { stage: p, .. } if *p == stage) {
                        found = true;
                    }
                });
            }
        }
    });
    found
}

/// Does any expression under `stmt` contain the given unary op?
pub fn stmt_contains_unary(module: &Module, stmt: &Stmt, op: UnaryOp) -> bool {
    let mut exprs = Vec::new();
    collect_exprs(stmt, &mut exprs);
    exprs.iter().any(|e| expr_contains(module, *e, &|x| matches!(x, Expr::Unary(o, _) if *o == op)))
}

pub fn stmt_contains_select(module: &Module, stmt: &Stmt) -> bool {
    let mut exprs = Vec::new();
    collect_exprs(stmt, &mut exprs);
    exprs.iter().any(|e| expr_contains(module, *e, &|x| matches!(x, Expr::Select { .. })))
}

fn expr_contains(module: &Module, root: ExprId, pred: &dyn Fn(&Expr) -> bool) -> bool {
    let mut stack = vec![root];
    let mut seen = std::collections::HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let e = module.arena.get(id);
        if pred(e) {
            return true;
        }
        match e {
            Expr::Const(_) | Expr::Var(_) => {}
            Expr::Cast(_, a) | Expr::Unary(_, a) | Expr::Likely(a) => stack.push(*a),
            Expr::Binary(_, a, b) => stack.extend([*a, *b]),
            Expr::Select { cond, then_val, else_val } => stack.extend([*cond, *then_val, *else_val]),
            Expr::Read { indices, .. } => stack.extend(indices.iter().copied()),
            Expr::Ramp { base, stride, .. } => stack.extend([*base, *stride]),
            Expr::Broadcast { value, .. } => stack.push(*value),
        }
    }
    false
}

pub fn collect_exprs(stmt: &Stmt, out: &mut Vec<ExprId>) {
    match stmt {
        Stmt::NoOp | Stmt::Release { .. } => {}
        Stmt::Block(stmts) => {
            for s in stmts {
                collect_exprs(s, out);
            }
        }
        Stmt::For { min, extent, body, .. } => {
            out.extend([*min, *extent]);
            collect_exprs(body, out);
        }
        Stmt::If { cond, then_branch, else_branch } => {
            out.push(*cond);
            collect_exprs(then_branch, out);
            if let Some(e) = else_branch {
                collect_exprs(e, out);
            }
        }
        Stmt::Store { indices, value, predicate, .. } => {
            out.extend(indices.iter().copied());
            out.push(*value);
            out.extend(predicate.iter().copied());
        }
        Stmt::Allocate { dims, body, .. } => {
            out.extend(dims.iter().flat_map(|d| [d.min, d.extent]));
            collect_exprs(body, out);
        }
        Stmt::Produce { body, .. } | Stmt::Consume { body, .. } | Stmt::Acquire { body, .. } => {
            collect_exprs(body, out)
        }
        Stmt::Fork { producer, consumer } => {
            collect_exprs(producer, out);
            collect_exprs(consumer, out);
        }
        Stmt::Assert { cond, .. } => out.push(*cond),
    }
}

/// All stores of a stage, with their atomic kinds.
pub fn stores_of(module: &Module, name: &str) -> Vec<fresnel_ir::AtomicKind> {
    let Some(stage) = module.stage_named(name) else { return Vec::new() };
    let mut out = Vec::new();
    module.stmt.walk(&mut |s| {
        if let Stmt::Store { stage: t, atomic, .. } = s {
            if *t == stage {
                out.push(*atomic);
            }
        }
    });
    out
}
