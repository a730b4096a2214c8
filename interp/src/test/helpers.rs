//! Pipeline builders shared by the interpreter tests.

use fresnel_graph::Pipeline;
use fresnel_ir::{ScalarType, StageId, VarId};

/// f(x, y) = x + y; g(x, y) = f(x-1, y) + f(x, y) + f(x+1, y).
pub fn boundary_pipeline() -> (Pipeline, StageId, StageId) {
    let mut p = Pipeline::new();
    let fx = p.new_var("x");
    let fy = p.new_var("y");
    let fxe = p.arena.var(fx);
    let fye = p.arena.var(fy);
    let sum = p.arena.add(fxe, fye);
    let f = p.add_stage("f", ScalarType::Int64, [fx, fy], sum);

    let gx = p.new_var("x");
    let gy = p.new_var("y");
    let gxe = p.arena.var(gx);
    let gye = p.arena.var(gy);
    let one = p.arena.int(1);
    let left = p.arena.sub(gxe, one);
    let right = p.arena.add(gxe, one);
    let rl = p.arena.read(f, [left, gye]);
    let rm = p.arena.read(f, [gxe, gye]);
    let rr = p.arena.read(f, [right, gye]);
    let s1 = p.arena.add(rl, rm);
    let s2 = p.arena.add(s1, rr);
    let g = p.add_stage("g", ScalarType::Int64, [gx, gy], s2);
    p.set_output(g);
    (p, f, g)
}

/// f(x) = x; g(x) = f(x) + f(x - 1).
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

/// Single-pass 2-D box blur of radius `r`:
/// t(x, y) = x * 10 + y; out(x, y) = sum of t over the (2r+1)^2 window.
pub fn blur_pipeline(r: i64) -> (Pipeline, StageId, StageId, VarId) {
    let mut p = Pipeline::new();
    let tx = p.new_var("x");
    let ty = p.new_var("y");
    let txe = p.arena.var(tx);
    let tye = p.arena.var(ty);
    let ten = p.arena.int(10);
    let sx = p.arena.mul(txe, ten);
    let v = p.arena.add(sx, tye);
    let t = p.add_stage("t", ScalarType::Int64, [tx, ty], v);

    let ox = p.new_var("x");
    let oy = p.new_var("y");
    let oxe = p.arena.var(ox);
    let oye = p.arena.var(oy);
    let mut acc = None;
    for dx in -r..=r {
        for dy in -r..=r {
            let dxe = p.arena.int(dx);
            let dye = p.arena.int(dy);
            let ix = p.arena.add(oxe, dxe);
            let iy = p.arena.add(oye, dye);
            let read = p.arena.read(t, [ix, iy]);
            acc = Some(match acc {
                Some(a) => p.arena.add(a, read),
                None => read,
            });
        }
    }
    let out = p.add_stage("out", ScalarType::Int64, [ox, oy], acc.unwrap());
    p.set_output(out);
    (p, t, out, oy)
}

/// Reference blur value at one point.
pub fn blur_reference(r: i64, x: i64, y: i64) -> i64 {
    let mut acc = 0;
    for dx in -r..=r {
        for dy in -r..=r {
            acc += (x + dx) * 10 + (y + dy);
        }
    }
    acc
}

/// out(x, y) = f(x, y) + f(x+1, y) + f(x, y+1) with f(x, y) = 3x + y;
/// the workhorse for schedule invariance.
pub fn invariance_pipeline() -> (Pipeline, StageId, StageId, VarId, VarId) {
    let mut p = Pipeline::new();
    let fx = p.new_var("x");
    let fy = p.new_var("y");
    let fxe = p.arena.var(fx);
    let fye = p.arena.var(fy);
    let three = p.arena.int(3);
    let sx = p.arena.mul(fxe, three);
    let v = p.arena.add(sx, fye);
    let f = p.add_stage("f", ScalarType::Int64, [fx, fy], v);

    let ox = p.new_var("x");
    let oy = p.new_var("y");
    let oxe = p.arena.var(ox);
    let oye = p.arena.var(oy);
    let one = p.arena.int(1);
    let x1 = p.arena.add(oxe, one);
    let y1 = p.arena.add(oye, one);
    let r0 = p.arena.read(f, [oxe, oye]);
    let r1 = p.arena.read(f, [x1, oye]);
    let r2 = p.arena.read(f, [oxe, y1]);
    let s1 = p.arena.add(r0, r1);
    let s2 = p.arena.add(s1, r2);
    let out = p.add_stage("out", ScalarType::Int64, [ox, oy], s2);
    p.set_output(out);
    (p, f, out, ox, oy)
}

pub fn invariance_reference(x: i64, y: i64) -> i64 {
    let f = |x: i64, y: i64| 3 * x + y;
    f(x, y) + f(x + 1, y) + f(x, y + 1)
}
