//! Execution of a lowered module.
//!
//! Parallel loops run fork-join on the rayon pool (the calling thread
//! blocks until every spawned iteration completes; nested parallelism
//! composes through work stealing, so blocked joins never deadlock). Async
//! `Fork` nodes get a real thread per producer; `Acquire` blocks on a
//! condvar-backed counting semaphore rather than spinning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use fresnel_ir::{AtomicKind, ConstValue, Expr, ExprId, ForKind, StageId, Stmt, VarId};
use fresnel_lower::Module;
use smallvec::SmallVec;

use crate::buffer::{BufDim, Buffer};
use crate::error::{internal, Error, Result};
use crate::value::{apply_cast, apply_unary, lift_binary, Value};

/// Counting semaphore for async handoff.
pub struct Semaphore {
    count: Mutex<i64>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(initial: i64) -> Self {
        Semaphore { count: Mutex::new(initial), cv: Condvar::new() }
    }

    pub fn acquire(&self, n: u32) {
        let mut c = self.count.lock();
        while *c < n as i64 {
            self.cv.wait(&mut c);
        }
        *c -= n as i64;
    }

    pub fn release(&self, n: u32) {
        let mut c = self.count.lock();
        *c += n as i64;
        self.cv.notify_all();
    }
}

/// Per-stage execution counters. Store counts are per computed site (one
/// per vector lane), which is what call-count exactness is stated over.
#[derive(Debug)]
pub struct Stats {
    stores: Vec<AtomicU64>,
}

impl Stats {
    fn new(n: usize) -> Self {
        let mut stores = Vec::with_capacity(n);
        stores.resize_with(n, || AtomicU64::new(0));
        Stats { stores }
    }

    pub fn stores(&self, s: StageId) -> u64 {
        self.stores[s.0 as usize].load(Ordering::Relaxed)
    }
}

/// Loop bindings plus the live buffer per stage. Cloned at loop entry,
/// parallel task spawn, and allocation scope entry; buffers are shared
/// through `Arc`, so clones are cheap.
#[derive(Clone)]
struct Frame {
    env: HashMap<VarId, i64>,
    buffers: Vec<Option<Arc<Buffer>>>,
}

/// In-flight CAS retry: reads of this location see the freshly loaded value
/// instead of the cell, so the recompute-and-reattempt cycle is exact.
struct CasView<'a> {
    stage: StageId,
    indices: &'a [i64],
    value: ConstValue,
}

pub struct Executor<'m> {
    module: &'m Module,
    sems: Vec<Semaphore>,
    pub stats: Stats,
}

impl<'m> Executor<'m> {
    pub fn new(module: &'m Module) -> Self {
        Executor {
            module,
            sems: module.semaphores.iter().map(|init| Semaphore::new(*init)).collect(),
            stats: Stats::new(module.stage_names.len()),
        }
    }

    fn stage_name(&self, s: StageId) -> &str {
        &self.module.stage_names[s.0 as usize]
    }

    /// Run the module with the given external output buffer.
    pub fn run(&self, output: Arc<Buffer>) -> Result<()> {
        let mut frame = Frame { env: HashMap::new(), buffers: vec![None; self.module.stage_names.len()] };
        frame.buffers[self.module.output.0 as usize] = Some(output);
        self.exec(&self.module.stmt, &frame)
    }

    fn exec(&self, stmt: &Stmt, frame: &Frame) -> Result<()> {
        match stmt {
            Stmt::NoOp => Ok(()),
            Stmt::Block(stmts) => {
                for s in stmts {
                    self.exec(s, frame)?;
                }
                Ok(())
            }
            Stmt::For { var, min, extent, kind, body } => {
                let min = self.eval(*min, frame, None)?.as_int()?;
                let extent = self.eval(*extent, frame, None)?.as_int()?;
                if extent <= 0 {
                    return Ok(());
                }
                match kind {
                    ForKind::Serial => {
                        let mut f = frame.clone();
                        for i in 0..extent {
                            f.env.insert(*var, min + i);
                            self.exec(body, &f)?;
                        }
                        Ok(())
                    }
                    ForKind::Parallel => (0..extent).into_par_iter().try_for_each(|i| {
                        let mut f = frame.clone();
                        f.env.insert(*var, min + i);
                        self.exec(body, &f)
                    }),
                    ForKind::Vectorized(_) | ForKind::Unrolled(_) => {
                        Err(internal("vectorized/unrolled loop survived concurrency lowering"))
                    }
                }
            }
            Stmt::If { cond, then_branch, else_branch } => {
                if self.eval(*cond, frame, None)?.as_bool()? {
                    self.exec(then_branch, frame)
                } else if let Some(e) = else_branch {
                    self.exec(e, frame)
                } else {
                    Ok(())
                }
            }
            Stmt::Store { stage, indices, value, atomic, predicate } => {
                self.exec_store(*stage, indices, *value, *atomic, *predicate, frame)
            }
            Stmt::Allocate { stage, ty, dims, body } => {
                let mut bdims = Vec::with_capacity(dims.len());
                for d in dims {
                    bdims.push(BufDim {
                        min: self.eval(d.min, frame, None)?.as_int()?,
                        extent: self.eval(d.extent, frame, None)?.as_int()?,
                        fold: d.fold,
                    });
                }
                let buf = Arc::new(Buffer::new(self.stage_name(*stage), *ty, bdims)?);
                let mut f = frame.clone();
                f.buffers[stage.0 as usize] = Some(buf);
                self.exec(body, &f)
            }
            Stmt::Produce { body, .. } | Stmt::Consume { body, .. } => self.exec(body, frame),
            Stmt::Fork { producer, consumer } => std::thread::scope(|scope| {
                let pframe = frame.clone();
                let handle = scope.spawn(move || self.exec(producer, &pframe));
                let consumer_result = self.exec(consumer, frame);
                let producer_result =
                    handle.join().unwrap_or_else(|_| Err(internal("async producer panicked")));
                producer_result.and(consumer_result)
            }),
            Stmt::Acquire { sem, count, body } => {
                self.sems[sem.0 as usize].acquire(*count);
                self.exec(body, frame)
            }
            Stmt::Release { sem, count } => {
                self.sems[sem.0 as usize].release(*count);
                Ok(())
            }
            Stmt::Assert { cond, message } => {
                if self.eval(*cond, frame, None)?.as_bool()? {
                    Ok(())
                } else {
                    Err(Error::AssertFailed { message: message.clone() })
                }
            }
        }
    }

    fn exec_store(
        &self,
        stage: StageId,
        indices: &SmallVec<[ExprId; 4]>,
        value: ExprId,
        atomic: AtomicKind,
        predicate: Option<ExprId>,
        frame: &Frame,
    ) -> Result<()> {
        let buffer = frame.buffers[stage.0 as usize]
            .as_ref()
            .ok_or_else(|| Error::NoLiveBuffer { stage: self.stage_name(stage).to_string() })?;

        let idx_vals: Vec<Value> =
            indices.iter().map(|i| self.eval(*i, frame, None)).collect::<Result<_>>()?;
        let pred_val = match predicate {
            Some(p) => Some(self.eval(p, frame, None)?),
            None => None,
        };

        let mut lanes = idx_vals.iter().map(|v| v.lanes()).max().unwrap_or(1);
        if let Some(p) = &pred_val {
            lanes = lanes.max(p.lanes());
        }

        // For the plain and RMW forms the value is evaluated once (it may be
        // a vector covering every lane); the CAS form re-evaluates per
        // attempt instead.
        let (plain_val, rmw_operand) = match atomic {
            AtomicKind::NonAtomic => {
                let v = self.eval(value, frame, None)?;
                lanes = lanes.max(v.lanes());
                (Some(v), None)
            }
            AtomicKind::Rmw(op) => {
                let operand_expr = self.rmw_operand(stage, value, op)?;
                let v = self.eval(operand_expr, frame, None)?;
                lanes = lanes.max(v.lanes());
                (None, Some((op, v)))
            }
            AtomicKind::CasLoop => (None, None),
        };

        let name = self.stage_name(stage);
        for lane in 0..lanes {
            if let Some(p) = &pred_val {
                if !p
                    .lane(lane.min(p.lanes() - 1))
                    .as_bool()
                    .ok_or_else(|| Error::TypeError { detail: "non-boolean store predicate".to_string() })?
                {
                    continue;
                }
            }
            let point: Vec<i64> = idx_vals
                .iter()
                .map(|v| {
                    v.lane(lane.min(v.lanes() - 1))
                        .as_int()
                        .ok_or_else(|| Error::TypeError { detail: "non-integer store index".to_string() })
                })
                .collect::<Result<_>>()?;

            match (&atomic, &plain_val, &rmw_operand) {
                (AtomicKind::NonAtomic, Some(v), _) => {
                    buffer.store(name, &point, v.lane(lane.min(v.lanes() - 1)))?;
                }
                (AtomicKind::Rmw(_), _, Some((op, operand))) => {
                    buffer.rmw(name, &point, *op, operand.lane(lane.min(operand.lanes() - 1)))?;
                }
                (AtomicKind::CasLoop, _, _) => {
                    buffer.cas_update(name, &point, |old| {
                        let view = CasView { stage, indices: &point, value: old };
                        let v = self.eval(value, frame, Some(&view))?;
                        Ok(v.lane(lane.min(v.lanes() - 1)))
                    })?;
                }
                _ => return Err(internal("store form mismatch")),
            }
            self.stats.stores[stage.0 as usize].fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// The non-self-read side of a recognized `x = x op e` update.
    fn rmw_operand(&self, stage: StageId, value: ExprId, op: fresnel_ir::BinaryOp) -> Result<ExprId> {
        match self.module.arena.get(value) {
            Expr::Binary(actual, a, b) if *actual == op => {
                let is_self = |e: ExprId| matches!(self.module.arena.get(e), Expr::Read { stage: s, .. } if *s == stage);
                if is_self(*a) {
                    Ok(*b)
                } else if is_self(*b) {
                    Ok(*a)
                } else {
                    Err(internal("rmw store without self-read operand"))
                }
            }
            _ => Err(internal("rmw store without matching operator")),
        }
    }

    fn eval(&self, e: ExprId, frame: &Frame, cas: Option<&CasView>) -> Result<Value> {
        let arena = &self.module.arena;
        match arena.get(e) {
            Expr::Const(c) => Ok(Value::Scalar(*c)),
            Expr::Var(v) => frame
                .env
                .get(v)
                .map(|x| Value::Scalar(ConstValue::Int(*x)))
                .ok_or_else(|| internal(format!("unbound variable '{}'", arena.var_name(*v)))),
            Expr::Cast(ty, a) => {
                let v = self.eval(*a, frame, cas)?;
                map_lanes(&v, |c| apply_cast(*ty, c))
            }
            Expr::Unary(op, a) => {
                let v = self.eval(*a, frame, cas)?;
                map_lanes(&v, |c| apply_unary(*op, c))
            }
            Expr::Binary(op, a, b) => {
                let va = self.eval(*a, frame, cas)?;
                let vb = self.eval(*b, frame, cas)?;
                lift_binary(*op, &va, &vb)
            }
            Expr::Select { cond, then_val, else_val } => {
                let c = self.eval(*cond, frame, cas)?;
                if c.lanes() == 1 {
                    if c.as_bool()? {
                        self.eval(*then_val, frame, cas)
                    } else {
                        self.eval(*else_val, frame, cas)
                    }
                } else {
                    let t = self.eval(*then_val, frame, cas)?;
                    let f = self.eval(*else_val, frame, cas)?;
                    let lanes = c.lanes().max(t.lanes()).max(f.lanes());
                    let mut out = SmallVec::with_capacity(lanes);
                    for i in 0..lanes {
                        let b = c.lane(i.min(c.lanes() - 1)).as_bool().ok_or_else(|| Error::TypeError {
                            detail: "non-boolean select condition".to_string(),
                        })?;
                        out.push(if b { t.lane(i.min(t.lanes() - 1)) } else { f.lane(i.min(f.lanes() - 1)) });
                    }
                    Ok(Value::Vector(out))
                }
            }
            Expr::Likely(a) => self.eval(*a, frame, cas),
            Expr::Read { stage, indices } => {
                let idx_vals: Vec<Value> =
                    indices.iter().map(|i| self.eval(*i, frame, cas)).collect::<Result<_>>()?;
                let lanes = idx_vals.iter().map(|v| v.lanes()).max().unwrap_or(1);
                let buffer = frame.buffers[stage.0 as usize]
                    .as_ref()
                    .ok_or_else(|| Error::NoLiveBuffer { stage: self.stage_name(*stage).to_string() })?;
                let name = self.stage_name(*stage);
                let mut out = SmallVec::with_capacity(lanes);
                for lane in 0..lanes {
                    let point: Vec<i64> = idx_vals
                        .iter()
                        .map(|v| {
                            v.lane(lane.min(v.lanes() - 1)).as_int().ok_or_else(|| Error::TypeError {
                                detail: "non-integer read index".to_string(),
                            })
                        })
                        .collect::<Result<_>>()?;
                    if let Some(view) = cas {
                        if view.stage == *stage && view.indices == point.as_slice() {
                            out.push(view.value);
                            continue;
                        }
                    }
                    out.push(buffer.load(name, &point)?);
                }
                if lanes == 1 {
                    Ok(Value::Scalar(out[0]))
                } else {
                    Ok(Value::Vector(out))
                }
            }
            Expr::Ramp { base, stride, lanes } => {
                let b = self.eval(*base, frame, cas)?.as_int()?;
                let s = self.eval(*stride, frame, cas)?.as_int()?;
                Ok(Value::Vector((0..*lanes as i64).map(|i| ConstValue::Int(b + s * i)).collect()))
            }
            Expr::Broadcast { value, lanes } => {
                let v = self.eval(*value, frame, cas)?.as_scalar()?;
                Ok(Value::Vector((0..*lanes).map(|_| v).collect()))
            }
        }
    }
}

fn map_lanes(v: &Value, mut f: impl FnMut(ConstValue) -> Result<ConstValue>) -> Result<Value> {
    match v {
        Value::Scalar(c) => Ok(Value::Scalar(f(*c)?)),
        Value::Vector(cs) => {
            Ok(Value::Vector(cs.iter().map(|c| f(*c)).collect::<Result<SmallVec<[ConstValue; 8]>>>()?))
        }
    }
}
