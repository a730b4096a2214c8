//! Async producer/consumer lowering.
//!
//! A stage tagged async stops sharing its consumer's thread: its production
//! becomes one side of a `Fork`, handing values over through its folded
//! circular buffer guarded by a pair of counting semaphores - `free` slots
//! the producer may fill (initially one: classic double buffering on top of
//! the fold's window+advance slack) and `filled` slots the consumer may
//! read. The producer leads, the consumer follows; neither free-runs, and a
//! consumer reaching an unfilled slot blocks instead of spinning.
//!
//! ```text
//! allocate S (folded):
//!   fork producer:           | fork consumer:
//!     for v:                 |   for v:
//!       acquire free(1):     |     acquire filled(1):
//!         produce S          |       consume S: ...reads of S...
//!       release filled(1)    |     release free(1)
//! ```

use fresnel_ir::{SemId, StageId, Stmt};

use crate::ctx::LowerCtx;
use crate::error::{Error, Result};

#[tracing::instrument(skip_all)]
pub fn lower_async(ctx: &mut LowerCtx, stmt: Stmt) -> Result<Stmt> {
    let async_stages: Vec<StageId> = ctx
        .pipeline
        .stage_ids()
        .filter(|s| ctx.pipeline.stage(*s).func_schedule.is_async)
        .collect();
    let mut stmt = stmt;
    for s in async_stages {
        if !ctx.slid.contains_key(&s) {
            return Err(Error::AsyncRequiresFold { stage: ctx.stage_name(s).to_string() });
        }
        stmt = rewrite(ctx, stmt, s)?;
    }
    Ok(stmt)
}

fn rewrite(ctx: &mut LowerCtx, stmt: Stmt, s: StageId) -> Result<Stmt> {
    Ok(match stmt {
        Stmt::Allocate { stage, ty, dims, body } if stage == s => {
            check_producer_self_contained(ctx, &body, s)?;
            let free = ctx.new_semaphore(1);
            let filled = ctx.new_semaphore(0);
            let producer = extract_producer(ctx, &body, s, free, filled).ok_or_else(|| {
                Error::AsyncUnsupported {
                    stage: ctx.stage_name(s).to_string(),
                    detail: "no production found under the storage scope".to_string(),
                }
            })?;
            let consumer = wrap_consumer(&body, s, free, filled);
            tracing::debug!(stage = ctx.stage_name(s), "async handoff installed");
            Stmt::Allocate {
                stage,
                ty,
                dims,
                body: Box::new(Stmt::Fork { producer: Box::new(producer), consumer: Box::new(consumer) }),
            }
        }
        Stmt::Allocate { stage, ty, dims, body } => {
            Stmt::Allocate { stage, ty, dims, body: Box::new(rewrite(ctx, *body, s)?) }
        }
        Stmt::Block(stmts) => {
            let mut out = Vec::with_capacity(stmts.len());
            for st in stmts {
                out.push(rewrite(ctx, st, s)?);
            }
            Stmt::Block(out)
        }
        Stmt::For { var, min, extent, kind, body } => {
            Stmt::For { var, min, extent, kind, body: Box::new(rewrite(ctx, *body, s)?) }
        }
        Stmt::If { cond, then_branch, else_branch } => Stmt::If {
            cond,
            then_branch: Box::new(rewrite(ctx, *then_branch, s)?),
            else_branch: match else_branch {
                Some(e) => Some(Box::new(rewrite(ctx, *e, s)?)),
                None => None,
            },
        },
        Stmt::Produce { stage, body } => Stmt::Produce { stage, body: Box::new(rewrite(ctx, *body, s)?) },
        Stmt::Consume { stage, body } => Stmt::Consume { stage, body: Box::new(rewrite(ctx, *body, s)?) },
        Stmt::Acquire { sem, count, body } => {
            Stmt::Acquire { sem, count, body: Box::new(rewrite(ctx, *body, s)?) }
        }
        Stmt::Fork { producer, consumer } => Stmt::Fork {
            producer: Box::new(rewrite(ctx, *producer, s)?),
            consumer: Box::new(rewrite(ctx, *consumer, s)?),
        },
        other => other,
    })
}

/// The forked producer must not depend on values produced inside the same
/// storage scope by the consumer side; that would invert the handoff order.
fn check_producer_self_contained(ctx: &LowerCtx, body: &Stmt, s: StageId) -> Result<()> {
    let Some(produce) = find_produce(body, s) else { return Ok(()) };
    let mut reads = Vec::new();
    collect_stmt_reads(&ctx.arena, produce, &mut reads);
    for t in reads {
        if t != s && find_produce(body, t).is_some() {
            return Err(Error::AsyncUnsupported {
                stage: ctx.stage_name(s).to_string(),
                detail: format!("its producer reads '{}', which is produced inside the same scope", ctx.stage_name(t)),
            });
        }
    }
    Ok(())
}

fn find_produce<'a>(stmt: &'a Stmt, s: StageId) -> Option<&'a Stmt> {
    match stmt {
        Stmt::Produce { stage, .. } if *stage == s => Some(stmt),
        Stmt::Block(stmts) => stmts.iter().find_map(|st| find_produce(st, s)),
        Stmt::For { body, .. }
        | Stmt::Allocate { body, .. }
        | Stmt::Produce { body, .. }
        | Stmt::Consume { body, .. }
        | Stmt::Acquire { body, .. } => find_produce(body, s),
        Stmt::If { then_branch, else_branch, .. } => {
            find_produce(then_branch, s).or_else(|| else_branch.as_ref().and_then(|e| find_produce(e, s)))
        }
        Stmt::Fork { producer, consumer } => find_produce(producer, s).or_else(|| find_produce(consumer, s)),
        _ => None,
    }
}

fn collect_stmt_reads(arena: &fresnel_ir::ExprArena, stmt: &Stmt, out: &mut Vec<StageId>) {
    let mut exprs = Vec::new();
    collect_exprs(stmt, &mut exprs);
    for e in exprs {
        let mut reads = Vec::new();
        arena.collect_reads(e, &mut reads);
        out.extend(reads.into_iter().map(|(s, _)| s));
    }
    out.sort();
    out.dedup();
}

fn collect_exprs(stmt: &Stmt, out: &mut Vec<fresnel_ir::ExprId>) {
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

/// Clone the control structure on the path to the stage's Produce, keeping
/// only what the producer task needs; everything else is dropped.
fn extract_producer(ctx: &LowerCtx, stmt: &Stmt, s: StageId, free: SemId, filled: SemId) -> Option<Stmt> {
    let _ = ctx;
    match stmt {
        Stmt::Produce { stage, body } if *stage == s => Some(Stmt::block(vec![
            Stmt::Acquire {
                sem: free,
                count: 1,
                body: Box::new(Stmt::Produce { stage: s, body: body.clone() }),
            },
            Stmt::Release { sem: filled, count: 1 },
        ])),
        Stmt::Block(stmts) => {
            let kept: Vec<Stmt> =
                stmts.iter().filter_map(|st| extract_producer(ctx, st, s, free, filled)).collect();
            if kept.is_empty() {
                None
            } else {
                Some(Stmt::block(kept))
            }
        }
        Stmt::For { var, min, extent, kind, body } => {
            extract_producer(ctx, body, s, free, filled).map(|b| Stmt::For {
                var: *var,
                min: *min,
                extent: *extent,
                kind: *kind,
                body: Box::new(b),
            })
        }
        Stmt::If { cond, then_branch, else_branch } => {
            let t = extract_producer(ctx, then_branch, s, free, filled);
            let e = else_branch.as_ref().and_then(|e| extract_producer(ctx, e, s, free, filled));
            match (t, e) {
                (None, None) => None,
                (t, e) => Some(Stmt::If {
                    cond: *cond,
                    then_branch: Box::new(t.unwrap_or(Stmt::NoOp)),
                    else_branch: e.map(Box::new),
                }),
            }
        }
        Stmt::Allocate { stage, ty, dims, body } => {
            extract_producer(ctx, body, s, free, filled).map(|b| Stmt::Allocate {
                stage: *stage,
                ty: *ty,
                dims: dims.clone(),
                body: Box::new(b),
            })
        }
        Stmt::Produce { stage, body } => extract_producer(ctx, body, s, free, filled)
            .map(|b| Stmt::Produce { stage: *stage, body: Box::new(b) }),
        Stmt::Consume { stage, body } => extract_producer(ctx, body, s, free, filled)
            .map(|b| Stmt::Consume { stage: *stage, body: Box::new(b) }),
        Stmt::Acquire { sem, count, body } => extract_producer(ctx, body, s, free, filled)
            .map(|b| Stmt::Acquire { sem: *sem, count: *count, body: Box::new(b) }),
        Stmt::Fork { .. } | Stmt::NoOp | Stmt::Store { .. } | Stmt::Release { .. } | Stmt::Assert { .. } => None,
    }
}

/// The consumer keeps everything except the production, and synchronizes
/// its consume region on the handoff semaphores.
fn wrap_consumer(stmt: &Stmt, s: StageId, free: SemId, filled: SemId) -> Stmt {
    match stmt {
        Stmt::Produce { stage, .. } if *stage == s => Stmt::NoOp,
        Stmt::Consume { stage, body } if *stage == s => Stmt::block(vec![
            Stmt::Acquire {
                sem: filled,
                count: 1,
                body: Box::new(Stmt::Consume { stage: s, body: Box::new(wrap_consumer(body, s, free, filled)) }),
            },
            Stmt::Release { sem: free, count: 1 },
        ]),
        Stmt::Block(stmts) => Stmt::block(stmts.iter().map(|st| wrap_consumer(st, s, free, filled)).collect()),
        Stmt::For { var, min, extent, kind, body } => Stmt::For {
            var: *var,
            min: *min,
            extent: *extent,
            kind: *kind,
            body: Box::new(wrap_consumer(body, s, free, filled)),
        },
        Stmt::If { cond, then_branch, else_branch } => Stmt::If {
            cond: *cond,
            then_branch: Box::new(wrap_consumer(then_branch, s, free, filled)),
            else_branch: else_branch.as_ref().map(|e| Box::new(wrap_consumer(e, s, free, filled))),
        },
        Stmt::Allocate { stage, ty, dims, body } => Stmt::Allocate {
            stage: *stage,
            ty: *ty,
            dims: dims.clone(),
            body: Box::new(wrap_consumer(body, s, free, filled)),
        },
        Stmt::Produce { stage, body } => {
            Stmt::Produce { stage: *stage, body: Box::new(wrap_consumer(body, s, free, filled)) }
        }
        Stmt::Consume { stage, body } => {
            Stmt::Consume { stage: *stage, body: Box::new(wrap_consumer(body, s, free, filled)) }
        }
        Stmt::Acquire { sem, count, body } => {
            Stmt::Acquire { sem: *sem, count: *count, body: Box::new(wrap_consumer(body, s, free, filled)) }
        }
        Stmt::Fork { producer, consumer } => Stmt::Fork {
            producer: Box::new(wrap_consumer(producer, s, free, filled)),
            consumer: Box::new(wrap_consumer(consumer, s, free, filled)),
        },
        other => other.clone(),
    }
}
