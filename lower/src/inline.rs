//! Inline-anchor substitution.
//!
//! A stage anchored inline has no loop and no storage: its formula is
//! substituted textually at each call site. Runs before bounds inference so
//! the later passes only ever see realized stages. Processing in topological
//! order (producers first) makes inline-of-inline chains collapse in one
//! sweep.

use std::collections::HashMap;

use fresnel_graph::Anchor;
use fresnel_ir::{Expr, ExprArena, ExprId, StageId, VarId};

use crate::ctx::LowerCtx;
use crate::error::Result;

pub fn substitute_inline_stages(ctx: &mut LowerCtx) -> Result<()> {
    let order = ctx.resolved.order.clone();
    for s in order {
        if ctx.resolved.stage(s).compute != Anchor::Inline {
            continue;
        }
        let dims: Vec<VarId> = ctx.pipeline.stage(s).dims.to_vec();
        let value = ctx.eff[s.0 as usize].pure_value;
        tracing::trace!(stage = ctx.stage_name(s), "inlining");

        for t in ctx.pipeline.stage_ids() {
            if t == s {
                continue;
            }
            let eff = &mut ctx.eff[t.0 as usize];
            eff.pure_value = inline_reads(&mut ctx.arena, eff.pure_value, s, &dims, value);
            for u in &mut eff.updates {
                for a in u.args.iter_mut() {
                    *a = inline_reads(&mut ctx.arena, *a, s, &dims, value);
                }
                u.value = inline_reads(&mut ctx.arena, u.value, s, &dims, value);
                if let Some(rd) = &mut u.rdom {
                    if let Some(p) = rd.predicate {
                        rd.predicate = Some(inline_reads(&mut ctx.arena, p, s, &dims, value));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Replace every `Read` of `stage` under `root` with its formula, with the
/// stage's loop variables bound to the call-site index expressions.
fn inline_reads(arena: &mut ExprArena, root: ExprId, stage: StageId, dims: &[VarId], value: ExprId) -> ExprId {
    arena.rewrite(root, &mut |arena, id| match arena.get(id) {
        Expr::Read { stage: s, indices } if *s == stage => {
            let subs: HashMap<VarId, ExprId> = dims.iter().copied().zip(indices.iter().copied()).collect();
            Some(arena.substitute(value, &subs))
        }
        _ => None,
    })
}
