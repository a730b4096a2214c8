//! Human-readable printing of expressions and statements.
//!
//! Used by tracing output and test diagnostics. The format is stable enough
//! to read in logs but is not a serialization format.

use std::fmt;

use crate::expr::{BinaryOp, Expr, ExprArena, ExprId, StageId, UnaryOp};
use crate::stmt::{AtomicKind, ForKind, Stmt};

/// Names stages for display; falls back to `s<N>` without one.
pub type StageNamer<'a> = &'a dyn Fn(StageId) -> String;

fn default_stage_name(s: StageId) -> String {
    format!("s{}", s.0)
}

pub struct ExprDisplay<'a> {
    arena: &'a ExprArena,
    expr: ExprId,
    namer: Option<StageNamer<'a>>,
}

impl<'a> ExprDisplay<'a> {
    pub fn new(arena: &'a ExprArena, expr: ExprId) -> Self {
        ExprDisplay { arena, expr, namer: None }
    }

    pub fn with_names(mut self, namer: StageNamer<'a>) -> Self {
        self.namer = Some(namer);
        self
    }

    fn name(&self, s: StageId) -> String {
        match self.namer {
            Some(f) => f(s),
            None => default_stage_name(s),
        }
    }

    fn fmt_expr(&self, f: &mut fmt::Formatter<'_>, e: ExprId) -> fmt::Result {
        match self.arena.get(e) {
            Expr::Const(c) => write!(f, "{c}"),
            Expr::Var(v) => write!(f, "{}", self.arena.var_name(*v)),
            Expr::Cast(ty, a) => {
                write!(f, "{ty}(")?;
                self.fmt_expr(f, *a)?;
                write!(f, ")")
            }
            Expr::Unary(op, a) => {
                let name = match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::Not => "!",
                    other => return self.fmt_call(f, &other.to_string(), &[*a]),
                };
                write!(f, "{name}(")?;
                self.fmt_expr(f, *a)?;
                write!(f, ")")
            }
            Expr::Binary(op, a, b) => match op {
                BinaryOp::Min | BinaryOp::Max => self.fmt_call(f, &op.to_string(), &[*a, *b]),
                _ => {
                    let sym = match op {
                        BinaryOp::Add => "+",
                        BinaryOp::Sub => "-",
                        BinaryOp::Mul => "*",
                        BinaryOp::Div => "/",
                        BinaryOp::Mod => "%",
                        BinaryOp::Eq => "==",
                        BinaryOp::Ne => "!=",
                        BinaryOp::Lt => "<",
                        BinaryOp::Le => "<=",
                        BinaryOp::And => "&&",
                        BinaryOp::Or => "||",
                        BinaryOp::Min | BinaryOp::Max => unreachable!(),
                    };
                    write!(f, "(")?;
                    self.fmt_expr(f, *a)?;
                    write!(f, " {sym} ")?;
                    self.fmt_expr(f, *b)?;
                    write!(f, ")")
                }
            },
            Expr::Select { cond, then_val, else_val } => self.fmt_call(f, "select", &[*cond, *then_val, *else_val]),
            Expr::Likely(a) => self.fmt_call(f, "likely", &[*a]),
            Expr::Read { stage, indices } => {
                write!(f, "{}[", self.name(*stage))?;
                for (i, idx) in indices.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    self.fmt_expr(f, *idx)?;
                }
                write!(f, "]")
            }
            Expr::Ramp { base, stride, lanes } => {
                write!(f, "ramp(")?;
                self.fmt_expr(f, *base)?;
                write!(f, ", ")?;
                self.fmt_expr(f, *stride)?;
                write!(f, ", {lanes})")
            }
            Expr::Broadcast { value, lanes } => {
                write!(f, "x{lanes}(")?;
                self.fmt_expr(f, *value)?;
                write!(f, ")")
            }
        }
    }

    fn fmt_call(&self, f: &mut fmt::Formatter<'_>, name: &str, args: &[ExprId]) -> fmt::Result {
        write!(f, "{name}(")?;
        for (i, a) in args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            self.fmt_expr(f, *a)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for ExprDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_expr(f, self.expr)
    }
}

pub struct StmtDisplay<'a> {
    arena: &'a ExprArena,
    stmt: &'a Stmt,
    namer: Option<StageNamer<'a>>,
}

impl<'a> StmtDisplay<'a> {
    pub fn new(arena: &'a ExprArena, stmt: &'a Stmt) -> Self {
        StmtDisplay { arena, stmt, namer: None }
    }

    pub fn with_names(mut self, namer: StageNamer<'a>) -> Self {
        self.namer = Some(namer);
        self
    }

    fn name(&self, s: StageId) -> String {
        match self.namer {
            Some(f) => f(s),
            None => default_stage_name(s),
        }
    }

    fn expr(&self, e: ExprId) -> ExprDisplay<'a> {
        let d = ExprDisplay::new(self.arena, e);
        match self.namer {
            Some(n) => d.with_names(n),
            None => d,
        }
    }

    fn fmt_stmt(&self, f: &mut fmt::Formatter<'_>, s: &Stmt, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        match s {
            Stmt::NoOp => writeln!(f, "{pad}noop"),
            Stmt::Block(stmts) => {
                for s in stmts {
                    self.fmt_stmt(f, s, indent)?;
                }
                Ok(())
            }
            Stmt::For { var, min, extent, kind, body } => {
                let tag = match kind {
                    ForKind::Serial => String::new(),
                    ForKind::Parallel => " parallel".to_string(),
                    ForKind::Vectorized(n) => format!(" vectorized<{n}>"),
                    ForKind::Unrolled(n) => format!(" unrolled<{n}>"),
                };
                writeln!(
                    f,
                    "{pad}for{tag} {} in [{}, {} + {}):",
                    self.arena.var_name(*var),
                    self.expr(*min),
                    self.expr(*min),
                    self.expr(*extent),
                )?;
                self.fmt_stmt(f, body, indent + 1)
            }
            Stmt::If { cond, then_branch, else_branch } => {
                writeln!(f, "{pad}if {}:", self.expr(*cond))?;
                self.fmt_stmt(f, then_branch, indent + 1)?;
                if let Some(e) = else_branch {
                    writeln!(f, "{pad}else:")?;
                    self.fmt_stmt(f, e, indent + 1)?;
                }
                Ok(())
            }
            Stmt::Store { stage, indices, value, atomic, predicate } => {
                write!(f, "{pad}{}[", self.name(*stage))?;
                for (i, idx) in indices.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", self.expr(*idx))?;
                }
                write!(f, "] = {}", self.expr(*value))?;
                match atomic {
                    AtomicKind::NonAtomic => {}
                    AtomicKind::Rmw(op) => write!(f, "  (atomic {op})")?,
                    AtomicKind::CasLoop => write!(f, "  (atomic cas)")?,
                }
                if let Some(p) = predicate {
                    write!(f, " if {}", self.expr(*p))?;
                }
                writeln!(f)
            }
            Stmt::Allocate { stage, ty, dims, body } => {
                write!(f, "{pad}allocate {}: {ty}[", self.name(*stage))?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", self.expr(d.extent))?;
                    if let Some(fold) = d.fold {
                        write!(f, " fold {fold}")?;
                    }
                }
                writeln!(f, "]:")?;
                self.fmt_stmt(f, body, indent + 1)
            }
            Stmt::Produce { stage, body } => {
                writeln!(f, "{pad}produce {}:", self.name(*stage))?;
                self.fmt_stmt(f, body, indent + 1)
            }
            Stmt::Consume { stage, body } => {
                writeln!(f, "{pad}consume {}:", self.name(*stage))?;
                self.fmt_stmt(f, body, indent + 1)
            }
            Stmt::Fork { producer, consumer } => {
                writeln!(f, "{pad}fork producer:")?;
                self.fmt_stmt(f, producer, indent + 1)?;
                writeln!(f, "{pad}fork consumer:")?;
                self.fmt_stmt(f, consumer, indent + 1)
            }
            Stmt::Acquire { sem, count, body } => {
                writeln!(f, "{pad}acquire sem{}({count}):", sem.0)?;
                self.fmt_stmt(f, body, indent + 1)
            }
            Stmt::Release { sem, count } => writeln!(f, "{pad}release sem{}({count})", sem.0),
            Stmt::Assert { cond, message } => {
                writeln!(f, "{pad}assert {} \"{message}\"", self.expr(*cond))
            }
        }
    }
}

impl fmt::Display for StmtDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_stmt(f, self.stmt, 0)
    }
}
