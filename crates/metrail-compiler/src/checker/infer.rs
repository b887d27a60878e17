//! Pass 4: type inference.
//!
//! Expressions are typed bottom-up; binary operators unify their
//! operands and take the least upper bound as the result. Capture
//! reference types come from the compiled regex of the governing
//! pattern. Structural rules (lvalue targets, del targets, counter
//! assignment, strptime's literal format) are enforced here too.

use metrail_dsl::ast::{BinaryOp, Block, Expr, ExprKind, Stmt, UnaryOp, VarKind};

use crate::symtab::Binding;
use crate::types::{infer_capref_type, Type};

use super::Checker;

impl Checker {
    pub(crate) fn infer_stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.infer_stmt(stmt);
        }
    }

    fn infer_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Cond(c) => {
                let t = self.infer_expr(&c.cond);
                match self.ctx.root(&t) {
                    Type::Pattern | Type::Bool => {}
                    Type::Int => {
                        // Integer conditions test against zero.
                        self.truthy.insert(c.cond.id);
                    }
                    Type::Var(_) => {
                        self.ctx.unify(&t, &Type::Bool);
                    }
                    Type::Error(_) => {}
                    other => {
                        self.diag(
                            c.cond.pos,
                            format!(
                                "conditional expression must be a pattern, boolean or integer, not {}",
                                other
                            ),
                        );
                    }
                }
                self.infer_block(&c.then);
                if let Some(else_) = &c.else_ {
                    self.infer_block(else_);
                }
            }
            Stmt::Otherwise(o) => self.infer_block(&o.block),
            Stmt::Del(d) => {
                self.infer_expr(&d.target);
                let indexed = matches!(d.target.kind, ExprKind::Indexed { .. });
                if !indexed || self.lvalue_metric(&d.target).is_none() {
                    self.diag(d.pos, "del target must be an indexed metric");
                }
            }
            Stmt::Expr(e) => {
                self.infer_expr(e);
            }
            Stmt::DecoApply(d) => {
                if let Some(resolved) = &d.resolved {
                    self.infer_block(resolved);
                }
            }
            Stmt::PatternFragment(_)
            | Stmt::DecoDecl(_)
            | Stmt::VarDecl(_)
            | Stmt::Next(_)
            | Stmt::Stop(_) => {}
        }
    }

    fn infer_block(&mut self, block: &Block) {
        for stmt in &block.stmts {
            self.infer_stmt(stmt);
        }
    }

    /// The metric a target expression assigns into, if it is an lvalue.
    pub(crate) fn lvalue_metric(&self, expr: &Expr) -> Option<usize> {
        let id_expr = match &expr.kind {
            ExprKind::Indexed { base, .. } => base.as_ref(),
            _ => expr,
        };
        if !matches!(id_expr.kind, ExprKind::Id(_)) {
            return None;
        }
        let sid = self.resolved.get(&id_expr.id)?;
        match &self.symtab.symbol(*sid).binding {
            Binding::Metric(idx) => Some(*idx),
            _ => None,
        }
    }

    pub(crate) fn infer_expr(&mut self, expr: &Expr) -> Type {
        let t = match &expr.kind {
            ExprKind::Int(_) => Type::Int,
            ExprKind::Float(_) => Type::Float,
            ExprKind::Str(_) => Type::String,
            ExprKind::PatternLit(_) => Type::Pattern,
            ExprKind::Pattern(parts) => {
                for p in parts {
                    self.infer_expr(p);
                }
                Type::Pattern
            }
            ExprKind::Id(_) => match self.resolved.get(&expr.id) {
                Some(&sid) => self.symtab.symbol(sid).ty.clone(),
                None => self.ctx.fresh(),
            },
            ExprKind::Capref { .. } => self.infer_capref(expr),
            // A compiled `+` concatenation spine is a pattern, not
            // arithmetic.
            ExprKind::Binary { .. } if self.pattern_of.contains_key(&expr.id) => Type::Pattern,
            ExprKind::Binary { op, lhs, rhs } => self.infer_binary(expr, *op, lhs, rhs),
            ExprKind::Unary { op, expr: operand } => {
                let ot = self.infer_expr(operand);
                match op {
                    UnaryOp::Not => match self.ctx.root(&ot) {
                        Type::Bool | Type::Int | Type::Pattern => Type::Bool,
                        Type::Var(_) => {
                            self.ctx.unify(&ot, &Type::Bool);
                            Type::Bool
                        }
                        Type::Error(_) => ot,
                        other => {
                            self.diag(
                                operand.pos,
                                format!("cannot negate a value of type {}", other),
                            );
                            Type::Bool
                        }
                    },
                    UnaryOp::Neg => match self.ctx.root(&ot) {
                        Type::Int | Type::Float | Type::Var(_) => ot,
                        Type::Error(_) => ot,
                        other => {
                            self.diag(
                                operand.pos,
                                format!("cannot negate a value of type {}", other),
                            );
                            Type::Int
                        }
                    },
                }
            }
            ExprKind::Postfix { expr: target, .. } => {
                let tt = self.infer_expr(target);
                if self.lvalue_metric(target).is_none() {
                    self.diag(expr.pos, "increment target must be a metric lvalue");
                }
                self.unify_or_diag(&tt, &Type::Int, expr.pos);
                Type::Int
            }
            ExprKind::Indexed { base, index } => {
                let bt = self.infer_expr(base);
                let mut args: Vec<Type> = index.iter().map(|i| self.infer_expr(i)).collect();
                let rv = self.ctx.fresh();
                args.push(rv.clone());
                let want = Type::Dimension(args);
                let unified = self.unify_or_diag(&bt, &want, expr.pos);
                if unified.is_error() {
                    unified
                } else {
                    self.ctx.root(&rv)
                }
            }
            ExprKind::Builtin { name, args } => self.infer_builtin(expr, name, args),
        };
        self.types.insert(expr.id, t.clone());
        t
    }

    fn infer_capref(&mut self, expr: &Expr) -> Type {
        let Some(&sid) = self.caprefs.get(&expr.id) else {
            return self.ctx.fresh();
        };
        let Binding::Capture { pattern, group } = self.symtab.symbol(sid).binding.clone() else {
            return self.ctx.fresh();
        };
        let t = if group == 0 {
            // $0 is the whole match.
            Type::String
        } else {
            let hir = self.patterns[pattern].hir.clone();
            infer_capref_type(&mut self.ctx, &hir, group as u32)
        };
        self.symtab.symbol_mut(sid).ty = t.clone();
        t
    }

    fn infer_binary(&mut self, expr: &Expr, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Type {
        use BinaryOp::*;
        match op {
            Assign | AddAssign => {
                if matches!(
                    rhs.kind,
                    ExprKind::Binary {
                        op: Assign | AddAssign,
                        ..
                    }
                ) {
                    self.diag(rhs.pos, "chained assignment is not supported");
                }
                let lt = self.infer_expr(lhs);
                let rt = self.infer_expr(rhs);
                let Some(metric) = self.lvalue_metric(lhs) else {
                    self.diag(lhs.pos, "assignment target must be a metric lvalue");
                    return Type::Error(Box::new(crate::types::TypeError {
                        kind: crate::types::TypeErrorKind::Mismatch,
                        expected: lt,
                        received: rt,
                    }));
                };
                let t = self.unify_or_diag(&lt, &rt, expr.pos);
                let kind = self.metrics[metric].kind;
                if matches!(kind, VarKind::Counter | VarKind::Timer) {
                    let root = self.ctx.root(&t);
                    if !matches!(root, Type::Int | Type::Var(_) | Type::Error(_)) {
                        self.diag(
                            rhs.pos,
                            format!(
                                "{} `{}' cannot be assigned a value of type {}",
                                kind, self.metrics[metric].name, root
                            ),
                        );
                    }
                }
                if op == AddAssign {
                    let root = self.ctx.root(&t);
                    if !matches!(
                        root,
                        Type::Int | Type::Float | Type::Var(_) | Type::Error(_)
                    ) {
                        self.diag(expr.pos, format!("cannot add to a value of type {}", root));
                    }
                }
                t
            }
            Add | Sub | Mul | Div | Mod | Pow => {
                let lt = self.infer_expr(lhs);
                let rt = self.infer_expr(rhs);
                // Patterns never participate in arithmetic; concatenation
                // is resolved before compilation.
                for (side, t) in [(lhs, &lt), (rhs, &rt)] {
                    if matches!(self.ctx.root(t), Type::Pattern) {
                        self.diag(
                            side.pos,
                            "a pattern is not a valid operand for arithmetic",
                        );
                        return Type::Error(Box::new(crate::types::TypeError {
                            kind: crate::types::TypeErrorKind::Mismatch,
                            expected: Type::Int,
                            received: Type::Pattern,
                        }));
                    }
                }
                let t = self.unify_or_diag(&lt, &rt, expr.pos);
                match self.ctx.root(&t) {
                    Type::String if op == Add => Type::String,
                    Type::Int | Type::Float | Type::Var(_) => t,
                    Type::Bool => Type::Int,
                    Type::Error(_) => t,
                    other => {
                        self.diag(
                            expr.pos,
                            format!("arithmetic on a value of type {}", other),
                        );
                        t
                    }
                }
            }
            BitAnd | BitOr | BitXor | Shl | Shr => {
                let lt = self.infer_expr(lhs);
                let rt = self.infer_expr(rhs);
                self.unify_or_diag(&lt, &Type::Int, lhs.pos);
                self.unify_or_diag(&rt, &Type::Int, rhs.pos);
                Type::Int
            }
            And | Or => {
                let lt = self.infer_expr(lhs);
                let rt = self.infer_expr(rhs);
                let t = self.unify_or_diag(&lt, &rt, expr.pos);
                match self.ctx.root(&t) {
                    Type::Pattern | Type::Bool | Type::Int | Type::Var(_) | Type::Error(_) => t,
                    other => {
                        self.diag(
                            expr.pos,
                            format!("boolean operator on a value of type {}", other),
                        );
                        t
                    }
                }
            }
            Match | NotMatch => {
                let lt = self.infer_expr(lhs);
                let rt = self.infer_expr(rhs);
                self.unify_or_diag(&lt, &Type::String, lhs.pos);
                self.unify_or_diag(&rt, &Type::Pattern, rhs.pos);
                Type::Bool
            }
            Eq | Ne | Lt | Le | Gt | Ge => {
                let lt = self.infer_expr(lhs);
                let rt = self.infer_expr(rhs);
                let t = self.unify_or_diag(&lt, &rt, expr.pos);
                match self.ctx.root(&t) {
                    Type::Int
                    | Type::Float
                    | Type::String
                    | Type::Bool
                    | Type::Var(_)
                    | Type::Error(_) => {}
                    other => {
                        self.diag(
                            expr.pos,
                            format!("comparison of values of type {}", other),
                        );
                    }
                }
                Type::Bool
            }
        }
    }

    fn infer_builtin(&mut self, expr: &Expr, name: &str, args: &[Expr]) -> Type {
        let Some(sig) = self.ctx.builtin_type(name) else {
            self.diag(expr.pos, format!("unknown function `{}'", name));
            return self.ctx.fresh();
        };

        let arity = match &sig {
            Type::Function(parts) => parts.len() - 1,
            _ => 0,
        };
        if args.len() != arity {
            self.diag(
                expr.pos,
                format!(
                    "wrong number of arguments to {}(): expected {}, got {}",
                    name,
                    arity,
                    args.len()
                ),
            );
            return self.ctx.fresh();
        }

        if name == "strptime" && !matches!(args[1].kind, ExprKind::Str(_)) {
            self.diag(
                args[1].pos,
                "second argument to strptime() must be a literal format string",
            );
        }

        let mut call: Vec<Type> = args.iter().map(|a| self.infer_expr(a)).collect();
        let rv = self.ctx.fresh();
        call.push(rv.clone());
        let t = self.unify_or_diag(&sig, &Type::Function(call), expr.pos);
        if t.is_error() {
            t
        } else {
            self.ctx.root(&rv)
        }
    }
}
