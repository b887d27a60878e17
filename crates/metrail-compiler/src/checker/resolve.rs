//! Pass 2: reference resolution and decorator expansion.
//!
//! Identifier references resolve up the scope chain. A decorator
//! application is expanded here: the declaration body is cloned with
//! fresh node ids, its `next` statement is replaced by the wrapped
//! block's statements, and the expansion is then declared and resolved
//! under the application site's scope. Capture references are bound in
//! the pattern pass, once regexes exist.

use metrail_dsl::ast::{Block, DecoApply, Expr, ExprKind, Stmt};

use crate::symtab::{Binding, ScopeId, SymbolKind};

use super::Checker;

impl Checker {
    pub(crate) fn resolve_stmts(&mut self, stmts: &mut [Stmt], scope: ScopeId) {
        for stmt in stmts {
            self.resolve_stmt(stmt, scope);
        }
    }

    fn resolve_stmt(&mut self, stmt: &mut Stmt, scope: ScopeId) {
        match stmt {
            Stmt::Cond(c) => {
                self.resolve_expr(&c.cond, scope);
                self.resolve_block(&mut c.then);
                if let Some(else_) = &mut c.else_ {
                    self.resolve_block(else_);
                }
            }
            Stmt::Otherwise(o) => self.resolve_block(&mut o.block),
            Stmt::Del(d) => self.resolve_expr(&d.target, scope),
            Stmt::Expr(e) => self.resolve_expr(e, scope),
            Stmt::PatternFragment(f) => self.resolve_expr(&f.expr, scope),
            Stmt::DecoApply(d) => self.expand_decorator(d, scope),
            Stmt::Next(pos) => {
                // Any `next` still present after expansion is misplaced.
                let pos = *pos;
                self.diag(pos, "`next' is only valid inside a decorator definition");
            }
            Stmt::DecoDecl(_) | Stmt::VarDecl(_) | Stmt::Stop(_) => {}
        }
    }

    fn resolve_block(&mut self, block: &mut Block) {
        let Some(&scope) = self.scopes.get(&block.id) else {
            // Scope creation failed earlier; nothing more to report here.
            return;
        };
        self.resolve_stmts(&mut block.stmts, scope);
    }

    pub(crate) fn resolve_expr(&mut self, expr: &Expr, scope: ScopeId) {
        match &expr.kind {
            ExprKind::Id(name) => match self.symtab.lookup(scope, name) {
                Some(sid) => {
                    self.resolved.insert(expr.id, sid);
                }
                None => {
                    self.diag(expr.pos, format!("identifier `{}' not defined", name));
                }
            },
            ExprKind::Binary { lhs, rhs, .. } => {
                self.resolve_expr(lhs, scope);
                self.resolve_expr(rhs, scope);
            }
            ExprKind::Unary { expr: e, .. } | ExprKind::Postfix { expr: e, .. } => {
                self.resolve_expr(e, scope)
            }
            ExprKind::Indexed { base, index } => {
                self.resolve_expr(base, scope);
                for i in index {
                    self.resolve_expr(i, scope);
                }
            }
            ExprKind::Builtin { args, .. } => {
                for a in args {
                    self.resolve_expr(a, scope);
                }
            }
            ExprKind::Pattern(parts) => {
                for p in parts {
                    self.resolve_expr(p, scope);
                }
            }
            ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Str(_)
            | ExprKind::PatternLit(_)
            | ExprKind::Capref { .. } => {}
        }
    }

    fn expand_decorator(&mut self, apply: &mut DecoApply, scope: ScopeId) {
        let Some(sid) = self.symtab.lookup(scope, &apply.name) else {
            self.diag(apply.pos, format!("decorator `@{}' not defined", apply.name));
            return;
        };
        let symbol = self.symtab.symbol(sid);
        if symbol.kind != SymbolKind::Decorator {
            self.diag(
                apply.pos,
                format!("`{}' is not a decorator", apply.name),
            );
            return;
        }
        let Binding::Decorator(idx) = symbol.binding.clone() else {
            self.diag(apply.pos, "internal error: decorator symbol without binding");
            return;
        };
        if self.expansion_stack.contains(&apply.name) {
            self.diag(
                apply.pos,
                format!("decorator `{}' applies itself recursively", apply.name),
            );
            return;
        }

        let mut body = self.decorators[idx].block.clone();
        self.reid_block(&mut body);

        let wrapped = std::mem::take(&mut apply.block.stmts);
        let mut wrapped = Some(wrapped);
        let mut found = 0usize;
        let apply_pos = apply.pos;
        self.splice_next(&mut body, &mut wrapped, &mut found);
        if found == 0 {
            self.diag(
                apply_pos,
                format!("decorator `{}' has no `next' statement", apply.name),
            );
        } else if found > 1 {
            self.diag(
                apply_pos,
                format!("decorator `{}' has multiple `next' statements", apply.name),
            );
        }

        self.declare_block(&body, scope);
        self.expansion_stack.push(apply.name.clone());
        self.resolve_block(&mut body);
        self.expansion_stack.pop();
        apply.resolved = Some(body);
    }

    /// Replace the first `next` in the decorator body with the wrapped
    /// statements; count every occurrence for diagnostics.
    fn splice_next(
        &mut self,
        block: &mut Block,
        wrapped: &mut Option<Vec<Stmt>>,
        found: &mut usize,
    ) {
        let mut i = 0;
        while i < block.stmts.len() {
            if matches!(block.stmts[i], Stmt::Next(_)) {
                *found += 1;
                match wrapped.take() {
                    Some(stmts) => {
                        let n = stmts.len();
                        block.stmts.splice(i..=i, stmts);
                        i += n;
                    }
                    None => {
                        block.stmts.remove(i);
                    }
                }
                continue;
            }
            match &mut block.stmts[i] {
                Stmt::Cond(c) => {
                    self.splice_next(&mut c.then, wrapped, found);
                    if let Some(else_) = &mut c.else_ {
                        self.splice_next(else_, wrapped, found);
                    }
                }
                Stmt::Otherwise(o) => self.splice_next(&mut o.block, wrapped, found),
                Stmt::DecoApply(d) => self.splice_next(&mut d.block, wrapped, found),
                _ => {}
            }
            i += 1;
        }
    }

    /// Assign fresh node ids throughout a cloned block so side tables
    /// never collide between applications.
    fn reid_block(&mut self, block: &mut Block) {
        block.id = self.fresh_id();
        for stmt in &mut block.stmts {
            self.reid_stmt(stmt);
        }
    }

    fn reid_stmt(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::Cond(c) => {
                self.reid_expr(&mut c.cond);
                self.reid_block(&mut c.then);
                if let Some(else_) = &mut c.else_ {
                    self.reid_block(else_);
                }
            }
            Stmt::Otherwise(o) => self.reid_block(&mut o.block),
            Stmt::Del(d) => self.reid_expr(&mut d.target),
            Stmt::VarDecl(v) => v.id = self.fresh_id(),
            Stmt::PatternFragment(f) => {
                f.id = self.fresh_id();
                self.reid_expr(&mut f.expr);
            }
            Stmt::DecoDecl(d) => {
                d.id = self.fresh_id();
                self.reid_block(&mut d.block);
            }
            Stmt::DecoApply(d) => {
                d.id = self.fresh_id();
                self.reid_block(&mut d.block);
            }
            Stmt::Next(_) | Stmt::Stop(_) => {}
            Stmt::Expr(e) => self.reid_expr(e),
        }
    }

    fn reid_expr(&mut self, expr: &mut Expr) {
        expr.id = self.fresh_id();
        match &mut expr.kind {
            ExprKind::Binary { lhs, rhs, .. } => {
                self.reid_expr(lhs);
                self.reid_expr(rhs);
            }
            ExprKind::Unary { expr: e, .. } | ExprKind::Postfix { expr: e, .. } => {
                self.reid_expr(e)
            }
            ExprKind::Indexed { base, index } => {
                self.reid_expr(base);
                for i in index {
                    self.reid_expr(i);
                }
            }
            ExprKind::Builtin { args, .. } => {
                for a in args {
                    self.reid_expr(a);
                }
            }
            ExprKind::Pattern(parts) => {
                for p in parts {
                    self.reid_expr(p);
                }
            }
            ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Str(_)
            | ExprKind::PatternLit(_)
            | ExprKind::Id(_)
            | ExprKind::Capref { .. } => {}
        }
    }
}
