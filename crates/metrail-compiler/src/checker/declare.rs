//! Pass 1: scope creation and symbol declaration.
//!
//! Declarations insert at the enclosing scope; a duplicate name in the
//! same scope reports at the second occurrence. Decorator bodies and
//! application blocks are skipped here; they are declared where the
//! decorator is applied (see the resolve pass).

use metrail_dsl::ast::{Block, Stmt, VarDecl, VarKind};

use crate::program::{MetricInfo, MetricType};
use crate::symtab::{Binding, ScopeId, Symbol, SymbolKind};
use crate::types::Type;

use super::Checker;

impl Checker {
    pub(crate) fn declare_stmts(&mut self, stmts: &[Stmt], scope: ScopeId) {
        for stmt in stmts {
            self.declare_stmt(stmt, scope);
        }
    }

    fn declare_stmt(&mut self, stmt: &Stmt, scope: ScopeId) {
        match stmt {
            Stmt::VarDecl(decl) => self.declare_metric(decl, scope),
            Stmt::PatternFragment(frag) => {
                let idx = self.fragments.len();
                self.fragments.push(frag.clone());
                let symbol = Symbol {
                    name: frag.name.clone(),
                    kind: SymbolKind::Pattern,
                    ty: Type::Pattern,
                    binding: Binding::Fragment(idx),
                    pos: frag.pos,
                };
                self.declare_symbol(scope, symbol);
            }
            Stmt::DecoDecl(decl) => {
                let idx = self.decorators.len();
                self.decorators.push(decl.clone());
                let symbol = Symbol {
                    name: decl.name.clone(),
                    kind: SymbolKind::Decorator,
                    ty: Type::None,
                    binding: Binding::Decorator(idx),
                    pos: decl.pos,
                };
                self.declare_symbol(scope, symbol);
            }
            Stmt::Cond(c) => {
                self.declare_block(&c.then, scope);
                if let Some(else_) = &c.else_ {
                    self.declare_block(else_, scope);
                }
            }
            Stmt::Otherwise(o) => self.declare_block(&o.block, scope),
            // Application blocks are declared during expansion.
            Stmt::DecoApply(_) => {}
            Stmt::Del(_) | Stmt::Next(_) | Stmt::Stop(_) | Stmt::Expr(_) => {}
        }
    }

    pub(crate) fn declare_block(&mut self, block: &Block, parent: ScopeId) {
        let scope = self.symtab.push_scope(parent);
        self.scopes.insert(block.id, scope);
        self.declare_stmts(&block.stmts, scope);
    }

    fn declare_metric(&mut self, decl: &VarDecl, scope: ScopeId) {
        if decl.kind == VarKind::Histogram && decl.buckets.is_empty() {
            self.diag(
                decl.pos,
                format!("histogram `{}' must declare buckets", decl.name),
            );
        }
        if decl.kind != VarKind::Histogram && !decl.buckets.is_empty() {
            self.diag(
                decl.pos,
                format!("buckets are only valid on histograms, but `{}' is a {}", decl.name, decl.kind),
            );
        }

        let value = match decl.kind {
            VarKind::Counter | VarKind::Timer => Type::Int,
            VarKind::Text => Type::String,
            VarKind::Histogram => Type::Float,
            VarKind::Gauge => self.ctx.fresh(),
        };
        let ty = if decl.keys.is_empty() {
            value
        } else {
            let mut args: Vec<Type> = decl.keys.iter().map(|_| self.ctx.fresh()).collect();
            args.push(value);
            Type::Dimension(args)
        };

        let index = self.metrics.len();
        let mut buckets = decl.buckets.clone();
        buckets.sort_by(|a, b| a.total_cmp(b));
        buckets.dedup();
        self.metrics.push(MetricInfo {
            name: decl.name.clone(),
            exported: decl.exported.clone(),
            kind: decl.kind,
            hidden: decl.hidden,
            keys: decl.keys.clone(),
            buckets,
            pos: decl.pos,
            value_type: MetricType::Int,
        });
        self.metric_types.push(ty.clone());

        let symbol = Symbol {
            name: decl.name.clone(),
            kind: SymbolKind::Metric,
            ty,
            binding: Binding::Metric(index),
            pos: decl.pos,
        };
        self.declare_symbol(scope, symbol);
    }

    fn declare_symbol(&mut self, scope: ScopeId, symbol: Symbol) {
        let name = symbol.name.clone();
        let pos = symbol.pos;
        if let Err(existing) = self.symtab.declare(scope, symbol) {
            let prev = self.symtab.symbol(existing).pos;
            self.diag(
                pos,
                format!("redefinition of `{}'; previously defined at {}", name, prev),
            );
        }
    }
}
