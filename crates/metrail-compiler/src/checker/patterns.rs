//! Pass 3: pattern-fragment inlining, regex compilation, and capture
//! reference binding.
//!
//! Pattern expressions are flattened to their concatenated source text,
//! compiled once per distinct source, and recorded against the node. A
//! conditional's patterns then govern capture references in the
//! conditional's expression and body; nested conditionals push onto the
//! pattern environment and see their ancestors' groups.

use metrail_dsl::ast::{BinaryOp, Block, Expr, ExprKind, Stmt};
use metrail_dsl::position::Position;

use crate::program::CompiledPattern;
use crate::symtab::{Binding, Symbol, SymbolKind};
use crate::types::Type;

use super::Checker;

/// Parse the syntax tree used for capture-group inference. Perl classes
/// are taken as their ASCII ranges (`\d` is `[0-9]`) so digit groups
/// infer numeric; patterns the ASCII parser cannot express fall back to
/// the Unicode parse.
fn parse_hir(source: &str) -> Result<regex_syntax::hir::Hir, regex_syntax::Error> {
    regex_syntax::ParserBuilder::new()
        .unicode(false)
        .utf8(false)
        .build()
        .parse(source)
        .or_else(|_| regex_syntax::Parser::new().parse(source))
}

impl Checker {
    pub(crate) fn pattern_stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.pattern_stmt(stmt);
        }
    }

    fn pattern_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Cond(c) => {
                let depth = self.pattern_env.len();
                self.pattern_expr(&c.cond, true);
                self.pattern_block(&c.then);
                if let Some(else_) = &c.else_ {
                    self.pattern_block(else_);
                }
                self.pattern_env.truncate(depth);
            }
            Stmt::Otherwise(o) => self.pattern_block(&o.block),
            Stmt::Del(d) => self.pattern_expr(&d.target, false),
            Stmt::Expr(e) => self.pattern_expr(e, false),
            Stmt::DecoApply(d) => {
                if let Some(resolved) = &d.resolved {
                    self.pattern_block(resolved);
                }
            }
            // Fragments compile lazily, where they are referenced.
            Stmt::PatternFragment(_)
            | Stmt::DecoDecl(_)
            | Stmt::VarDecl(_)
            | Stmt::Next(_)
            | Stmt::Stop(_) => {}
        }
    }

    fn pattern_block(&mut self, block: &Block) {
        for stmt in &block.stmts {
            self.pattern_stmt(stmt);
        }
    }

    /// Walk an expression compiling pattern nodes and binding caprefs.
    /// `in_cond` is true only on the spine of a conditional expression;
    /// patterns there define capture groups for the enclosing block.
    fn pattern_expr(&mut self, expr: &Expr, in_cond: bool) {
        match &expr.kind {
            ExprKind::Pattern(_) => {
                if let Some(idx) = self.compile_pattern(expr) {
                    if in_cond {
                        self.pattern_env.push(idx);
                    }
                }
            }
            // A `+` spine over pattern operands is concatenation, folded
            // into a single compiled regex.
            ExprKind::Binary {
                op: BinaryOp::Add, ..
            } if self.is_pattern_spine(expr) => {
                if let Some(idx) = self.compile_pattern(expr) {
                    if in_cond {
                        self.pattern_env.push(idx);
                    }
                }
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                self.pattern_expr(lhs, in_cond);
                self.pattern_expr(rhs, in_cond);
            }
            ExprKind::Unary { expr: e, .. } => self.pattern_expr(e, in_cond),
            ExprKind::Postfix { expr: e, .. } => self.pattern_expr(e, false),
            ExprKind::Indexed { base, index } => {
                self.pattern_expr(base, false);
                for i in index {
                    self.pattern_expr(i, false);
                }
            }
            ExprKind::Builtin { args, .. } => {
                for a in args {
                    self.pattern_expr(a, false);
                }
            }
            ExprKind::Capref { name, is_named } => {
                self.bind_capref(expr.id, expr.pos, name, *is_named);
            }
            // A bare fragment reference is a pattern in its own right,
            // wherever it appears; in condition position it also
            // defines capture groups.
            ExprKind::Id(_) => {
                if self
                    .resolved
                    .get(&expr.id)
                    .is_some_and(|&sid| self.symtab.symbol(sid).kind == SymbolKind::Pattern)
                {
                    if let Some(idx) = self.compile_pattern(expr) {
                        if in_cond {
                            self.pattern_env.push(idx);
                        }
                    }
                }
            }
            ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Str(_)
            | ExprKind::PatternLit(_) => {}
        }
    }

    /// Flatten and compile a pattern expression, deduplicating by source
    /// text. Returns the pattern table index.
    pub(crate) fn compile_pattern(&mut self, expr: &Expr) -> Option<usize> {
        let source = self.flatten_pattern(expr)?;
        if let Some(&idx) = self.pattern_ids.get(&source) {
            self.pattern_of.insert(expr.id, idx);
            return Some(idx);
        }
        let re = match regex::Regex::new(&source) {
            Ok(re) => re,
            Err(err) => {
                self.diag(expr.pos, format!("invalid regular expression: {}", err));
                return None;
            }
        };
        let hir = match parse_hir(&source) {
            Ok(hir) => hir,
            Err(err) => {
                self.diag(expr.pos, format!("invalid regular expression: {}", err));
                return None;
            }
        };
        let idx = self.patterns.len();
        self.patterns.push(CompiledPattern {
            source: source.clone(),
            re,
            hir,
            pos: expr.pos,
        });
        self.pattern_ids.insert(source, idx);
        self.pattern_of.insert(expr.id, idx);
        Some(idx)
    }

    fn flatten_pattern(&mut self, expr: &Expr) -> Option<String> {
        let ExprKind::Pattern(parts) = &expr.kind else {
            return self.flatten_part(expr);
        };
        let mut out = String::new();
        for part in parts {
            out.push_str(&self.flatten_part(part)?);
        }
        Some(out)
    }

    /// Does this `+` tree concatenate patterns rather than add numbers?
    /// True when every leaf is a pattern literal, fragment reference or
    /// string, and at least one is an actual pattern.
    fn is_pattern_spine(&self, expr: &Expr) -> bool {
        fn walk(c: &Checker, e: &Expr, saw_pattern: &mut bool) -> bool {
            match &e.kind {
                ExprKind::Binary {
                    op: BinaryOp::Add,
                    lhs,
                    rhs,
                } => walk(c, lhs, saw_pattern) && walk(c, rhs, saw_pattern),
                ExprKind::PatternLit(_) | ExprKind::Pattern(_) => {
                    *saw_pattern = true;
                    true
                }
                ExprKind::Id(_) => match c.resolved.get(&e.id) {
                    Some(&sid) if c.symtab.symbol(sid).kind == SymbolKind::Pattern => {
                        *saw_pattern = true;
                        true
                    }
                    _ => false,
                },
                ExprKind::Str(_) => true,
                _ => false,
            }
        }
        let mut saw_pattern = false;
        walk(self, expr, &mut saw_pattern) && saw_pattern
    }

    fn flatten_part(&mut self, part: &Expr) -> Option<String> {
        match &part.kind {
            ExprKind::PatternLit(body) => Some(body.clone()),
            ExprKind::Str(s) => Some(s.clone()),
            ExprKind::Pattern(_) => self.flatten_pattern(part),
            ExprKind::Binary {
                op: BinaryOp::Add,
                lhs,
                rhs,
            } => {
                let mut a = self.flatten_part(lhs)?;
                let b = self.flatten_part(rhs)?;
                a.push_str(&b);
                Some(a)
            }
            ExprKind::Id(name) => {
                let Some(&sid) = self.resolved.get(&part.id) else {
                    // Unresolved; already diagnosed in the resolve pass.
                    return None;
                };
                let symbol = self.symtab.symbol(sid);
                if symbol.kind != SymbolKind::Pattern {
                    self.diag(
                        part.pos,
                        format!("`{}' is not a pattern constant", name),
                    );
                    return None;
                }
                let Binding::Fragment(idx) = symbol.binding.clone() else {
                    return None;
                };
                self.fragment_source(idx, part.pos)
            }
            _ => {
                self.diag(part.pos, "expression is not a valid pattern");
                None
            }
        }
    }

    /// Source text of a fragment, memoized; reference cycles diagnose.
    fn fragment_source(&mut self, idx: usize, pos: Position) -> Option<String> {
        match self.fragment_sources.get(&idx) {
            Some(Some(src)) => return Some(src.clone()),
            Some(None) => {
                self.diag(pos, "pattern constants refer to each other in a cycle");
                return None;
            }
            None => {}
        }
        self.fragment_sources.insert(idx, None);
        let frag_expr = self.fragments[idx].expr.clone();
        let source = self.flatten_pattern(&frag_expr);
        self.fragment_sources.insert(idx, source.clone());
        source
    }

    fn bind_capref(&mut self, id: metrail_dsl::ast::NodeId, pos: Position, name: &str, is_named: bool) {
        for &pid in self.pattern_env.iter().rev() {
            let pattern = &self.patterns[pid];
            let group = if is_named {
                pattern
                    .re
                    .capture_names()
                    .position(|n| n == Some(name))
            } else {
                let n: usize = match name.parse() {
                    Ok(n) => n,
                    Err(_) => break,
                };
                if n < pattern.re.captures_len() {
                    Some(n)
                } else {
                    None
                }
            };
            if let Some(group) = group {
                let sid = self.symtab.add_unnamed(Symbol {
                    name: format!("${}", name),
                    kind: SymbolKind::Capref,
                    ty: Type::Undef,
                    binding: Binding::Capture {
                        pattern: pid,
                        group,
                    },
                    pos,
                });
                self.caprefs.insert(id, sid);
                return;
            }
        }
        self.diag(
            pos,
            format!(
                "capture group reference `${}' not defined by any pattern in this scope",
                name
            ),
        );
    }
}
