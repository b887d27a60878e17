//! Semantic analysis.
//!
//! Four sub-passes walk the AST in order:
//!
//! 1. [`declare`] - scope creation and symbol declaration
//! 2. [`resolve`] - reference resolution and decorator expansion
//! 3. [`patterns`] - fragment inlining, regex compilation, capref binding
//! 4. [`infer`] - type inference
//!
//! All diagnostics aggregate; checking fails only after every pass has
//! reported what it can. Results land in side tables keyed by node id
//! (the AST itself is only mutated by decorator expansion).

mod declare;
mod infer;
mod patterns;
mod resolve;

use std::collections::{HashMap, HashSet};

use metrail_dsl::ast::{
    walk_stmts, DecoDecl, Expr, NodeId, PatternFragment, SourceUnit, Stmt, VarKind, Visitor,
};
use metrail_dsl::position::Position;

use crate::diag::Diagnostic;
use crate::program::{CompiledPattern, MetricInfo, MetricType};
use crate::symtab::{ScopeId, SymbolId, SymbolTable, ROOT_SCOPE};
use crate::types::{Type, TypeCtx};

/// Output of a successful check, consumed by the code generator.
#[derive(Debug)]
pub struct Analysis {
    pub symtab: SymbolTable,
    /// Identifier expression → symbol.
    pub resolved: HashMap<NodeId, SymbolId>,
    /// Capture reference expression → symbol (binding holds pattern/group).
    pub caprefs: HashMap<NodeId, SymbolId>,
    /// Compiled regex table, deduplicated by source text.
    pub patterns: Vec<CompiledPattern>,
    /// Pattern expression → index into `patterns`.
    pub pattern_of: HashMap<NodeId, usize>,
    /// Declared metrics in program order.
    pub metrics: Vec<MetricInfo>,
    /// Expression → fully resolved type.
    pub types: HashMap<NodeId, Type>,
    /// Conditional expressions of Int type, tested against zero.
    pub truthy: HashSet<NodeId>,
}

pub(crate) struct Checker {
    pub(crate) symtab: SymbolTable,
    pub(crate) scopes: HashMap<NodeId, ScopeId>,
    pub(crate) resolved: HashMap<NodeId, SymbolId>,
    pub(crate) caprefs: HashMap<NodeId, SymbolId>,
    pub(crate) patterns: Vec<CompiledPattern>,
    pub(crate) pattern_ids: HashMap<String, usize>,
    pub(crate) pattern_of: HashMap<NodeId, usize>,
    pub(crate) metrics: Vec<MetricInfo>,
    pub(crate) metric_types: Vec<Type>,
    pub(crate) fragments: Vec<PatternFragment>,
    pub(crate) fragment_sources: HashMap<usize, Option<String>>,
    pub(crate) decorators: Vec<DecoDecl>,
    pub(crate) types: HashMap<NodeId, Type>,
    pub(crate) truthy: HashSet<NodeId>,
    pub(crate) ctx: TypeCtx,
    pub(crate) diags: Vec<Diagnostic>,
    pub(crate) next_id: NodeId,
    pub(crate) expansion_stack: Vec<String>,
    pub(crate) pattern_env: Vec<usize>,
}

impl Checker {
    fn new(next_id: NodeId) -> Self {
        Self {
            symtab: SymbolTable::new(),
            scopes: HashMap::new(),
            resolved: HashMap::new(),
            caprefs: HashMap::new(),
            patterns: Vec::new(),
            pattern_ids: HashMap::new(),
            pattern_of: HashMap::new(),
            metrics: Vec::new(),
            metric_types: Vec::new(),
            fragments: Vec::new(),
            fragment_sources: HashMap::new(),
            decorators: Vec::new(),
            types: HashMap::new(),
            truthy: HashSet::new(),
            ctx: TypeCtx::new(),
            diags: Vec::new(),
            next_id,
            expansion_stack: Vec::new(),
            pattern_env: Vec::new(),
        }
    }

    pub(crate) fn diag(&mut self, pos: Position, message: impl Into<String>) {
        self.diags.push(Diagnostic::new(pos, message));
    }

    pub(crate) fn fresh_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Unify with a diagnostic on mismatch. Errors already present in
    /// either operand pass through without re-reporting.
    pub(crate) fn unify_or_diag(&mut self, expected: &Type, observed: &Type, pos: Position) -> Type {
        let ra = self.ctx.root(expected);
        if ra.is_error() {
            return ra;
        }
        let rb = self.ctx.root(observed);
        if rb.is_error() {
            return rb;
        }
        let t = self.ctx.unify(&ra, &rb);
        if let Type::Error(e) = &t {
            self.diag(pos, e.to_string());
        }
        t
    }

    /// Bind any remaining type variables in `t` to defaults so the
    /// emitted program has concrete types throughout.
    fn ground(&mut self, t: &Type) -> Type {
        match self.ctx.root(t) {
            Type::Var(_) => {
                let r = self.ctx.root(t);
                self.ctx.unify(&r, &Type::Int)
            }
            Type::Function(args) => {
                Type::Function(args.iter().map(|a| self.ground(&a.clone())).collect())
            }
            Type::Dimension(args) => {
                Type::Dimension(args.iter().map(|a| self.ground(&a.clone())).collect())
            }
            other => other,
        }
    }

    /// Post-inference cleanup: default unconstrained metric types, fix
    /// each metric's datum type, and fully resolve expression types.
    fn finalize(&mut self) {
        for i in 0..self.metrics.len() {
            let kind = self.metrics[i].kind;
            let default = match kind {
                VarKind::Counter | VarKind::Timer | VarKind::Gauge => Type::Int,
                VarKind::Text => Type::String,
                VarKind::Histogram => Type::Float,
            };
            let mt = self.metric_types[i].clone();
            let value = match self.ctx.root(&mt) {
                Type::Dimension(args) => {
                    // Unconstrained keys are strings; they always are at
                    // runtime.
                    let n = args.len();
                    for a in args.iter().take(n.saturating_sub(1)) {
                        if matches!(self.ctx.root(&a.clone()), Type::Var(_)) {
                            self.ctx.unify(&a.clone(), &Type::String);
                        }
                    }
                    args.last().cloned().unwrap_or(Type::Undef)
                }
                other => other,
            };
            let value = match self.ctx.root(&value) {
                Type::Var(_) => self.ctx.unify(&value, &default),
                other => other,
            };
            self.metrics[i].value_type = if kind == VarKind::Histogram {
                MetricType::Buckets
            } else {
                match value {
                    Type::Float => MetricType::Float,
                    Type::String => MetricType::Text,
                    _ => MetricType::Int,
                }
            };
        }

        let ids: Vec<NodeId> = self.types.keys().copied().collect();
        for id in ids {
            let t = self.types[&id].clone();
            let grounded = self.ground(&t);
            let resolved = self.ctx.resolve(&grounded);
            self.types.insert(id, resolved);
        }
    }
}

/// Final walk asserting the inference invariant: after a successful
/// check every expression's type is a complete (variable-free) operator.
/// A violation is a checker bug, reported as an internal error rather
/// than emitting a half-typed program.
struct CompletenessAudit<'c> {
    c: &'c mut Checker,
}

impl Visitor for CompletenessAudit<'_> {
    fn enter_stmt(&mut self, stmt: &Stmt) -> bool {
        // Pattern constants have no runtime type.
        !matches!(stmt, Stmt::PatternFragment(_))
    }

    fn enter_expr(&mut self, expr: &Expr) -> bool {
        // A folded pattern concatenation is a leaf; its operands are
        // regex text, not values.
        !self.c.pattern_of.contains_key(&expr.id)
    }

    fn exit_expr(&mut self, expr: &Expr) {
        match self.c.types.get(&expr.id).cloned() {
            Option::None => {
                self.c
                    .diag(expr.pos, "internal error: expression was never typed");
            }
            Some(t) => {
                if !t.is_error() && !self.c.ctx.is_complete(&t) {
                    self.c.diag(
                        expr.pos,
                        format!("internal error: incomplete type {} after inference", t),
                    );
                }
            }
        }
    }
}

/// Check a parsed program. On success, returns the [`Analysis`] the
/// emitter needs; on failure, every diagnostic found.
pub fn check(unit: &mut SourceUnit) -> Result<Analysis, Vec<Diagnostic>> {
    let mut c = Checker::new(unit.next_id);
    c.declare_stmts(&unit.stmts, ROOT_SCOPE);
    let mut stmts = std::mem::take(&mut unit.stmts);
    c.resolve_stmts(&mut stmts, ROOT_SCOPE);
    unit.stmts = stmts;
    c.pattern_stmts(&unit.stmts);
    c.infer_stmts(&unit.stmts);
    c.finalize();
    if c.diags.is_empty() {
        let mut audit = CompletenessAudit { c: &mut c };
        walk_stmts(&mut audit, &unit.stmts);
    }

    if c.diags.is_empty() {
        Ok(Analysis {
            symtab: c.symtab,
            resolved: c.resolved,
            caprefs: c.caprefs,
            patterns: c.patterns,
            pattern_of: c.pattern_of,
            metrics: c.metrics,
            types: c.types,
            truthy: c.truthy,
        })
    } else {
        Err(c.diags)
    }
}
