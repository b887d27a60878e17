//! Abstract syntax tree for metrail programs.
//!
//! Nodes are plain tagged sums; compiler passes are external visitors that
//! pattern-match on the tags (see [`Visitor`]). Every expression and block
//! carries a [`NodeId`] so passes can attach information (types, symbol
//! bindings, compiled patterns) in side tables instead of mutating nodes.

use crate::position::Position;

/// Identity of an expression or block node, unique within one parse.
pub type NodeId = u32;

/// Metric kinds a declaration can introduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Counter,
    Gauge,
    Timer,
    Text,
    Histogram,
}

impl std::fmt::Display for VarKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VarKind::Counter => "counter",
            VarKind::Gauge => "gauge",
            VarKind::Timer => "timer",
            VarKind::Text => "text",
            VarKind::Histogram => "histogram",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Assign,
    AddAssign,
    Match,
    NotMatch,
    Or,
    And,
    BitOr,
    BitXor,
    BitAnd,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostfixOp {
    Inc,
    Dec,
}

/// An expression node.
#[derive(Debug, Clone)]
pub struct Expr {
    pub id: NodeId,
    pub pos: Position,
    pub kind: ExprKind,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    Str(String),
    /// Raw regex body from a `/…/` literal.
    PatternLit(String),
    /// A pattern expression: concatenation of regex literals, fragment
    /// references and string literals, joined by `+` in the source.
    Pattern(Vec<Expr>),
    /// Identifier reference (metric or pattern fragment).
    Id(String),
    /// Capture reference `$1` or `$name`.
    Capref { name: String, is_named: bool },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Postfix {
        op: PostfixOp,
        expr: Box<Expr>,
    },
    /// Indexed metric access `m[$1, $2]` (chained `m[$1][$2]` flattens).
    Indexed {
        base: Box<Expr>,
        index: Vec<Expr>,
    },
    /// Builtin function call.
    Builtin {
        name: String,
        args: Vec<Expr>,
    },
}

/// A `{ … }` statement block, introducing a scope.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: NodeId,
    pub pos: Position,
    pub stmts: Vec<Stmt>,
}

/// A statement.
#[derive(Debug, Clone)]
pub enum Stmt {
    Cond(CondStmt),
    Otherwise(OtherwiseStmt),
    Del(DelStmt),
    VarDecl(VarDecl),
    PatternFragment(PatternFragment),
    DecoDecl(DecoDecl),
    DecoApply(DecoApply),
    Next(Position),
    Stop(Position),
    Expr(Expr),
}

impl Stmt {
    pub fn pos(&self) -> Position {
        match self {
            Stmt::Cond(s) => s.pos,
            Stmt::Otherwise(s) => s.pos,
            Stmt::Del(s) => s.pos,
            Stmt::VarDecl(s) => s.pos,
            Stmt::PatternFragment(s) => s.pos,
            Stmt::DecoDecl(s) => s.pos,
            Stmt::DecoApply(s) => s.pos,
            Stmt::Next(p) | Stmt::Stop(p) => *p,
            Stmt::Expr(e) => e.pos,
        }
    }
}

/// A conditional: pattern or boolean expression guarding a block.
#[derive(Debug, Clone)]
pub struct CondStmt {
    pub pos: Position,
    pub cond: Expr,
    pub then: Block,
    pub else_: Option<Block>,
}

/// `otherwise { … }` - runs when no sibling conditional matched the line.
#[derive(Debug, Clone)]
pub struct OtherwiseStmt {
    pub pos: Position,
    pub block: Block,
}

/// `del m[…] [after duration]`.
#[derive(Debug, Clone)]
pub struct DelStmt {
    pub pos: Position,
    pub target: Expr,
    pub expiry_ns: Option<i64>,
}

/// Metric declaration.
#[derive(Debug, Clone)]
pub struct VarDecl {
    pub id: NodeId,
    pub pos: Position,
    pub kind: VarKind,
    pub hidden: bool,
    pub name: String,
    pub exported: Option<String>,
    pub keys: Vec<String>,
    pub buckets: Vec<f64>,
}

/// `const NAME /…/ + …` named pattern fragment.
#[derive(Debug, Clone)]
pub struct PatternFragment {
    pub id: NodeId,
    pub pos: Position,
    pub name: String,
    pub expr: Expr,
}

/// `def NAME { … }` decorator declaration. The body is checked at each
/// application site, not here.
#[derive(Debug, Clone)]
pub struct DecoDecl {
    pub id: NodeId,
    pub pos: Position,
    pub name: String,
    pub block: Block,
}

/// `@NAME { … }` decorator application. `resolved` holds the expansion
/// (the declaration body with `next` replaced by the wrapped block), built
/// during checking.
#[derive(Debug, Clone)]
pub struct DecoApply {
    pub id: NodeId,
    pub pos: Position,
    pub name: String,
    pub block: Block,
    pub resolved: Option<Block>,
}

/// One parsed source file.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    pub stmts: Vec<Stmt>,
    /// First node id not yet in use; checker expansion continues from here.
    pub next_id: NodeId,
}

/// AST visitor. Enter hooks return `false` to skip a node's children.
///
/// The default walk descends a decorator application's `resolved`
/// expansion when present and never descends declaration bodies (they are
/// checked where applied).
pub trait Visitor {
    fn enter_stmt(&mut self, _stmt: &Stmt) -> bool {
        true
    }
    fn exit_stmt(&mut self, _stmt: &Stmt) {}
    fn enter_block(&mut self, _block: &Block) -> bool {
        true
    }
    fn exit_block(&mut self, _block: &Block) {}
    fn enter_expr(&mut self, _expr: &Expr) -> bool {
        true
    }
    fn exit_expr(&mut self, _expr: &Expr) {}
}

pub fn walk_stmts<V: Visitor>(v: &mut V, stmts: &[Stmt]) {
    for stmt in stmts {
        walk_stmt(v, stmt);
    }
}

pub fn walk_stmt<V: Visitor>(v: &mut V, stmt: &Stmt) {
    if !v.enter_stmt(stmt) {
        return;
    }
    match stmt {
        Stmt::Cond(c) => {
            walk_expr(v, &c.cond);
            walk_block(v, &c.then);
            if let Some(e) = &c.else_ {
                walk_block(v, e);
            }
        }
        Stmt::Otherwise(o) => walk_block(v, &o.block),
        Stmt::Del(d) => walk_expr(v, &d.target),
        Stmt::PatternFragment(p) => walk_expr(v, &p.expr),
        Stmt::DecoApply(d) => {
            if let Some(resolved) = &d.resolved {
                walk_block(v, resolved);
            }
        }
        Stmt::DecoDecl(_) | Stmt::VarDecl(_) | Stmt::Next(_) | Stmt::Stop(_) => {}
        Stmt::Expr(e) => walk_expr(v, e),
    }
    v.exit_stmt(stmt);
}

pub fn walk_block<V: Visitor>(v: &mut V, block: &Block) {
    if !v.enter_block(block) {
        return;
    }
    walk_stmts(v, &block.stmts);
    v.exit_block(block);
}

pub fn walk_expr<V: Visitor>(v: &mut V, expr: &Expr) {
    if !v.enter_expr(expr) {
        return;
    }
    match &expr.kind {
        ExprKind::Binary { lhs, rhs, .. } => {
            walk_expr(v, lhs);
            walk_expr(v, rhs);
        }
        ExprKind::Unary { expr: e, .. } | ExprKind::Postfix { expr: e, .. } => walk_expr(v, e),
        ExprKind::Indexed { base, index } => {
            walk_expr(v, base);
            for i in index {
                walk_expr(v, i);
            }
        }
        ExprKind::Builtin { args, .. } => {
            for a in args {
                walk_expr(v, a);
            }
        }
        ExprKind::Pattern(parts) => {
            for p in parts {
                walk_expr(v, p);
            }
        }
        ExprKind::Int(_)
        | ExprKind::Float(_)
        | ExprKind::Str(_)
        | ExprKind::PatternLit(_)
        | ExprKind::Id(_)
        | ExprKind::Capref { .. } => {}
    }
    v.exit_expr(expr);
}
