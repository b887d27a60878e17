//! Lowering the checked AST to bytecode.
//!
//! Conditionals emit a forward-patched `jnm` over the body; the body is
//! bracketed with `setmatched false` / `setmatched true` so sibling
//! `otherwise` branches and nested blocks observe the matched flag
//! correctly. Arithmetic and comparisons dispatch on inferred types, so
//! the VM never needs to guess a conversion.

use std::collections::HashMap;

use metrail_dsl::ast::{
    BinaryOp, Block, Expr, ExprKind, PostfixOp, SourceUnit, Stmt, UnaryOp,
};
use metrail_dsl::position::Position;

use crate::checker::Analysis;
use crate::program::{
    max_stack_depth, CmpOp, Instr, MetricType, Opcode, Operand, Program,
};
use crate::symtab::Binding;
use crate::types::Type;

/// Target representation for conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Repr {
    Int,
    Float,
    Str,
}

/// Lower a checked program to bytecode.
pub fn emit(name: &str, source: &str, unit: &SourceUnit, analysis: &Analysis) -> Program {
    let mut e = Emitter {
        a: analysis,
        instrs: Vec::new(),
        strs: Vec::new(),
        str_ids: HashMap::new(),
    };
    e.emit_stmts(&unit.stmts);

    let max_stack = max_stack_depth(&e.instrs, &analysis.metrics);
    Program {
        name: name.to_string(),
        instrs: e.instrs,
        strs: e.strs,
        regexes: analysis.patterns.iter().map(|p| p.re.clone()).collect(),
        metrics: analysis.metrics.clone(),
        max_stack,
        source: source.to_string(),
    }
}

struct Emitter<'a> {
    a: &'a Analysis,
    instrs: Vec<Instr>,
    strs: Vec<String>,
    str_ids: HashMap<String, usize>,
}

impl<'a> Emitter<'a> {
    fn push(&mut self, op: Opcode, operand: Operand, pos: Position) {
        self.instrs.push(Instr { op, operand, pos });
    }

    fn placeholder(&mut self, op: Opcode, pos: Position) -> usize {
        let at = self.instrs.len();
        self.push(op, Operand::Addr(0), pos);
        at
    }

    fn patch(&mut self, at: usize) {
        let target = self.instrs.len();
        self.instrs[at].operand = Operand::Addr(target);
    }

    fn str_const(&mut self, s: &str) -> usize {
        if let Some(&id) = self.str_ids.get(s) {
            return id;
        }
        let id = self.strs.len();
        self.strs.push(s.to_string());
        self.str_ids.insert(s.to_string(), id);
        id
    }

    fn ty(&self, expr: &Expr) -> Type {
        self.a.types.get(&expr.id).cloned().unwrap_or(Type::Int)
    }

    /// Index into the metric table for an lvalue (checked earlier).
    fn metric_of(&self, target: &Expr) -> usize {
        let id_expr = match &target.kind {
            ExprKind::Indexed { base, .. } => base.as_ref(),
            _ => target,
        };
        let sid = self.a.resolved.get(&id_expr.id);
        if let Some(&sid) = sid {
            if let Binding::Metric(idx) = self.a.symtab.symbol(sid).binding {
                return idx;
            }
        }
        panic!("BUG: emitting unresolved metric lvalue at {}", target.pos);
    }

    fn emit_stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.emit_stmt(stmt);
        }
    }

    fn emit_block(&mut self, block: &Block) {
        self.emit_stmts(&block.stmts);
    }

    fn emit_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Cond(c) => {
                self.emit_expr(&c.cond);
                self.emit_guarded(c.cond.pos, c.else_.as_ref(), &c.then);
            }
            Stmt::Otherwise(o) => {
                self.push(Opcode::Otherwise, Operand::None, o.pos);
                self.emit_guarded(o.pos, None, &o.block);
            }
            Stmt::Del(d) => {
                let metric = self.metric_of(&d.target);
                if let ExprKind::Indexed { index, .. } = &d.target.kind {
                    for key in index {
                        self.emit_expr(key);
                        let kt = self.ty(key);
                        self.convert(&kt, Repr::Str, key.pos);
                    }
                }
                match d.expiry_ns {
                    Some(ns) => {
                        self.push(Opcode::PushInt, Operand::Int(ns), d.pos);
                        self.push(Opcode::Expire, Operand::Metric(metric), d.pos);
                    }
                    None => self.push(Opcode::Del, Operand::Metric(metric), d.pos),
                }
            }
            Stmt::Stop(pos) => self.push(Opcode::Stop, Operand::None, *pos),
            Stmt::Expr(e) => self.emit_expr(e),
            Stmt::DecoApply(d) => {
                if let Some(resolved) = &d.resolved {
                    self.emit_block(resolved);
                }
            }
            Stmt::VarDecl(_)
            | Stmt::PatternFragment(_)
            | Stmt::DecoDecl(_)
            | Stmt::Next(_) => {}
        }
    }

    /// Body of a conditional: jump over it when the condition value is
    /// falsey, and bracket it with matched-flag updates.
    fn emit_guarded(&mut self, pos: Position, else_: Option<&Block>, then: &Block) {
        let jnm = self.placeholder(Opcode::Jnm, pos);
        self.push(Opcode::SetMatched, Operand::Bool(false), pos);
        self.emit_block(then);
        self.push(Opcode::SetMatched, Operand::Bool(true), pos);
        match else_ {
            Some(else_block) => {
                let jmp = self.placeholder(Opcode::Jmp, pos);
                self.patch(jnm);
                self.emit_block(else_block);
                self.patch(jmp);
            }
            None => self.patch(jnm),
        }
    }

    fn emit_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Int(n) => self.push(Opcode::PushInt, Operand::Int(*n), expr.pos),
            ExprKind::Float(x) => self.push(Opcode::PushFloat, Operand::Float(*x), expr.pos),
            ExprKind::Str(s) => {
                let id = self.str_const(s);
                self.push(Opcode::PushStr, Operand::Str(id), expr.pos);
            }
            ExprKind::Pattern(_) => {
                let k = self.pattern_index(expr);
                self.push(Opcode::Match, Operand::Regex(k), expr.pos);
            }
            ExprKind::Id(_) => {
                // A fragment reference in condition position matches the
                // line; otherwise this is a bare metric read.
                if let Some(&k) = self.a.pattern_of.get(&expr.id) {
                    self.push(Opcode::Match, Operand::Regex(k), expr.pos);
                    return;
                }
                self.emit_datum_load(expr);
                self.push(Opcode::Dget, Operand::None, expr.pos);
            }
            ExprKind::Capref { .. } => {
                let Some(&sid) = self.a.caprefs.get(&expr.id) else {
                    panic!("BUG: emitting unbound capture reference at {}", expr.pos);
                };
                let Binding::Capture { pattern, group } = self.a.symtab.symbol(sid).binding
                else {
                    panic!("BUG: capture symbol without binding at {}", expr.pos);
                };
                let op = match self.ty(expr) {
                    Type::Int => Opcode::CaprefInt,
                    Type::Float => Opcode::CaprefFloat,
                    _ => Opcode::CaprefStr,
                };
                self.push(op, Operand::Capture { pattern, group }, expr.pos);
            }
            ExprKind::Unary { op, expr: operand } => {
                self.emit_expr(operand);
                let opcode = match op {
                    UnaryOp::Not => Opcode::Not,
                    UnaryOp::Neg => Opcode::Neg,
                };
                self.push(opcode, Operand::None, expr.pos);
            }
            ExprKind::Postfix { op, expr: target } => {
                self.emit_datum_load(target);
                let opcode = match op {
                    PostfixOp::Inc => Opcode::Inc,
                    PostfixOp::Dec => Opcode::Dec,
                };
                self.push(opcode, Operand::None, expr.pos);
            }
            ExprKind::Indexed { .. } => {
                self.emit_datum_load(expr);
                self.push(Opcode::Dget, Operand::None, expr.pos);
            }
            ExprKind::Binary { op, lhs, rhs } => {
                // A folded pattern concatenation matches the line.
                if let Some(&k) = self.a.pattern_of.get(&expr.id) {
                    self.push(Opcode::Match, Operand::Regex(k), expr.pos);
                    return;
                }
                self.emit_binary(expr, *op, lhs, rhs);
            }
            ExprKind::Builtin { name, args } => self.emit_builtin(expr, name, args),
            ExprKind::PatternLit(_) => {
                panic!("BUG: pattern literal outside a pattern expression at {}", expr.pos)
            }
        }
    }

    fn pattern_index(&self, expr: &Expr) -> usize {
        match self.a.pattern_of.get(&expr.id) {
            Some(&k) => k,
            None => panic!("BUG: emitting uncompiled pattern at {}", expr.pos),
        }
    }

    /// Push the datum handle for an assignment/increment target.
    fn emit_datum_load(&mut self, target: &Expr) {
        let metric = self.metric_of(target);
        self.push(Opcode::Mload, Operand::Metric(metric), target.pos);
        let mut nkeys = 0;
        if let ExprKind::Indexed { index, .. } = &target.kind {
            for key in index {
                self.emit_expr(key);
                let kt = self.ty(key);
                self.convert(&kt, Repr::Str, key.pos);
            }
            nkeys = index.len();
        }
        self.push(Opcode::Dload, Operand::Keys(nkeys), target.pos);
    }

    /// Emit a conversion when the value's representation differs from
    /// what the consumer needs. Bools ride the Int rails.
    fn convert(&mut self, from: &Type, want: Repr, pos: Position) {
        let op = match (from, want) {
            (Type::Int | Type::Bool, Repr::Float) => Some(Opcode::I2f),
            (Type::Int | Type::Bool, Repr::Str) => Some(Opcode::I2s),
            (Type::Float, Repr::Int) => Some(Opcode::F2i),
            (Type::Float, Repr::Str) => Some(Opcode::F2s),
            (Type::String, Repr::Int) => Some(Opcode::S2i),
            (Type::String, Repr::Float) => Some(Opcode::S2f),
            _ => None,
        };
        if let Some(op) = op {
            self.push(op, Operand::None, pos);
        }
    }

    fn emit_binary(&mut self, expr: &Expr, op: BinaryOp, lhs: &Expr, rhs: &Expr) {
        use BinaryOp::*;
        match op {
            Assign | AddAssign => {
                let metric = self.metric_of(lhs);
                let vt = self.a.metrics[metric].value_type;
                self.emit_datum_load(lhs);
                self.emit_expr(rhs);
                let rt = self.ty(rhs);
                let want = match vt {
                    MetricType::Int => Repr::Int,
                    MetricType::Float | MetricType::Buckets => Repr::Float,
                    MetricType::Text => Repr::Str,
                };
                self.convert(&rt, want, rhs.pos);
                let store = match (op, vt) {
                    (Assign, MetricType::Int) => Opcode::Iset,
                    (Assign, MetricType::Float | MetricType::Buckets) => Opcode::Fset,
                    (Assign, MetricType::Text) => Opcode::Sset,
                    (AddAssign, MetricType::Int) => Opcode::Iadd,
                    (AddAssign, _) => Opcode::Fadd,
                    _ => unreachable!(),
                };
                self.push(store, Operand::None, expr.pos);
            }
            Match | NotMatch => {
                self.emit_expr(lhs);
                let lt = self.ty(lhs);
                self.convert(&lt, Repr::Str, lhs.pos);
                let k = self.pattern_index(rhs);
                self.push(Opcode::Smatch, Operand::Regex(k), expr.pos);
                if op == NotMatch {
                    self.push(Opcode::Not, Operand::None, expr.pos);
                }
            }
            And | Or | BitAnd | BitOr | BitXor | Shl | Shr => {
                self.emit_expr(lhs);
                self.emit_expr(rhs);
                let opcode = match op {
                    And | BitAnd => Opcode::And,
                    Or | BitOr => Opcode::Or,
                    BitXor => Opcode::Xor,
                    Shl => Opcode::Shl,
                    Shr => Opcode::Shr,
                    _ => unreachable!(),
                };
                self.push(opcode, Operand::None, expr.pos);
            }
            Eq | Ne | Lt | Le | Gt | Ge => {
                let lt = self.ty(lhs);
                let rt = self.ty(rhs);
                let (cmp, want) = comparison_repr(&lt, &rt);
                self.emit_expr(lhs);
                self.convert(&lt, want, lhs.pos);
                self.emit_expr(rhs);
                self.convert(&rt, want, rhs.pos);
                let cmp_op = match op {
                    Eq => CmpOp::Eq,
                    Ne => CmpOp::Ne,
                    Lt => CmpOp::Lt,
                    Le => CmpOp::Le,
                    Gt => CmpOp::Gt,
                    Ge => CmpOp::Ge,
                    _ => unreachable!(),
                };
                self.push(cmp, Operand::Cmp(cmp_op), expr.pos);
            }
            Add | Sub | Mul | Div | Mod | Pow => {
                let result = self.ty(expr);
                if matches!(result, Type::String) && op == Add {
                    self.emit_expr(lhs);
                    let lt = self.ty(lhs);
                    self.convert(&lt, Repr::Str, lhs.pos);
                    self.emit_expr(rhs);
                    let rt = self.ty(rhs);
                    self.convert(&rt, Repr::Str, rhs.pos);
                    self.push(Opcode::Concat, Operand::None, expr.pos);
                    return;
                }
                let want = if matches!(result, Type::Float) {
                    Repr::Float
                } else {
                    Repr::Int
                };
                self.emit_expr(lhs);
                let lt = self.ty(lhs);
                self.convert(&lt, want, lhs.pos);
                self.emit_expr(rhs);
                let rt = self.ty(rhs);
                self.convert(&rt, want, rhs.pos);
                let opcode = match op {
                    Add => Opcode::Add,
                    Sub => Opcode::Sub,
                    Mul => Opcode::Mul,
                    Div => Opcode::Div,
                    Mod => Opcode::Mod,
                    Pow => Opcode::Pow,
                    _ => unreachable!(),
                };
                self.push(opcode, Operand::None, expr.pos);
            }
        }
    }

    fn emit_builtin(&mut self, expr: &Expr, name: &str, args: &[Expr]) {
        match name {
            "int" => {
                self.emit_expr(&args[0]);
                let t = self.ty(&args[0]);
                self.convert(&t, Repr::Int, expr.pos);
            }
            "float" => {
                self.emit_expr(&args[0]);
                let t = self.ty(&args[0]);
                self.convert(&t, Repr::Float, expr.pos);
            }
            "string" => {
                self.emit_expr(&args[0]);
                let t = self.ty(&args[0]);
                self.convert(&t, Repr::Str, expr.pos);
            }
            "bool" => {
                self.emit_expr(&args[0]);
                if matches!(self.ty(&args[0]), Type::String) {
                    self.push(Opcode::S2b, Operand::None, expr.pos);
                }
            }
            "timestamp" => self.push(Opcode::Timestamp, Operand::None, expr.pos),
            "settime" => {
                self.emit_expr(&args[0]);
                let t = self.ty(&args[0]);
                self.convert(&t, Repr::Int, args[0].pos);
                self.push(Opcode::Settime, Operand::None, expr.pos);
            }
            "strptime" => {
                self.emit_expr(&args[0]);
                let t = self.ty(&args[0]);
                self.convert(&t, Repr::Str, args[0].pos);
                self.emit_expr(&args[1]);
                self.push(Opcode::Strptime, Operand::None, expr.pos);
            }
            "strtol" => {
                self.emit_expr(&args[0]);
                let t = self.ty(&args[0]);
                self.convert(&t, Repr::Str, args[0].pos);
                self.emit_expr(&args[1]);
                let bt = self.ty(&args[1]);
                self.convert(&bt, Repr::Int, args[1].pos);
                self.push(Opcode::Strtol, Operand::None, expr.pos);
            }
            "tolower" => {
                self.emit_expr(&args[0]);
                let t = self.ty(&args[0]);
                self.convert(&t, Repr::Str, args[0].pos);
                self.push(Opcode::Tolower, Operand::None, expr.pos);
            }
            "len" => {
                self.emit_expr(&args[0]);
                let t = self.ty(&args[0]);
                self.convert(&t, Repr::Str, args[0].pos);
                self.push(Opcode::Len, Operand::None, expr.pos);
            }
            "getfilename" => self.push(Opcode::Getfilename, Operand::None, expr.pos),
            "subst" => {
                if let Some(&k) = self.a.pattern_of.get(&args[0].id) {
                    self.emit_expr(&args[1]);
                    self.emit_expr(&args[2]);
                    self.push(Opcode::Subst, Operand::Regex(k), expr.pos);
                } else {
                    // Literal (non-pattern) needle: plain replacement.
                    self.emit_expr(&args[0]);
                    self.emit_expr(&args[1]);
                    self.emit_expr(&args[2]);
                    self.push(Opcode::Replace, Operand::None, expr.pos);
                }
            }
            _ => panic!("BUG: unknown builtin `{}' reached the emitter", name),
        }
    }
}

/// Pick a comparison opcode and operand representation from the two
/// operand types.
fn comparison_repr(lt: &Type, rt: &Type) -> (Opcode, Repr) {
    if matches!(lt, Type::Float) || matches!(rt, Type::Float) {
        (Opcode::Fcmp, Repr::Float)
    } else if matches!(lt, Type::String) || matches!(rt, Type::String) {
        (Opcode::Scmp, Repr::Str)
    } else {
        (Opcode::Icmp, Repr::Int)
    }
}
