//! Compiled program objects: instructions, operands and constant tables.
//!
//! Opcodes are data; their stack effects live in one metadata table used
//! both to bound the operand stack at compile time and to keep the VM's
//! expectations explicit.

use metrail_dsl::ast::VarKind;
use metrail_dsl::position::Position;
use regex::Regex;
use regex_syntax::hir::Hir;

/// A compiled pattern: source text, the engine regex, and the parsed
/// syntax used for capture-group type inference.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub source: String,
    pub re: Regex,
    pub hir: Hir,
    pub pos: Position,
}

/// Storage type of a metric's datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Int,
    Float,
    Text,
    Buckets,
}

/// A metric declaration as the loader will register it.
#[derive(Debug, Clone)]
pub struct MetricInfo {
    pub name: String,
    pub exported: Option<String>,
    pub kind: VarKind,
    pub hidden: bool,
    pub keys: Vec<String>,
    pub buckets: Vec<f64>,
    pub pos: Position,
    pub value_type: MetricType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Instruction operand. At most one per instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Int(i64),
    Float(f64),
    /// Index into the string table.
    Str(usize),
    /// Index into the regex table.
    Regex(usize),
    /// Index into the metric table.
    Metric(usize),
    /// Jump target.
    Addr(usize),
    /// Number of key strings to pop.
    Keys(usize),
    /// Capture group `group` of regex `pattern`.
    Capture { pattern: usize, group: usize },
    Cmp(CmpOp),
    Bool(bool),
}

/// Bytecode operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Push the integer operand.
    PushInt,
    /// Push the float operand.
    PushFloat,
    /// Push string constant k.
    PushStr,
    /// Match regex k against the input line; push the result and fold it
    /// into the matched flag.
    Match,
    /// Pop a string, match regex k against it; push the result and fold
    /// it into the matched flag.
    Smatch,
    /// Push true when no sibling conditional has matched this line.
    Otherwise,
    /// Set the matched flag to the boolean operand.
    SetMatched,
    /// Unconditional jump.
    Jmp,
    /// Pop a value; jump when it is falsey (no match).
    Jnm,
    /// Push capture `group` of the last match of regex `pattern`.
    CaprefStr,
    CaprefInt,
    CaprefFloat,
    /// Typed comparisons; operand carries the comparison.
    Icmp,
    Fcmp,
    Scmp,
    // Arithmetic over same-typed operands.
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Neg,
    Not,
    // Bitwise/logical over ints and bools.
    And,
    Or,
    Xor,
    Shl,
    Shr,
    /// Pop two strings, push their concatenation.
    Concat,
    // Conversions.
    I2f,
    I2s,
    F2i,
    F2s,
    S2i,
    S2f,
    S2b,
    /// Push the time register as Unix seconds.
    Timestamp,
    /// Pop an int, set the time register.
    Settime,
    /// Pop format and value strings, parse, set the time register.
    Strptime,
    /// Pop base and string, parse integer in that base.
    Strtol,
    Tolower,
    Len,
    Getfilename,
    /// Pop s and replacement, substitute matches of regex k; push result.
    Subst,
    /// Pop s, replacement and needle; literal substring replace.
    Replace,
    /// Push metric k's handle.
    Mload,
    /// Pop n key strings and a metric handle; push the datum handle.
    Dload,
    /// Pop a datum handle; push its current value.
    Dget,
    /// Pop a datum handle; increment / decrement it.
    Inc,
    Dec,
    /// Pop a value and a datum handle; add to it.
    Iadd,
    Fadd,
    /// Pop a value and a datum handle; store it.
    Iset,
    Fset,
    Sset,
    /// Pop metric k's key strings; remove that label instance now.
    Del,
    /// Pop an expiry (ns) and metric k's key strings; remove it after.
    Expire,
    /// Unload this program.
    Stop,
}

/// One instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub op: Opcode,
    pub operand: Operand,
    pub pos: Position,
}

/// The compile output: a flat opcode vector plus index-addressed
/// constant tables. Immutable after compile; shared by `Arc`.
#[derive(Debug, Clone)]
pub struct Program {
    pub name: String,
    pub instrs: Vec<Instr>,
    pub strs: Vec<String>,
    pub regexes: Vec<Regex>,
    pub metrics: Vec<MetricInfo>,
    /// Conservative operand-stack bound; the VM pre-sizes to this.
    pub max_stack: usize,
    pub source: String,
}

/// (pops, pushes) for an instruction. `Del`/`Expire` consult the metric
/// table for their key count.
pub fn stack_effect(instr: &Instr, metrics: &[MetricInfo]) -> (usize, usize) {
    use Opcode::*;
    match instr.op {
        PushInt | PushFloat | PushStr | Match | Otherwise | CaprefStr | CaprefInt
        | CaprefFloat | Timestamp | Getfilename | Mload => (0, 1),
        Smatch | Neg | Not | I2f | I2s | F2i | F2s | S2i | S2f | S2b | Tolower | Len | Dget => {
            (1, 1)
        }
        SetMatched | Jmp | Stop => (0, 0),
        Jnm | Settime | Inc | Dec => (1, 0),
        Icmp | Fcmp | Scmp | Add | Sub | Mul | Div | Mod | Pow | And | Or | Xor | Shl | Shr
        | Concat | Strtol | Subst => (2, 1),
        Strptime | Iadd | Fadd | Iset | Fset | Sset => (2, 0),
        Replace => (3, 1),
        Dload => match instr.operand {
            Operand::Keys(n) => (n + 1, 1),
            _ => (1, 1),
        },
        Del | Expire => {
            let keys = match instr.operand {
                Operand::Metric(m) => metrics.get(m).map(|mi| mi.keys.len()).unwrap_or(0),
                _ => 0,
            };
            if instr.op == Expire {
                (keys + 1, 0)
            } else {
                (keys, 0)
            }
        }
    }
}

/// Conservative bound on operand-stack depth: a linear scan that treats
/// jumps as fall-through. Control flow is forward-only and both branch
/// arms balance, so this never underestimates.
pub fn max_stack_depth(instrs: &[Instr], metrics: &[MetricInfo]) -> usize {
    let mut depth: isize = 0;
    let mut max: isize = 0;
    for instr in instrs {
        let (pops, pushes) = stack_effect(instr, metrics);
        depth -= pops as isize;
        if depth < 0 {
            depth = 0;
        }
        depth += pushes as isize;
        max = max.max(depth);
    }
    max as usize
}
