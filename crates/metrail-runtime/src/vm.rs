//! The bytecode virtual machine.
//!
//! One VM executes one compiled program against each log line. The
//! operand stack holds tagged values but the compiler has already proved
//! the types; the match arms here assert that discipline and surface any
//! violation as a counted runtime error rather than a crash.
//!
//! Runtime errors (bad strptime input, strtol on a non-number, division
//! by zero, an unavailable capture group) abandon the current line,
//! increment the program's error counter and log the source position of
//! the offending instruction. They never stop the VM; only `stop` or
//! shutdown does.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use tracing::warn;

use metrail_compiler::program::{CmpOp, Opcode, Operand, Program};
use metrail_metrics::{Datum, DatumValue, Metric};

use crate::line::LogLine;

/// A value on the operand stack.
#[derive(Debug, Clone)]
enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    /// Metric-table index pushed by `mload`.
    Metric(usize),
    /// Datum handle pushed by `dload`.
    Datum(Arc<Datum>),
}

type OpResult<T> = Result<T, String>;

fn pop(stack: &mut Vec<Value>) -> OpResult<Value> {
    stack.pop().ok_or_else(|| "operand stack underflow".to_string())
}

fn as_int(v: Value) -> OpResult<i64> {
    match v {
        Value::Int(n) => Ok(n),
        Value::Bool(b) => Ok(b as i64),
        other => {
            debug_assert!(false, "expected int on stack, got {:?}", other);
            Err(format!("expected an integer operand, got {:?}", other))
        }
    }
}

fn as_float(v: Value) -> OpResult<f64> {
    match v {
        Value::Float(x) => Ok(x),
        Value::Int(n) => Ok(n as f64),
        other => {
            debug_assert!(false, "expected float on stack, got {:?}", other);
            Err(format!("expected a float operand, got {:?}", other))
        }
    }
}

fn as_str(v: Value) -> OpResult<String> {
    match v {
        Value::Str(s) => Ok(s),
        other => {
            debug_assert!(false, "expected string on stack, got {:?}", other);
            Err(format!("expected a string operand, got {:?}", other))
        }
    }
}

fn as_datum(v: Value) -> OpResult<Arc<Datum>> {
    match v {
        Value::Datum(d) => Ok(d),
        other => {
            debug_assert!(false, "expected datum on stack, got {:?}", other);
            Err(format!("expected a datum operand, got {:?}", other))
        }
    }
}

fn truthy(v: Value) -> OpResult<bool> {
    match v {
        Value::Bool(b) => Ok(b),
        Value::Int(n) => Ok(n != 0),
        Value::Float(x) => Ok(x != 0.0),
        other => {
            debug_assert!(false, "expected condition on stack, got {:?}", other);
            Err(format!("expected a condition operand, got {:?}", other))
        }
    }
}

/// A virtual machine bound to one compiled program.
pub struct Vm {
    prog: Arc<Program>,
    metrics: Vec<Arc<Metric>>,
    /// Per-program runtime error counter, when owned by a loader.
    error_counter: Option<Arc<Datum>>,
    stack: Vec<Value>,
    errors: u64,
    terminated: bool,
}

impl Vm {
    pub fn new(
        prog: Arc<Program>,
        metrics: Vec<Arc<Metric>>,
        error_counter: Option<Arc<Datum>>,
    ) -> Self {
        let stack = Vec::with_capacity(prog.max_stack);
        Self {
            prog,
            metrics,
            error_counter,
            stack,
            errors: 0,
            terminated: false,
        }
    }

    /// Set when the program executed `stop`; the owner unloads the VM.
    pub fn terminated(&self) -> bool {
        self.terminated
    }

    /// Runtime errors seen so far.
    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.prog
    }

    /// Execute the program against one log line.
    pub fn process_line(&mut self, line: &LogLine) {
        if let Err((message, pc)) = self.run(line) {
            let pos = self.prog.instrs[pc].pos;
            self.errors += 1;
            if let Some(counter) = &self.error_counter {
                counter.add_int(1, Utc::now());
            }
            warn!(
                program = %self.prog.name,
                line = pos.line,
                col = pos.start_col,
                "runtime error: {}",
                message
            );
        }
    }

    fn run(&mut self, line: &LogLine) -> Result<(), (String, usize)> {
        let prog = Arc::clone(&self.prog);
        let mut stack = std::mem::take(&mut self.stack);
        stack.clear();

        // Per-line frame state.
        let mut matches: Vec<Option<Vec<Option<String>>>> = vec![None; prog.regexes.len()];
        let mut matched = false;
        let mut time = line.ts;
        let mut pc = 0usize;

        let result = loop {
            if pc >= prog.instrs.len() {
                break Ok(());
            }
            let at = pc;
            let instr = &prog.instrs[pc];
            pc += 1;
            let step = self.step(
                instr.op,
                &instr.operand,
                &prog,
                line,
                &mut stack,
                &mut matches,
                &mut matched,
                &mut time,
                &mut pc,
            );
            match step {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(message) => break Err((message, at)),
            }
        };

        self.stack = stack;
        result
    }

    /// Execute one instruction. Returns false to halt the line.
    #[allow(clippy::too_many_arguments)]
    fn step(
        &mut self,
        op: Opcode,
        operand: &Operand,
        prog: &Program,
        line: &LogLine,
        stack: &mut Vec<Value>,
        matches: &mut [Option<Vec<Option<String>>>],
        matched: &mut bool,
        time: &mut DateTime<Utc>,
        pc: &mut usize,
    ) -> OpResult<bool> {
        match op {
            Opcode::PushInt => {
                let Operand::Int(n) = operand else {
                    return Err("push_int without integer operand".into());
                };
                stack.push(Value::Int(*n));
            }
            Opcode::PushFloat => {
                let Operand::Float(x) = operand else {
                    return Err("push_float without float operand".into());
                };
                stack.push(Value::Float(*x));
            }
            Opcode::PushStr => {
                let Operand::Str(k) = operand else {
                    return Err("push_str without string operand".into());
                };
                stack.push(Value::Str(prog.strs[*k].clone()));
            }
            Opcode::Match => {
                let Operand::Regex(k) = operand else {
                    return Err("match without regex operand".into());
                };
                let ok = capture(&prog.regexes[*k], &line.text, &mut matches[*k]);
                *matched = *matched || ok;
                stack.push(Value::Bool(ok));
            }
            Opcode::Smatch => {
                let Operand::Regex(k) = operand else {
                    return Err("smatch without regex operand".into());
                };
                let s = as_str(pop(stack)?)?;
                let ok = capture(&prog.regexes[*k], &s, &mut matches[*k]);
                *matched = *matched || ok;
                stack.push(Value::Bool(ok));
            }
            Opcode::Otherwise => stack.push(Value::Bool(!*matched)),
            Opcode::SetMatched => {
                let Operand::Bool(b) = operand else {
                    return Err("setmatched without boolean operand".into());
                };
                *matched = *b;
            }
            Opcode::Jmp => {
                let Operand::Addr(a) = operand else {
                    return Err("jmp without address".into());
                };
                *pc = *a;
            }
            Opcode::Jnm => {
                let Operand::Addr(a) = operand else {
                    return Err("jnm without address".into());
                };
                if !truthy(pop(stack)?)? {
                    *pc = *a;
                }
            }
            Opcode::CaprefStr | Opcode::CaprefInt | Opcode::CaprefFloat => {
                let Operand::Capture { pattern, group } = operand else {
                    return Err("capref without capture operand".into());
                };
                let text = matches[*pattern]
                    .as_ref()
                    .and_then(|groups| groups.get(*group).cloned().flatten())
                    .ok_or_else(|| format!("capture group {} not available", group))?;
                match op {
                    Opcode::CaprefStr => stack.push(Value::Str(text)),
                    Opcode::CaprefInt => {
                        let n: i64 = text
                            .parse()
                            .map_err(|_| format!("couldn't parse {:?} as an integer", text))?;
                        stack.push(Value::Int(n));
                    }
                    _ => {
                        let x: f64 = text
                            .parse()
                            .map_err(|_| format!("couldn't parse {:?} as a float", text))?;
                        stack.push(Value::Float(x));
                    }
                }
            }
            Opcode::Icmp | Opcode::Fcmp | Opcode::Scmp => {
                let Operand::Cmp(cmp) = operand else {
                    return Err("comparison without operator operand".into());
                };
                let b = pop(stack)?;
                let a = pop(stack)?;
                let ok = match op {
                    Opcode::Icmp => icmp(*cmp, as_int(a)?, as_int(b)?),
                    Opcode::Fcmp => fcmp(*cmp, as_float(a)?, as_float(b)?),
                    _ => scmp(*cmp, &as_str(a)?, &as_str(b)?),
                };
                stack.push(Value::Bool(ok));
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Pow => {
                let b = pop(stack)?;
                let a = pop(stack)?;
                stack.push(arith(op, a, b)?);
            }
            Opcode::Neg => match pop(stack)? {
                Value::Int(n) => stack.push(Value::Int(-n)),
                Value::Float(x) => stack.push(Value::Float(-x)),
                other => return Err(format!("cannot negate {:?}", other)),
            },
            Opcode::Not => {
                let t = truthy(pop(stack)?)?;
                stack.push(Value::Bool(!t));
            }
            Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Shl | Opcode::Shr => {
                let b = as_int(pop(stack)?)?;
                let a = as_int(pop(stack)?)?;
                let r = match op {
                    Opcode::And => a & b,
                    Opcode::Or => a | b,
                    Opcode::Xor => a ^ b,
                    Opcode::Shl => a.wrapping_shl(b as u32 & 63),
                    _ => a.wrapping_shr(b as u32 & 63),
                };
                stack.push(Value::Int(r));
            }
            Opcode::Concat => {
                let b = as_str(pop(stack)?)?;
                let mut a = as_str(pop(stack)?)?;
                a.push_str(&b);
                stack.push(Value::Str(a));
            }
            Opcode::I2f => {
                let n = as_int(pop(stack)?)?;
                stack.push(Value::Float(n as f64));
            }
            Opcode::I2s => {
                let n = as_int(pop(stack)?)?;
                stack.push(Value::Str(n.to_string()));
            }
            Opcode::F2i => {
                let x = as_float(pop(stack)?)?;
                stack.push(Value::Int(x as i64));
            }
            Opcode::F2s => {
                let x = as_float(pop(stack)?)?;
                stack.push(Value::Str(x.to_string()));
            }
            Opcode::S2i => {
                let s = as_str(pop(stack)?)?;
                let n: i64 = s
                    .trim()
                    .parse()
                    .map_err(|_| format!("couldn't parse {:?} as an integer", s))?;
                stack.push(Value::Int(n));
            }
            Opcode::S2f => {
                let s = as_str(pop(stack)?)?;
                let x: f64 = s
                    .trim()
                    .parse()
                    .map_err(|_| format!("couldn't parse {:?} as a float", s))?;
                stack.push(Value::Float(x));
            }
            Opcode::S2b => {
                let s = as_str(pop(stack)?)?;
                stack.push(Value::Bool(s.eq_ignore_ascii_case("true")));
            }
            Opcode::Timestamp => stack.push(Value::Int(time.timestamp())),
            Opcode::Settime => {
                let secs = as_int(pop(stack)?)?;
                *time = Utc
                    .timestamp_opt(secs, 0)
                    .single()
                    .ok_or_else(|| format!("settime: {} is out of range", secs))?;
            }
            Opcode::Strptime => {
                let fmt = as_str(pop(stack)?)?;
                let value = as_str(pop(stack)?)?;
                *time = parse_time(&value, &fmt)
                    .ok_or_else(|| format!("strptime: couldn't parse {:?} with {:?}", value, fmt))?;
            }
            Opcode::Strtol => {
                let base = as_int(pop(stack)?)?;
                let s = as_str(pop(stack)?)?;
                if !(2..=36).contains(&base) {
                    return Err(format!("strtol: invalid base {}", base));
                }
                let n = i64::from_str_radix(s.trim(), base as u32)
                    .map_err(|_| format!("strtol: couldn't parse {:?} in base {}", s, base))?;
                stack.push(Value::Int(n));
            }
            Opcode::Tolower => {
                let s = as_str(pop(stack)?)?;
                stack.push(Value::Str(s.to_lowercase()));
            }
            Opcode::Len => {
                let s = as_str(pop(stack)?)?;
                stack.push(Value::Int(s.chars().count() as i64));
            }
            Opcode::Getfilename => {
                stack.push(Value::Str(line.path.display().to_string()));
            }
            Opcode::Subst => {
                let Operand::Regex(k) = operand else {
                    return Err("subst without regex operand".into());
                };
                let s = as_str(pop(stack)?)?;
                let repl = as_str(pop(stack)?)?;
                let out = prog.regexes[*k].replace_all(&s, repl.as_str());
                stack.push(Value::Str(out.into_owned()));
            }
            Opcode::Replace => {
                let s = as_str(pop(stack)?)?;
                let repl = as_str(pop(stack)?)?;
                let old = as_str(pop(stack)?)?;
                stack.push(Value::Str(s.replace(&old, &repl)));
            }
            Opcode::Mload => {
                let Operand::Metric(k) = operand else {
                    return Err("mload without metric operand".into());
                };
                stack.push(Value::Metric(*k));
            }
            Opcode::Dload => {
                let Operand::Keys(n) = operand else {
                    return Err("dload without key count".into());
                };
                let keys = pop_keys(stack, *n)?;
                let k = match pop(stack)? {
                    Value::Metric(k) => k,
                    other => return Err(format!("expected a metric handle, got {:?}", other)),
                };
                let datum = self.metrics[k].datum(&keys, *time);
                stack.push(Value::Datum(datum));
            }
            Opcode::Dget => {
                let datum = as_datum(pop(stack)?)?;
                let v = match datum.value() {
                    DatumValue::Int(n) => Value::Int(n),
                    DatumValue::Float(x) => Value::Float(x),
                    DatumValue::Text(s) => Value::Str(s),
                    DatumValue::Buckets(b) => Value::Float(b.sum),
                };
                stack.push(v);
            }
            Opcode::Inc => as_datum(pop(stack)?)?.add_int(1, *time),
            Opcode::Dec => as_datum(pop(stack)?)?.add_int(-1, *time),
            Opcode::Iadd => {
                let v = as_int(pop(stack)?)?;
                as_datum(pop(stack)?)?.add_int(v, *time);
            }
            Opcode::Fadd => {
                let v = as_float(pop(stack)?)?;
                as_datum(pop(stack)?)?.add_float(v, *time);
            }
            Opcode::Iset => {
                let v = as_int(pop(stack)?)?;
                as_datum(pop(stack)?)?.set_int(v, *time);
            }
            Opcode::Fset => {
                let v = as_float(pop(stack)?)?;
                as_datum(pop(stack)?)?.set_float(v, *time);
            }
            Opcode::Sset => {
                let v = as_str(pop(stack)?)?;
                as_datum(pop(stack)?)?.set_text(v, *time);
            }
            Opcode::Del => {
                let Operand::Metric(k) = operand else {
                    return Err("del without metric operand".into());
                };
                let keys = pop_keys(stack, self.metrics[*k].keys.len())?;
                self.metrics[*k].remove_datum(&keys);
            }
            Opcode::Expire => {
                let Operand::Metric(k) = operand else {
                    return Err("expire without metric operand".into());
                };
                let ns = as_int(pop(stack)?)?;
                let keys = pop_keys(stack, self.metrics[*k].keys.len())?;
                let expiry = std::time::Duration::from_nanos(ns.max(0) as u64);
                self.metrics[*k].set_expiry(&keys, expiry);
            }
            Opcode::Stop => {
                self.terminated = true;
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Run a regex, storing owned capture texts for later capref reads.
fn capture(re: &regex::Regex, text: &str, slot: &mut Option<Vec<Option<String>>>) -> bool {
    match re.captures(text) {
        Some(caps) => {
            *slot = Some(
                (0..caps.len())
                    .map(|i| caps.get(i).map(|m| m.as_str().to_string()))
                    .collect(),
            );
            true
        }
        None => {
            *slot = None;
            false
        }
    }
}

fn pop_keys(stack: &mut Vec<Value>, n: usize) -> OpResult<Vec<String>> {
    let mut keys = Vec::with_capacity(n);
    for _ in 0..n {
        keys.push(as_str(pop(stack)?)?);
    }
    keys.reverse();
    Ok(keys)
}

fn arith(op: Opcode, a: Value, b: Value) -> OpResult<Value> {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => {
            let r = match op {
                Opcode::Add => a.wrapping_add(b),
                Opcode::Sub => a.wrapping_sub(b),
                Opcode::Mul => a.wrapping_mul(b),
                Opcode::Div => {
                    if b == 0 {
                        return Err("division by zero".into());
                    }
                    a.wrapping_div(b)
                }
                Opcode::Mod => {
                    if b == 0 {
                        return Err("division by zero".into());
                    }
                    a.wrapping_rem(b)
                }
                _ => {
                    if b < 0 {
                        0
                    } else {
                        a.wrapping_pow(b.min(u32::MAX as i64) as u32)
                    }
                }
            };
            Ok(Value::Int(r))
        }
        (a, b) => {
            let a = as_float(a)?;
            let b = as_float(b)?;
            let r = match op {
                Opcode::Add => a + b,
                Opcode::Sub => a - b,
                Opcode::Mul => a * b,
                Opcode::Div => {
                    if b == 0.0 {
                        return Err("division by zero".into());
                    }
                    a / b
                }
                Opcode::Mod => a % b,
                _ => a.powf(b),
            };
            Ok(Value::Float(r))
        }
    }
}

fn icmp(op: CmpOp, a: i64, b: i64) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
    }
}

fn fcmp(op: CmpOp, a: f64, b: f64) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
    }
}

fn scmp(op: CmpOp, a: &str, b: &str) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
    }
}

/// Parse a timestamp with a strftime-style format, tolerating formats
/// that carry no time or no zone.
fn parse_time(value: &str, fmt: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_str(value, fmt) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, fmt) {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}
