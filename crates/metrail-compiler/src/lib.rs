//! Compiler for metrail programs: semantic analysis, type inference and
//! bytecode generation over the AST from `metrail-dsl`.
//!
//! The pipeline is linear: lex → parse (in `metrail-dsl`) → [`checker`]
//! → [`codegen`]. All compile errors aggregate into a list of
//! [`diag::Diagnostic`]s with source positions.

pub mod checker;
pub mod codegen;
pub mod diag;
pub mod program;
pub mod symtab;
pub mod types;

pub use checker::{check, Analysis};
pub use diag::Diagnostic;
pub use program::{CmpOp, Instr, MetricInfo, MetricType, Opcode, Operand, Program};
pub use types::{Type, TypeCtx};

/// Compile a program source to bytecode, or every diagnostic found.
pub fn compile(name: &str, source: &str) -> Result<Program, Vec<Diagnostic>> {
    let mut unit = metrail_dsl::parse(source).map_err(|errs| {
        errs.into_iter()
            .map(|e| Diagnostic::new(e.pos, e.message))
            .collect::<Vec<_>>()
    })?;
    let analysis = checker::check(&mut unit)?;
    let program = codegen::emit(name, source, &unit, &analysis);
    tracing::debug!(
        name,
        instructions = program.instrs.len(),
        regexes = program.regexes.len(),
        metrics = program.metrics.len(),
        max_stack = program.max_stack,
        "compiled program"
    );
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::program::{Opcode, Operand};
    use super::*;

    fn ops(p: &Program) -> Vec<Opcode> {
        p.instrs.iter().map(|i| i.op).collect()
    }

    #[test]
    fn test_counter_increment_program() {
        let p = compile("t", "counter lines_total\n/.*/ {\n  lines_total++\n}\n").unwrap();
        assert_eq!(
            ops(&p),
            vec![
                Opcode::Match,
                Opcode::Jnm,
                Opcode::SetMatched,
                Opcode::Mload,
                Opcode::Dload,
                Opcode::Inc,
                Opcode::SetMatched,
            ]
        );
        // The jump lands past the end of the body.
        assert_eq!(p.instrs[1].operand, Operand::Addr(7));
        assert_eq!(p.metrics.len(), 1);
        assert_eq!(p.regexes.len(), 1);
        assert_eq!(p.max_stack, 1);
    }

    #[test]
    fn test_compile_deterministic() {
        let src = "counter c by x\n/v=(\\d+) n=(\\w+)/ {\n  c[$2] += $1\n}\n";
        let a = compile("t", src).unwrap();
        let b = compile("t", src).unwrap();
        assert_eq!(a.instrs, b.instrs);
        assert_eq!(a.strs, b.strs);
        assert_eq!(
            a.regexes.iter().map(|r| r.as_str()).collect::<Vec<_>>(),
            b.regexes.iter().map(|r| r.as_str()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_capref_typing_flows_to_opcodes() {
        let p = compile(
            "t",
            "gauge bytes by host\n/host=(?P<h>\\S+) bytes=(?P<n>\\d+)/ {\n  bytes[$h] = $n\n}\n",
        )
        .unwrap();
        // $n inferred Int, so the capture read is typed.
        assert!(p.instrs.iter().any(|i| i.op == Opcode::CaprefInt));
        assert!(p.instrs.iter().any(|i| i.op == Opcode::CaprefStr));
        assert!(p.instrs.iter().any(|i| i.op == Opcode::Iset));
    }

    #[test]
    fn test_float_widening_emits_conversion() {
        let p = compile(
            "t",
            "gauge ratio\n/r=(\\d+\\.\\d+) n=(\\d+)/ {\n  ratio = $1 + $2\n}\n",
        )
        .unwrap();
        assert!(p.instrs.iter().any(|i| i.op == Opcode::I2f));
        assert!(p.instrs.iter().any(|i| i.op == Opcode::Fset));
    }

    #[test]
    fn test_type_error_reported_on_counter_string_assign() {
        let errs = compile("t", "counter c\n/(\\d+) (\\w+)/ {\n  c = $1 + $2\n}\n").unwrap_err();
        assert!(
            errs.iter().any(|d| d.message.contains("counter `c'")),
            "diags: {:?}",
            errs
        );
    }

    #[test]
    fn test_unresolved_identifier() {
        let errs = compile("t", "/x/ {\n  nosuch++\n}\n").unwrap_err();
        assert!(errs[0].message.contains("not defined"));
    }

    #[test]
    fn test_duplicate_declaration() {
        let errs = compile("t", "counter c\ncounter c\n").unwrap_err();
        assert!(errs[0].message.contains("redefinition"));
        assert_eq!(errs[0].pos.unwrap().line, 2);
    }

    #[test]
    fn test_histogram_requires_buckets() {
        let errs = compile("t", "histogram h\n").unwrap_err();
        assert!(errs[0].message.contains("buckets"));
    }

    #[test]
    fn test_bad_regex_positioned() {
        let errs = compile("t", "counter c\n/(unclosed/ {\n  c++\n}\n").unwrap_err();
        assert!(errs[0].message.contains("invalid regular expression"));
        assert_eq!(errs[0].pos.unwrap().line, 2);
    }

    #[test]
    fn test_capref_out_of_range() {
        let errs = compile("t", "counter c\n/(\\d+)/ {\n  c = $2\n}\n").unwrap_err();
        assert!(errs[0].message.contains("$2"));
    }

    #[test]
    fn test_del_requires_indexed_target() {
        let errs = compile("t", "counter c\ndel c\n").unwrap_err();
        assert!(errs[0].message.contains("indexed"));
    }

    #[test]
    fn test_strptime_requires_literal_format() {
        let errs = compile(
            "t",
            "/t=(\\S+) f=(\\S+)/ {\n  strptime($1, $2)\n}\n",
        )
        .unwrap_err();
        assert!(errs[0].message.contains("literal format string"));
    }

    #[test]
    fn test_decorator_expansion() {
        let p = compile(
            "t",
            "counter c\ndef prefixed {\n  /^x/ {\n    next\n  }\n}\n@prefixed {\n  /(\\d+)/ {\n    c += $1\n  }\n}\n",
        )
        .unwrap();
        // Two matches: the decorator's and the wrapped one.
        let matches = p.instrs.iter().filter(|i| i.op == Opcode::Match).count();
        assert_eq!(matches, 2);
    }

    #[test]
    fn test_next_outside_decorator_rejected() {
        let errs = compile("t", "next\n").unwrap_err();
        assert!(errs[0].message.contains("decorator"));
    }

    #[test]
    fn test_pattern_fragment_inlined() {
        let p = compile(
            "t",
            "counter c\nconst PREFIX /^\\w+ /\nconst LINE PREFIX + /(\\d+)/\nLINE {\n  c += $1\n}\n",
        )
        .unwrap();
        assert_eq!(p.regexes.len(), 1);
        assert_eq!(p.regexes[0].as_str(), "^\\w+ (\\d+)");
    }

    #[test]
    fn test_fragment_first_concat() {
        let p = compile(
            "t",
            "counter c\nconst TS /^\\d+ /\nTS + /(\\w+)/ {\n  c++\n}\n",
        )
        .unwrap();
        assert_eq!(p.regexes.len(), 1);
        assert_eq!(p.regexes[0].as_str(), "^\\d+ (\\w+)");
    }

    #[test]
    fn test_otherwise_emits_guard() {
        let p = compile(
            "t",
            "counter m\ncounter f\n/foo/ {\n  m++\n}\notherwise {\n  f++\n}\n",
        )
        .unwrap();
        assert!(p.instrs.iter().any(|i| i.op == Opcode::Otherwise));
        let setmatched = p
            .instrs
            .iter()
            .filter(|i| i.op == Opcode::SetMatched)
            .count();
        assert_eq!(setmatched, 4);
    }

    #[test]
    fn test_del_with_expiry_pushes_duration() {
        let p = compile(
            "t",
            "gauge session by id\n/logout id=(\\S+)/ {\n  del session[$1] after 5m\n}\n",
        )
        .unwrap();
        let expire = p
            .instrs
            .iter()
            .find(|i| i.op == Opcode::Expire)
            .expect("expire op");
        assert_eq!(expire.operand, Operand::Metric(0));
        assert!(p
            .instrs
            .iter()
            .any(|i| i.op == Opcode::PushInt && i.operand == Operand::Int(300_000_000_000)));
    }

    #[test]
    fn test_timer_metric_compiles() {
        let p = compile("t", "timer dur\n/took (\\d+)ms/ {\n  dur = $1\n}\n").unwrap();
        assert!(p.instrs.iter().any(|i| i.op == Opcode::Iset));
    }

    #[test]
    fn test_subst_with_fragment_needle() {
        let p = compile(
            "t",
            "const DASHES /-+/\ntext tidy\n/x=(\\S+)/ {\n  tidy = subst(DASHES, \"_\", $1)\n}\n",
        )
        .unwrap();
        // The fragment compiles like an inline pattern literal would.
        let subst = p
            .instrs
            .iter()
            .find(|i| i.op == Opcode::Subst)
            .expect("subst op");
        let Operand::Regex(k) = subst.operand else {
            panic!("subst should carry a regex operand");
        };
        assert_eq!(p.regexes[k].as_str(), "-+");
    }

    #[test]
    fn test_string_concat_compiles() {
        let p = compile(
            "t",
            "text last\n/(\\w+) (\\w+)/ {\n  last = $1 + \" \" + $2\n}\n",
        )
        .unwrap();
        assert!(p.instrs.iter().any(|i| i.op == Opcode::Concat));
        assert!(p.instrs.iter().any(|i| i.op == Opcode::Sset));
    }
}
