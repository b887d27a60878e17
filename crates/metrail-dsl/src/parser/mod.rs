//! Recursive descent parser for metrail programs.
//!
//! The grammar is LALR(1); one token of lookahead suffices throughout.
//! Submodules:
//!
//! - [`stream`] - token stream with lookahead and node-id allocation
//! - [`error`] - parse errors with positions
//! - [`expr`] - precedence-climbing expression parser
//! - [`stmt`] - declarations, conditionals, decorators, blocks

mod error;
mod stream;

pub use error::{ParseError, ParseErrorKind};
pub use stream::TokenStream;

mod expr;
mod stmt;

use crate::ast::SourceUnit;
use crate::lexer;
use crate::position::LineMap;

/// Parse a source file into a [`SourceUnit`].
///
/// All lex and parse errors are collected; on any error the unit is
/// withheld so the caller never checks a partial program.
pub fn parse(source: &str) -> Result<SourceUnit, Vec<ParseError>> {
    let map = LineMap::new(source);
    let (tokens, lex_errors) = lexer::lex(source);

    let mut errors: Vec<ParseError> = lex_errors
        .into_iter()
        .map(|e| ParseError::invalid(e.message, e.pos))
        .collect();

    let mut stream = TokenStream::new(&tokens, &map);
    let (stmts, parse_errors) = stmt::parse_program(&mut stream);
    errors.extend(parse_errors);

    if errors.is_empty() {
        Ok(SourceUnit {
            stmts,
            next_id: stream.ids_used(),
        })
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, ExprKind, Stmt, VarKind};

    fn parse_ok(source: &str) -> SourceUnit {
        parse(source).unwrap_or_else(|e| panic!("parse failed: {:?}", e))
    }

    #[test]
    fn test_counter_decl() {
        let unit = parse_ok("counter lines_total\n");
        assert_eq!(unit.stmts.len(), 1);
        let Stmt::VarDecl(d) = &unit.stmts[0] else {
            panic!("expected decl");
        };
        assert_eq!(d.kind, VarKind::Counter);
        assert_eq!(d.name, "lines_total");
        assert!(!d.hidden);
        assert!(d.keys.is_empty());
    }

    #[test]
    fn test_full_decl() {
        let unit = parse_ok("gauge hidden g as \"g_export\" by host, port buckets 1, 2.5\n");
        let Stmt::VarDecl(d) = &unit.stmts[0] else {
            panic!("expected decl");
        };
        assert!(d.hidden);
        assert_eq!(d.exported.as_deref(), Some("g_export"));
        assert_eq!(d.keys, vec!["host", "port"]);
        assert_eq!(d.buckets, vec![1.0, 2.5]);
    }

    #[test]
    fn test_implicit_match_cond() {
        let unit = parse_ok("counter c\n/foo/ {\n  c++\n}\n");
        assert_eq!(unit.stmts.len(), 2);
        let Stmt::Cond(cond) = &unit.stmts[1] else {
            panic!("expected cond");
        };
        assert!(matches!(cond.cond.kind, ExprKind::Pattern(_)));
        assert_eq!(cond.then.stmts.len(), 1);
        assert!(cond.else_.is_none());
    }

    #[test]
    fn test_cond_with_else() {
        let unit = parse_ok("/foo/ { } else { }\n");
        let Stmt::Cond(cond) = &unit.stmts[0] else {
            panic!("expected cond");
        };
        assert!(cond.else_.is_some());
    }

    #[test]
    fn test_relational_cond() {
        let unit = parse_ok("/t=(\\d+)/ {\n  $1 > 5 {\n  }\n}\n");
        let Stmt::Cond(outer) = &unit.stmts[0] else {
            panic!("expected cond");
        };
        let Stmt::Cond(inner) = &outer.then.stmts[0] else {
            panic!("expected nested cond");
        };
        assert!(matches!(
            inner.cond.kind,
            ExprKind::Binary {
                op: BinaryOp::Gt,
                ..
            }
        ));
    }

    #[test]
    fn test_precedence() {
        let unit = parse_ok("x = 1 + 2 * 3\n");
        let Stmt::Expr(e) = &unit.stmts[0] else {
            panic!("expected expr");
        };
        let ExprKind::Binary {
            op: BinaryOp::Assign,
            rhs,
            ..
        } = &e.kind
        else {
            panic!("expected assignment, got {:?}", e.kind);
        };
        let ExprKind::Binary {
            op: BinaryOp::Add,
            rhs: mul,
            ..
        } = &rhs.kind
        else {
            panic!("expected addition under assignment");
        };
        assert!(matches!(
            mul.kind,
            ExprKind::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn test_pattern_concat() {
        let unit = parse_ok("const PREFIX /^\\w+/\n/start/ + PREFIX + /$/ { }\n");
        let Stmt::Cond(cond) = &unit.stmts[1] else {
            panic!("expected cond");
        };
        let ExprKind::Pattern(parts) = &cond.cond.kind else {
            panic!("expected pattern");
        };
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn test_match_rhs_wrapped_as_pattern() {
        let unit = parse_ok("$1 =~ /err/ { }\n");
        let Stmt::Cond(cond) = &unit.stmts[0] else {
            panic!("expected cond");
        };
        let ExprKind::Binary {
            op: BinaryOp::Match,
            rhs,
            ..
        } = &cond.cond.kind
        else {
            panic!("expected match op");
        };
        assert!(matches!(rhs.kind, ExprKind::Pattern(_)));
    }

    #[test]
    fn test_indexed_assignment() {
        let unit = parse_ok("gauge b by host\n/x/ {\n  b[$host] = $1\n}\n");
        let Stmt::Cond(cond) = &unit.stmts[1] else {
            panic!("expected cond");
        };
        let Stmt::Expr(e) = &cond.then.stmts[0] else {
            panic!("expected expr stmt");
        };
        let ExprKind::Binary { lhs, .. } = &e.kind else {
            panic!("expected assignment");
        };
        assert!(matches!(lhs.kind, ExprKind::Indexed { .. }));
    }

    #[test]
    fn test_chained_index_flattens() {
        let unit = parse_ok("m[$1][$2]++\n");
        let Stmt::Expr(e) = &unit.stmts[0] else {
            panic!("expected expr");
        };
        let ExprKind::Postfix { expr, .. } = &e.kind else {
            panic!("expected postfix");
        };
        let ExprKind::Indexed { index, .. } = &expr.kind else {
            panic!("expected indexed");
        };
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_del_with_expiry() {
        let unit = parse_ok("del session[$1] after 5m\n");
        let Stmt::Del(d) = &unit.stmts[0] else {
            panic!("expected del");
        };
        assert_eq!(d.expiry_ns, Some(300_000_000_000));
    }

    #[test]
    fn test_decorator_roundtrip() {
        let unit = parse_ok("def tag {\n  /x/ {\n    next\n  }\n}\n@tag {\n  c++\n}\n");
        assert!(matches!(unit.stmts[0], Stmt::DecoDecl(_)));
        let Stmt::DecoApply(a) = &unit.stmts[1] else {
            panic!("expected application");
        };
        assert_eq!(a.name, "tag");
        assert!(a.resolved.is_none());
    }

    #[test]
    fn test_otherwise() {
        let unit = parse_ok("/foo/ { } otherwise { }\n");
        assert!(matches!(unit.stmts[1], Stmt::Otherwise(_)));
    }

    #[test]
    fn test_unclosed_block_message() {
        let errs = parse("/foo/ {\n  c++\n").unwrap_err();
        assert!(
            errs[0].message.contains("expecting '}' to end block"),
            "got: {}",
            errs[0].message
        );
    }

    #[test]
    fn test_multiple_errors_reported() {
        let errs = parse("counter\ncounter\n").unwrap_err();
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn test_builtin_call() {
        let unit = parse_ok("/x/ {\n  strptime($1, \"%Y-%m-%d\")\n}\n");
        let Stmt::Cond(cond) = &unit.stmts[0] else {
            panic!("expected cond");
        };
        let Stmt::Expr(e) = &cond.then.stmts[0] else {
            panic!("expected expr");
        };
        let ExprKind::Builtin { name, args } = &e.kind else {
            panic!("expected builtin call");
        };
        assert_eq!(name, "strptime");
        assert_eq!(args.len(), 2);
    }
}
