//! Statement and declaration parsing.

use crate::ast::{
    Block, CondStmt, DecoApply, DecoDecl, DelStmt, OtherwiseStmt, PatternFragment, Stmt, VarDecl,
    VarKind,
};
use crate::lexer::Token;

use super::expr::{parse_expr, parse_pattern_expr};
use super::{ParseError, TokenStream};

/// Parse a whole program. Errors are collected with statement-level
/// recovery so one bad statement doesn't hide the rest.
pub fn parse_program(stream: &mut TokenStream) -> (Vec<Stmt>, Vec<ParseError>) {
    let mut stmts = Vec::new();
    let mut errors = Vec::new();
    loop {
        stream.skip_newlines();
        if stream.at_end() {
            break;
        }
        match parse_stmt(stream) {
            Ok(stmt) => stmts.push(stmt),
            Err(err) => {
                errors.push(err);
                stream.synchronize();
            }
        }
    }
    (stmts, errors)
}

fn metric_kind(token: &Token) -> Option<VarKind> {
    match token {
        Token::Counter => Some(VarKind::Counter),
        Token::Gauge => Some(VarKind::Gauge),
        Token::Timer => Some(VarKind::Timer),
        Token::Text => Some(VarKind::Text),
        Token::Histogram => Some(VarKind::Histogram),
        _ => None,
    }
}

pub fn parse_stmt(stream: &mut TokenStream) -> Result<Stmt, ParseError> {
    match stream.peek() {
        Some(tok) if metric_kind(tok).is_some() => parse_var_decl(stream),
        Some(Token::Const) => parse_const(stream),
        Some(Token::Def) => parse_deco_decl(stream),
        Some(Token::Deco(_)) => parse_deco_apply(stream),
        Some(Token::Del) => parse_del(stream),
        Some(Token::Otherwise) => parse_otherwise(stream),
        Some(Token::Next) => {
            let pos = stream.current_position();
            stream.advance();
            expect_stmt_end(stream)?;
            Ok(Stmt::Next(pos))
        }
        Some(Token::Stop) => {
            let pos = stream.current_position();
            stream.advance();
            expect_stmt_end(stream)?;
            Ok(Stmt::Stop(pos))
        }
        _ => parse_expr_or_cond(stream),
    }
}

fn parse_var_decl(stream: &mut TokenStream) -> Result<Stmt, ParseError> {
    let mark = stream.mark();
    let Some(kind) = stream.advance().and_then(metric_kind) else {
        unreachable!("caller checked for a metric kind keyword");
    };
    let hidden = stream.eat(&Token::Hidden);
    let name = expect_ident(stream, "as the metric name")?;

    let exported = if stream.eat(&Token::As) {
        match stream.peek().cloned() {
            Some(Token::StringLit(s)) => {
                stream.advance();
                Some(s)
            }
            other => {
                return Err(ParseError::unexpected(
                    other.as_ref(),
                    "a quoted export name after 'as'",
                    stream.current_position(),
                ));
            }
        }
    } else {
        None
    };

    let mut keys = Vec::new();
    if stream.eat(&Token::By) {
        loop {
            keys.push(expect_ident(stream, "as a label key")?);
            if !stream.eat(&Token::Comma) {
                break;
            }
        }
    }

    let mut buckets = Vec::new();
    if stream.eat(&Token::Buckets) {
        loop {
            match stream.peek().cloned() {
                Some(Token::IntLit(n)) => {
                    stream.advance();
                    buckets.push(n as f64);
                }
                Some(Token::FloatLit(x)) => {
                    stream.advance();
                    buckets.push(x);
                }
                other => {
                    return Err(ParseError::unexpected(
                        other.as_ref(),
                        "a bucket boundary",
                        stream.current_position(),
                    ));
                }
            }
            if !stream.eat(&Token::Comma) {
                break;
            }
        }
    }

    expect_stmt_end(stream)?;
    Ok(Stmt::VarDecl(VarDecl {
        id: stream.next_id(),
        pos: stream.span_from(mark),
        kind,
        hidden,
        name,
        exported,
        keys,
        buckets,
    }))
}

fn parse_const(stream: &mut TokenStream) -> Result<Stmt, ParseError> {
    let mark = stream.mark();
    stream.advance();
    let name = expect_ident(stream, "as the pattern constant name")?;
    let expr = parse_pattern_expr(stream)?;
    expect_stmt_end(stream)?;
    Ok(Stmt::PatternFragment(PatternFragment {
        id: stream.next_id(),
        pos: stream.span_from(mark),
        name,
        expr,
    }))
}

fn parse_deco_decl(stream: &mut TokenStream) -> Result<Stmt, ParseError> {
    let mark = stream.mark();
    stream.advance();
    let name = expect_ident(stream, "as the decorator name")?;
    let block = parse_block(stream)?;
    Ok(Stmt::DecoDecl(DecoDecl {
        id: stream.next_id(),
        pos: stream.span_from(mark),
        name,
        block,
    }))
}

fn parse_deco_apply(stream: &mut TokenStream) -> Result<Stmt, ParseError> {
    let mark = stream.mark();
    let name = match stream.advance() {
        Some(Token::Deco(name)) => name.clone(),
        _ => unreachable!("caller checked for decorator token"),
    };
    let block = parse_block(stream)?;
    Ok(Stmt::DecoApply(DecoApply {
        id: stream.next_id(),
        pos: stream.span_from(mark),
        name,
        block,
        resolved: None,
    }))
}

fn parse_del(stream: &mut TokenStream) -> Result<Stmt, ParseError> {
    let mark = stream.mark();
    stream.advance();
    let target = parse_expr(stream)?;
    let expiry_ns = if stream.eat(&Token::After) {
        match stream.peek().cloned() {
            Some(Token::Duration(ns)) => {
                stream.advance();
                Some(ns)
            }
            other => {
                return Err(ParseError::unexpected(
                    other.as_ref(),
                    "a duration after 'after'",
                    stream.current_position(),
                ));
            }
        }
    } else {
        None
    };
    expect_stmt_end(stream)?;
    Ok(Stmt::Del(DelStmt {
        pos: stream.span_from(mark),
        target,
        expiry_ns,
    }))
}

fn parse_otherwise(stream: &mut TokenStream) -> Result<Stmt, ParseError> {
    let mark = stream.mark();
    stream.advance();
    let block = parse_block(stream)?;
    Ok(Stmt::Otherwise(OtherwiseStmt {
        pos: stream.span_from(mark),
        block,
    }))
}

/// An expression statement, or a conditional if a block follows.
fn parse_expr_or_cond(stream: &mut TokenStream) -> Result<Stmt, ParseError> {
    let mark = stream.mark();
    let expr = parse_expr(stream)?;
    if stream.check(&Token::LBrace) {
        let then = parse_block(stream)?;
        let else_ = if stream.eat(&Token::Else) {
            Some(parse_block(stream)?)
        } else {
            None
        };
        return Ok(Stmt::Cond(CondStmt {
            pos: stream.span_from(mark),
            cond: expr,
            then,
            else_,
        }));
    }
    expect_stmt_end(stream)?;
    Ok(Stmt::Expr(expr))
}

pub fn parse_block(stream: &mut TokenStream) -> Result<Block, ParseError> {
    let mark = stream.mark();
    stream.expect(Token::LBrace, "to start block")?;
    let mut stmts = Vec::new();
    loop {
        stream.skip_newlines();
        if stream.check(&Token::RBrace) || stream.at_end() {
            break;
        }
        stmts.push(parse_stmt(stream)?);
    }
    stream.expect(Token::RBrace, "to end block")?;
    Ok(Block {
        id: stream.next_id(),
        pos: stream.span_from(mark),
        stmts,
    })
}

fn expect_ident(stream: &mut TokenStream, context: &str) -> Result<String, ParseError> {
    match stream.peek().cloned() {
        Some(Token::Ident(name)) => {
            stream.advance();
            Ok(name)
        }
        other => Err(ParseError::unexpected(
            other.as_ref(),
            &format!("an identifier {}", context),
            stream.current_position(),
        )),
    }
}

/// A statement ends at a newline, a closing brace, or end of input.
fn expect_stmt_end(stream: &mut TokenStream) -> Result<(), ParseError> {
    match stream.peek() {
        None | Some(Token::RBrace) => Ok(()),
        Some(Token::Newline) => {
            stream.advance();
            Ok(())
        }
        other => Err(ParseError::unexpected(
            other,
            "end of statement",
            stream.current_position(),
        )),
    }
}
