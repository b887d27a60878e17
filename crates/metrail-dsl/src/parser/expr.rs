//! Expression parsing: precedence climbing over the token stream.

use crate::ast::{BinaryOp, Expr, ExprKind, PostfixOp, UnaryOp};
use crate::lexer::Token;

use super::{ParseError, TokenStream};

/// Operator associativity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Assoc {
    Left,
    Right,
}

/// Binary operator metadata: precedence (higher binds tighter),
/// associativity and AST operator. Single source of truth for the
/// expression grammar.
fn binary_op_info(token: &Token) -> Option<(u8, Assoc, BinaryOp)> {
    match token {
        Token::Assign => Some((10, Assoc::Right, BinaryOp::Assign)),
        Token::AddAssign => Some((10, Assoc::Right, BinaryOp::AddAssign)),
        Token::MatchRe => Some((20, Assoc::Left, BinaryOp::Match)),
        Token::NotMatchRe => Some((20, Assoc::Left, BinaryOp::NotMatch)),
        Token::OrOr => Some((30, Assoc::Left, BinaryOp::Or)),
        Token::AndAnd => Some((40, Assoc::Left, BinaryOp::And)),
        Token::BitOr => Some((50, Assoc::Left, BinaryOp::BitOr)),
        Token::BitXor => Some((51, Assoc::Left, BinaryOp::BitXor)),
        Token::BitAnd => Some((52, Assoc::Left, BinaryOp::BitAnd)),
        Token::EqEq => Some((60, Assoc::Left, BinaryOp::Eq)),
        Token::NotEq => Some((60, Assoc::Left, BinaryOp::Ne)),
        Token::Lt => Some((60, Assoc::Left, BinaryOp::Lt)),
        Token::LtEq => Some((60, Assoc::Left, BinaryOp::Le)),
        Token::Gt => Some((60, Assoc::Left, BinaryOp::Gt)),
        Token::GtEq => Some((60, Assoc::Left, BinaryOp::Ge)),
        Token::Shl => Some((70, Assoc::Left, BinaryOp::Shl)),
        Token::Shr => Some((70, Assoc::Left, BinaryOp::Shr)),
        Token::Plus => Some((80, Assoc::Left, BinaryOp::Add)),
        Token::Minus => Some((80, Assoc::Left, BinaryOp::Sub)),
        Token::Star => Some((90, Assoc::Left, BinaryOp::Mul)),
        Token::Slash => Some((90, Assoc::Left, BinaryOp::Div)),
        Token::Percent => Some((90, Assoc::Left, BinaryOp::Mod)),
        Token::Pow => Some((100, Assoc::Right, BinaryOp::Pow)),
        _ => None,
    }
}

pub fn parse_expr(stream: &mut TokenStream) -> Result<Expr, ParseError> {
    parse_pratt(stream, 0)
}

fn parse_pratt(stream: &mut TokenStream, min_prec: u8) -> Result<Expr, ParseError> {
    let mark = stream.mark();
    let mut left = parse_prefix(stream)?;

    while let Some(token) = stream.peek() {
        let Some((prec, assoc, op)) = binary_op_info(token) else {
            break;
        };
        if prec < min_prec {
            break;
        }
        stream.advance();

        let next_prec = if assoc == Assoc::Left { prec + 1 } else { prec };
        let mut right = parse_pratt(stream, next_prec)?;

        // The right side of a match operator is a pattern context.
        if matches!(op, BinaryOp::Match | BinaryOp::NotMatch)
            && !matches!(right.kind, ExprKind::Pattern(_))
        {
            right = Expr {
                id: stream.next_id(),
                pos: right.pos,
                kind: ExprKind::Pattern(vec![right]),
            };
        }

        left = Expr {
            id: stream.next_id(),
            pos: stream.span_from(mark),
            kind: ExprKind::Binary {
                op,
                lhs: Box::new(left),
                rhs: Box::new(right),
            },
        };
    }

    Ok(left)
}

fn parse_prefix(stream: &mut TokenStream) -> Result<Expr, ParseError> {
    let mark = stream.mark();
    let op = match stream.peek() {
        Some(Token::Not) => Some(UnaryOp::Not),
        Some(Token::Minus) => Some(UnaryOp::Neg),
        _ => None,
    };
    if let Some(op) = op {
        stream.advance();
        let operand = parse_prefix(stream)?;
        return Ok(Expr {
            id: stream.next_id(),
            pos: stream.span_from(mark),
            kind: ExprKind::Unary {
                op,
                expr: Box::new(operand),
            },
        });
    }
    parse_postfix(stream)
}

fn parse_postfix(stream: &mut TokenStream) -> Result<Expr, ParseError> {
    let mark = stream.mark();
    let mut expr = parse_primary(stream)?;

    loop {
        match stream.peek() {
            Some(Token::PlusPlus) | Some(Token::MinusMinus) => {
                let op = if matches!(stream.peek(), Some(Token::PlusPlus)) {
                    PostfixOp::Inc
                } else {
                    PostfixOp::Dec
                };
                stream.advance();
                expr = Expr {
                    id: stream.next_id(),
                    pos: stream.span_from(mark),
                    kind: ExprKind::Postfix {
                        op,
                        expr: Box::new(expr),
                    },
                };
            }
            Some(Token::LBracket) => {
                stream.advance();
                let mut index = Vec::new();
                loop {
                    index.push(parse_expr(stream)?);
                    if !stream.eat(&Token::Comma) {
                        break;
                    }
                }
                stream.expect(Token::RBracket, "to close index")?;
                let pos = stream.span_from(mark);
                // `m[$1][$2]` flattens into one key list.
                expr = match expr.kind {
                    ExprKind::Indexed {
                        base,
                        index: mut existing,
                    } => {
                        existing.extend(index);
                        Expr {
                            id: stream.next_id(),
                            pos,
                            kind: ExprKind::Indexed {
                                base,
                                index: existing,
                            },
                        }
                    }
                    _ => Expr {
                        id: stream.next_id(),
                        pos,
                        kind: ExprKind::Indexed {
                            base: Box::new(expr),
                            index,
                        },
                    },
                };
            }
            _ => break,
        }
    }

    Ok(expr)
}

fn parse_primary(stream: &mut TokenStream) -> Result<Expr, ParseError> {
    let mark = stream.mark();
    let pos = stream.current_position();
    let kind = match stream.peek().cloned() {
        Some(Token::IntLit(n)) => {
            stream.advance();
            ExprKind::Int(n)
        }
        Some(Token::FloatLit(x)) => {
            stream.advance();
            ExprKind::Float(x)
        }
        // Duration literals evaluate as nanosecond integers.
        Some(Token::Duration(ns)) => {
            stream.advance();
            ExprKind::Int(ns)
        }
        Some(Token::StringLit(s)) => {
            stream.advance();
            ExprKind::Str(s)
        }
        Some(Token::CaprefNum(n)) => {
            stream.advance();
            ExprKind::Capref {
                name: n.to_string(),
                is_named: false,
            }
        }
        Some(Token::CaprefNamed(name)) => {
            stream.advance();
            ExprKind::Capref {
                name,
                is_named: true,
            }
        }
        Some(Token::Ident(name)) => {
            stream.advance();
            ExprKind::Id(name)
        }
        Some(Token::Builtin(name)) => {
            stream.advance();
            stream.expect(Token::LParen, "to begin arguments")?;
            let mut args = Vec::new();
            if !stream.check(&Token::RParen) {
                loop {
                    args.push(parse_expr(stream)?);
                    if !stream.eat(&Token::Comma) {
                        break;
                    }
                }
            }
            stream.expect(Token::RParen, "to end arguments")?;
            ExprKind::Builtin { name, args }
        }
        Some(Token::RegexLit(_)) => return parse_pattern_expr(stream),
        Some(Token::LParen) => {
            stream.advance();
            let inner = parse_expr(stream)?;
            stream.expect(Token::RParen, "to close group")?;
            return Ok(inner);
        }
        other => {
            return Err(ParseError::unexpected(
                other.as_ref(),
                "an expression",
                pos,
            ));
        }
    };
    Ok(Expr {
        id: stream.next_id(),
        pos: stream.span_from(mark),
        kind,
    })
}

/// Parse a pattern expression: a regex literal or fragment reference,
/// optionally concatenated with further literals, fragments or strings
/// by `+`.
pub fn parse_pattern_expr(stream: &mut TokenStream) -> Result<Expr, ParseError> {
    let mark = stream.mark();
    let mut parts = vec![parse_pattern_part(stream)?];
    while matches!(stream.peek(), Some(Token::Plus))
        && matches!(
            stream.peek_nth(1),
            Some(Token::RegexLit(_)) | Some(Token::Ident(_)) | Some(Token::StringLit(_))
        )
    {
        stream.advance();
        parts.push(parse_pattern_part(stream)?);
    }
    Ok(Expr {
        id: stream.next_id(),
        pos: stream.span_from(mark),
        kind: ExprKind::Pattern(parts),
    })
}

fn parse_pattern_part(stream: &mut TokenStream) -> Result<Expr, ParseError> {
    let mark = stream.mark();
    let pos = stream.current_position();
    let kind = match stream.peek().cloned() {
        Some(Token::RegexLit(body)) => {
            stream.advance();
            ExprKind::PatternLit(body)
        }
        Some(Token::Ident(name)) => {
            stream.advance();
            ExprKind::Id(name)
        }
        Some(Token::StringLit(s)) => {
            stream.advance();
            ExprKind::Str(s)
        }
        other => {
            return Err(ParseError::unexpected(
                other.as_ref(),
                "a regular expression or pattern constant",
                pos,
            ));
        }
    };
    Ok(Expr {
        id: stream.next_id(),
        pos: stream.span_from(mark),
        kind,
    })
}
