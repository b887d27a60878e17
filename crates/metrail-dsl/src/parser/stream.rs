//! Token stream wrapper for the hand-written parser.

use crate::ast::NodeId;
use crate::lexer::{SpannedToken, Token};
use crate::position::{LineMap, Position};

use super::ParseError;

/// Token stream with one-token lookahead and position tracking.
///
/// Also owns the node-id counter: the parser allocates an id per
/// expression and block so later passes can use side tables.
pub struct TokenStream<'src> {
    tokens: &'src [SpannedToken],
    map: &'src LineMap,
    pos: usize,
    next_id: NodeId,
}

impl<'src> TokenStream<'src> {
    pub fn new(tokens: &'src [SpannedToken], map: &'src LineMap) -> Self {
        Self {
            tokens,
            map,
            pos: 0,
            next_id: 0,
        }
    }

    /// Allocate a fresh node id.
    pub fn next_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Number of node ids handed out so far.
    pub fn ids_used(&self) -> NodeId {
        self.next_id
    }

    pub fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    pub fn peek_nth(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n).map(|(t, _)| t)
    }

    pub fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    pub fn check(&self, expected: &Token) -> bool {
        matches!(self.peek(), Some(t) if std::mem::discriminant(t) == std::mem::discriminant(expected))
    }

    /// Consume the expected token or fail with `context` in the message.
    pub fn expect(&mut self, expected: Token, context: &str) -> Result<Position, ParseError> {
        if self.check(&expected) {
            let pos = self.current_position();
            self.advance();
            Ok(pos)
        } else {
            Err(ParseError::expected(
                &expected,
                self.peek(),
                context,
                self.current_position(),
            ))
        }
    }

    /// Consume the token if it matches; reports whether it did.
    pub fn eat(&mut self, expected: &Token) -> bool {
        if self.check(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    /// Index of the next unconsumed token; pair with [`span_from`].
    ///
    /// [`span_from`]: TokenStream::span_from
    pub fn mark(&self) -> usize {
        self.pos
    }

    /// Position of the current (unconsumed) token, or of end-of-input.
    pub fn current_position(&self) -> Position {
        if let Some((_, span)) = self.tokens.get(self.pos) {
            self.map.position(span)
        } else if let Some((_, span)) = self.tokens.last() {
            self.map.position(&(span.end..span.end))
        } else {
            Position::new(1, 1, 1)
        }
    }

    /// Merged position of everything consumed since `mark`.
    pub fn span_from(&self, mark: usize) -> Position {
        let start = match self.tokens.get(mark) {
            Some((_, span)) => self.map.position(span),
            None => return self.current_position(),
        };
        let last = self.pos.saturating_sub(1);
        if last <= mark {
            return start;
        }
        match self.tokens.get(last) {
            Some((_, span)) => start.merge(self.map.position(span)),
            None => start,
        }
    }

    /// Skip statement-separating newlines.
    pub fn skip_newlines(&mut self) {
        while self.check(&Token::Newline) {
            self.advance();
        }
    }

    /// Error recovery: skip to just past the next statement boundary.
    pub fn synchronize(&mut self) {
        while !self.at_end() {
            match self.peek() {
                Some(Token::Newline) => {
                    self.advance();
                    return;
                }
                Some(Token::RBrace) => return,
                _ => {
                    self.advance();
                }
            }
        }
    }
}
