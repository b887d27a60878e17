//! Lexical analysis for metrail programs.
//!
//! Tokenization is done with logos. Two things the token definitions alone
//! cannot express live in the [`lex`] wrapper:
//!
//! - **Significant newlines.** A newline terminates a statement only when no
//!   `(` or `[` nesting is open; bracket tokens maintain a depth counter in
//!   the lexer extras and the newline callback consults it.
//! - **Regex literals.** A `/` begins a regex literal when the previous
//!   significant token admits a pattern (statement start, `{`, `}`, `(`,
//!   `,`, `+`, `=~`, `!~`, `&&`, `||`, or the identifier of a `const`
//!   declaration). The wrapper then scans the raw body up to the
//!   terminating unescaped `/` itself, so the body is never re-tokenized.
//!   `\/` denotes a literal slash; all other escapes pass through for the
//!   regex engine to interpret.

use logos::{Filter, Lexer, Logos};
use std::fmt;
use std::ops::Range;

use crate::position::{LineMap, Position};

/// Bracket-nesting state shared with token callbacks.
#[derive(Debug, Default, Clone)]
pub struct LexExtras {
    depth: u32,
}

fn open_bracket(lex: &mut Lexer<Token>) {
    lex.extras.depth += 1;
}

fn close_bracket(lex: &mut Lexer<Token>) {
    lex.extras.depth = lex.extras.depth.saturating_sub(1);
}

fn newline(lex: &mut Lexer<Token>) -> Filter<()> {
    if lex.extras.depth == 0 {
        Filter::Emit(())
    } else {
        Filter::Skip
    }
}

fn unescape_string(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('\\') => out.push('\\'),
                Some('"') => out.push('"'),
                _ => return None,
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Parse a duration literal such as `1h30m` or `250ms` into nanoseconds.
fn parse_duration(s: &str) -> Option<i64> {
    let mut total: i64 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest.find(|c: char| !c.is_ascii_digit())?;
        let value: i64 = rest[..digits_end].parse().ok()?;
        rest = &rest[digits_end..];
        let (unit_ns, unit_len) = if rest.starts_with("ns") {
            (1, 2)
        } else if rest.starts_with("us") {
            (1_000, 2)
        } else if rest.starts_with("µs") {
            (1_000, "µs".len())
        } else if rest.starts_with("ms") {
            (1_000_000, 2)
        } else if rest.starts_with('s') {
            (1_000_000_000, 1)
        } else if rest.starts_with('m') {
            (60_000_000_000, 1)
        } else if rest.starts_with('h') {
            (3_600_000_000_000, 1)
        } else {
            return None;
        };
        total = total.checked_add(value.checked_mul(unit_ns)?)?;
        rest = &rest[unit_len..];
    }
    Some(total)
}

fn duration_callback(lex: &mut Lexer<Token>) -> Option<i64> {
    parse_duration(lex.slice())
}

/// A metrail token.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(extras = LexExtras)]
#[logos(skip r"[ \t\r\f]+")]
#[logos(skip r"#[^\n]*")]
pub enum Token {
    // === Metric kinds ===
    #[token("counter")]
    Counter,
    #[token("gauge")]
    Gauge,
    #[token("timer")]
    Timer,
    #[token("text")]
    Text,
    #[token("histogram")]
    Histogram,

    // === Declaration modifiers ===
    #[token("hidden")]
    Hidden,
    #[token("as")]
    As,
    #[token("by")]
    By,
    #[token("buckets")]
    Buckets,

    // === Statement keywords ===
    #[token("const")]
    Const,
    #[token("def")]
    Def,
    #[token("del")]
    Del,
    #[token("after")]
    After,
    #[token("next")]
    Next,
    #[token("stop")]
    Stop,
    #[token("otherwise")]
    Otherwise,
    #[token("else")]
    Else,

    // === Literals ===
    /// Duration literal, value in nanoseconds. Segments concatenate:
    /// `1h30m` is 90 minutes.
    #[regex(r"[0-9]+(ns|us|µs|ms|s|m|h)([0-9]+(ns|us|µs|ms|s|m|h))*", duration_callback)]
    Duration(i64),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    IntLit(i64),

    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    FloatLit(f64),

    #[regex(r#""([^"\\\n]|\\.)*""#, |lex| {
        let s = lex.slice();
        unescape_string(&s[1..s.len() - 1])
    })]
    StringLit(String),

    /// Regex literal body, built by [`lex`] when a `/` opens a pattern
    /// context. The token rule itself only claims a NUL byte, which
    /// valid sources never contain.
    #[token("\u{0}", |lex| lex.slice().to_string())]
    RegexLit(String),

    // === References ===
    /// Numeric capture reference `$1`.
    #[regex(r"\$[0-9]+", |lex| lex.slice()[1..].parse::<usize>().ok())]
    CaprefNum(usize),

    /// Named capture reference `$name`.
    #[regex(r"\$[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice()[1..].to_string())]
    CaprefNamed(String),

    /// Decorator reference `@name`.
    #[regex(r"@[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice()[1..].to_string())]
    Deco(String),

    /// Reserved builtin function name.
    #[token("int", |lex| lex.slice().to_string())]
    #[token("bool", |lex| lex.slice().to_string())]
    #[token("float", |lex| lex.slice().to_string())]
    #[token("string", |lex| lex.slice().to_string())]
    #[token("timestamp", |lex| lex.slice().to_string())]
    #[token("len", |lex| lex.slice().to_string())]
    #[token("settime", |lex| lex.slice().to_string())]
    #[token("strptime", |lex| lex.slice().to_string())]
    #[token("strtol", |lex| lex.slice().to_string())]
    #[token("tolower", |lex| lex.slice().to_string())]
    #[token("getfilename", |lex| lex.slice().to_string())]
    #[token("subst", |lex| lex.slice().to_string())]
    Builtin(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // === Operators ===
    #[token("=")]
    Assign,
    #[token("+=")]
    AddAssign,
    #[token("=~")]
    MatchRe,
    #[token("!~")]
    NotMatchRe,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token("<=")]
    LtEq,
    #[token(">")]
    Gt,
    #[token(">=")]
    GtEq,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("&")]
    BitAnd,
    #[token("|")]
    BitOr,
    #[token("^")]
    BitXor,
    #[token("+")]
    Plus,
    #[token("++")]
    PlusPlus,
    #[token("-")]
    Minus,
    #[token("--")]
    MinusMinus,
    #[token("*")]
    Star,
    #[token("**")]
    Pow,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("!")]
    Not,

    // === Delimiters ===
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("(", open_bracket)]
    LParen,
    #[token(")", close_bracket)]
    RParen,
    #[token("[", open_bracket)]
    LBracket,
    #[token("]", close_bracket)]
    RBracket,
    #[token(",")]
    Comma,

    /// Statement-terminating newline (only at zero bracket depth).
    #[token("\n", newline)]
    Newline,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Counter => write!(f, "counter"),
            Token::Gauge => write!(f, "gauge"),
            Token::Timer => write!(f, "timer"),
            Token::Text => write!(f, "text"),
            Token::Histogram => write!(f, "histogram"),
            Token::Hidden => write!(f, "hidden"),
            Token::As => write!(f, "as"),
            Token::By => write!(f, "by"),
            Token::Buckets => write!(f, "buckets"),
            Token::Const => write!(f, "const"),
            Token::Def => write!(f, "def"),
            Token::Del => write!(f, "del"),
            Token::After => write!(f, "after"),
            Token::Next => write!(f, "next"),
            Token::Stop => write!(f, "stop"),
            Token::Otherwise => write!(f, "otherwise"),
            Token::Else => write!(f, "else"),
            Token::Duration(ns) => write!(f, "{}ns", ns),
            Token::IntLit(n) => write!(f, "{}", n),
            Token::FloatLit(x) => write!(f, "{}", x),
            Token::StringLit(s) => write!(f, "{:?}", s),
            Token::RegexLit(r) => write!(f, "/{}/", r),
            Token::CaprefNum(n) => write!(f, "${}", n),
            Token::CaprefNamed(n) => write!(f, "${}", n),
            Token::Deco(n) => write!(f, "@{}", n),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Builtin(s) => write!(f, "{}", s),
            Token::Assign => write!(f, "="),
            Token::AddAssign => write!(f, "+="),
            Token::MatchRe => write!(f, "=~"),
            Token::NotMatchRe => write!(f, "!~"),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::LtEq => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::GtEq => write!(f, ">="),
            Token::Shl => write!(f, "<<"),
            Token::Shr => write!(f, ">>"),
            Token::AndAnd => write!(f, "&&"),
            Token::OrOr => write!(f, "||"),
            Token::BitAnd => write!(f, "&"),
            Token::BitOr => write!(f, "|"),
            Token::BitXor => write!(f, "^"),
            Token::Plus => write!(f, "+"),
            Token::PlusPlus => write!(f, "++"),
            Token::Minus => write!(f, "-"),
            Token::MinusMinus => write!(f, "--"),
            Token::Star => write!(f, "*"),
            Token::Pow => write!(f, "**"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Not => write!(f, "!"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
            Token::Newline => write!(f, "end of line"),
        }
    }
}

/// A token paired with its byte span in the source.
pub type SpannedToken = (Token, Range<usize>);

/// Error during lexing, located in the source.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct LexError {
    pub message: String,
    pub pos: Position,
}

/// Does a regex literal start here, given the previously emitted token?
fn regex_may_follow(prev: Option<&Token>, after_const_ident: bool) -> bool {
    if after_const_ident {
        return true;
    }
    match prev {
        None => true,
        Some(
            Token::Newline
            | Token::LBrace
            | Token::RBrace
            | Token::LParen
            | Token::Comma
            | Token::Plus
            | Token::MatchRe
            | Token::NotMatchRe
            | Token::AndAnd
            | Token::OrOr,
        ) => true,
        _ => false,
    }
}

/// Scan a regex body from `rest`, which starts just after the opening `/`.
///
/// Returns the unescaped-slash body and the number of bytes consumed
/// including the terminating `/`, or `None` if the literal is unterminated
/// on this line.
fn scan_regex_body(rest: &str) -> Option<(String, usize)> {
    let mut body = String::new();
    let mut chars = rest.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '/' => return Some((body, i + 1)),
            '\n' => return None,
            '\\' => match chars.next() {
                Some((_, '/')) => body.push('/'),
                Some((_, esc)) => {
                    body.push('\\');
                    body.push(esc);
                }
                None => return None,
            },
            _ => body.push(c),
        }
    }
    None
}

/// Tokenize a source file.
///
/// Always returns the tokens it could produce; any errors are collected so
/// a compile can report them all at once.
pub fn lex(source: &str) -> (Vec<SpannedToken>, Vec<LexError>) {
    let map = LineMap::new(source);
    let mut lexer = Token::lexer(source);
    let mut tokens: Vec<SpannedToken> = Vec::new();
    let mut errors = Vec::new();

    // One-token state machine for `const NAME /re/`: 1 = saw `const`,
    // 2 = saw the following identifier, so a `/` opens a regex.
    let mut const_state = 0u8;

    while let Some(result) = lexer.next() {
        let span = lexer.span();
        match result {
            Ok(Token::Slash)
                if regex_may_follow(tokens.last().map(|(t, _)| t), const_state == 2) =>
            {
                match scan_regex_body(lexer.remainder()) {
                    Some((body, consumed)) => {
                        lexer.bump(consumed);
                        tokens.push((Token::RegexLit(body), span.start..span.end + consumed));
                    }
                    None => {
                        errors.push(LexError {
                            message: "unterminated regular expression".into(),
                            pos: map.position(&span),
                        });
                    }
                }
            }
            Ok(tok) => {
                const_state = match (&tok, const_state) {
                    (Token::Const, _) => 1,
                    (Token::Ident(_), 1) => 2,
                    _ => 0,
                };
                tokens.push((tok, span));
            }
            Err(()) => {
                errors.push(LexError {
                    message: format!("unexpected input {:?}", lexer.slice()),
                    pos: map.position(&span),
                });
            }
        }
    }

    (tokens, errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(source: &str) -> Vec<Token> {
        let (tokens, errors) = lex(source);
        assert!(errors.is_empty(), "lex errors: {:?}", errors);
        tokens.into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_keywords_and_idents() {
        assert_eq!(
            toks("counter lines_total by host"),
            vec![
                Token::Counter,
                Token::Ident("lines_total".into()),
                Token::By,
                Token::Ident("host".into()),
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            toks("42 3.14 1e3"),
            vec![
                Token::IntLit(42),
                Token::FloatLit(3.14),
                Token::FloatLit(1e3),
            ]
        );
    }

    #[test]
    fn test_durations() {
        assert_eq!(
            toks("5s 250ms 1h30m"),
            vec![
                Token::Duration(5_000_000_000),
                Token::Duration(250_000_000),
                Token::Duration(5_400_000_000_000),
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            toks(r#""a\tb\"c\\d""#),
            vec![Token::StringLit("a\tb\"c\\d".into())]
        );
    }

    #[test]
    fn test_caprefs_and_deco() {
        assert_eq!(
            toks("$1 $host @syslog"),
            vec![
                Token::CaprefNum(1),
                Token::CaprefNamed("host".into()),
                Token::Deco("syslog".into()),
            ]
        );
    }

    #[test]
    fn test_builtins_reserved() {
        assert_eq!(
            toks("tolower strptime"),
            vec![
                Token::Builtin("tolower".into()),
                Token::Builtin("strptime".into()),
            ]
        );
    }

    #[test]
    fn test_regex_at_statement_start() {
        assert_eq!(
            toks("/foo.*bar/ {"),
            vec![Token::RegexLit("foo.*bar".into()), Token::LBrace]
        );
    }

    #[test]
    fn test_regex_escaped_slash() {
        assert_eq!(
            toks(r"/a\/b\d+/ {"),
            vec![Token::RegexLit(r"a/b\d+".into()), Token::LBrace]
        );
    }

    #[test]
    fn test_regex_after_concat_and_match() {
        assert_eq!(
            toks(r"/a/ + /b/"),
            vec![
                Token::RegexLit("a".into()),
                Token::Plus,
                Token::RegexLit("b".into()),
            ]
        );
        assert_eq!(
            toks(r"$1 =~ /err/"),
            vec![
                Token::CaprefNum(1),
                Token::MatchRe,
                Token::RegexLit("err".into()),
            ]
        );
    }

    #[test]
    fn test_regex_after_const_ident() {
        assert_eq!(
            toks("const FOO /bar/"),
            vec![
                Token::Const,
                Token::Ident("FOO".into()),
                Token::RegexLit("bar".into()),
            ]
        );
    }

    #[test]
    fn test_slash_is_division_after_operand() {
        assert_eq!(
            toks("$1 / 2"),
            vec![Token::CaprefNum(1), Token::Slash, Token::IntLit(2)]
        );
    }

    #[test]
    fn test_newline_significant_at_top_level() {
        assert_eq!(
            toks("a\nb"),
            vec![
                Token::Ident("a".into()),
                Token::Newline,
                Token::Ident("b".into()),
            ]
        );
    }

    #[test]
    fn test_newline_in_parens_skipped() {
        assert_eq!(
            toks("(a,\nb)"),
            vec![
                Token::LParen,
                Token::Ident("a".into()),
                Token::Comma,
                Token::Ident("b".into()),
                Token::RParen,
            ]
        );
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            toks("counter c # trailing comment\n"),
            vec![Token::Counter, Token::Ident("c".into()), Token::Newline]
        );
    }

    #[test]
    fn test_unterminated_regex() {
        let (_, errors) = lex("/abc\n");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("unterminated"));
    }

    #[test]
    fn test_invalid_byte_reported_with_position() {
        let (tokens, errors) = lex("counter c\n?");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].pos.line, 2);
        assert_eq!(tokens.len(), 3);
    }

    #[test]
    fn test_positions_monotone() {
        let (tokens, errors) = lex("counter c\n/x(\\d+)/ { c = $1 }\n");
        assert!(errors.is_empty());
        let mut last = 0;
        for (_, span) in &tokens {
            assert!(span.start >= last);
            last = span.start;
        }
    }
}
