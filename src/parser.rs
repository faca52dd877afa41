use crate::Span;
use crate::lexer::unescape::unescape;
use crate::lexer::{LexerError, LexerErrorKind, Token, TokenKind};
use crate::number::Number;
use crate::types::{Node, RegexLiteral, Sexpr};
use std::vec::IntoIter; // To iterate over Vec<Token>
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("{0}")]
    Lexical(#[from] LexerError), // Malformed literals the tokenizer let through
    #[error("Unexpected token '{found}', expected {expected}")]
    UnexpectedToken { found: Token, expected: String },
    #[error("Unexpected end of input, expected {0}")]
    UnexpectedEof(String),
    #[error("Invalid dotted pair syntax at {0}")]
    InvalidDotSyntax(Span),
}

impl ParseError {
    /// Where the error points in the source. End of input has no span of its own.
    pub fn span(&self) -> Option<Span> {
        match self {
            ParseError::Lexical(err) => Some(err.span),
            ParseError::UnexpectedToken { found, .. } => Some(found.span),
            ParseError::UnexpectedEof(_) => None,
            ParseError::InvalidDotSyntax(span) => Some(*span),
        }
    }
}

// Result type alias for convenience
pub type ParseResult<T> = Result<T, ParseError>;

// State of the `.` marker inside an open list.
#[derive(Debug)]
enum Dot {
    None,
    Pending(Span), // seen `.`, waiting for the tail value
    Tail(Node),    // tail read, only `)` may follow
}

// An open construct on the builder stack.
#[derive(Debug)]
enum Frame {
    List {
        start: usize,
        items: Vec<Node>,
        dot: Dot,
    },
    // `'`, `` ` ``, `,` or `,@` waiting for the form it wraps.
    Sugar { symbol: &'static str, span: Span },
}

/// Builds top-level forms from a token stream with an explicit stack of open
/// lists, so nesting depth is bounded by memory rather than the call stack.
pub struct Parser {
    tokens: IntoIter<Token>,
    stack: Vec<Frame>,
    forms: Vec<Node>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens: tokens.into_iter(),
            stack: Vec::new(),
            forms: Vec::new(),
        }
    }

    /// Parses every top-level form in the token stream, in order.
    pub fn parse(mut self) -> ParseResult<Vec<Node>> {
        while let Some(token) = self.tokens.next() {
            self.feed(token)?;
        }
        match self.stack.last() {
            None => Ok(self.forms),
            Some(Frame::List { .. }) => Err(ParseError::UnexpectedEof("')'".to_string())),
            Some(Frame::Sugar { symbol, .. }) => Err(ParseError::UnexpectedEof(format!(
                "an expression after {}",
                symbol
            ))),
        }
    }

    fn feed(&mut self, token: Token) -> ParseResult<()> {
        match token.kind {
            TokenKind::LParen => {
                self.stack.push(Frame::List {
                    start: token.span.start,
                    items: Vec::new(),
                    dot: Dot::None,
                });
                Ok(())
            }
            TokenKind::RParen => self.close_list(token),
            TokenKind::Dot => self.mark_dot(token.span),
            TokenKind::Quote => self.open_sugar("quote", token.span),
            TokenKind::QuasiQuote => self.open_sugar("quasiquote", token.span),
            TokenKind::Unquote => self.open_sugar("unquote", token.span),
            TokenKind::UnquoteSplicing => self.open_sugar("unquote-splicing", token.span),
            _ => {
                let atom = parse_atom(token)?;
                self.push_value(atom)
            }
        }
    }

    fn open_sugar(&mut self, symbol: &'static str, span: Span) -> ParseResult<()> {
        self.stack.push(Frame::Sugar { symbol, span });
        Ok(())
    }

    /// Hands a finished value to whatever is waiting for it: pending sugar
    /// wraps it first, then it becomes a list element, a dotted tail, or a
    /// completed top-level form.
    fn push_value(&mut self, mut node: Node) -> ParseResult<()> {
        loop {
            match self.stack.pop() {
                None => {
                    self.forms.push(node);
                    return Ok(());
                }
                Some(Frame::Sugar { symbol, span }) => {
                    node = Node::new_quoted_expr(node, symbol, span);
                }
                Some(Frame::List {
                    start,
                    mut items,
                    dot,
                }) => {
                    let dot = match dot {
                        Dot::None => {
                            items.push(node);
                            Dot::None
                        }
                        Dot::Pending(_) => Dot::Tail(node),
                        Dot::Tail(_) => return Err(ParseError::InvalidDotSyntax(node.span)),
                    };
                    self.stack.push(Frame::List { start, items, dot });
                    return Ok(());
                }
            }
        }
    }

    // `.` needs at least one element before it and may appear once per list.
    fn mark_dot(&mut self, dot_span: Span) -> ParseResult<()> {
        match self.stack.last_mut() {
            Some(Frame::List { items, dot, .. })
                if !items.is_empty() && matches!(dot, Dot::None) =>
            {
                *dot = Dot::Pending(dot_span);
                Ok(())
            }
            _ => Err(ParseError::InvalidDotSyntax(dot_span)),
        }
    }

    fn close_list(&mut self, token: Token) -> ParseResult<()> {
        match self.stack.pop() {
            Some(Frame::List { start, items, dot }) => {
                let span = Span::new(start, token.span.end);
                let list = match dot {
                    Dot::None if items.is_empty() => Node::new_nil(span),
                    Dot::None => Node::new_list(items, span),
                    Dot::Tail(tail) => Node::list_with_tail(items, tail, span),
                    Dot::Pending(dot_span) => return Err(ParseError::InvalidDotSyntax(dot_span)),
                };
                self.push_value(list)
            }
            _ => Err(ParseError::UnexpectedToken {
                found: token,
                expected: "an expression".to_string(),
            }),
        }
    }
}

/// Parses an atomic expression (symbol, number, boolean, string, regex).
fn parse_atom(token: Token) -> ParseResult<Node> {
    let span = token.span;
    let lexical = |error: LexerErrorKind| ParseError::Lexical(LexerError { error, span });
    let kind = match token.kind {
        TokenKind::Number => match Number::parse_literal(&token.text) {
            Some(n) => Sexpr::Number(n),
            None => return Err(lexical(LexerErrorKind::InvalidNumberFormat(token.text))),
        },
        TokenKind::Boolean => Sexpr::Boolean(token.text == "#t"),
        TokenKind::String => {
            // The token includes both quotes.
            let body = &token.text[1..token.text.len() - 1];
            Sexpr::String(unescape(body).map_err(lexical)?)
        }
        TokenKind::Regex => {
            let (source, flags) = split_regex(&token.text);
            let regex = RegexLiteral::new(source, flags)
                .map_err(|e| lexical(LexerErrorKind::InvalidRegex(e.to_string())))?;
            Sexpr::Regex(regex)
        }
        TokenKind::Symbol => Sexpr::Symbol(token.text),
        TokenKind::UnterminatedString => return Err(lexical(LexerErrorKind::UnterminatedString)),
        TokenKind::Invalid => return Err(lexical(LexerErrorKind::InvalidToken(token.text))),
        _ => {
            return Err(ParseError::UnexpectedToken {
                found: token,
                expected: "an atom".to_string(),
            });
        }
    };
    Ok(Node::new(kind, span))
}

// `/body/flags` -> ("body", "flags")
fn split_regex(text: &str) -> (&str, &str) {
    match text.rfind('/') {
        Some(close) if close > 0 => (&text[1..close], &text[close + 1..]),
        _ => (text, ""),
    }
}

// Helper function to lex and parse a string directly (useful for tests and REPL)
pub fn parse_str(input: &str) -> ParseResult<Vec<Node>> {
    let tokens = crate::lexer::tokenize(input);
    Parser::new(tokens).parse()
}
