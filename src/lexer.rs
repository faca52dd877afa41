use logos::{Lexer, Logos};
use std::fmt;
use thiserror::Error;

use crate::Span;

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\n\r\f]+")] // Skip whitespace
#[logos(skip r";[^\n\r]*")] // Skip comments
pub enum TokenKind {
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(".", priority = 3)]
    Dot,
    #[token("'")]
    Quote,
    #[token("`")]
    QuasiQuote,
    #[token(",")]
    Unquote,
    #[token(",@")]
    UnquoteSplicing,
    // A leading `/` goes through `slash_form`, which decides between a
    // symbol such as `/` or `/b` and a regex literal.
    #[regex(r"[\p{Extended_Pictographic}.a-zA-Z0-9!#$%&*:<=>?~_^+-][\p{Extended_Pictographic}.a-zA-Z0-9!#$%&*/:<=>?~_^+-]*")]
    #[token("/", slash_form)]
    Symbol,
    #[regex(r"[-+]?[0-9]+(\.[0-9]+)?([eE][-+]?[0-9]+)?", priority = 3)]
    Number,
    #[token("#t")]
    #[token("#f")]
    Boolean,
    #[regex(r#""([^"\\]|\\.)*""#)]
    String,
    // Runs to end of input without a closing quote; reported by the parser.
    #[regex(r#""([^"\\]|\\.)*\\?"#)]
    UnterminatedString,
    // Produced by `tokenize` from a `/` symbol that closes on the same line.
    Regex,
    // Anything logos could not match
    Invalid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String, // Exact source slice, delimiters included
    pub span: Span,
}

pub(crate) mod unescape {
    use super::LexerErrorKind;
    // Basic unescape logic
    pub fn unescape(s: &str) -> Result<String, LexerErrorKind> {
        // un-escaping should only ever reduce the length of the string.
        let mut result = String::with_capacity(s.len());
        let mut chars = s.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('n') => result.push('\n'),
                    Some('r') => result.push('\r'),
                    Some('t') => result.push('\t'),
                    Some('0') => result.push('\0'),
                    Some('\\') => result.push('\\'),
                    Some('"') => result.push('"'),
                    Some(c) => return Err(LexerErrorKind::UnknownEscapeSequence(c)),
                    None => return Err(LexerErrorKind::UnterminatedString),
                }
            } else {
                result.push(c);
            }
        }
        Ok(result)
    }
}

// Implement Display for easy printing
impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenKind::LParen => "'('",
            TokenKind::RParen => "')'",
            TokenKind::Dot => "'.'",
            TokenKind::Quote => "'''",
            TokenKind::QuasiQuote => "'`'",
            TokenKind::Unquote => "','",
            TokenKind::UnquoteSplicing => "',@'",
            TokenKind::Symbol => "symbol",
            TokenKind::Number => "number",
            TokenKind::Boolean => "boolean",
            TokenKind::String => "string",
            TokenKind::UnterminatedString => "unterminated string",
            TokenKind::Regex => "regex",
            TokenKind::Invalid => "invalid token",
        };
        write!(f, "{}", name)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexerErrorKind {
    #[error("Unterminated string literal")]
    UnterminatedString,
    #[error("Invalid number format: '{0}'")]
    InvalidNumberFormat(String),
    #[error("Unknown escape sequence: '\\{0}'")]
    UnknownEscapeSequence(char),
    #[error("Invalid regex literal: {0}")]
    InvalidRegex(String),
    #[error("Invalid token: '{0}'")]
    InvalidToken(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{error}")]
pub struct LexerError {
    pub error: LexerErrorKind,
    pub span: Span,
}

fn is_symbol_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || "!#$%&*/:<=>?~_^+-.".contains(c)
        || (!c.is_ascii() && !c.is_whitespace())
}

// Length of a regex literal after its opening `/`: body, unescaped closing
// `/`, then flag letters. The body may not start with whitespace, `/` or `)`
// so `(/ 1 2)` and `(f /)` stay divisions, and it may not span lines.
fn regex_tail_len(rest: &str) -> Option<usize> {
    match rest.chars().next() {
        Some(c) if !c.is_whitespace() && c != '/' && c != ')' => {}
        _ => return None,
    }
    let mut escaped = false;
    for (i, c) in rest.char_indices() {
        match c {
            '\n' | '\r' => return None,
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '/' => {
                let flags = rest[i + 1..]
                    .chars()
                    .take_while(|c| c.is_ascii_alphabetic())
                    .count();
                return Some(i + 1 + flags);
            }
            _ => {}
        }
    }
    None
}

fn slash_form(lex: &mut Lexer<TokenKind>) {
    let rest = lex.remainder();
    let len = regex_tail_len(rest).unwrap_or_else(|| {
        rest.char_indices()
            .find(|&(_, c)| !is_symbol_char(c))
            .map_or(rest.len(), |(i, _)| i)
    });
    lex.bump(len);
}

fn is_regex_literal(text: &str) -> bool {
    text.strip_prefix('/')
        .is_some_and(|rest| regex_tail_len(rest) == Some(rest.len()))
}

/// Splits `input` into tokens. Never fails: characters logos cannot match come
/// back as [`TokenKind::Invalid`] and an open string as
/// [`TokenKind::UnterminatedString`], both left for the parser to report.
pub fn tokenize(input: &str) -> Vec<Token> {
    TokenKind::lexer(input)
        .spanned()
        .map(|(result, range)| {
            let text = &input[range.clone()];
            let kind = match result {
                Ok(TokenKind::Symbol) if is_regex_literal(text) => TokenKind::Regex,
                Ok(kind) => kind,
                Err(_) => TokenKind::Invalid,
            };
            Token {
                kind,
                text: text.to_string(),
                span: Span::from(range),
            }
        })
        .collect()
}

/// The token texts alone, in order.
pub fn token_strings(input: &str) -> Vec<String> {
    tokenize(input).into_iter().map(|t| t.text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Helper to simplify testing token sequences
    fn assert_tokens(input: &str, expected: &[&str]) {
        assert_eq!(token_strings(input), expected, "Input: '{}'", input);
    }

    fn assert_kinds(input: &str, expected: Vec<TokenKind>) {
        let kinds: Vec<TokenKind> = tokenize(input).into_iter().map(|t| t.kind).collect();
        assert_eq!(kinds, expected, "Input: '{}'", input);
    }

    #[test]
    fn test_empty_input() {
        assert_tokens("", &[]);
    }

    #[test]
    fn test_simple_list() {
        assert_tokens("(foo bar baz)", &["(", "foo", "bar", "baz", ")"]);
    }

    #[test]
    fn test_parentheses_and_quote() {
        assert_kinds("()", vec![TokenKind::LParen, TokenKind::RParen]);
        assert_kinds("( )", vec![TokenKind::LParen, TokenKind::RParen]);
        assert_kinds(" ' ", vec![TokenKind::Quote]);
        assert_kinds(" ` ", vec![TokenKind::QuasiQuote]);
        assert_kinds(" , ", vec![TokenKind::Unquote]);
        assert_kinds(" ,@ ", vec![TokenKind::UnquoteSplicing]);
        assert_kinds(
            "`(,@(1 2) ,x)",
            vec![
                TokenKind::QuasiQuote,
                TokenKind::LParen,
                TokenKind::UnquoteSplicing,
                TokenKind::LParen,
                TokenKind::Number,
                TokenKind::Number,
                TokenKind::RParen,
                TokenKind::Unquote,
                TokenKind::Symbol,
                TokenKind::RParen,
            ],
        );
    }

    #[test]
    fn test_parens_split_atoms() {
        assert_tokens("foo(bar)baz", &["foo", "(", "bar", ")", "baz"]);
    }

    #[test]
    fn test_numbers_strings_and_regexes() {
        assert_tokens(
            r#"(foo /( \/)/g "bar baz" 10 1.1 10e2)"#,
            &["(", "foo", r"/( \/)/g", r#""bar baz""#, "10", "1.1", "10e2", ")"],
        );
        assert_kinds(
            r#"/( \/)/g "bar baz" 10e2"#,
            vec![TokenKind::Regex, TokenKind::String, TokenKind::Number],
        );
    }

    #[test]
    fn test_numbers() {
        for input in ["123", "-45", "6.78", "-0.9", "+10", "-1e-5", "10E2"] {
            assert_kinds(input, vec![TokenKind::Number]);
        }
    }

    #[test]
    fn test_number_like_symbols() {
        for input in ["1-2", "+-", "1.2.3", "--5", "1e", "1e-", ".+", "-.", "1.", ".5"] {
            assert_kinds(input, vec![TokenKind::Symbol]);
        }
    }

    #[test]
    fn test_booleans() {
        assert_kinds("#t #f", vec![TokenKind::Boolean, TokenKind::Boolean]);
        assert_kinds("#true", vec![TokenKind::Symbol]);
    }

    #[test]
    fn test_symbols() {
        for input in ["foo", "+", "-", "*", "/", "<=?", "!", "eq?", "set!", "🍕+☕", "..."] {
            assert_kinds(input, vec![TokenKind::Symbol]);
        }
    }

    #[test]
    fn test_division_is_not_a_regex() {
        assert_kinds(
            "(/ 1 2) (/ 3 4)",
            vec![
                TokenKind::LParen,
                TokenKind::Symbol,
                TokenKind::Number,
                TokenKind::Number,
                TokenKind::RParen,
                TokenKind::LParen,
                TokenKind::Symbol,
                TokenKind::Number,
                TokenKind::Number,
                TokenKind::RParen,
            ],
        );
    }

    #[test]
    fn test_bare_slash_is_a_symbol() {
        assert_tokens("(/)", &["(", "/", ")"]);
        assert_kinds("(/)", vec![TokenKind::LParen, TokenKind::Symbol, TokenKind::RParen]);
        assert_tokens("(f /)", &["(", "f", "/", ")"]);
        assert_tokens("(list / /)", &["(", "list", "/", "/", ")"]);
        assert_tokens("(define div /)", &["(", "define", "div", "/", ")"]);
        assert_tokens("(f /) (g /)", &["(", "f", "/", ")", "(", "g", "/", ")"]);
    }

    #[test]
    fn test_slash_prefixed_symbols() {
        assert_tokens("(a /b)", &["(", "a", "/b", ")"]);
        assert_kinds("/b", vec![TokenKind::Symbol]);
        assert_kinds("a/b", vec![TokenKind::Symbol]);
        // No closing slash before the line ends
        assert_kinds("/ab\n/", vec![TokenKind::Symbol, TokenKind::Symbol]);
    }

    #[test]
    fn test_regex_flags_and_escapes() {
        assert_tokens("/a\\/b/i x", &["/a\\/b/i", "x"]);
        assert_kinds("/a\\/b/i", vec![TokenKind::Regex]);
        assert_tokens("(/x/)", &["(", "/x/", ")"]);
        assert_kinds("/x/", vec![TokenKind::Regex]);
    }

    #[test]
    fn test_alist() {
        assert_tokens(
            "((foo . 10) (bar . 20) (baz . 30))",
            &[
                "(", "(", "foo", ".", "10", ")", "(", "bar", ".", "20", ")", "(", "baz", ".",
                "30", ")", ")",
            ],
        );
        assert_kinds(
            "a . b",
            vec![TokenKind::Symbol, TokenKind::Dot, TokenKind::Symbol],
        );
        assert_kinds("sym.bol", vec![TokenKind::Symbol]);
    }

    #[test]
    fn test_comments() {
        assert_tokens("(foo bar baz); (baz quux)", &["(", "foo", "bar", "baz", ")"]);
        assert_tokens("; only comment", &[]);
        assert_tokens(";", &[]);
        assert_tokens(
            "(define x 10) ; Define x\n; Another\n(+ x 5)",
            &["(", "define", "x", "10", ")", "(", "+", "x", "5", ")"],
        );
    }

    #[test]
    fn test_semicolon_inside_strings_and_regexes() {
        assert_tokens(
            r#"(";()" /;;;/g baz); (baz quux)"#,
            &["(", r#"";()""#, "/;;;/g", "baz", ")"],
        );
    }

    #[test]
    fn test_escaped_quote_in_string() {
        assert_tokens(r#""esc \" x" y"#, &[r#""esc \" x""#, "y"]);
    }

    #[test]
    fn test_unterminated_string_token() {
        assert_kinds(r#""hello"#, vec![TokenKind::UnterminatedString]);
        assert_kinds(r#""hello\""#, vec![TokenKind::UnterminatedString]);
        assert_kinds(r#"(1 "abc"#, vec![
            TokenKind::LParen,
            TokenKind::Number,
            TokenKind::UnterminatedString,
        ]);
    }

    #[test]
    fn test_invalid_character_is_deferred() {
        assert_kinds("[", vec![TokenKind::Invalid]);
    }

    #[test]
    fn test_unescape() {
        assert_eq!(
            unescape::unescape(r#"\n\t\r\"\\"#),
            Ok("\n\t\r\"\\".to_string())
        );
        assert_eq!(
            unescape::unescape(r"\q"),
            Err(LexerErrorKind::UnknownEscapeSequence('q'))
        );
    }

    #[test]
    fn test_tokenize_spans() {
        let tokens = tokenize("(+ 1)");
        assert_eq!(tokens.len(), 4);
        assert_eq!(tokens[0].span, Span { start: 0, end: 1 });
        assert_eq!(tokens[1].span, Span { start: 1, end: 2 });
        assert_eq!(tokens[2].span, Span { start: 3, end: 4 });
        assert_eq!(tokens[3].span, Span { start: 4, end: 5 });
    }
}
