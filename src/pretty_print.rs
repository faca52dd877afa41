use crate::{EnvError, Error, EvalError, ParseError};
use ariadne::{Label, Report, ReportKind, Source};
use std::io;
use std::ops::Range;

type SourceSpan<'a> = (&'a str, Range<usize>);

impl EvalError {
    pub fn report<'a>(&self, source_id: &'a str) -> Report<'a, SourceSpan<'a>> {
        let range = self.span().to_range();
        let builder = Report::build(ReportKind::Error, (source_id, range.clone()));
        let label = Label::new((source_id, range));
        match self {
            EvalError::Env(EnvError::UnboundVariable(symbol, _)) => builder
                .with_message(format!("Unbound symbol `{}`", symbol))
                .with_label(label.with_message("This symbol is not defined in the current scope")),
            EvalError::NotCallable { value, .. } => builder
                .with_message(self.to_string())
                .with_label(label.with_message(format!("This evaluates to {}", value))),
            EvalError::InvalidArguments(message, _) => builder
                .with_message("Invalid arguments:")
                .with_label(label.with_message(message)),
            EvalError::InvalidSpecialForm(message, _) => builder
                .with_message(format!("Invalid special form: {}", message))
                .with_label(label.with_message("This special form is malformed or incomplete")),
            EvalError::Number(error, _) => builder
                .with_message("Arithmetic error")
                .with_label(label.with_message(error.to_string())),
        }
        .finish()
    }

    pub fn pretty_print(&self, source_id: &str, input: &str) -> io::Result<()> {
        self.report(source_id)
            .eprint((source_id, Source::from(input)))
    }
}

impl ParseError {
    pub fn report<'a>(&self, source_id: &'a str, input: &str) -> Report<'a, SourceSpan<'a>> {
        // End of input points just past the last character.
        let range = self
            .span()
            .map(|span| span.to_range())
            .unwrap_or(input.len()..input.len());
        let builder = Report::build(ReportKind::Error, (source_id, range.clone()));
        let label = Label::new((source_id, range));
        match self {
            ParseError::UnexpectedToken { found, expected } => builder
                .with_message(format!("Unexpected token: {}", found.kind))
                .with_label(label.with_message(format!("Expected {expected}"))),
            ParseError::UnexpectedEof(expected) => builder
                .with_message("Unexpected EOF")
                .with_label(label.with_message(format!("Expected {expected}"))),
            ParseError::Lexical(lex_err) => builder
                .with_message("Lexer Error")
                .with_label(label.with_message(lex_err.error.to_string())),
            ParseError::InvalidDotSyntax(_) => builder
                .with_message("Invalid Dot Syntax")
                .with_label(label.with_message("Unexpected dot")),
        }
        .finish()
    }

    pub fn pretty_print(&self, source_id: &str, input: &str) -> io::Result<()> {
        self.report(source_id, input)
            .eprint((source_id, Source::from(input)))
    }
}

impl Error {
    pub fn pretty_print(&self, source_id: &str, input: &str) -> io::Result<()> {
        match self {
            Error::Parse(err) => err.pretty_print(source_id, input),
            Error::Eval(err) => err.pretty_print(source_id, input),
        }
    }
}
