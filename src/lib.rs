// Declare modules publicly so they are part of the library interface
pub mod environment;
pub mod evaluator;
pub mod lexer;
pub mod number;
pub mod parser;
pub mod pretty_print;
pub mod primitives;
pub mod source;
pub mod types;

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;
use tracing::debug;

pub use environment::{EnvError, Environment};
pub use evaluator::{CallContext, EvalError, EvalResult, evaluate};
pub use lexer::{LexerError, Token, TokenKind, tokenize};
pub use number::Number;
pub use parser::{ParseError, Parser, parse_str};
pub use source::Span;
pub use types::{Node, Procedure, Sexpr, Tree};

/// Anything that can go wrong running source text.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Parses `source` and evaluates its top-level forms in order, collecting one
/// result per form. Stops at the first error.
pub fn exec(
    source: &str,
    env: &Rc<RefCell<Environment>>,
    dynamic_env: Option<&Rc<RefCell<Environment>>>,
) -> Result<Vec<Node>, Error> {
    let forms = parse_str(source)?;
    let mut results = Vec::with_capacity(forms.len());
    for form in forms {
        debug!(form = %form, scope = env.borrow().name(), "evaluating");
        results.push(evaluate(form, env.clone(), dynamic_env.cloned())?);
    }
    Ok(results)
}

/// Like [`exec`], but keeps going after a failed form. A parse error still
/// rejects the whole input.
pub fn exec_each(
    source: &str,
    env: &Rc<RefCell<Environment>>,
    dynamic_env: Option<&Rc<RefCell<Environment>>>,
) -> Result<Vec<EvalResult>, ParseError> {
    let forms = parse_str(source)?;
    Ok(forms
        .into_iter()
        .map(|form| {
            debug!(form = %form, scope = env.borrow().name(), "evaluating");
            evaluate(form, env.clone(), dynamic_env.cloned())
        })
        .collect())
}
