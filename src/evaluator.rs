use crate::environment::{EnvError, Environment};
use crate::number::NumberError;
use crate::source::Span;
use crate::types::{Lambda, Macro, Node, Pair, Params, Procedure, Sexpr};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use thiserror::Error;
use tracing::trace;

type Env = Rc<RefCell<Environment>>;

// --- Evaluation Error ---
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("{0}")]
    Env(#[from] EnvError), // Errors from environment lookup
    // Tried to call something that isn't a procedure. `name` is the head
    // symbol when there was one.
    #[error("{}", not_callable_message(.name, .value))]
    NotCallable {
        name: Option<String>,
        value: String,
        span: Span,
    },
    #[error("Invalid special form: {0}")]
    InvalidSpecialForm(String, Span), // Malformed special form (e.g., (if cond))
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String, Span), // Mismatched arity or wrong type of args
    #[error("{0}")]
    Number(NumberError, Span),
}

fn not_callable_message(name: &Option<String>, value: &str) -> String {
    match name {
        Some(name) => format!("Variable `{}' is not a function", name),
        None => format!("Expected a procedure, but got: {}", value),
    }
}

impl EvalError {
    pub fn span(&self) -> Span {
        match self {
            EvalError::Env(EnvError::UnboundVariable(_, span)) => *span,
            EvalError::NotCallable { span, .. } => *span,
            EvalError::InvalidSpecialForm(_, span)
            | EvalError::InvalidArguments(_, span)
            | EvalError::Number(_, span) => *span,
        }
    }
}

// Result type alias for convenience
pub type EvalResult<T = Node> = Result<T, EvalError>;

/// What a native procedure sees of its call site.
pub struct CallContext<'a> {
    /// The environment the call was evaluated in.
    pub env: &'a Env,
    pub dynamic_env: Option<&'a Env>,
    /// Span of the whole call expression.
    pub span: Span,
    tail_call: RefCell<Option<(Procedure, Vec<Node>)>>,
}

impl<'a> CallContext<'a> {
    fn new(env: &'a Env, dynamic_env: Option<&'a Env>, span: Span) -> Self {
        CallContext {
            env,
            dynamic_env,
            span,
            tail_call: RefCell::new(None),
        }
    }

    /// Makes the native's result the result of calling `procedure` with
    /// `args`. The call runs on the trampoline after the native returns, so
    /// tail calls made through natives such as `apply` use no extra stack.
    pub fn tail_call(&self, procedure: Procedure, args: Vec<Node>) -> EvalResult {
        *self.tail_call.borrow_mut() = Some((procedure, args));
        Ok(Node::new_undefined(self.span))
    }
}

/// One unit of trampoline work. Forms in tail position come back as `Eval` or
/// `Continue` instead of being evaluated recursively.
enum Step {
    Done(Node),
    Eval {
        node: Node,
        env: Env,
        dynamic_env: Option<Env>,
    },
    Continue {
        procedure: Procedure,
        args: Vec<Node>,
        env: Env,
        dynamic_env: Option<Env>,
        span: Span,
    },
}

const SPECIAL_FORMS: &[&str] = &[
    "quote",
    "quasiquote",
    "define",
    "lambda",
    "let",
    "if",
    "set!",
    "set",
    "while",
    "defmacro",
    "begin",
];

/// Names that are handled by the evaluator itself and cannot be rebound.
pub fn special_form_identifiers() -> HashSet<String> {
    SPECIAL_FORMS.iter().map(|name| name.to_string()).collect()
}

// --- Evaluate Function ---

/// Evaluates `node` in `env`. When `dynamic_env` is given, procedures and
/// macros run in frames chained to the caller's active environment instead of
/// the one they captured.
pub fn evaluate(node: Node, env: Env, dynamic_env: Option<Env>) -> EvalResult {
    run(Step::Eval {
        node,
        env,
        dynamic_env,
    })
}

fn run(mut step: Step) -> EvalResult {
    loop {
        step = match step {
            Step::Done(node) => return Ok(node),
            Step::Eval {
                node,
                env,
                dynamic_env,
            } => eval_step(node, env, dynamic_env)?,
            Step::Continue {
                procedure,
                args,
                env,
                dynamic_env,
                span,
            } => {
                trace!(
                    procedure = procedure.name().unwrap_or("lambda"),
                    args = args.len(),
                    "bounce"
                );
                apply_step(procedure, args, env, dynamic_env, span)?
            }
        };
    }
}

fn eval_step(node: Node, env: Env, dynamic_env: Option<Env>) -> EvalResult<Step> {
    match &node.kind {
        Sexpr::Symbol(name) => {
            let value = lookup(name, node.span, &env, dynamic_env.as_ref())?;
            Ok(Step::Done(value))
        }
        Sexpr::Pair(pair) => eval_form(pair, node.span, env, dynamic_env),
        // Everything else evaluates to itself
        _ => Ok(Step::Done(node)),
    }
}

// Lexical chain first; a separate top-level dynamic environment is the fallback.
fn lookup(name: &str, span: Span, env: &Env, dynamic_env: Option<&Env>) -> EvalResult {
    let found = env.borrow().get(name, span);
    match (found, dynamic_env) {
        (Err(_), Some(active)) if !Rc::ptr_eq(active, env) => Ok(active.borrow().get(name, span)?),
        (found, _) => Ok(found?),
    }
}

fn eval_form(pair: &Pair, span: Span, env: Env, dynamic_env: Option<Env>) -> EvalResult<Step> {
    let operands = &pair.cdr;
    if let Some(name) = pair.car.as_symbol() {
        match name {
            "quote" => return eval_quote(operands, span),
            "quasiquote" => return eval_quasiquote(operands, span, &env, dynamic_env.as_ref()),
            "define" => return eval_define(operands, span, &env, dynamic_env.as_ref()),
            "lambda" => return eval_lambda(operands, span, &env),
            "let" => return eval_let(operands, span, &env, dynamic_env),
            "if" => return eval_if(operands, span, env, dynamic_env),
            "set!" | "set" => return eval_set(operands, span, &env, dynamic_env.as_ref()),
            "while" => return eval_while(operands, span, &env, dynamic_env.as_ref()),
            "defmacro" => return eval_defmacro(operands, span, &env),
            "begin" => return eval_sequence(&proper_list(operands, "begin")?, span, env, dynamic_env),
            _ => {}
        }
    }

    let head = match pair.car.as_symbol() {
        Some(name) => lookup(name, pair.car.span, &env, dynamic_env.as_ref())?,
        None => evaluate(pair.car.clone(), env.clone(), dynamic_env.clone())?,
    };
    match head.kind {
        Sexpr::Macro(mac) => {
            // Expanded afresh every time the form is evaluated.
            let expansion = expand_macro(&mac, operands, span, dynamic_env.as_ref())?;
            trace!(name = %mac.name, expansion = %expansion, "macro expanded");
            Ok(Step::Eval {
                node: expansion,
                env,
                dynamic_env,
            })
        }
        Sexpr::Procedure(procedure) => {
            let args = eval_args(operands, &env, dynamic_env.as_ref())?;
            Ok(Step::Continue {
                procedure,
                args,
                env,
                dynamic_env,
                span,
            })
        }
        other => Err(EvalError::NotCallable {
            name: pair.car.as_symbol().map(str::to_string),
            value: other.to_string(),
            span: pair.car.span,
        }),
    }
}

// Arguments are evaluated left to right in the caller's environment.
fn eval_args(operands: &Node, env: &Env, dynamic_env: Option<&Env>) -> EvalResult<Vec<Node>> {
    let mut values = Vec::new();
    let mut current = operands;
    loop {
        match &current.kind {
            Sexpr::Nil => return Ok(values),
            Sexpr::Pair(pair) => {
                values.push(evaluate(pair.car.clone(), env.clone(), dynamic_env.cloned())?);
                current = &pair.cdr;
            }
            _ => {
                return Err(EvalError::InvalidArguments(
                    format!("argument list must be a proper list, got . {}", current),
                    current.span,
                ));
            }
        }
    }
}

fn apply_step(
    procedure: Procedure,
    args: Vec<Node>,
    env: Env,
    dynamic_env: Option<Env>,
    span: Span,
) -> EvalResult<Step> {
    match procedure {
        Procedure::Primitive(func, _) => {
            let ctx = CallContext::new(&env, dynamic_env.as_ref(), span);
            let value = func(args, &ctx)?;
            match ctx.tail_call.into_inner() {
                Some((procedure, args)) => Ok(Step::Continue {
                    procedure,
                    args,
                    env,
                    dynamic_env,
                    span,
                }),
                None => Ok(Step::Done(value)),
            }
        }
        Procedure::Lambda(lambda) => {
            let parent = match &dynamic_env {
                Some(active) => active.clone(),
                None => lambda.env.clone(),
            };
            let frame = Environment::inherit(&parent, lambda.name.as_deref());
            bind_params(&lambda, args, &frame, span)?;
            let dynamic_env = dynamic_env.map(|_| frame.clone());
            eval_sequence(&lambda.body, span, frame, dynamic_env)
        }
    }
}

fn bind_params(lambda: &Lambda, args: Vec<Node>, frame: &Env, span: Span) -> EvalResult<()> {
    let who = lambda.name.as_deref().unwrap_or("lambda");
    let mut frame = frame.borrow_mut();
    match &lambda.params {
        Params::Fixed(names) => {
            if names.len() != args.len() {
                return Err(EvalError::InvalidArguments(
                    format!(
                        "'{}' expects exactly {} arguments, got {}",
                        who,
                        names.len(),
                        args.len()
                    ),
                    span,
                ));
            }
            for (name, value) in names.iter().zip(args) {
                frame.define(name.clone(), value);
            }
        }
        Params::Rest(names, rest) => {
            if args.len() < names.len() {
                return Err(EvalError::InvalidArguments(
                    format!(
                        "'{}' expects at least {} arguments, got {}",
                        who,
                        names.len(),
                        args.len()
                    ),
                    span,
                ));
            }
            let mut args = args.into_iter();
            for (name, value) in names.iter().zip(args.by_ref()) {
                frame.define(name.clone(), value);
            }
            frame.define(rest.clone(), Node::new_list(args.collect(), span));
        }
    }
    Ok(())
}

/// Evaluates all but the last form for effect and hands the last one back to
/// the trampoline. An empty sequence yields the no-value result.
fn eval_sequence(body: &[Node], span: Span, env: Env, dynamic_env: Option<Env>) -> EvalResult<Step> {
    match body.split_last() {
        None => Ok(Step::Done(Node::new_undefined(span))),
        Some((last, init)) => {
            for form in init {
                evaluate(form.clone(), env.clone(), dynamic_env.clone())?;
            }
            Ok(Step::Eval {
                node: last.clone(),
                env,
                dynamic_env,
            })
        }
    }
}

// --- Special forms ---

fn proper_list(operands: &Node, form: &str) -> EvalResult<Vec<Node>> {
    operands.list_to_vec().ok_or_else(|| {
        EvalError::InvalidSpecialForm(format!("{} must be a proper list", form), operands.span)
    })
}

fn expect_symbol(node: &Node, form: &str) -> EvalResult<String> {
    node.as_symbol().map(str::to_string).ok_or_else(|| {
        EvalError::InvalidSpecialForm(
            format!("{} expects a symbol, got {}", form, node),
            node.span,
        )
    })
}

fn eval_quote(operands: &Node, span: Span) -> EvalResult<Step> {
    match proper_list(operands, "quote")?.as_slice() {
        [datum] => Ok(Step::Done(datum.clone())),
        _ => Err(EvalError::InvalidSpecialForm(
            "quote expects exactly one argument".to_string(),
            span,
        )),
    }
}

fn eval_define(operands: &Node, span: Span, env: &Env, dynamic_env: Option<&Env>) -> EvalResult<Step> {
    let operands = proper_list(operands, "define")?;
    let (target, rest) = operands.split_first().ok_or_else(|| {
        EvalError::InvalidSpecialForm("define expects a name and a value".to_string(), span)
    })?;

    let (name, value) = match (&target.kind, rest) {
        (Sexpr::Symbol(name), [expr]) => {
            let value = evaluate(expr.clone(), env.clone(), dynamic_env.cloned())?;
            (name.clone(), value)
        }
        // (define (name . params) body...)
        (Sexpr::Pair(signature), body) => {
            let name = expect_symbol(&signature.car, "define")?;
            let lambda = make_lambda(Some(name.clone()), &signature.cdr, body, span, env)?;
            (name, lambda)
        }
        _ => {
            return Err(EvalError::InvalidSpecialForm(
                "define expects (define name value) or (define (name params...) body...)"
                    .to_string(),
                span,
            ));
        }
    };
    env.borrow_mut().define(name, value);
    Ok(Step::Done(Node::new_undefined(span)))
}

fn eval_lambda(operands: &Node, span: Span, env: &Env) -> EvalResult<Step> {
    let operands = proper_list(operands, "lambda")?;
    match operands.split_first() {
        Some((params, body)) => Ok(Step::Done(make_lambda(None, params, body, span, env)?)),
        None => Err(EvalError::InvalidSpecialForm(
            "lambda expects a parameter list and a body".to_string(),
            span,
        )),
    }
}

fn make_lambda(
    name: Option<String>,
    params: &Node,
    body: &[Node],
    span: Span,
    env: &Env,
) -> EvalResult {
    if body.is_empty() {
        return Err(EvalError::InvalidSpecialForm(
            "lambda expects at least one body expression".to_string(),
            span,
        ));
    }
    let lambda = Lambda {
        name,
        params: parse_params(params)?,
        body: body.to_vec(),
        env: env.clone(),
    };
    Ok(Node::new(
        Sexpr::Procedure(Procedure::Lambda(Rc::new(lambda))),
        span,
    ))
}

/// `(a b)`, `(a b . rest)`, or a bare symbol collecting every argument.
fn parse_params(params: &Node) -> EvalResult<Params> {
    let mut names = Vec::new();
    let mut current = params;
    loop {
        match &current.kind {
            Sexpr::Nil => return Ok(Params::Fixed(names)),
            Sexpr::Symbol(rest) => return Ok(Params::Rest(names, rest.clone())),
            Sexpr::Pair(pair) => {
                names.push(expect_symbol(&pair.car, "lambda parameter")?);
                current = &pair.cdr;
            }
            _ => {
                return Err(EvalError::InvalidSpecialForm(
                    format!("invalid parameter list: {}", params),
                    params.span,
                ));
            }
        }
    }
}

fn eval_let(operands: &Node, span: Span, env: &Env, dynamic_env: Option<Env>) -> EvalResult<Step> {
    let operands = proper_list(operands, "let")?;
    let (bindings, body) = operands.split_first().ok_or_else(|| {
        EvalError::InvalidSpecialForm("let expects a binding list and a body".to_string(), span)
    })?;

    // Every value is computed in the enclosing environment before any name is bound.
    let mut values = Vec::new();
    for binding in proper_list(bindings, "let bindings")? {
        match binding.list_to_vec().as_deref() {
            Some([name, expr]) => {
                let name = expect_symbol(name, "let")?;
                let value = evaluate(expr.clone(), env.clone(), dynamic_env.clone())?;
                values.push((name, value));
            }
            _ => {
                return Err(EvalError::InvalidSpecialForm(
                    format!("let binding must be (name value), got {}", binding),
                    binding.span,
                ));
            }
        }
    }

    let frame = Environment::inherit(env, None);
    {
        let mut frame = frame.borrow_mut();
        for (name, value) in values {
            frame.define(name, value);
        }
    }
    let dynamic_env = dynamic_env.map(|_| frame.clone());
    eval_sequence(body, span, frame, dynamic_env)
}

fn eval_if(operands: &Node, span: Span, env: Env, dynamic_env: Option<Env>) -> EvalResult<Step> {
    let operands = proper_list(operands, "if")?;
    if let [condition, consequent, maybe_alternate @ ..] = operands.as_slice()
        && maybe_alternate.len() <= 1
    {
        let condition_result = evaluate(condition.clone(), env.clone(), dynamic_env.clone())?;
        let branch = if condition_result.is_truthy() {
            consequent
        } else {
            match maybe_alternate {
                [alternate] => alternate,
                _ => return Ok(Step::Done(Node::new_undefined(span))),
            }
        };
        Ok(Step::Eval {
            node: branch.clone(),
            env,
            dynamic_env,
        })
    } else {
        Err(EvalError::InvalidSpecialForm(
            "if expects condition, consequent, and optional alternate".to_string(),
            span, // Span of the whole (if ...) form
        ))
    }
}

fn eval_set(operands: &Node, span: Span, env: &Env, dynamic_env: Option<&Env>) -> EvalResult<Step> {
    match proper_list(operands, "set!")?.as_slice() {
        [target, expr] => {
            let name = expect_symbol(target, "set!")?;
            let value = evaluate(expr.clone(), env.clone(), dynamic_env.cloned())?;
            env.borrow_mut().set(&name, value, target.span)?;
            Ok(Step::Done(Node::new_undefined(span)))
        }
        _ => Err(EvalError::InvalidSpecialForm(
            "set! expects a name and a value".to_string(),
            span,
        )),
    }
}

fn eval_while(operands: &Node, span: Span, env: &Env, dynamic_env: Option<&Env>) -> EvalResult<Step> {
    let operands = proper_list(operands, "while")?;
    let (condition, body) = operands.split_first().ok_or_else(|| {
        EvalError::InvalidSpecialForm("while expects a condition".to_string(), span)
    })?;
    while evaluate(condition.clone(), env.clone(), dynamic_env.cloned())?.is_truthy() {
        for form in body {
            evaluate(form.clone(), env.clone(), dynamic_env.cloned())?;
        }
    }
    Ok(Step::Done(Node::new_undefined(span)))
}

// (defmacro (name argname) body...)
fn eval_defmacro(operands: &Node, span: Span, env: &Env) -> EvalResult<Step> {
    let operands = proper_list(operands, "defmacro")?;
    let invalid = || {
        EvalError::InvalidSpecialForm(
            "defmacro expects (defmacro (name argname) body...)".to_string(),
            span,
        )
    };
    let (signature, body) = operands.split_first().ok_or_else(invalid)?;
    if body.is_empty() {
        return Err(invalid());
    }
    let (name, param) = match signature.list_to_vec().as_deref() {
        Some([name, param]) => (expect_symbol(name, "defmacro")?, expect_symbol(param, "defmacro")?),
        _ => return Err(invalid()),
    };
    let mac = Macro {
        name: name.clone(),
        param,
        body: body.to_vec(),
        env: env.clone(),
    };
    env.borrow_mut()
        .define(name, Node::new(Sexpr::Macro(Rc::new(mac)), span));
    Ok(Step::Done(Node::new_undefined(span)))
}

/// Runs the macro body with its parameter bound to the unevaluated operands.
fn expand_macro(mac: &Macro, operands: &Node, span: Span, dynamic_env: Option<&Env>) -> EvalResult {
    let parent = match dynamic_env {
        Some(active) => active.clone(),
        None => mac.env.clone(),
    };
    let frame = Environment::inherit(&parent, None);
    frame
        .borrow_mut()
        .define(mac.param.clone(), operands.clone());
    let dynamic_env = dynamic_env.map(|_| frame.clone());
    run(eval_sequence(&mac.body, span, frame, dynamic_env)?)
}

// --- Quasiquote ---

fn eval_quasiquote(operands: &Node, span: Span, env: &Env, dynamic_env: Option<&Env>) -> EvalResult<Step> {
    match proper_list(operands, "quasiquote")?.as_slice() {
        [template] => Ok(Step::Done(quasi(template, 1, env, dynamic_env)?)),
        _ => Err(EvalError::InvalidSpecialForm(
            "quasiquote expects exactly one argument".to_string(),
            span,
        )),
    }
}

// `(tag x)` -> Some(x)
fn tagged_operand<'a>(node: &'a Node, tag: &str) -> Option<&'a Node> {
    let pair = node.as_pair()?;
    if pair.car.as_symbol() != Some(tag) {
        return None;
    }
    let rest = pair.cdr.as_pair()?;
    matches!(rest.cdr.kind, Sexpr::Nil).then_some(&rest.car)
}

fn rewrap(tag: &str, inner: Node, template: &Node) -> Node {
    Node::new_list(
        vec![Node::new_symbol(tag.to_string(), template.span), inner],
        template.span,
    )
}

/// Copies `template`, evaluating unquotes that belong to the outermost
/// quasiquote. `depth` counts the quasiquotes enclosing the current position.
fn quasi(template: &Node, depth: usize, env: &Env, dynamic_env: Option<&Env>) -> EvalResult {
    let Some(pair) = template.as_pair() else {
        return Ok(template.clone());
    };

    if let Some(operand) = tagged_operand(template, "unquote") {
        return if depth == 1 {
            evaluate(operand.clone(), env.clone(), dynamic_env.cloned())
        } else {
            Ok(rewrap("unquote", quasi(operand, depth - 1, env, dynamic_env)?, template))
        };
    }
    if let Some(operand) = tagged_operand(template, "unquote-splicing") {
        // Reaching a splice here means it is not in list-element position.
        return if depth == 1 {
            Err(EvalError::InvalidSpecialForm(
                "unquote-splicing is only valid as a list element".to_string(),
                template.span,
            ))
        } else {
            Ok(rewrap(
                "unquote-splicing",
                quasi(operand, depth - 1, env, dynamic_env)?,
                template,
            ))
        };
    }
    if let Some(operand) = tagged_operand(template, "quasiquote") {
        return Ok(rewrap("quasiquote", quasi(operand, depth + 1, env, dynamic_env)?, template));
    }

    if depth == 1
        && let Some(operand) = tagged_operand(&pair.car, "unquote-splicing")
    {
        let value = evaluate(operand.clone(), env.clone(), dynamic_env.cloned())?;
        let items = value.list_to_vec().ok_or_else(|| {
            EvalError::InvalidSpecialForm(
                format!("unquote-splicing expects a list, got {}", value),
                pair.car.span,
            )
        })?;
        let cdr = quasi(&pair.cdr, depth, env, dynamic_env)?;
        return Ok(Node::list_with_tail(items, cdr, template.span));
    }

    let car = quasi(&pair.car, depth, env, dynamic_env)?;
    let cdr = quasi(&pair.cdr, depth, env, dynamic_env)?;
    Ok(Node::new_pair(car, cdr, template.span))
}
