use std::rc::Rc;

use crate::evaluator::CallContext;
use crate::number::Number;
use crate::types::Pair;
use crate::{EvalError, EvalResult, Node, Sexpr, Span};

// Checks the number of arguments
macro_rules! check_arity {
    ($args:expr, $expected:expr, $span:expr, $name:expr) => {
        if $args.len() != $expected {
            return Err(EvalError::InvalidArguments(
                format!(
                    "Primitive '{}' expects exactly {} arguments, got {}",
                    $name,
                    $expected,
                    $args.len()
                ),
                $span,
            ));
        }
    };
    // Variant for minimum number of args
    ($args:expr, min $expected:expr, $span:expr, $name:expr) => {
        if $args.len() < $expected {
            return Err(EvalError::InvalidArguments(
                format!(
                    "Primitive '{}' expects at least {} arguments, got {}",
                    $name,
                    $expected,
                    $args.len()
                ),
                $span,
            ));
        }
    };
}

// Extracts a number from a Node or returns an InvalidArguments error
macro_rules! expect_number {
    ($node:expr, $span:expr, $name:expr, $arg_pos:expr) => {
        match &$node.kind {
            Sexpr::Number(n) => n,
            other => {
                return Err(EvalError::InvalidArguments(
                    format!(
                        "Primitive '{}' expects a number for argument {}, got {}",
                        $name,
                        $arg_pos,
                        other.type_name()
                    ),
                    $span, // Use call span for arg type errors
                ));
            }
        }
    };
}

// (pred? x) -> boolean
macro_rules! is_type {
    ($args:expr, $type:pat, $name:expr, $span:expr) => {{
        check_arity!($args, 1, $span, $name);
        Ok(Node::new_bool(matches!($args[0].kind, $type), $span))
    }};
}

fn number_node(n: Number, span: Span) -> EvalResult {
    Ok(Node::new(Sexpr::Number(n), span))
}

fn fold_numbers<F: Fn(&Number, &Number) -> Number>(
    args: &[Node],
    span: Span,
    start: Number,
    func: F,
    operator: &str,
) -> EvalResult {
    let mut acc = start;
    for (i, node) in args.iter().enumerate() {
        let num = expect_number!(node, span, operator, i + 1);
        acc = func(&acc, num);
    }
    number_node(acc, span)
}

pub fn prim_add(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    // (+) -> 0
    // (+ 1 2 3) -> 6
    fold_numbers(&args, ctx.span, Number::Integer(0), Number::add, "+")
}

pub fn prim_sub(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    // (- x) -> -x
    // (- x y z) -> x - y - z
    check_arity!(args, min 1, ctx.span, "-");
    let first = expect_number!(args[0], ctx.span, "-", 1);
    if args.len() == 1 {
        return number_node(first.neg(), ctx.span);
    }
    let mut result = first.clone();
    for (i, node) in args.iter().enumerate().skip(1) {
        result = result.sub(expect_number!(node, ctx.span, "-", i + 1));
    }
    number_node(result, ctx.span)
}

pub fn prim_mul(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    // (*) -> 1
    // (* 1 2 3) -> 6
    fold_numbers(&args, ctx.span, Number::Integer(1), Number::mul, "*")
}

pub fn prim_div(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    // (/ x) -> 1/x
    // (/ x y z) -> x / y / z
    check_arity!(args, min 1, ctx.span, "/");
    let first = expect_number!(args[0], ctx.span, "/", 1);
    let divide = |left: &Number, right: &Number| {
        left.div(right)
            .map_err(|err| EvalError::Number(err, ctx.span))
    };
    if args.len() == 1 {
        return number_node(divide(&Number::Integer(1), first)?, ctx.span);
    }
    let mut result = first.clone();
    for (i, node) in args.iter().enumerate().skip(1) {
        result = divide(&result, expect_number!(node, ctx.span, "/", i + 1))?;
    }
    number_node(result, ctx.span)
}

pub fn prim_expt(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    // (expt base exponent)
    check_arity!(args, 2, ctx.span, "expt");
    let base = expect_number!(args[0], ctx.span, "expt", 1);
    let exponent = expect_number!(args[1], ctx.span, "expt", 2);
    let result = base
        .pow(exponent)
        .map_err(|err| EvalError::Number(err, ctx.span))?;
    number_node(result, ctx.span)
}

fn compare_numbers<F: Fn(std::cmp::Ordering) -> bool>(
    args: &[Node],
    span: Span,
    compare: F,
    operator: &str,
) -> EvalResult {
    // (= n1 n2 ...) -> boolean
    check_arity!(args, min 2, span, operator);
    let mut last = expect_number!(args[0], span, operator, 1);
    let mut result = true;
    for (index, arg) in args.iter().enumerate().skip(1) {
        let value = expect_number!(arg, span, operator, index + 1);
        // NaN compares false against everything
        result = result && last.compare(value).is_some_and(&compare);
        last = value;
    }
    Ok(Node::new_bool(result, span))
}

pub fn prim_equals(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    compare_numbers(&args, ctx.span, |ord| ord.is_eq(), "=")
}

pub fn prim_less_than(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    compare_numbers(&args, ctx.span, |ord| ord.is_lt(), "<")
}

pub fn prim_less_than_or_equals(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    compare_numbers(&args, ctx.span, |ord| ord.is_le(), "<=")
}

pub fn prim_greater_than(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    compare_numbers(&args, ctx.span, |ord| ord.is_gt(), ">")
}

pub fn prim_greater_than_or_equals(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    compare_numbers(&args, ctx.span, |ord| ord.is_ge(), ">=")
}

/// `(== a b)`: numbers compare by value across representations, anything
/// else compares structurally.
pub fn prim_loose_equals(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    check_arity!(args, 2, ctx.span, "==");
    Ok(Node::new_bool(args[0].kind == args[1].kind, ctx.span))
}

/// `(eq? a b)`: atoms compare by value, pairs and closures by identity.
pub fn prim_is_eq(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    check_arity!(args, 2, ctx.span, "eq?");
    let same = match (&args[0].kind, &args[1].kind) {
        (Sexpr::Pair(a), Sexpr::Pair(b)) => Rc::ptr_eq(a, b),
        (Sexpr::Macro(a), Sexpr::Macro(b)) => Rc::ptr_eq(a, b),
        (a, b) => a == b,
    };
    Ok(Node::new_bool(same, ctx.span))
}

pub fn prim_not(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    check_arity!(args, 1, ctx.span, "not");
    Ok(Node::new_bool(!args[0].is_truthy(), ctx.span))
}

// --- List Primitives ---

pub fn prim_cons(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    // (cons a b) -> (a . b)
    check_arity!(args, 2, ctx.span, "cons");
    let mut args = args.into_iter();
    match (args.next(), args.next()) {
        (Some(car), Some(cdr)) => Ok(Node::new_pair(car, cdr, ctx.span)),
        _ => Err(EvalError::InvalidArguments(
            "Primitive 'cons' expects exactly 2 arguments".to_string(),
            ctx.span,
        )),
    }
}

fn expect_pair<'a>(node: &'a Node, operator: &str) -> EvalResult<&'a Pair> {
    node.as_pair().ok_or_else(|| {
        EvalError::InvalidArguments(
            format!(
                "{}: Expected a pair, got {}",
                operator,
                node.kind.type_name()
            ),
            node.span, // Span of the incorrect argument
        )
    })
}

pub fn prim_car(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    // (car list) -> first item
    check_arity!(args, 1, ctx.span, "car");
    Ok(expect_pair(&args[0], "car")?.car.clone())
}

pub fn prim_cdr(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    // (cdr list) -> rest of list
    check_arity!(args, 1, ctx.span, "cdr");
    Ok(expect_pair(&args[0], "cdr")?.cdr.clone())
}

pub fn prim_cadr(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    // (cadr list) -> second item
    check_arity!(args, 1, ctx.span, "cadr");
    let rest = &expect_pair(&args[0], "cadr")?.cdr;
    Ok(expect_pair(rest, "cadr")?.car.clone())
}

pub fn prim_list(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    Ok(Node::new_list(args, ctx.span))
}

// --- Strings, types, application ---

pub fn prim_concat(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    let joined: String = args.iter().map(Node::to_display_string).collect();
    Ok(Node::new_string(&joined, ctx.span))
}

pub fn prim_string(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    check_arity!(args, 1, ctx.span, "string");
    Ok(Node::new_string(&args[0].to_display_string(), ctx.span))
}

pub fn prim_type(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    check_arity!(args, 1, ctx.span, "type");
    Ok(Node::new_string(args[0].kind.type_name(), ctx.span))
}

/// `(apply f a b '(c d))` calls `f` with `a b c d`.
pub fn prim_apply(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    check_arity!(args, min 1, ctx.span, "apply");
    let mut args = args.into_iter();
    let procedure = match args.next().map(|node| node.kind) {
        Some(Sexpr::Procedure(procedure)) => procedure,
        other => {
            return Err(EvalError::NotCallable {
                name: None,
                value: other.map(|kind| kind.to_string()).unwrap_or_default(),
                span: ctx.span,
            });
        }
    };
    let mut call_args: Vec<Node> = args.collect();
    if let Some(last) = call_args.pop() {
        let spread = last.list_to_vec().ok_or_else(|| {
            EvalError::InvalidArguments(
                format!(
                    "Primitive 'apply' expects a list as its last argument, got {}",
                    last.kind.type_name()
                ),
                last.span,
            )
        })?;
        call_args.extend(spread);
    }
    ctx.tail_call(procedure, call_args)
}

// --- Type predicates ---

pub fn prim_is_null(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    is_type!(args, Sexpr::Nil, "null?", ctx.span)
}

pub fn prim_is_pair(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    is_type!(args, Sexpr::Pair(_), "pair?", ctx.span)
}

pub fn prim_is_number(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    is_type!(args, Sexpr::Number(_), "number?", ctx.span)
}

pub fn prim_is_boolean(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    is_type!(args, Sexpr::Boolean(_), "boolean?", ctx.span)
}

pub fn prim_is_symbol(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    is_type!(args, Sexpr::Symbol(_), "symbol?", ctx.span)
}

pub fn prim_is_string(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    is_type!(args, Sexpr::String(_), "string?", ctx.span)
}

pub fn prim_is_procedure(args: Vec<Node>, ctx: &CallContext) -> EvalResult {
    is_type!(args, Sexpr::Procedure(_), "procedure?", ctx.span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::evaluator::evaluate;
    use crate::parser::parse_str;

    fn eval(input: &str) -> EvalResult {
        let env = Environment::new_global_populated();
        let mut result = Node::new_undefined(Span::default());
        for form in parse_str(input).expect("parse") {
            result = evaluate(form, env.clone(), None)?;
        }
        Ok(result)
    }

    fn assert_eval_kind(input: &str, expected_kind: Sexpr) {
        match eval(input) {
            Ok(result_node) => assert_eq!(result_node.kind, expected_kind, "Input: '{}'", input),
            Err(e) => panic!("Evaluation failed for input '{}': {}", input, e),
        }
    }

    fn assert_eval_display(input: &str, expected: &str) {
        match eval(input) {
            Ok(result_node) => assert_eq!(result_node.to_string(), expected, "Input: '{}'", input),
            Err(e) => panic!("Evaluation failed for input '{}': {}", input, e),
        }
    }

    fn assert_arguments_error(input: &str) {
        assert!(
            matches!(eval(input), Err(EvalError::InvalidArguments(..))),
            "Input: '{}' should fail with invalid arguments, got {:?}",
            input,
            eval(input)
        );
    }

    fn int(n: i64) -> Sexpr {
        Sexpr::Number(Number::Integer(n))
    }

    fn float(f: f64) -> Sexpr {
        Sexpr::Number(Number::Float(f))
    }

    #[test]
    fn test_arithmetic() {
        assert_eval_kind("(+ 1 2)", int(3));
        assert_eval_kind("(+ 10 20 30 40)", int(100));
        assert_eval_kind("(+)", int(0)); // Add identity
        assert_eval_kind("(- 10 3)", int(7));
        assert_eval_kind("(- 5)", int(-5));
        assert_eval_kind("(- 10 3 2)", int(5));
        assert_eval_kind("(* 2 3 4)", int(24));
        assert_eval_kind("(*)", int(1)); // Multiply identity
        assert_eval_kind("(/ 10 2)", int(5));
        assert_eval_kind("(/ 10 4)", float(2.5));
        assert_eval_kind("(/ 20 2 5)", int(2));
        assert_eval_kind("(/ 5)", float(0.2)); // 1/5
        assert_eval_kind("(+ 1 2.5)", float(3.5));
        assert_eval_kind("(+ 1 (* 2 3))", int(7));
    }

    #[test]
    fn test_exact_results_grow() {
        assert_eval_display("(* 9223372036854775807 2)", "18446744073709551614");
        assert_eval_display("(expt 2 64)", "18446744073709551616");
        assert_eval_display("(- (expt 2 64) (expt 2 64))", "0");
        assert_eval_kind("(- (+ 9223372036854775807 1) 1)", int(i64::MAX));
    }

    #[test]
    fn test_division_by_zero() {
        assert!(matches!(eval("(/ 1 0)"), Err(EvalError::Number(..))));
        assert!(matches!(eval("(/ 0)"), Err(EvalError::Number(..))));
        assert!(matches!(
            eval("(/ 1.0 0)").map(|n| n.kind),
            Ok(Sexpr::Number(Number::Float(f))) if f.is_infinite()
        ));
    }

    #[test]
    fn test_comparison() {
        assert_eval_kind("(= 5 5 5 5)", Sexpr::Boolean(true));
        assert_eval_kind("(= 5 5 6)", Sexpr::Boolean(false));
        assert_eval_kind("(= 1 1.0)", Sexpr::Boolean(true));
        assert_eval_kind("(< 4 5 6)", Sexpr::Boolean(true));
        assert_eval_kind("(< 5 5 6)", Sexpr::Boolean(false));
        assert_eval_kind("(<= 5 5 6)", Sexpr::Boolean(true));
        assert_eval_kind("(>= 6 5 5)", Sexpr::Boolean(true));
        assert_eval_kind("(> 6 5 5)", Sexpr::Boolean(false));
        assert_eval_kind("(> (expt 2 70) 1.5)", Sexpr::Boolean(true));
    }

    #[test]
    fn test_equality() {
        assert_eval_kind("(== 10 10.0)", Sexpr::Boolean(true));
        assert_eval_kind("(== \"a\" \"a\")", Sexpr::Boolean(true));
        assert_eval_kind("(== '(1 2) (list 1 2))", Sexpr::Boolean(true));
        assert_eval_kind("(== 'a 'b)", Sexpr::Boolean(false));
        assert_eval_kind("(eq? 'a 'a)", Sexpr::Boolean(true));
        assert_eval_kind("(eq? (type car) \"function\")", Sexpr::Boolean(true));
        assert_eval_kind("(eq? '(1) '(1))", Sexpr::Boolean(false));
        assert_eval_kind("(define l '(1)) (eq? l l)", Sexpr::Boolean(true));
        assert_eval_kind("(eq? nil '())", Sexpr::Boolean(true));
        assert_eval_kind("(not #f)", Sexpr::Boolean(true));
        assert_eval_kind("(not nil)", Sexpr::Boolean(true));
        assert_eval_kind("(not 0)", Sexpr::Boolean(false));
    }

    #[test]
    fn test_lists() {
        assert_eval_display("(cons 1 (cons 2 (cons 3 nil)))", "(1 2 3)");
        assert_eval_display("(cons 1 2)", "(1 . 2)");
        assert_eval_display("(list 1 2 3)", "(1 2 3)");
        assert_eval_kind("(list)", Sexpr::Nil);
        assert_eval_kind("(car (list 1 2 3))", int(1));
        assert_eval_display("(cdr (list 1 2 3))", "(2 3)");
        assert_eval_kind("(cadr (list 1 2 3))", int(2));
        assert_eval_kind("(cdr (list 1))", Sexpr::Nil);
    }

    #[test]
    fn test_strings_and_types() {
        assert_eval_kind(
            r#"(concat "foo" "bar" 1)"#,
            Sexpr::String("foobar1".to_string()),
        );
        assert_eval_kind("(string 42)", Sexpr::String("42".to_string()));
        assert_eval_kind(r#"(string "x")"#, Sexpr::String("x".to_string()));
        assert_eval_display("(string '(1 \"a\"))", r#""(1 \"a\")""#);
        for (input, name) in [
            ("(type 1)", "number"),
            ("(type 1.5)", "number"),
            ("(type \"s\")", "string"),
            ("(type 'a)", "symbol"),
            ("(type '(1))", "pair"),
            ("(type nil)", "nil"),
            ("(type /a/)", "regex"),
            ("(type #t)", "boolean"),
            ("(type car)", "function"),
            ("(type (lambda () 1))", "function"),
            ("(type (if #f 1))", "undefined"),
        ] {
            assert_eval_kind(input, Sexpr::String(name.to_string()));
        }
    }

    #[test]
    fn test_apply() {
        assert_eval_kind("(apply + (list 1 2 3))", int(6));
        assert_eval_kind("(apply + 1 2 (list 3 4))", int(10));
        assert_eval_kind("(apply (lambda (a b) (- a b)) '(10 4))", int(6));
        assert_eval_kind("(apply list '())", Sexpr::Nil);
        assert!(matches!(eval("(apply 1 '())"), Err(EvalError::NotCallable { .. })));
        assert_arguments_error("(apply + 1)");
    }

    #[test]
    fn test_predicates() {
        assert_eval_kind("(null? '())", Sexpr::Boolean(true));
        assert_eval_kind("(null? '(1))", Sexpr::Boolean(false));
        assert_eval_kind("(pair? '(1))", Sexpr::Boolean(true));
        assert_eval_kind("(number? 1)", Sexpr::Boolean(true));
        assert_eval_kind("(boolean? #f)", Sexpr::Boolean(true));
        assert_eval_kind("(symbol? 'a)", Sexpr::Boolean(true));
        assert_eval_kind("(string? \"a\")", Sexpr::Boolean(true));
        assert_eval_kind("(procedure? car)", Sexpr::Boolean(true));
        assert_eval_kind("(procedure? 'car)", Sexpr::Boolean(false));
    }

    #[test]
    fn test_arity_errors() {
        assert_arguments_error("(-)");
        assert_arguments_error("(/)");
        assert_arguments_error("(=)");
        assert_arguments_error("(= 1)");
        assert_arguments_error("(cons 1)");
        assert_arguments_error("(car)");
        assert_arguments_error("(null? 1 2)");
    }

    #[test]
    fn test_type_errors() {
        assert_arguments_error("(+ 1 #t)");
        assert_arguments_error("(/ 1 \"hello\")");
        assert_arguments_error("(= 1 #f)");
        assert_arguments_error("(car 1)");
        assert_arguments_error("(car nil)");
        assert_arguments_error("(cadr '(1))");
    }
}
