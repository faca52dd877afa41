use crate::environment::Environment;
use crate::evaluator::{CallContext, EvalResult};
use crate::number::Number;
use crate::source::Span;
use std::cell::RefCell;
use std::fmt; // For custom display formatting
use std::rc::Rc;

/// An S-expression together with the source span it was read from.
///
/// Equality ignores spans: two nodes are equal when their data is equal, no
/// matter where (or whether) they appeared in source text.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: Sexpr, // The actual S-expression data
    pub span: Span,  // The source span it covers
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

/// Represents an S-expression (Symbolic Expression).
/// This enum is the core data structure for both code (AST) and data.
#[derive(Debug, Clone, PartialEq)]
pub enum Sexpr {
    Symbol(String),        // e.g., +, variable-name, quote
    Number(Number),        // See crate::number for the tower
    Boolean(bool),         // #t or #f
    String(String),        // For string literals "hello\n"
    Regex(RegexLiteral),   // /foo./g
    Pair(Rc<Pair>),        // Cons cell, shared and immutable once built
    Nil,                   // Represents the empty list '()
    Undefined,             // The no-value result of define, set!, while...
    Procedure(Procedure),  // Closures and natives
    Macro(Rc<Macro>),      // defmacro transformers
}

#[derive(Debug, Clone)]
pub struct Pair {
    pub car: Node,
    pub cdr: Node,
}

// Lists can be hundreds of thousands of cells long, so comparison and
// teardown walk the cdr chain in a loop.
impl PartialEq for Pair {
    fn eq(&self, other: &Self) -> bool {
        let (mut a, mut b) = (self, other);
        loop {
            if std::ptr::eq(a, b) {
                return true;
            }
            if a.car != b.car {
                return false;
            }
            match (&a.cdr.kind, &b.cdr.kind) {
                (Sexpr::Pair(next_a), Sexpr::Pair(next_b)) => {
                    a = &**next_a;
                    b = &**next_b;
                }
                (tail_a, tail_b) => return tail_a == tail_b,
            }
        }
    }
}

impl Drop for Pair {
    fn drop(&mut self) {
        let mut next = std::mem::replace(&mut self.cdr.kind, Sexpr::Nil);
        while let Sexpr::Pair(pair_ptr) = next {
            next = match Rc::try_unwrap(pair_ptr) {
                Ok(mut pair) => std::mem::replace(&mut pair.cdr.kind, Sexpr::Nil),
                Err(_) => break,
            };
        }
    }
}

/// A slash-delimited regex literal. `source` is kept exactly as written so the
/// literal prints back unchanged; flags without a `regex` equivalent (such as
/// `g`) are only remembered.
#[derive(Clone)]
pub struct RegexLiteral {
    pub source: String,
    pub flags: String,
    pub regex: regex::Regex,
}

impl RegexLiteral {
    pub fn new(source: &str, flags: &str) -> Result<Self, regex::Error> {
        let regex = regex::RegexBuilder::new(&source.replace("\\/", "/"))
            .case_insensitive(flags.contains('i'))
            .multi_line(flags.contains('m'))
            .dot_matches_new_line(flags.contains('s'))
            .ignore_whitespace(flags.contains('x'))
            .build()?;
        Ok(RegexLiteral {
            source: source.to_string(),
            flags: flags.to_string(),
            regex,
        })
    }
}

impl PartialEq for RegexLiteral {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.flags == other.flags
    }
}

impl fmt::Debug for RegexLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Regex(/{}/{})", self.source, self.flags)
    }
}

pub type PrimitiveFunc = fn(Vec<Node>, &CallContext) -> EvalResult;

#[derive(Clone)] // Need Clone for Sexpr::Procedure
pub enum Procedure {
    Primitive(PrimitiveFunc, String), // The function pointer and its name (for display/debug)
    Lambda(Rc<Lambda>),
}

impl Procedure {
    pub fn name(&self) -> Option<&str> {
        match self {
            Procedure::Primitive(_, name) => Some(name),
            Procedure::Lambda(lambda) => lambda.name.as_deref(),
        }
    }
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Procedure::Primitive(_, name) => write!(f, "Primitive({})", name),
            Procedure::Lambda(lambda) => write!(f, "{:?}", lambda),
        }
    }
}

// Primitives compare by name, closures by identity.
impl PartialEq for Procedure {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Procedure::Primitive(_, n1), Procedure::Primitive(_, n2)) => n1 == n2,
            (Procedure::Lambda(l1), Procedure::Lambda(l2)) => Rc::ptr_eq(l1, l2),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    Fixed(Vec<String>),
    /// `(a b . rest)`, or a bare symbol with no leading names.
    Rest(Vec<String>, String),
}

/// A closure: parameters, body forms, and the environment it was created in.
pub struct Lambda {
    pub name: Option<String>,
    pub params: Params,
    pub body: Vec<Node>,
    pub env: Rc<RefCell<Environment>>,
}

impl fmt::Debug for Lambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The captured environment is left out, it usually contains this lambda.
        f.debug_struct("Lambda")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

/// A `defmacro` transformer. `param` receives the unevaluated argument list.
pub struct Macro {
    pub name: String,
    pub param: String,
    pub body: Vec<Node>,
    pub env: Rc<RefCell<Environment>>,
}

impl fmt::Debug for Macro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Macro")
            .field("name", &self.name)
            .field("param", &self.param)
            .finish_non_exhaustive()
    }
}

// Macros are only ever equal to themselves.
impl PartialEq for Macro {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

/// Nested-vector view of list structure, used to build and inspect pair
/// chains without spelling out every cons.
#[derive(Debug, Clone, PartialEq)]
pub enum Tree {
    Atom(Sexpr),
    List(Vec<Tree>),
}

impl Node {
    pub fn new(kind: Sexpr, span: Span) -> Self {
        Node { kind, span }
    }

    pub fn new_number(n: impl Into<Number>, span: Span) -> Self {
        Node::new(Sexpr::Number(n.into()), span)
    }

    pub fn new_symbol(name: String, span: Span) -> Self {
        Node::new(Sexpr::Symbol(name), span)
    }

    pub fn new_string(s: &str, span: Span) -> Self {
        Node::new(Sexpr::String(s.to_string()), span)
    }

    pub fn new_bool(b: bool, span: Span) -> Self {
        Node::new(Sexpr::Boolean(b), span)
    }

    pub fn new_nil(span: Span) -> Self {
        Node::new(Sexpr::Nil, span)
    }

    pub fn new_undefined(span: Span) -> Self {
        Node::new(Sexpr::Undefined, span)
    }

    pub fn new_pair(car: Node, cdr: Node, span: Span) -> Self {
        Node::new(Sexpr::Pair(Rc::new(Pair { car, cdr })), span)
    }

    pub fn new_primitive(func: PrimitiveFunc, name: &str, span: Span) -> Self {
        Node::new(
            Sexpr::Procedure(Procedure::Primitive(func, name.to_string())),
            span,
        )
    }

    /// Builds `(quote_symbol expr)`, e.g. `'x` -> `(quote x)`.
    pub fn new_quoted_expr(expr: Node, quote_symbol: &str, quote_span: Span) -> Self {
        let span = quote_span.merge(&expr.span);
        let symbol = Node::new_symbol(quote_symbol.to_string(), quote_span);
        Node::new_list(vec![symbol, expr], span)
    }

    pub fn new_quote(expr: Node, quote_span: Span) -> Self {
        Node::new_quoted_expr(expr, "quote", quote_span)
    }

    /// A proper list ending in Nil.
    pub fn new_list(items: Vec<Node>, span: Span) -> Self {
        Node::list_with_tail(items, Node::new_nil(Span::new(span.end, span.end)), span)
    }

    /// Right-folds `items` onto `tail`. Each inner pair spans from its element
    /// to the end of the whole list.
    pub fn list_with_tail(items: Vec<Node>, tail: Node, span: Span) -> Self {
        let mut list = items.into_iter().rev().fold(tail, |cdr, car| {
            let pair_span = Span::new(car.span.start, span.end.max(cdr.span.end));
            Node::new_pair(car, cdr, pair_span)
        });
        list.span = span;
        list
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match &self.kind {
            Sexpr::Symbol(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_pair(&self) -> Option<&Pair> {
        match &self.kind {
            Sexpr::Pair(pair) => Some(pair),
            _ => None,
        }
    }

    /// `#f`, nil, and the no-value result are false; everything else is true.
    pub fn is_truthy(&self) -> bool {
        !matches!(
            self.kind,
            Sexpr::Boolean(false) | Sexpr::Nil | Sexpr::Undefined
        )
    }

    /// The elements of a proper list, or `None` for an improper list or atom.
    pub fn list_to_vec(&self) -> Option<Vec<Node>> {
        let mut items = Vec::new();
        let mut current = self;
        loop {
            match &current.kind {
                Sexpr::Nil => return Some(items),
                Sexpr::Pair(pair) => {
                    items.push(pair.car.clone());
                    current = &pair.cdr;
                }
                _ => return None,
            }
        }
    }

    pub fn from_tree(tree: &Tree) -> Node {
        match tree {
            Tree::Atom(kind) => Node::new(kind.clone(), Span::default()),
            Tree::List(items) => {
                Node::new_list(items.iter().map(Node::from_tree).collect(), Span::default())
            }
        }
    }

    /// Inverse of [`Node::from_tree`]. Proper lists (including nil) become
    /// `Tree::List`; atoms and improper lists are kept whole as `Tree::Atom`.
    pub fn to_tree(&self) -> Tree {
        match self.list_to_vec() {
            Some(items) => Tree::List(items.iter().map(Node::to_tree).collect()),
            None => Tree::Atom(self.kind.clone()),
        }
    }

    /// Text as `string`/`concat` see it: strings without quotes or escapes.
    pub fn to_display_string(&self) -> String {
        match &self.kind {
            Sexpr::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Delegate to Sexpr's Display implementation
        write!(f, "{}", self.kind)
    }
}

impl Sexpr {
    pub fn type_name(&self) -> &'static str {
        match self {
            Sexpr::Number(_) => "number",
            Sexpr::Symbol(_) => "symbol",
            Sexpr::Boolean(_) => "boolean",
            Sexpr::String(_) => "string",
            Sexpr::Regex(_) => "regex",
            Sexpr::Pair(_) => "pair",
            Sexpr::Nil => "nil",
            Sexpr::Undefined => "undefined",
            Sexpr::Procedure(_) => "function",
            Sexpr::Macro(_) => "macro",
        }
    }
}

// Implement Display trait for pretty printing the Sexpr values
impl fmt::Display for Sexpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sexpr::Symbol(s) => write!(f, "{}", s),
            Sexpr::Number(n) => write!(f, "{}", n),
            Sexpr::Boolean(b) => write!(f, "{}", if *b { "#t" } else { "#f" }),
            Sexpr::Pair(pair) => {
                write!(f, "({}", pair.car)?;
                let mut rest = &pair.cdr;
                loop {
                    match &rest.kind {
                        Sexpr::Nil => break,
                        Sexpr::Pair(next) => {
                            write!(f, " {}", next.car)?;
                            rest = &next.cdr;
                        }
                        atom => {
                            write!(f, " . {}", atom)?;
                            break;
                        }
                    }
                }
                write!(f, ")")
            }
            Sexpr::Nil => write!(f, "()"),
            Sexpr::Undefined => write!(f, "#<undefined>"),
            Sexpr::String(str) => {
                write!(
                    f,
                    "\"{}\"",
                    str.chars().fold(String::new(), |mut acc, char| {
                        match char {
                            '"' => acc.push_str("\\\""),
                            '\\' => acc.push_str("\\\\"),
                            '\n' => acc.push_str("\\n"),
                            '\r' => acc.push_str("\\r"),
                            '\t' => acc.push_str("\\t"),
                            c => acc.push(c),
                        }
                        acc
                    })
                )
            }
            Sexpr::Regex(regex) => write!(f, "/{}/{}", regex.source, regex.flags),
            Sexpr::Procedure(procedure) => match procedure {
                Procedure::Primitive(_, name) => write!(f, "#<primitive:{}>", name),
                Procedure::Lambda(lambda) => match &lambda.name {
                    Some(name) => write!(f, "#<procedure:{}>", name),
                    None => write!(f, "#<procedure>"),
                },
            },
            Sexpr::Macro(mac) => write!(f, "#<macro:{}>", mac.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(n: i64) -> Tree {
        Tree::Atom(Sexpr::Number(Number::Integer(n)))
    }

    fn pair(car: Node, cdr: Node) -> Node {
        Node::new_pair(car, cdr, Span::default())
    }

    fn num(n: i64) -> Node {
        Node::new_number(n, Span::default())
    }

    fn nil() -> Node {
        Node::new_nil(Span::default())
    }

    fn long_list(len: i64) -> Node {
        (0..len).fold(nil(), |tail, i| pair(num(i), tail))
    }

    #[test]
    fn test_long_lists_compare_and_drop() {
        let a = long_list(300_000);
        let b = long_list(300_000);
        assert_eq!(a, b);
        assert_eq!(a, a.clone());

        let shorter = long_list(299_999);
        assert_ne!(a, shorter);
        let different_tail = pair(num(2), pair(num(1), num(0)));
        assert_ne!(long_list(3), different_tail);
    }

    #[test]
    fn test_shared_tail_survives_drop() {
        let tail = long_list(10);
        let head = pair(num(99), tail.clone());
        drop(head);
        assert_eq!(tail.list_to_vec().map(|items| items.len()), Some(10));
    }

    #[test]
    fn test_from_tree_builds_pairs() {
        // [1, 2, [3, 4], [5, 6]]
        let tree = Tree::List(vec![
            int(1),
            int(2),
            Tree::List(vec![int(3), int(4)]),
            Tree::List(vec![int(5), int(6)]),
        ]);
        let expected = pair(
            num(1),
            pair(
                num(2),
                pair(
                    pair(num(3), pair(num(4), nil())),
                    pair(pair(num(5), pair(num(6), nil())), nil()),
                ),
            ),
        );
        assert_eq!(Node::from_tree(&tree), expected);
        assert_eq!(expected.to_tree(), tree);
    }

    #[test]
    fn test_tree_round_trip_nested() {
        // [[1], 2, [3, 4], [5, [1, [2, 3]], [1, 2]]]
        let tree = Tree::List(vec![
            Tree::List(vec![int(1)]),
            int(2),
            Tree::List(vec![int(3), int(4)]),
            Tree::List(vec![
                int(5),
                Tree::List(vec![int(1), Tree::List(vec![int(2), int(3)])]),
                Tree::List(vec![int(1), int(2)]),
            ]),
        ]);
        assert_eq!(Node::from_tree(&tree).to_tree(), tree);
    }

    #[test]
    fn test_improper_list_stays_atom_in_tree() {
        let dotted = pair(num(1), num(2));
        assert!(matches!(dotted.to_tree(), Tree::Atom(Sexpr::Pair(_))));
        assert!(dotted.list_to_vec().is_none());
    }

    #[test]
    fn test_node_equality_ignores_spans() {
        let a = Node::new_symbol("foo".to_string(), Span::new(0, 3));
        let b = Node::new_symbol("foo".to_string(), Span::new(10, 13));
        assert_eq!(a, b);
    }

    #[test]
    fn test_display() {
        let list = Node::new_list(vec![num(1), num(2), num(3)], Span::default());
        assert_eq!(list.to_string(), "(1 2 3)");
        assert_eq!(pair(num(1), num(2)).to_string(), "(1 . 2)");
        assert_eq!(
            pair(num(1), pair(num(2), num(3))).to_string(),
            "(1 2 . 3)"
        );
        assert_eq!(nil().to_string(), "()");
        assert_eq!(
            Node::new_string("a\"b", Span::default()).to_string(),
            r#""a\"b""#
        );
        assert_eq!(
            Node::new_string("a\"b", Span::default()).to_display_string(),
            "a\"b"
        );
        let regex = RegexLiteral::new("foo.", "g").unwrap();
        assert_eq!(Sexpr::Regex(regex).to_string(), "/foo./g");
    }

    #[test]
    fn test_truthiness() {
        assert!(!Node::new_bool(false, Span::default()).is_truthy());
        assert!(!nil().is_truthy());
        assert!(!Node::new_undefined(Span::default()).is_truthy());
        assert!(num(0).is_truthy());
        assert!(Node::new_string("", Span::default()).is_truthy());
    }

    #[test]
    fn test_regex_literal_flags() {
        let regex = RegexLiteral::new(r"( \/)", "gi").unwrap();
        assert!(regex.regex.is_match("( /)"));
        let insensitive = RegexLiteral::new("abc", "i").unwrap();
        assert!(insensitive.regex.is_match("ABC"));
        assert!(RegexLiteral::new("(", "").is_err());
    }
}
