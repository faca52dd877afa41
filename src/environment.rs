use crate::source::Span;
use crate::types::{Node, PrimitiveFunc, Sexpr};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

pub const GLOBAL_SCOPE_NAME: &str = "global";

// --- Environment Error ---
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnvError {
    #[error("{0} is not bound")]
    UnboundVariable(String, Span), // Symbol name, span where lookup happened
}

// --- Environment Definition ---

pub struct Environment {
    // Rc<RefCell<...>> gives shared ownership for closures capturing
    // environments and interior mutability for 'define' and 'set!'.
    name: String,
    outer: Option<Rc<RefCell<Environment>>>,
    bindings: HashMap<String, Node>, // Maps variable names to Nodes
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Bindings can hold closures over this very frame, so only names are shown.
        let mut names: Vec<&String> = self.bindings.keys().collect();
        names.sort();
        f.debug_struct("Environment")
            .field("name", &self.name)
            .field("bindings", &names)
            .field("outer", &self.outer.as_ref().map(|o| o.borrow().name.clone()))
            .finish()
    }
}

// Unlinks the chain one frame at a time so long scope chains drop in a loop.
impl Drop for Environment {
    fn drop(&mut self) {
        let mut next = self.outer.take();
        while let Some(frame_ptr) = next {
            next = match Rc::try_unwrap(frame_ptr) {
                Ok(frame) => frame.into_inner().outer.take(),
                Err(_) => None,
            };
        }
    }
}

impl Environment {
    /// Creates a new, empty top-level environment named "global".
    pub fn new() -> Rc<RefCell<Self>> {
        Environment::new_named(GLOBAL_SCOPE_NAME)
    }

    pub fn new_named(name: &str) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Environment {
            name: name.to_string(),
            outer: None,
            bindings: HashMap::new(),
        }))
    }

    pub fn new_global_populated() -> Rc<RefCell<Environment>> {
        let env_ptr = Environment::new(); // Create empty global env
        {
            // Borrow mutably only inside this scope
            let mut env = env_ptr.borrow_mut();
            env.define("nil".to_string(), Node::new_nil(Span::default()));

            // Arithmetic
            env.define_primitive("+", crate::primitives::prim_add);
            env.define_primitive("-", crate::primitives::prim_sub);
            env.define_primitive("*", crate::primitives::prim_mul);
            env.define_primitive("/", crate::primitives::prim_div);
            env.define_primitive("expt", crate::primitives::prim_expt);

            // Comparison and equality
            env.define_primitive("=", crate::primitives::prim_equals);
            env.define_primitive("<", crate::primitives::prim_less_than);
            env.define_primitive("<=", crate::primitives::prim_less_than_or_equals);
            env.define_primitive(">", crate::primitives::prim_greater_than);
            env.define_primitive(">=", crate::primitives::prim_greater_than_or_equals);
            env.define_primitive("==", crate::primitives::prim_loose_equals);
            env.define_primitive("eq?", crate::primitives::prim_is_eq);
            env.define_primitive("not", crate::primitives::prim_not);

            // List primitives
            env.define_primitive("cons", crate::primitives::prim_cons);
            env.define_primitive("car", crate::primitives::prim_car);
            env.define_primitive("cdr", crate::primitives::prim_cdr);
            env.define_primitive("cadr", crate::primitives::prim_cadr);
            env.define_primitive("list", crate::primitives::prim_list);

            // Strings, types, application
            env.define_primitive("concat", crate::primitives::prim_concat);
            env.define_primitive("string", crate::primitives::prim_string);
            env.define_primitive("type", crate::primitives::prim_type);
            env.define_primitive("apply", crate::primitives::prim_apply);

            // Type predicates
            env.define_primitive("null?", crate::primitives::prim_is_null);
            env.define_primitive("pair?", crate::primitives::prim_is_pair);
            env.define_primitive("number?", crate::primitives::prim_is_number);
            env.define_primitive("boolean?", crate::primitives::prim_is_boolean);
            env.define_primitive("symbol?", crate::primitives::prim_is_symbol);
            env.define_primitive("string?", crate::primitives::prim_is_string);
            env.define_primitive("procedure?", crate::primitives::prim_is_procedure);
        }
        env_ptr
    }

    /// Creates a child scope of `outer_env`. Without a name the scope is called
    /// "child of <outer name>".
    pub fn inherit(outer_env: &Rc<RefCell<Environment>>, name: Option<&str>) -> Rc<RefCell<Self>> {
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("child of {}", outer_env.borrow().name),
        };
        Rc::new(RefCell::new(Environment {
            name,
            outer: Some(outer_env.clone()),
            bindings: HashMap::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Defines a variable in the *current* environment frame.
    /// Replaces the value if the variable already exists in this frame.
    pub fn define(&mut self, name: String, value_node: Node) {
        self.bindings.insert(name, value_node);
    }

    /// Looks up a variable's value.
    /// Checks the current environment first, then walks up the outer environment chain.
    /// `lookup_span` is the location where the variable was referenced, used for error reporting.
    pub fn get(&self, name: &str, lookup_span: Span) -> Result<Node, EnvError> {
        if let Some(value_node) = self.bindings.get(name) {
            return Ok(value_node.clone());
        }
        let mut current = self.outer.clone();
        while let Some(frame_ptr) = current {
            let frame = frame_ptr.borrow();
            if let Some(value_node) = frame.bindings.get(name) {
                return Ok(value_node.clone());
            }
            current = frame.outer.clone();
        }
        Err(EnvError::UnboundVariable(name.to_string(), lookup_span))
    }

    /// True when `name` is bound in this frame or any outer one.
    pub fn is_bound(&self, name: &str) -> bool {
        if self.bindings.contains_key(name) {
            return true;
        }
        let mut current = self.outer.clone();
        while let Some(frame_ptr) = current {
            let frame = frame_ptr.borrow();
            if frame.bindings.contains_key(name) {
                return true;
            }
            current = frame.outer.clone();
        }
        false
    }

    /// Sets the value of an *existing* variable in the environment chain.
    /// Searches outward from the current environment and updates the first frame
    /// where the variable is found. Errors if the variable is not defined.
    /// `set_span` is the location of the `set!` expression.
    pub fn set(&mut self, name: &str, value_node: Node, set_span: Span) -> Result<(), EnvError> {
        if let Some(value_mut) = self.bindings.get_mut(name) {
            *value_mut = value_node;
            return Ok(());
        }
        let mut current = self.outer.clone();
        while let Some(frame_ptr) = current {
            let mut frame = frame_ptr.borrow_mut();
            if let Some(value_mut) = frame.bindings.get_mut(name) {
                *value_mut = value_node;
                return Ok(());
            }
            current = frame.outer.clone();
        }
        Err(EnvError::UnboundVariable(name.to_string(), set_span))
    }

    /// Binds a native procedure under `name` in this frame.
    pub fn define_primitive(&mut self, name: &str, func: PrimitiveFunc) {
        let node = Node::new_primitive(func, name, Span::default());
        self.define(name.to_string(), node);
    }

    /// Gets a list of all identifiers visible from the current environment
    pub fn get_identifiers(&self) -> HashSet<String> {
        let mut identifiers: HashSet<String> = self.bindings.keys().cloned().collect();
        if let Some(ref outer_env_ptr) = self.outer {
            identifiers.extend(outer_env_ptr.borrow().get_identifiers());
        }
        identifiers
    }

    /// Names bound to macros, for completion and diagnostics.
    pub fn get_macro_names(&self) -> HashSet<String> {
        let mut names: HashSet<String> = self
            .bindings
            .iter()
            .filter(|(_, node)| matches!(node.kind, Sexpr::Macro(_)))
            .map(|(name, _)| name.clone())
            .collect();
        if let Some(ref outer_env_ptr) = self.outer {
            names.extend(outer_env_ptr.borrow().get_macro_names());
        }
        names
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;

    // Helper to create a dummy node with default span
    fn num_node(n: i64) -> Node {
        Node::new_number(n, Span::default())
    }

    fn sym_node(s: &str) -> Node {
        Node::new_symbol(s.to_string(), Span::default())
    }

    #[test]
    fn test_define_and_get_global() {
        let env = Environment::new();
        env.borrow_mut().define("x".to_string(), num_node(10));

        let result = env.borrow().get("x", Span::default());
        assert_eq!(result, Ok(num_node(10)));
    }

    #[test]
    fn test_get_unbound_global() {
        let env = Environment::new();
        let result = env.borrow().get("y", Span::default());
        assert!(matches!(result, Err(EnvError::UnboundVariable(s, _)) if s == "y"));
    }

    #[test]
    fn test_unbound_message() {
        let err = EnvError::UnboundVariable("y".to_string(), Span::default());
        assert_eq!(err.to_string(), "y is not bound");
    }

    #[test]
    fn test_define_and_get_enclosed() {
        let global_env = Environment::new();
        global_env.borrow_mut().define("x".to_string(), num_node(10));

        let local_env = Environment::inherit(&global_env, None);
        local_env.borrow_mut().define("y".to_string(), num_node(20));

        assert_eq!(local_env.borrow().get("y", Span::default()), Ok(num_node(20)));
        assert_eq!(local_env.borrow().get("x", Span::default()), Ok(num_node(10)));
    }

    #[test]
    fn test_get_unbound_enclosed() {
        let global_env = Environment::new();
        let local_env = Environment::inherit(&global_env, None);

        let span = Span::new(11, 12);
        let result = local_env.borrow().get("z", span);
        assert_eq!(
            result,
            Err(EnvError::UnboundVariable("z".to_string(), span))
        );
    }

    #[test]
    fn test_shadowing() {
        let global_env = Environment::new();
        global_env.borrow_mut().define("x".to_string(), num_node(10));

        let local_env = Environment::inherit(&global_env, None);
        local_env.borrow_mut().define("x".to_string(), num_node(50)); // Shadow global x

        let inner_local_env = Environment::inherit(&local_env, None);
        inner_local_env
            .borrow_mut()
            .define("y".to_string(), sym_node("y-value"));

        assert_eq!(
            inner_local_env.borrow().get("x", Span::default()),
            Ok(num_node(50))
        );
        assert_eq!(
            inner_local_env.borrow().get("y", Span::default()),
            Ok(sym_node("y-value"))
        );
        assert_eq!(local_env.borrow().get("x", Span::default()), Ok(num_node(50)));
        assert_eq!(global_env.borrow().get("x", Span::default()), Ok(num_node(10)));
    }

    #[test]
    fn test_set_updates_nearest_binding() {
        let global_env = Environment::new();
        global_env.borrow_mut().define("x".to_string(), num_node(1));
        let local_env = Environment::inherit(&global_env, None);

        local_env
            .borrow_mut()
            .set("x", num_node(2), Span::default())
            .unwrap();
        assert_eq!(global_env.borrow().get("x", Span::default()), Ok(num_node(2)));
        assert!(!local_env.borrow().bindings.contains_key("x"));
    }

    #[test]
    fn test_set_unbound_error() {
        let env = Environment::inherit(&Environment::new(), None);
        let result = env.borrow_mut().set("nope", num_node(1), Span::default());
        assert!(matches!(result, Err(EnvError::UnboundVariable(s, _)) if s == "nope"));
    }

    #[test]
    fn test_scope_names() {
        let global_env = Environment::new();
        assert_eq!(global_env.borrow().name(), "global");

        let unnamed = Environment::inherit(&global_env, None);
        assert_eq!(unnamed.borrow().name(), "child of global");

        let foo = Environment::inherit(&global_env, Some("foo"));
        let child = Environment::inherit(&foo, None);
        assert_eq!(foo.borrow().name(), "foo");
        assert_eq!(child.borrow().name(), "child of foo");
    }

    #[test]
    fn test_identifiers_cover_outer_frames() {
        let global_env = Environment::new_global_populated();
        let local_env = Environment::inherit(&global_env, None);
        local_env.borrow_mut().define("mine".to_string(), num_node(1));

        let ids = local_env.borrow().get_identifiers();
        assert!(ids.contains("mine"));
        assert!(ids.contains("car"));
        assert!(local_env.borrow().is_bound("cons"));
        assert!(!local_env.borrow().is_bound("nothing-here"));
    }

    #[test]
    fn test_long_scope_chain() {
        let global_env = Environment::new();
        global_env.borrow_mut().define("root".to_string(), num_node(1));
        let mut env = global_env.clone();
        for _ in 0..200_000 {
            env = Environment::inherit(&env, Some("frame"));
        }

        assert_eq!(env.borrow().get("root", Span::default()), Ok(num_node(1)));
        assert!(env.borrow().get("missing", Span::default()).is_err());
        assert!(env.borrow().is_bound("root"));
        assert!(!env.borrow().is_bound("missing"));
        env.borrow_mut().set("root", num_node(2), Span::default()).unwrap();
        assert_eq!(global_env.borrow().get("root", Span::default()), Ok(num_node(2)));

        drop(env);
        assert_eq!(Rc::strong_count(&global_env), 1);
    }

    #[test]
    fn test_macro_names() {
        let global_env = Environment::new_global_populated();
        crate::exec("(defmacro (m args) 1) (define f 2)", &global_env, None).unwrap();
        let local_env = Environment::inherit(&global_env, None);

        let names = local_env.borrow().get_macro_names();
        assert!(names.contains("m"));
        assert!(!names.contains("f"));
        assert!(!names.contains("car"));
    }
}
