use crate::ast::{Shape, Value};
use crate::builtinops::{BuiltinOp, Dialect, OpKind, default_dialect, find_dialect};
use crate::parser::{ParseConfig, parse_program_with_config};
use crate::scope::{ScopeId, Scopes};
use crate::{DEFAULT_DIALECT, Error, MAX_EVAL_DEPTH};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, trace};

pub mod forms;
pub mod intooperation;

pub use forms::SpecialFormFn;
use intooperation::{IntoOperation, IntoVariadicOperation, OperationFn};

/// Minimum stack space to keep available before recursing (100KB red zone).
const RED_ZONE: usize = 100 * 1024;

/// Stack space to allocate when growing (1MB).
const STACK_PER_RECURSION: usize = 1024 * 1024;

/// Grow the native stack if less than the red zone remains, then run `f`.
#[inline]
#[cfg(not(target_arch = "wasm32"))]
fn ensure_sufficient_stack<R>(f: impl FnOnce() -> R) -> R {
    stacker::maybe_grow(RED_ZONE, STACK_PER_RECURSION, f)
}

#[inline]
#[cfg(target_arch = "wasm32")]
fn ensure_sufficient_stack<R>(f: impl FnOnce() -> R) -> R {
    f()
}

/// Number of arguments a callable accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly this many arguments
    Exact(usize),
    /// At least this many arguments, the surplus forming a rest list
    AtLeast(usize),
}

impl Arity {
    pub fn required(self) -> usize {
        match self {
            Arity::Exact(n) | Arity::AtLeast(n) => n,
        }
    }

    pub fn is_variadic(self) -> bool {
        matches!(self, Arity::AtLeast(_))
    }

    /// Single-integer form: `n >= 0` means exactly `n`, negative `n` means at least `-n - 1`.
    pub fn encode(self) -> i64 {
        let required = i64::try_from(self.required()).unwrap_or(i64::MAX);
        match self {
            Arity::Exact(_) => required,
            Arity::AtLeast(_) => -required - 1,
        }
    }

    pub fn decode(code: i64) -> Arity {
        if code >= 0 {
            Arity::Exact(usize::try_from(code).unwrap_or(usize::MAX))
        } else {
            Arity::AtLeast(usize::try_from(-(code + 1)).unwrap_or(usize::MAX))
        }
    }

    /// Validate an argument count for the named callable.
    pub fn check(self, callable: &str, got: usize) -> Result<(), Error> {
        let ok = match self {
            Arity::Exact(n) => got == n,
            Arity::AtLeast(n) => got >= n,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::arity_error(
                callable,
                self.is_variadic(),
                self.required(),
                got,
            ))
        }
    }
}

/// How a callable receives its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Arguments are resolved before the call
    Eager,
    /// Raw argument nodes are handed over; the callable evaluates what it needs
    ShortCircuit,
}

/// A declared parameter of a user function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub shape: Shape,
    pub name: String,
}

/// Function defined by `fn` or `lambda`
#[derive(Debug)]
pub struct UserFunction {
    pub name: String,
    pub params: Vec<Param>,
    /// List parameter collecting surplus arguments
    pub rest: Option<String>,
    pub body: Rc<[Value]>,
    /// Scope the function was defined in
    pub scope: ScopeId,
}

impl UserFunction {
    pub fn arity(&self) -> Arity {
        if self.rest.is_some() {
            Arity::AtLeast(self.params.len())
        } else {
            Arity::Exact(self.params.len())
        }
    }
}

/// Anything that can be invoked by name or held in a variable.
#[derive(Debug, Clone)]
pub enum Callable {
    /// Entry of a static dialect table
    Builtin(&'static BuiltinOp),
    /// Operation registered by the host at runtime
    Host(Rc<BuiltinOp>),
    User(Rc<UserFunction>),
}

impl Callable {
    pub fn name(&self) -> &str {
        match self {
            Callable::Builtin(op) => &op.name,
            Callable::Host(op) => &op.name,
            Callable::User(function) => &function.name,
        }
    }

    pub fn arity(&self) -> Arity {
        match self {
            Callable::Builtin(op) => op.arity,
            Callable::Host(op) => op.arity,
            Callable::User(function) => function.arity(),
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            Callable::Builtin(op) => op.strategy(),
            Callable::Host(op) => op.strategy(),
            Callable::User(_) => Strategy::Eager,
        }
    }

    pub(crate) fn identity(&self) -> usize {
        match self {
            Callable::Builtin(op) => std::ptr::from_ref(*op).addr(),
            Callable::Host(op) => Rc::as_ptr(op).addr(),
            Callable::User(function) => Rc::as_ptr(function).addr(),
        }
    }

    pub(crate) fn same(&self, other: &Callable) -> bool {
        self.identity() == other.identity()
    }
}

/// Interpreter configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterConfig {
    /// Name of the dialect active at startup
    pub dialect: String,
    pub max_eval_depth: usize,
    pub parse: ParseConfig,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        InterpreterConfig {
            dialect: DEFAULT_DIALECT.to_owned(),
            max_eval_depth: MAX_EVAL_DEPTH,
            parse: ParseConfig::default(),
        }
    }
}

/// Interpreter session: scope arena, active dialect and configuration.
#[derive(Debug)]
pub struct Interpreter {
    scopes: Scopes,
    dialect: &'static Dialect,
    config: InterpreterConfig,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Interpreter {
            scopes: Scopes::new(),
            dialect: default_dialect(),
            config: InterpreterConfig::default(),
        }
    }

    pub fn with_config(config: InterpreterConfig) -> Result<Self, Error> {
        let dialect = find_dialect(&config.dialect)
            .ok_or_else(|| Error::EvalError(format!("Unknown dialect: {}", config.dialect)))?;
        Ok(Interpreter {
            scopes: Scopes::new(),
            dialect,
            config,
        })
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    pub fn scopes(&self) -> &Scopes {
        &self.scopes
    }

    pub fn scopes_mut(&mut self) -> &mut Scopes {
        &mut self.scopes
    }

    /// The global scope every top-level form runs in.
    pub fn root(&self) -> ScopeId {
        self.scopes.root()
    }

    pub fn dialect(&self) -> &'static Dialect {
        self.dialect
    }

    /// Switch the active builtin table. Returns the name of the previous dialect.
    pub fn set_dialect(&mut self, name: &str) -> Result<&'static str, Error> {
        let dialect =
            find_dialect(name).ok_or_else(|| Error::EvalError(format!("Unknown dialect: {name}")))?;
        let previous = std::mem::replace(&mut self.dialect, dialect);
        debug!(from = previous.name, to = dialect.name, "dialect switched");
        Ok(previous.name)
    }

    /// Parse and evaluate a whole program, returning the value of the last form.
    pub fn run_source(&mut self, text: &str) -> Result<Value, Error> {
        let tree = parse_program_with_config(text, &self.config.parse)?;
        self.run_forms(&tree.forms)
    }

    /// Evaluate top-level forms in order, returning the last value or `nil`.
    pub fn run_forms(&mut self, forms: &[Value]) -> Result<Value, Error> {
        let mut last = Value::nil();
        for form in forms {
            last = self.run(form)?;
        }
        Ok(last)
    }

    /// Evaluate one top-level form in the global scope.
    pub fn run(&mut self, node: &Value) -> Result<Value, Error> {
        debug!(form = %node, dialect = self.dialect.name, "evaluating top-level form");
        let root = self.root();
        self.eval(node, root, 0)
    }

    /// Evaluate a node in the given scope.
    pub fn eval_in(&mut self, node: &Value, scope: ScopeId) -> Result<Value, Error> {
        self.eval(node, scope, 0)
    }

    /// Evaluate a node at a known evaluation depth.
    ///
    /// Short-circuit callables pass `depth + 1` when evaluating their raw arguments so
    /// the depth limit covers recursion through control forms.
    pub fn eval(&mut self, node: &Value, scope: ScopeId, depth: usize) -> Result<Value, Error> {
        if depth >= self.config.max_eval_depth {
            return Err(Error::EvalError(format!(
                "Evaluation depth limit exceeded (max: {})",
                self.config.max_eval_depth
            )));
        }
        ensure_sufficient_stack(|| self.eval_node(node, scope, depth))
    }

    fn eval_node(&mut self, node: &Value, scope: ScopeId, depth: usize) -> Result<Value, Error> {
        match node {
            Value::ScalarVar(_) | Value::ListVar(_) | Value::DictVar(_) => {
                self.lookup_variable(node, scope)
            }
            Value::List(_) | Value::Dictionary(_) => self.resolve_literal(node, scope),
            Value::Expression(items) => self
                .eval_expression(items, scope, depth)
                .map_err(|err| add_context(err, node)),
            Value::Integer(_)
            | Value::Float(_)
            | Value::String(_)
            | Value::Atom(_)
            | Value::Foreign(_)
            | Value::Function(_) => Ok(node.clone()),
        }
    }

    fn eval_expression(
        &mut self,
        items: &[Value],
        scope: ScopeId,
        depth: usize,
    ) -> Result<Value, Error> {
        match items {
            [] => Ok(Value::nil()),

            [Value::Atom(name), args @ ..] => {
                let callable = self.lookup_function(name, scope)?;
                self.invoke_at(&callable, args, scope, depth)
            }

            // `(value)` reduces to the value; `((lambda ...))` calls the lambda
            [single] => {
                let value = self.eval(single, scope, depth + 1)?;
                match value {
                    Value::Function(callable)
                        if self.dialect.features.callable_heads
                            && matches!(single, Value::Expression(_)) =>
                    {
                        self.invoke_at(&callable, &[], scope, depth)
                    }
                    other => Ok(other),
                }
            }

            [head, args @ ..] => {
                if !self.dialect.features.callable_heads {
                    return Err(Error::type_error(head.type_name(), "function name"));
                }
                match self.eval(head, scope, depth + 1)? {
                    Value::Function(callable) => self.invoke_at(&callable, args, scope, depth),
                    other => Err(Error::type_error(other.type_name(), "function")),
                }
            }
        }
    }

    /// Look up a variable reference in its namespace.
    pub fn lookup_variable(&self, node: &Value, scope: ScopeId) -> Result<Value, Error> {
        let Some((shape, name)) = node.variable() else {
            return Ok(node.clone());
        };
        let found = if self.dialect.features.cross_namespace_lookup {
            self.scopes.get_coerced(scope, shape, name)?
        } else {
            self.scopes.get(scope, shape, name).cloned()
        };
        found.ok_or_else(|| Error::UndefinedVariable(node.to_string()))
    }

    /// Copy a list or dictionary literal with every variable reference replaced by its
    /// value. Nested expressions stay unevaluated data.
    fn resolve_literal(&self, node: &Value, scope: ScopeId) -> Result<Value, Error> {
        match node {
            Value::ScalarVar(_) | Value::ListVar(_) | Value::DictVar(_) => {
                self.lookup_variable(node, scope)
            }
            Value::List(items) => items
                .iter()
                .map(|item| self.resolve_literal(item, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Value::Dictionary(map) => map
                .iter()
                .map(|(key, value)| {
                    Ok((
                        self.resolve_literal(key, scope)?,
                        self.resolve_literal(value, scope)?,
                    ))
                })
                .collect::<Result<_, Error>>()
                .map(Value::Dictionary),
            other => Ok(other.clone()),
        }
    }

    /// Resolve a function name: user definitions along the scope chain first, then the
    /// active dialect's builtin table.
    pub fn lookup_function(&self, name: &str, scope: ScopeId) -> Result<Callable, Error> {
        if let Some(callable) = self.scopes.get_function(scope, name) {
            return Ok(callable.clone());
        }
        self.dialect
            .get(name)
            .map(Callable::Builtin)
            .ok_or_else(|| Error::UndefinedFunction(name.to_owned()))
    }

    /// Invoke a callable with raw argument nodes, applying its arity and strategy.
    pub fn invoke(
        &mut self,
        callable: &Callable,
        raw_args: &[Value],
        scope: ScopeId,
    ) -> Result<Value, Error> {
        self.invoke_at(callable, raw_args, scope, 0)
    }

    pub(crate) fn invoke_at(
        &mut self,
        callable: &Callable,
        raw_args: &[Value],
        scope: ScopeId,
        depth: usize,
    ) -> Result<Value, Error> {
        callable.arity().check(callable.name(), raw_args.len())?;
        trace!(callable = callable.name(), args = raw_args.len(), "dispatch");

        match callable {
            Callable::Builtin(op) => self.invoke_builtin(op, raw_args, scope, depth),
            Callable::Host(op) => self.invoke_builtin(op, raw_args, scope, depth),
            Callable::User(function) => {
                let args = self.eval_args(raw_args, scope, depth)?;
                self.call_user(function, args, depth)
            }
        }
    }

    /// Invoke a callable with already evaluated arguments.
    pub(crate) fn apply_values(
        &mut self,
        callable: &Callable,
        args: Vec<Value>,
        depth: usize,
    ) -> Result<Value, Error> {
        callable.arity().check(callable.name(), args.len())?;
        match callable {
            Callable::User(function) => self.call_user(function, args, depth),
            Callable::Builtin(op) => Self::apply_builtin(op, args),
            Callable::Host(op) => Self::apply_builtin(op, args),
        }
    }

    fn apply_builtin(op: &BuiltinOp, args: Vec<Value>) -> Result<Value, Error> {
        match &op.op_kind {
            OpKind::Eager(func) => func(args).map_err(|err| err.in_callable(&op.name)),
            OpKind::ShortCircuit(_) => Err(Error::EvalError(format!(
                "Special form {} cannot be applied to evaluated arguments",
                op.name
            ))),
        }
    }

    fn invoke_builtin(
        &mut self,
        op: &BuiltinOp,
        raw_args: &[Value],
        scope: ScopeId,
        depth: usize,
    ) -> Result<Value, Error> {
        match &op.op_kind {
            OpKind::Eager(func) => {
                let args = self.eval_args(raw_args, scope, depth)?;
                func(args).map_err(|err| err.in_callable(&op.name))
            }
            OpKind::ShortCircuit(form) => {
                form(self, raw_args, scope, depth).map_err(|err| err.in_callable(&op.name))
            }
        }
    }

    fn eval_args(
        &mut self,
        raw_args: &[Value],
        scope: ScopeId,
        depth: usize,
    ) -> Result<Vec<Value>, Error> {
        raw_args
            .iter()
            .map(|arg| self.eval(arg, scope, depth + 1))
            .collect()
    }

    fn call_user(
        &mut self,
        function: &UserFunction,
        args: Vec<Value>,
        depth: usize,
    ) -> Result<Value, Error> {
        let frame = self.scopes.push(function.scope);
        let result = self.bind_and_run(function, args, frame, depth);
        // Released on the error path too
        self.scopes.pop(frame);
        result
    }

    fn bind_and_run(
        &mut self,
        function: &UserFunction,
        args: Vec<Value>,
        frame: ScopeId,
        depth: usize,
    ) -> Result<Value, Error> {
        let mut args = args.into_iter();
        for (i, param) in function.params.iter().enumerate() {
            let Some(arg) = args.next() else {
                break;
            };
            if arg.shape() != param.shape {
                return Err(Error::TypeError {
                    found: arg.type_name().to_owned(),
                    expected: format!(
                        "{} for {}{}",
                        param.shape.name(),
                        param.shape.sigil(),
                        param.name
                    ),
                    position: Some(i + 1),
                    callable: Some(function.name.clone()),
                });
            }
            self.scopes.define(frame, param.shape, &param.name, arg);
        }
        if let Some(rest) = &function.rest {
            self.scopes
                .define(frame, Shape::List, rest, Value::List(args.collect()));
        }

        self.run_block(&function.body, frame, depth + 1)
    }

    /// Evaluate statements in order, returning the last value or `nil` for an empty block.
    pub fn run_block(
        &mut self,
        body: &[Value],
        scope: ScopeId,
        depth: usize,
    ) -> Result<Value, Error> {
        let mut last = Value::nil();
        for statement in body {
            last = self.eval(statement, scope, depth)?;
        }
        Ok(last)
    }

    /// All bindings of the global scope, for host inspection.
    pub fn bindings(&self) -> Vec<(String, Value)> {
        self.scopes.bindings(self.root())
    }

    fn register(&mut self, op: BuiltinOp) {
        let root = self.root();
        let name = op.name.clone();
        debug!(name = %name, arity = ?op.arity, "host builtin registered");
        self.scopes
            .define_function(root, &name, Callable::Host(Rc::new(op)));
    }

    /// Register a builtin that works on the raw argument slice.
    ///
    /// This is the low-level API. For most new code, prefer the typed
    /// [`Interpreter::register_builtin_operation`] instead of manipulating
    /// `Value` directly.
    ///
    /// # Example
    /// ```
    /// use sigilisp::{Arity, Error, Interpreter, Value};
    ///
    /// fn count_args(args: &[Value]) -> Result<Value, Error> {
    ///     Ok(Value::Integer(i64::try_from(args.len()).unwrap_or(i64::MAX)))
    /// }
    ///
    /// let mut interp = Interpreter::new();
    /// interp.register_builtin_function("count-args", Arity::AtLeast(0), count_args);
    /// assert_eq!(interp.run_source("(count-args 1 2 3)").unwrap(), Value::Integer(3));
    /// ```
    pub fn register_builtin_function(
        &mut self,
        name: &str,
        arity: Arity,
        func: fn(&[Value]) -> Result<Value, Error>,
    ) {
        let wrapped: Arc<OperationFn> = Arc::new(move |args: Vec<Value>| func(&args));
        self.register(BuiltinOp::eager(name, arity, wrapped));
    }

    /// Register a strongly-typed Rust function as a builtin operation using
    /// automatic argument extraction and result conversion.
    ///
    /// ```rust
    /// use sigilisp::{Error, Interpreter, Value};
    ///
    /// fn safe_div(a: i64, b: i64) -> Result<i64, Error> {
    ///     if b == 0 {
    ///         Err(Error::EvalError("division by zero".into()))
    ///     } else {
    ///         Ok(a / b)
    ///     }
    /// }
    ///
    /// let mut interp = Interpreter::new();
    /// interp.register_builtin_operation::<_, (i64, i64)>("safe-div", safe_div);
    /// assert_eq!(interp.run_source("(safe-div 7 2)").unwrap(), Value::Integer(3));
    /// ```
    ///
    /// Supported parameter types: `i64`, `f64`, `Number`, `String`, `bool` (`t`/`nil`),
    /// `Value`, and the context readers `ListArg` and `DictArg`. The return type is
    /// `Result<T, Error>` for any `T: Into<Value>`.
    ///
    /// Arity is derived from the signature. Conversion errors yield a `TypeError`
    /// naming the argument position.
    pub fn register_builtin_operation<F, Args>(&mut self, name: &str, func: F)
    where
        F: IntoOperation<Args>,
    {
        let arity = Arity::Exact(<F as IntoOperation<Args>>::ARITY);
        self.register(BuiltinOp::eager(name, arity, func.into_operation()));
    }

    /// Register a builtin whose last parameter is a [`intooperation::Rest`] tail.
    ///
    /// The provided [`Arity`] is checked before arguments are evaluated, since the
    /// minimum count of a variadic operation is not always its fixed prefix.
    pub fn register_variadic_builtin_operation<F, Args>(
        &mut self,
        name: &str,
        arity: Arity,
        func: F,
    ) where
        F: IntoVariadicOperation<Args>,
    {
        self.register(BuiltinOp::eager(name, arity, func.into_variadic_operation()));
    }

    /// Register a short-circuit builtin that receives raw argument nodes.
    pub fn register_special_form(&mut self, name: &str, arity: Arity, form: SpecialFormFn) {
        self.register(BuiltinOp::short_circuit(name, arity, form));
    }
}

/// Helper function to add expression context to evaluation errors, once
fn add_context(error: Error, expr: &Value) -> Error {
    match error {
        Error::EvalError(msg) if !msg.contains("\n  Context: ") => {
            Error::EvalError(format!("{msg}\n  Context: while evaluating: {expr}"))
        }
        // Structured errors carry their own context
        other => other,
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::Error;
    use crate::ast::{atom, dict, val};
    use crate::parser::parse_program;
    use intooperation::{ListArg, Rest};
    use pretty_assertions::assert_eq;

    /// Test result variants for comprehensive testing
    #[derive(Debug)]
    enum TestResult {
        EvalResult(Value),           // Evaluation should succeed with this value
        Setup,                       // Evaluation should succeed, value not checked
        SpecificError(&'static str), // Evaluation should fail with error containing this string
        Error,                       // Evaluation should fail (any error)
    }
    use TestResult::*;

    /// Test environment containing test cases that share state
    struct TestEnvironment(Vec<(&'static str, TestResult)>);

    /// Micro-helper for success cases in comprehensive tests
    fn success<T: Into<Value>>(value: T) -> TestResult {
        EvalResult(val(value))
    }

    /// Macro for setup expressions whose value is not interesting (like `fn`)
    macro_rules! test_setup {
        ($expr:expr) => {
            ($expr, Setup)
        };
    }

    /// Run tests in isolated interpreters with shared state per environment
    fn run_tests_in_environment(test_environments: Vec<TestEnvironment>) {
        for (env_idx, TestEnvironment(test_cases)) in test_environments.iter().enumerate() {
            let mut interp = Interpreter::new();

            for (test_idx, (input, expected)) in test_cases.iter().enumerate() {
                let test_id = format!("Environment #{} test #{}", env_idx + 1, test_idx + 1);
                execute_test_case(input, expected, &mut interp, &test_id);
            }
        }
    }

    /// Execute a single test case with detailed error reporting
    fn execute_test_case(
        input: &str,
        expected: &TestResult,
        interp: &mut Interpreter,
        test_id: &str,
    ) {
        let forms = match parse_program(input) {
            Ok(forms) => forms,
            Err(parse_err) => {
                panic!("{test_id}: unexpected parse error for '{input}': {parse_err:?}");
            }
        };

        match (interp.run_forms(&forms), expected) {
            (Ok(actual), EvalResult(expected_val)) => {
                assert_eq!(&actual, expected_val, "{test_id}: '{input}'");
            }
            (Ok(_), Setup) | (Err(_), Error) => {}
            (Err(e), SpecificError(expected_text)) => {
                let error_msg = format!("{e}");
                assert!(
                    error_msg.contains(expected_text),
                    "{test_id}: error for '{input}' should contain '{expected_text}', got: {error_msg}"
                );
            }
            (Ok(actual), Error) => {
                panic!("{test_id}: expected error for '{input}', got {actual:?}");
            }
            (Ok(actual), SpecificError(expected_text)) => {
                panic!("{test_id}: expected error containing '{expected_text}' for '{input}', got {actual:?}");
            }
            (Err(err), EvalResult(_) | Setup) => {
                panic!("{test_id}: expected success for '{input}', got error {err:?}");
            }
        }
    }

    /// Each case runs in a fresh interpreter
    fn run_comprehensive_tests(test_cases: Vec<(&str, TestResult)>) {
        for (i, (input, expected)) in test_cases.iter().enumerate() {
            let mut interp = Interpreter::new();
            let test_id = format!("#{}", i + 1);
            execute_test_case(input, expected, &mut interp, &test_id);
        }
    }

    #[test]
    fn test_comprehensive_operations_data_driven() {
        let test_cases = vec![
            // === SELF-EVALUATING FORMS ===
            ("42", success(42)),
            ("-7", success(-7)),
            ("2.5", success(2.5)),
            ("\"hello\"", success("hello")),
            ("t", success(true)),
            ("nil", success(false)),
            ("foo", EvalResult(atom("foo"))),
            ("'(1 2 3)", success([1, 2, 3])),
            (
                "`((a 1) (b 2))",
                EvalResult(dict(vec![(atom("a"), 1), (atom("b"), 2)])),
            ),
            // nested groups inside a literal stay data
            (
                "'(1 (+ 1 2))",
                success(vec![val(1), val(vec![atom("+"), val(1), val(2)])]),
            ),
            // === EXPRESSION SHAPES ===
            ("()", success(false)),
            ("(5)", success(5)),
            ("((+ 1 2))", success(3)),
            ("((+ 1 2) 4)", SpecificError("TypeError: expected function name")),
            ("", success(false)),
            // === ARITHMETIC AND COMPARISON ===
            ("(+ 1 2 3)", success(6)),
            ("(+ 1 2.5)", success(3.5)),
            ("(- 10 (* 2 3))", success(4)),
            ("(/ 1 0)", SpecificError("Division by zero")),
            ("(< 1 2.5 3)", success(true)),
            ("(< 1 2 2)", success(false)),
            ("(= 1 1.0)", success(true)),
            ("(+ 1 \"a\")", SpecificError("(argument 2 of +)")),
            // === IF ===
            ("(if t 2 else 0)", success(2)),
            ("(if nil 2 else 0)", success(0)),
            (
                "(if 5 2)",
                SpecificError("TypeError: expected t or nil, found integer (argument 1 of if)"),
            ),
            ("(if nil 2)", success(false)),
            ("(if t)", success(false)),
            ("(if (< 1 2) 1 2 3 else 4)", success(3)),
            ("(if nil 1 else (if t 2 else 3))", success(2)),
            // only the chosen branch is evaluated
            ("(if t 1 else (error \"unreachable\"))", success(1)),
            // === AND / OR ===
            ("(and t t)", success(true)),
            ("(and t nil (error \"x\"))", success(false)),
            ("(or nil t (error \"x\"))", success(true)),
            ("(or nil nil)", success(false)),
            ("(and 1)", SpecificError("TypeError")),
            ("(and)", SpecificError("ArityError: and expects at least 1 argument, got 0")),
            // === DO / WHILE ===
            ("(do 1 2 3)", success(3)),
            ("(do)", success(false)),
            ("(while nil 1)", success(false)),
            ("(while 1)", SpecificError("(argument 1 of while)")),
            // === ARITY ===
            ("(not)", SpecificError("ArityError: not expects exactly 1 argument, got 0")),
            ("(not t t)", SpecificError("ArityError")),
            ("(-)", SpecificError("ArityError: - expects at least 1 argument, got 0")),
            // arity is checked before any argument is evaluated
            ("(not $undefined $other)", SpecificError("ArityError")),
            // === LOOKUP FAILURES ===
            ("(nope 1)", SpecificError("UndefinedFunction: nope")),
            ("$nope", SpecificError("UndefinedVariable: $nope")),
            ("@nope", SpecificError("UndefinedVariable: @nope")),
            ("(lambda ($x) 1)", SpecificError("UndefinedFunction: lambda")),
            // === ERRORS CARRY CONTEXT ===
            ("(error \"boom\" 42)", SpecificError("boom 42")),
            ("(do (error \"boom\"))", SpecificError("while evaluating: (error \"boom\")")),
            // === DIALECT ===
            ("(dialect)", EvalResult(atom("core"))),
            ("(dialect extended)", EvalResult(atom("core"))),
            ("(dialect \"bogus\")", SpecificError("Unknown dialect: bogus")),
            ("(dialect 5)", SpecificError("TypeError")),
        ];

        run_comprehensive_tests(test_cases);
    }

    #[test]
    fn test_environment_sensitive_operations() {
        let environment_test_cases = vec![
            // === ASSIGNMENT AND SIGIL CHECKS ===
            TestEnvironment(vec![
                ("(:= $x 42)", success(42)),
                ("$x", success(42)),
                ("(+ $x 8)", success(50)),
                (
                    "(:= $x (list 1 2))",
                    SpecificError("TypeError: expected scalar for $x, found list"),
                ),
                ("(:= @x (list 1 2))", success([1, 2])),
                ("@x", success([1, 2])),
                // namespaces are independent
                ("$x", success(42)),
                ("(:= %d (dict \"a\" 1))", EvalResult(dict(vec![("a", 1)]))),
                ("%d", EvalResult(dict(vec![("a", 1)]))),
                ("(:= @d %d)", SpecificError("TypeError")),
                ("(:= 5 1)", SpecificError("TypeError")),
                // literals resolve variable references inside them
                ("'(1 $x)", success([1, 42])),
                ("`((k $x))", EvalResult(dict(vec![(atom("k"), 42)]))),
            ]),
            // === CROSS-NAMESPACE FALLBACK ===
            TestEnvironment(vec![
                test_setup!("(:= @x (list 1 2 3))"),
                ("$x", SpecificError("UndefinedVariable: $x")),
                ("(dialect extended)", EvalResult(atom("core"))),
                ("$x", success(3)),
                ("%x", SpecificError("TypeError")),
                test_setup!("(:= %d (dict \"a\" 1))"),
                ("@d", success(vec![val("a"), val(1)])),
                ("$d", success(1)),
                ("(dialect)", EvalResult(atom("extended"))),
                ("(dialect core)", EvalResult(atom("extended"))),
                ("$x", SpecificError("UndefinedVariable")),
            ]),
            // === FUNCTIONS ===
            TestEnvironment(vec![
                test_setup!("(fn add ($a $b) (+ $a $b))"),
                ("(add 2 3)", success(5)),
                ("(add 1)", SpecificError("ArityError: add expects exactly 2 arguments, got 1")),
                ("(add 1 2 3)", SpecificError("ArityError")),
                (
                    "(add '(1) 2)",
                    SpecificError(
                        "TypeError: expected scalar for $a, found list (argument 1 of add)",
                    ),
                ),
                // user definitions shadow builtins
                test_setup!("(fn not ($x) 42)"),
                ("(not t)", success(42)),
                ("(fn bad ($a $a) 1)", SpecificError("Duplicate parameter name: $a")),
                ("(fn bad (1) 1)", SpecificError("TypeError")),
                ("(fn 5 () 1)", SpecificError("TypeError")),
                ("(fn empty ())", Setup),
                ("(empty)", success(false)),
            ]),
            // === VARIADIC REST CAPTURE ===
            TestEnvironment(vec![
                test_setup!("(fn f ($a (@rest)) $a)"),
                ("(f 1 2 3)", success(1)),
                test_setup!("(fn g ($a (@rest)) @rest)"),
                ("(g 1 2 3)", success([2, 3])),
                ("(g 1)", EvalResult(Value::List(vec![]))),
                ("(g)", SpecificError("ArityError: g expects at least 1 argument, got 0")),
            ]),
            // === ASSIGNMENT THROUGH THE SCOPE CHAIN ===
            TestEnvironment(vec![
                test_setup!("(:= $count 0)"),
                test_setup!("(fn bump () (:= $count (+ $count 1)))"),
                ("(bump)", success(1)),
                ("(bump)", success(2)),
                ("$count", success(2)),
                // first assignment binds in the innermost scope
                test_setup!("(fn local () (:= $fresh 1) $fresh)"),
                ("(local)", success(1)),
                ("$fresh", SpecificError("UndefinedVariable")),
                // parameters are local to the call
                test_setup!("(:= $a 100)"),
                test_setup!("(fn shadow ($a) (:= $a 5) $a)"),
                ("(shadow 1)", success(5)),
                ("$a", success(100)),
            ]),
            // === RECURSION ===
            TestEnvironment(vec![
                test_setup!("(fn fact ($n) (if (<= $n 1) 1 else (* $n (fact (- $n 1)))))"),
                ("(fact 10)", success(3_628_800)),
                ("(fact 1)", success(1)),
            ]),
            // === FOR ===
            TestEnvironment(vec![
                test_setup!("(:= $sum 0)"),
                ("(for $x in '(1 2 3) (:= $sum (+ $sum $x)))", success(6)),
                ("$sum", success(6)),
                // the loop variable does not outlive the loop
                ("$x", SpecificError("UndefinedVariable")),
                ("(for $x on '(1) 1)", SpecificError("atom in")),
                ("(for $x in 5 1)", SpecificError("TypeError")),
                ("(for @x in '(1) 1)", SpecificError("TypeError")),
                ("(for $x in '() 1)", success(false)),
                // core flattens a dictionary into its entries
                test_setup!("(:= $n 0)"),
                ("(for $item in (dict \"a\" 1 \"b\" 2) (:= $n (+ $n 1)))", success(4)),
                ("(for @row in '((1 2) (3 4)) (first @row))", success(3)),
            ]),
            // === FOR OVER DICTIONARIES (EXTENDED) ===
            TestEnvironment(vec![
                test_setup!("(dialect extended)"),
                test_setup!("(:= @ks (list))"),
                ("(for $k in (dict \"b\" 2 \"a\" 1) (:= @ks (push @ks $k)))", success(["a", "b"])),
                ("(for @kv in (dict \"a\" 1) @kv)", success(vec![val("a"), val(1)])),
            ]),
            // === WHILE ===
            TestEnvironment(vec![
                test_setup!("(:= $i 0)"),
                ("(while (< $i 5) (:= $i (+ $i 1)))", success(5)),
                ("$i", success(5)),
            ]),
            // === FIRST-CLASS FUNCTIONS (EXTENDED) ===
            TestEnvironment(vec![
                test_setup!("(dialect extended)"),
                test_setup!("(:= $sq (lambda ($x) (* $x $x)))"),
                ("($sq 4)", success(16)),
                ("(call $sq 5)", success(25)),
                ("(apply $sq '(6))", success(36)),
                ("(map $sq '(1 2 3))", success([1, 4, 9])),
                ("((lambda () 7))", success(7)),
                test_setup!("(fn double ($x) (* 2 $x))"),
                ("(map double '(1 2))", success([2, 4])),
                ("(apply + '(1 2 3))", success(6)),
                ("(apply if '(t))", SpecificError("cannot be applied")),
                ("(5 1)", SpecificError("TypeError")),
                ("(map $sq 3)", SpecificError("TypeError")),
                (
                    "($sq 1 2)",
                    SpecificError("ArityError: lambda expects exactly 1 argument, got 2"),
                ),
                // closures keep their defining scope alive
                test_setup!("(fn make-adder ($n) (lambda ($x) (+ $x $n)))"),
                test_setup!("(:= $add5 (make-adder 5))"),
                test_setup!("(:= $add7 (make-adder 7))"),
                ("($add5 10)", success(15)),
                ("($add7 10)", success(17)),
            ]),
        ];

        run_tests_in_environment(environment_test_cases);
    }

    #[test]
    fn test_evaluation_depth_limit() {
        let depth_test_environments = vec![TestEnvironment(vec![
            test_setup!("(fn deep ($n) (if (= $n 0) 0 else (+ 1 (deep (- $n 1)))))"),
            ("(deep 10)", success(10)),
            // Each recursive call adds several levels through the call, `if` and `+`
            ("(deep 100000)", SpecificError("depth")),
            // the interpreter stays usable afterwards
            ("(deep 3)", success(3)),
        ])];

        run_tests_in_environment(depth_test_environments);

        let mut interp = Interpreter::with_config(InterpreterConfig {
            max_eval_depth: 8,
            ..InterpreterConfig::default()
        })
        .unwrap();
        assert!(interp.run_source("(+ 1 (+ 1 (+ 1 (+ 1 (+ 1 (+ 1 (+ 1 (+ 1 1))))))))").is_err());
        assert_eq!(interp.run_source("(+ 1 (+ 1 1))").unwrap(), val(3));
    }

    #[test]
    fn test_state_survives_errors() {
        let mut interp = Interpreter::new();
        interp.run_source("(:= $x 1) (fn boom ($n) (/ $n 0))").unwrap();
        let frames = interp.scopes().frame_count();

        assert!(interp.run_source("(boom 1)").is_err());
        assert!(interp.run_source("(+ $x (nope))").is_err());
        assert_eq!(interp.scopes().frame_count(), frames);
        assert_eq!(interp.run_source("$x").unwrap(), val(1));
    }

    #[test]
    fn test_arity_encoding() {
        let cases = vec![
            (Arity::Exact(0), 0),
            (Arity::Exact(3), 3),
            (Arity::AtLeast(0), -1),
            (Arity::AtLeast(2), -3),
        ];
        for (arity, code) in cases {
            assert_eq!(arity.encode(), code);
            assert_eq!(Arity::decode(code), arity);
        }

        assert!(Arity::Exact(2).check("f", 2).is_ok());
        assert!(Arity::AtLeast(1).check("f", 5).is_ok());
        assert_eq!(
            Arity::AtLeast(2).check("f", 1).unwrap_err(),
            Error::arity_error("f", true, 2, 1)
        );
    }

    #[test]
    fn test_host_registration() {
        fn add(a: i64, b: i64) -> Result<i64, Error> {
            Ok(a + b)
        }
        fn count_args(args: &[Value]) -> Result<Value, Error> {
            Ok(Value::Integer(i64::try_from(args.len()).unwrap()))
        }
        fn weighted(weight: i64, nums: Rest<i64>) -> Result<i64, Error> {
            Ok(weight * nums.into_iter().sum::<i64>())
        }
        fn total(ListArg(items): ListArg) -> Result<i64, Error> {
            items.into_iter().map(i64::try_from).sum()
        }
        fn twice(
            interp: &mut Interpreter,
            args: &[Value],
            scope: ScopeId,
            depth: usize,
        ) -> Result<Value, Error> {
            interp.run_block(args, scope, depth + 1)?;
            interp.run_block(args, scope, depth + 1)
        }

        let mut interp = Interpreter::new();
        interp.register_builtin_operation::<_, (i64, i64)>("add2", add);
        interp.register_builtin_operation::<_, (ListArg,)>("total", total);
        interp.register_builtin_function("count-args", Arity::AtLeast(0), count_args);
        interp.register_variadic_builtin_operation::<_, (i64, Rest<i64>)>(
            "weighted",
            Arity::AtLeast(1),
            weighted,
        );
        interp.register_special_form("twice", Arity::AtLeast(1), twice);

        assert_eq!(interp.run_source("(add2 7 5)").unwrap(), val(12));
        assert_eq!(interp.run_source("(count-args 1 2 3)").unwrap(), val(3));
        assert_eq!(interp.run_source("(weighted 2 1 2 3)").unwrap(), val(12));
        assert_eq!(interp.run_source("(total '(1 2 3))").unwrap(), val(6));
        assert_eq!(
            interp.run_source("(:= $n 0) (twice (:= $n (+ $n 1)))").unwrap(),
            val(2)
        );

        // arity comes from the signature
        assert_eq!(
            interp.run_source("(add2 1)").unwrap_err(),
            Error::arity_error("add2", false, 2, 1)
        );
        // conversion failures name the position and the callable
        assert_eq!(
            interp.run_source("(add2 1 \"x\")").unwrap_err(),
            Error::TypeError {
                found: "string".into(),
                expected: "integer".into(),
                position: Some(2),
                callable: Some("add2".into()),
            }
        );

        // host registrations are visible as bindings
        let names: Vec<String> = interp.bindings().into_iter().map(|(name, _)| name).collect();
        assert!(names.contains(&"&add2".to_owned()));
        assert!(names.contains(&"$n".to_owned()));
    }

    #[test]
    fn test_invoke_and_eval_in() {
        let mut interp = Interpreter::new();
        let root = interp.root();
        interp.run_source("(fn inc ($n) (+ $n 1))").unwrap();

        let inc = interp.lookup_function("inc", root).unwrap();
        assert_eq!(inc.arity(), Arity::Exact(1));
        assert_eq!(inc.strategy(), Strategy::Eager);
        assert_eq!(interp.invoke(&inc, &[val(41)], root).unwrap(), val(42));

        let plus = interp.lookup_function("+", root).unwrap();
        assert!(matches!(plus, Callable::Builtin(_)));
        let node = parse_program("(+ 1 2)").unwrap().remove(0);
        assert_eq!(interp.eval_in(&node, root).unwrap(), val(3));

        let if_form = interp.lookup_function("if", root).unwrap();
        assert_eq!(if_form.strategy(), Strategy::ShortCircuit);
    }

    #[test]
    fn test_function_values_and_identity() {
        let mut interp = Interpreter::new();
        let defined = interp.run_source("(fn id ($x) $x)").unwrap();
        let Value::Function(callable) = &defined else {
            panic!("expected a function value, got {defined:?}");
        };
        assert_eq!(callable.name(), "id");
        assert_eq!(defined.to_string(), "#<fn id>");

        // the same definition compares equal to itself only
        let again = interp.run_source("(fn id ($x) $x)").unwrap();
        assert_eq!(defined, defined.clone());
        assert_ne!(defined, again);
    }

    #[test]
    fn test_benchmark_reports_elapsed_time() {
        let mut interp = Interpreter::new();
        let result = interp
            .run_source("(:= $n 0) (benchmark 3 (:= $n (+ $n 1)))")
            .unwrap();
        assert!(matches!(result, Value::Float(ms) if ms >= 0.0));
        assert_eq!(interp.run_source("$n").unwrap(), val(3));
        assert!(interp.run_source("(benchmark \"x\" 1)").is_err());
    }

    #[test]
    fn test_unknown_startup_dialect() {
        let config = InterpreterConfig {
            dialect: "nope".into(),
            ..InterpreterConfig::default()
        };
        assert!(Interpreter::with_config(config).is_err());

        let mut interp = Interpreter::with_config(InterpreterConfig {
            dialect: "extended".into(),
            ..InterpreterConfig::default()
        })
        .unwrap();
        assert_eq!(interp.dialect().name, "extended");
        assert_eq!(interp.set_dialect("core").unwrap(), "extended");
    }
}
