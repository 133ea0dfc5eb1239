//! Built-in operations registry and the named dialects built from it.
//!
//! Operations are defined once in immutable, process-wide tables created on first use.
//! A [`Dialect`] is a named view over those tables together with the evaluator features it
//! enables. Switching dialects swaps which table an interpreter reads; the tables
//! themselves never change.
//!
//! ```text
//! (+ 1 2.5)            ; arithmetic, promoted to float
//! (< 1 2 3)            ; chained comparison
//! (put `((a 1)) b 2)   ; collections are copied, never mutated
//! (dialect extended)   ; switch the active table
//! ```
//!
//! ## Functions vs Special Forms
//!
//! - **Eager operations** receive resolved arguments (e.g. `+`, `not`, `first`)
//! - **Short-circuit forms** receive raw argument nodes and evaluate what they need
//!   (e.g. `if`, `for`, `and`). Their bodies live in [`crate::evaluator::forms`].
//!
//! ## Error Handling
//!
//! - **Type Safety**: operations reject incorrect types (`(not 42)` errors) instead of
//!   guessing a truth value
//! - **Overflow Detection**: integer arithmetic reports overflow and division by zero
//! - **Arity Checking**: the dispatcher validates argument counts before evaluation

use crate::ast::{Number, Value, sorted_entries};
use crate::evaluator::forms::{
    SpecialFormFn, eval_and, eval_apply, eval_assign, eval_benchmark, eval_call, eval_dialect,
    eval_do, eval_fn, eval_for, eval_if, eval_lambda, eval_map, eval_or, eval_while,
};
use crate::evaluator::intooperation::{
    DictArg, IntoOperation, IntoVariadicOperation, ListArg, OperationFn, Rest,
};
use crate::evaluator::{Arity, Strategy};
use crate::{DEFAULT_DIALECT, Error};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::{Arc, LazyLock};

/// Represents the implementation of a built-in operation
#[derive(Clone)]
pub enum OpKind {
    /// Receives evaluated arguments through the canonical erased signature
    Eager(Arc<OperationFn>),
    /// Receives the interpreter, unevaluated arguments, the calling scope and the
    /// current evaluation depth
    ShortCircuit(SpecialFormFn),
}

impl std::fmt::Debug for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Eager(_) => write!(f, "Eager(<fn>)"),
            OpKind::ShortCircuit(_) => write!(f, "ShortCircuit(<fn>)"),
        }
    }
}

/// Definition of a built-in operation
#[derive(Debug, Clone)]
pub struct BuiltinOp {
    /// Name the operation is called by
    pub name: String,
    pub op_kind: OpKind,
    /// Expected number of arguments
    pub arity: Arity,
}

impl PartialEq for BuiltinOp {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl BuiltinOp {
    pub fn eager(name: &str, arity: Arity, func: Arc<OperationFn>) -> Self {
        BuiltinOp {
            name: name.to_owned(),
            op_kind: OpKind::Eager(func),
            arity,
        }
    }

    pub fn short_circuit(name: &str, arity: Arity, form: SpecialFormFn) -> Self {
        BuiltinOp {
            name: name.to_owned(),
            op_kind: OpKind::ShortCircuit(form),
            arity,
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self.op_kind {
            OpKind::Eager(_) => Strategy::Eager,
            OpKind::ShortCircuit(_) => Strategy::ShortCircuit,
        }
    }

    pub fn is_special_form(&self) -> bool {
        self.strategy() == Strategy::ShortCircuit
    }
}

/// Evaluator behaviors a dialect turns on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    /// `$x` may resolve through a bound `@x` or `%x` with context coercion
    pub cross_namespace_lookup: bool,
    /// A non-atom expression head is evaluated and called if it yields a function
    pub callable_heads: bool,
    /// `for` walks dictionaries entry by entry instead of flattening them
    pub dictionary_iteration: bool,
}

/// A named builtin table.
#[derive(Debug)]
pub struct Dialect {
    pub name: &'static str,
    pub description: &'static str,
    pub features: Features,
    pub ops: HashMap<&'static str, &'static BuiltinOp>,
}

impl Dialect {
    pub fn get(&self, name: &str) -> Option<&'static BuiltinOp> {
        self.ops.get(name).copied()
    }

    /// Operation names in sorted order.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.ops.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

//
// Builtin Function Implementations
//

#[derive(Debug, Clone, Copy)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl ArithOp {
    fn noun(self) -> &'static str {
        match self {
            ArithOp::Add => "addition",
            ArithOp::Sub => "subtraction",
            ArithOp::Mul => "multiplication",
            ArithOp::Div => "division",
            ArithOp::Rem => "remainder",
        }
    }

    /// Integer arithmetic is checked; any float operand turns the step into float arithmetic.
    fn apply(self, a: Number, b: Number) -> Result<Number, Error> {
        if let (Number::Integer(x), Number::Integer(y)) = (a, b) {
            let result = match self {
                ArithOp::Add => x.checked_add(y),
                ArithOp::Sub => x.checked_sub(y),
                ArithOp::Mul => x.checked_mul(y),
                ArithOp::Div | ArithOp::Rem if y == 0 => {
                    return Err(Error::EvalError("Division by zero".into()));
                }
                ArithOp::Div => x.checked_div(y),
                ArithOp::Rem => x.checked_rem(y),
            };
            return result
                .map(Number::Integer)
                .ok_or_else(|| Error::EvalError(format!("Integer overflow in {}", self.noun())));
        }

        let (x, y) = (a.as_f64(), b.as_f64());
        let result = match self {
            ArithOp::Add => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mul => x * y,
            ArithOp::Div | ArithOp::Rem if y == 0.0 => {
                return Err(Error::EvalError("Division by zero".into()));
            }
            ArithOp::Div => x / y,
            ArithOp::Rem => x % y,
        };
        Ok(Number::Float(result))
    }

    fn fold(self, first: Number, rest: Rest<Number>) -> Result<Number, Error> {
        rest.into_iter().try_fold(first, |acc, n| self.apply(acc, n))
    }
}

fn builtin_add(args: Rest<Number>) -> Result<Number, Error> {
    ArithOp::Add.fold(Number::Integer(0), args)
}

fn builtin_sub(first: Number, rest: Rest<Number>) -> Result<Number, Error> {
    if rest.0.is_empty() {
        return ArithOp::Sub.apply(Number::Integer(0), first);
    }
    ArithOp::Sub.fold(first, rest)
}

fn builtin_mul(first: Number, rest: Rest<Number>) -> Result<Number, Error> {
    ArithOp::Mul.fold(first, rest)
}

fn builtin_div(first: Number, rest: Rest<Number>) -> Result<Number, Error> {
    ArithOp::Div.fold(first, rest)
}

fn builtin_rem(a: Number, b: Number) -> Result<Number, Error> {
    ArithOp::Rem.apply(a, b)
}

fn compare_numbers(a: Number, b: Number) -> Option<Ordering> {
    match (a, b) {
        (Number::Integer(x), Number::Integer(y)) => Some(x.cmp(&y)),
        _ => a.as_f64().partial_cmp(&b.as_f64()),
    }
}

// Macro to generate chained numeric comparison functions
macro_rules! numeric_comparison {
    ($name:ident, $($ordering:pat_param)|+) => {
        fn $name(first: Number, rest: Rest<Number>) -> Result<bool, Error> {
            // Adjacent pairs only; stop at the first pair that fails
            let mut prev = first;
            for current in rest {
                if !matches!(compare_numbers(prev, current), Some($($ordering)|+)) {
                    return Ok(false);
                }
                prev = current;
            }
            Ok(true)
        }
    };
}

numeric_comparison!(builtin_lt, Ordering::Less);
numeric_comparison!(builtin_gt, Ordering::Greater);
numeric_comparison!(builtin_le, Ordering::Less | Ordering::Equal);
numeric_comparison!(builtin_ge, Ordering::Greater | Ordering::Equal);

/// Structural equality, except that numbers compare by value across integer and float.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => compare_numbers(x, y) == Some(Ordering::Equal),
        _ => a == b,
    }
}

fn builtin_eq(first: Value, rest: Rest<Value>) -> Result<bool, Error> {
    Ok(rest.into_iter().all(|other| values_equal(&first, &other)))
}

fn builtin_ne(first: Value, rest: Rest<Value>) -> Result<bool, Error> {
    Ok(rest.into_iter().all(|other| !values_equal(&first, &other)))
}

fn builtin_not(b: bool) -> Result<bool, Error> {
    Ok(!b)
}

fn builtin_list(args: Rest<Value>) -> Result<Value, Error> {
    Ok(Value::List(args.into_inner()))
}

fn builtin_dict(args: Rest<Value>) -> Result<Value, Error> {
    Value::List(args.into_inner())
        .as_dictionary()
        .map(Value::Dictionary)
}

fn builtin_len(value: Value) -> Result<i64, Error> {
    let len = match &value {
        Value::List(items) => items.len(),
        Value::Dictionary(map) => map.len(),
        Value::String(s) => s.chars().count(),
        other => {
            return Err(Error::type_error(
                other.type_name(),
                "list, dictionary or string",
            ));
        }
    };
    i64::try_from(len).map_err(|_| Error::EvalError("Length out of range".into()))
}

fn builtin_first(ListArg(items): ListArg) -> Result<Value, Error> {
    items
        .into_iter()
        .next()
        .ok_or_else(|| Error::EvalError("first of empty list".into()))
}

fn builtin_rest(ListArg(items): ListArg) -> Result<Value, Error> {
    Ok(Value::List(items.into_iter().skip(1).collect()))
}

fn builtin_nth(ListArg(items): ListArg, index: i64) -> Result<Value, Error> {
    usize::try_from(index)
        .ok()
        .and_then(|i| items.get(i).cloned())
        .ok_or_else(|| {
            Error::EvalError(format!(
                "Index {index} out of range for list of length {}",
                items.len()
            ))
        })
}

fn builtin_push(ListArg(mut items): ListArg, values: Rest<Value>) -> Result<Value, Error> {
    items.extend(values);
    Ok(Value::List(items))
}

fn builtin_concat(lists: Rest<ListArg>) -> Result<Value, Error> {
    Ok(Value::List(
        lists.into_iter().flat_map(|ListArg(items)| items).collect(),
    ))
}

fn builtin_get(DictArg(map): DictArg, key: Value) -> Result<Value, Error> {
    Ok(map.get(&key).cloned().unwrap_or_else(Value::nil))
}

fn builtin_put(DictArg(mut map): DictArg, key: Value, value: Value) -> Result<Value, Error> {
    map.insert(key, value);
    Ok(Value::Dictionary(map))
}

fn builtin_has(DictArg(map): DictArg, key: Value) -> Result<bool, Error> {
    Ok(map.contains_key(&key))
}

fn builtin_keys(DictArg(map): DictArg) -> Result<Value, Error> {
    Ok(Value::List(
        sorted_entries(&map)
            .into_iter()
            .map(|(key, _)| key.clone())
            .collect(),
    ))
}

fn builtin_values(DictArg(map): DictArg) -> Result<Value, Error> {
    Ok(Value::List(
        sorted_entries(&map)
            .into_iter()
            .map(|(_, value)| value.clone())
            .collect(),
    ))
}

fn join_rendered(args: Rest<Value>, separator: &str) -> String {
    args.into_iter()
        .map(|value| value.render())
        .collect::<Vec<_>>()
        .join(separator)
}

fn builtin_str(args: Rest<Value>) -> Result<String, Error> {
    Ok(join_rendered(args, ""))
}

fn builtin_type(value: Value) -> Result<Value, Error> {
    Ok(Value::Atom(value.type_name().to_owned()))
}

fn builtin_error(args: Rest<Value>) -> Result<Value, Error> {
    let message = join_rendered(args, " ");
    if message.is_empty() {
        Err(Error::EvalError("Error".into()))
    } else {
        Err(Error::EvalError(message))
    }
}

fn io_error(err: &std::io::Error) -> Error {
    Error::EvalError(format!("I/O error: {err}"))
}

fn builtin_print(args: Rest<Value>) -> Result<Value, Error> {
    let line = join_rendered(args, " ");
    let mut out = std::io::stdout().lock();
    writeln!(out, "{line}").map_err(|err| io_error(&err))?;
    Ok(Value::nil())
}

/// Read one line from standard input after writing an optional prompt. End of input is `nil`.
fn builtin_input(prompt: Rest<Value>) -> Result<Value, Error> {
    let prompt = join_rendered(prompt, " ");
    if !prompt.is_empty() {
        let mut out = std::io::stdout().lock();
        write!(out, "{prompt}")
            .and_then(|()| out.flush())
            .map_err(|err| io_error(&err))?;
    }

    let mut line = String::new();
    let read = std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|err| io_error(&err))?;
    if read == 0 {
        return Ok(Value::nil());
    }
    let trimmed = line.trim_end_matches(['\n', '\r']);
    Ok(Value::String(trimmed.to_owned()))
}

fn builtin_fixed<Args, F>(f: F) -> Arc<OperationFn>
where
    F: IntoOperation<Args>,
{
    <F as IntoOperation<Args>>::into_operation(f)
}

fn builtin_variadic<Args, F>(f: F) -> Arc<OperationFn>
where
    F: IntoVariadicOperation<Args>,
{
    <F as IntoVariadicOperation<Args>>::into_variadic_operation(f)
}

/// Operations every dialect provides.
///
/// The registry is a single contiguous collection for ease of auditing; every
/// eager builtin is wired through the same adapter layer hosts use for their own
/// registrations.
static CORE_OPS: LazyLock<Vec<BuiltinOp>> = LazyLock::new(|| {
    use BuiltinOp as Op;

    vec![
        // Arithmetic
        Op::eager(
            "+",
            Arity::AtLeast(0),
            builtin_variadic::<(Rest<Number>,), _>(builtin_add),
        ),
        Op::eager(
            "-",
            Arity::AtLeast(1),
            builtin_variadic::<(Number, Rest<Number>), _>(builtin_sub),
        ),
        Op::eager(
            "*",
            Arity::AtLeast(1),
            builtin_variadic::<(Number, Rest<Number>), _>(builtin_mul),
        ),
        Op::eager(
            "/",
            Arity::AtLeast(2),
            builtin_variadic::<(Number, Rest<Number>), _>(builtin_div),
        ),
        Op::eager(
            "%",
            Arity::Exact(2),
            builtin_fixed::<(Number, Number), _>(builtin_rem),
        ),
        // Comparison
        Op::eager(
            "<",
            Arity::AtLeast(2),
            builtin_variadic::<(Number, Rest<Number>), _>(builtin_lt),
        ),
        Op::eager(
            ">",
            Arity::AtLeast(2),
            builtin_variadic::<(Number, Rest<Number>), _>(builtin_gt),
        ),
        Op::eager(
            "<=",
            Arity::AtLeast(2),
            builtin_variadic::<(Number, Rest<Number>), _>(builtin_le),
        ),
        Op::eager(
            ">=",
            Arity::AtLeast(2),
            builtin_variadic::<(Number, Rest<Number>), _>(builtin_ge),
        ),
        Op::eager(
            "=",
            Arity::AtLeast(2),
            builtin_variadic::<(Value, Rest<Value>), _>(builtin_eq),
        ),
        Op::eager(
            "/=",
            Arity::AtLeast(2),
            builtin_variadic::<(Value, Rest<Value>), _>(builtin_ne),
        ),
        // Logic
        Op::eager(
            "not",
            Arity::Exact(1),
            builtin_fixed::<(bool,), _>(builtin_not),
        ),
        Op::short_circuit("and", Arity::AtLeast(1), eval_and),
        Op::short_circuit("or", Arity::AtLeast(1), eval_or),
        // Control flow and binding
        Op::short_circuit("if", Arity::AtLeast(1), eval_if),
        Op::short_circuit("while", Arity::AtLeast(1), eval_while),
        Op::short_circuit("do", Arity::AtLeast(0), eval_do),
        Op::short_circuit("for", Arity::AtLeast(3), eval_for),
        Op::short_circuit("fn", Arity::AtLeast(2), eval_fn),
        Op::short_circuit(":=", Arity::Exact(2), eval_assign),
        Op::short_circuit("dialect", Arity::AtLeast(0), eval_dialect),
        Op::short_circuit("benchmark", Arity::AtLeast(1), eval_benchmark),
        // Lists
        Op::eager(
            "list",
            Arity::AtLeast(0),
            builtin_variadic::<(Rest<Value>,), _>(builtin_list),
        ),
        Op::eager(
            "len",
            Arity::Exact(1),
            builtin_fixed::<(Value,), _>(builtin_len),
        ),
        Op::eager(
            "first",
            Arity::Exact(1),
            builtin_fixed::<(ListArg,), _>(builtin_first),
        ),
        Op::eager(
            "rest",
            Arity::Exact(1),
            builtin_fixed::<(ListArg,), _>(builtin_rest),
        ),
        Op::eager(
            "nth",
            Arity::Exact(2),
            builtin_fixed::<(ListArg, i64), _>(builtin_nth),
        ),
        Op::eager(
            "push",
            Arity::AtLeast(2),
            builtin_variadic::<(ListArg, Rest<Value>), _>(builtin_push),
        ),
        Op::eager(
            "concat",
            Arity::AtLeast(0),
            builtin_variadic::<(Rest<ListArg>,), _>(builtin_concat),
        ),
        // Dictionaries
        Op::eager(
            "dict",
            Arity::AtLeast(0),
            builtin_variadic::<(Rest<Value>,), _>(builtin_dict),
        ),
        Op::eager(
            "get",
            Arity::Exact(2),
            builtin_fixed::<(DictArg, Value), _>(builtin_get),
        ),
        Op::eager(
            "put",
            Arity::Exact(3),
            builtin_fixed::<(DictArg, Value, Value), _>(builtin_put),
        ),
        Op::eager(
            "has",
            Arity::Exact(2),
            builtin_fixed::<(DictArg, Value), _>(builtin_has),
        ),
        Op::eager(
            "keys",
            Arity::Exact(1),
            builtin_fixed::<(DictArg,), _>(builtin_keys),
        ),
        Op::eager(
            "values",
            Arity::Exact(1),
            builtin_fixed::<(DictArg,), _>(builtin_values),
        ),
        // Strings, reflection, errors
        Op::eager(
            "str",
            Arity::AtLeast(0),
            builtin_variadic::<(Rest<Value>,), _>(builtin_str),
        ),
        Op::eager(
            "type",
            Arity::Exact(1),
            builtin_fixed::<(Value,), _>(builtin_type),
        ),
        Op::eager(
            "error",
            Arity::AtLeast(0),
            builtin_variadic::<(Rest<Value>,), _>(builtin_error),
        ),
        // Host stream pass-throughs
        Op::eager(
            "print",
            Arity::AtLeast(0),
            builtin_variadic::<(Rest<Value>,), _>(builtin_print),
        ),
        Op::eager(
            "input",
            Arity::AtLeast(0),
            builtin_variadic::<(Rest<Value>,), _>(builtin_input),
        ),
    ]
});

/// Operations added on top of the core table by the extended dialect.
static EXTENDED_OPS: LazyLock<Vec<BuiltinOp>> = LazyLock::new(|| {
    vec![
        BuiltinOp::short_circuit("lambda", Arity::AtLeast(1), eval_lambda),
        BuiltinOp::short_circuit("call", Arity::AtLeast(1), eval_call),
        BuiltinOp::short_circuit("apply", Arity::Exact(2), eval_apply),
        BuiltinOp::short_circuit("map", Arity::Exact(2), eval_map),
    ]
});

fn table(layers: &[&'static [BuiltinOp]]) -> HashMap<&'static str, &'static BuiltinOp> {
    // Later layers override earlier ones
    layers
        .iter()
        .copied()
        .flat_map(<[BuiltinOp]>::iter)
        .map(|op| (op.name.as_str(), op))
        .collect()
}

static CORE: LazyLock<Dialect> = LazyLock::new(|| Dialect {
    name: "core",
    description: "default builtin table with strict per-namespace lookup",
    features: Features::default(),
    ops: table(&[CORE_OPS.as_slice()]),
});

static EXTENDED: LazyLock<Dialect> = LazyLock::new(|| Dialect {
    name: "extended",
    description: "core plus first-class functions, cross-namespace lookup and dictionary iteration",
    features: Features {
        cross_namespace_lookup: true,
        callable_heads: true,
        dictionary_iteration: true,
    },
    ops: table(&[CORE_OPS.as_slice(), EXTENDED_OPS.as_slice()]),
});

/// Every dialect an interpreter can switch to.
pub fn available_dialects() -> [&'static Dialect; 2] {
    [&*CORE, &*EXTENDED]
}

/// Find a dialect by name
pub fn find_dialect(name: &str) -> Option<&'static Dialect> {
    available_dialects()
        .into_iter()
        .find(|dialect| dialect.name == name)
}

pub(crate) fn default_dialect() -> &'static Dialect {
    find_dialect(DEFAULT_DIALECT).unwrap_or(&*CORE)
}
