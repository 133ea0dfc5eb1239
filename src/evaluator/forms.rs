//! Control forms: callables that receive their arguments unevaluated.
//!
//! Each form gets the interpreter, the raw argument nodes, the calling scope and the
//! current evaluation depth. Operands are evaluated at `depth + 1` so recursion through
//! control forms counts against the depth limit.

use super::{Callable, Interpreter, Param, UserFunction};
use crate::Error;
use crate::ast::{Shape, Value, sorted_entries};
use crate::scope::ScopeId;
use std::collections::HashSet;
use std::rc::Rc;
use std::time::Instant;
use tracing::debug;

/// Signature shared by all short-circuit callables.
pub type SpecialFormFn = fn(&mut Interpreter, &[Value], ScopeId, usize) -> Result<Value, Error>;

/// Evaluate a condition that must produce `t` or `nil`.
fn eval_condition(
    interp: &mut Interpreter,
    node: &Value,
    scope: ScopeId,
    depth: usize,
) -> Result<bool, Error> {
    let value = interp.eval(node, scope, depth + 1)?;
    value
        .truth()
        .ok_or_else(|| Error::type_error(value.type_name(), "t or nil").at_position(1))
}

fn is_else(node: &Value) -> bool {
    node.as_atom() == Some("else")
}

/// `(if cond then... [else else...])`
pub(crate) fn eval_if(
    interp: &mut Interpreter,
    args: &[Value],
    scope: ScopeId,
    depth: usize,
) -> Result<Value, Error> {
    let [condition, branches @ ..] = args else {
        return Err(Error::arity_error("if", true, 1, 0));
    };
    let (then_branch, else_branch) = match branches.iter().position(is_else) {
        Some(split) => (&branches[..split], &branches[split + 1..]),
        None => (branches, &[][..]),
    };

    if eval_condition(interp, condition, scope, depth)? {
        interp.run_block(then_branch, scope, depth + 1)
    } else {
        interp.run_block(else_branch, scope, depth + 1)
    }
}

/// `(while cond body...)`
pub(crate) fn eval_while(
    interp: &mut Interpreter,
    args: &[Value],
    scope: ScopeId,
    depth: usize,
) -> Result<Value, Error> {
    let [condition, body @ ..] = args else {
        return Err(Error::arity_error("while", true, 1, 0));
    };
    let mut last = Value::nil();
    while eval_condition(interp, condition, scope, depth)? {
        last = interp.run_block(body, scope, depth + 1)?;
    }
    Ok(last)
}

/// `(do body...)`
pub(crate) fn eval_do(
    interp: &mut Interpreter,
    args: &[Value],
    scope: ScopeId,
    depth: usize,
) -> Result<Value, Error> {
    interp.run_block(args, scope, depth + 1)
}

/// `(for $var in iterable body...)`
pub(crate) fn eval_for(
    interp: &mut Interpreter,
    args: &[Value],
    scope: ScopeId,
    depth: usize,
) -> Result<Value, Error> {
    let [target, keyword, iterable, body @ ..] = args else {
        return Err(Error::arity_error("for", true, 3, args.len()));
    };
    let Some((shape, name)) = target.variable() else {
        return Err(Error::type_error(target.type_name(), "loop variable").at_position(1));
    };
    if keyword.as_atom() != Some("in") {
        return Err(Error::type_error(keyword.to_string(), "atom in").at_position(2));
    }

    let collection = interp.eval(iterable, scope, depth + 1)?;
    let items: Vec<Value> = match &collection {
        Value::Dictionary(map) if interp.dialect().features.dictionary_iteration => {
            sorted_entries(map)
                .into_iter()
                .map(|(key, value)| match shape {
                    Shape::Scalar => key.clone(),
                    Shape::List | Shape::Dictionary => {
                        Value::List(vec![key.clone(), value.clone()])
                    }
                })
                .collect()
        }
        other => other.as_list().map_err(|err| err.at_position(3))?,
    };

    let name = name.to_owned();
    let frame = interp.scopes_mut().push(scope);
    let result = run_loop(interp, shape, &name, items, body, frame, depth);
    interp.scopes_mut().pop(frame);
    result
}

fn run_loop(
    interp: &mut Interpreter,
    shape: Shape,
    name: &str,
    items: Vec<Value>,
    body: &[Value],
    frame: ScopeId,
    depth: usize,
) -> Result<Value, Error> {
    let mut last = Value::nil();
    for item in items {
        if item.shape() != shape {
            return Err(Error::type_error(
                item.type_name(),
                format!("{} for loop variable {}{name}", shape.name(), shape.sigil()),
            ));
        }
        interp.scopes_mut().define(frame, shape, name, item);
        last = interp.run_block(body, frame, depth + 1)?;
    }
    Ok(last)
}

/// Read a parameter list: variable references, optionally ending in `(@rest)`.
fn parse_params(node: &Value) -> Result<(Vec<Param>, Option<String>), Error> {
    let Value::Expression(items) = node else {
        return Err(Error::type_error(node.type_name(), "parameter list"));
    };

    let mut params = Vec::with_capacity(items.len());
    let mut rest = None;
    let mut seen = HashSet::new();
    for (i, item) in items.iter().enumerate() {
        let is_last = i + 1 == items.len();
        let (shape, name) = match item {
            Value::Expression(inner) if is_last => match inner.as_slice() {
                [Value::ListVar(name)] => (Shape::List, name.as_str()),
                _ => {
                    return Err(Error::type_error(item.to_string(), "rest parameter (@name)"));
                }
            },
            other => other
                .variable()
                .ok_or_else(|| Error::type_error(other.type_name(), "parameter"))?,
        };
        if !seen.insert((shape, name)) {
            return Err(Error::EvalError(format!(
                "Duplicate parameter name: {}{name}",
                shape.sigil()
            )));
        }
        if matches!(item, Value::Expression(_)) {
            rest = Some(name.to_owned());
        } else {
            params.push(Param {
                shape,
                name: name.to_owned(),
            });
        }
    }
    Ok((params, rest))
}

fn make_function(
    interp: &mut Interpreter,
    name: &str,
    params_node: &Value,
    body: &[Value],
    scope: ScopeId,
) -> Result<Callable, Error> {
    let (params, rest) = parse_params(params_node)?;
    let function = Rc::new(UserFunction {
        name: name.to_owned(),
        params,
        rest,
        body: body.into(),
        scope,
    });
    interp.scopes_mut().capture(&function);
    Ok(Callable::User(function))
}

/// `(fn name (params) body...)`
pub(crate) fn eval_fn(
    interp: &mut Interpreter,
    args: &[Value],
    scope: ScopeId,
    _depth: usize,
) -> Result<Value, Error> {
    let [name_node, params_node, body @ ..] = args else {
        return Err(Error::arity_error("fn", true, 2, args.len()));
    };
    let Some(name) = name_node.as_atom() else {
        return Err(Error::type_error(name_node.type_name(), "function name").at_position(1));
    };

    let callable = make_function(interp, name, params_node, body, scope)
        .map_err(|err| err.at_position(2))?;
    debug!(name, arity = ?callable.arity(), "function defined");
    interp
        .scopes_mut()
        .define_function(scope, name, callable.clone());
    Ok(Value::Function(callable))
}

/// `(lambda (params) body...)`
pub(crate) fn eval_lambda(
    interp: &mut Interpreter,
    args: &[Value],
    scope: ScopeId,
    _depth: usize,
) -> Result<Value, Error> {
    let [params_node, body @ ..] = args else {
        return Err(Error::arity_error("lambda", true, 1, 0));
    };
    let callable = make_function(interp, "lambda", params_node, body, scope)
        .map_err(|err| err.at_position(1))?;
    Ok(Value::Function(callable))
}

/// `(:= $var expr)`
pub(crate) fn eval_assign(
    interp: &mut Interpreter,
    args: &[Value],
    scope: ScopeId,
    depth: usize,
) -> Result<Value, Error> {
    let [target, expr] = args else {
        return Err(Error::arity_error(":=", false, 2, args.len()));
    };
    let Some((shape, name)) = target.variable() else {
        return Err(Error::type_error(target.type_name(), "variable reference").at_position(1));
    };

    let value = interp.eval(expr, scope, depth + 1)?;
    if value.shape() != shape {
        return Err(Error::type_error(
            value.type_name(),
            format!("{} for {target}", shape.name()),
        )
        .at_position(2));
    }
    interp.scopes_mut().set(scope, shape, name, value.clone());
    Ok(value)
}

macro_rules! boolean_logic_op {
    ($name:ident, $op_name:expr, $short_circuit:literal) => {
        pub(crate) fn $name(
            interp: &mut Interpreter,
            args: &[Value],
            scope: ScopeId,
            depth: usize,
        ) -> Result<Value, Error> {
            if args.is_empty() {
                return Err(Error::arity_error($op_name, true, 1, 0));
            }

            for (i, arg) in args.iter().enumerate() {
                let result = interp.eval(arg, scope, depth + 1)?;
                match result.truth() {
                    Some($short_circuit) => return Ok(Value::from($short_circuit)),
                    Some(_) => {}
                    None => {
                        return Err(
                            Error::type_error(result.type_name(), "t or nil").at_position(i + 1)
                        );
                    }
                }
            }
            Ok(Value::from(!$short_circuit))
        }
    };
}

boolean_logic_op!(eval_and, "and", false);
boolean_logic_op!(eval_or, "or", true);

/// `(dialect)` or `(dialect name)`
pub(crate) fn eval_dialect(
    interp: &mut Interpreter,
    args: &[Value],
    scope: ScopeId,
    depth: usize,
) -> Result<Value, Error> {
    match args {
        [] => Ok(Value::Atom(interp.dialect().name.to_owned())),
        [node] => {
            let requested = interp.eval(node, scope, depth + 1)?;
            let name = match &requested {
                Value::Atom(name) | Value::String(name) => name.as_str(),
                other => {
                    return Err(Error::type_error(other.type_name(), "dialect name").at_position(1));
                }
            };
            let previous = interp.set_dialect(name)?;
            Ok(Value::Atom(previous.to_owned()))
        }
        _ => Err(Error::arity_error("dialect", false, 1, args.len())),
    }
}

/// `(benchmark n body...)`: run the body `n` times and report elapsed milliseconds.
pub(crate) fn eval_benchmark(
    interp: &mut Interpreter,
    args: &[Value],
    scope: ScopeId,
    depth: usize,
) -> Result<Value, Error> {
    let [count, body @ ..] = args else {
        return Err(Error::arity_error("benchmark", true, 1, 0));
    };
    let count =
        i64::try_from(interp.eval(count, scope, depth + 1)?).map_err(|err| err.at_position(1))?;

    let start = Instant::now();
    for _ in 0..count {
        interp.run_block(body, scope, depth + 1)?;
    }
    let elapsed = start.elapsed().as_secs_f64() * 1000.0;
    debug!(iterations = count, elapsed_ms = elapsed, "benchmark finished");
    Ok(Value::Float(elapsed))
}

/// Turn a function value, or an atom naming a function, into a callable.
fn resolve_callable(
    interp: &mut Interpreter,
    node: &Value,
    scope: ScopeId,
    depth: usize,
) -> Result<Callable, Error> {
    match interp.eval(node, scope, depth + 1)? {
        Value::Function(callable) => Ok(callable),
        Value::Atom(name) => interp.lookup_function(&name, scope),
        other => Err(Error::type_error(other.type_name(), "function").at_position(1)),
    }
}

/// `(call f args...)`: invoke a function value with raw arguments.
pub(crate) fn eval_call(
    interp: &mut Interpreter,
    args: &[Value],
    scope: ScopeId,
    depth: usize,
) -> Result<Value, Error> {
    let [function, rest @ ..] = args else {
        return Err(Error::arity_error("call", true, 1, 0));
    };
    let callable = resolve_callable(interp, function, scope, depth)?;
    interp.invoke_at(&callable, rest, scope, depth + 1)
}

/// `(apply f list)`: invoke a function with the elements of a list as arguments.
pub(crate) fn eval_apply(
    interp: &mut Interpreter,
    args: &[Value],
    scope: ScopeId,
    depth: usize,
) -> Result<Value, Error> {
    let [function, list] = args else {
        return Err(Error::arity_error("apply", false, 2, args.len()));
    };
    let callable = resolve_callable(interp, function, scope, depth)?;
    let values = interp
        .eval(list, scope, depth + 1)?
        .as_list()
        .map_err(|err| err.at_position(2))?;
    interp.apply_values(&callable, values, depth + 1)
}

/// `(map f list)`: apply a one-argument function to every element.
pub(crate) fn eval_map(
    interp: &mut Interpreter,
    args: &[Value],
    scope: ScopeId,
    depth: usize,
) -> Result<Value, Error> {
    let [function, list] = args else {
        return Err(Error::arity_error("map", false, 2, args.len()));
    };
    let callable = resolve_callable(interp, function, scope, depth)?;
    let values = interp
        .eval(list, scope, depth + 1)?
        .as_list()
        .map_err(|err| err.at_position(2))?;
    values
        .into_iter()
        .map(|value| interp.apply_values(&callable, vec![value], depth + 1))
        .collect::<Result<Vec<_>, _>>()
        .map(Value::List)
}
