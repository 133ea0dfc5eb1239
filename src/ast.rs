//! This module defines the runtime value model of the interpreter. The main enum,
//! [`Value`], is closed: every operation on values (rendering, equality, hashing, type
//! reports and context coercion) matches it exhaustively. Parse trees are made of the
//! same values, with [`Value::Expression`] marking a form that has not been reduced yet.
//!
//! Every value has a native [`Shape`]. When a value is used in a context that asks for a
//! different shape, [`Value::coerce`] converts it:
//!
//! - a list or dictionary used as a scalar is its element count
//! - a dictionary used as a list is its key/value pairs flattened in canonical key order
//! - a list used as a dictionary pairs consecutive elements, `(k1 v1 k2 v2)`
//!
//! Any other combination has no context and fails with a type error.
//!
//! Ergonomic helpers such as [`val`], [`atom`] and [`scalar_var`] build values from Rust
//! literals for hosts and tests.

use crate::Error;
use crate::evaluator::Callable;
use std::any::Any;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::num::FpCategory;
use std::rc::Rc;

/// Atom standing for true.
pub const TRUE_ATOM: &str = "t";

/// Atom standing for false and for "no value".
pub const NIL_ATOM: &str = "nil";

/// An opaque object owned by the host application.
///
/// Foreign values behave as scalars inside scripts: they can be stored, passed around and
/// compared by identity, and the host unwraps them again with [`Value::downcast_foreign`].
pub trait Foreign: fmt::Debug {
    /// Type tag reported by `type` and in error messages
    fn type_name(&self) -> &str;

    /// Text shown when the value is printed
    fn render(&self) -> String;

    fn as_any(&self) -> &dyn Any;
}

/// The three value shapes, each with its own sigil and namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    Scalar,
    List,
    Dictionary,
}

impl Shape {
    pub fn sigil(self) -> char {
        match self {
            Shape::Scalar => '$',
            Shape::List => '@',
            Shape::Dictionary => '%',
        }
    }

    pub fn from_sigil(sigil: char) -> Option<Shape> {
        match sigil {
            '$' => Some(Shape::Scalar),
            '@' => Some(Shape::List),
            '%' => Some(Shape::Dictionary),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Shape::Scalar => "scalar",
            Shape::List => "list",
            Shape::Dictionary => "dictionary",
        }
    }

    /// Namespaces consulted, in order, when a lookup in this shape's own namespace misses.
    pub(crate) fn fallbacks(self) -> [Shape; 2] {
        match self {
            Shape::Scalar => [Shape::List, Shape::Dictionary],
            Shape::List => [Shape::Dictionary, Shape::Scalar],
            Shape::Dictionary => [Shape::List, Shape::Scalar],
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Shape::Scalar => 0,
            Shape::List => 1,
            Shape::Dictionary => 2,
        }
    }
}

/// A number argument that may be either integral or floating point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Integer(i64),
    Float(f64),
}

impl Number {
    #[expect(clippy::cast_precision_loss)] // integer to float promotion is the language rule
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Integer(n) => n as f64,
            Number::Float(x) => x,
        }
    }
}

impl From<Number> for Value {
    fn from(n: Number) -> Self {
        match n {
            Number::Integer(n) => Value::Integer(n),
            Number::Float(x) => Value::Float(x),
        }
    }
}

/// Core value type of the interpreter
#[derive(Clone, Debug)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
    /// Bare symbol; `t` and `nil` double as the booleans
    Atom(String),
    /// `$name` reference, stored without its sigil
    ScalarVar(String),
    /// `@name` reference, stored without its sigil
    ListVar(String),
    /// `%name` reference, stored without its sigil
    DictVar(String),
    List(Vec<Value>),
    Dictionary(HashMap<Value, Value>),
    Foreign(Rc<dyn Foreign>),
    /// A parenthesized form that has not been evaluated
    Expression(Vec<Value>),
    Function(Callable),
}

impl Value {
    pub fn shape(&self) -> Shape {
        match self {
            Value::List(_) => Shape::List,
            Value::Dictionary(_) => Shape::Dictionary,
            Value::Integer(_)
            | Value::Float(_)
            | Value::String(_)
            | Value::Atom(_)
            | Value::ScalarVar(_)
            | Value::ListVar(_)
            | Value::DictVar(_)
            | Value::Foreign(_)
            | Value::Expression(_)
            | Value::Function(_) => Shape::Scalar,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Atom(_) => "atom",
            Value::ScalarVar(_) => "scalar-var",
            Value::ListVar(_) => "list-var",
            Value::DictVar(_) => "dict-var",
            Value::List(_) => "list",
            Value::Dictionary(_) => "dictionary",
            Value::Foreign(obj) => obj.type_name(),
            Value::Expression(_) => "expression",
            Value::Function(_) => "function",
        }
    }

    /// The shape and bare name of a variable reference.
    pub fn variable(&self) -> Option<(Shape, &str)> {
        match self {
            Value::ScalarVar(name) => Some((Shape::Scalar, name)),
            Value::ListVar(name) => Some((Shape::List, name)),
            Value::DictVar(name) => Some((Shape::Dictionary, name)),
            _ => None,
        }
    }

    pub fn variable_ref(shape: Shape, name: impl Into<String>) -> Value {
        match shape {
            Shape::Scalar => Value::ScalarVar(name.into()),
            Shape::List => Value::ListVar(name.into()),
            Shape::Dictionary => Value::DictVar(name.into()),
        }
    }

    pub fn nil() -> Value {
        Value::Atom(NIL_ATOM.to_owned())
    }

    pub fn t() -> Value {
        Value::Atom(TRUE_ATOM.to_owned())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Atom(name) if name == NIL_ATOM)
    }

    /// Boolean reading of `t`/`nil`. Every other value has no truth value.
    pub fn truth(&self) -> Option<bool> {
        match self {
            Value::Atom(name) if name == TRUE_ATOM => Some(true),
            Value::Atom(name) if name == NIL_ATOM => Some(false),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Integer(n) => Some(Number::Integer(*n)),
            Value::Float(x) => Some(Number::Float(*x)),
            _ => None,
        }
    }

    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Value::Atom(name) => Some(name),
            _ => None,
        }
    }

    /// Unwrap a host object of a known type.
    pub fn downcast_foreign<T: 'static>(&self) -> Option<&T> {
        match self {
            Value::Foreign(obj) => obj.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Text of a value for output: strings without quotes, everything else as displayed.
    pub fn render(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Foreign(obj) => obj.render(),
            other => other.to_string(),
        }
    }

    /// Scalar reading of a value. Collections read as their element count.
    pub fn as_scalar(&self) -> Result<Value, Error> {
        match self {
            Value::List(items) => Ok(Value::Integer(count(items.len()))),
            Value::Dictionary(map) => Ok(Value::Integer(count(map.len()))),
            scalar => Ok(scalar.clone()),
        }
    }

    /// List reading of a value. Dictionaries flatten to `(k1 v1 k2 v2 ...)`.
    pub fn as_list(&self) -> Result<Vec<Value>, Error> {
        match self {
            Value::List(items) => Ok(items.clone()),
            Value::Dictionary(map) => Ok(sorted_entries(map)
                .into_iter()
                .flat_map(|(key, value)| [key.clone(), value.clone()])
                .collect()),
            other => Err(Error::type_error(other.type_name(), "list")),
        }
    }

    /// Dictionary reading of a value. Lists pair consecutive elements.
    pub fn as_dictionary(&self) -> Result<HashMap<Value, Value>, Error> {
        match self {
            Value::Dictionary(map) => Ok(map.clone()),
            Value::List(items) => {
                if items.len() % 2 != 0 {
                    return Err(Error::type_error(
                        format!("list of odd length {}", items.len()),
                        "dictionary",
                    ));
                }
                Ok(items
                    .chunks_exact(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect())
            }
            other => Err(Error::type_error(other.type_name(), "dictionary")),
        }
    }

    /// Convert a value into the given shape.
    pub fn coerce(&self, shape: Shape) -> Result<Value, Error> {
        match shape {
            Shape::Scalar => self.as_scalar(),
            Shape::List => self.as_list().map(Value::List),
            Shape::Dictionary => self.as_dictionary().map(Value::Dictionary),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Integer(_) | Value::Float(_) => 0,
            Value::String(_) => 1,
            Value::Atom(_) => 2,
            Value::ScalarVar(_) | Value::ListVar(_) | Value::DictVar(_) => 3,
            Value::List(_) => 4,
            Value::Dictionary(_) => 5,
            Value::Expression(_) => 6,
            Value::Function(_) => 7,
            Value::Foreign(_) => 8,
        }
    }

    /// Total order used wherever dictionary entries are listed: by kind, then by value.
    pub fn canonical_cmp(&self, other: &Value) -> Ordering {
        self.type_rank()
            .cmp(&other.type_rank())
            .then_with(|| match (self, other) {
                (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
                (Value::Integer(_), Value::Float(_)) | (Value::Float(_), Value::Integer(_)) => {
                    let (Some(a), Some(b)) = (self.as_number(), other.as_number()) else {
                        return Ordering::Equal;
                    };
                    let is_float = |v: &Value| matches!(v, Value::Float(_));
                    a.as_f64()
                        .total_cmp(&b.as_f64())
                        .then_with(|| is_float(self).cmp(&is_float(other)))
                }
                (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
                (Value::String(a), Value::String(b)) | (Value::Atom(a), Value::Atom(b)) => a.cmp(b),
                (Value::List(a), Value::List(b)) | (Value::Expression(a), Value::Expression(b)) => a
                    .iter()
                    .zip(b)
                    .map(|(x, y)| x.canonical_cmp(y))
                    .find(|ord| ord.is_ne())
                    .unwrap_or_else(|| a.len().cmp(&b.len())),
                _ => self.to_string().cmp(&other.to_string()),
            })
    }
}

#[expect(clippy::cast_possible_wrap)] // collection sizes stay far below i64::MAX
fn count(len: usize) -> i64 {
    len as i64
}

/// Dictionary entries in canonical key order.
pub(crate) fn sorted_entries(map: &HashMap<Value, Value>) -> Vec<(&Value, &Value)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.canonical_cmp(b.0));
    entries
}

/// Bit pattern used for float equality and hashing: one zero, one NaN.
fn float_bits(x: f64) -> u64 {
    match x.classify() {
        FpCategory::Zero => 0,
        FpCategory::Nan => f64::NAN.to_bits(),
        _ => x.to_bits(),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => float_bits(*a) == float_bits(*b),
            (Value::String(a), Value::String(b))
            | (Value::Atom(a), Value::Atom(b))
            | (Value::ScalarVar(a), Value::ScalarVar(b))
            | (Value::ListVar(a), Value::ListVar(b))
            | (Value::DictVar(a), Value::DictVar(b)) => a == b,
            (Value::List(a), Value::List(b)) | (Value::Expression(a), Value::Expression(b)) => {
                a == b
            }
            (Value::Dictionary(a), Value::Dictionary(b)) => a == b,
            // Host objects and functions are equal only to themselves
            (Value::Foreign(a), Value::Foreign(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => a.same(b),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Integer(n) => n.hash(state),
            Value::Float(x) => float_bits(*x).hash(state),
            Value::String(s)
            | Value::Atom(s)
            | Value::ScalarVar(s)
            | Value::ListVar(s)
            | Value::DictVar(s) => s.hash(state),
            Value::List(items) | Value::Expression(items) => items.hash(state),
            Value::Dictionary(map) => {
                // Order independent: entries are hashed separately and summed
                let combined = map.iter().fold(0u64, |acc, (key, value)| {
                    let mut hasher = DefaultHasher::new();
                    key.hash(&mut hasher);
                    value.hash(&mut hasher);
                    acc.wrapping_add(hasher.finish())
                });
                map.len().hash(state);
                combined.hash(state);
            }
            Value::Foreign(obj) => Rc::as_ptr(obj).addr().hash(state),
            Value::Function(callable) => callable.identity().hash(state),
        }
    }
}

fn write_float(f: &mut fmt::Formatter<'_>, x: f64) -> fmt::Result {
    if x.is_finite() && x.fract().classify() == FpCategory::Zero {
        write!(f, "{x:.1}")
    } else {
        write!(f, "{x}")
    }
}

fn write_string(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    write!(f, "\"")?;
    for ch in s.chars() {
        match ch {
            '"' => write!(f, "\\\"")?,
            '\\' => write!(f, "\\\\")?,
            '\n' => write!(f, "\\n")?,
            '\t' => write!(f, "\\t")?,
            '\r' => write!(f, "\\r")?,
            c => write!(f, "{c}")?,
        }
    }
    write!(f, "\"")
}

fn write_sequence(f: &mut fmt::Formatter<'_>, items: &[Value], in_literal: bool) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write_value(f, item, in_literal)?;
    }
    Ok(())
}

/// Inside a literal, plain groups already read back as lists, so nested lists drop the quote.
fn write_value(f: &mut fmt::Formatter<'_>, value: &Value, in_literal: bool) -> fmt::Result {
    match value {
        Value::Integer(n) => write!(f, "{n}"),
        Value::Float(x) => write_float(f, *x),
        Value::String(s) => write_string(f, s),
        Value::Atom(name) => write!(f, "{name}"),
        Value::ScalarVar(name) => write!(f, "${name}"),
        Value::ListVar(name) => write!(f, "@{name}"),
        Value::DictVar(name) => write!(f, "%{name}"),
        Value::List(items) => {
            write!(f, "{}(", if in_literal { "" } else { "'" })?;
            write_sequence(f, items, true)?;
            write!(f, ")")
        }
        Value::Dictionary(map) => {
            write!(f, "`(")?;
            for (i, (key, value)) in sorted_entries(map).into_iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "(")?;
                write_value(f, key, true)?;
                write!(f, " ")?;
                write_value(f, value, true)?;
                write!(f, ")")?;
            }
            write!(f, ")")
        }
        Value::Expression(items) => {
            write!(f, "(")?;
            write_sequence(f, items, false)?;
            write!(f, ")")
        }
        Value::Foreign(obj) => write!(f, "#<{} {}>", obj.type_name(), obj.render()),
        Value::Function(callable) => write!(f, "#<fn {}>", callable.name()),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_value(f, self, false)
    }
}

// From trait implementations for Value - enables .into() conversion
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        if b { Value::t() } else { Value::nil() }
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

macro_rules! impl_from_integer {
    ($int_type:ty) => {
        impl From<$int_type> for Value {
            fn from(n: $int_type) -> Self {
                Value::Integer(i64::from(n))
            }
        }
    };
}

impl_from_integer!(i8);
impl_from_integer!(i16);
impl_from_integer!(i32);
impl_from_integer!(i64);
impl_from_integer!(u8);
impl_from_integer!(u16);
impl_from_integer!(u32);

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(arr: [T; N]) -> Self {
        Value::List(arr.into_iter().map(Into::into).collect())
    }
}

impl From<Callable> for Value {
    fn from(callable: Callable) -> Self {
        Value::Function(callable)
    }
}

// Fallible conversions from `Value` back into primitive Rust types.

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<i64, Error> {
        match value {
            Value::Integer(n) => Ok(n),
            other => Err(Error::type_error(other.type_name(), "integer")),
        }
    }
}

impl TryFrom<Value> for f64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<f64, Error> {
        value
            .as_number()
            .map(Number::as_f64)
            .ok_or_else(|| Error::type_error(value.type_name(), "number"))
    }
}

impl TryFrom<Value> for Number {
    type Error = Error;

    fn try_from(value: Value) -> Result<Number, Error> {
        value
            .as_number()
            .ok_or_else(|| Error::type_error(value.type_name(), "number"))
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<String, Error> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(Error::type_error(other.type_name(), "string")),
        }
    }
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<bool, Error> {
        value
            .truth()
            .ok_or_else(|| Error::type_error(value.to_string(), "t or nil"))
    }
}

/// Helper function for creating Values from Rust literals
pub fn val<T: Into<Value>>(value: T) -> Value {
    value.into()
}

pub fn atom<S: AsRef<str>>(name: S) -> Value {
    Value::Atom(name.as_ref().to_owned())
}

pub fn scalar_var<S: AsRef<str>>(name: S) -> Value {
    Value::ScalarVar(name.as_ref().to_owned())
}

pub fn list_var<S: AsRef<str>>(name: S) -> Value {
    Value::ListVar(name.as_ref().to_owned())
}

pub fn dict_var<S: AsRef<str>>(name: S) -> Value {
    Value::DictVar(name.as_ref().to_owned())
}

/// Unevaluated form, e.g. `expr(vec![atom("+"), val(1), val(2)])`
pub fn expr(items: Vec<Value>) -> Value {
    Value::Expression(items)
}

/// Dictionary literal from key/value pairs
pub fn dict<K: Into<Value>, V: Into<Value>>(pairs: Vec<(K, V)>) -> Value {
    Value::Dictionary(
        pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect(),
    )
}
