use crate::Error;
use crate::ast::{Number, Value};
use std::collections::HashMap;
use std::sync::Arc;

// NOTE: This module is internal plumbing for the evaluator.
// It defines the adapter layer that turns strongly-typed Rust
// functions into the erased `OperationFn` used at runtime.
//
// Hosts interact with it through the registration methods on
// `Interpreter`; the builtin library in `builtinops.rs` is wired
// through the same adapters.

/// Canonical erased builtin function type used by the evaluator.
///
/// Builtins receive ownership of their argument vector, enabling
/// implementations that consume or rearrange arguments if desired.
pub type OperationFn = dyn Fn(Vec<Value>) -> Result<Value, Error> + Send + Sync;

// =====================================================================
// Parameter conversion
// =====================================================================

/// Conversion of one resolved argument into a typed parameter.
///
/// Errors produced here are type errors; the adapters tag them with
/// the 1-based argument position before they reach the caller.
pub trait FromParam: Sized {
    fn from_arg(value: Value) -> Result<Self, Error>;
}

impl FromParam for Value {
    fn from_arg(value: Value) -> Result<Self, Error> {
        Ok(value)
    }
}

macro_rules! impl_from_param_via_try_from {
    ($($t:ty),+) => {
        $(
            impl FromParam for $t {
                fn from_arg(value: Value) -> Result<Self, Error> {
                    <$t>::try_from(value)
                }
            }
        )+
    };
}

impl_from_param_via_try_from!(i64, f64, String, bool, Number);

/// An argument read in list context: lists as-is, dictionaries flattened.
#[derive(Debug, Clone, PartialEq)]
pub struct ListArg(pub Vec<Value>);

impl FromParam for ListArg {
    fn from_arg(value: Value) -> Result<Self, Error> {
        match value {
            Value::List(items) => Ok(ListArg(items)),
            other => other.as_list().map(ListArg),
        }
    }
}

/// An argument read in dictionary context: dictionaries as-is, lists paired up.
#[derive(Debug, Clone, PartialEq)]
pub struct DictArg(pub HashMap<Value, Value>);

impl FromParam for DictArg {
    fn from_arg(value: Value) -> Result<Self, Error> {
        match value {
            Value::Dictionary(map) => Ok(DictArg(map)),
            other => other.as_dictionary().map(DictArg),
        }
    }
}

// =====================================================================
// Rest-parameter support for variadic operations
// =====================================================================

/// All remaining arguments, each converted to `T`.
#[derive(Debug, Clone, PartialEq)]
pub struct Rest<T>(pub Vec<T>);

impl<T> Rest<T> {
    pub fn into_inner(self) -> Vec<T> {
        self.0
    }
}

impl<T> IntoIterator for Rest<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Core trait used to construct rest-parameter values from the tail
/// of the argument vector. `offset` is the number of fixed parameters
/// before the tail, used for error positions.
pub trait FromRest: Sized {
    fn from_rest(values: Vec<Value>, offset: usize) -> Result<Self, Error>;
}

impl<T: FromParam> FromRest for Rest<T> {
    fn from_rest(values: Vec<Value>, offset: usize) -> Result<Self, Error> {
        values
            .into_iter()
            .enumerate()
            .map(|(i, value)| T::from_arg(value).map_err(|err| err.at_position(offset + i + 1)))
            .collect::<Result<Vec<_>, _>>()
            .map(Rest)
    }
}

// =====================================================================
// Return-type adaptation for builtin functions
// =====================================================================

/// Internal trait that normalizes builtin return types to the
/// canonical `Result<Value, Error>` expected by the evaluator.
pub trait IntoValueResult {
    fn into_value_result(self) -> Result<Value, Error>;
}

impl<T> IntoValueResult for Result<T, Error>
where
    T: Into<Value>,
{
    fn into_value_result(self) -> Result<Value, Error> {
        self.map(Into::into)
    }
}

/// Trait for converting strongly-typed Rust functions or closures into
/// the erased [`OperationFn`], parameterized by an argument tuple type.
///
/// Arity is validated by the dispatcher before the operation runs; the
/// adapters still refuse a mismatched argument count.
pub trait IntoOperation<Args> {
    /// Number of parameters in the signature
    const ARITY: usize;

    fn into_operation(self) -> Arc<OperationFn>;
}

/// Trait for operations whose last parameter is a [`Rest`] tail.
pub trait IntoVariadicOperation<Args> {
    fn into_variadic_operation(self) -> Arc<OperationFn>;
}

fn take_param<A: FromParam>(
    args: &mut std::vec::IntoIter<Value>,
    position: usize,
) -> Result<A, Error> {
    match args.next() {
        Some(value) => A::from_arg(value).map_err(|err| err.at_position(position)),
        None => Err(Error::arity_error("", false, position, position - 1)),
    }
}

// =====================================================================
// Fixed-arity adapters
// =====================================================================

// 0-arg functions / closures
impl<F, R> IntoOperation<()> for F
where
    F: Fn() -> R + Send + Sync + 'static,
    R: IntoValueResult,
{
    const ARITY: usize = 0;

    fn into_operation(self) -> Arc<OperationFn> {
        Arc::new(move |args: Vec<Value>| {
            if !args.is_empty() {
                return Err(Error::arity_error("", false, 0, args.len()));
            }
            (self)().into_value_result()
        })
    }
}

/// Helper macro to implement `IntoOperation` for functions of various
/// arities. Parameters are converted left to right, so the first
/// failing argument determines the reported position.
macro_rules! impl_into_operation_for_arity {
    ($arity:expr, $( $p:ident : $A:ident = $pos:expr ),+ ) => {
        impl<F, R, $( $A ),+> IntoOperation<( $( $A, )+ )> for F
        where
            F: Fn( $( $A ),+ ) -> R + Send + Sync + 'static,
            $( $A: FromParam, )+
            R: IntoValueResult,
        {
            const ARITY: usize = $arity;

            fn into_operation(self) -> Arc<OperationFn> {
                Arc::new(move |args: Vec<Value>| {
                    if args.len() != $arity {
                        return Err(Error::arity_error("", false, $arity, args.len()));
                    }
                    let mut args = args.into_iter();
                    $( let $p: $A = take_param(&mut args, $pos)?; )+
                    (self)( $( $p ),+ ).into_value_result()
                })
            }
        }
    };
}

impl_into_operation_for_arity!(1, p0: A1 = 1);
impl_into_operation_for_arity!(2, p0: A1 = 1, p1: A2 = 2);
impl_into_operation_for_arity!(3, p0: A1 = 1, p1: A2 = 2, p2: A3 = 3);
impl_into_operation_for_arity!(4, p0: A1 = 1, p1: A2 = 2, p2: A3 = 3, p3: A4 = 4);

// =====================================================================
// Variadic adapters using rest parameters
// =====================================================================

/// Adapter for functions whose whole signature is a rest parameter.
impl<F, I, R> IntoVariadicOperation<(I,)> for F
where
    I: FromRest,
    F: Fn(I) -> R + Send + Sync + 'static,
    R: IntoValueResult,
{
    fn into_variadic_operation(self) -> Arc<OperationFn> {
        Arc::new(move |args: Vec<Value>| (self)(I::from_rest(args, 0)?).into_value_result())
    }
}

/// Helper macro to implement `IntoVariadicOperation` for functions
/// with a fixed prefix of `FromParam` parameters followed by a single
/// rest parameter.
macro_rules! impl_into_variadic_operation_for_prefix_and_rest {
    ($prefix:expr, $( $p:ident : $A:ident = $pos:expr ),+ ) => {
        impl<F, I, R, $( $A ),+> IntoVariadicOperation<( $( $A, )+ I, )> for F
        where
            I: FromRest,
            $( $A: FromParam, )+
            F: Fn( $( $A ),+, I ) -> R + Send + Sync + 'static,
            R: IntoValueResult,
        {
            fn into_variadic_operation(self) -> Arc<OperationFn> {
                Arc::new(move |args: Vec<Value>| {
                    if args.len() < $prefix {
                        return Err(Error::arity_error("", true, $prefix, args.len()));
                    }
                    let mut args = args.into_iter();
                    $( let $p: $A = take_param(&mut args, $pos)?; )+
                    let rest = I::from_rest(args.collect(), $prefix)?;
                    (self)( $( $p ),+, rest ).into_value_result()
                })
            }
        }
    };
}

impl_into_variadic_operation_for_prefix_and_rest!(1, p0: A1 = 1);
impl_into_variadic_operation_for_prefix_and_rest!(2, p0: A1 = 1, p1: A2 = 2);

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::ast::val;

    fn fixed<Args, F: IntoOperation<Args>>(f: F) -> Arc<OperationFn> {
        f.into_operation()
    }

    fn variadic<Args, F: IntoVariadicOperation<Args>>(f: F) -> Arc<OperationFn> {
        f.into_variadic_operation()
    }

    #[test]
    fn test_fixed_arity_conversion() {
        let op = fixed::<(i64, String), _>(|n: i64, s: String| -> Result<String, Error> {
            Ok(s.repeat(usize::try_from(n).unwrap_or(0)))
        });
        assert_eq!(op(vec![val(3), val("ab")]).unwrap(), val("ababab"));

        // wrong type reports the argument position
        match op(vec![val(3), val(4)]).unwrap_err() {
            Error::TypeError { position, expected, .. } => {
                assert_eq!(position, Some(2));
                assert_eq!(expected, "string");
            }
            other => panic!("expected TypeError, got {other:?}"),
        }

        // wrong count is an arity error
        assert!(matches!(
            op(vec![val(3)]).unwrap_err(),
            Error::ArityError { required: 2, got: 1, .. }
        ));
    }

    #[test]
    fn test_collection_parameters() {
        let op = fixed::<(ListArg,), _>(|ListArg(items): ListArg| -> Result<i64, Error> {
            Ok(i64::try_from(items.len()).unwrap_or(i64::MAX))
        });
        assert_eq!(op(vec![val([1, 2, 3])]).unwrap(), val(3));
        assert!(op(vec![val(1)]).is_err());

        let op = fixed::<(DictArg,), _>(|DictArg(map): DictArg| -> Result<i64, Error> {
            Ok(i64::try_from(map.len()).unwrap_or(i64::MAX))
        });
        // lists pair up when a dictionary is expected
        assert_eq!(op(vec![val(["a", "b", "c", "d"])]).unwrap(), val(2));
    }

    #[test]
    fn test_rest_parameters() {
        let weighted_sum = |weight: i64, nums: Rest<i64>| -> Result<i64, Error> {
            Ok(weight * nums.into_iter().sum::<i64>())
        };
        let op = variadic::<(i64, Rest<i64>), _>(weighted_sum);
        assert_eq!(op(vec![val(2), val(1), val(2), val(3)]).unwrap(), val(12));
        assert_eq!(op(vec![val(2)]).unwrap(), val(0));

        match op(vec![val(2), val(1), val("x")]).unwrap_err() {
            Error::TypeError { position, .. } => assert_eq!(position, Some(3)),
            other => panic!("expected TypeError, got {other:?}"),
        }

        let op = variadic::<(Rest<Value>,), _>(|all: Rest<Value>| -> Result<Value, Error> {
            Ok(Value::List(all.into_inner()))
        });
        assert_eq!(op(vec![val(1), val("a")]).unwrap(), val(vec![val(1), val("a")]));
    }
}
