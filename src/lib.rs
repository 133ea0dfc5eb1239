//! Sigilisp - an embeddable interpreter for a sigil-typed, parenthesized scripting language
//!
//! Programs are sequences of parenthesized forms. Bindings live in one of three value
//! namespaces, chosen by the sigil in front of the name, plus a separate function
//! namespace:
//!
//! ```text
//! (:= $count 3)                  ; scalar
//! (:= @items '(1 2 3))           ; list
//! (:= %ages `((alice 30) (bob 41)))  ; dictionary
//! (fn double ($n) (* $n 2))      ; function
//! (for $i in @items (print (double $i)))
//! ```
//!
//! ## Strict Semantics
//!
//! - Conditions must evaluate to the atoms `t` or `nil` (no truthiness)
//! - Assignment checks the sigil against the native shape of the value
//! - Arithmetic overflow and division by zero are reported as errors
//! - Every callable has a declared arity that is validated before arguments are evaluated
//!
//! Values still move between shapes when a context demands it: a list used as a scalar is
//! its length, a dictionary used as a list is its flattened key/value pairs, and a list
//! used as a dictionary pairs consecutive elements.
//!
//! ## Modules
//!
//! - `parser`: incremental, resumable parsing of source text
//! - `ast`: the runtime value model and context coercion
//! - `scope`: the arena-backed scope chain with four namespaces
//! - `evaluator`: the interpreter, dispatch engine and control forms
//! - `builtinops`: the builtin registry and the dialect tables

use std::fmt;

/// Maximum group nesting accepted by the parser.
pub const MAX_PARSE_DEPTH: usize = 256;

/// Maximum evaluation depth, bounding recursion through nested expressions and calls.
/// The native stack grows on demand, so this is a semantic limit rather than a stack guard.
pub const MAX_EVAL_DEPTH: usize = 2048;

/// Dialect active in a freshly created interpreter.
pub const DEFAULT_DIALECT: &str = "core";

/// Categorizes the different kinds of parsing errors.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ParseErrorKind {
    /// Invalid or unexpected syntax (bad tokens, malformed literals)
    InvalidSyntax,
    /// A closing parenthesis with no open group
    UnbalancedParen,
    /// A backslash escape outside the supported set
    MalformedEscape,
    /// A `|#` outside of any block comment
    UnexpectedCommentClose,
    /// A numeric token that is not a valid number
    MalformedNumber,
    /// Input ended inside a string, comment or group
    Incomplete,
    /// Group nesting exceeded the configured maximum depth
    TooDeeplyNested,
}

/// A structured error providing detailed information about a parsing failure.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// 1-based line of the offending input, counted across resumed chunks
    pub line: usize,
    /// 1-based column of the offending input
    pub column: usize,
    /// The line of input the error occurred on (max 100 chars)
    pub context: Option<String>,
    /// The problematic token or character encountered, if identifiable
    pub found: Option<String>,
}

impl ParseError {
    pub fn new(
        kind: ParseErrorKind,
        message: impl Into<String>,
        line: usize,
        column: usize,
    ) -> Self {
        ParseError {
            kind,
            message: message.into(),
            line,
            column,
            context: None,
            found: None,
        }
    }

    /// Attach the source line the error occurred on.
    pub fn with_context(mut self, context: &str) -> Self {
        const MAX_CONTEXT: usize = 100;

        let mut snippet: String = context.chars().take(MAX_CONTEXT).collect();
        if context.chars().count() > MAX_CONTEXT {
            snippet.push_str("[...]");
        }
        self.context = Some(snippet.replace('\r', ""));
        self
    }

    pub fn with_found(mut self, found: impl Into<String>) -> Self {
        self.found = Some(found.into());
        self
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} at {}:{}", self.message, self.line, self.column)?;
        if let Some(found) = &self.found {
            write!(f, "\nFound: {found}")?;
        }
        if let Some(context) = &self.context {
            write!(f, "\nContext: {context}")?;
        }
        Ok(())
    }
}

/// Error types for the interpreter
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("ParseError: {0}")]
    ParseError(ParseError),

    /// Lookup of a sigil-prefixed variable failed in every visible scope
    #[error("UndefinedVariable: {0}")]
    UndefinedVariable(String),

    #[error("UndefinedFunction: {0}")]
    UndefinedFunction(String),

    #[error(
        "ArityError: {callable} expects {}, got {got}",
        arity_phrase(*.variadic, *.required)
    )]
    ArityError {
        callable: String,
        variadic: bool,
        required: usize,
        got: usize,
    },

    #[error(
        "TypeError: expected {expected}, found {found}{}",
        location_phrase(.callable.as_deref(), *.position)
    )]
    TypeError {
        found: String,
        expected: String,
        /// 1-based argument position, when the error concerns a call argument
        position: Option<usize>,
        callable: Option<String>,
    },

    #[error("EvaluationError: {0}")]
    EvalError(String),
}

fn arity_phrase(variadic: bool, required: usize) -> String {
    let noun = if required == 1 { "argument" } else { "arguments" };
    if variadic {
        format!("at least {required} {noun}")
    } else {
        format!("exactly {required} {noun}")
    }
}

fn location_phrase(callable: Option<&str>, position: Option<usize>) -> String {
    match (callable, position) {
        (Some(name), Some(pos)) => format!(" (argument {pos} of {name})"),
        (Some(name), None) => format!(" (in {name})"),
        (None, Some(pos)) => format!(" (argument {pos})"),
        (None, None) => String::new(),
    }
}

impl Error {
    pub fn type_error(found: impl Into<String>, expected: impl Into<String>) -> Self {
        Error::TypeError {
            found: found.into(),
            expected: expected.into(),
            position: None,
            callable: None,
        }
    }

    pub fn arity_error(
        callable: impl Into<String>,
        variadic: bool,
        required: usize,
        got: usize,
    ) -> Self {
        Error::ArityError {
            callable: callable.into(),
            variadic,
            required,
            got,
        }
    }

    /// Record the 1-based argument position on a type error that has none yet.
    #[must_use]
    pub fn at_position(self, index: usize) -> Self {
        match self {
            Error::TypeError {
                found,
                expected,
                position: None,
                callable,
            } => Error::TypeError {
                found,
                expected,
                position: Some(index),
                callable,
            },
            other => other,
        }
    }

    /// Name the callable on errors raised before the dispatcher knew it.
    #[must_use]
    pub fn in_callable(self, name: &str) -> Self {
        match self {
            Error::TypeError {
                found,
                expected,
                position,
                callable: None,
            } => Error::TypeError {
                found,
                expected,
                position,
                callable: Some(name.to_owned()),
            },
            Error::ArityError {
                callable,
                variadic,
                required,
                got,
            } if callable.is_empty() => Error::ArityError {
                callable: name.to_owned(),
                variadic,
                required,
                got,
            },
            other => other,
        }
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::ParseError(err)
    }
}

pub mod ast;
pub mod builtinops;
pub mod evaluator;
pub mod parser;
pub mod scope;

pub use ast::{Foreign, Number, Shape, Value};
pub use builtinops::{BuiltinOp, Dialect, Features, OpKind, available_dialects, find_dialect};
pub use evaluator::{Arity, Callable, Interpreter, InterpreterConfig, Strategy};
pub use parser::{
    ParseConfig, ParseState, ParseTree, parse, parse_program, parse_program_with_config,
    parse_with_config,
};
pub use scope::{ScopeId, Scopes};

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let cases = vec![
            (
                Error::arity_error("f", false, 2, 1),
                "ArityError: f expects exactly 2 arguments, got 1",
            ),
            (
                Error::arity_error("list", true, 1, 0),
                "ArityError: list expects at least 1 argument, got 0",
            ),
            (
                Error::type_error("integer", "list").at_position(2).in_callable("first"),
                "TypeError: expected list, found integer (argument 2 of first)",
            ),
            (
                Error::type_error("atom", "t or nil"),
                "TypeError: expected t or nil, found atom",
            ),
            (
                Error::UndefinedVariable("$x".into()),
                "UndefinedVariable: $x",
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(err.to_string(), expected);
        }
    }

    #[test]
    fn test_context_helpers_keep_first_value() {
        let err = Error::type_error("string", "integer")
            .at_position(1)
            .at_position(3)
            .in_callable("inner")
            .in_callable("outer");
        match err {
            Error::TypeError {
                position, callable, ..
            } => {
                assert_eq!(position, Some(1));
                assert_eq!(callable.unwrap(), "inner");
            }
            other => panic!("expected TypeError, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::new(ParseErrorKind::UnbalancedParen, "unexpected ')'", 2, 7)
            .with_context("(+ 1 2))")
            .with_found(")");
        assert_eq!(
            Error::from(err).to_string(),
            "ParseError: unexpected ')' at 2:7\nFound: )\nContext: (+ 1 2))"
        );
    }
}
