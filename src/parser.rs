//! Incremental parser turning source text into a tree of values.
//!
//! Input may arrive in chunks: [`parse`] returns a [`ParseState`] whenever the text ends
//! inside a string, a block comment, an open group or after a quote marker, and the next
//! call picks up exactly where the previous one stopped. While something is open, chunks
//! are concatenated verbatim, so a caller feeding lines must keep their newlines. At top
//! level the end of a chunk also ends the current token or line comment.
//!
//! ```text
//! (+ 1 2)                ; expression, evaluated as a call
//! '(1 2 (3 4))           ; list literal, nested groups are lists too
//! `((name "ann") (age 7)) ; dictionary literal made of (key value) pairs
//! #| block #| comments |# nest |#
//! ```

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_till, take_while1},
    character::complete::{char, digit0, digit1, one_of},
    combinator::{map, opt, value},
};
use tracing::trace;

use crate::ast::{Shape, Value};
use crate::{Error, MAX_PARSE_DEPTH, ParseError, ParseErrorKind};

/// Parser configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseConfig {
    /// Record comments in [`ParseTree::comments`] instead of discarding them
    pub keep_comments: bool,
    /// Maximum group nesting before the parser gives up
    pub max_depth: usize,
}

impl Default for ParseConfig {
    fn default() -> Self {
        ParseConfig {
            keep_comments: false,
            max_depth: MAX_PARSE_DEPTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    /// Line the comment starts on
    pub line: usize,
    pub text: String,
}

/// Result of parsing: the top-level forms in source order, plus retained comments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParseTree {
    pub forms: Vec<Value>,
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupKind {
    /// Plain `( ... )` in code position
    Expression,
    /// `'( ... )`, or any plain group nested inside a literal
    ListLiteral,
    /// `` `( ... ) ``
    DictLiteral,
    /// A `(key value)` entry of a dictionary literal
    DictPair,
}

#[derive(Debug, Clone)]
struct OpenGroup {
    kind: GroupKind,
    children: Vec<Value>,
    line: usize,
    column: usize,
}

#[derive(Debug, Clone)]
enum Mode {
    Code,
    String {
        buffer: String,
        escape_pending: bool,
        line: usize,
        column: usize,
    },
    BlockComment {
        depth: usize,
        text: String,
        line: usize,
    },
    LineComment {
        text: String,
        line: usize,
    },
}

/// Everything the parser needs to continue with the next chunk of input.
#[derive(Debug, Clone)]
pub struct ParseState {
    tree: ParseTree,
    groups: Vec<OpenGroup>,
    mode: Mode,
    /// Pending `'` or backtick waiting for its `(`
    marker: Option<(char, usize, usize)>,
    /// Tail of the previous chunk that may continue into the next one
    carry: String,
    line: usize,
    column: usize,
}

impl Default for ParseState {
    fn default() -> Self {
        ParseState {
            tree: ParseTree::default(),
            groups: Vec::new(),
            mode: Mode::Code,
            marker: None,
            carry: String::new(),
            line: 1,
            column: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token<'a> {
    Whitespace,
    BlockCommentOpen,
    BlockCommentClose,
    LineComment(&'a str),
    Open,
    Close,
    Marker(char),
    StringStart,
    Number(&'a str),
    Variable(char, &'a str),
    Atom(&'a str),
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '"' | ';')
}

fn is_atom_char(c: char) -> bool {
    !is_delimiter(c)
}

fn is_name_char(c: char) -> bool {
    !is_delimiter(c) && !matches!(c, '$' | '@' | '%')
}

/// Optional minus, digits and an optional fraction, yielding the whole matched text.
fn number_literal(input: &str) -> IResult<&str, &str> {
    let parsed: IResult<&str, _> =
        (opt(char('-')), digit1, opt((char('.'), digit0))).parse(input);
    let (remaining, _) = parsed?;
    Ok((remaining, &input[..input.len() - remaining.len()]))
}

/// Lex one token from the start of `input`.
fn lex_token(input: &str) -> IResult<&str, Token<'_>> {
    alt((
        value(Token::Whitespace, take_while1(char::is_whitespace)),
        value(Token::BlockCommentOpen, tag("#|")),
        value(Token::BlockCommentClose, tag("|#")),
        map(
            (char(';'), take_till(|c: char| c == '\n')),
            |(_, body)| Token::LineComment(body),
        ),
        value(Token::Open, char('(')),
        value(Token::Close, char(')')),
        map(one_of("'`"), Token::Marker),
        value(Token::StringStart, char('"')),
        map(number_literal, Token::Number),
        map(
            (one_of("$@%"), take_while1(is_name_char)),
            |(sigil, name)| Token::Variable(sigil, name),
        ),
        map(take_while1(is_atom_char), Token::Atom),
    ))
    .parse(input)
}

/// The full line of `input` around byte `offset`, for error context.
fn line_context(input: &str, offset: usize) -> &str {
    let start = input[..offset].rfind('\n').map_or(0, |i| i + 1);
    let end = input[offset..].find('\n').map_or(input.len(), |i| offset + i);
    &input[start..end]
}

impl ParseState {
    /// Number of groups currently open.
    pub fn depth(&self) -> usize {
        self.groups.len()
    }

    pub fn in_string(&self) -> bool {
        matches!(self.mode, Mode::String { .. })
    }

    /// Nesting depth of the block comment being read, 0 outside comments.
    pub fn comment_depth(&self) -> usize {
        match self.mode {
            Mode::BlockComment { depth, .. } => depth,
            _ => 0,
        }
    }

    /// Forms completed so far.
    pub fn forms(&self) -> &[Value] {
        &self.tree.forms
    }

    fn is_open(&self) -> bool {
        !self.groups.is_empty() || self.marker.is_some()
    }

    fn is_complete(&self) -> bool {
        !self.is_open() && matches!(self.mode, Mode::Code) && self.carry.is_empty()
    }

    /// Declare the end of input. Held-back tokens are completed; a group, string,
    /// comment or quote marker still open is an [`ParseErrorKind::Incomplete`] error.
    pub fn finish(mut self, config: &ParseConfig) -> Result<ParseTree, Error> {
        let carry = std::mem::take(&mut self.carry);
        self.feed(&carry, config, true)?;
        self.into_tree()
    }

    fn into_tree(self) -> Result<ParseTree, Error> {
        if self.is_complete() {
            Ok(self.tree)
        } else {
            Err(self.incomplete_error().into())
        }
    }

    /// Describe why the input cannot end here.
    pub fn incomplete_error(&self) -> ParseError {
        let error = |message: String| {
            ParseError::new(ParseErrorKind::Incomplete, message, self.line, self.column)
        };
        match &self.mode {
            Mode::String { line, column, .. } => error(format!(
                "unterminated string starting at {line}:{column}"
            )),
            Mode::BlockComment { line, depth, .. } => error(format!(
                "unterminated block comment starting on line {line} (depth {depth})"
            )),
            Mode::Code | Mode::LineComment { .. } => {
                if let Some(group) = self.groups.last() {
                    error(format!(
                        "unclosed '(' opened at {}:{}",
                        group.line, group.column
                    ))
                } else if let Some((marker, line, column)) = self.marker {
                    error(format!("quote marker {marker} at {line}:{column} has no group"))
                } else {
                    error("unexpected end of input".to_owned())
                }
            }
        }
    }

    fn bump(&mut self, c: char) {
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
    }

    fn advance(&mut self, consumed: &str) {
        for c in consumed.chars() {
            self.bump(c);
        }
    }

    fn error_at(
        &self,
        input: &str,
        rest: &str,
        kind: ParseErrorKind,
        message: impl Into<String>,
    ) -> ParseError {
        let offset = input.len() - rest.len();
        ParseError::new(kind, message, self.line, self.column)
            .with_context(line_context(input, offset))
    }

    fn record_comment(&mut self, config: &ParseConfig, line: usize, text: String) {
        if config.keep_comments {
            self.tree.comments.push(Comment { line, text });
        }
    }

    /// Consume `input`. With `at_end` set no more input follows, so nothing is held back.
    fn feed(&mut self, input: &str, config: &ParseConfig, at_end: bool) -> Result<(), ParseError> {
        let mut rest = input;
        while !rest.is_empty() {
            rest = match std::mem::replace(&mut self.mode, Mode::Code) {
                Mode::Code => self.step_code(input, rest, config, at_end)?,
                Mode::String {
                    buffer,
                    escape_pending,
                    line,
                    column,
                } => self.step_string(input, rest, buffer, escape_pending, (line, column))?,
                Mode::BlockComment { depth, text, line } => {
                    self.step_block_comment(rest, config, depth, text, line)
                }
                Mode::LineComment { mut text, line } => match rest.find('\n') {
                    Some(end) => {
                        text.push_str(&rest[..end]);
                        self.advance(&rest[..end]);
                        self.record_comment(config, line, text);
                        &rest[end..]
                    }
                    None => {
                        text.push_str(rest);
                        self.advance(rest);
                        self.mode = Mode::LineComment { text, line };
                        ""
                    }
                },
            };
        }
        Ok(())
    }

    fn step_code<'a>(
        &mut self,
        input: &str,
        rest: &'a str,
        config: &ParseConfig,
        at_end: bool,
    ) -> Result<&'a str, ParseError> {
        let Ok((remaining, token)) = lex_token(rest) else {
            return Err(self.error_at(
                input,
                rest,
                ParseErrorKind::InvalidSyntax,
                "unrecognized input",
            ));
        };
        let text = &rest[..rest.len() - remaining.len()];

        if let Some((marker, ..)) = self.marker
            && token != Token::Open
        {
            return Err(self
                .error_at(
                    input,
                    rest,
                    ParseErrorKind::InvalidSyntax,
                    format!("quote marker {marker} must be immediately followed by '('"),
                )
                .with_found(text));
        }

        // Inside a group a token touching the end of the chunk may continue in the next
        // one. At top level the end of a chunk always ends the token.
        if remaining.is_empty()
            && !at_end
            && self.is_open()
            && matches!(
                token,
                Token::Number(_) | Token::Variable(..) | Token::Atom(_)
            )
        {
            self.carry.push_str(text);
            return Ok(remaining);
        }

        match token {
            Token::Whitespace => {}
            Token::BlockCommentOpen => {
                self.mode = Mode::BlockComment {
                    depth: 1,
                    text: String::new(),
                    line: self.line,
                };
            }
            Token::BlockCommentClose => {
                return Err(self
                    .error_at(
                        input,
                        rest,
                        ParseErrorKind::UnexpectedCommentClose,
                        "'|#' outside of a block comment",
                    )
                    .with_found(text));
            }
            Token::LineComment(body) => {
                if remaining.is_empty() && self.is_open() {
                    self.mode = Mode::LineComment {
                        text: body.to_owned(),
                        line: self.line,
                    };
                } else {
                    self.record_comment(config, self.line, body.to_owned());
                }
            }
            Token::Open => self.open_group(input, rest, config)?,
            Token::Close => self.close_group(input, rest)?,
            Token::Marker(marker) => self.marker = Some((marker, self.line, self.column)),
            Token::StringStart => {
                self.mode = Mode::String {
                    buffer: String::new(),
                    escape_pending: false,
                    line: self.line,
                    column: self.column,
                };
            }
            Token::Number(digits) => {
                let number = self.number(input, rest, digits, remaining)?;
                self.push_value(input, rest, number)?;
            }
            Token::Variable(sigil, name) => {
                let shape = Shape::from_sigil(sigil).unwrap_or(Shape::Scalar);
                self.push_value(input, rest, Value::variable_ref(shape, name))?;
            }
            Token::Atom(name) => self.push_value(input, rest, Value::Atom(name.to_owned()))?,
        }

        self.advance(text);
        Ok(remaining)
    }

    fn number(
        &self,
        input: &str,
        rest: &str,
        digits: &str,
        remaining: &str,
    ) -> Result<Value, ParseError> {
        if let Some(next) = remaining.chars().next()
            && !is_delimiter(next)
        {
            let tail_len = remaining.find(is_delimiter).unwrap_or(remaining.len());
            let found = format!("{digits}{}", &remaining[..tail_len]);
            return Err(self
                .error_at(
                    input,
                    rest,
                    ParseErrorKind::MalformedNumber,
                    format!("malformed number '{found}'"),
                )
                .with_found(found));
        }

        let parsed = if digits.contains('.') {
            digits.parse::<f64>().ok().map(Value::Float)
        } else {
            digits.parse::<i64>().ok().map(Value::Integer)
        };
        parsed.ok_or_else(|| {
            self.error_at(
                input,
                rest,
                ParseErrorKind::MalformedNumber,
                format!("number '{digits}' is out of range"),
            )
            .with_found(digits)
        })
    }

    fn step_string<'a>(
        &mut self,
        input: &str,
        rest: &'a str,
        mut buffer: String,
        mut escape_pending: bool,
        (line, column): (usize, usize),
    ) -> Result<&'a str, ParseError> {
        for (i, c) in rest.char_indices() {
            if escape_pending {
                let escaped = match c {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '\\' => '\\',
                    '"' => '"',
                    other => {
                        let mut err = self
                            .error_at(
                                input,
                                &rest[i..],
                                ParseErrorKind::MalformedEscape,
                                format!("unsupported escape sequence '\\{other}'"),
                            )
                            .with_found(format!("\\{other}"));
                        // Point at the backslash
                        err.column = err.column.saturating_sub(1);
                        return Err(err);
                    }
                };
                buffer.push(escaped);
                escape_pending = false;
            } else if c == '\\' {
                escape_pending = true;
            } else if c == '"' {
                self.bump(c);
                self.push_value(input, rest, Value::String(buffer))?;
                return Ok(&rest[i + c.len_utf8()..]);
            } else {
                buffer.push(c);
            }
            self.bump(c);
        }

        self.mode = Mode::String {
            buffer,
            escape_pending,
            line,
            column,
        };
        Ok("")
    }

    fn step_block_comment<'a>(
        &mut self,
        rest: &'a str,
        config: &ParseConfig,
        mut depth: usize,
        mut text: String,
        line: usize,
    ) -> &'a str {
        let mut chars = rest.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            match (c, chars.peek().map(|&(_, next)| next)) {
                ('#', Some('|')) => {
                    chars.next();
                    depth += 1;
                    text.push_str("#|");
                    self.advance("#|");
                }
                ('|', Some('#')) => {
                    chars.next();
                    depth -= 1;
                    self.advance("|#");
                    if depth == 0 {
                        self.record_comment(config, line, text);
                        return &rest[i + 2..];
                    }
                    text.push_str("|#");
                }
                // A lone delimiter half at the end of the chunk waits for the next one
                ('#' | '|', None) => {
                    self.carry.push(c);
                    break;
                }
                _ => {
                    text.push(c);
                    self.bump(c);
                }
            }
        }

        self.mode = Mode::BlockComment { depth, text, line };
        ""
    }

    fn open_group(
        &mut self,
        input: &str,
        rest: &str,
        config: &ParseConfig,
    ) -> Result<(), ParseError> {
        if self.groups.len() >= config.max_depth {
            return Err(self.error_at(
                input,
                rest,
                ParseErrorKind::TooDeeplyNested,
                format!("expression too deeply nested (max depth: {})", config.max_depth),
            ));
        }

        let kind = match (self.marker.take(), self.groups.last().map(|g| g.kind)) {
            (Some(('\'', ..)), _) => GroupKind::ListLiteral,
            (Some(_), _) => GroupKind::DictLiteral,
            (None, Some(GroupKind::DictLiteral)) => GroupKind::DictPair,
            (None, Some(GroupKind::ListLiteral | GroupKind::DictPair)) => GroupKind::ListLiteral,
            (None, Some(GroupKind::Expression) | None) => GroupKind::Expression,
        };

        self.groups.push(OpenGroup {
            kind,
            children: Vec::new(),
            line: self.line,
            column: self.column,
        });
        Ok(())
    }

    fn close_group(&mut self, input: &str, rest: &str) -> Result<(), ParseError> {
        let Some(group) = self.groups.pop() else {
            return Err(self
                .error_at(
                    input,
                    rest,
                    ParseErrorKind::UnbalancedParen,
                    "unexpected ')' with no open group",
                )
                .with_found(")"));
        };

        let value = match group.kind {
            GroupKind::Expression => Value::Expression(group.children),
            GroupKind::ListLiteral => Value::List(group.children),
            GroupKind::DictPair => {
                if group.children.len() != 2 {
                    return Err(self.error_at(
                        input,
                        rest,
                        ParseErrorKind::InvalidSyntax,
                        format!(
                            "dictionary entry must be a (key value) pair, found {} elements",
                            group.children.len()
                        ),
                    ));
                }
                // Entries go straight to the enclosing dictionary literal
                if let Some(parent) = self.groups.last_mut() {
                    parent.children.push(Value::List(group.children));
                }
                return Ok(());
            }
            GroupKind::DictLiteral => Value::Dictionary(
                group
                    .children
                    .into_iter()
                    .filter_map(|entry| match entry {
                        Value::List(pair) => <[Value; 2]>::try_from(pair).ok(),
                        _ => None,
                    })
                    .map(|[key, value]| (key, value))
                    .collect(),
            ),
        };

        self.push_value(input, rest, value)
    }

    fn push_value(&mut self, input: &str, rest: &str, value: Value) -> Result<(), ParseError> {
        match self.groups.last_mut() {
            None => {
                self.tree.forms.push(value);
                Ok(())
            }
            Some(group) if group.kind == GroupKind::DictLiteral => Err(self
                .error_at(
                    input,
                    rest,
                    ParseErrorKind::InvalidSyntax,
                    "dictionary literal entries must be (key value) pairs",
                )
                .with_found(value.to_string())),
            Some(group) => {
                group.children.push(value);
                Ok(())
            }
        }
    }
}

/// Parse a chunk of source text, optionally continuing from a previous state.
///
/// Returns the tree of forms completed so far together with `Some(state)` when the text
/// ends inside an unfinished construct. Pass that state back with the next chunk; the
/// final call returns every form of the whole input.
pub fn parse(
    text: &str,
    resume: Option<ParseState>,
) -> Result<(ParseTree, Option<ParseState>), Error> {
    parse_with_config(text, resume, &ParseConfig::default())
}

pub fn parse_with_config(
    text: &str,
    resume: Option<ParseState>,
    config: &ParseConfig,
) -> Result<(ParseTree, Option<ParseState>), Error> {
    let mut state = resume.unwrap_or_default();
    let input = std::mem::take(&mut state.carry) + text;
    state.feed(&input, config, false)?;

    if state.is_complete() {
        Ok((state.tree, None))
    } else {
        trace!(
            depth = state.depth(),
            in_string = state.in_string(),
            comment_depth = state.comment_depth(),
            "parser suspended on incomplete input"
        );
        Ok((state.tree.clone(), Some(state)))
    }
}

/// Parse a complete program. Input ending inside a construct is an error.
pub fn parse_program(text: &str) -> Result<Vec<Value>, Error> {
    parse_program_with_config(text, &ParseConfig::default()).map(|tree| tree.forms)
}

pub fn parse_program_with_config(text: &str, config: &ParseConfig) -> Result<ParseTree, Error> {
    let mut state = ParseState::default();
    state.feed(text, config, true)?;
    state.into_tree()
}
