//! Normalized parameter binding.
//!
//! Callers may mix positional (`?`, `?NNN`) and named (`:name`, `@name`,
//! `$name`) placeholders in one batch. [`Params`] holds both kinds and
//! [`Binder`] resolves every placeholder of a batch, in order, to a concrete
//! [`Value`], so the rewriter never sees binding styles.

use std::collections::{BTreeSet, HashMap};

use strata_types::{NamedArg, Value};

use crate::error::{ShardError, ShardResult};
use crate::lexer::{Token, TokenKind};

/// Highest `?NNN` index SQLite accepts.
pub const MAX_PARAMETER_INDEX: usize = 32766;

/// Arguments for one call: an ordered positional list plus named values.
///
/// Names are stored without their `:`/`@`/`$` prefix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    positional: Vec<Value>,
    named: HashMap<String, Value>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Positional values only.
    pub fn positional(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            positional: values.into_iter().collect(),
            named: HashMap::new(),
        }
    }

    /// Appends a positional value.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Sets a named value. A leading `:`, `@` or `$` is ignored.
    pub fn bind_named(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.named.insert(strip_prefix(name).to_string(), value.into());
        self
    }

    pub fn positional_values(&self) -> &[Value] {
        &self.positional
    }

    pub fn named_value(&self, name: &str) -> Option<&Value> {
        self.named.get(strip_prefix(name))
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }
}

impl From<&[NamedArg]> for Params {
    fn from(args: &[NamedArg]) -> Self {
        args.iter().fold(Params::new(), |params, arg| {
            if arg.is_positional() {
                params.bind(arg.value.clone())
            } else {
                params.bind_named(&arg.name, arg.value.clone())
            }
        })
    }
}

fn strip_prefix(name: &str) -> &str {
    name.strip_prefix([':', '@', '$']).unwrap_or(name)
}

/// A token with the value bound to it, if it is a placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct Piece {
    pub token: Token,
    pub value: Option<Value>,
}

impl Piece {
    pub fn plain(token: Token) -> Self {
        Self { token, value: None }
    }
}

impl AsRef<Token> for Piece {
    fn as_ref(&self) -> &Token {
        &self.token
    }
}

/// Resolves placeholders across a whole batch.
///
/// - `?` takes the next positional value.
/// - `?NNN` takes positional `NNN` (1-based) and moves the cursor past it.
/// - A named placeholder takes its named value, or else the next positional
///   value. Repeats of one name reuse the first resolution.
#[derive(Debug)]
pub struct Binder<'p> {
    params: &'p Params,
    cursor: usize,
    used: BTreeSet<usize>,
    by_name: HashMap<String, Value>,
    lenient: bool,
}

impl<'p> Binder<'p> {
    pub fn new(params: &'p Params) -> Self {
        Self {
            params,
            cursor: 0,
            used: BTreeSet::new(),
            by_name: HashMap::new(),
            lenient: false,
        }
    }

    /// A binder that fills missing values with `0`, used to inspect the
    /// shape of a statement before any values exist.
    pub fn lenient(params: &'p Params) -> Self {
        Self {
            lenient: true,
            ..Self::new(params)
        }
    }

    /// Binds every placeholder in `tokens`.
    pub fn bind(&mut self, tokens: Vec<Token>) -> ShardResult<Vec<Piece>> {
        tokens
            .into_iter()
            .map(|token| {
                if token.kind == TokenKind::Placeholder {
                    let value = self.resolve(&token.text)?;
                    Ok(Piece {
                        token: Token::new(TokenKind::Placeholder, "?"),
                        value: Some(value),
                    })
                } else {
                    Ok(Piece::plain(token))
                }
            })
            .collect()
    }

    fn resolve(&mut self, placeholder: &str) -> ShardResult<Value> {
        if let Some(ordinal) = placeholder.strip_prefix('?') {
            if ordinal.is_empty() {
                return self.next_positional(placeholder);
            }
            let index = ordinal
                .parse::<usize>()
                .ok()
                .filter(|n| (1..=MAX_PARAMETER_INDEX).contains(n))
                .ok_or_else(|| ShardError::InvalidPlaceholder(placeholder.to_string()))?
                - 1;
            self.cursor = self.cursor.max(index + 1);
            return self.positional_at(index, placeholder);
        }

        let name = strip_prefix(placeholder);
        if let Some(value) = self.by_name.get(name) {
            return Ok(value.clone());
        }
        let value = match self.params.named_value(name) {
            Some(value) => value.clone(),
            None => self.next_positional(placeholder)?,
        };
        self.by_name.insert(name.to_string(), value.clone());
        Ok(value)
    }

    fn next_positional(&mut self, placeholder: &str) -> ShardResult<Value> {
        let index = self.cursor;
        self.cursor = index
            .checked_add(1)
            .filter(|n| *n <= MAX_PARAMETER_INDEX)
            .ok_or_else(|| ShardError::InvalidPlaceholder(placeholder.to_string()))?;
        self.positional_at(index, placeholder)
    }

    fn positional_at(&mut self, index: usize, placeholder: &str) -> ShardResult<Value> {
        match self.params.positional.get(index) {
            Some(value) => {
                self.used.insert(index);
                Ok(value.clone())
            }
            None if self.lenient => Ok(Value::Integer(0)),
            None => Err(ShardError::MissingParameter(if placeholder == "?" {
                format!("?{}", index + 1)
            } else {
                placeholder.to_string()
            })),
        }
    }

    /// Fails if a positional value was supplied but never used.
    pub fn finish(self) -> ShardResult<()> {
        let supplied = self.params.positional.len();
        if self.lenient || self.used.len() == supplied {
            return Ok(());
        }
        Err(ShardError::ParameterCount {
            supplied,
            used: self.used.len(),
        })
    }
}
