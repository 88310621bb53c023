//! Error types for the sharding driver.

use thiserror::Error;

/// Errors raised while rewriting a batch. None of them reach the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShardError {
    #[error("shard config conflict on table {table}: registered {existing}, requested {requested}")]
    ConfigConflict {
        table: String,
        existing: String,
        requested: String,
    },

    #[error("cannot determine shard bucket for table {table}: {reason}")]
    AmbiguousShardTarget { table: String, reason: String },

    #[error("table {0} has no shard config or schema template")]
    UnknownShardTable(String),

    #[error("invalid SHARDCONFIG directive: {0}")]
    InvalidDirective(String),

    #[error("invalid shard timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("missing value for parameter {0}")]
    MissingParameter(String),

    #[error("invalid placeholder {0}: index must be between 1 and {max}", max = crate::params::MAX_PARAMETER_INDEX)]
    InvalidPlaceholder(String),

    #[error("{supplied} positional parameters supplied but {used} used")]
    ParameterCount { supplied: usize, used: usize },

    #[error("statement cannot be prepared: {0}")]
    Unpreparable(String),
}

impl ShardError {
    pub(crate) fn ambiguous(table: &str, reason: impl Into<String>) -> Self {
        Self::AmbiguousShardTarget {
            table: table.to_string(),
            reason: reason.into(),
        }
    }
}

pub type ShardResult<T> = Result<T, ShardError>;

/// Errors from the storage engine, surfaced verbatim.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors returned by driver connections.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Shard(#[from] ShardError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("statement is not read-only: {0}")]
    NotReadOnly(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("no driver registered for scheme {0:?}")]
    UnknownScheme(String),

    #[error("invalid data source name {0:?}")]
    InvalidDsn(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DriverError {
    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<rusqlite::Error> for DriverError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Engine(EngineError::Sqlite(err))
    }
}

pub type DriverResult<T> = Result<T, DriverError>;
