//! # strata-shard: time-bucket sharding SQL driver
//!
//! A batch may open with a directive that declares a logical table as
//! time-partitioned:
//!
//! ```text
//! SHARDCONFIG foo time 864000 1536000000
//! create table if not exists foo$SHARD (id integer primary key, name text, time timestamp);
//! create index if not exists fooindex$SHARD on foo$SHARD (time);
//! ```
//!
//! From then on rows inserted into `foo` land in bucket tables named
//! `foo_ts_<bucket start>`, created on first use, while `foo` itself stays an
//! empty baseline table. Reads and writes that pin the shard column with an
//! equality predicate are routed to the matching bucket.
//!
//! # Layout
//!
//! - [`lexer`], [`statement`]: lossless tokens, batch splitting and
//!   statement classes.
//! - [`params`]: uniform binding of positional and named placeholders.
//! - [`config`], [`catalog`]: shard configs, schema templates, known buckets.
//! - [`rewriter`]: the logical-to-physical statement rewrite.
//! - [`engine`]: the storage engine seam and its SQLite implementation.
//! - [`driver`]: connections, cursors, prepared statements, schemes.

pub mod catalog;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod lexer;
pub mod params;
pub mod rewriter;
pub mod statement;

pub use catalog::{ShardCatalog, ShardStore, Template, TemplateKind};
pub use config::{ShardConfig, shard_name};
pub use driver::{
    Connection, Drivers, Dsn, ExecContext, ExecResult, PLAIN_SCHEME, PlainConnection,
    PreparedStatement, Rows, SHARD_SCHEME, ShardConnection,
};
pub use engine::{Engine, ResultSet, SqliteEngine};
pub use error::{DriverError, DriverResult, EngineError, ShardError, ShardResult};
pub use params::Params;
pub use rewriter::{Rewrite, Rewriter, UnresolvedTargetPolicy};
pub use statement::StatementKind;
