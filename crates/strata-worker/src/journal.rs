//! Worker bookkeeping stored inside the database file.
//!
//! The write sequence and the replay marks live in `WITHOUT ROWID` tables so
//! they commit in the same transaction as the write that moves them, without
//! disturbing the caller's last insert rowid.

use strata_shard::{Connection, ExecContext, Params, ShardConnection};
use strata_types::{AccountAddress, Timestamp, Value};

use crate::error::{DbmsError, DbmsResult};
use crate::replay::ReplayMark;

const SCHEMA: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS __strata_worker_state (
        key TEXT NOT NULL PRIMARY KEY,
        value INTEGER NOT NULL
    ) WITHOUT ROWID",
    "CREATE TABLE IF NOT EXISTS __strata_worker_replay (
        signee TEXT NOT NULL,
        connection_id INTEGER NOT NULL,
        seq_no INTEGER NOT NULL,
        latest INTEGER NOT NULL,
        PRIMARY KEY (signee, connection_id)
    ) WITHOUT ROWID",
];

const SEQUENCE_KEY: &str = "sequence";

const UPSERT_SEQUENCE: &str =
    "INSERT OR REPLACE INTO __strata_worker_state (key, value) VALUES ('sequence', ?)";

const UPSERT_MARK: &str = "INSERT OR REPLACE INTO __strata_worker_replay \
     (signee, connection_id, seq_no, latest) VALUES (?, ?, ?, ?)";

const PRUNE_MARKS: &str = "DELETE FROM __strata_worker_replay WHERE latest < ?";

// SQLite integers are signed; u64 values are stored bit for bit.
fn to_sql(n: u64) -> Value {
    Value::Integer(n.cast_signed())
}

fn from_sql(value: &Value) -> Option<u64> {
    value.as_i64().map(i64::cast_unsigned)
}

/// State read back when a database is opened.
#[derive(Debug, Default)]
pub(crate) struct Journal {
    pub sequence: u64,
    pub marks: Vec<ReplayMark>,
}

/// Creates the tables if needed and reads them.
pub(crate) fn load(conn: &ShardConnection, ctx: &ExecContext) -> DbmsResult<Journal> {
    for ddl in SCHEMA {
        conn.exec(ctx, ddl, &Params::new())?;
    }

    let mut rows = conn.query(
        ctx,
        "SELECT value FROM __strata_worker_state WHERE key = ?",
        &Params::new().bind(SEQUENCE_KEY),
    )?;
    let sequence = match rows.next() {
        Some(row) => row
            .first()
            .and_then(from_sql)
            .ok_or_else(|| DbmsError::Internal("malformed sequence row".to_string()))?,
        None => 0,
    };
    drop(rows);

    let rows = conn.query(
        ctx,
        "SELECT signee, connection_id, seq_no, latest FROM __strata_worker_replay",
        &Params::new(),
    )?;
    let mut marks = Vec::new();
    for row in rows {
        let mark = match row.as_slice() {
            [signee, connection_id, seq_no, latest] => signee
                .as_str()
                .and_then(|s| s.parse::<AccountAddress>().ok())
                .zip(from_sql(connection_id))
                .zip(from_sql(seq_no))
                .zip(from_sql(latest))
                .map(|(((signee, connection_id), seq_no), latest)| ReplayMark {
                    signee,
                    connection_id,
                    seq_no,
                    latest: Timestamp::from_nanos(latest),
                }),
            _ => None,
        };
        marks.push(mark.ok_or_else(|| DbmsError::Internal("malformed replay mark row".to_string()))?);
    }
    Ok(Journal { sequence, marks })
}

/// Statements recording `sequence` and `marks`, and forgetting marks older
/// than `cutoff`.
pub(crate) fn record(sequence: u64, marks: &[ReplayMark], cutoff: Timestamp) -> Vec<(&'static str, Vec<Value>)> {
    let mut statements = Vec::with_capacity(marks.len() + 2);
    statements.push((UPSERT_SEQUENCE, vec![to_sql(sequence)]));
    statements.push((PRUNE_MARKS, vec![to_sql(cutoff.as_nanos())]));
    for mark in marks {
        statements.push((
            UPSERT_MARK,
            vec![
                Value::Text(mark.signee.to_string()),
                to_sql(mark.connection_id),
                to_sql(mark.seq_no),
                to_sql(mark.latest.as_nanos()),
            ],
        ));
    }
    statements
}
