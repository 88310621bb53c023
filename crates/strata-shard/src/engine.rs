//! Storage engine seam and its SQLite implementation.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{OpenFlags, params_from_iter};
use strata_types::Value;

use crate::error::EngineResult;

/// Rows of one statement, with column metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    /// Declared column types, empty for expressions.
    pub decl_types: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// A single non-sharded engine connection.
///
/// Every method runs exactly one statement.
pub trait Engine: Send {
    /// Runs a statement, discarding any rows. Returns the change count.
    fn execute(&self, sql: &str, params: &[Value]) -> EngineResult<u64>;

    fn query(&self, sql: &str, params: &[Value]) -> EngineResult<ResultSet>;

    fn begin(&self) -> EngineResult<()>;

    fn commit(&self) -> EngineResult<()>;

    fn rollback(&self) -> EngineResult<()>;

    fn last_insert_id(&self) -> i64;

    /// Whether the statement leaves the database unchanged.
    fn is_read_only(&self, sql: &str) -> EngineResult<bool>;

    /// Tables and indexes currently in the schema.
    fn table_names(&self) -> EngineResult<Vec<String>>;

    fn set_busy_timeout(&self, timeout: Duration) -> EngineResult<()>;
}

// ============================================================================
// SQLite
// ============================================================================

/// SQLite engine over `rusqlite`, in WAL mode.
pub struct SqliteEngine {
    conn: rusqlite::Connection,
}

impl std::fmt::Debug for SqliteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEngine")
            .field("path", &self.conn.path())
            .finish_non_exhaustive()
    }
}

impl SqliteEngine {
    /// Opens (creating if needed) a read-write database.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> EngineResult<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;
        let conn = rusqlite::Connection::open_with_flags(path, flags)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.busy_timeout(busy_timeout)?;
        Ok(Self { conn })
    }

    /// Opens an existing database for reads only.
    pub fn open_read_only(path: impl AsRef<Path>, busy_timeout: Duration) -> EngineResult<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;
        let conn = rusqlite::Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(busy_timeout)?;
        Ok(Self { conn })
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> EngineResult<Self> {
        Ok(Self {
            conn: rusqlite::Connection::open_in_memory()?,
        })
    }
}

/// Converts a value for binding. Timestamps bind as RFC 3339 text.
pub fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(v) => SqlValue::Integer(*v),
        Value::Real(v) => SqlValue::Real(*v),
        Value::Text(v) => SqlValue::Text(v.clone()),
        Value::Blob(v) => SqlValue::Blob(v.clone()),
        Value::Timestamp(ts) => SqlValue::Text(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
    }
}

fn is_time_type(decl_type: &str) -> bool {
    matches!(
        decl_type.to_ascii_lowercase().as_str(),
        "timestamp" | "datetime" | "date"
    )
}

fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|ts| ts.and_utc())
}

/// Converts a column value. Text in a time-typed column reads as a timestamp
/// when it parses as one.
fn from_sql_value(value: ValueRef<'_>, decl_type: Option<&str>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Integer(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            match decl_type.filter(|t| is_time_type(t)).and_then(|_| parse_time(&text)) {
                Some(ts) => Value::Timestamp(ts),
                None => Value::Text(text),
            }
        }
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    }
}

impl Engine for SqliteEngine {
    fn execute(&self, sql: &str, params: &[Value]) -> EngineResult<u64> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter().map(to_sql_value)))?;
        while rows.next()?.is_some() {}
        Ok(self.conn.changes() as u64)
    }

    fn query(&self, sql: &str, params: &[Value]) -> EngineResult<ResultSet> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let decl_types: Vec<Option<String>> = stmt
            .columns()
            .iter()
            .map(|c| c.decl_type().map(String::from))
            .collect();

        let mut rows = stmt.query(params_from_iter(params.iter().map(to_sql_value)))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for (i, decl) in decl_types.iter().enumerate() {
                values.push(from_sql_value(row.get_ref(i)?, decl.as_deref()));
            }
            out.push(values);
        }

        Ok(ResultSet {
            columns,
            decl_types: decl_types.into_iter().map(Option::unwrap_or_default).collect(),
            rows: out,
        })
    }

    fn begin(&self) -> EngineResult<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&self) -> EngineResult<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&self) -> EngineResult<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn last_insert_id(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    fn is_read_only(&self, sql: &str) -> EngineResult<bool> {
        Ok(self.conn.prepare(sql)?.readonly())
    }

    fn table_names(&self) -> EngineResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn set_busy_timeout(&self, timeout: Duration) -> EngineResult<()> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn engine() -> SqliteEngine {
        let engine = SqliteEngine::open_in_memory().unwrap();
        engine
            .execute("create table t (id integer primary key, name text, at timestamp)", &[])
            .unwrap();
        engine
    }

    #[test]
    fn test_execute_reports_changes() {
        let engine = engine();
        let changed = engine
            .execute(
                "insert into t (name) values (?), (?)",
                &[Value::from("a"), Value::from("b")],
            )
            .unwrap();
        assert_eq!(changed, 2);
        assert_eq!(engine.last_insert_id(), 2);
    }

    #[test]
    fn test_query_reports_metadata() {
        let engine = engine();
        engine
            .execute("insert into t (name) values ('x')", &[])
            .unwrap();
        let set = engine.query("select id, name, 1 + 1 from t", &[]).unwrap();
        assert_eq!(set.columns, vec!["id", "name", "1 + 1"]);
        assert_eq!(set.decl_types, vec!["integer", "text", ""]);
        assert_eq!(set.rows, vec![vec![Value::Integer(1), Value::from("x"), Value::Integer(2)]]);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let engine = engine();
        let ts = Utc.with_ymd_and_hms(2018, 9, 11, 21, 6, 39).unwrap();
        engine
            .execute("insert into t (name, at) values ('x', ?)", &[Value::Timestamp(ts)])
            .unwrap();
        let set = engine.query("select at from t", &[]).unwrap();
        assert_eq!(set.rows[0][0], Value::Timestamp(ts));
    }

    #[test]
    fn test_read_only_detection() {
        let engine = engine();
        assert!(engine.is_read_only("select * from t").unwrap());
        assert!(!engine.is_read_only("delete from t").unwrap());
    }

    #[test]
    fn test_rollback_discards_writes() {
        let engine = engine();
        engine.begin().unwrap();
        engine.execute("insert into t (name) values ('x')", &[]).unwrap();
        engine.rollback().unwrap();
        assert_eq!(engine.query("select * from t", &[]).unwrap().row_count(), 0);
        // Rolling back outside a transaction is a no-op
        engine.rollback().unwrap();
    }

    #[test]
    fn test_table_names() {
        let engine = engine();
        assert_eq!(engine.table_names().unwrap(), vec!["t"]);
    }
}
