//! Shard configuration, bucket math and shard-table naming.

use std::fmt::Display;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use strata_types::Value;

use crate::error::{ShardError, ShardResult};

/// Marker glued to a table or index name in a schema template.
pub const SHARD_TOKEN: &str = "$SHARD";

/// Infix between the logical name and the bucket start.
pub const SHARD_INFIX: &str = "_ts_";

/// Width of the zero-padded bucket start in shard names.
pub const BUCKET_WIDTH: usize = 10;

/// Largest bucket start that fits the fixed width.
pub const MAX_BUCKET_START: i64 = 9_999_999_999;

/// Time-bucket sharding parameters of one logical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub table: String,
    pub shard_column: String,
    pub interval_secs: u64,
    /// Age after which a bucket may be dropped. Zero keeps buckets forever.
    pub retention_secs: u64,
}

impl ShardConfig {
    pub fn new(
        table: impl Into<String>,
        shard_column: impl Into<String>,
        interval_secs: u64,
        retention_secs: u64,
    ) -> ShardResult<Self> {
        let table = table.into();
        if interval_secs == 0 {
            return Err(ShardError::InvalidDirective(format!(
                "shard interval of {table} must be positive"
            )));
        }
        if i64::try_from(interval_secs).is_err() {
            return Err(ShardError::InvalidDirective(format!(
                "shard interval of {table} is too large"
            )));
        }
        Ok(Self {
            table,
            shard_column: shard_column.into(),
            interval_secs,
            retention_secs,
        })
    }

    /// Catalog key of the logical table.
    pub fn key(&self) -> String {
        self.table.to_ascii_lowercase()
    }

    /// Equal parameters, ignoring identifier case.
    pub fn same_parameters(&self, other: &ShardConfig) -> bool {
        self.table.eq_ignore_ascii_case(&other.table)
            && self.shard_column.eq_ignore_ascii_case(&other.shard_column)
            && self.interval_secs == other.interval_secs
            && self.retention_secs == other.retention_secs
    }

    /// Start of the bucket holding `t`: `floor(t / interval) * interval`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use strata_shard::ShardConfig;
    /// let config = ShardConfig::new("foo", "time", 864_000, 0).unwrap();
    /// assert_eq!(config.bucket_start(1_536_699_999).unwrap(), 1_536_192_000);
    /// ```
    pub fn bucket_start(&self, t: i64) -> ShardResult<i64> {
        if t < 0 {
            return Err(ShardError::InvalidTimestamp(format!(
                "{t} is before the Unix epoch"
            )));
        }
        let interval = self.interval_secs as i64;
        let start = t / interval * interval;
        if start > MAX_BUCKET_START {
            return Err(ShardError::InvalidTimestamp(format!(
                "bucket {start} exceeds {BUCKET_WIDTH} digits"
            )));
        }
        Ok(start)
    }

    /// Physical table name of a bucket.
    pub fn shard_table_name(&self, bucket_start: i64) -> String {
        shard_name(&self.table, bucket_start)
    }

    /// Physical table name for a timestamp.
    pub fn resolve(&self, t: i64) -> ShardResult<String> {
        Ok(self.shard_table_name(self.bucket_start(t)?))
    }

    /// Buckets entirely older than `now - retention`.
    pub fn expired_buckets(&self, now: i64, known: impl IntoIterator<Item = i64>) -> Vec<i64> {
        if self.retention_secs == 0 {
            return Vec::new();
        }
        let cutoff = now.saturating_sub(self.retention_secs as i64);
        let interval = self.interval_secs as i64;
        known
            .into_iter()
            .filter(|bucket| bucket.saturating_add(interval) <= cutoff)
            .collect()
    }
}

impl Display for ShardConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({} {} {} {})",
            self.table, self.shard_column, self.interval_secs, self.retention_secs
        )
    }
}

/// `<base>_ts_<bucket_start:010>`.
pub fn shard_name(base: &str, bucket_start: i64) -> String {
    format!("{base}{SHARD_INFIX}{bucket_start:0BUCKET_WIDTH$}")
}

/// Bucket start encoded in `name`, if it is a shard name of `base`.
pub fn parse_shard_name(base: &str, name: &str) -> Option<i64> {
    let prefix_len = base.len() + SHARD_INFIX.len();
    if name.len() != prefix_len + BUCKET_WIDTH || !name.is_char_boundary(base.len()) {
        return None;
    }
    let (head, digits) = name.split_at(prefix_len);
    let (table, infix) = head.split_at(base.len());
    if !table.eq_ignore_ascii_case(base) || !infix.eq_ignore_ascii_case(SHARD_INFIX) {
        return None;
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Strips a trailing [`SHARD_TOKEN`] from a name, case-insensitively.
pub fn strip_shard_token(name: &str) -> Option<&str> {
    let cut = name.len().checked_sub(SHARD_TOKEN.len())?;
    if !name.is_char_boundary(cut) {
        return None;
    }
    let (base, token) = name.split_at(cut);
    token.eq_ignore_ascii_case(SHARD_TOKEN).then_some(base)
}

/// Interprets a shard-column value as Unix seconds.
///
/// Accepted, in order: integers, fractional seconds (floored), numeric text,
/// RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]` and `YYYY-MM-DD` (UTC).
pub fn shard_seconds(value: &Value) -> ShardResult<i64> {
    match value {
        Value::Integer(v) => Ok(*v),
        Value::Real(v) => floor_seconds(*v),
        Value::Timestamp(ts) => Ok(ts.timestamp()),
        Value::Text(text) => parse_time_text(text),
        Value::Null | Value::Blob(_) => Err(ShardError::InvalidTimestamp(format!(
            "{} is not a time value",
            value.type_name()
        ))),
    }
}

fn floor_seconds(v: f64) -> ShardResult<i64> {
    if !v.is_finite() || v < i64::MIN as f64 || v >= i64::MAX as f64 {
        return Err(ShardError::InvalidTimestamp(format!("{v} is out of range")));
    }
    Ok(v.floor() as i64)
}

fn parse_time_text(text: &str) -> ShardResult<i64> {
    let text = text.trim();
    if let Ok(v) = text.parse::<i64>() {
        return Ok(v);
    }
    if let Ok(v) = text.parse::<f64>() {
        return floor_seconds(v);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.timestamp());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(ts.and_utc().timestamp());
        }
    }
    if let Some(ts) = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(ts.and_utc().timestamp());
    }
    Err(ShardError::InvalidTimestamp(format!("cannot parse {text:?}")))
}
