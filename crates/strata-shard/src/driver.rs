//! Driver facade: connections, cursors, prepared statements and the scheme
//! registry.
//!
//! [`ShardConnection`] presents the ordinary driver contract over one engine
//! connection while routing time-partitioned tables through the
//! [`Rewriter`]. [`PlainConnection`] is the same contract without routing.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use strata_types::Value;
use tracing::{debug, instrument, warn};

use crate::catalog::{ShardCatalog, ShardStore, meta_schema};
use crate::engine::{Engine, ResultSet, SqliteEngine};
use crate::error::{DriverError, DriverResult, ShardError};
use crate::params::Params;
use crate::rewriter::{PhysicalStatement, Rewrite, Rewriter, StatementRole, UnresolvedTargetPolicy, bind_batch};
use crate::statement::StatementKind;

/// Scheme of the plain driver.
pub const PLAIN_SCHEME: &str = "sqlite";

/// Scheme of the sharding driver.
pub const SHARD_SCHEME: &str = "sqlite+shard";

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Execution context
// ============================================================================

/// Deadline and cancellation for one call.
///
/// Both are checked before every physical statement.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    deadline: Option<Instant>,
    cancel: Option<Arc<AtomicBool>>,
}

impl ExecContext {
    /// No deadline, never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Cancels the call once `flag` is set.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn check(&self) -> DriverResult<()> {
        if self.cancel.as_ref().is_some_and(|c| c.load(Ordering::Acquire)) {
            return Err(DriverError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(DriverError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Rows changed by caller INSERT/UPDATE/DELETE statements.
    pub affected_rows: u64,
    pub last_insert_id: i64,
}

/// Forward-only cursor over the result sets of a batch.
///
/// There is one result set per caller statement. Sets are fetched one at a
/// time; a fanned-out statement reads as a single concatenated set.
pub struct Rows<'c> {
    engine: &'c dyn Engine,
    ctx: ExecContext,
    pending: VecDeque<Vec<PhysicalStatement>>,
    columns: Vec<String>,
    decl_types: Vec<String>,
    rows: std::vec::IntoIter<Vec<Value>>,
}

impl<'c> Rows<'c> {
    fn open(engine: &'c dyn Engine, ctx: ExecContext, rewrite: Rewrite) -> DriverResult<Self> {
        let mut pending: VecDeque<Vec<PhysicalStatement>> = VecDeque::new();
        for stmt in rewrite.statements {
            match pending.back_mut() {
                Some(group) if group.first().is_some_and(|s| s.origin == stmt.origin) => {
                    group.push(stmt);
                }
                _ => pending.push_back(vec![stmt]),
            }
        }
        let mut rows = Self {
            engine,
            ctx,
            pending,
            columns: Vec::new(),
            decl_types: Vec::new(),
            rows: Vec::new().into_iter(),
        };
        rows.next_result_set()?;
        Ok(rows)
    }

    /// Advances to the next result set. Returns `false` when none is left.
    ///
    /// Unread rows of the current set are discarded.
    pub fn next_result_set(&mut self) -> DriverResult<bool> {
        let Some(group) = self.pending.pop_front() else {
            self.rows = Vec::new().into_iter();
            return Ok(false);
        };
        let mut merged: Option<ResultSet> = None;
        for stmt in group {
            self.ctx.check()?;
            let set = self.engine.query(&stmt.sql, &stmt.params)?;
            match merged.as_mut() {
                Some(merged) => merged.rows.extend(set.rows),
                None => merged = Some(set),
            }
        }
        let set = merged.unwrap_or_default();
        self.columns = set.columns;
        self.decl_types = set.decl_types;
        self.rows = set.rows.into_iter();
        Ok(true)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn decl_types(&self) -> &[String] {
        &self.decl_types
    }

    /// Drains the remaining rows of the current set.
    pub fn collect_set(&mut self) -> ResultSet {
        ResultSet {
            columns: self.columns.clone(),
            decl_types: self.decl_types.clone(),
            rows: self.rows.by_ref().collect(),
        }
    }

    /// Drains every remaining set.
    pub fn collect_all(mut self) -> DriverResult<Vec<ResultSet>> {
        let mut sets = vec![self.collect_set()];
        while self.next_result_set()? {
            sets.push(self.collect_set());
        }
        Ok(sets)
    }
}

impl Iterator for Rows<'_> {
    type Item = Vec<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }
}

impl std::fmt::Debug for Rows<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows")
            .field("columns", &self.columns)
            .field("pending_sets", &self.pending.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Connection contract
// ============================================================================

/// The driver contract shared by plain and sharding connections.
pub trait Connection: Send {
    /// Runs a batch in one transaction.
    fn exec(&self, ctx: &ExecContext, sql: &str, params: &Params) -> DriverResult<ExecResult>;

    /// Runs several batches in one transaction.
    fn exec_all(&self, ctx: &ExecContext, batches: &[(&str, Params)]) -> DriverResult<ExecResult>;

    /// Runs a read-only batch.
    fn query<'c>(&'c self, ctx: &ExecContext, sql: &str, params: &Params) -> DriverResult<Rows<'c>>;

    /// Validates a single statement for repeated execution.
    fn prepare<'c>(&'c self, sql: &str) -> DriverResult<PreparedStatement<'c>>;
}

/// A validated statement bound to its connection.
///
/// Each call binds fresh parameters and routes again, so a prepared INSERT
/// into a sharded table lands in the bucket of each call's values.
pub struct PreparedStatement<'c> {
    conn: &'c dyn Connection,
    sql: String,
    read_only: bool,
}

impl<'c> PreparedStatement<'c> {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn exec(&self, ctx: &ExecContext, params: &Params) -> DriverResult<ExecResult> {
        self.conn.exec(ctx, &self.sql, params)
    }

    pub fn query(&self, ctx: &ExecContext, params: &Params) -> DriverResult<Rows<'c>> {
        self.conn.query(ctx, &self.sql, params)
    }
}

impl std::fmt::Debug for PreparedStatement<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("sql", &self.sql)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Shared execution
// ============================================================================

/// Runs physical statements inside one engine transaction.
///
/// The transaction rolls back on any failure, cancellation included.
fn run_transaction<'a>(
    engine: &dyn Engine,
    ctx: &ExecContext,
    busy_timeout: Duration,
    statements: impl IntoIterator<Item = &'a PhysicalStatement>,
) -> DriverResult<ExecResult> {
    ctx.check()?;
    let busy = ctx.remaining().map_or(busy_timeout, |r| r.min(busy_timeout));
    engine.set_busy_timeout(busy)?;
    engine.begin()?;

    let run = || -> DriverResult<ExecResult> {
        let mut result = ExecResult::default();
        for stmt in statements {
            ctx.check()?;
            let changes = engine.execute(&stmt.sql, &stmt.params)?;
            if stmt.role == StatementRole::Data && stmt.kind.counts_rows() {
                result.affected_rows += changes;
            }
        }
        engine.commit()?;
        result.last_insert_id = engine.last_insert_id();
        Ok(result)
    };

    run().inspect_err(|err| {
        if let Err(rollback) = engine.rollback() {
            warn!(error = %rollback, cause = %err, "rollback failed");
        }
    })
}

fn check_read_only(engine: &dyn Engine, rewrite: &Rewrite) -> DriverResult<()> {
    for stmt in &rewrite.statements {
        if stmt.role != StatementRole::Data || !engine.is_read_only(&stmt.sql)? {
            return Err(DriverError::NotReadOnly(stmt.sql.clone()));
        }
    }
    Ok(())
}

// ============================================================================
// Sharding connection
// ============================================================================

/// Connection that routes sharded tables to their bucket tables.
pub struct ShardConnection {
    engine: Box<dyn Engine>,
    store: ShardStore,
    policy: UnresolvedTargetPolicy,
    busy_timeout: Duration,
}

impl std::fmt::Debug for ShardConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardConnection")
            .field("policy", &self.policy)
            .field("busy_timeout", &self.busy_timeout)
            .finish_non_exhaustive()
    }
}

impl ShardConnection {
    /// Opens a connection with its own catalog, loaded from the database.
    pub fn open(dsn: &Dsn) -> DriverResult<Self> {
        let engine = dsn.open_engine()?;
        if !dsn.read_only {
            for ddl in meta_schema() {
                engine.execute(ddl, &[])?;
            }
        }
        let catalog = ShardCatalog::load(engine.as_ref())?;
        Ok(Self::with_engine(engine, ShardStore::new(catalog), dsn))
    }

    /// Opens a connection sharing `store` with other connections to the
    /// same database.
    pub fn open_shared(dsn: &Dsn, store: ShardStore) -> DriverResult<Self> {
        let engine = dsn.open_engine()?;
        Ok(Self::with_engine(engine, store, dsn))
    }

    fn with_engine(engine: Box<dyn Engine>, store: ShardStore, dsn: &Dsn) -> Self {
        Self {
            engine,
            store,
            policy: dsn.unresolved,
            busy_timeout: dsn.busy_timeout,
        }
    }

    /// Catalog shared by this connection.
    pub fn store(&self) -> &ShardStore {
        &self.store
    }

    pub fn policy(&self) -> UnresolvedTargetPolicy {
        self.policy
    }

    /// Runs `batches` like [`Connection::exec_all`], then `bookkeeping` in
    /// the same transaction.
    ///
    /// Bookkeeping statements bypass the rewriter and are left out of the
    /// result. They must not move the last insert rowid, so they should
    /// target `WITHOUT ROWID` tables or be `UPDATE`s.
    pub fn exec_all_with(
        &self,
        ctx: &ExecContext,
        batches: &[(&str, Params)],
        bookkeeping: &[(&str, Vec<Value>)],
    ) -> DriverResult<ExecResult> {
        let batches: Vec<(&str, &Params)> = batches.iter().map(|(sql, p)| (*sql, p)).collect();
        let extra: Vec<PhysicalStatement> = bookkeeping
            .iter()
            .map(|(sql, params)| PhysicalStatement {
                sql: (*sql).to_string(),
                params: params.clone(),
                role: StatementRole::Meta,
                kind: StatementKind::Other,
                origin: batches.len(),
            })
            .collect();
        self.exec_batches(ctx, &batches, &extra)
    }

    #[instrument(skip_all, fields(batches = batches.len()))]
    fn exec_batches(
        &self,
        ctx: &ExecContext,
        batches: &[(&str, &Params)],
        extra: &[PhysicalStatement],
    ) -> DriverResult<ExecResult> {
        ctx.check()?;
        let mut catalog = self.store.snapshot()?;
        let mut rewrites = Vec::with_capacity(batches.len());
        {
            let mut rewriter = Rewriter::new(&mut catalog, self.policy);
            for (sql, params) in batches {
                rewrites.push(rewriter.rewrite(sql, params)?);
            }
        }
        let statements = rewrites
            .iter()
            .flat_map(|r| r.statements.iter())
            .chain(extra);
        let result = run_transaction(self.engine.as_ref(), ctx, self.busy_timeout, statements)?;
        self.store.publish(catalog)?;
        debug!(
            affected_rows = result.affected_rows,
            last_insert_id = result.last_insert_id,
            "batch committed"
        );
        Ok(result)
    }
}

impl Connection for ShardConnection {
    fn exec(&self, ctx: &ExecContext, sql: &str, params: &Params) -> DriverResult<ExecResult> {
        self.exec_batches(ctx, &[(sql, params)], &[])
    }

    fn exec_all(&self, ctx: &ExecContext, batches: &[(&str, Params)]) -> DriverResult<ExecResult> {
        self.exec_all_with(ctx, batches, &[])
    }

    fn query<'c>(&'c self, ctx: &ExecContext, sql: &str, params: &Params) -> DriverResult<Rows<'c>> {
        ctx.check()?;
        let mut catalog = self.store.snapshot()?;
        let rewrite = Rewriter::new(&mut catalog, self.policy).rewrite(sql, params)?;
        check_read_only(self.engine.as_ref(), &rewrite)?;
        Rows::open(self.engine.as_ref(), ctx.clone(), rewrite)
    }

    fn prepare<'c>(&'c self, sql: &str) -> DriverResult<PreparedStatement<'c>> {
        let mut catalog = self.store.snapshot()?;
        let rewrite = Rewriter::new(&mut catalog, self.policy).inspect(sql)?;
        let data: Vec<&PhysicalStatement> = rewrite.data().collect();
        let has_meta = rewrite.statements.iter().any(|s| s.role == StatementRole::Meta);
        let [stmt] = data.as_slice() else {
            return Err(ShardError::Unpreparable(format!(
                "expected one statement, got {}",
                data.len()
            ))
            .into());
        };
        if has_meta || rewrite.fan_out {
            return Err(ShardError::Unpreparable(
                "statement spans several shard tables or declares shard metadata".to_string(),
            )
            .into());
        }
        // A statement that needs a new bucket cannot be prepared by the engine yet
        let needs_bucket = rewrite.statements.iter().any(|s| s.role == StatementRole::AutoDdl);
        let read_only = !needs_bucket && self.engine.is_read_only(&stmt.sql)?;
        Ok(PreparedStatement {
            conn: self,
            sql: sql.to_string(),
            read_only,
        })
    }
}

// ============================================================================
// Plain connection
// ============================================================================

/// Connection without shard routing. Placeholders still bind uniformly.
pub struct PlainConnection {
    engine: Box<dyn Engine>,
    busy_timeout: Duration,
}

impl std::fmt::Debug for PlainConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainConnection").finish_non_exhaustive()
    }
}

impl PlainConnection {
    pub fn open(dsn: &Dsn) -> DriverResult<Self> {
        Ok(Self {
            engine: dsn.open_engine()?,
            busy_timeout: dsn.busy_timeout,
        })
    }
}

impl Connection for PlainConnection {
    fn exec(&self, ctx: &ExecContext, sql: &str, params: &Params) -> DriverResult<ExecResult> {
        let rewrite = bind_batch(sql, params)?;
        run_transaction(self.engine.as_ref(), ctx, self.busy_timeout, &rewrite.statements)
    }

    fn exec_all(&self, ctx: &ExecContext, batches: &[(&str, Params)]) -> DriverResult<ExecResult> {
        let rewrites = batches
            .iter()
            .map(|(sql, params)| bind_batch(sql, params))
            .collect::<Result<Vec<_>, _>>()?;
        let statements = rewrites.iter().flat_map(|r| r.statements.iter());
        run_transaction(self.engine.as_ref(), ctx, self.busy_timeout, statements)
    }

    fn query<'c>(&'c self, ctx: &ExecContext, sql: &str, params: &Params) -> DriverResult<Rows<'c>> {
        ctx.check()?;
        let rewrite = bind_batch(sql, params)?;
        check_read_only(self.engine.as_ref(), &rewrite)?;
        Rows::open(self.engine.as_ref(), ctx.clone(), rewrite)
    }

    fn prepare<'c>(&'c self, sql: &str) -> DriverResult<PreparedStatement<'c>> {
        let params = Params::new();
        let rewrite = match bind_batch(sql, &params) {
            Ok(rewrite) => rewrite,
            Err(ShardError::MissingParameter(_)) => {
                // Shape only; values arrive at execution
                let mut catalog = ShardCatalog::new();
                Rewriter::new(&mut catalog, UnresolvedTargetPolicy::Baseline).inspect(sql)?
            }
            Err(err) => return Err(err.into()),
        };
        let [stmt] = rewrite.statements.as_slice() else {
            return Err(ShardError::Unpreparable(format!(
                "expected one statement, got {}",
                rewrite.statements.len()
            ))
            .into());
        };
        let read_only = self.engine.is_read_only(&stmt.sql)?;
        Ok(PreparedStatement {
            conn: self,
            sql: sql.to_string(),
            read_only,
        })
    }
}

// ============================================================================
// Data source names
// ============================================================================

/// Parsed `scheme://path[?key=value&...]`.
///
/// Recognized keys: `mode` (`ro`/`rw`), `busy_timeout` (milliseconds) and
/// `unresolved` (`baseline`/`reject`/`fan-out`). The path `:memory:` opens a
/// private in-memory database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsn {
    pub scheme: String,
    pub path: String,
    pub read_only: bool,
    pub busy_timeout: Duration,
    pub unresolved: UnresolvedTargetPolicy,
}

impl Dsn {
    pub fn new(scheme: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            path: path.into(),
            read_only: false,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            unresolved: UnresolvedTargetPolicy::default(),
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn with_unresolved(mut self, policy: UnresolvedTargetPolicy) -> Self {
        self.unresolved = policy;
        self
    }

    fn open_engine(&self) -> DriverResult<Box<dyn Engine>> {
        let engine = if self.path == ":memory:" {
            SqliteEngine::open_in_memory()?
        } else if self.read_only {
            SqliteEngine::open_read_only(&self.path, self.busy_timeout)?
        } else {
            SqliteEngine::open(&self.path, self.busy_timeout)?
        };
        Ok(Box::new(engine))
    }
}

impl FromStr for Dsn {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DriverError::InvalidDsn(s.to_string());
        let (scheme, rest) = s.split_once("://").ok_or_else(invalid)?;
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
        if scheme.is_empty() || path.is_empty() {
            return Err(invalid());
        }

        let mut dsn = Dsn::new(scheme, path);
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(invalid)?;
            match key {
                "mode" => {
                    dsn.read_only = match value {
                        "ro" => true,
                        "rw" => false,
                        _ => return Err(invalid()),
                    }
                }
                "busy_timeout" => {
                    let ms: u64 = value.parse().map_err(|_| invalid())?;
                    dsn.busy_timeout = Duration::from_millis(ms);
                }
                "unresolved" => {
                    dsn.unresolved = match value {
                        "baseline" => UnresolvedTargetPolicy::Baseline,
                        "reject" => UnresolvedTargetPolicy::Reject,
                        "fan-out" => UnresolvedTargetPolicy::FanOut,
                        _ => return Err(invalid()),
                    }
                }
                _ => return Err(invalid()),
            }
        }
        Ok(dsn)
    }
}

impl Display for Dsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = if self.read_only { "ro" } else { "rw" };
        let unresolved = match self.unresolved {
            UnresolvedTargetPolicy::Baseline => "baseline",
            UnresolvedTargetPolicy::Reject => "reject",
            UnresolvedTargetPolicy::FanOut => "fan-out",
        };
        write!(
            f,
            "{}://{}?mode={mode}&busy_timeout={}&unresolved={unresolved}",
            self.scheme,
            self.path,
            self.busy_timeout.as_millis()
        )
    }
}

// ============================================================================
// Registry
// ============================================================================

pub type DriverFactory = Box<dyn Fn(&Dsn) -> DriverResult<Box<dyn Connection>> + Send + Sync>;

/// Scheme to connection-factory map.
#[derive(Default)]
pub struct Drivers {
    factories: BTreeMap<String, DriverFactory>,
}

impl Drivers {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `sqlite` and `sqlite+shard` drivers.
    pub fn with_defaults() -> Self {
        let mut drivers = Self::new();
        drivers.register(PLAIN_SCHEME, |dsn| {
            Ok(Box::new(PlainConnection::open(dsn)?) as Box<dyn Connection>)
        });
        drivers.register(SHARD_SCHEME, |dsn| {
            Ok(Box::new(ShardConnection::open(dsn)?) as Box<dyn Connection>)
        });
        drivers
    }

    /// Adds or replaces the factory of a scheme.
    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&Dsn) -> DriverResult<Box<dyn Connection>> + Send + Sync + 'static,
    {
        self.factories.insert(scheme.to_string(), Box::new(factory));
    }

    pub fn open(&self, dsn: &str) -> DriverResult<Box<dyn Connection>> {
        let dsn: Dsn = dsn.parse()?;
        let factory = self
            .factories
            .get(&dsn.scheme)
            .ok_or_else(|| DriverError::UnknownScheme(dsn.scheme.clone()))?;
        factory(&dsn)
    }

    pub fn schemes(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for Drivers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drivers")
            .field("schemes", &self.schemes())
            .finish()
    }
}
