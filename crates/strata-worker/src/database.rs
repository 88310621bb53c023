//! One hosted database: its connections, sequence and bookkeeping.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, TryLockError};
use std::time::Duration;

use strata_config::{StrataConfig, UnresolvedTarget};
use strata_rbac::PermissionTable;
use strata_shard::{
    Connection, Dsn, ExecContext, ExecResult, Params, ResultSet, SHARD_SCHEME, ShardConnection,
    UnresolvedTargetPolicy,
};
use strata_types::{
    AccountAddress, DatabaseId, Hash, NodeId, PermStat, Peers, Query, ServiceInstance, Timestamp,
};
use tracing::{debug, info, warn};

use crate::acks::{PendingAck, PendingAcks};
use crate::error::{DbmsError, DbmsResult};
use crate::journal::{self, Journal};
use crate::replay::{Rejection, ReplayGuard};
use crate::state::{DatabaseDir, PermissionEntry, Subscriptions};

/// Connection settings shared by every hosted database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpenOptions {
    pub busy_timeout: Duration,
    pub read_pool_size: usize,
    pub unresolved: UnresolvedTargetPolicy,
    pub max_pending_acks: usize,
    /// How long a request stays fresh; replay marks older than this are
    /// dropped.
    pub replay_window: Duration,
}

impl OpenOptions {
    pub fn from_config(config: &StrataConfig) -> Self {
        let unresolved = match config.shard.unresolved_target {
            UnresolvedTarget::Baseline => UnresolvedTargetPolicy::Baseline,
            UnresolvedTarget::Reject => UnresolvedTargetPolicy::Reject,
            UnresolvedTarget::FanOut => UnresolvedTargetPolicy::FanOut,
        };
        Self {
            busy_timeout: config.worker.busy_timeout(),
            read_pool_size: config.worker.read_pool_size.max(1),
            unresolved,
            max_pending_acks: config.worker.max_pending_acks,
            replay_window: config.worker.max_req_time_gap(),
        }
    }
}

// ============================================================================
// Connection pool
// ============================================================================

#[derive(Debug)]
struct Writer {
    conn: ShardConnection,
    /// Log offset of the last committed write.
    sequence: u64,
}

/// Single writer plus a set of read-only connections over the same file.
#[derive(Debug)]
struct Pool {
    writer: Mutex<Writer>,
    readers: Vec<Mutex<ShardConnection>>,
    next_reader: AtomicUsize,
}

impl Pool {
    /// Opens the connections and reads the journal through the writer.
    fn open(dir: &DatabaseDir, options: &OpenOptions) -> DbmsResult<(Self, Journal)> {
        let dsn = Dsn::new(SHARD_SCHEME, dir.data_file().to_string_lossy())
            .with_busy_timeout(options.busy_timeout)
            .with_unresolved(options.unresolved);
        let writer = ShardConnection::open(&dsn)?;
        let journal = journal::load(&writer, &ExecContext::background())?;
        let reader_dsn = dsn.read_only(true);
        let readers = (0..options.read_pool_size)
            .map(|_| ShardConnection::open_shared(&reader_dsn, writer.store().clone()).map(Mutex::new))
            .collect::<Result<Vec<_>, _>>()?;
        let pool = Self {
            writer: Mutex::new(Writer {
                conn: writer,
                sequence: journal.sequence,
            }),
            readers,
            next_reader: AtomicUsize::new(0),
        };
        Ok((pool, journal))
    }

    fn writer(&self) -> DbmsResult<MutexGuard<'_, Writer>> {
        self.writer
            .lock()
            .map_err(|_| DbmsError::lock_poisoned("writer"))
    }

    /// First idle reader, starting round-robin; waits on one if all are busy.
    fn reader(&self) -> DbmsResult<MutexGuard<'_, ShardConnection>> {
        let count = self.readers.len();
        let start = self.next_reader.fetch_add(1, Ordering::Relaxed);
        for i in 0..count {
            match self.readers[(start + i) % count].try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::WouldBlock) => {}
                Err(TryLockError::Poisoned(_)) => return Err(DbmsError::lock_poisoned("reader")),
            }
        }
        self.readers[start % count]
            .lock()
            .map_err(|_| DbmsError::lock_poisoned("reader"))
    }
}

fn params_of(query: &Query) -> Params {
    Params::from(query.args.as_slice())
}

// ============================================================================
// Database
// ============================================================================

/// A deployed database.
///
/// `pool` doubles as the lifecycle guard: requests hold it for read while
/// they run, drop and shutdown take it for write and leave `None` behind.
#[derive(Debug)]
pub(crate) struct Database {
    id: DatabaseId,
    dir: DatabaseDir,
    pool: RwLock<Option<Pool>>,
    instance: Mutex<ServiceInstance>,
    acks: Mutex<PendingAcks>,
    subscriptions: Mutex<Subscriptions>,
    replay: Mutex<ReplayGuard>,
    /// Serializes writers of `permissions.json`.
    permissions: Mutex<()>,
}

impl Database {
    /// Creates the directory and an empty database file for `instance`.
    pub fn create(dir: DatabaseDir, instance: ServiceInstance, options: &OpenOptions) -> DbmsResult<Self> {
        fs::create_dir_all(dir.root())?;
        let (pool, _) = Pool::open(&dir, options)?;
        let replay = ReplayGuard::new(options.replay_window);
        let db = Self::assemble(dir, instance, pool, Subscriptions::default(), replay, options);
        db.persist()?;
        Ok(db)
    }

    /// Reopens a database deployed before a restart.
    ///
    /// Requests signed before this point are refused from now on.
    pub fn open(dir: DatabaseDir, options: &OpenOptions) -> DbmsResult<Self> {
        let instance = dir.load_instance()?;
        let subscriptions = dir.load_subscriptions()?;
        let (pool, journal) = Pool::open(&dir, options)?;
        let replay = ReplayGuard::restore(options.replay_window, journal.marks, Timestamp::now());
        info!(
            database = %instance.database_id,
            sequence = journal.sequence,
            replay_marks = replay.len(),
            "database reopened"
        );
        Ok(Self::assemble(dir, instance, pool, subscriptions, replay, options))
    }

    fn assemble(
        dir: DatabaseDir,
        instance: ServiceInstance,
        pool: Pool,
        subscriptions: Subscriptions,
        replay: ReplayGuard,
        options: &OpenOptions,
    ) -> Self {
        Self {
            id: instance.database_id.clone(),
            dir,
            pool: RwLock::new(Some(pool)),
            instance: Mutex::new(instance),
            acks: Mutex::new(PendingAcks::new(options.max_pending_acks)),
            subscriptions: Mutex::new(subscriptions),
            replay: Mutex::new(replay),
            permissions: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &DatabaseId {
        &self.id
    }

    pub fn instance(&self) -> DbmsResult<ServiceInstance> {
        self.instance
            .lock()
            .map(|i| i.clone())
            .map_err(|_| DbmsError::lock_poisoned("instance"))
    }

    /// Runs `f` while holding the lifecycle read guard.
    fn with_pool<T>(&self, f: impl FnOnce(&Pool) -> DbmsResult<T>) -> DbmsResult<T> {
        let guard = self
            .pool
            .read()
            .map_err(|_| DbmsError::lock_poisoned("lifecycle"))?;
        match guard.as_ref() {
            Some(pool) => f(pool),
            None => Err(DbmsError::NotFound(self.id.clone())),
        }
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Applies genesis statements in one transaction. Does not advance the
    /// sequence.
    pub fn apply_genesis(&self, ctx: &ExecContext, statements: &[String]) -> DbmsResult<()> {
        if statements.is_empty() {
            return Ok(());
        }
        self.with_pool(|pool| {
            let writer = pool.writer()?;
            let batches: Vec<(&str, Params)> = statements
                .iter()
                .map(|sql| (sql.as_str(), Params::new()))
                .collect();
            writer.conn.exec_all(ctx, &batches)?;
            Ok(())
        })
    }

    /// Runs read queries on a pooled reader and returns the last result set.
    pub fn read(&self, ctx: &ExecContext, queries: &[Query]) -> DbmsResult<ResultSet> {
        self.with_pool(|pool| {
            let reader = pool.reader()?;
            let mut last = ResultSet::default();
            for query in queries {
                let sets = reader.query(ctx, &query.pattern, &params_of(query))?.collect_all()?;
                if let Some(set) = sets.into_iter().last() {
                    last = set;
                }
            }
            Ok(last)
        })
    }

    /// Runs write queries in one transaction on the writer. Returns the
    /// execution result and the log offset assigned to it.
    ///
    /// The new sequence and the pending replay marks commit with the queries.
    pub fn write(&self, ctx: &ExecContext, queries: &[Query]) -> DbmsResult<(ExecResult, u64)> {
        self.with_pool(|pool| {
            let mut writer = pool.writer()?;
            let batches: Vec<(&str, Params)> = queries
                .iter()
                .map(|q| (q.pattern.as_str(), params_of(q)))
                .collect();
            let sequence = writer.sequence + 1;
            let result = self.commit_journal(&writer.conn, ctx, &batches, sequence)?;
            writer.sequence = sequence;
            Ok((result, sequence))
        })
    }

    fn commit_journal(
        &self,
        conn: &ShardConnection,
        ctx: &ExecContext,
        batches: &[(&str, Params)],
        sequence: u64,
    ) -> DbmsResult<ExecResult> {
        let (marks, cutoff) = {
            let mut replay = self.replay()?;
            (replay.take_dirty(), replay.cutoff(Timestamp::now()))
        };
        let bookkeeping = journal::record(sequence, &marks, cutoff);
        match conn.exec_all_with(ctx, batches, &bookkeeping) {
            Ok(result) => Ok(result),
            Err(err) => {
                self.replay()?.restore_dirty(&marks);
                Err(err.into())
            }
        }
    }

    fn replay(&self) -> DbmsResult<MutexGuard<'_, ReplayGuard>> {
        self.replay
            .lock()
            .map_err(|_| DbmsError::lock_poisoned("replay"))
    }

    /// Accepts `seq_no` only if it is above the last one seen on the
    /// connection and the request was signed after the database opened.
    pub fn check_replay(
        &self,
        signee: AccountAddress,
        connection_id: u64,
        seq_no: u64,
        timestamp: Timestamp,
    ) -> DbmsResult<()> {
        self.replay()?
            .check(signee, connection_id, seq_no, timestamp, Timestamp::now())
            .map_err(|rejection| match rejection {
                Rejection::Replayed { last } => DbmsError::ReplayedRequest {
                    connection_id,
                    seq_no,
                    last,
                },
                Rejection::BeforeRestart => DbmsError::SignedBeforeRestart {
                    connection_id,
                    seq_no,
                },
            })
    }

    // ------------------------------------------------------------------------
    // Acknowledgements and subscriptions
    // ------------------------------------------------------------------------

    pub fn remember(&self, hash: Hash, pending: PendingAck) -> DbmsResult<()> {
        let mut acks = self
            .acks
            .lock()
            .map_err(|_| DbmsError::lock_poisoned("pending acks"))?;
        if let Some(evicted) = acks.insert(hash, pending) {
            debug!(database = %self.id, response = %evicted, "pending ack evicted");
        }
        Ok(())
    }

    pub fn take_ack(&self, hash: &Hash, log_offset: u64) -> DbmsResult<Option<PendingAck>> {
        let mut acks = self
            .acks
            .lock()
            .map_err(|_| DbmsError::lock_poisoned("pending acks"))?;
        Ok(acks.take(hash, log_offset))
    }

    fn subscriptions(&self) -> DbmsResult<MutexGuard<'_, Subscriptions>> {
        self.subscriptions
            .lock()
            .map_err(|_| DbmsError::lock_poisoned("subscriptions"))
    }

    pub fn subscribe(&self, node: NodeId, start_sequence: u64) -> DbmsResult<()> {
        self.with_pool(|_| {
            let mut subs = self.subscriptions()?;
            subs.insert(node, start_sequence);
            self.dir.save_subscriptions(&subs)
        })
    }

    /// Returns true if a subscription was removed.
    pub fn unsubscribe(&self, node: &NodeId) -> DbmsResult<bool> {
        self.with_pool(|_| {
            let mut subs = self.subscriptions()?;
            if subs.remove(node).is_none() {
                return Ok(false);
            }
            self.dir.save_subscriptions(&subs)?;
            Ok(true)
        })
    }

    pub fn subscribers_for(&self, log_offset: u64) -> DbmsResult<Vec<NodeId>> {
        Ok(self.subscriptions()?.due(log_offset))
    }

    // ------------------------------------------------------------------------
    // Permissions
    // ------------------------------------------------------------------------

    /// Writes the new PermStat of `user` to disk, then into `table`.
    pub fn record_permission(&self, table: &PermissionTable, user: AccountAddress, perm: PermStat) -> DbmsResult<()> {
        self.with_pool(|_| {
            let _writing = self.permissions_lock()?;
            let mut entries = table.snapshot(&self.id)?;
            match entries.iter_mut().find(|(address, _)| *address == user) {
                Some(entry) => entry.1 = perm,
                None => entries.push((user, perm)),
            }
            self.dir.save_permissions(&to_entries(entries))?;
            table.update(&self.id, user, perm)?;
            Ok(())
        })
    }

    /// Writes every entry `table` holds for this database.
    pub fn save_permissions(&self, table: &PermissionTable) -> DbmsResult<()> {
        let _writing = self.permissions_lock()?;
        let entries = table.snapshot(&self.id)?;
        self.dir.save_permissions(&to_entries(entries))
    }

    /// Loads recorded permissions into `table`. Returns false when none were
    /// ever recorded.
    pub fn load_permissions(&self, table: &PermissionTable) -> DbmsResult<bool> {
        let Some(entries) = self.dir.load_permissions()? else {
            return Ok(false);
        };
        for entry in entries {
            table.update(&self.id, entry.user, entry.perm)?;
        }
        Ok(true)
    }

    fn permissions_lock(&self) -> DbmsResult<MutexGuard<'_, ()>> {
        self.permissions
            .lock()
            .map_err(|_| DbmsError::lock_poisoned("permissions"))
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub fn update_peers(&self, peers: Peers) -> DbmsResult<()> {
        self.with_pool(|_| {
            {
                let mut instance = self
                    .instance
                    .lock()
                    .map_err(|_| DbmsError::lock_poisoned("instance"))?;
                instance.peers = peers;
            }
            self.persist()
        })
    }

    fn persist(&self) -> DbmsResult<()> {
        self.dir.save_instance(&self.instance()?)
    }

    /// Waits for in-flight requests, then closes every connection. With
    /// `flush`, replay marks of reads since the last write and the
    /// subscriptions are written first.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self, flush: bool) -> DbmsResult<()> {
        let mut guard = self
            .pool
            .write()
            .map_err(|_| DbmsError::lock_poisoned("lifecycle"))?;
        let Some(pool) = guard.take() else {
            return Ok(());
        };
        if flush {
            {
                let writer = pool.writer()?;
                self.commit_journal(&writer.conn, &ExecContext::background(), &[], writer.sequence)?;
            }
            self.dir.save_subscriptions(&*self.subscriptions()?)?;
        }
        drop(pool);
        debug!(database = %self.id, "database closed");
        Ok(())
    }

    /// Closes the database and deletes its directory.
    ///
    /// The directory first moves into `trash`, which startup never loads, so
    /// a failed removal cannot bring the database back. If the move fails the
    /// database is reopened and keeps serving.
    pub fn destroy(&self, trash: &Path, options: &OpenOptions) -> DbmsResult<()> {
        let mut guard = self
            .pool
            .write()
            .map_err(|_| DbmsError::lock_poisoned("lifecycle"))?;
        let was_open = guard.take().is_some();

        let doomed = trash.join(format!("{}-{}", self.id, Timestamp::now().as_nanos()));
        let moved = fs::create_dir_all(trash).and_then(|()| fs::rename(self.dir.root(), &doomed));
        if let Err(err) = moved {
            if was_open {
                *guard = Some(Pool::open(&self.dir, options)?.0);
            }
            return Err(err.into());
        }
        drop(guard);

        if let Err(err) = fs::remove_dir_all(&doomed) {
            warn!(path = %doomed.display(), error = %err, "dropped database left in trash");
        }
        debug!(database = %self.id, "database destroyed");
        Ok(())
    }
}

fn to_entries(entries: Vec<(AccountAddress, PermStat)>) -> Vec<PermissionEntry> {
    entries
        .into_iter()
        .map(|(user, perm)| PermissionEntry { user, perm })
        .collect()
}
