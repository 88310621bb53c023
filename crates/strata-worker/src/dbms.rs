//! The DBMS service: deployment, signed queries and acknowledgements.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use strata_config::{Paths, StrataConfig, WorkerConfig};
use strata_crypto::{CryptoError, SigningKey, address_of, digest_of, seal, verify_seal};
use strata_rbac::{Operation, PermissionTable, QueryGate};
use strata_shard::{ExecContext, ResultSet};
use strata_types::{
    Ack, AckResponse, AccountAddress, DatabaseId, GenesisBlock, NodeId, PermStat, PermissionUpdate,
    PublicKey, QueryType, Request, Response, ResponseHeader, ResponsePayload, ResponseRow,
    ServiceInstance, SignedResponseHeader, Timestamp, UpdateService, UpdateServiceResponse,
    UpdateType,
};
use tracing::{debug, info, instrument, warn};

use crate::acks::PendingAck;
use crate::collab::{NodeDirectory, TxNotifier};
use crate::database::{Database, OpenOptions};
use crate::error::{DbmsError, DbmsResult};
use crate::state::{DatabaseDir, TRASH_DIR};

/// Hosts databases on one worker node.
///
/// Every public method is safe to call from many threads. Writes to one
/// database are serialized, reads run on a pool of connections.
pub struct Dbms {
    config: WorkerConfig,
    options: OpenOptions,
    node_id: NodeId,
    key: SigningKey,
    producers: Vec<AccountAddress>,
    databases: RwLock<HashMap<DatabaseId, Arc<Database>>>,
    /// IDs with a `CreateDb` in progress.
    creating: Mutex<HashSet<DatabaseId>>,
    gate: QueryGate,
    directory: Arc<dyn NodeDirectory>,
    notifier: Arc<dyn TxNotifier>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Dbms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dbms")
            .field("node_id", &self.node_id)
            .field("root_dir", &self.config.root_dir)
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

impl Dbms {
    /// Creates the service. Nothing is opened until [`Dbms::init`].
    pub fn new(
        config: &StrataConfig,
        key: SigningKey,
        directory: Arc<dyn NodeDirectory>,
        notifier: Arc<dyn TxNotifier>,
    ) -> DbmsResult<Self> {
        config.validate()?;
        let producers = config.producers.parse()?;
        Ok(Self {
            config: config.worker.clone(),
            options: OpenOptions::from_config(config),
            node_id: config.worker.node_id(),
            key,
            producers,
            databases: RwLock::new(HashMap::new()),
            creating: Mutex::new(HashSet::new()),
            gate: QueryGate::new(Arc::new(PermissionTable::new())),
            directory,
            notifier,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Key every response is signed with.
    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    pub fn permissions(&self) -> &Arc<PermissionTable> {
        self.gate.table()
    }

    /// IDs of every deployed database, sorted.
    pub fn databases(&self) -> DbmsResult<Vec<DatabaseId>> {
        let databases = self
            .databases
            .read()
            .map_err(|_| DbmsError::lock_poisoned("database map"))?;
        let mut ids: Vec<DatabaseId> = databases.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> DbmsResult<()> {
        if self.is_shut_down() {
            return Err(DbmsError::Shutdown);
        }
        Ok(())
    }

    fn database(&self, id: &DatabaseId) -> DbmsResult<Arc<Database>> {
        let databases = self
            .databases
            .read()
            .map_err(|_| DbmsError::lock_poisoned("database map"))?;
        databases
            .get(id)
            .cloned()
            .ok_or_else(|| DbmsError::NotFound(id.clone()))
    }

    fn check_freshness(&self, timestamp: Timestamp) -> DbmsResult<()> {
        let skew = Timestamp::now().abs_diff(timestamp);
        if skew > self.config.max_req_time_gap() {
            return Err(DbmsError::StaleRequest {
                skew_ms: skew.as_millis(),
            });
        }
        Ok(())
    }

    fn context(&self) -> ExecContext {
        ExecContext::background().with_timeout(self.config.query_timeout())
    }

    fn trash(&self) -> PathBuf {
        self.config.root_dir.join(TRASH_DIR)
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Reopens every database persisted under the root directory. Returns
    /// the number of databases loaded.
    #[instrument(skip_all, fields(root = %self.config.root_dir.display()))]
    pub fn init(&self) -> DbmsResult<usize> {
        self.ensure_running()?;
        fs::create_dir_all(&self.config.root_dir)?;
        let trash = self.trash();
        if trash.exists() {
            if let Err(err) = fs::remove_dir_all(&trash) {
                warn!(path = %trash.display(), error = %err, "failed to empty trash");
            }
        }

        let mut loaded = Vec::new();
        for entry in fs::read_dir(&self.config.root_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = DatabaseDir::new(entry.path());
            if !dir.is_deployed() {
                debug!(path = %entry.path().display(), "skipping directory without instance");
                continue;
            }
            loaded.push(Database::open(dir, &self.options)?);
        }

        let count = loaded.len();
        let mut databases = self
            .databases
            .write()
            .map_err(|_| DbmsError::lock_poisoned("database map"))?;
        for db in loaded {
            self.restore_permissions(&db)?;
            databases.insert(db.id().clone(), Arc::new(db));
        }
        info!(databases = count, "dbms initialized");
        Ok(count)
    }

    /// Recorded permissions win; a database that never recorded any falls
    /// back to its genesis grants.
    fn restore_permissions(&self, db: &Database) -> DbmsResult<()> {
        let table = self.gate.table();
        if db.load_permissions(table)? {
            return Ok(());
        }
        if let Some(genesis) = &db.instance()?.genesis {
            grant_genesis(table, db.id(), genesis)?;
        }
        Ok(())
    }

    // ========================================================================
    // Deployment
    // ========================================================================

    /// Applies a signed deployment operation from a block producer.
    #[instrument(skip_all, fields(
        database = %request.header.header.instance.database_id,
        op = %request.header.header.op,
    ))]
    pub fn deploy(&self, request: UpdateService) -> DbmsResult<UpdateServiceResponse> {
        self.ensure_running()?;
        let signed = request.header;
        verify_seal(&signed.header, &signed.signature)?;

        let signer = address_of(&signed.signature.signee);
        if !self.producers.contains(&signer) {
            warn!(signer = %signer, "deployment not signed by a block producer");
            return Err(DbmsError::PermissionDeny);
        }

        let op = signed.header.op;
        let instance = signed.header.instance;
        let database_id = instance.database_id.clone();
        match op {
            UpdateType::CreateDb => self.create_database(instance)?,
            UpdateType::UpdateDb => self.database(&database_id)?.update_peers(instance.peers)?,
            UpdateType::DropDb => self.drop_database(&database_id)?,
        }
        info!("deployment applied");
        Ok(UpdateServiceResponse { database_id, op })
    }

    fn create_database(&self, instance: ServiceInstance) -> DbmsResult<()> {
        let id = instance.database_id.clone();
        if !id.is_path_safe() {
            return Err(DbmsError::InvalidDeployment(format!(
                "database id {id:?} is not a valid directory name"
            )));
        }
        if let Some(genesis) = &instance.genesis {
            if digest_of(&genesis.header)? != genesis.hash {
                return Err(DbmsError::InvalidDeployment(
                    "genesis block hash does not match its header".to_string(),
                ));
            }
        }

        let dir = DatabaseDir::new(Paths::database_dir(&self.config.root_dir, id.as_str()));
        let _reserved = self.reserve(&id, &dir)?;

        // Built without the map lock so queries on other databases keep going
        let genesis = instance.genesis.clone();
        let db = Database::create(dir, instance, &self.options)?;
        if let Some(genesis) = &genesis {
            let table = self.gate.table();
            let applied = db
                .apply_genesis(&self.context(), &genesis.header.statements)
                .and_then(|()| grant_genesis(table, &id, genesis))
                .and_then(|()| db.save_permissions(table));
            if let Err(err) = applied {
                warn!(database = %id, error = %err, "genesis failed, removing database");
                db.destroy(&self.trash(), &self.options)?;
                return Err(err);
            }
        }

        let mut databases = self
            .databases
            .write()
            .map_err(|_| DbmsError::lock_poisoned("database map"))?;
        // Shutdown drains the map under this lock; do not slip in after it
        if self.is_shut_down() {
            db.close(true)?;
            return Err(DbmsError::Shutdown);
        }
        databases.insert(id.clone(), Arc::new(db));
        info!(database = %id, "database created");
        Ok(())
    }

    /// Claims `id` for a `CreateDb` until the returned guard drops.
    fn reserve<'a>(&'a self, id: &DatabaseId, dir: &DatabaseDir) -> DbmsResult<Reservation<'a>> {
        let mut creating = self
            .creating
            .lock()
            .map_err(|_| DbmsError::lock_poisoned("creating"))?;
        let deployed = self
            .databases
            .read()
            .map_err(|_| DbmsError::lock_poisoned("database map"))?
            .contains_key(id);
        if deployed || creating.contains(id) || dir.is_deployed() {
            return Err(DbmsError::AlreadyDeployed(id.clone()));
        }
        creating.insert(id.clone());
        Ok(Reservation {
            creating: &self.creating,
            id: id.clone(),
        })
    }

    fn drop_database(&self, id: &DatabaseId) -> DbmsResult<()> {
        let db = {
            let mut databases = self
                .databases
                .write()
                .map_err(|_| DbmsError::lock_poisoned("database map"))?;
            databases
                .remove(id)
                .ok_or_else(|| DbmsError::NotFound(id.clone()))?
        };
        // Blocks until in-flight requests on this database finish
        if let Err(err) = db.destroy(&self.trash(), &self.options) {
            warn!(database = %id, error = %err, "drop failed, database kept");
            self.databases
                .write()
                .map_err(|_| DbmsError::lock_poisoned("database map"))?
                .insert(id.clone(), db);
            return Err(err);
        }
        info!(database = %id, "database dropped");
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Executes a signed query request and returns the signed response.
    #[instrument(skip_all, fields(
        database = %request.header.header.database_id,
        query_type = %request.header.header.query_type,
        connection_id = request.header.header.connection_id,
        seq_no = request.header.header.seq_no,
    ))]
    pub fn query(&self, request: Request) -> DbmsResult<Response> {
        self.ensure_running()?;
        let signed = &request.header;
        let header = &signed.header;
        verify_seal(header, &signed.signature)?;
        if digest_of(&request.payload)? != header.query_hash {
            return Err(CryptoError::DigestMismatch.into());
        }
        self.check_freshness(header.timestamp)?;

        let db = self.database(&header.database_id)?;
        let user = address_of(&signed.signature.signee);
        self.gate
            .authorize(&header.database_id, &user, header.query_type.into())?;
        db.check_replay(user, header.connection_id, header.seq_no, header.timestamp)?;

        let ctx = self.context();
        let queries = &request.payload.queries;
        let mut response = ResponseHeader {
            request: signed.clone(),
            node_id: self.node_id.clone(),
            timestamp: Timestamp::now(),
            row_count: 0,
            log_offset: 0,
            last_insert_id: 0,
            affected_rows: 0,
            payload_hash: Default::default(),
        };
        let payload = match header.query_type {
            QueryType::Read => {
                let set = db.read(&ctx, queries)?;
                response.row_count = set.row_count() as u64;
                payload_of(set)
            }
            QueryType::Write => {
                let (result, log_offset) = db.write(&ctx, queries)?;
                response.log_offset = log_offset;
                response.affected_rows = result.affected_rows;
                response.last_insert_id = result.last_insert_id;
                ResponsePayload::default()
            }
        };
        response.payload_hash = digest_of(&payload)?;

        let signature = seal(&response, &self.key)?;
        db.remember(
            signature.hash,
            PendingAck {
                log_offset: response.log_offset,
                query_type: header.query_type,
            },
        )?;
        debug!(
            row_count = response.row_count,
            log_offset = response.log_offset,
            affected_rows = response.affected_rows,
            "query executed"
        );
        Ok(Response {
            header: SignedResponseHeader {
                header: response,
                signature,
            },
            payload,
        })
    }

    /// Confirms receipt of a response and notifies subscribers of writes.
    #[instrument(skip_all, fields(
        database = %ack.response().header.request.header.database_id,
        log_offset = ack.response().header.log_offset,
    ))]
    pub fn ack(&self, ack: Ack) -> DbmsResult<AckResponse> {
        self.ensure_running()?;
        let signed = &ack.header;
        verify_seal(&signed.header, &signed.signature)?;
        let response = ack.response();
        verify_seal(&response.header, &response.signature)?;

        let database_id = response.header.request.header.database_id.clone();
        let log_offset = response.header.log_offset;
        if response.signature.signee != self.key.public_key() {
            warn!("ack names a response signed by another node");
            return Err(DbmsError::UnknownResponse {
                database_id,
                log_offset,
            });
        }
        if signed.signature.signee != response.header.request.signature.signee {
            warn!("ack not signed by the requester");
            return Err(DbmsError::PermissionDeny);
        }

        let db = self.database(&database_id)?;
        let Some(pending) = db.take_ack(&response.signature.hash, log_offset)? else {
            return Err(DbmsError::UnknownResponse {
                database_id,
                log_offset,
            });
        };

        let mut notified = 0;
        if pending.query_type == QueryType::Write {
            for node in db.subscribers_for(log_offset)? {
                self.notifier.notify(&database_id, &node, response);
                notified += 1;
            }
        }
        debug!(notified, "response acknowledged");
        Ok(AckResponse {
            database_id,
            log_offset,
            notified,
        })
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribes `node` to acknowledged writes from `start_sequence` on,
    /// replacing any existing subscription of the node.
    #[instrument(skip_all, fields(database = %database_id, node = %node, start_sequence = start_sequence))]
    pub fn add_tx_subscription(&self, database_id: &DatabaseId, node: &NodeId, start_sequence: u64) -> DbmsResult<()> {
        self.ensure_running()?;
        let Some(account) = self.directory.account_of(node) else {
            warn!("subscriber has no known account");
            return Err(DbmsError::PermissionDeny);
        };
        self.gate.authorize(database_id, &account, Operation::Write)?;
        self.database(database_id)?.subscribe(node.clone(), start_sequence)?;
        info!("transaction subscription added");
        Ok(())
    }

    /// Removes the subscription of `node`. Missing subscriptions are ignored.
    #[instrument(skip_all, fields(database = %database_id, node = %node))]
    pub fn cancel_tx_subscription(&self, database_id: &DatabaseId, node: &NodeId) -> DbmsResult<()> {
        self.ensure_running()?;
        if self.database(database_id)?.unsubscribe(node)? {
            info!("transaction subscription cancelled");
        }
        Ok(())
    }

    // ========================================================================
    // Permissions
    // ========================================================================

    /// Sets the PermStat of `user`. For a deployed database the change is
    /// written to disk before it takes effect.
    pub fn update_permission(&self, database_id: &DatabaseId, user: AccountAddress, perm: PermStat) -> DbmsResult<()> {
        let table = self.gate.table();
        match self.database(database_id) {
            Ok(db) => db.record_permission(table, user, perm),
            Err(DbmsError::NotFound(_)) => Ok(table.update(database_id, user, perm)?),
            Err(err) => Err(err),
        }
    }

    pub fn request_perm_stat(&self, database_id: &DatabaseId, user: &AccountAddress) -> DbmsResult<Option<PermStat>> {
        Ok(self.gate.table().get(database_id, user)?)
    }

    /// Applies a permission change signed by an admin of the database or by
    /// a block producer.
    #[instrument(skip_all, fields(database = %update.header.database_id, user = %update.header.user))]
    pub fn apply_permission_update(&self, update: PermissionUpdate) -> DbmsResult<()> {
        self.ensure_running()?;
        let header = &update.header;
        verify_seal(header, &update.signature)?;
        self.check_freshness(header.timestamp)?;

        let signer = address_of(&update.signature.signee);
        if !self.producers.contains(&signer) {
            self.gate
                .authorize(&header.database_id, &signer, Operation::Admin)?;
        }
        self.update_permission(&header.database_id, header.user, header.perm)
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stops accepting requests, drains and closes every database.
    ///
    /// Calling it again returns immediately.
    #[instrument(skip_all)]
    pub fn shutdown(&self) -> DbmsResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let databases: Vec<Arc<Database>> = {
            let mut map = self
                .databases
                .write()
                .map_err(|_| DbmsError::lock_poisoned("database map"))?;
            map.drain().map(|(_, db)| db).collect()
        };

        let count = databases.len();
        let mut first_error = None;
        for db in databases {
            if let Err(err) = db.close(true) {
                warn!(database = %db.id(), error = %err, "failed to flush database");
                first_error.get_or_insert(err);
            }
        }
        info!(databases = count, "dbms shut down");
        first_error.map_or(Ok(()), Err)
    }
}

/// Releases a `CreateDb` reservation.
struct Reservation<'a> {
    creating: &'a Mutex<HashSet<DatabaseId>>,
    id: DatabaseId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        match self.creating.lock() {
            Ok(mut creating) => {
                creating.remove(&self.id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&self.id);
            }
        }
    }
}

fn grant_genesis(table: &PermissionTable, id: &DatabaseId, genesis: &GenesisBlock) -> DbmsResult<()> {
    for grant in &genesis.header.grants {
        table.update(id, grant.user, grant.perm)?;
    }
    Ok(())
}

fn payload_of(set: ResultSet) -> ResponsePayload {
    ResponsePayload {
        columns: set.columns,
        decl_types: set.decl_types,
        rows: set
            .rows
            .into_iter()
            .map(|values| ResponseRow { values })
            .collect(),
    }
}
