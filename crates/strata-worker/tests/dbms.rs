//! DBMS service behaviour: deployment, gated queries, acks and restarts.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strata_config::StrataConfig;
use strata_crypto::{SigningKey, digest_of, seal};
use strata_types::{
    Ack, AckHeader, AccountAddress, DatabaseId, GenesisBlock, GenesisHeader, NodeId, Peers,
    PermStat, Permission, PermissionUpdate, PermissionUpdateHeader, Query, QueryType, Request,
    RequestHeader, RequestPayload, Response, ServiceInstance, SignedAckHeader,
    SignedRequestHeader, SignedResponseHeader, SignedUpdateServiceHeader, Timestamp,
    UpdateService, UpdateServiceHeader, UpdateType, UserGrant, UserStatus, Value,
};
use strata_worker::{Dbms, DbmsError, StaticDirectory, TxNotifier};
use tempfile::TempDir;

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Debug, Default)]
struct RecordingNotifier {
    seen: Mutex<Vec<(DatabaseId, NodeId, u64)>>,
}

impl RecordingNotifier {
    fn seen(&self) -> Vec<(DatabaseId, NodeId, u64)> {
        self.seen.lock().unwrap().clone()
    }
}

impl TxNotifier for RecordingNotifier {
    fn notify(&self, database_id: &DatabaseId, node: &NodeId, response: &SignedResponseHeader) {
        self.seen
            .lock()
            .unwrap()
            .push((database_id.clone(), node.clone(), response.header.log_offset));
    }
}

// Fields drop in order: the service closes before its directory goes away
struct Harness {
    dbms: Dbms,
    notifier: Arc<RecordingNotifier>,
    producer: SigningKey,
    user: SigningKey,
    node: NodeId,
    root_path: std::path::PathBuf,
    _root: TempDir,
}

impl Harness {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let root_path = root.path().to_path_buf();
        let producer = SigningKey::from_bytes(&[1; 32]).unwrap();
        let user = SigningKey::from_bytes(&[2; 32]).unwrap();
        let node = NodeId::new("client-node");
        let notifier = Arc::new(RecordingNotifier::default());
        let dbms = start(&root_path, &producer, &user, &node, notifier.clone());
        Self {
            dbms,
            notifier,
            producer,
            user,
            node,
            root_path,
            _root: root,
        }
    }

    fn user_address(&self) -> AccountAddress {
        self.user.address()
    }

    fn grant(&self, db: &DatabaseId, permission: Permission, status: UserStatus) {
        self.dbms
            .update_permission(db, self.user_address(), PermStat::new(permission, status))
            .unwrap();
    }

    fn deploy(&self, op: UpdateType, instance: ServiceInstance) -> Result<(), DbmsError> {
        self.dbms
            .deploy(update_service(&self.producer, op, instance))
            .map(|_| ())
    }

    fn create(&self, db: &DatabaseId) {
        self.deploy(UpdateType::CreateDb, ServiceInstance::new(db.clone()).with_peers(peers(1)))
            .unwrap();
    }

    fn query(&self, query_type: QueryType, seq_no: u64, db: &DatabaseId, sqls: &[&str]) -> Result<Response, DbmsError> {
        self.dbms
            .query(request(&self.user, query_type, 1, seq_no, db, sqls, Timestamp::now()))
    }
}

fn config(root: &Path, producer: &SigningKey) -> StrataConfig {
    let mut config = StrataConfig::default();
    config.worker.root_dir = root.to_path_buf();
    config.worker.node_id = "worker-1".to_string();
    config.worker.max_req_time_gap_ms = 5_000;
    config.worker.read_pool_size = 2;
    config.producers.addresses = vec![producer.address().to_string()];
    config
}

fn start(
    root: &Path,
    producer: &SigningKey,
    user: &SigningKey,
    node: &NodeId,
    notifier: Arc<RecordingNotifier>,
) -> Dbms {
    let directory = StaticDirectory::new();
    directory.insert(node.clone(), user.address());
    let node_key = SigningKey::from_bytes(&[9; 32]).unwrap();
    let dbms = Dbms::new(&config(root, producer), node_key, Arc::new(directory), notifier).unwrap();
    dbms.init().unwrap();
    dbms
}

fn peers(count: usize) -> Peers {
    let servers: Vec<NodeId> = (0..count).map(|i| NodeId::new(format!("peer-{i}"))).collect();
    Peers {
        term: 1,
        leader: servers[0].clone(),
        servers,
    }
}

fn update_service(key: &SigningKey, op: UpdateType, instance: ServiceInstance) -> UpdateService {
    let header = UpdateServiceHeader {
        op,
        instance,
        timestamp: Timestamp::now(),
    };
    let signature = seal(&header, key).unwrap();
    UpdateService {
        header: SignedUpdateServiceHeader { header, signature },
    }
}

fn request(
    key: &SigningKey,
    query_type: QueryType,
    connection_id: u64,
    seq_no: u64,
    db: &DatabaseId,
    sqls: &[&str],
    timestamp: Timestamp,
) -> Request {
    let payload = RequestPayload {
        queries: sqls.iter().map(|sql| Query::new(*sql)).collect(),
    };
    let header = RequestHeader {
        query_type,
        node_id: NodeId::new("client-node"),
        database_id: db.clone(),
        connection_id,
        seq_no,
        timestamp,
        batch_count: payload.queries.len() as u64,
        query_hash: digest_of(&payload).unwrap(),
    };
    let signature = seal(&header, key).unwrap();
    Request {
        header: SignedRequestHeader { header, signature },
        payload,
    }
}

fn ack_for(key: &SigningKey, response: &Response) -> Ack {
    let header = AckHeader {
        response: response.header.clone(),
        node_id: NodeId::new("client-node"),
        timestamp: Timestamp::now(),
    };
    let signature = seal(&header, key).unwrap();
    Ack {
        header: SignedAckHeader { header, signature },
    }
}

fn genesis(producer: &SigningKey, statements: &[&str], grants: Vec<UserGrant>) -> GenesisBlock {
    let header = GenesisHeader {
        producer: producer.address(),
        timestamp: Timestamp::now(),
        statements: statements.iter().map(|s| (*s).to_string()).collect(),
        grants,
    };
    GenesisBlock {
        hash: digest_of(&header).unwrap(),
        header,
    }
}

fn db_id(seed: &[u8]) -> DatabaseId {
    DatabaseId::from_address(&AccountAddress::from(strata_crypto::digest(seed)))
}

const CREATE_AND_INSERT: [&str; 2] = ["create table test (test int)", "insert into test values(1)"];
const SELECT: [&str; 1] = ["select * from test"];

fn assert_denied<T: std::fmt::Debug>(result: Result<T, DbmsError>) {
    assert!(
        matches!(result, Err(DbmsError::PermissionDeny)),
        "expected PermissionDeny, got {result:?}"
    );
}

// ============================================================================
// Deployment
// ============================================================================

#[test]
fn deploy_requires_block_producer() {
    let h = Harness::new();
    let db = db_id(b"db");
    let request = update_service(&h.user, UpdateType::CreateDb, ServiceInstance::new(db.clone()));

    assert_denied(h.dbms.deploy(request));
    assert!(h.dbms.databases().unwrap().is_empty());
}

#[test]
fn create_twice_is_rejected() {
    let h = Harness::new();
    let db = db_id(b"db");
    h.create(&db);

    let err = h
        .deploy(UpdateType::CreateDb, ServiceInstance::new(db.clone()))
        .unwrap_err();
    assert!(matches!(err, DbmsError::AlreadyDeployed(id) if id == db));
}

#[test]
fn genesis_statements_and_grants_are_applied() {
    let h = Harness::new();
    let db = db_id(b"genesis");
    let block = genesis(
        &h.producer,
        &["create table test (test int)", "insert into test values(7)"],
        vec![UserGrant {
            user: h.user_address(),
            perm: PermStat::new(Permission::Read, UserStatus::Normal),
        }],
    );
    h.deploy(UpdateType::CreateDb, ServiceInstance::new(db.clone()).with_genesis(block))
        .unwrap();

    let response = h.query(QueryType::Read, 1, &db, &SELECT).unwrap();
    assert_eq!(response.payload.rows[0].values, vec![Value::Integer(7)]);
    assert_denied(h.query(QueryType::Write, 2, &db, &CREATE_AND_INSERT));
}

#[test]
fn genesis_with_wrong_hash_is_rejected() {
    let h = Harness::new();
    let db = db_id(b"bad-genesis");
    let mut block = genesis(&h.producer, &["create table t (v int)"], Vec::new());
    block.header.statements.push("drop table t".to_string());

    let err = h
        .deploy(UpdateType::CreateDb, ServiceInstance::new(db.clone()).with_genesis(block))
        .unwrap_err();
    assert!(matches!(err, DbmsError::InvalidDeployment(_)));
    assert!(!h.root_path.join(db.as_str()).exists());
}

#[test]
fn failing_genesis_leaves_nothing_behind() {
    let h = Harness::new();
    let db = db_id(b"broken");
    let block = genesis(&h.producer, &["insert into missing values (1)"], Vec::new());

    let err = h
        .deploy(UpdateType::CreateDb, ServiceInstance::new(db.clone()).with_genesis(block))
        .unwrap_err();
    assert!(matches!(err, DbmsError::Execution(_)));
    assert!(!h.root_path.join(db.as_str()).exists());
    assert!(h.dbms.databases().unwrap().is_empty());
}

#[test]
fn update_peers_is_persisted() {
    let h = Harness::new();
    let db = db_id(b"db");
    h.create(&db);

    h.deploy(UpdateType::UpdateDb, ServiceInstance::new(db.clone()).with_peers(peers(2)))
        .unwrap();

    let content = std::fs::read(h.root_path.join(db.as_str()).join("instance.json")).unwrap();
    let state: serde_json::Value = serde_json::from_slice(&content).unwrap();
    assert_eq!(state["peers"]["servers"].as_array().unwrap().len(), 2);

    let missing = h
        .deploy(UpdateType::UpdateDb, ServiceInstance::new(db_id(b"nope")))
        .unwrap_err();
    assert!(matches!(missing, DbmsError::NotFound(_)));
}

#[test]
fn drop_then_shutdown_twice() {
    let h = Harness::new();
    let db = db_id(b"db");
    h.create(&db);
    h.grant(&db, Permission::Write, UserStatus::Normal);
    h.query(QueryType::Write, 1, &db, &CREATE_AND_INSERT).unwrap();

    h.deploy(UpdateType::DropDb, ServiceInstance::new(db.clone())).unwrap();
    assert!(!h.root_path.join(db.as_str()).exists());
    assert!(matches!(
        h.query(QueryType::Read, 2, &db, &SELECT),
        Err(DbmsError::NotFound(_))
    ));
    assert!(matches!(
        h.deploy(UpdateType::DropDb, ServiceInstance::new(db.clone())),
        Err(DbmsError::NotFound(_))
    ));

    h.dbms.shutdown().unwrap();
    h.dbms.shutdown().unwrap();
    assert!(h.dbms.is_shut_down());
    assert!(matches!(
        h.query(QueryType::Read, 3, &db, &SELECT),
        Err(DbmsError::Shutdown)
    ));
}

// ============================================================================
// Gated queries
// ============================================================================

#[test]
fn queries_follow_permission_changes() {
    let h = Harness::new();
    let db = db_id(b"db");
    let other = db_id(b"ab");
    h.create(&db);

    // no entry at all
    assert_denied(h.query(QueryType::Write, 1, &db, &CREATE_AND_INSERT));
    assert_denied(h.query(QueryType::Read, 2, &db, &SELECT));

    h.grant(&db, Permission::Write, UserStatus::Normal);
    assert_eq!(
        h.dbms.request_perm_stat(&db, &h.user_address()).unwrap(),
        Some(PermStat::new(Permission::Write, UserStatus::Normal))
    );

    let write = h.query(QueryType::Write, 3, &db, &CREATE_AND_INSERT).unwrap();
    assert_eq!(write.header.header.row_count, 0);
    assert_eq!(write.header.header.log_offset, 1);
    assert_eq!(write.header.header.affected_rows, 1);
    strata_crypto::verify_seal(&write.header.header, &write.header.signature).unwrap();
    assert_eq!(write.header.signature.signee, h.dbms.public_key());

    let read = h.query(QueryType::Read, 4, &db, &SELECT).unwrap();
    strata_crypto::verify_seal(&read.header.header, &read.header.signature).unwrap();
    assert_eq!(read.header.header.row_count, 1);
    assert_eq!(read.header.header.log_offset, 0);
    assert_eq!(read.payload.columns, vec!["test".to_string()]);
    assert_eq!(read.payload.decl_types, vec!["int".to_string()]);
    assert_eq!(read.payload.rows[0].values, vec![Value::Integer(1)]);
    assert_eq!(read.header.header.payload_hash, digest_of(&read.payload).unwrap());

    let ack = h.dbms.ack(ack_for(&h.user, &read)).unwrap();
    assert_eq!(ack.database_id, db);
    assert_eq!(ack.notified, 0);

    assert_denied(h.dbms.add_tx_subscription(&other, &h.node, 1));
    h.dbms.add_tx_subscription(&db, &h.node, 1).unwrap();
    h.dbms.cancel_tx_subscription(&db, &h.node).unwrap();
    h.dbms.cancel_tx_subscription(&db, &h.node).unwrap();

    // downgrade to read
    h.grant(&db, Permission::Read, UserStatus::Normal);
    assert_denied(h.query(QueryType::Write, 5, &db, &CREATE_AND_INSERT));
    h.query(QueryType::Read, 6, &db, &SELECT).unwrap();
    assert_denied(h.dbms.add_tx_subscription(&db, &h.node, 1));
}

#[test]
fn void_permission_denies_everything() {
    let h = Harness::new();
    let db = db_id(b"db");
    h.create(&db);
    h.grant(&db, Permission::Void, UserStatus::Normal);

    assert_denied(h.query(QueryType::Write, 1, &db, &CREATE_AND_INSERT));
    assert_denied(h.query(QueryType::Read, 2, &db, &SELECT));
    assert_denied(h.dbms.add_tx_subscription(&db, &h.node, 1));
}

#[test]
fn arrears_denies_even_admin() {
    let h = Harness::new();
    let db = db_id(b"db");
    h.create(&db);
    h.grant(&db, Permission::Admin, UserStatus::Arrears);

    assert_denied(h.query(QueryType::Write, 1, &db, &CREATE_AND_INSERT));
    assert_denied(h.query(QueryType::Read, 2, &db, &SELECT));

    h.grant(&db, Permission::Admin, UserStatus::Normal);
    h.query(QueryType::Write, 3, &db, &CREATE_AND_INSERT).unwrap();
    let read = h.query(QueryType::Read, 4, &db, &SELECT).unwrap();
    assert_eq!(read.header.header.row_count, 1);
    h.dbms.ack(ack_for(&h.user, &read)).unwrap();
}

#[test]
fn unknown_database_is_not_found() {
    let h = Harness::new();
    let result = h.query(QueryType::Write, 1, &DatabaseId::new("db_not_exists"), &CREATE_AND_INSERT);
    assert!(matches!(result, Err(DbmsError::NotFound(_))));
}

#[test]
fn stale_and_replayed_requests_are_rejected() {
    let h = Harness::new();
    let db = db_id(b"db");
    h.create(&db);
    h.grant(&db, Permission::Write, UserStatus::Normal);

    let old = Timestamp::now().saturating_sub(Duration::from_secs(60));
    let stale = request(&h.user, QueryType::Write, 1, 1, &db, &CREATE_AND_INSERT, old);
    assert!(matches!(h.dbms.query(stale), Err(DbmsError::StaleRequest { .. })));

    let future = Timestamp::now().saturating_add(Duration::from_secs(60));
    let early = request(&h.user, QueryType::Write, 1, 1, &db, &CREATE_AND_INSERT, future);
    assert!(matches!(h.dbms.query(early), Err(DbmsError::StaleRequest { .. })));

    h.query(QueryType::Write, 5, &db, &CREATE_AND_INSERT).unwrap();
    assert!(matches!(
        h.query(QueryType::Read, 5, &db, &SELECT),
        Err(DbmsError::ReplayedRequest { seq_no: 5, last: 5, .. })
    ));
    assert!(matches!(
        h.query(QueryType::Read, 4, &db, &SELECT),
        Err(DbmsError::ReplayedRequest { .. })
    ));

    // another connection has its own sequence
    let other = request(&h.user, QueryType::Read, 2, 1, &db, &SELECT, Timestamp::now());
    h.dbms.query(other).unwrap();
}

#[test]
fn tampered_request_is_rejected() {
    let h = Harness::new();
    let db = db_id(b"db");
    h.create(&db);
    h.grant(&db, Permission::Write, UserStatus::Normal);

    let mut swapped = request(&h.user, QueryType::Read, 1, 1, &db, &SELECT, Timestamp::now());
    swapped.payload.queries.push(Query::new("delete from test"));
    assert!(matches!(h.dbms.query(swapped), Err(DbmsError::InvalidSignature(_))));

    let mut upgraded = request(&h.user, QueryType::Read, 1, 2, &db, &SELECT, Timestamp::now());
    upgraded.header.header.query_type = QueryType::Write;
    assert!(matches!(h.dbms.query(upgraded), Err(DbmsError::InvalidSignature(_))));
}

#[test]
fn sharded_tables_work_through_queries() {
    let h = Harness::new();
    let db = db_id(b"db");
    h.create(&db);
    h.grant(&db, Permission::Write, UserStatus::Normal);

    h.query(
        QueryType::Write,
        1,
        &db,
        &[
            "SHARDCONFIG foo time 864000 1536000000 \
             create table if not exists foo$SHARD (id integer primary key, time timestamp);",
            "insert into foo(id, time) values(1, 1536699999), (2, 1536699998)",
        ],
    )
    .unwrap();

    let baseline = h.query(QueryType::Read, 2, &db, &["select count(*) from foo"]).unwrap();
    assert_eq!(baseline.payload.rows[0].values, vec![Value::Integer(0)]);
    let bucket = h
        .query(QueryType::Read, 3, &db, &["select count(*) from foo_ts_1536192000"])
        .unwrap();
    assert_eq!(bucket.payload.rows[0].values, vec![Value::Integer(2)]);
}

// ============================================================================
// Acknowledgements and subscriptions
// ============================================================================

#[test]
fn write_acks_notify_due_subscribers() {
    let h = Harness::new();
    let db = db_id(b"db");
    h.create(&db);
    h.grant(&db, Permission::Write, UserStatus::Normal);
    h.dbms.add_tx_subscription(&db, &h.node, 2).unwrap();

    let first = h.query(QueryType::Write, 1, &db, &CREATE_AND_INSERT).unwrap();
    assert_eq!(h.dbms.ack(ack_for(&h.user, &first)).unwrap().notified, 0);

    let second = h
        .query(QueryType::Write, 2, &db, &["insert into test values(2)"])
        .unwrap();
    assert_eq!(second.header.header.log_offset, 2);
    let ack = h.dbms.ack(ack_for(&h.user, &second)).unwrap();
    assert_eq!(ack.notified, 1);
    assert_eq!(h.notifier.seen(), vec![(db.clone(), h.node.clone(), 2)]);

    // acked once only
    assert!(matches!(
        h.dbms.ack(ack_for(&h.user, &second)),
        Err(DbmsError::UnknownResponse { log_offset: 2, .. })
    ));
}

#[test]
fn forged_acks_are_rejected() {
    let h = Harness::new();
    let db = db_id(b"db");
    h.create(&db);
    h.grant(&db, Permission::Write, UserStatus::Normal);
    let response = h.query(QueryType::Write, 1, &db, &CREATE_AND_INSERT).unwrap();

    // response header altered after signing
    let mut altered = response.clone();
    altered.header.header.log_offset = 99;
    assert!(matches!(
        h.dbms.ack(ack_for(&h.user, &altered)),
        Err(DbmsError::InvalidSignature(_))
    ));

    // response re-signed by a key other than the node's
    let impostor = SigningKey::from_bytes(&[5; 32]).unwrap();
    let mut resigned = response.clone();
    resigned.header.signature = seal(&resigned.header.header, &impostor).unwrap();
    assert!(matches!(
        h.dbms.ack(ack_for(&h.user, &resigned)),
        Err(DbmsError::UnknownResponse { .. })
    ));

    // ack signed by someone other than the requester
    assert_denied(h.dbms.ack(ack_for(&impostor, &response)));

    // ack header altered after signing
    let mut ack = ack_for(&h.user, &response);
    ack.header.header.node_id = NodeId::new("someone-else");
    assert!(matches!(h.dbms.ack(ack), Err(DbmsError::InvalidSignature(_))));

    h.dbms.ack(ack_for(&h.user, &response)).unwrap();
}

// ============================================================================
// Permission administration
// ============================================================================

#[test]
fn signed_permission_updates_need_admin() {
    let h = Harness::new();
    let db = db_id(b"db");
    h.create(&db);
    let target = SigningKey::from_bytes(&[3; 32]).unwrap().address();

    let signed_update = |key: &SigningKey, perm: PermStat, timestamp: Timestamp| {
        let header = PermissionUpdateHeader {
            database_id: db.clone(),
            user: target,
            perm,
            timestamp,
        };
        let signature = seal(&header, key).unwrap();
        PermissionUpdate { header, signature }
    };
    let read = PermStat::new(Permission::Read, UserStatus::Normal);

    h.grant(&db, Permission::Write, UserStatus::Normal);
    assert_denied(h.dbms.apply_permission_update(signed_update(&h.user, read, Timestamp::now())));

    h.grant(&db, Permission::Admin, UserStatus::Normal);
    h.dbms
        .apply_permission_update(signed_update(&h.user, read, Timestamp::now()))
        .unwrap();
    assert_eq!(h.dbms.request_perm_stat(&db, &target).unwrap(), Some(read));

    // producers may always administer
    let write = PermStat::new(Permission::Write, UserStatus::Normal);
    h.dbms
        .apply_permission_update(signed_update(&h.producer, write, Timestamp::now()))
        .unwrap();
    assert_eq!(h.dbms.request_perm_stat(&db, &target).unwrap(), Some(write));

    let old = Timestamp::now().saturating_sub(Duration::from_secs(60));
    assert!(matches!(
        h.dbms.apply_permission_update(signed_update(&h.producer, read, old)),
        Err(DbmsError::StaleRequest { .. })
    ));
}

// ============================================================================
// Restart
// ============================================================================

#[test]
fn restart_restores_sequence_grants_and_subscriptions() {
    let root = TempDir::new().unwrap();
    let producer = SigningKey::from_bytes(&[1; 32]).unwrap();
    let user = SigningKey::from_bytes(&[2; 32]).unwrap();
    let node = NodeId::new("client-node");
    let db = db_id(b"db");
    let grant = UserGrant {
        user: user.address(),
        perm: PermStat::new(Permission::Write, UserStatus::Normal),
    };

    {
        let notifier = Arc::new(RecordingNotifier::default());
        let dbms = start(root.path(), &producer, &user, &node, notifier);
        let block = genesis(&producer, &["create table test (test int)"], vec![grant]);
        dbms.deploy(update_service(
            &producer,
            UpdateType::CreateDb,
            ServiceInstance::new(db.clone()).with_genesis(block),
        ))
        .unwrap();
        dbms.query(request(&user, QueryType::Write, 1, 1, &db, &["insert into test values(1)"], Timestamp::now()))
            .unwrap();
        dbms.add_tx_subscription(&db, &node, 1).unwrap();
        dbms.shutdown().unwrap();
    }

    let notifier = Arc::new(RecordingNotifier::default());
    let dbms = start(root.path(), &producer, &user, &node, notifier.clone());
    assert_eq!(dbms.databases().unwrap(), vec![db.clone()]);

    // the sequence number used before the restart stays used
    assert!(matches!(
        dbms.query(request(&user, QueryType::Write, 1, 1, &db, &["insert into test values(2)"], Timestamp::now())),
        Err(DbmsError::ReplayedRequest { seq_no: 1, last: 1, .. })
    ));

    let response = dbms
        .query(request(&user, QueryType::Write, 1, 2, &db, &["insert into test values(2)"], Timestamp::now()))
        .unwrap();
    assert_eq!(response.header.header.log_offset, 2);

    dbms.ack(ack_for(&user, &response)).unwrap();
    assert_eq!(notifier.seen(), vec![(db.clone(), node.clone(), 2)]);

    let read = dbms
        .query(request(&user, QueryType::Read, 1, 3, &db, &["select count(*) from test"], Timestamp::now()))
        .unwrap();
    assert_eq!(read.payload.rows[0].values, vec![Value::Integer(2)]);
}

/// Keys and a deployed database that outlive several service instances.
struct Restartable {
    root: TempDir,
    producer: SigningKey,
    user: SigningKey,
    node: NodeId,
    db: DatabaseId,
}

impl Restartable {
    fn new() -> Self {
        let fixture = Self {
            root: TempDir::new().unwrap(),
            producer: SigningKey::from_bytes(&[1; 32]).unwrap(),
            user: SigningKey::from_bytes(&[2; 32]).unwrap(),
            node: NodeId::new("client-node"),
            db: db_id(b"db"),
        };
        let grant = UserGrant {
            user: fixture.user.address(),
            perm: PermStat::new(Permission::Write, UserStatus::Normal),
        };
        let dbms = fixture.start();
        let block = genesis(&fixture.producer, &["create table test (test int)"], vec![grant]);
        dbms.deploy(update_service(
            &fixture.producer,
            UpdateType::CreateDb,
            ServiceInstance::new(fixture.db.clone()).with_genesis(block),
        ))
        .unwrap();
        dbms.shutdown().unwrap();
        fixture
    }

    fn start(&self) -> Dbms {
        let notifier = Arc::new(RecordingNotifier::default());
        start(self.root.path(), &self.producer, &self.user, &self.node, notifier)
    }

    fn insert(&self, dbms: &Dbms, seq_no: u64) -> Result<Response, DbmsError> {
        dbms.query(self.insert_request(seq_no))
    }

    fn insert_request(&self, seq_no: u64) -> Request {
        let sql = format!("insert into test values({seq_no})");
        request(&self.user, QueryType::Write, 1, seq_no, &self.db, &[sql.as_str()], Timestamp::now())
    }
}

#[test]
fn revoked_permission_stays_revoked_after_restart() {
    let fixture = Restartable::new();
    let user = fixture.user.address();
    let void = PermStat::new(Permission::Void, UserStatus::Normal);
    {
        let dbms = fixture.start();
        fixture.insert(&dbms, 1).unwrap();
        dbms.update_permission(&fixture.db, user, void).unwrap();
        assert_denied(fixture.insert(&dbms, 2));
        dbms.shutdown().unwrap();
    }

    let dbms = fixture.start();
    assert_eq!(dbms.request_perm_stat(&fixture.db, &user).unwrap(), Some(void));
    assert_denied(fixture.insert(&dbms, 3));

    // a later grant is what restores access, and it persists as well
    let write = PermStat::new(Permission::Write, UserStatus::Normal);
    dbms.update_permission(&fixture.db, user, write).unwrap();
    fixture.insert(&dbms, 4).unwrap();
    drop(dbms);

    let dbms = fixture.start();
    assert_eq!(dbms.request_perm_stat(&fixture.db, &user).unwrap(), Some(write));
}

#[test]
fn crash_without_shutdown_keeps_log_offsets() {
    let fixture = Restartable::new();
    let offsets: Vec<u64> = {
        let dbms = fixture.start();
        let offsets = (1..=3)
            .map(|seq| fixture.insert(&dbms, seq).unwrap().header.header.log_offset)
            .collect();
        // no shutdown
        drop(dbms);
        offsets
    };
    assert_eq!(offsets, vec![1, 2, 3]);

    let dbms = fixture.start();
    let response = fixture.insert(&dbms, 4).unwrap();
    assert_eq!(response.header.header.log_offset, 4);
}

#[test]
fn captured_request_cannot_be_replayed_after_restart() {
    let fixture = Restartable::new();
    let (write, read) = {
        let dbms = fixture.start();
        let write = fixture.insert_request(1);
        dbms.query(write.clone()).unwrap();
        let read = request(&fixture.user, QueryType::Read, 1, 2, &fixture.db, &SELECT, Timestamp::now());
        dbms.query(read.clone()).unwrap();
        // crash: the read's sequence number never reached disk
        drop(dbms);
        (write, read)
    };

    let dbms = fixture.start();
    assert!(matches!(
        dbms.query(write),
        Err(DbmsError::SignedBeforeRestart { seq_no: 1, .. })
    ));
    assert!(matches!(
        dbms.query(read),
        Err(DbmsError::SignedBeforeRestart { seq_no: 2, .. })
    ));

    // re-signed with the same sequence number, the write is still known
    assert!(matches!(
        fixture.insert(&dbms, 1),
        Err(DbmsError::ReplayedRequest { last: 1, .. })
    ));
    fixture.insert(&dbms, 3).unwrap();
}

// ============================================================================
// Concurrent deployment
// ============================================================================

#[test]
fn concurrent_creates_of_one_database_yield_one_winner() {
    let h = Harness::new();
    let db = db_id(b"raced");

    let results: Vec<Result<(), DbmsError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| h.deploy(UpdateType::CreateDb, ServiceInstance::new(db.clone())))
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|err| matches!(err, DbmsError::AlreadyDeployed(_))));
    assert_eq!(h.dbms.databases().unwrap(), vec![db]);
}

#[test]
fn other_databases_serve_while_one_is_created() {
    let h = Harness::new();
    let busy = db_id(b"busy");
    h.create(&busy);
    h.grant(&busy, Permission::Write, UserStatus::Normal);
    h.query(QueryType::Write, 1, &busy, &CREATE_AND_INSERT).unwrap();

    let statements: Vec<String> = (0..200)
        .map(|i| format!("insert into big values({i})"))
        .collect();
    let mut all = vec!["create table big (v int)"];
    all.extend(statements.iter().map(String::as_str));
    let block = genesis(&h.producer, &all, Vec::new());

    std::thread::scope(|scope| {
        let creating = scope.spawn(|| {
            h.deploy(
                UpdateType::CreateDb,
                ServiceInstance::new(db_id(b"large")).with_genesis(block),
            )
        });
        for seq in 2..20 {
            h.query(QueryType::Read, seq, &busy, &SELECT).unwrap();
        }
        creating.join().unwrap().unwrap();
    });
    assert_eq!(h.dbms.databases().unwrap().len(), 2);
}

#[test]
fn failed_drop_keeps_the_database() {
    let h = Harness::new();
    let db = db_id(b"db");
    h.create(&db);
    h.grant(&db, Permission::Write, UserStatus::Normal);
    h.query(QueryType::Write, 1, &db, &CREATE_AND_INSERT).unwrap();

    // a file where dropped databases are moved to
    let trash = h.root_path.join(".trash");
    std::fs::write(&trash, b"").unwrap();
    assert!(matches!(
        h.deploy(UpdateType::DropDb, ServiceInstance::new(db.clone())),
        Err(DbmsError::Io(_))
    ));
    assert_eq!(h.dbms.databases().unwrap(), vec![db.clone()]);
    let read = h.query(QueryType::Read, 2, &db, &SELECT).unwrap();
    assert_eq!(read.header.header.row_count, 1);

    std::fs::remove_file(&trash).unwrap();
    h.deploy(UpdateType::DropDb, ServiceInstance::new(db.clone())).unwrap();
    assert!(!h.root_path.join(db.as_str()).exists());
    assert!(h.dbms.databases().unwrap().is_empty());
}
