//! End-to-end behaviour of the sharding driver over on-disk databases.

use chrono::Utc;
use strata_shard::{
    Connection, DriverError, Drivers, Dsn, ExecContext, Params, SHARD_SCHEME, ShardConnection,
    ShardError, UnresolvedTargetPolicy,
};
use strata_types::Value;
use tempfile::{TempDir, tempdir};

const SCHEMA: &str = "SHARDCONFIG foo time 864000 1536000000 \
    create table if not exists foo$SHARD (id integer not null primary key, name text, time timestamp); \
    create index if not exists fooindex$SHARD on foo$SHARD (time);";

fn dsn(dir: &TempDir) -> Dsn {
    Dsn::new(SHARD_SCHEME, dir.path().join("foo_s.db").to_string_lossy())
}

fn open(dir: &TempDir) -> ShardConnection {
    let conn = ShardConnection::open(&dsn(dir)).unwrap();
    conn.exec(&ctx(), SCHEMA, &Params::new()).unwrap();
    conn
}

fn ctx() -> ExecContext {
    ExecContext::background()
}

fn count(conn: &dyn Connection, table: &str) -> i64 {
    let mut rows = conn
        .query(&ctx(), &format!("select count(*) from {table}"), &Params::new())
        .unwrap();
    rows.next().and_then(|r| r[0].as_i64()).unwrap()
}

#[test]
fn insert_lands_in_bucket_and_baseline_stays_empty() {
    let dir = tempdir().unwrap();
    let conn = open(&dir);

    let result = conn
        .exec(
            &ctx(),
            "insert into foo(id, name, time) values(?, ?, ?)",
            &Params::new().bind(6).bind("xx").bind(1_536_699_999),
        )
        .unwrap();
    assert_eq!(result.affected_rows, 1);
    assert_eq!(result.last_insert_id, 6);

    assert_eq!(count(&conn, "foo"), 0);
    assert_eq!(count(&conn, "foo_ts_1536192000"), 1);
}

#[test]
fn rows_of_one_insert_split_across_buckets() {
    let dir = tempdir().unwrap();
    let conn = open(&dir);

    let params = Params::new()
        .bind(6)
        .bind("xx")
        .bind(1_536_699_999)
        .bind(7)
        .bind("xxx")
        .bind(Utc::now())
        .bind(8)
        .bind("xxx")
        .bind(1_536_699_999.11);
    let result = conn
        .exec(
            &ctx(),
            "insert into foo(id, name, time) values(?, ?, ?),(?, ?, ?);
             insert into foo(id, name, time) values(61, 'foo', '2018-09-11');
             insert into foo(id, name, time) values(?, ?, ?);",
            &params,
        )
        .unwrap();
    assert_eq!(result.affected_rows, 4);
    assert_eq!(count(&conn, "foo_ts_1536192000"), 3);
    assert_eq!(count(&conn, "foo"), 0);

    let now = Utc::now().timestamp();
    let current = format!("foo_ts_{:010}", now / 864_000 * 864_000);
    assert_eq!(count(&conn, &current), 1);
}

#[test]
fn named_and_mixed_binding() {
    let dir = tempdir().unwrap();
    let conn = open(&dir);

    conn.exec(
        &ctx(),
        "insert into foo(id, name, time) values(?, :vv1, :vv2);",
        &Params::new()
            .bind(9)
            .bind_named("vv1", "sss")
            .bind_named("vv2", 1_536_699_988.11),
    )
    .unwrap();
    conn.exec(
        &ctx(),
        "insert into foo(id, name, time) values(:id, :name, :time);",
        &Params::new()
            .bind_named("id", 10)
            .bind_named("name", "sss")
            .bind_named("time", 1_536_111_111.11),
    )
    .unwrap();

    assert_eq!(count(&conn, "foo_ts_1536192000"), 1);
    assert_eq!(count(&conn, "foo_ts_1535328000"), 1);

    let mut rows = conn
        .query(
            &ctx(),
            "select count(1), max(id), name from foo_ts_1536192000 where id < ? and name = :ll limit 10",
            &Params::new().bind(100).bind_named("ll", "sss"),
        )
        .unwrap();
    assert_eq!(
        rows.next(),
        Some(vec![Value::Integer(1), Value::Integer(9), Value::from("sss")])
    );
}

#[test]
fn prepared_insert_routes_each_execution() {
    let dir = tempdir().unwrap();
    let conn = open(&dir);

    let stmt = conn
        .prepare("insert into foo(id, name, time) values(?, ?, ?);")
        .unwrap();
    assert!(!stmt.is_read_only());
    for (i, t) in [(0, 10), (1, 1_536_699_999)] {
        let result = stmt
            .exec(
                &ctx(),
                &Params::new().bind(i).bind(format!("こんにちわ世界{i:03}")).bind(t),
            )
            .unwrap();
        assert_eq!(result.affected_rows, 1);
    }
    assert_eq!(count(&conn, "foo_ts_0000000000"), 1);
    assert_eq!(count(&conn, "foo_ts_1536192000"), 1);

    let select = conn.prepare("select name from foo where id = ?").unwrap();
    assert!(select.is_read_only());
    let rows: Vec<_> = select.query(&ctx(), &Params::new().bind("1")).unwrap().collect();
    assert!(rows.is_empty());
}

#[test]
fn prepared_multi_row_insert_splits_per_execution() {
    let dir = tempdir().unwrap();
    let conn = open(&dir);

    let stmt = conn
        .prepare("insert into foo(id, name, time) values(?, ?, ?), (?, ?, ?)")
        .unwrap();
    let result = stmt
        .exec(
            &ctx(),
            &Params::new()
                .bind(1)
                .bind("a")
                .bind(10)
                .bind(2)
                .bind("b")
                .bind(1_536_699_999),
        )
        .unwrap();
    assert_eq!(result.affected_rows, 2);
    assert_eq!(count(&conn, "foo_ts_0000000000"), 1);
    assert_eq!(count(&conn, "foo_ts_1536192000"), 1);
}

#[test]
fn pinned_select_reads_its_bucket() {
    let dir = tempdir().unwrap();
    let conn = open(&dir);
    conn.exec(
        &ctx(),
        "insert into foo values (1, 'a', 10), (2, 'b', 1536699999)",
        &Params::new(),
    )
    .unwrap();

    let mut rows = conn
        .query(&ctx(), "select id, name from foo where time = ?", &Params::new().bind(1_536_699_999))
        .unwrap();
    assert_eq!(rows.columns(), ["id", "name"]);
    assert_eq!(rows.next(), Some(vec![Value::Integer(2), Value::from("b")]));
    assert_eq!(rows.next(), None);

    let updated = conn
        .exec(&ctx(), "update foo set name = 'auxten' where time = 10", &Params::new())
        .unwrap();
    assert_eq!(updated.affected_rows, 1);
    let mut rows = conn
        .query(&ctx(), "select name from foo_ts_0000000000", &Params::new())
        .unwrap();
    assert_eq!(rows.next(), Some(vec![Value::from("auxten")]));
}

#[test]
fn failing_batch_rolls_back_everything() {
    let dir = tempdir().unwrap();
    let conn = open(&dir);

    let err = conn
        .exec(
            &ctx(),
            "insert into foo values (1, 'a', 10); insert into missing values (1)",
            &Params::new(),
        )
        .unwrap_err();
    assert!(matches!(err, DriverError::Engine(_)));

    // Neither the row nor the bucket survived
    assert!(conn.store().snapshot().unwrap().buckets("foo").is_empty());
    let err = conn
        .query(&ctx(), "select * from foo_ts_0000000000", &Params::new())
        .unwrap_err();
    assert!(matches!(err, DriverError::Engine(_)));

    // The catalog still accepts the bucket afterwards
    conn.exec(&ctx(), "insert into foo values (1, 'a', 10)", &Params::new())
        .unwrap();
    assert_eq!(count(&conn, "foo_ts_0000000000"), 1);
}

#[test]
fn rewrite_errors_surface_before_execution() {
    let dir = tempdir().unwrap();
    let conn = open(&dir);

    let err = conn
        .exec(&ctx(), "SHARDCONFIG foo time 3600 0 select 1", &Params::new())
        .unwrap_err();
    assert!(matches!(err, DriverError::Shard(ShardError::ConfigConflict { .. })));

    let err = conn
        .exec(
            &ctx(),
            "insert into foo(id, name, time) values (1, 'a', ?)",
            &Params::new().bind(-5),
        )
        .unwrap_err();
    assert!(matches!(err, DriverError::Shard(ShardError::InvalidTimestamp(_))));

    let err = conn
        .exec(&ctx(), "insert into foo values (?, ?, ?)", &Params::new().bind(1))
        .unwrap_err();
    assert!(matches!(err, DriverError::Shard(ShardError::MissingParameter(_))));
}

#[test]
fn catalog_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let conn = open(&dir);
        conn.exec(&ctx(), "insert into foo values (1, 'a', 10)", &Params::new())
            .unwrap();
    }

    let conn = ShardConnection::open(&dsn(&dir)).unwrap();
    let catalog = conn.store().snapshot().unwrap();
    assert_eq!(catalog.config("foo").map(|c| c.interval_secs), Some(864_000));
    assert_eq!(catalog.templates("foo").len(), 2);
    assert_eq!(catalog.buckets("foo"), vec![0]);

    conn.exec(
        &ctx(),
        "insert into foo values (2, 'b', 900000)",
        &Params::new(),
    )
    .unwrap();
    assert_eq!(count(&conn, "foo_ts_0000864000"), 1);
}

#[test]
fn shared_store_sees_committed_buckets() {
    let dir = tempdir().unwrap();
    let writer = open(&dir);
    let reader = ShardConnection::open_shared(&dsn(&dir).read_only(true), writer.store().clone()).unwrap();

    writer
        .exec(&ctx(), "insert into foo values (1, 'a', 10)", &Params::new())
        .unwrap();
    let rows: Vec<_> = reader
        .query(&ctx(), "select id from foo where time = 10", &Params::new())
        .unwrap()
        .collect();
    assert_eq!(rows, vec![vec![Value::Integer(1)]]);
}

#[test]
fn unresolved_policies() {
    let dir = tempdir().unwrap();
    open(&dir)
        .exec(
            &ctx(),
            "insert into foo values (1, 'a', 10), (2, 'b', 1536699999)",
            &Params::new(),
        )
        .unwrap();

    let reject = ShardConnection::open(&dsn(&dir).with_unresolved(UnresolvedTargetPolicy::Reject)).unwrap();
    let err = reject
        .query(&ctx(), "select id from foo", &Params::new())
        .unwrap_err();
    assert!(matches!(err, DriverError::Shard(ShardError::AmbiguousShardTarget { .. })));

    let fan_out = ShardConnection::open(&dsn(&dir).with_unresolved(UnresolvedTargetPolicy::FanOut)).unwrap();
    let mut rows = fan_out
        .query(&ctx(), "select id from foo order by id; select 1", &Params::new())
        .unwrap();
    let mut ids: Vec<i64> = rows.by_ref().filter_map(|r| r[0].as_i64()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2]);
    assert!(rows.next_result_set().unwrap());
    assert_eq!(rows.next(), Some(vec![Value::Integer(1)]));

    let err = fan_out.prepare("select id from foo").unwrap_err();
    assert!(matches!(err, DriverError::Shard(ShardError::Unpreparable(_))));
}

#[test]
fn registry_opens_both_schemes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("plain.db");
    let drivers = Drivers::with_defaults();

    let plain = drivers.open(&format!("sqlite://{}", path.display())).unwrap();
    plain
        .exec(&ctx(), "create table t (a); insert into t values (?)", &Params::new().bind(1))
        .unwrap();
    assert_eq!(count(plain.as_ref(), "t"), 1);

    let sharded = drivers
        .open(&format!("sqlite+shard://{}?busy_timeout=100", path.display()))
        .unwrap();
    assert_eq!(count(sharded.as_ref(), "t"), 1);
    let batch = [
        (SCHEMA, Params::new()),
        ("insert into foo values (?, 'a', 10)", Params::new().bind(1)),
    ];
    let result = sharded.exec_all(&ctx(), &batch).unwrap();
    assert_eq!(result.affected_rows, 1);
    assert_eq!(count(sharded.as_ref(), "foo_ts_0000000000"), 1);
}
