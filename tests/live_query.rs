//! End-to-end scenarios: a real WAL-mode database mutated by an independent
//! writer connection, observed by the engine.

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::time::{Duration, Instant};

use rusqlite::Connection;
use sqlite_livequery::{
    ColumnSelection, Database, Diff, KeySelector, Options, QueryObserver, Row, Trigger, Value,
};

struct Harness {
    _dir: tempfile::TempDir,
    path: PathBuf,
    writer: Connection,
}

fn setup(schema: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sqlite3");
    let writer = Connection::open(&path).unwrap();
    let _: String = writer
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .unwrap();
    writer.execute(schema, []).unwrap();
    Harness {
        _dir: dir,
        path,
        writer,
    }
}

fn fast_options(harness: &Harness) -> Options {
    let mut options = Options::new(&harness.path).with_min_interval(Duration::from_millis(50));
    options.watch_interval = Duration::from_millis(10);
    options
}

struct Collector {
    updates: SyncSender<(Diff, Vec<Row>)>,
}

impl Collector {
    fn new() -> (Box<Collector>, Receiver<(Diff, Vec<Row>)>) {
        let (sender, receiver) = std::sync::mpsc::sync_channel(64);
        (Box::new(Collector { updates: sender }), receiver)
    }
}

impl QueryObserver for Collector {
    fn on_update(&self, diff: &Diff, rows: &[Row]) {
        let _ = self.updates.send((diff.clone(), rows.to_vec()));
    }

    fn on_error(&self, error: &sqlite_livequery::Error) {
        panic!("unexpected query error: {error}");
    }
}

fn expect_update(updates: &Receiver<(Diff, Vec<Row>)>) -> (Diff, Vec<Row>) {
    updates
        .recv_timeout(Duration::from_secs(10))
        .expect("timed out waiting for an update")
}

fn expect_quiet(updates: &Receiver<(Diff, Vec<Row>)>, window: Duration) {
    match updates.recv_timeout(window) {
        Err(RecvTimeoutError::Timeout) => {}
        Ok((diff, _)) => panic!("unexpected update: {diff:?}"),
        Err(e) => panic!("update channel failed: {e}"),
    }
}

fn player(id: i64, name: &str) -> Row {
    Row::from([
        ("id".to_owned(), Value::Integer(id)),
        ("name".to_owned(), Value::Text(name.to_owned())),
    ])
}

#[test]
fn insert_update_delete_emit_matching_diffs() {
    let harness = setup("CREATE TABLE players (id INTEGER PRIMARY KEY, name TEXT)");
    let db = Database::open(fast_options(&harness)).unwrap();
    let (observer, updates) = Collector::new();
    let query = db
        .select(
            "SELECT * FROM players WHERE id = ?1",
            vec![Value::Integer(11)],
            KeySelector::columns(["id"]),
            vec![Trigger::when("players", |new, old, _deleted| {
                [new, old]
                    .into_iter()
                    .flatten()
                    .any(|row| row.get("id") == Some(&Value::Integer(11)))
            })],
            observer,
        )
        .unwrap();
    assert!(query.rows().is_empty());

    harness
        .writer
        .execute("INSERT INTO players VALUES (11, 'Alice')", [])
        .unwrap();
    let (diff, rows) = expect_update(&updates);
    assert_eq!(diff.added, vec![player(11, "Alice")]);
    assert!(diff.changed.is_empty());
    assert!(diff.removed.is_empty());
    assert_eq!(rows, vec![player(11, "Alice")]);
    assert_eq!(query.rows(), rows);

    harness
        .writer
        .execute("UPDATE players SET name = 'Bob' WHERE id = 11", [])
        .unwrap();
    let (diff, rows) = expect_update(&updates);
    assert!(diff.added.is_empty());
    assert_eq!(diff.changed, vec![player(11, "Bob")]);
    assert!(diff.removed.is_empty());
    assert_eq!(rows, vec![player(11, "Bob")]);

    harness
        .writer
        .execute("DELETE FROM players WHERE id = 11", [])
        .unwrap();
    let (diff, rows) = expect_update(&updates);
    assert!(diff.added.is_empty());
    assert!(diff.changed.is_empty());
    assert_eq!(diff.removed, vec![player(11, "Bob")]);
    assert!(rows.is_empty());

    query.stop().unwrap();
    db.close().unwrap();
}

#[test]
fn json_text_columns_emit_parsed_structures() {
    let harness = setup("CREATE TABLE users (id INTEGER PRIMARY KEY, profile TEXT)");
    let db = Database::open(fast_options(&harness)).unwrap();
    let (observer, updates) = Collector::new();
    let _query = db
        .select(
            "SELECT * FROM users",
            Vec::new(),
            KeySelector::columns(["id"]),
            vec![Trigger::on("users")],
            observer,
        )
        .unwrap();

    harness
        .writer
        .execute("INSERT INTO users VALUES (1, '{\"age\":30}')", [])
        .unwrap();
    let (diff, _rows) = expect_update(&updates);
    assert_eq!(
        diff.added[0]["profile"],
        Value::Json(serde_json::json!({"age": 30}))
    );

    harness
        .writer
        .execute("UPDATE users SET profile = '{\"age\":31}' WHERE id = 1", [])
        .unwrap();
    let (diff, _rows) = expect_update(&updates);
    assert_eq!(diff.changed.len(), 1);
    assert_eq!(
        diff.changed[0]["profile"],
        Value::Json(serde_json::json!({"age": 31}))
    );

    db.close().unwrap();
}

#[test]
fn trigger_predicates_gate_fan_out() {
    let harness = setup("CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER)");
    let db = Database::open(fast_options(&harness)).unwrap();

    let (filtered_observer, filtered_updates) = Collector::new();
    let _filtered = db
        .select(
            "SELECT * FROM orders WHERE customer_id = 7",
            Vec::new(),
            KeySelector::columns(["id"]),
            vec![Trigger::when("orders", |new, old, _deleted| {
                [new, old]
                    .into_iter()
                    .flatten()
                    .any(|row| row.get("customer_id") == Some(&Value::Integer(7)))
            })],
            filtered_observer,
        )
        .unwrap();

    let (all_observer, all_updates) = Collector::new();
    let _all = db
        .select(
            "SELECT * FROM orders",
            Vec::new(),
            KeySelector::columns(["id"]),
            vec![Trigger::on("orders")],
            all_observer,
        )
        .unwrap();

    harness
        .writer
        .execute("INSERT INTO orders VALUES (1, 7)", [])
        .unwrap();
    let (diff, _) = expect_update(&filtered_updates);
    assert_eq!(diff.added.len(), 1);
    let (diff, _) = expect_update(&all_updates);
    assert_eq!(diff.added.len(), 1);

    harness
        .writer
        .execute("INSERT INTO orders VALUES (2, 8)", [])
        .unwrap();
    let (diff, rows) = expect_update(&all_updates);
    assert_eq!(diff.added.len(), 1);
    assert_eq!(rows.len(), 2);
    // The filtered query's predicate returned false for customer 8.
    expect_quiet(&filtered_updates, Duration::from_millis(400));

    db.close().unwrap();
}

#[test]
fn updates_are_coalesced_by_min_interval() {
    let harness = setup("CREATE TABLE players (id INTEGER PRIMARY KEY, name TEXT)");
    let mut options = fast_options(&harness);
    options.min_interval = Duration::from_millis(500);
    let db = Database::open(options).unwrap();
    let (observer, updates) = Collector::new();
    let _query = db
        .select(
            "SELECT * FROM players",
            Vec::new(),
            KeySelector::columns(["id"]),
            vec![Trigger::on("players")],
            observer,
        )
        .unwrap();

    let first_write = Instant::now();
    harness
        .writer
        .execute("INSERT INTO players VALUES (1, 'a')", [])
        .unwrap();
    std::thread::sleep(Duration::from_millis(80));
    harness
        .writer
        .execute("INSERT INTO players VALUES (2, 'b')", [])
        .unwrap();

    let (diff, rows) = expect_update(&updates);
    // Both writes coalesced into one deferred pass, no sooner than the
    // minimum interval after the last pass.
    assert!(first_write.elapsed() >= Duration::from_millis(300));
    assert_eq!(diff.added.len(), 2);
    assert_eq!(rows.len(), 2);
    expect_quiet(&updates, Duration::from_millis(700));

    db.close().unwrap();
}

#[test]
fn pause_defers_processing_until_resume() {
    let harness = setup("CREATE TABLE players (id INTEGER PRIMARY KEY, name TEXT)");
    let db = Database::open(fast_options(&harness)).unwrap();
    let (observer, updates) = Collector::new();
    let _query = db
        .select(
            "SELECT * FROM players",
            Vec::new(),
            KeySelector::columns(["id"]),
            vec![Trigger::on("players")],
            observer,
        )
        .unwrap();

    db.pause().unwrap();
    harness
        .writer
        .execute("INSERT INTO players VALUES (1, 'a')", [])
        .unwrap();
    harness
        .writer
        .execute("INSERT INTO players VALUES (2, 'b')", [])
        .unwrap();
    expect_quiet(&updates, Duration::from_millis(400));

    db.resume().unwrap();
    let (diff, rows) = expect_update(&updates);
    assert_eq!(diff.added, vec![player(1, "a"), player(2, "b")]);
    assert_eq!(rows.len(), 2);

    db.close().unwrap();
}

#[test]
fn excluded_columns_never_appear_and_never_trigger() {
    let harness =
        setup("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, password TEXT)");
    let options = fast_options(&harness)
        .with_column_cache("users", ColumnSelection::Exclude(vec!["password".to_owned()]));
    let db = Database::open(options).unwrap();
    let (observer, updates) = Collector::new();
    let _query = db
        .select(
            "SELECT * FROM users",
            Vec::new(),
            KeySelector::columns(["id"]),
            vec![Trigger::on("users")],
            observer,
        )
        .unwrap();

    harness
        .writer
        .execute("INSERT INTO users VALUES (1, 'alice', 'secret')", [])
        .unwrap();
    let (diff, rows) = expect_update(&updates);
    assert!(!diff.added[0].contains_key("password"));
    assert!(!rows[0].contains_key("password"));

    // A change confined to the excluded column is invisible.
    harness
        .writer
        .execute("UPDATE users SET password = 'rotated' WHERE id = 1", [])
        .unwrap();
    expect_quiet(&updates, Duration::from_millis(400));

    // Tracked columns still propagate, without the excluded one.
    harness
        .writer
        .execute("UPDATE users SET name = 'bob' WHERE id = 1", [])
        .unwrap();
    let (diff, _rows) = expect_update(&updates);
    assert_eq!(diff.changed.len(), 1);
    assert_eq!(diff.changed[0]["name"], Value::Text("bob".to_owned()));
    assert!(!diff.changed[0].contains_key("password"));

    db.close().unwrap();
}

#[test]
fn pooled_execution_behaves_like_primary() {
    let harness = setup("CREATE TABLE players (id INTEGER PRIMARY KEY, name TEXT)");
    let options = fast_options(&harness).with_pool();
    let db = Database::open(options).unwrap();
    let (observer, updates) = Collector::new();
    let _query = db
        .select(
            "SELECT * FROM players ORDER BY id",
            Vec::new(),
            KeySelector::columns(["id"]),
            vec![Trigger::on("players")],
            observer,
        )
        .unwrap();

    for (id, name) in [(1, "a"), (2, "b"), (3, "c")] {
        harness
            .writer
            .execute("INSERT INTO players VALUES (?1, ?2)", (id, name))
            .unwrap();
        let (_diff, rows) = expect_update(&updates);
        assert_eq!(rows.len(), id as usize);
    }

    db.close().unwrap();
}

#[test]
fn overflowing_payloads_are_refetched() {
    // A payload larger than a page spills to overflow pages, which the
    // decoder never chases; the row must arrive via the live database.
    let harness = setup("CREATE TABLE docs (id INTEGER PRIMARY KEY, body TEXT)");
    let db = Database::open(fast_options(&harness)).unwrap();
    let (observer, updates) = Collector::new();
    let _query = db
        .select(
            "SELECT * FROM docs",
            Vec::new(),
            KeySelector::columns(["id"]),
            vec![Trigger::on("docs")],
            observer,
        )
        .unwrap();

    let body = "y".repeat(8000);
    harness
        .writer
        .execute("INSERT INTO docs VALUES (1, ?1)", [body.as_str()])
        .unwrap();
    let (diff, _rows) = expect_update(&updates);
    assert_eq!(diff.added.len(), 1);
    assert_eq!(diff.added[0]["body"], Value::Text(body));

    db.close().unwrap();
}

#[test]
fn many_rows_survive_page_splits() {
    // Enough rows to grow the table past one page; mutations must still be
    // attributed after the B-tree splits.
    let harness = setup("CREATE TABLE logs (id INTEGER PRIMARY KEY, body TEXT)");
    let db = Database::open(fast_options(&harness)).unwrap();
    let (observer, updates) = Collector::new();
    let _query = db
        .select(
            "SELECT * FROM logs WHERE id = 499",
            Vec::new(),
            KeySelector::columns(["id"]),
            vec![Trigger::when("logs", |new, old, _deleted| {
                [new, old]
                    .into_iter()
                    .flatten()
                    .any(|row| row.get("id") == Some(&Value::Integer(499)))
            })],
            observer,
        )
        .unwrap();

    let filler = "x".repeat(100);
    harness.writer.execute("BEGIN", []).unwrap();
    for id in 0..500 {
        harness
            .writer
            .execute("INSERT INTO logs VALUES (?1, ?2)", (id, filler.as_str()))
            .unwrap();
    }
    harness.writer.execute("COMMIT", []).unwrap();

    let (diff, _rows) = expect_update(&updates);
    assert_eq!(diff.added.len(), 1);
    assert_eq!(diff.added[0]["id"], Value::Integer(499));

    harness
        .writer
        .execute("UPDATE logs SET body = 'changed' WHERE id = 499", [])
        .unwrap();
    let (diff, _rows) = expect_update(&updates);
    assert_eq!(diff.changed.len(), 1);
    assert_eq!(diff.changed[0]["body"], Value::Text("changed".to_owned()));

    db.close().unwrap();
}
