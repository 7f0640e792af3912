use std::sync::mpsc::Sender;
use std::time::Duration;

use sqlite_livequery::{
    Database, Diff, KeySelector, Options, QueryObserver, Row, Trigger, Value,
};

// Simple example which watches a table while a plain rusqlite connection
// mutates it. It should print three updates:
// ```
// update: 1 added, 0 changed, 0 removed (1 rows)
// update: 0 added, 1 changed, 0 removed (1 rows)
// update: 0 added, 0 changed, 1 removed (0 rows)
// ```
fn main() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let db_file = tmp_dir.path().join("db.sqlite3");

    let writer = rusqlite::Connection::open(&db_file).unwrap();
    let _: String = writer
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .unwrap();
    writer
        .execute(
            "CREATE TABLE players (id INTEGER PRIMARY KEY, name TEXT)",
            (),
        )
        .unwrap();

    let options = Options::new(&db_file).with_min_interval(Duration::from_millis(50));
    let db = Database::open(options).unwrap();

    let (sender, receiver) = std::sync::mpsc::channel();
    let query = db
        .select(
            "SELECT * FROM players WHERE id = ?1",
            vec![Value::Integer(11)],
            KeySelector::columns(["id"]),
            vec![Trigger::on("players")],
            Box::new(Observer { sender }),
        )
        .unwrap();

    // Space the writes out so each one lands in its own processing pass
    // instead of coalescing into a single diff.
    for statement in [
        "INSERT INTO players VALUES (11, 'Alice')",
        "UPDATE players SET name = 'Bob' WHERE id = 11",
        "DELETE FROM players WHERE id = 11",
    ] {
        writer.execute(statement, ()).unwrap();
        let line = receiver
            .recv_timeout(Duration::from_secs(10))
            .expect("no update arrived");
        println!("{line}");
    }

    query.stop().unwrap();
    db.close().unwrap();
}

struct Observer {
    sender: Sender<String>,
}

impl QueryObserver for Observer {
    fn on_update(&self, diff: &Diff, rows: &[Row]) {
        self.sender
            .send(format!(
                "update: {} added, {} changed, {} removed ({} rows)",
                diff.added.len(),
                diff.changed.len(),
                diff.removed.len(),
                rows.len()
            ))
            .unwrap();
    }
}
