//! Per-table, rowid-keyed snapshots of the cached column subset, and the
//! application of decoded mutations against them.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::Connection;
use tracing::debug;

use crate::error::{Error, Result};
use crate::schema::{quote_ident, TableSchema};
use crate::value::{Row, Value};

/// How a row changed relative to the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MutationKind {
    Insert,
    Update,
    Delete,
}

/// One observed row mutation. `Insert` carries no old row, `Delete` no new
/// row, `Update` both.
#[derive(Debug, Clone)]
pub(crate) struct Mutation {
    pub table: String,
    pub rowid: i64,
    pub kind: MutationKind,
    pub old: Option<Row>,
    pub new: Option<Row>,
}

/// Sentinel for rows whose owning page has not been observed in the WAL
/// yet (rows loaded by the initial cache materialization).
pub(crate) const PAGE_UNKNOWN: u32 = 0;

struct CachedRow {
    row: Row,
    /// Page the row's cell was last seen on.
    page: u32,
}

#[derive(Default)]
struct TableSnapshot {
    rows: BTreeMap<i64, CachedRow>,
}

/// Rowid-keyed row cache for every tracked table.
#[derive(Default)]
pub(crate) struct SnapshotStore {
    tables: BTreeMap<String, TableSnapshot>,
}

impl SnapshotStore {
    pub fn new() -> SnapshotStore {
        SnapshotStore::default()
    }

    /// Load the current rows of `schema`'s table on first call; later calls
    /// are no-ops.
    pub fn ensure_cached(&mut self, conn: &Connection, schema: &TableSchema) -> Result<()> {
        if self.tables.contains_key(&schema.name) {
            return Ok(());
        }
        let wrap = |source| Error::CacheTable {
            table: schema.name.clone(),
            source,
        };
        let sql = format!(
            "SELECT rowid, {} FROM {}",
            schema.select_list(),
            quote_ident(&schema.name)
        );
        let mut snapshot = TableSnapshot::default();
        let mut stmt = conn.prepare(&sql).map_err(wrap)?;
        let mut rows = stmt.query([]).map_err(wrap)?;
        while let Some(row) = rows.next().map_err(wrap)? {
            let rowid: i64 = row.get(0).map_err(wrap)?;
            let mut cached = Row::new();
            for (index, column) in schema.tracked_columns().enumerate() {
                let value = row.get_ref(index + 1).map_err(wrap)?;
                cached.insert(column.name.clone(), Value::from_sql_ref(value));
            }
            snapshot.rows.insert(
                rowid,
                CachedRow {
                    row: cached,
                    page: PAGE_UNKNOWN,
                },
            );
        }
        debug!(table = %schema.name, rows = snapshot.rows.len(), "materialized table cache");
        self.tables.insert(schema.name.clone(), snapshot);
        Ok(())
    }

    pub fn get(&self, table: &str, rowid: i64) -> Option<&Row> {
        self.tables.get(table)?.rows.get(&rowid).map(|c| &c.row)
    }

    /// Last page the row was seen on, if the row is cached.
    pub fn page_of(&self, table: &str, rowid: i64) -> Option<u32> {
        self.tables.get(table)?.rows.get(&rowid).map(|c| c.page)
    }

    /// Apply a new row image (`Some`) or a tombstone (`None`) and return
    /// the resulting mutation. A tombstone for an unknown rowid is ignored,
    /// and so is an image identical to the cached row: page images carry
    /// every cell of the page, including rows the write never touched.
    pub fn apply(
        &mut self,
        table: &str,
        rowid: i64,
        change: Option<(Row, u32)>,
    ) -> Option<Mutation> {
        let snapshot = self.tables.entry(table.to_owned()).or_default();
        match change {
            Some((row, page)) => {
                if let Some(cached) = snapshot.rows.get_mut(&rowid) {
                    if cached.row == row {
                        cached.page = page;
                        return None;
                    }
                }
                let old = snapshot.rows.insert(rowid, CachedRow { row: row.clone(), page });
                match old {
                    Some(old) => Some(Mutation {
                        table: table.to_owned(),
                        rowid,
                        kind: MutationKind::Update,
                        old: Some(old.row),
                        new: Some(row),
                    }),
                    None => Some(Mutation {
                        table: table.to_owned(),
                        rowid,
                        kind: MutationKind::Insert,
                        old: None,
                        new: Some(row),
                    }),
                }
            }
            None => snapshot.rows.remove(&rowid).map(|old| Mutation {
                table: table.to_owned(),
                rowid,
                kind: MutationKind::Delete,
                old: Some(old.row),
                new: None,
            }),
        }
    }

    /// Rowids that may have been deleted by the current frame batch: cached
    /// rows whose last-seen page is among the batch's pages for this table
    /// (or unknown) and whose rowid is absent from the batch's cell set.
    pub fn deletion_candidates(
        &self,
        table: &str,
        batch_pages: &BTreeSet<u32>,
        seen_rowids: &BTreeSet<i64>,
    ) -> Vec<i64> {
        let Some(snapshot) = self.tables.get(table) else {
            return Vec::new();
        };
        snapshot
            .rows
            .iter()
            .filter(|(rowid, cached)| {
                !seen_rowids.contains(rowid)
                    && (cached.page == PAGE_UNKNOWN || batch_pages.contains(&cached.page))
            })
            .map(|(rowid, _)| *rowid)
            .collect()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColumnSelection;
    use crate::schema::SchemaResolver;

    fn row(name: &str) -> Row {
        Row::from([("name".to_owned(), Value::Text(name.to_owned()))])
    }

    #[test]
    fn apply_follows_presence_rules() {
        let mut store = SnapshotStore::new();

        let m = store.apply("t", 1, Some((row("a"), 5))).unwrap();
        assert_eq!(m.kind, MutationKind::Insert);
        assert!(m.old.is_none());

        let m = store.apply("t", 1, Some((row("b"), 5))).unwrap();
        assert_eq!(m.kind, MutationKind::Update);
        assert_eq!(m.old.unwrap()["name"], Value::Text("a".into()));
        assert_eq!(store.get("t", 1).unwrap()["name"], Value::Text("b".into()));

        let m = store.apply("t", 1, None).unwrap();
        assert_eq!(m.kind, MutationKind::Delete);
        assert!(store.get("t", 1).is_none());

        // Tombstone for a rowid we never saw.
        assert!(store.apply("t", 1, None).is_none());
    }

    #[test]
    fn unchanged_page_image_rows_are_not_mutations() {
        let mut store = SnapshotStore::new();
        store.apply("t", 1, Some((row("a"), 5)));
        // The same row re-appearing in a later image of another page only
        // refreshes the location.
        assert!(store.apply("t", 1, Some((row("a"), 6))).is_none());
        assert_eq!(store.page_of("t", 1), Some(6));
    }

    #[test]
    fn snapshot_reflects_last_non_tombstone_mutation() {
        let mut store = SnapshotStore::new();
        store.apply("t", 9, Some((row("first"), 2)));
        store.apply("t", 9, Some((row("second"), 2)));
        store.apply("t", 9, Some((row("third"), 3)));
        assert_eq!(store.get("t", 9).unwrap()["name"], Value::Text("third".into()));
        assert_eq!(store.page_of("t", 9), Some(3));
    }

    #[test]
    fn deletion_candidates_respect_pages_and_seen_set() {
        let mut store = SnapshotStore::new();
        store.apply("t", 1, Some((row("a"), 5)));
        store.apply("t", 2, Some((row("b"), 5)));
        store.apply("t", 3, Some((row("c"), 6)));

        let pages = BTreeSet::from([5]);
        let seen = BTreeSet::from([1]);
        // Rowid 2 lived on page 5 and vanished; rowid 3 lives on an
        // untouched page.
        assert_eq!(store.deletion_candidates("t", &pages, &seen), vec![2]);
        assert!(store.deletion_candidates("missing", &pages, &seen).is_empty());
    }

    #[test]
    fn unknown_page_rows_are_always_candidates() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO t VALUES (1, 'a');",
        )
        .unwrap();
        let mut resolver = SchemaResolver::new();
        let schema = resolver.ensure_table(&conn, "t", &ColumnSelection::All).unwrap();

        let mut store = SnapshotStore::new();
        store.ensure_cached(&conn, schema).unwrap();
        assert_eq!(store.page_of("t", 1), Some(PAGE_UNKNOWN));

        let pages = BTreeSet::from([99]);
        let seen = BTreeSet::new();
        assert_eq!(store.deletion_candidates("t", &pages, &seen), vec![1]);
    }

    #[test]
    fn ensure_cached_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO t VALUES (1, 'a');",
        )
        .unwrap();
        let mut resolver = SchemaResolver::new();
        let schema = resolver.ensure_table(&conn, "t", &ColumnSelection::All).unwrap();

        let mut store = SnapshotStore::new();
        store.ensure_cached(&conn, schema).unwrap();
        store.apply("t", 1, Some((row("changed"), 4)));
        // Second call must not reload and clobber applied state.
        store.ensure_cached(&conn, schema).unwrap();
        assert_eq!(store.get("t", 1).unwrap()["name"], Value::Text("changed".into()));
    }
}
