//! Table descriptors and the root-page resolver.
//!
//! A table is described once, on first reference by a live query, from the
//! system catalog; the descriptor is never refreshed within a session.
//! Besides the root page recorded at introspection time, the resolver
//! learns page ownership from interior table pages observed in the WAL so
//! cells on non-root pages can still be attributed after a B-tree split.

use std::collections::BTreeMap;

use rusqlite::Connection;
use tracing::debug;

use crate::codec;
use crate::config::ColumnSelection;
use crate::error::{Error, Result};
use crate::value::{Row, Value};

/// Double-quote an identifier, doubling internal quotes.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Column type affinity, derived from the declared type per the sqlite
/// affinity rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Affinity {
    Integer,
    Text,
    Blob,
    Real,
    Numeric,
}

fn affinity_of(decl_type: &str) -> Affinity {
    let upper = decl_type.to_ascii_uppercase();
    if upper.contains("INT") {
        Affinity::Integer
    } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        Affinity::Text
    } else if upper.is_empty() || upper.contains("BLOB") {
        Affinity::Blob
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        Affinity::Real
    } else {
        Affinity::Numeric
    }
}

#[derive(Debug)]
pub(crate) struct ColumnInfo {
    pub name: String,
    #[allow(dead_code)]
    pub affinity: Affinity,
    /// Whether the column belongs to the cached subset.
    pub tracked: bool,
}

/// Descriptor of one tracked table.
#[derive(Debug)]
pub(crate) struct TableSchema {
    pub name: String,
    pub root_page: u32,
    pub columns: Vec<ColumnInfo>,
    /// Index of the column aliasing the rowid (single INTEGER PRIMARY KEY).
    /// Records store NULL there; the cell's rowid is the actual value.
    pub rowid_alias: Option<usize>,
}

impl TableSchema {
    fn introspect(conn: &Connection, name: &str, selection: &ColumnSelection) -> Result<TableSchema> {
        let wrap = |source| Error::CacheTableInfo {
            table: name.to_owned(),
            source,
        };

        let (root_page, sql): (i64, Option<String>) = conn
            .query_row(
                "SELECT rootpage, sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(wrap)?;
        let without_rowid = sql
            .as_deref()
            .map(|s| s.to_ascii_uppercase().contains("WITHOUT ROWID"))
            .unwrap_or(false);

        let mut columns = Vec::new();
        let mut pk_columns = Vec::new();
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(name)))
            .map_err(wrap)?;
        let mut rows = stmt.query([]).map_err(wrap)?;
        while let Some(row) = rows.next().map_err(wrap)? {
            let column_name: String = row.get(1).map_err(wrap)?;
            let decl_type: String = row.get(2).map_err(wrap)?;
            let pk: i64 = row.get(5).map_err(wrap)?;
            if pk != 0 {
                pk_columns.push((columns.len(), decl_type.clone()));
            }
            columns.push(ColumnInfo {
                tracked: selection.is_tracked(&column_name),
                affinity: affinity_of(&decl_type),
                name: column_name,
            });
        }

        let rowid_alias = match pk_columns.as_slice() {
            [(index, decl_type)]
                if decl_type.eq_ignore_ascii_case("INTEGER") && !without_rowid =>
            {
                Some(*index)
            }
            _ => None,
        };

        debug!(
            table = name,
            root_page,
            columns = columns.len(),
            tracked = columns.iter().filter(|c| c.tracked).count(),
            "introspected table"
        );
        Ok(TableSchema {
            name: name.to_owned(),
            root_page: root_page as u32,
            columns,
            rowid_alias,
        })
    }

    pub fn tracked_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.iter().filter(|c| c.tracked)
    }

    /// Quoted, comma-separated tracked column list for engine-built SQL.
    pub fn select_list(&self) -> String {
        self.tracked_columns()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Decode a record payload into a row holding the tracked columns.
    ///
    /// Untracked columns are skipped by advancing past their serial-type
    /// size. Records may carry fewer columns than the schema declares
    /// (ALTER TABLE ADD COLUMN); trailing tracked columns decode as NULL.
    pub fn decode_record(&self, rowid: i64, payload: &[u8]) -> Result<Row> {
        let header = codec::parse_record_header(payload)?;
        let mut offset = header.body_start;
        let mut row = Row::new();
        for (index, column) in self.columns.iter().enumerate() {
            let value = match header.serial_types.get(index) {
                Some(&serial_type) => {
                    let len = codec::serial_type_len(serial_type).ok_or_else(|| {
                        Error::ParseColumn {
                            table: self.name.clone(),
                            column: column.name.clone(),
                            detail: format!("reserved serial type {serial_type}"),
                        }
                    })? as usize;
                    let value = if column.tracked {
                        Some(
                            codec::decode_serial_value(serial_type, &payload[offset.min(payload.len())..])
                                .map_err(|detail| Error::ParseColumn {
                                    table: self.name.clone(),
                                    column: column.name.clone(),
                                    detail,
                                })?,
                        )
                    } else {
                        None
                    };
                    offset += len;
                    value
                }
                None => column.tracked.then_some(Value::Null),
            };
            if let Some(mut value) = value {
                if self.rowid_alias == Some(index) && value == Value::Null {
                    value = Value::Integer(rowid);
                }
                row.insert(column.name.clone(), value);
            }
        }
        Ok(row)
    }

    /// Re-read one row from the live database, for cells the WAL cannot be
    /// trusted on (overflow payloads, ambiguous deletions).
    pub fn fetch_row(&self, conn: &Connection, rowid: i64) -> Result<Option<Row>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE rowid = ?1",
            self.select_list(),
            quote_ident(&self.name)
        );
        let wrap = |source| Error::CacheTable {
            table: self.name.clone(),
            source,
        };
        let mut stmt = conn.prepare_cached(&sql).map_err(wrap)?;
        let mut rows = stmt.query([rowid]).map_err(wrap)?;
        match rows.next().map_err(wrap)? {
            Some(row) => {
                let mut out = Row::new();
                for (index, column) in self.tracked_columns().enumerate() {
                    let value = row.get_ref(index).map_err(wrap)?;
                    out.insert(column.name.clone(), Value::from_sql_ref(value));
                }
                Ok(Some(out))
            }
            None => Ok(None),
        }
    }
}

/// Maps tables to descriptors and page numbers to owning tables.
#[derive(Default)]
pub(crate) struct SchemaResolver {
    tables: BTreeMap<String, TableSchema>,
    pages: BTreeMap<u32, String>,
}

impl SchemaResolver {
    pub fn new() -> SchemaResolver {
        SchemaResolver::default()
    }

    /// Introspect `name` on first reference; later calls are lookups.
    pub fn ensure_table(
        &mut self,
        conn: &Connection,
        name: &str,
        selection: &ColumnSelection,
    ) -> Result<&TableSchema> {
        if !self.tables.contains_key(name) {
            let schema = TableSchema::introspect(conn, name, selection)?;
            self.pages.insert(schema.root_page, name.to_owned());
            self.tables.insert(name.to_owned(), schema);
        }
        Ok(&self.tables[name])
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    /// Which tracked table owns `page`, if attribution has seen it.
    pub fn table_for_page(&self, page: u32) -> Option<&str> {
        self.pages.get(&page).map(String::as_str)
    }

    /// Record that `page` belongs to `table`'s B-tree. Returns whether the
    /// page was newly attributed.
    pub fn attribute_page(&mut self, page: u32, table: &str) -> bool {
        match self.pages.entry(page) {
            std::collections::btree_map::Entry::Vacant(v) => {
                v.insert(table.to_owned());
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }
}
