//! This crate provides live `SELECT` queries over a sqlite database. Clients
//! register a statement together with change triggers; the engine watches
//! the database's Write-Ahead Log, decodes the appended frames into
//! row-level mutations for the tables the queries depend on, and emits diff
//! events describing which result rows were added, changed or removed.
//! Emission is driven by actual data mutations observed in the WAL, not by
//! re-running queries on a timer.
//!
//! # Basic example
//!
//! ```no_run
//! use sqlite_livequery::{Database, Diff, KeySelector, Options, QueryObserver, Row, Trigger};
//!
//! struct Printer;
//!
//! impl QueryObserver for Printer {
//!     fn on_update(&self, diff: &Diff, rows: &[Row]) {
//!         println!(
//!             "{} added, {} changed, {} removed ({} rows total)",
//!             diff.added.len(),
//!             diff.changed.len(),
//!             diff.removed.len(),
//!             rows.len()
//!         );
//!     }
//! }
//!
//! fn main() -> sqlite_livequery::Result<()> {
//!     let db = Database::open(Options::new("app.sqlite3"))?;
//!     let query = db.select(
//!         "SELECT * FROM players WHERE id = ?1",
//!         vec![11.into()],
//!         KeySelector::columns(["id"]),
//!         vec![Trigger::on("players")],
//!         Box::new(Printer),
//!     )?;
//!     // The observer fires as writers mutate `players`.
//!     query.stop()?;
//!     db.close()
//! }
//! ```
//!
//! # How it works
//!
//! The database is switched to WAL journaling, so every committed write
//! appends page images to the `<database>-wal` file. A watcher thread stats
//! that file on a short cadence; when it grows, the engine reads the new
//! frames, decodes the table B-tree leaf pages belonging to tracked tables
//! and compares the cells against an in-memory, rowid-keyed snapshot of
//! each table. The comparison yields typed insert/update/delete mutations;
//! deletions are inferred from rowids that vanish from a page image.
//!
//! Mutations fan out to the live queries whose triggers mention the table.
//! A trigger may carry a predicate over `(new row, old row, was_deleted)`
//! to skip re-execution when a mutation cannot affect the result.
//! Invalidated queries re-execute, coalesced and rate-limited by
//! [`Options::min_interval`], and each result is diffed by key against the
//! previously emitted one.
//!
//! Because changes are read from the WAL file itself, writers do not need
//! to share the process with the engine: any connection writing the same
//! database file is observed.
//!
//! # Change granularity
//!
//! Updates are row-level. The cached column subset is configurable per
//! table ([`ColumnSelection`]); columns outside the subset are never
//! decoded, cached, compared or emitted. A text value that parses as JSON
//! is replaced by its parsed structure in snapshots, predicate inputs and
//! emitted rows.
//!
//! # Limitations
//!
//! Only table B-tree leaf pages are mined; index pages are skipped, so the
//! engine never learns anything a covering index would tell it. Rows whose
//! payload spills onto overflow pages, and deletions that cannot be
//! attributed with certainty, are re-read from the live database instead
//! of decoded from the WAL. `WITHOUT ROWID` tables are not supported; the
//! snapshot model is keyed by rowid. Schema changes to tracked tables while
//! the engine runs are not picked up.

mod codec;
pub mod config;
pub mod database;
pub mod error;
pub mod query;
mod scheduler;
mod schema;
mod snapshot;
pub mod value;
mod wal;

pub use config::{ColumnSelection, Options};
pub use database::{Database, ErrorObserver, LiveQuery};
pub use error::{Error, Result};
pub use query::{Diff, KeySelector, QueryObserver, Trigger, TriggerCondition};
pub use value::{Row, Value};
