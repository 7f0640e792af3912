//! Engine configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Number of read-only connections opened when the pool is enabled without
/// an explicit size.
pub const DEFAULT_POOL_SIZE: usize = 5;

/// Which columns of a table the engine caches and compares.
///
/// Non-cached columns are never decoded from WAL frames, never stored in
/// snapshots and never part of emitted rows or diff comparison.
#[derive(Debug, Clone, Default)]
pub enum ColumnSelection {
    /// Cache every column.
    #[default]
    All,
    /// Cache only the listed columns.
    Include(Vec<String>),
    /// Cache everything except the listed columns.
    Exclude(Vec<String>),
}

impl ColumnSelection {
    /// Whether `column` belongs to the cached subset.
    pub fn is_tracked(&self, column: &str) -> bool {
        match self {
            ColumnSelection::All => true,
            ColumnSelection::Include(columns) => columns.iter().any(|c| c == column),
            ColumnSelection::Exclude(columns) => !columns.iter().any(|c| c == column),
        }
    }
}

/// Settings for [`Database::open`](crate::database::Database::open).
#[derive(Debug, Clone)]
pub struct Options {
    /// Path to the database file. The WAL file is `<path>-wal`.
    pub path: PathBuf,
    /// Read-only connection pool for query execution. `None` executes
    /// queries on the primary connection.
    pub pool: Option<usize>,
    /// Minimum interval between successive processing passes. Invalidations
    /// arriving earlier are coalesced into one deferred pass.
    pub min_interval: Duration,
    /// Re-evaluate trigger predicates for every mutation even when the
    /// query is already queued for re-execution.
    pub check_condition_when_queued: bool,
    /// Per-table cached-column subsets. Tables without an entry cache all
    /// columns.
    pub column_cache: BTreeMap<String, ColumnSelection>,
    /// Cadence of the WAL file watcher thread.
    pub watch_interval: Duration,
}

impl Options {
    pub fn new(path: impl Into<PathBuf>) -> Options {
        Options {
            path: path.into(),
            pool: None,
            min_interval: Duration::from_millis(200),
            check_condition_when_queued: false,
            column_cache: BTreeMap::new(),
            watch_interval: Duration::from_millis(25),
        }
    }

    /// Enable the read pool with the default size.
    #[must_use]
    pub fn with_pool(mut self) -> Options {
        self.pool = Some(DEFAULT_POOL_SIZE);
        self
    }

    #[must_use]
    pub fn with_min_interval(mut self, interval: Duration) -> Options {
        self.min_interval = interval;
        self
    }

    #[must_use]
    pub fn with_column_cache(mut self, table: impl Into<String>, selection: ColumnSelection) -> Options {
        self.column_cache.insert(table.into(), selection);
        self
    }

    pub(crate) fn selection_for(&self, table: &str) -> ColumnSelection {
        self.column_cache.get(table).cloned().unwrap_or_default()
    }
}
