use thiserror::Error;

/// Errors surfaced by the live-query engine.
///
/// Schema and cache errors are returned synchronously from
/// [`Database::select`](crate::database::Database::select); errors hit during
/// WAL observation are delivered to the handle's
/// [`ErrorObserver`](crate::database::ErrorObserver) while the engine keeps
/// running; errors during a single query's re-execution go to that query's
/// [`QueryObserver`](crate::query::QueryObserver) without disturbing siblings.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to introspect table '{table}': {source}")]
    CacheTableInfo {
        table: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to materialize cache for table '{table}': {source}")]
    CacheTable {
        table: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to read WAL file: {0}")]
    WalProcess(#[from] std::io::Error),
    #[error("corrupt WAL frame: {0}")]
    WalParse(String),
    #[error("failed to decode column '{column}' of table '{table}': {detail}")]
    ParseColumn {
        table: String,
        column: String,
        detail: String,
    },
    #[error("query execution failed: {0}")]
    QueryExecution(#[source] rusqlite::Error),
    #[error("key selector produced a duplicate key within one result set")]
    DuplicateKey,
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to create background thread: {0}")]
    Thread(std::io::Error),
    #[error("engine has been shut down")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
