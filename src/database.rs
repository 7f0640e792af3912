//! The database handle and the engine thread behind it.
//!
//! All engine state (the primary connection, the read pool, the schema
//! resolver, the snapshot store, the query registry and the scheduler) is
//! owned by a single executor thread draining a command channel. The WAL
//! watcher thread and the handle only post commands; they never touch
//! shared state directly. Replies travel over `oneshot` channels.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::RwLock;
use rusqlite::{Connection, OpenFlags};
use slotmap::{new_key_type, SlotMap};
use tracing::{debug, error, warn};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::query::{diff_results, KeySelector, QueryObserver, Trigger};
use crate::scheduler::UpdateScheduler;
use crate::schema::SchemaResolver;
use crate::snapshot::{Mutation, MutationKind, SnapshotStore, PAGE_UNKNOWN};
use crate::value::{Row, Value};
use crate::wal::{decode_frames, FrameBatch, RowImage, WalObserver};

new_key_type! {
    /// Registry handle for a live query.
    pub struct LiveQueryKey;
}

/// Receives engine-level errors hit during WAL observation. Query-specific
/// failures go to the query's own observer instead.
pub trait ErrorObserver: Send {
    fn on_error(&self, error: &Error);
}

/// A live-query engine over one sqlite database.
///
/// Opening the handle spawns the executor thread and the WAL watcher
/// thread; [`Database::close`] (or dropping the handle) shuts both down.
pub struct Database {
    sender: Sender<Command>,
    executor: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    stop_watch: Arc<AtomicBool>,
}

/// Handle to one registered live query.
///
/// The registry entry is owned by the engine; this handle carries only the
/// registry key and a shared view of the last result, so dropping it does
/// not stop the query; call [`LiveQuery::stop`] for that.
#[derive(Debug)]
pub struct LiveQuery {
    key: LiveQueryKey,
    sender: Sender<Command>,
    rows: Arc<RwLock<Vec<Row>>>,
}

impl LiveQuery {
    /// The most recently emitted result.
    pub fn rows(&self) -> Vec<Row> {
        self.rows.read().clone()
    }

    /// Deregister the query. The observer receives no further events.
    pub fn stop(&self) -> Result<()> {
        self.sender
            .send(Command::Stop(self.key))
            .map_err(|_| Error::Closed)
    }
}

struct Registration {
    sql: String,
    params: Vec<Value>,
    selector: KeySelector,
    triggers: Vec<Trigger>,
    observer: Box<dyn QueryObserver>,
}

type SelectReply = Result<(LiveQueryKey, Arc<RwLock<Vec<Row>>>)>;

enum Command {
    Select(Registration, oneshot::Sender<SelectReply>),
    Stop(LiveQueryKey),
    WalChanged,
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    SetErrorObserver(Box<dyn ErrorObserver>),
    Shutdown(oneshot::Sender<()>),
}

impl Database {
    /// Open `options.path`, switch it to WAL journaling and start the
    /// engine. Returns once initial setup has completed.
    pub fn open(options: Options) -> Result<Database> {
        let conn = Connection::open(&options.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            return Err(Error::Config(format!(
                "database at {} uses journal mode '{mode}', WAL is required",
                options.path.display()
            )));
        }
        let page_size: u32 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        let mut pool = Vec::new();
        for _ in 0..options.pool.unwrap_or(0) {
            let reader = Connection::open_with_flags(
                &options.path,
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            reader.busy_timeout(Duration::from_secs(5))?;
            pool.push(reader);
        }

        let wal_path = wal_path_of(&options.path);
        let mut wal = WalObserver::new(wal_path.clone(), page_size);
        wal.seek_to_end()?;

        let (sender, receiver) = std::sync::mpsc::channel();
        let engine = Engine {
            conn,
            pool,
            next_pool: 0,
            page_size,
            resolver: SchemaResolver::new(),
            snapshots: SnapshotStore::new(),
            queries: SlotMap::with_key(),
            by_table: BTreeMap::new(),
            scheduler: UpdateScheduler::new(options.min_interval),
            wal,
            options,
            error_observer: None,
            paused: false,
            halted: false,
        };
        let watch_interval = engine.options.watch_interval;
        let executor = std::thread::Builder::new()
            .name("sqlite_livequery".into())
            .spawn(move || engine.run(receiver))
            .map_err(Error::Thread)?;

        let stop_watch = Arc::new(AtomicBool::new(false));
        let watcher = spawn_wal_watcher(
            wal_path,
            watch_interval,
            sender.clone(),
            Arc::clone(&stop_watch),
        )?;

        debug!("live-query engine ready");
        Ok(Database {
            sender,
            executor: Some(executor),
            watcher: Some(watcher),
            stop_watch,
        })
    }

    /// Register a live `SELECT`.
    ///
    /// The statement runs once immediately; a non-empty initial result is
    /// delivered to `observer` as an all-`added` update. Afterwards the
    /// query re-executes whenever a trigger fires, and every non-empty
    /// diff is emitted.
    ///
    /// # Errors
    ///
    /// Schema introspection, cache materialization and initial-execution
    /// failures surface here and the query is not registered.
    pub fn select(
        &self,
        sql: impl Into<String>,
        params: Vec<Value>,
        selector: KeySelector,
        triggers: Vec<Trigger>,
        observer: Box<dyn QueryObserver>,
    ) -> Result<LiveQuery> {
        let (reply, response) = oneshot::channel();
        let registration = Registration {
            sql: sql.into(),
            params,
            selector,
            triggers,
            observer,
        };
        self.sender
            .send(Command::Select(registration, reply))
            .map_err(|_| Error::Closed)?;
        let (key, rows) = response.recv().map_err(|_| Error::Closed)??;
        Ok(LiveQuery {
            key,
            sender: self.sender.clone(),
            rows,
        })
    }

    /// Suppress WAL processing passes. In-flight work completes; queued
    /// invalidations are kept.
    pub fn pause(&self) -> Result<()> {
        self.roundtrip(Command::Pause)
    }

    /// Resume WAL processing and catch up on growth accumulated while
    /// paused.
    pub fn resume(&self) -> Result<()> {
        self.roundtrip(Command::Resume)
    }

    /// Register the receiver for engine-level WAL errors.
    pub fn set_error_observer(&self, observer: Box<dyn ErrorObserver>) -> Result<()> {
        self.sender
            .send(Command::SetErrorObserver(observer))
            .map_err(|_| Error::Closed)
    }

    /// Shut the engine down: stop both threads, close every connection and
    /// drop all registrations and snapshots.
    pub fn close(mut self) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    fn roundtrip(&self, command: impl FnOnce(oneshot::Sender<()>) -> Command) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(command(reply))
            .map_err(|_| Error::Closed)?;
        response.recv().map_err(|_| Error::Closed)
    }

    fn shutdown(&mut self) {
        self.stop_watch.store(true, Ordering::Relaxed);
        if let Some(handle) = self.watcher.take() {
            let _ = handle.join();
        }
        let (reply, response) = oneshot::channel();
        if self.sender.send(Command::Shutdown(reply)).is_ok() {
            let _ = response.recv();
        }
        if let Some(handle) = self.executor.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The WAL file sqlite maintains next to a database file.
fn wal_path_of(database: &Path) -> PathBuf {
    let mut path = database.as_os_str().to_os_string();
    path.push("-wal");
    PathBuf::from(path)
}

fn stat(path: &Path) -> Option<(u64, Option<SystemTime>)> {
    std::fs::metadata(path)
        .ok()
        .map(|meta| (meta.len(), meta.modified().ok()))
}

/// Dedicated I/O thread: stats the WAL path on a fixed cadence and posts a
/// change notification whenever size or mtime moved.
fn spawn_wal_watcher(
    path: PathBuf,
    interval: Duration,
    sender: Sender<Command>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("sqlite_livequery_wal".into())
        .spawn(move || {
            // Start unknown so a write racing engine startup still produces
            // one notification.
            let mut last = None;
            while !stop.load(Ordering::Relaxed) {
                let current = Some(stat(&path));
                if current != last {
                    last = current;
                    if sender.send(Command::WalChanged).is_err() {
                        return;
                    }
                }
                std::thread::sleep(interval);
            }
        })
        .map_err(Error::Thread)
}

struct QueryState {
    sql: String,
    params: Vec<Value>,
    selector: KeySelector,
    triggers: Vec<Trigger>,
    observer: Box<dyn QueryObserver>,
    last_result: Option<Vec<Row>>,
    shared_rows: Arc<RwLock<Vec<Row>>>,
    /// Columns hidden from results because the column cache of a trigger
    /// table does not track them.
    excluded_columns: Vec<String>,
}

struct Engine {
    conn: Connection,
    pool: Vec<Connection>,
    next_pool: usize,
    page_size: u32,
    resolver: SchemaResolver,
    snapshots: SnapshotStore,
    queries: SlotMap<LiveQueryKey, QueryState>,
    by_table: BTreeMap<String, Vec<LiveQueryKey>>,
    scheduler: UpdateScheduler,
    wal: WalObserver,
    options: Options,
    error_observer: Option<Box<dyn ErrorObserver>>,
    paused: bool,
    /// Set when WAL processing cannot resynchronize; cleared by resume.
    halted: bool,
}

impl Engine {
    fn run(mut self, receiver: Receiver<Command>) {
        loop {
            let timeout = if self.paused {
                None
            } else {
                self.scheduler.until_deadline(Instant::now())
            };
            let command = match timeout {
                Some(timeout) => match receiver.recv_timeout(timeout) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match receiver.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                },
            };

            match command {
                Some(Command::Select(registration, reply)) => match self.register(registration) {
                    Ok((key, rows)) => {
                        if reply.send(Ok((key, rows))).is_err() {
                            error!("select caller went away, dropping the new query");
                            self.stop_query(key);
                        }
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                },
                Some(Command::Stop(key)) => self.stop_query(key),
                Some(Command::WalChanged) => self.on_wal_changed(),
                Some(Command::Pause(reply)) => {
                    self.paused = true;
                    self.scheduler.suspend();
                    let _ = reply.send(());
                }
                Some(Command::Resume(reply)) => {
                    self.paused = false;
                    self.halted = false;
                    let _ = reply.send(());
                    self.on_wal_changed();
                }
                Some(Command::SetErrorObserver(observer)) => {
                    self.error_observer = Some(observer);
                }
                Some(Command::Shutdown(reply)) => {
                    self.queries.clear();
                    self.by_table.clear();
                    self.snapshots.clear();
                    debug!("engine shut down");
                    let _ = reply.send(());
                    break;
                }
                None => {
                    if !self.paused && self.scheduler.is_due(Instant::now()) {
                        self.run_pass();
                    }
                }
            }
        }
    }

    fn register(&mut self, registration: Registration) -> Result<(LiveQueryKey, Arc<RwLock<Vec<Row>>>)> {
        let mut excluded = Vec::new();
        let mut tables = Vec::new();
        for trigger in &registration.triggers {
            if !tables.contains(&trigger.table) {
                tables.push(trigger.table.clone());
            }
            let selection = self.options.selection_for(&trigger.table);
            let schema = self
                .resolver
                .ensure_table(&self.conn, &trigger.table, &selection)?;
            self.snapshots.ensure_cached(&self.conn, schema)?;
            for column in &schema.columns {
                if !column.tracked && !excluded.contains(&column.name) {
                    excluded.push(column.name.clone());
                }
            }
        }

        let shared_rows = Arc::new(RwLock::new(Vec::new()));
        let key = self.queries.insert(QueryState {
            sql: registration.sql,
            params: registration.params,
            selector: registration.selector,
            triggers: registration.triggers,
            observer: registration.observer,
            last_result: None,
            shared_rows: Arc::clone(&shared_rows),
            excluded_columns: excluded,
        });
        for table in tables {
            self.by_table.entry(table).or_default().push(key);
        }

        if let Err(e) = self.initial_execute(key) {
            self.stop_query(key);
            return Err(e);
        }
        self.scheduler.touch(Instant::now());
        debug!(queries = self.queries.len(), "registered live query");
        Ok((key, shared_rows))
    }

    fn initial_execute(&mut self, key: LiveQueryKey) -> Result<()> {
        let rows = self.run_query(key)?;
        let state = self.queries.get_mut(key).ok_or(Error::Closed)?;
        let diff = diff_results(None, &rows, &state.selector)?;
        state.last_result = Some(rows.clone());
        *state.shared_rows.write() = rows.clone();
        if !diff.is_empty() {
            state.observer.on_update(&diff, &rows);
        }
        Ok(())
    }

    fn stop_query(&mut self, key: LiveQueryKey) {
        if let Some(state) = self.queries.remove(key) {
            for trigger in &state.triggers {
                if let Some(keys) = self.by_table.get_mut(&trigger.table) {
                    keys.retain(|existing| *existing != key);
                }
            }
            self.scheduler.remove(key);
            debug!(queries = self.queries.len(), "stopped live query");
        }
    }

    fn on_wal_changed(&mut self) {
        if self.paused || self.halted {
            return;
        }
        if self.scheduler.request_pass(Instant::now()) {
            self.run_pass();
        }
    }

    /// One processing pass: read and decode new WAL frames, apply the batch
    /// to the snapshots, fan invalidations out, then re-execute the queued
    /// queries.
    fn run_pass(&mut self) {
        if self.scheduler.begin_pass(Instant::now()) {
            self.process_wal();
        }
        for key in self.scheduler.take_queued() {
            self.refresh_query(key);
        }
    }

    fn process_wal(&mut self) {
        let frames = match self.wal.read_new_frames() {
            Ok(frames) => frames,
            Err(e @ Error::WalParse(_)) => {
                // Cannot resynchronize; stay down until an explicit resume.
                self.halted = true;
                error!(error = %e, "WAL processing halted");
                self.emit_engine_error(&e);
                return;
            }
            Err(e) => {
                self.emit_engine_error(&e);
                return;
            }
        };
        if frames.is_empty() {
            return;
        }
        let batch = decode_frames(&frames, &mut self.resolver, self.page_size);
        for e in &batch.errors {
            self.emit_engine_error(e);
        }
        let mutations = self.apply_batch(batch);
        if !mutations.is_empty() {
            self.fan_out(&mutations);
        }
    }

    /// Apply a decoded batch against the snapshots: row images first, in
    /// frame order, then inferred deletions. Trigger fan-out happens only
    /// after the whole batch is applied, so predicates observe a coherent
    /// post-batch state.
    fn apply_batch(&mut self, batch: FrameBatch) -> Vec<Mutation> {
        let FrameBatch {
            changes,
            touched,
            ambiguous,
            ..
        } = batch;

        let mut mutations = Vec::new();
        for change in changes {
            let row = match change.image {
                RowImage::Decoded(row) => Some(row),
                RowImage::NeedsRefetch => match self.refetch(&change.table, change.rowid) {
                    Ok(row) => row,
                    Err(e) => {
                        self.emit_engine_error(&e);
                        continue;
                    }
                },
            };
            let Some(row) = row else { continue };
            if let Some(mutation) =
                self.snapshots
                    .apply(&change.table, change.rowid, Some((row, change.page)))
            {
                mutations.push(mutation);
            }
        }

        for (table, touch) in &touched {
            for rowid in self
                .snapshots
                .deletion_candidates(table, &touch.pages, &touch.seen_rowids)
            {
                // Trust page absence only when every page of the batch was
                // attributed and the row's own location is known; otherwise
                // the live database decides.
                let verify =
                    ambiguous || self.snapshots.page_of(table, rowid) == Some(PAGE_UNKNOWN);
                let change = if verify {
                    match self.refetch(table, rowid) {
                        Ok(Some(row)) => Some((row, PAGE_UNKNOWN)),
                        Ok(None) => None,
                        Err(e) => {
                            self.emit_engine_error(&e);
                            continue;
                        }
                    }
                } else {
                    None
                };
                if let Some(mutation) = self.snapshots.apply(table, rowid, change) {
                    mutations.push(mutation);
                }
            }
        }
        mutations
    }

    fn fan_out(&mut self, mutations: &[Mutation]) {
        for mutation in mutations {
            let Some(keys) = self.by_table.get(&mutation.table) else {
                continue;
            };
            let keys = keys.clone();
            let deleted = mutation.kind == MutationKind::Delete;
            for key in keys {
                let Some(state) = self.queries.get(key) else {
                    continue;
                };
                if self.scheduler.is_queued(key) && !self.options.check_condition_when_queued {
                    continue;
                }
                let fires = state
                    .triggers
                    .iter()
                    .filter(|trigger| trigger.table == mutation.table)
                    .any(|trigger| match &trigger.condition {
                        Some(condition) => {
                            condition(mutation.new.as_ref(), mutation.old.as_ref(), deleted)
                        }
                        None => true,
                    });
                if fires {
                    self.scheduler.enqueue(key);
                }
            }
        }
    }

    /// Re-execute one queued query, diff against its last emitted result
    /// and emit the update when anything changed.
    fn refresh_query(&mut self, key: LiveQueryKey) {
        let rows = match self.run_query(key) {
            Ok(rows) => rows,
            Err(Error::Closed) => return,
            Err(e) => {
                if let Some(state) = self.queries.get(key) {
                    warn!(error = %e, "live query re-execution failed");
                    state.observer.on_error(&e);
                }
                return;
            }
        };
        let Some(state) = self.queries.get_mut(key) else {
            return;
        };
        let diff = match diff_results(state.last_result.as_deref(), &rows, &state.selector) {
            Ok(diff) => diff,
            Err(e) => {
                state.observer.on_error(&e);
                return;
            }
        };
        state.last_result = Some(rows.clone());
        if diff.is_empty() {
            return;
        }
        *state.shared_rows.write() = rows.clone();
        state.observer.on_update(&diff, &rows);
    }

    fn run_query(&mut self, key: LiveQueryKey) -> Result<Vec<Row>> {
        let pool_index = if self.pool.is_empty() {
            None
        } else {
            let index = self.next_pool % self.pool.len();
            self.next_pool = self.next_pool.wrapping_add(1);
            Some(index)
        };
        let connection = match pool_index {
            Some(index) => &self.pool[index],
            None => &self.conn,
        };
        let state = self.queries.get(key).ok_or(Error::Closed)?;
        execute_select(connection, state)
    }

    fn refetch(&self, table: &str, rowid: i64) -> Result<Option<Row>> {
        match self.resolver.table(table) {
            Some(schema) => schema.fetch_row(&self.conn, rowid),
            None => Ok(None),
        }
    }

    fn emit_engine_error(&self, error: &Error) {
        error!(error = %error, "WAL processing error");
        if let Some(observer) = &self.error_observer {
            observer.on_error(error);
        }
    }
}

fn execute_select(conn: &Connection, state: &QueryState) -> Result<Vec<Row>> {
    let mut stmt = conn
        .prepare_cached(&state.sql)
        .map_err(Error::QueryExecution)?;
    let column_names: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(str::to_owned)
        .collect();
    let mut rows = stmt
        .query(rusqlite::params_from_iter(state.params.iter()))
        .map_err(Error::QueryExecution)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(Error::QueryExecution)? {
        let mut converted = Row::new();
        for (index, name) in column_names.iter().enumerate() {
            if state.excluded_columns.iter().any(|excluded| excluded == name) {
                continue;
            }
            let value = row.get_ref(index).map_err(Error::QueryExecution)?;
            converted.insert(name.clone(), Value::from_sql_ref(value));
        }
        out.push(converted);
    }
    Ok(out)
}
