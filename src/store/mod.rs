//! The embedded, versioned table store and the handle that owns it.
//!
//! Every table is a directory under the store root holding one SQLite
//! backing file. [`StoreHandle`] connects once (behind a time-boxed
//! preflight), bootstraps the required tables and recovers from corrupted or
//! hung tables by dropping and recreating them.

mod error;
mod ivf;
mod preflight;
mod schema;
mod table;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::lock::LockManager;
use crate::retry::RetryPolicy;
use crate::util::duration_millis;
use crate::vector::DEFAULT_EMBEDDING_DIM;

pub use error::StoreError;
pub use preflight::run_preflight;
pub use schema::MessageRow;
pub use table::{Row, Value};

#[cfg(test)]
pub use error::ErrorClass;
#[cfg(test)]
pub use preflight::InProcessProbe;

use preflight::{ChildProcessProbe, PreflightProbe};
use schema::{MESSAGES_TABLE, TableSpec, required_tables, table_spec};
#[cfg(test)]
use schema::CONVERSATIONS_TABLE;
use table::{BACKING_FILE, Table};
#[cfg(test)]
use table::ColumnType;

pub const DEFAULT_PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
    pub locks_dir: PathBuf,
    pub preflight_timeout: Duration,
    pub open_timeout: Duration,
    pub busy_timeout: Duration,
    pub dimensions: usize,
    /// Applied to preflight checks that fail because the store is busy.
    pub preflight_retry: RetryPolicy,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>, locks_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks_dir: locks_dir.into(),
            preflight_timeout: DEFAULT_PREFLIGHT_TIMEOUT,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            dimensions: DEFAULT_EMBEDDING_DIM,
            preflight_retry: RetryPolicy::default(),
        }
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    #[cfg(test)]
    pub fn with_preflight_retry(mut self, retry: RetryPolicy) -> Self {
        self.preflight_retry = retry;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnsureReport {
    pub created: Vec<String>,
    pub recreated: Vec<String>,
    /// Tables lost data; the caller must re-run extraction.
    pub resync_required: bool,
}

/// Owned connection context for the store. Tables are opened lazily and
/// cached until [`StoreHandle::reset`].
pub struct StoreHandle {
    config: StoreConfig,
    probe: Box<dyn PreflightProbe>,
    connected: bool,
    tables: HashMap<String, Table>,
    resync_required: bool,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("config", &self.config)
            .field("connected", &self.connected)
            .field("tables", &self.tables.keys().collect::<Vec<_>>())
            .field("resync_required", &self.resync_required)
            .finish()
    }
}

impl StoreHandle {
    pub fn new(config: StoreConfig, probe: Box<dyn PreflightProbe>) -> Self {
        Self {
            config,
            probe,
            connected: false,
            tables: HashMap::new(),
            resync_required: false,
        }
    }

    /// Handle whose preflight runs in a child process of this binary.
    pub fn with_child_probe(config: StoreConfig) -> Result<Self, StoreError> {
        Ok(Self::new(config, Box::new(ChildProcessProbe::current()?)))
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn resync_required(&self) -> bool {
        self.resync_required
    }

    /// Runs the preflight on first use and repairs the store directory if it
    /// fails. Later calls return immediately.
    ///
    /// A store that stays busy (locked by another writer) is not repaired:
    /// the transient error is returned and the next call tries again.
    pub fn connect(&mut self) -> Result<(), StoreError> {
        if self.connected {
            return Ok(());
        }

        fs::create_dir_all(&self.config.root).map_err(|err| {
            StoreError::from_io(err, &format!("create {}", self.config.root.display()))
        })?;

        match self.check_store() {
            Ok(tables) => {
                debug!(root = %self.config.root.display(), tables = tables.len(), "store preflight passed");
            }
            Err(err) if err.is_transient() => {
                warn!(root = %self.config.root.display(), error = %err, "store busy during preflight; leaving it untouched");
                return Err(err);
            }
            Err(err) => {
                warn!(root = %self.config.root.display(), error = %err, "store preflight failed; repairing");
                self.repair_after_failed_preflight()?;
            }
        }

        self.connected = true;
        Ok(())
    }

    fn check_store(&self) -> Result<Vec<String>, StoreError> {
        self.config.preflight_retry.run("preflight", || {
            self.probe
                .check_store(&self.config.root, self.config.preflight_timeout)
        })
    }

    fn repair_after_failed_preflight(&mut self) -> Result<(), StoreError> {
        match LockManager::new(&self.config.locks_dir).sweep() {
            Ok(removed) if !removed.is_empty() => {
                info!(locks = ?removed, "removed stale locks during store repair");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "failed to sweep stale locks"),
        }

        for name in preflight::list_table_dirs(&self.config.root)? {
            let dir = self.config.root.join(&name);
            let damaged = if !dir.join(BACKING_FILE).is_file() {
                true
            } else {
                match self
                    .probe
                    .check_table(&self.config.root, &name, self.config.preflight_timeout)
                {
                    Ok(()) => false,
                    Err(err) => !err.is_transient(),
                }
            };
            if damaged {
                warn!(table = %name, "removing corrupted table directory");
                remove_dir_if_exists(&dir)?;
                self.resync_required = true;
            }
        }

        match self.check_store() {
            Ok(_) => Ok(()),
            Err(err) if err.is_transient() => {
                warn!(error = %err, "store busy after repair; keeping remaining tables");
                Err(err)
            }
            Err(err) => {
                warn!(error = %err, "store still failing preflight; recreating it empty");
                self.reset_store()
            }
        }
    }

    /// Opens or creates every required table.
    pub fn ensure_tables(&mut self) -> Result<EnsureReport, StoreError> {
        self.connect()?;

        let mut report = EnsureReport::default();
        // A recovery that drops every table empties the cache, so go round again.
        for _ in 0..3 {
            let missing = required_tables()
                .into_iter()
                .filter(|spec| !self.tables.contains_key(spec.name))
                .collect::<Vec<TableSpec>>();
            if missing.is_empty() {
                break;
            }
            for spec in missing {
                if self.tables.contains_key(spec.name) {
                    continue;
                }
                let table = self.open_or_create(spec, &mut report)?;
                self.tables.insert(spec.name.to_string(), table);
            }
        }

        report.resync_required = self.resync_required;
        Ok(report)
    }

    pub fn table(&mut self, name: &str) -> Result<&mut Table, StoreError> {
        if !self.tables.contains_key(name) {
            self.connect()?;
            let spec = table_spec(name)
                .ok_or_else(|| StoreError::Fatal(format!("unknown table {name}")))?;
            let mut report = EnsureReport::default();
            let table = self.open_or_create(spec, &mut report)?;
            self.tables.insert(name.to_string(), table);
        }

        self.tables
            .get_mut(name)
            .ok_or_else(|| StoreError::Fatal(format!("table {name} is not cached")))
    }

    pub fn messages(&mut self) -> Result<&mut Table, StoreError> {
        self.table(MESSAGES_TABLE)
    }

    /// Drops `table` (every table when `None`) from disk and from the cache.
    /// The next accessor call recreates it empty.
    pub fn recover_table(&mut self, table: Option<&str>) -> Result<Vec<String>, StoreError> {
        let targets = match table {
            Some(name) => vec![name.to_string()],
            None => {
                let mut names = preflight::list_table_dirs(&self.config.root)?;
                for spec in required_tables() {
                    if !names.iter().any(|name| name == spec.name) {
                        names.push(spec.name.to_string());
                    }
                }
                names
            }
        };

        for name in &targets {
            self.tables.remove(name);
            remove_dir_if_exists(&self.config.root.join(name))?;
            warn!(table = %name, "dropped table for recovery; resync required");
        }
        self.resync_required = true;
        Ok(targets)
    }

    /// Deletes the whole store directory and recreates it empty.
    pub fn reset_store(&mut self) -> Result<(), StoreError> {
        self.tables.clear();
        remove_dir_if_exists(&self.config.root)?;
        fs::create_dir_all(&self.config.root).map_err(|err| {
            StoreError::from_io(err, &format!("create {}", self.config.root.display()))
        })?;
        self.resync_required = true;
        warn!(root = %self.config.root.display(), "store directory reset");
        Ok(())
    }

    /// Forgets cached tables and connection state; the next call reconnects.
    #[cfg(test)]
    pub fn reset(&mut self) {
        self.tables.clear();
        self.connected = false;
        self.resync_required = false;
    }

    fn open_or_create(
        &mut self,
        spec: TableSpec,
        report: &mut EnsureReport,
    ) -> Result<Table, StoreError> {
        let dir = self.config.root.join(spec.name);
        if !dir.exists() {
            let table = self.create_time_boxed(spec)?;
            info!(table = spec.name, "created table");
            report.created.push(spec.name.to_string());
            return Ok(table);
        }

        match self.open_time_boxed(spec.name) {
            Ok(table) => Ok(table),
            Err(StoreError::Corrupted { table, detail }) => {
                warn!(table = spec.name, detail = %detail, "table is corrupted; recreating");
                let known = table.as_deref().and_then(table_spec).map(|found| found.name);
                self.recover_table(known)?;
                let created = self.create_time_boxed(spec)?;
                report.recreated.push(spec.name.to_string());
                Ok(created)
            }
            Err(StoreError::Timeout { elapsed_ms, .. }) => {
                warn!(table = spec.name, elapsed_ms, "table open timed out; recreating");
                self.recover_table(Some(spec.name))?;
                let created = match self.create_time_boxed(spec) {
                    Ok(created) => created,
                    Err(StoreError::Timeout { .. }) => {
                        self.reset_store()?;
                        self.create_time_boxed(spec)?
                    }
                    Err(err) => return Err(err),
                };
                report.recreated.push(spec.name.to_string());
                Ok(created)
            }
            Err(err) => Err(err),
        }
    }

    fn open_time_boxed(&self, name: &str) -> Result<Table, StoreError> {
        let dir = self.config.root.join(name);
        let busy_timeout = self.config.busy_timeout;
        let owned = name.to_string();
        time_boxed("open table", name, self.config.open_timeout, move || {
            Table::open(&dir, &owned, busy_timeout)
        })
    }

    fn create_time_boxed(&self, spec: TableSpec) -> Result<Table, StoreError> {
        let dir = self.config.root.join(spec.name);
        let busy_timeout = self.config.busy_timeout;
        let seed = (spec.seed)(self.config.dimensions);
        time_boxed("create table", spec.name, self.config.open_timeout, move || {
            Table::create(&dir, spec.name, spec.key, &seed, busy_timeout)
        })
    }
}

fn time_boxed<F>(operation: &str, table: &str, timeout: Duration, work: F) -> Result<Table, StoreError>
where
    F: FnOnce() -> Result<Table, StoreError> + Send + 'static,
{
    let started = Instant::now();
    let (sender, receiver) = mpsc::channel();
    thread::Builder::new()
        .name(format!("store-{table}"))
        .spawn(move || {
            let _ = sender.send(work());
        })
        .map_err(|err| StoreError::from_io(err, "spawn store worker"))?;

    match receiver.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(StoreError::timeout(
            operation,
            Some(table),
            duration_millis(started.elapsed()),
        )),
        Err(RecvTimeoutError::Disconnected) => Err(StoreError::Fatal(format!(
            "{operation} for {table} stopped without a result"
        ))),
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::from_io(err, &format!("remove {}", path.display()))),
    }
}
