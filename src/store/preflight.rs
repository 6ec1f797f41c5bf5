use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{ErrorClass, StoreError};
use super::table::Table;
use crate::util::duration_millis;

const PROBE_POLL_INTERVAL: Duration = Duration::from_millis(25);
const PROBE_BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// Opens the store (or one table) somewhere the caller cannot get stuck on.
pub trait PreflightProbe: Send + Sync {
    /// Lists the tables of the store at `root`.
    fn check_store(&self, root: &Path, timeout: Duration) -> Result<Vec<String>, StoreError>;

    fn check_table(&self, root: &Path, table: &str, timeout: Duration) -> Result<(), StoreError>;
}

/// One JSON line printed by the `preflight` subcommand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightOutcome {
    pub ok: bool,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl PreflightOutcome {
    fn success(tables: Vec<String>) -> Self {
        Self {
            ok: true,
            tables,
            table: None,
            kind: None,
            detail: None,
        }
    }

    fn failure(err: &StoreError) -> Self {
        let (kind, table) = match err.class() {
            ErrorClass::Transient => ("transient", None),
            ErrorClass::Corrupted(table) => ("corrupted", table),
            ErrorClass::Timeout(table) => ("timeout", table),
            ErrorClass::Fatal => ("fatal", None),
        };
        Self {
            ok: false,
            tables: Vec::new(),
            table,
            kind: Some(kind.to_string()),
            detail: Some(err.to_string()),
        }
    }

    pub fn into_result(self) -> Result<Vec<String>, StoreError> {
        if self.ok {
            return Ok(self.tables);
        }

        let detail = self.detail.unwrap_or_else(|| "preflight failed".to_string());
        Err(match self.kind.as_deref() {
            Some("transient") => StoreError::Transient(detail),
            Some("timeout") => StoreError::Timeout {
                operation: "preflight".to_string(),
                table: self.table,
                elapsed_ms: 0,
            },
            Some("fatal") => StoreError::Fatal(detail),
            _ => StoreError::Corrupted {
                table: self.table,
                detail,
            },
        })
    }
}

/// Opens every table under `root` (or only `table`) and reads its row count.
/// A missing store directory is an empty, healthy store.
pub fn run_preflight(root: &Path, table: Option<&str>) -> PreflightOutcome {
    match check_tables(root, table) {
        Ok(tables) => PreflightOutcome::success(tables),
        Err(err) => PreflightOutcome::failure(&err),
    }
}

fn check_tables(root: &Path, only: Option<&str>) -> Result<Vec<String>, StoreError> {
    let names = match only {
        Some(name) => vec![name.to_string()],
        None => list_table_dirs(root)?,
    };

    for name in &names {
        let table = Table::open(&root.join(name), name, PROBE_BUSY_TIMEOUT)?;
        let rows = table.count(None)?;
        debug!(table = %name, rows, "preflight opened table");
    }

    Ok(names)
}

pub fn list_table_dirs(root: &Path) -> Result<Vec<String>, StoreError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::from_io(err, &format!("list {}", root.display()))),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| StoreError::from_io(err, "read store entry"))?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Re-invokes this binary's hidden `preflight` subcommand and kills it once
/// the deadline passes.
#[derive(Debug, Clone)]
pub struct ChildProcessProbe {
    exe: PathBuf,
}

impl ChildProcessProbe {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }

    pub fn current() -> Result<Self, StoreError> {
        let exe = std::env::current_exe()
            .map_err(|err| StoreError::from_io(err, "resolve current executable"))?;
        Ok(Self::new(exe))
    }

    fn run(
        &self,
        root: &Path,
        table: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<String>, StoreError> {
        let mut command = Command::new(&self.exe);
        command
            .arg("preflight")
            .arg("--store-dir")
            .arg(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        if let Some(table) = table {
            command.arg("--table").arg(table);
        }

        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|err| StoreError::from_io(err, "spawn preflight probe"))?;

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(StoreError::timeout(
                        "preflight",
                        table,
                        duration_millis(started.elapsed()),
                    ));
                }
                Ok(None) => thread::sleep(PROBE_POLL_INTERVAL),
                Err(err) => return Err(StoreError::from_io(err, "wait for preflight probe")),
            }
        };

        let mut stdout = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_string(&mut stdout)
                .map_err(|err| StoreError::from_io(err, "read preflight output"))?;
        }

        let outcome = stdout
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str::<PreflightOutcome>(line.trim()).ok());
        match outcome {
            Some(outcome) => outcome.into_result(),
            None => Err(StoreError::Corrupted {
                table: table.map(str::to_string),
                detail: format!("preflight probe exited with {status} and no report"),
            }),
        }
    }
}

impl PreflightProbe for ChildProcessProbe {
    fn check_store(&self, root: &Path, timeout: Duration) -> Result<Vec<String>, StoreError> {
        self.run(root, None, timeout)
    }

    fn check_table(&self, root: &Path, table: &str, timeout: Duration) -> Result<(), StoreError> {
        self.run(root, Some(table), timeout).map(|_| ())
    }
}

/// Runs the check on a helper thread instead of a child process.
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcessProbe;

#[cfg(test)]
impl InProcessProbe {
    fn run(
        &self,
        root: &Path,
        table: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<String>, StoreError> {
        use std::sync::mpsc::{self, RecvTimeoutError};

        let (sender, receiver) = mpsc::channel();
        let root_owned = root.to_path_buf();
        let table_owned = table.map(str::to_string);
        thread::Builder::new()
            .name("store-preflight".to_string())
            .spawn(move || {
                let _ = sender.send(run_preflight(&root_owned, table_owned.as_deref()));
            })
            .map_err(|err| StoreError::from_io(err, "spawn preflight thread"))?;

        match receiver.recv_timeout(timeout) {
            Ok(outcome) => outcome.into_result(),
            Err(RecvTimeoutError::Timeout) => Err(StoreError::timeout(
                "preflight",
                table,
                duration_millis(timeout),
            )),
            Err(RecvTimeoutError::Disconnected) => Err(StoreError::Corrupted {
                table: table.map(str::to_string),
                detail: "preflight thread stopped without a report".to_string(),
            }),
        }
    }
}

#[cfg(test)]
impl PreflightProbe for InProcessProbe {
    fn check_store(&self, root: &Path, timeout: Duration) -> Result<Vec<String>, StoreError> {
        self.run(root, None, timeout)
    }

    fn check_table(&self, root: &Path, table: &str, timeout: Duration) -> Result<(), StoreError> {
        self.run(root, Some(table), timeout).map(|_| ())
    }
}
