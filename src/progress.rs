use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::util::{now_utc_string, read_json_optional, remove_file_if_exists, write_json_pretty};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedStatus {
    #[default]
    Idle,
    Downloading,
    Embedding,
    Done,
    Error,
}

impl EmbedStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Downloading => 1,
            Self::Embedding => 2,
            Self::Done | Self::Error => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Status moves strictly forward within a run; going back to `idle` needs
    /// an explicit clear. Starting a new run is handled by
    /// [`ProgressStore::begin`].
    pub fn can_advance_to(self, next: Self) -> bool {
        if self.is_terminal() && next == Self::Downloading {
            return true;
        }
        next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Downloading => "downloading",
            Self::Embedding => "embedding",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingProgress {
    pub status: EmbedStatus,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub completed: usize,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
}

/// The single persisted progress record, rewritten atomically on each change.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<EmbeddingProgress> {
        Ok(read_json_optional(&self.path)?.unwrap_or_default())
    }

    /// Marks a new run as `downloading` before any other work starts.
    ///
    /// Only the holder of the embed lock calls this, so a record still in
    /// `downloading` or `embedding` belongs to a run that died without
    /// recording a result and is overwritten.
    pub fn begin(&self) -> Result<EmbeddingProgress> {
        let previous = self.load()?;
        if matches!(previous.status, EmbedStatus::Downloading | EmbedStatus::Embedding) {
            warn!(
                status = previous.status.as_str(),
                pid = previous.pid,
                completed = previous.completed,
                "previous embedding run ended without recording a result"
            );
        }

        let now = now_utc_string();
        let progress = EmbeddingProgress {
            status: EmbedStatus::Downloading,
            total: 0,
            completed: 0,
            started_at: Some(now.clone()),
            updated_at: Some(now),
            finished_at: None,
            error: None,
            pid: Some(std::process::id()),
        };
        write_json_pretty(&self.path, &progress)?;
        debug!(status = progress.status.as_str(), "progress updated");
        Ok(progress)
    }

    pub fn start_embedding(&self, total: usize) -> Result<EmbeddingProgress> {
        let mut progress = self.load()?;
        progress.status = EmbedStatus::Embedding;
        progress.total = total;
        progress.completed = 0;
        progress.updated_at = Some(now_utc_string());
        self.transition(progress)
    }

    pub fn record_completed(&self, completed: usize) -> Result<EmbeddingProgress> {
        let mut progress = self.load()?;
        progress.status = EmbedStatus::Embedding;
        progress.completed = completed;
        progress.updated_at = Some(now_utc_string());
        self.transition(progress)
    }

    pub fn finish_done(&self) -> Result<EmbeddingProgress> {
        let mut progress = self.load()?;
        let now = now_utc_string();
        progress.status = EmbedStatus::Done;
        progress.error = None;
        progress.updated_at = Some(now.clone());
        progress.finished_at = Some(now);
        if progress.started_at.is_none() {
            progress.started_at = progress.updated_at.clone();
        }
        self.transition(progress)
    }

    pub fn fail(&self, message: &str) -> Result<EmbeddingProgress> {
        let mut progress = self.load()?;
        let now = now_utc_string();
        progress.status = EmbedStatus::Error;
        progress.error = Some(message.to_string());
        progress.updated_at = Some(now.clone());
        progress.finished_at = Some(now);
        self.transition(progress)
    }

    /// Explicit reset back to `idle`.
    pub fn clear(&self) -> Result<bool> {
        remove_file_if_exists(&self.path)
    }

    fn transition(&self, next: EmbeddingProgress) -> Result<EmbeddingProgress> {
        let current = self.load()?;
        if current.status != next.status && !current.status.can_advance_to(next.status) {
            bail!(
                "refusing to move embedding progress from {} to {}",
                current.status.as_str(),
                next.status.as_str()
            );
        }

        write_json_pretty(&self.path, &next)?;
        debug!(status = next.status.as_str(), completed = next.completed, total = next.total, "progress updated");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ProgressStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path().join("embedding_progress.json"));
        (dir, store)
    }

    #[test]
    fn missing_file_reads_as_idle() {
        let (_dir, store) = store();
        assert_eq!(store.load().unwrap().status, EmbedStatus::Idle);
    }

    #[test]
    fn happy_path_moves_forward() {
        let (_dir, store) = store();
        store.begin().unwrap();
        store.start_embedding(10).unwrap();
        store.record_completed(4).unwrap();
        let done = store.finish_done().unwrap();
        assert_eq!(done.status, EmbedStatus::Done);
        assert_eq!(done.completed, 4);
        assert!(done.finished_at.is_some());

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"status\": \"done\""));
    }

    #[test]
    fn backward_moves_are_rejected() {
        let (_dir, store) = store();
        store.begin().unwrap();
        store.start_embedding(10).unwrap();
        store.finish_done().unwrap();
        assert!(store.start_embedding(3).is_err());
        assert!(store.record_completed(3).is_err());
        assert_eq!(store.load().unwrap().status, EmbedStatus::Done);
    }

    #[test]
    fn run_that_died_mid_embedding_can_be_restarted() {
        let (_dir, store) = store();
        store.begin().unwrap();
        store.start_embedding(10).unwrap();
        store.record_completed(4).unwrap();

        let restarted = store.begin().unwrap();
        assert_eq!(restarted.status, EmbedStatus::Downloading);
        assert_eq!(restarted.completed, 0);
        assert_eq!(restarted.total, 0);

        store.start_embedding(6).unwrap();
        assert_eq!(store.finish_done().unwrap().status, EmbedStatus::Done);
    }

    #[test]
    fn finished_runs_can_restart_and_clear_resets() {
        let (_dir, store) = store();
        store.begin().unwrap();
        store.fail("Interrupted by SIGINT").unwrap();
        assert_eq!(store.load().unwrap().error.as_deref(), Some("Interrupted by SIGINT"));

        let restarted = store.begin().unwrap();
        assert_eq!(restarted.status, EmbedStatus::Downloading);
        assert_eq!(restarted.error, None);

        assert!(store.clear().unwrap());
        assert_eq!(store.load().unwrap(), EmbeddingProgress::default());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&EmbedStatus::Embedding).unwrap();
        assert_eq!(json, "\"embedding\"");
    }
}
