use std::time::Duration;

use serde::Serialize;

use crate::calibrate::{CalibrationMode, CandidateResult};
use crate::vector::DEFAULT_EMBEDDING_DIM;

pub const DEFAULT_WRITE_CHUNK: usize = 100;
pub const DEFAULT_VECTOR_INDEX_EVERY: usize = 500;
pub const DEFAULT_MIN_VECTOR_INDEX_ROWS: usize = 256;
pub const DEFAULT_PRUNE_EVERY_FLUSHES: usize = 5;
pub const DEFAULT_PRUNE_GRACE: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_FLUSH_ATTEMPTS: u32 = 3;
pub const DEFAULT_FLUSH_RETRY_DELAY: Duration = Duration::from_millis(500);
pub(super) const FTS_COLUMNS: [&str; 1] = ["search_text"];
pub(super) const VECTOR_COLUMN: &str = "vector";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub dimensions: usize,
    /// Rows accumulated before a store write.
    pub write_chunk: usize,
    /// Vector index rebuild milestone, in rows embedded by this run.
    pub vector_index_every: usize,
    pub min_vector_index_rows: usize,
    pub prune_every_flushes: usize,
    pub prune_grace: Duration,
    pub flush_attempts: u32,
    pub flush_retry_delay: Duration,
    pub batch_size: Option<usize>,
    pub max_chars: Option<usize>,
    pub inter_batch_delay: Option<Duration>,
    /// Recalibrate even when a saved profile exists.
    pub benchmark: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIM,
            write_chunk: DEFAULT_WRITE_CHUNK,
            vector_index_every: DEFAULT_VECTOR_INDEX_EVERY,
            min_vector_index_rows: DEFAULT_MIN_VECTOR_INDEX_ROWS,
            prune_every_flushes: DEFAULT_PRUNE_EVERY_FLUSHES,
            prune_grace: DEFAULT_PRUNE_GRACE,
            flush_attempts: DEFAULT_FLUSH_ATTEMPTS,
            flush_retry_delay: DEFAULT_FLUSH_RETRY_DELAY,
            batch_size: None,
            max_chars: None,
            inter_batch_delay: None,
            benchmark: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationSummary {
    pub mode: CalibrationMode,
    pub chosen_batch_size: usize,
    pub results: Vec<CandidateResult>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmbedRunReport {
    pub pending: usize,
    pub batch_size: usize,
    pub max_chars: usize,
    pub requests: usize,
    pub embedded: usize,
    pub dropped: usize,
    pub flushes: usize,
    pub fts_rebuilds: usize,
    pub vector_index_builds: usize,
    pub prunes: usize,
    pub resync_required: bool,
    pub calibration: Option<CalibrationSummary>,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Another job held the embed lock; nothing was touched.
    Skipped,
    Completed(EmbedRunReport),
    Cancelled {
        reason: String,
        report: EmbedRunReport,
    },
}

#[derive(Debug, Clone)]
pub(super) struct PendingRow {
    pub(super) id: String,
    pub(super) search_text: String,
}

#[derive(Debug, Clone)]
pub(super) struct EmbeddedRow {
    pub(super) id: String,
    pub(super) search_text: String,
    pub(super) vector: Vec<f32>,
}

pub(super) enum Flow {
    Finished,
    Cancelled,
}
