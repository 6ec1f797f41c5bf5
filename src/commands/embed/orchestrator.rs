use std::thread;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use super::payload::PayloadBuilder;
use super::types::{
    CalibrationSummary, EmbedRunReport, EmbeddedRow, FTS_COLUMNS, Flow, OrchestratorConfig,
    PendingRow, RunOutcome, VECTOR_COLUMN,
};
use crate::calibrate::{
    BatchCalibrator, CalibrationConfig, CalibrationProfile, DEFAULT_MAX_CHARS, ProfileStore,
    ResourceSampler, comparison_table, estimate_completion, format_duration,
};
use crate::cancel::CancellationToken;
use crate::inference::{DownloadProgress, InferenceBackend};
use crate::lock::{EMBED_LOCK, LockManager};
use crate::progress::ProgressStore;
use crate::retry::RetryPolicy;
use crate::store::{MessageRow, Row, StoreError, StoreHandle, Value};
use crate::util::duration_millis;
use crate::vector::needs_embedding;

/// Texts handed to the calibrator; a sweep never needs more.
const CALIBRATION_SAMPLE: usize = 512;

/// Everything the background embedding job touches, borrowed for one run.
pub struct EmbeddingOrchestrator<'a> {
    pub store: &'a mut StoreHandle,
    pub backend: &'a mut dyn InferenceBackend,
    pub locks: &'a LockManager,
    pub progress: &'a ProgressStore,
    pub profiles: &'a ProfileStore,
    pub sampler: &'a dyn ResourceSampler,
    pub retry: RetryPolicy,
    pub config: OrchestratorConfig,
    pub cancel: CancellationToken,
}

impl EmbeddingOrchestrator<'_> {
    /// One full pass over the rows still carrying placeholder vectors.
    ///
    /// Returns [`RunOutcome::Skipped`] without touching progress when another
    /// job holds the embed lock. Any error is recorded in the progress file
    /// before it is returned; the lock is released and the server stopped on
    /// every path.
    pub fn run(&mut self) -> Result<RunOutcome> {
        if !self.locks.acquire(EMBED_LOCK)? {
            info!("another embedding job holds the lock; exiting");
            return Ok(RunOutcome::Skipped);
        }

        let mut report = EmbedRunReport::default();
        match self.execute(&mut report) {
            Ok(Flow::Finished) => {
                self.release_lock();
                self.backend.stop();
                info!(
                    embedded = report.embedded,
                    dropped = report.dropped,
                    requests = report.requests,
                    flushes = report.flushes,
                    vector_index_builds = report.vector_index_builds,
                    "embedding run finished"
                );
                Ok(RunOutcome::Completed(report))
            }
            Ok(Flow::Cancelled) => Ok(self.finish_cancelled(report)),
            Err(err) if self.cancel.is_cancelled() => {
                debug!(error = %format!("{err:#}"), "error raised while cancelling");
                Ok(self.finish_cancelled(report))
            }
            Err(err) => {
                if let Err(progress_err) = self.progress.fail(&format!("{err:#}")) {
                    warn!(error = %format!("{progress_err:#}"), "failed to record embedding error");
                }
                self.release_lock();
                self.backend.stop();
                Err(err)
            }
        }
    }

    /// Cleanup for an interrupted run. A failure caused by the interrupt itself
    /// (the server killed by the same signal, an aborted calibration) ends up
    /// here too, so it is reported as an interruption rather than an error.
    fn finish_cancelled(&mut self, mut report: EmbedRunReport) -> RunOutcome {
        let reason = self
            .cancel
            .reason()
            .unwrap_or_else(|| "cancellation request".to_string());
        self.backend.stop();
        self.rebuild_fts_after_cancel(&mut report);
        let message = format!("Interrupted by {reason}");
        if let Err(err) = self.progress.fail(&message) {
            warn!(error = %format!("{err:#}"), "failed to record interruption");
        }
        self.release_lock();
        warn!(
            reason = %reason,
            embedded = report.embedded,
            "embedding run interrupted"
        );
        RunOutcome::Cancelled { reason, report }
    }

    fn execute(&mut self, report: &mut EmbedRunReport) -> Result<Flow> {
        self.progress.begin()?;
        let retry = self.retry;

        let ensured = retry
            .run_with_recovery(self.store, "ensure_tables", |store| store.ensure_tables())
            .context("failed to prepare store tables")?;
        report.resync_required = ensured.resync_required || self.store.resync_required();
        if report.resync_required {
            warn!("store tables were recreated; extraction must run again");
        }

        let compacted = retry
            .run_with_recovery(self.store, "compact", |store| store.messages()?.compact())
            .context("failed to compact messages table")?;
        debug!(
            bytes_before = compacted.bytes_before,
            bytes_after = compacted.bytes_after,
            "messages table compacted"
        );
        if self.cancel.is_cancelled() {
            return Ok(Flow::Cancelled);
        }

        let pending = self.scan_pending()?;
        report.pending = pending.len();
        if pending.is_empty() {
            info!("every message already has an embedding");
            self.progress.finish_done()?;
            return Ok(Flow::Finished);
        }
        info!(pending = pending.len(), "messages awaiting embeddings");

        let mut on_download = |progress: DownloadProgress| match progress.percent() {
            Some(percent) => debug!(downloaded = progress.downloaded, percent, "downloading"),
            None => debug!(downloaded = progress.downloaded, "downloading"),
        };
        self.backend
            .prepare(&mut on_download)
            .context("failed to prepare inference backend")?;
        if self.cancel.is_cancelled() {
            return Ok(Flow::Cancelled);
        }

        let profile = self.resolve_profile(&pending, report)?;
        let batch_size = self.config.batch_size.unwrap_or(profile.batch_size).max(1);
        let max_chars = self.config.max_chars.unwrap_or(profile.max_chars).max(1);
        let inter_batch_delay = self
            .config
            .inter_batch_delay
            .unwrap_or(std::time::Duration::from_millis(profile.inter_batch_delay_ms));
        report.batch_size = batch_size;
        report.max_chars = max_chars;
        if self.cancel.is_cancelled() {
            return Ok(Flow::Cancelled);
        }

        let payloads = PayloadBuilder::new(max_chars)?;
        let port = self.backend.start().context("failed to start inference server")?;
        info!(port, batch_size, max_chars, "embedding started");
        self.progress.start_embedding(pending.len())?;

        let write_chunk = self.config.write_chunk.max(1);
        let milestone_step = self.config.vector_index_every.max(1);
        let mut next_milestone = milestone_step;
        let mut accumulated = Vec::<EmbeddedRow>::new();

        for batch in pending.chunks(batch_size) {
            if self.cancel.is_cancelled() {
                return Ok(Flow::Cancelled);
            }

            let inputs = batch
                .iter()
                .map(|row| payloads.embedding_payload(&row.search_text))
                .collect::<Vec<String>>();
            let vectors = self
                .backend
                .embed(&inputs)
                .with_context(|| format!("embedding request for {} messages failed", inputs.len()))?;
            report.requests += 1;
            if vectors.len() != batch.len() {
                bail!(
                    "inference server returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                );
            }

            for (row, vector) in batch.iter().zip(vectors) {
                if vector.len() != self.config.dimensions {
                    warn!(
                        id = %row.id,
                        got = vector.len(),
                        expected = self.config.dimensions,
                        "dropping embedding with unexpected dimension"
                    );
                    report.dropped += 1;
                    continue;
                }
                accumulated.push(EmbeddedRow {
                    id: row.id.clone(),
                    search_text: row.search_text.clone(),
                    vector,
                });
            }

            while accumulated.len() >= write_chunk {
                let chunk = accumulated.drain(..write_chunk).collect::<Vec<EmbeddedRow>>();
                self.flush(&chunk, report)?;
                if self.cancel.is_cancelled() {
                    return Ok(Flow::Cancelled);
                }
                if report.embedded >= next_milestone {
                    self.rebuild_vector_index(report)?;
                    while next_milestone <= report.embedded {
                        next_milestone += milestone_step;
                    }
                    if self.cancel.is_cancelled() {
                        return Ok(Flow::Cancelled);
                    }
                }
            }

            if !inter_batch_delay.is_zero() {
                thread::sleep(inter_batch_delay);
            }
        }

        if !accumulated.is_empty() {
            let chunk = std::mem::take(&mut accumulated);
            self.flush(&chunk, report)?;
        }
        if report.embedded > 0 {
            self.rebuild_vector_index(report)?;
            self.prune(report)?;
        }

        self.progress.finish_done()?;
        Ok(Flow::Finished)
    }

    fn scan_pending(&mut self) -> Result<Vec<PendingRow>> {
        let dimensions = self.config.dimensions;
        let rows = self
            .retry
            .run_with_recovery(self.store, "scan", |store| store.messages()?.query(None, None))
            .context("failed to scan messages")?;
        let payloads = PayloadBuilder::new(DEFAULT_MAX_CHARS)?;

        Ok(rows
            .iter()
            .filter_map(MessageRow::from_row)
            .filter(|message| needs_embedding(&message.vector, dimensions))
            .map(|message| PendingRow {
                search_text: payloads.strip_tool_output(&message.content),
                id: message.id,
            })
            .collect())
    }

    fn resolve_profile(
        &mut self,
        pending: &[PendingRow],
        report: &mut EmbedRunReport,
    ) -> Result<CalibrationProfile> {
        if !self.config.benchmark {
            match self.profiles.load() {
                Ok(Some(profile)) => {
                    debug!(
                        batch_size = profile.batch_size,
                        benchmarked_at = %profile.benchmarked_at,
                        "using saved calibration profile"
                    );
                    return Ok(profile);
                }
                Ok(None) => info!("no calibration profile; running quick calibration"),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "unreadable calibration profile; recalibrating")
                }
            }
        }

        let mut calibration = if self.config.benchmark {
            CalibrationConfig::full()
        } else {
            CalibrationConfig::auto()
        };
        if let Some(max_chars) = self.config.max_chars {
            calibration.max_chars = max_chars;
        }
        if let Some(delay) = self.config.inter_batch_delay {
            calibration.inter_batch_delay_ms = duration_millis(delay);
        }

        let payloads = PayloadBuilder::new(calibration.max_chars)?;
        let texts = pending
            .iter()
            .take(CALIBRATION_SAMPLE)
            .map(|row| payloads.embedding_payload(&row.search_text))
            .collect::<Vec<String>>();

        let outcome = BatchCalibrator::new(calibration, self.sampler)
            .run(&mut *self.backend, &texts, &self.cancel)
            .context("batch size calibration failed")?;
        self.profiles.save(&outcome.profile)?;

        if self.config.benchmark {
            println!(
                "{}",
                comparison_table(&outcome.results, outcome.profile.batch_size)
            );
            if let Some(eta) = estimate_completion(pending.len(), outcome.profile.throughput) {
                println!(
                    "estimated time for {} pending messages: {}",
                    pending.len(),
                    format_duration(eta)
                );
            }
        }

        report.calibration = Some(CalibrationSummary {
            mode: outcome.profile.mode,
            chosen_batch_size: outcome.profile.batch_size,
            results: outcome.results,
        });
        Ok(outcome.profile)
    }

    /// Writes one chunk of vectors, then refreshes the full-text index the
    /// write invalidated. Attempts are spaced by a fixed delay on top of the
    /// policy's own retries; a corrupted table aborts immediately.
    fn flush(&mut self, chunk: &[EmbeddedRow], report: &mut EmbedRunReport) -> Result<()> {
        let rows = chunk
            .iter()
            .map(|row| {
                Row::new()
                    .with("id", Value::Text(row.id.clone()))
                    .with("search_text", Value::Text(row.search_text.clone()))
                    .with(VECTOR_COLUMN, Value::Vector(row.vector.clone()))
            })
            .collect::<Vec<Row>>();

        let retry = self.retry;
        let attempts = self.config.flush_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = retry.run_with_recovery(self.store, "flush", |store| {
                store.messages()?.upsert(&rows)
            });
            match result {
                Ok(_) => break,
                Err(err @ StoreError::Corrupted { .. }) => {
                    return Err(err).context("messages table corrupted during flush");
                }
                Err(err) if attempt < attempts => {
                    warn!(attempt, rows = rows.len(), error = %err, "flush failed; retrying");
                    thread::sleep(self.config.flush_retry_delay);
                    attempt += 1;
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to write {} embeddings after {attempts} attempts", rows.len())
                    });
                }
            }
        }
        report.flushes += 1;
        report.embedded += rows.len();

        let indexed = retry
            .run_with_recovery(self.store, "fts_index", |store| {
                store.messages()?.build_fts_index(&FTS_COLUMNS)
            })
            .context("failed to rebuild full-text index")?;
        report.fts_rebuilds += 1;

        let prune_every = self.config.prune_every_flushes.max(1);
        if report.flushes % prune_every == 0 {
            self.prune(report)?;
        }

        self.progress.record_completed(report.embedded)?;
        info!(
            flushed = rows.len(),
            embedded = report.embedded,
            indexed,
            "embeddings flushed"
        );
        Ok(())
    }

    fn rebuild_vector_index(&mut self, report: &mut EmbedRunReport) -> Result<()> {
        let dimensions = self.config.dimensions;
        let min_rows = self.config.min_vector_index_rows;
        let built = self
            .retry
            .run_with_recovery(self.store, "vector_index", |store| {
                store
                    .messages()?
                    .build_vector_index(VECTOR_COLUMN, dimensions, min_rows)
            })
            .context("failed to rebuild vector index")?;
        match built {
            Some(stats) => {
                report.vector_index_builds += 1;
                info!(rows = stats.rows, partitions = stats.partitions, "vector index rebuilt");
            }
            None => debug!(min_rows, "too few embedded rows for a vector index"),
        }
        Ok(())
    }

    fn prune(&mut self, report: &mut EmbedRunReport) -> Result<()> {
        let grace = self.config.prune_grace;
        let stats = self
            .retry
            .run_with_recovery(self.store, "prune", |store| {
                store.messages()?.prune_versions(grace)
            })
            .context("failed to prune old versions")?;
        report.prunes += 1;
        debug!(
            removed = stats.versions_removed,
            kept = stats.versions_kept,
            "old versions pruned"
        );
        Ok(())
    }

    fn rebuild_fts_after_cancel(&mut self, report: &mut EmbedRunReport) {
        let result = self.retry.run_with_recovery(self.store, "fts_index", |store| {
            store.messages()?.build_fts_index(&FTS_COLUMNS)
        });
        match result {
            Ok(_) => report.fts_rebuilds += 1,
            Err(err) => warn!(error = %err, "failed to rebuild full-text index after interrupt"),
        }
    }

    fn release_lock(&self) {
        if let Err(err) = self.locks.release(EMBED_LOCK) {
            warn!(error = %format!("{err:#}"), "failed to release embed lock");
        }
    }
}
