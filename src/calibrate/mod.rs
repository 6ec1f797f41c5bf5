//! Empirical batch-size selection against a running inference server.
//!
//! Each candidate batch size embeds a few real batches while a sampler
//! records the server's CPU, GPU and memory use. The fastest candidate wins
//! unless a more efficient one keeps at least 80% of its throughput.

mod profile;
mod sampler;

#[cfg(test)]
mod tests;

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::inference::InferenceBackend;
use crate::util::now_utc_string;

pub use profile::{CalibrationProfile, DEFAULT_MAX_CHARS, ProfileStore};
pub use sampler::{ProcessSampler, ResourceSample, ResourceSampler};

/// Share of the fastest candidate's throughput the efficient pick must keep.
pub const EFFICIENCY_THROUGHPUT_FLOOR: f64 = 0.8;
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
const MIN_CPU_PERCENT: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationMode {
    Auto,
    Full,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationConfig {
    pub mode: CalibrationMode,
    /// Tried in ascending order.
    pub candidates: Vec<usize>,
    pub batches_per_candidate: usize,
    pub sample_interval: Duration,
    pub max_chars: usize,
    pub inter_batch_delay_ms: u64,
}

impl CalibrationConfig {
    /// Quiet first-run variant.
    pub fn auto() -> Self {
        Self {
            mode: CalibrationMode::Auto,
            candidates: vec![8, 16, 32, 64],
            batches_per_candidate: 2,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            max_chars: DEFAULT_MAX_CHARS,
            inter_batch_delay_ms: 0,
        }
    }

    pub fn full() -> Self {
        Self {
            mode: CalibrationMode::Full,
            candidates: vec![4, 8, 16, 32, 64, 128],
            batches_per_candidate: 4,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            max_chars: DEFAULT_MAX_CHARS,
            inter_batch_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateResult {
    pub batch_size: usize,
    pub messages: usize,
    pub elapsed_secs: f64,
    pub throughput: f64,
    pub avg_cpu_percent: Option<f64>,
    pub avg_gpu_percent: Option<f64>,
    pub peak_rss_bytes: Option<u64>,
    pub energy_proxy: f64,
    pub efficiency: f64,
}

impl CandidateResult {
    /// Without CPU samples the server is assumed fully busy on one core, so
    /// efficiency equals throughput.
    pub fn from_measurements(
        batch_size: usize,
        messages: usize,
        elapsed: Duration,
        samples: &[ResourceSample],
    ) -> Self {
        let elapsed_secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let avg_cpu_percent = mean(samples.iter().filter_map(|sample| sample.cpu_percent));
        let avg_gpu_percent = mean(samples.iter().filter_map(|sample| sample.gpu_percent));
        let peak_rss_bytes = samples.iter().filter_map(|sample| sample.rss_bytes).max();

        let cpu = avg_cpu_percent.unwrap_or(100.0).max(MIN_CPU_PERCENT);
        let energy_proxy = cpu * elapsed_secs / 100.0;
        Self {
            batch_size,
            messages,
            elapsed_secs,
            throughput: messages as f64 / elapsed_secs,
            avg_cpu_percent,
            avg_gpu_percent,
            peak_rss_bytes,
            energy_proxy,
            efficiency: messages as f64 / energy_proxy,
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Fastest candidate `F` and most efficient `E`: `E` wins when it differs
/// from `F` and keeps at least 80% of `F`'s throughput.
pub fn select_candidate(results: &[CandidateResult]) -> Option<&CandidateResult> {
    let fastest = results
        .iter()
        .max_by(|left, right| left.throughput.total_cmp(&right.throughput))?;
    let efficient = results
        .iter()
        .max_by(|left, right| left.efficiency.total_cmp(&right.efficiency))?;

    if efficient.batch_size != fastest.batch_size
        && efficient.throughput >= EFFICIENCY_THROUGHPUT_FLOOR * fastest.throughput
    {
        Some(efficient)
    } else {
        Some(fastest)
    }
}

#[derive(Debug, Clone)]
pub struct CalibrationOutcome {
    pub results: Vec<CandidateResult>,
    pub profile: CalibrationProfile,
}

pub struct BatchCalibrator<'a> {
    config: CalibrationConfig,
    sampler: &'a dyn ResourceSampler,
}

impl<'a> BatchCalibrator<'a> {
    pub fn new(config: CalibrationConfig, sampler: &'a dyn ResourceSampler) -> Self {
        Self { config, sampler }
    }

    /// Benchmarks every candidate on `texts` (reused cyclically) and returns
    /// the chosen profile. The first failing candidate ends the sweep. A
    /// cancelled sweep is an error even when some candidates were measured,
    /// so a partial sweep never becomes the saved profile.
    pub fn run(
        &self,
        backend: &mut dyn InferenceBackend,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<CalibrationOutcome> {
        if texts.is_empty() {
            bail!("calibration needs at least one text to embed");
        }

        backend.start()?;
        let mut candidates = self.config.candidates.clone();
        candidates.sort_unstable();
        candidates.dedup();

        let mut results = Vec::new();
        for batch_size in candidates.into_iter().filter(|size| *size > 0) {
            if cancel.is_cancelled() {
                break;
            }

            let sample = texts
                .iter()
                .cycle()
                .take(batch_size * self.config.batches_per_candidate.max(1))
                .cloned()
                .collect::<Vec<String>>();

            match self.measure(backend, batch_size, &sample) {
                Ok(result) => {
                    debug!(
                        batch_size,
                        throughput = result.throughput,
                        efficiency = result.efficiency,
                        "calibration candidate measured"
                    );
                    results.push(result);
                }
                Err(err) => {
                    warn!(batch_size, error = %format!("{err:#}"), "calibration candidate failed; stopping sweep");
                    break;
                }
            }
        }

        if cancel.is_cancelled() {
            bail!(
                "calibration interrupted after {} of {} candidates",
                results.len(),
                self.config.candidates.len()
            );
        }
        let Some(chosen) = select_candidate(&results) else {
            bail!("every calibration candidate failed");
        };
        let profile = CalibrationProfile {
            batch_size: chosen.batch_size,
            max_chars: self.config.max_chars,
            inter_batch_delay_ms: self.config.inter_batch_delay_ms,
            throughput: chosen.throughput,
            efficiency: chosen.efficiency,
            benchmarked_at: now_utc_string(),
            mode: self.config.mode,
            model: backend.model_id(),
        };
        info!(
            batch_size = profile.batch_size,
            throughput = profile.throughput,
            efficiency = profile.efficiency,
            candidates = results.len(),
            "calibration finished"
        );

        Ok(CalibrationOutcome { results, profile })
    }

    fn measure(
        &self,
        backend: &mut dyn InferenceBackend,
        batch_size: usize,
        sample: &[String],
    ) -> Result<CandidateResult> {
        let pid = backend.server_pid();
        let stop = AtomicBool::new(false);
        let sampler = self.sampler;
        let interval = self.config.sample_interval;

        let (elapsed, outcome, samples) = thread::scope(|scope| {
            let stop = &stop;
            let sampling = pid.map(|pid| {
                scope.spawn(move || {
                    let mut samples = Vec::new();
                    while !stop.load(Ordering::SeqCst) {
                        samples.push(sampler.sample(pid));
                        thread::sleep(interval);
                    }
                    samples
                })
            });

            let started = Instant::now();
            let mut outcome = Ok(());
            for chunk in sample.chunks(batch_size) {
                match backend.embed(chunk) {
                    Ok(vectors) if vectors.len() == chunk.len() => {}
                    Ok(vectors) => {
                        outcome = Err(anyhow::anyhow!(
                            "server returned {} vectors for {} texts",
                            vectors.len(),
                            chunk.len()
                        ));
                        break;
                    }
                    Err(err) => {
                        outcome = Err(err);
                        break;
                    }
                }
            }
            let elapsed = started.elapsed();
            stop.store(true, Ordering::SeqCst);

            let samples = sampling
                .and_then(|handle| handle.join().ok())
                .unwrap_or_default();
            (elapsed, outcome, samples)
        });

        outcome?;
        Ok(CandidateResult::from_measurements(
            batch_size,
            sample.len(),
            elapsed,
            &samples,
        ))
    }
}

/// Human-readable comparison of all measured candidates; the chosen one is
/// marked with `*`.
pub fn comparison_table(results: &[CandidateResult], chosen_batch: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>6}  {:>10}  {:>7}  {:>7}  {:>10}  {:>10}",
        "batch", "msgs/s", "cpu%", "gpu%", "peak MiB", "msgs/cpu-s"
    );
    for result in results {
        let marker = if result.batch_size == chosen_batch { " *" } else { "" };
        let _ = writeln!(
            out,
            "{:>6}  {:>10.1}  {:>7}  {:>7}  {:>10}  {:>10.2}{marker}",
            result.batch_size,
            result.throughput,
            format_optional(result.avg_cpu_percent),
            format_optional(result.avg_gpu_percent),
            result
                .peak_rss_bytes
                .map(|bytes| format!("{:.1}", bytes as f64 / (1024.0 * 1024.0)))
                .unwrap_or_else(|| "-".to_string()),
            result.efficiency,
        );
    }
    out
}

fn format_optional(value: Option<f64>) -> String {
    value
        .map(|value| format!("{value:.1}"))
        .unwrap_or_else(|| "-".to_string())
}

/// Time to embed `pending` rows at `throughput` rows per second.
pub fn estimate_completion(pending: usize, throughput: f64) -> Option<Duration> {
    if throughput <= 0.0 || !throughput.is_finite() {
        return None;
    }
    Some(Duration::from_secs_f64(pending as f64 / throughput))
}

pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    match seconds {
        0..=59 => format!("{seconds}s"),
        60..=3599 => format!("{}m {:02}s", seconds / 60, seconds % 60),
        _ => format!("{}h {:02}m", seconds / 3600, (seconds % 3600) / 60),
    }
}
