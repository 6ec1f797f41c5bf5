use std::collections::HashMap;

use anyhow::bail;

use super::*;
use crate::inference::DownloadProgress;

fn result(batch_size: usize, throughput: f64, efficiency: f64) -> CandidateResult {
    CandidateResult {
        batch_size,
        messages: 100,
        elapsed_secs: 100.0 / throughput,
        throughput,
        avg_cpu_percent: Some(100.0),
        avg_gpu_percent: None,
        peak_rss_bytes: None,
        energy_proxy: 100.0 / efficiency,
        efficiency,
    }
}

#[test]
fn efficient_candidate_wins_within_eighty_percent() {
    let results = vec![result(16, 90.0, 5.0), result(64, 100.0, 2.0)];
    assert_eq!(select_candidate(&results).unwrap().batch_size, 16);
}

#[test]
fn fastest_candidate_wins_when_efficient_one_is_too_slow() {
    let results = vec![result(8, 79.0, 5.0), result(64, 100.0, 2.0)];
    assert_eq!(select_candidate(&results).unwrap().batch_size, 64);
}

#[test]
fn exactly_eighty_percent_counts_as_close_enough() {
    let results = vec![result(8, 80.0, 5.0), result(64, 100.0, 2.0)];
    assert_eq!(select_candidate(&results).unwrap().batch_size, 8);
}

#[test]
fn single_candidate_is_selected() {
    let results = vec![result(32, 50.0, 1.0)];
    assert_eq!(select_candidate(&results).unwrap().batch_size, 32);
    assert!(select_candidate(&[]).is_none());
}

#[test]
fn measurements_follow_the_energy_formula() {
    let samples = vec![
        ResourceSample {
            cpu_percent: Some(200.0),
            gpu_percent: Some(40.0),
            rss_bytes: Some(10),
        },
        ResourceSample {
            cpu_percent: Some(400.0),
            gpu_percent: None,
            rss_bytes: Some(30),
        },
    ];
    let measured = CandidateResult::from_measurements(16, 60, Duration::from_secs(2), &samples);
    assert!((measured.throughput - 30.0).abs() < 1e-9);
    assert_eq!(measured.avg_cpu_percent, Some(300.0));
    assert_eq!(measured.avg_gpu_percent, Some(40.0));
    assert_eq!(measured.peak_rss_bytes, Some(30));
    assert!((measured.energy_proxy - 6.0).abs() < 1e-9);
    assert!((measured.efficiency - 10.0).abs() < 1e-9);
}

#[test]
fn missing_cpu_samples_make_efficiency_equal_throughput() {
    let measured = CandidateResult::from_measurements(8, 40, Duration::from_secs(4), &[]);
    assert!((measured.efficiency - measured.throughput).abs() < 1e-9);
}

struct ScriptedBackend {
    fail_from_batch_size: usize,
    calls: HashMap<usize, usize>,
    cancel_at_batch_size: Option<(usize, CancellationToken)>,
}

impl ScriptedBackend {
    fn failing_from(fail_from_batch_size: usize) -> Self {
        Self {
            fail_from_batch_size,
            calls: HashMap::new(),
            cancel_at_batch_size: None,
        }
    }
}

impl InferenceBackend for ScriptedBackend {
    fn prepare(&mut self, _on_progress: &mut dyn FnMut(DownloadProgress)) -> Result<()> {
        Ok(())
    }

    fn start(&mut self) -> Result<u16> {
        Ok(8080)
    }

    fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        *self.calls.entry(texts.len()).or_default() += 1;
        if let Some((size, token)) = &self.cancel_at_batch_size {
            if texts.len() == *size {
                token.cancel_with_signal(2);
            }
        }
        if texts.len() >= self.fail_from_batch_size {
            bail!("out of memory");
        }
        Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    }

    fn stop(&mut self) {}

    fn server_pid(&self) -> Option<u32> {
        None
    }

    fn model_id(&self) -> String {
        "scripted".to_string()
    }
}

struct NoSamples;

impl ResourceSampler for NoSamples {
    fn sample(&self, _pid: u32) -> ResourceSample {
        ResourceSample::default()
    }
}

#[test]
fn first_failure_stops_the_sweep() {
    let mut backend = ScriptedBackend::failing_from(32);
    let calibrator = BatchCalibrator::new(CalibrationConfig::auto(), &NoSamples);
    let texts = vec!["hello".to_string(); 3];

    let outcome = calibrator
        .run(&mut backend, &texts, &CancellationToken::new())
        .unwrap();
    let measured = outcome
        .results
        .iter()
        .map(|result| result.batch_size)
        .collect::<Vec<usize>>();
    assert_eq!(measured, vec![8, 16]);
    assert_eq!(backend.calls.get(&8), Some(&2));
    assert_eq!(backend.calls.get(&32), Some(&1));
    assert_eq!(backend.calls.get(&64), None);
    assert!(outcome.profile.batch_size == 8 || outcome.profile.batch_size == 16);
    assert_eq!(outcome.profile.mode, CalibrationMode::Auto);
    assert_eq!(outcome.profile.model, "scripted");
}

#[test]
fn all_candidates_failing_is_an_error() {
    let mut backend = ScriptedBackend::failing_from(1);
    let calibrator = BatchCalibrator::new(CalibrationConfig::full(), &NoSamples);
    let texts = vec!["hello".to_string()];
    assert!(
        calibrator
            .run(&mut backend, &texts, &CancellationToken::new())
            .is_err()
    );
}

#[test]
fn interrupted_sweep_yields_no_profile() {
    let cancel = CancellationToken::new();
    let mut backend = ScriptedBackend {
        cancel_at_batch_size: Some((16, cancel.clone())),
        ..ScriptedBackend::failing_from(usize::MAX)
    };
    let calibrator = BatchCalibrator::new(CalibrationConfig::auto(), &NoSamples);
    let texts = vec!["hello".to_string(); 3];

    let err = calibrator.run(&mut backend, &texts, &cancel).unwrap_err();
    assert!(err.to_string().contains("interrupted"), "{err:#}");
    assert_eq!(backend.calls.get(&8), Some(&2));
    assert_eq!(backend.calls.get(&32), None);
}

#[test]
fn table_marks_the_chosen_candidate() {
    let table = comparison_table(&[result(8, 10.0, 1.0), result(16, 20.0, 2.0)], 16);
    let chosen_line = table.lines().find(|line| line.trim_start().starts_with("16")).unwrap();
    assert!(chosen_line.ends_with('*'));
    assert!(table.lines().next().unwrap().contains("msgs/s"));
}

#[test]
fn completion_estimate_scales_with_pending_rows() {
    assert_eq!(estimate_completion(100, 50.0), Some(Duration::from_secs(2)));
    assert_eq!(estimate_completion(100, 0.0), None);
    assert_eq!(format_duration(Duration::from_secs(75)), "1m 15s");
    assert_eq!(format_duration(Duration::from_secs(7260)), "2h 01m");
}
