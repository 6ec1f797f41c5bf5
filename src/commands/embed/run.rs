use std::fs::OpenOptions;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::orchestrator::EmbeddingOrchestrator;
use super::types::{OrchestratorConfig, RunOutcome};
use crate::calibrate::{ProcessSampler, ProfileStore};
use crate::cancel::CancellationToken;
use crate::cli::{EmbedArgs, InferenceArgs};
use crate::inference::{LocalInference, LocalInferenceConfig, ModelSource, ServerRole};
use crate::lock::LockManager;
use crate::os::lower_priority;
use crate::paths::DataPaths;
use crate::progress::ProgressStore;
use crate::retry::RetryPolicy;
use crate::store::{StoreConfig, StoreHandle};

const BACKGROUND_NICENESS: i32 = 10;
const EXIT_INTERRUPTED: i32 = 130;

pub fn run(args: EmbedArgs, data_dir: Option<&Path>) -> Result<i32> {
    let paths = DataPaths::resolve(data_dir)?;
    paths.ensure()?;

    if args.detach {
        return spawn_detached(&paths);
    }
    if args.background {
        lower_priority(0, BACKGROUND_NICENESS);
    }

    let cancel = CancellationToken::new();
    if !cancel.install_signal_handlers()? {
        warn!("signal handlers already installed elsewhere; interrupts will not be graceful");
    }

    let locks = LockManager::new(paths.locks_dir());
    let swept = locks.sweep()?;
    if !swept.is_empty() {
        info!(locks = ?swept, "removed stale locks");
    }

    let store_config =
        StoreConfig::new(paths.store_dir(), paths.locks_dir()).with_dimensions(args.dimension);
    let mut store = StoreHandle::with_child_probe(store_config)?;
    let mut backend = LocalInference::new(
        local_inference_config(&paths, &args.inference),
        ServerRole::Background,
    );
    let progress = ProgressStore::new(paths.progress_path());
    let profiles = ProfileStore::new(paths.profile_path());
    let sampler = ProcessSampler::new();

    let config = OrchestratorConfig {
        dimensions: args.dimension,
        write_chunk: args.write_chunk,
        vector_index_every: args.vector_index_every,
        batch_size: args.batch_size,
        max_chars: args.max_chars,
        inter_batch_delay: args.inter_batch_delay_ms.map(Duration::from_millis),
        benchmark: args.benchmark,
        ..OrchestratorConfig::default()
    };

    info!(
        data_dir = %paths.root().display(),
        dimension = args.dimension,
        model = %args.inference.model_url,
        "embedding job starting"
    );

    let outcome = EmbeddingOrchestrator {
        store: &mut store,
        backend: &mut backend,
        locks: &locks,
        progress: &progress,
        profiles: &profiles,
        sampler: &sampler,
        retry: RetryPolicy::default(),
        config,
        cancel,
    }
    .run()?;

    Ok(match outcome {
        RunOutcome::Skipped => 0,
        RunOutcome::Completed(report) => {
            if report.resync_required {
                warn!("store tables were rebuilt; run extraction again to restore messages");
            }
            info!(
                embedded = report.embedded,
                dropped = report.dropped,
                pending = report.pending,
                "embedding job done"
            );
            0
        }
        RunOutcome::Cancelled { reason, report } => {
            info!(
                reason = %reason,
                embedded = report.embedded,
                remaining = report.pending.saturating_sub(report.embedded),
                "embedding job stopped early; rerun to continue"
            );
            EXIT_INTERRUPTED
        }
    })
}

pub(crate) fn local_inference_config(
    paths: &DataPaths,
    args: &InferenceArgs,
) -> LocalInferenceConfig {
    LocalInferenceConfig {
        engine_dir: paths.engine_dir(),
        models_dir: paths.models_dir(),
        model: ModelSource::from_url(&args.model_url),
        server_binary: args.server_binary.clone(),
        threads: args.threads,
    }
}

/// Re-launches this command without `--detach`, in its own process group so
/// terminal interrupts do not reach it.
fn spawn_detached(paths: &DataPaths) -> Result<i32> {
    let exe = std::env::current_exe().context("failed to resolve current executable")?;
    let log_path = paths.detached_log_path();
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;
    let log_err = log
        .try_clone()
        .with_context(|| format!("failed to reopen {}", log_path.display()))?;

    let mut forwarded = std::env::args_os()
        .skip(1)
        .filter(|arg| arg != "--detach")
        .collect::<Vec<_>>();
    forwarded.push("--background".into());

    let mut command = Command::new(exe);
    command
        .args(&forwarded)
        .env("CHATINDEX_HOME", paths.root())
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let child = command
        .spawn()
        .context("failed to launch background embedding job")?;
    info!(pid = child.id(), log = %log_path.display(), "embedding job detached");
    println!("{}", child.id());
    Ok(0)
}
