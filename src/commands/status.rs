use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::calibrate::{CalibrationProfile, ProfileStore};
use crate::cli::StatusArgs;
use crate::inference::ENGINE_RELEASE;
use crate::lock::{EMBED_LOCK, LockManager, SYNC_LOCK};
use crate::paths::DataPaths;
use crate::progress::{EmbeddingProgress, ProgressStore};

#[derive(Debug, Serialize)]
struct StatusReport {
    data_dir: String,
    progress: EmbeddingProgress,
    profile: Option<CalibrationProfile>,
    lock_holders: Vec<LockHolder>,
    engine_release: &'static str,
}

#[derive(Debug, Serialize)]
struct LockHolder {
    name: &'static str,
    pid: u32,
    held_for_secs: u64,
}

pub fn run(args: StatusArgs, data_dir: Option<&Path>) -> Result<i32> {
    let paths = DataPaths::resolve(data_dir)?;
    let progress_store = ProgressStore::new(paths.progress_path());
    info!(data_dir = %paths.root().display(), "status requested");

    if args.clear {
        let removed = progress_store.clear()?;
        info!(removed, path = %progress_store.path().display(), "embedding progress cleared");
    }

    let progress = progress_store.load()?;
    info!(
        status = progress.status.as_str(),
        total = progress.total,
        completed = progress.completed,
        started_at = %progress.started_at.clone().unwrap_or_default(),
        updated_at = %progress.updated_at.clone().unwrap_or_default(),
        error = %progress.error.clone().unwrap_or_default(),
        "loaded embedding progress"
    );

    let profile = match ProfileStore::new(paths.profile_path()).load() {
        Ok(profile) => profile,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "calibration profile unreadable");
            None
        }
    };
    match &profile {
        Some(profile) => info!(
            batch_size = profile.batch_size,
            max_chars = profile.max_chars,
            throughput = profile.throughput,
            benchmarked_at = %profile.benchmarked_at,
            "loaded calibration profile"
        ),
        None => warn!(path = %paths.profile_path().display(), "calibration profile missing"),
    }

    let locks = LockManager::new(paths.locks_dir());
    let mut lock_holders = Vec::new();
    for name in [EMBED_LOCK, SYNC_LOCK] {
        if let Some(record) = locks.holder(name)? {
            info!(lock = name, pid = record.pid, "lock held");
            lock_holders.push(LockHolder {
                name,
                pid: record.pid,
                held_for_secs: record.age().as_secs(),
            });
        }
    }

    let report = StatusReport {
        data_dir: paths.root().display().to_string(),
        progress,
        profile,
        lock_holders,
        engine_release: ENGINE_RELEASE,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(0)
}
