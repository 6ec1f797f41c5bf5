use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::util::ensure_directory;

pub const APP_DIR_NAME: &str = "chatindex";

/// On-disk layout of the per-user data directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Explicit override first, then the platform data directory.
    pub fn resolve(override_root: Option<&Path>) -> Result<Self> {
        if let Some(root) = override_root {
            return Ok(Self::new(root));
        }

        let base = dirs_next::data_dir()
            .or_else(dirs_next::home_dir)
            .context("unable to determine a per-user data directory")?;
        Ok(Self::new(base.join(APP_DIR_NAME)))
    }

    pub fn ensure(&self) -> Result<()> {
        ensure_directory(&self.root)?;
        ensure_directory(&self.locks_dir())?;
        ensure_directory(&self.models_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    pub fn engine_dir(&self) -> PathBuf {
        self.root.join("bin").join("llama")
    }

    pub fn progress_path(&self) -> PathBuf {
        self.root.join("embedding_progress.json")
    }

    pub fn profile_path(&self) -> PathBuf {
        self.root.join("calibration_profile.json")
    }

    pub fn detached_log_path(&self) -> PathBuf {
        self.root.join("embed.log")
    }
}
