use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::CalibrationMode;
use crate::util::{read_json_optional, write_json_pretty};

pub const DEFAULT_MAX_CHARS: usize = 2000;

/// Machine-specific batch settings chosen by the last benchmark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    pub batch_size: usize,
    pub max_chars: usize,
    #[serde(default)]
    pub inter_batch_delay_ms: u64,
    pub throughput: f64,
    pub efficiency: f64,
    pub benchmarked_at: String,
    pub mode: CalibrationMode,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<CalibrationProfile>> {
        read_json_optional(&self.path)
    }

    pub fn save(&self, profile: &CalibrationProfile) -> Result<()> {
        write_json_pretty(&self.path, profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_survives_a_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path().join("calibration_profile.json"));
        assert_eq!(store.load().unwrap(), None);

        let profile = CalibrationProfile {
            batch_size: 32,
            max_chars: DEFAULT_MAX_CHARS,
            inter_batch_delay_ms: 0,
            throughput: 120.5,
            efficiency: 3.25,
            benchmarked_at: "2026-01-01T00:00:00Z".to_string(),
            mode: CalibrationMode::Auto,
            model: "nomic-embed-text-v1.5.Q8_0".to_string(),
        };
        store.save(&profile).unwrap();
        assert_eq!(store.load().unwrap(), Some(profile));
    }
}
