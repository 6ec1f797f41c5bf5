use std::path::{Path, PathBuf};

use tracing::debug;

use super::download::{DownloadProgress, download_file};
use super::error::InferenceError;

pub const DEFAULT_MODEL_FILE: &str = "nomic-embed-text-v1.5.Q8_0.gguf";
pub const DEFAULT_MODEL_URL: &str =
    "https://huggingface.co/nomic-ai/nomic-embed-text-v1.5-GGUF/resolve/main/nomic-embed-text-v1.5.Q8_0.gguf";

/// Where to fetch GGUF weights from and where they live locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSource {
    pub url: String,
    pub file_name: String,
}

impl Default for ModelSource {
    fn default() -> Self {
        Self {
            url: DEFAULT_MODEL_URL.to_string(),
            file_name: DEFAULT_MODEL_FILE.to_string(),
        }
    }
}

impl ModelSource {
    /// The file name is the last path segment of `url`.
    pub fn from_url(url: &str) -> Self {
        let file_name = url
            .split(['?', '#'])
            .next()
            .unwrap_or(url)
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(DEFAULT_MODEL_FILE)
            .to_string();
        Self {
            url: url.to_string(),
            file_name,
        }
    }

    pub fn model_id(&self) -> &str {
        self.file_name
            .strip_suffix(".gguf")
            .unwrap_or(&self.file_name)
    }

    pub fn local_path(&self, models_dir: &Path) -> PathBuf {
        models_dir.join(&self.file_name)
    }

    /// Downloads the weights unless a non-empty file is already present.
    pub fn ensure(
        &self,
        models_dir: &Path,
        on_progress: &mut dyn FnMut(DownloadProgress),
    ) -> Result<PathBuf, InferenceError> {
        let path = self.local_path(models_dir);
        let present = std::fs::metadata(&path)
            .map(|metadata| metadata.is_file() && metadata.len() > 0)
            .unwrap_or(false);
        if present {
            debug!(path = %path.display(), "model weights already present");
            return Ok(path);
        }

        download_file(&self.url, &path, on_progress)?;
        Ok(path)
    }
}
