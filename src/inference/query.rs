use anyhow::{Result, bail};

use super::{DownloadProgress, InferenceBackend};

/// Embeds interactive queries on its own server, separate from the
/// background job's. Started on first use and kept for later queries.
pub struct QueryEmbedder<B: InferenceBackend> {
    backend: B,
    prepared: bool,
}

impl<B: InferenceBackend> QueryEmbedder<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            prepared: false,
        }
    }

    pub fn embed_query(&mut self, text: &str) -> Result<Vec<f32>> {
        if !self.prepared {
            let mut ignore = |_: DownloadProgress| {};
            self.backend.prepare(&mut ignore)?;
            self.prepared = true;
        }
        self.backend.start()?;

        let mut vectors = self.backend.embed(&[text.to_string()])?;
        match vectors.pop() {
            Some(vector) if vectors.is_empty() => Ok(vector),
            _ => bail!("query embedding returned an unexpected number of vectors"),
        }
    }

    pub fn server_pid(&self) -> Option<u32> {
        self.backend.server_pid()
    }

    pub fn shutdown(&mut self) {
        self.backend.stop();
    }
}

impl<B: InferenceBackend> Drop for QueryEmbedder<B> {
    fn drop(&mut self) {
        self.backend.stop();
    }
}
