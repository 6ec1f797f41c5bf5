//! Local embedding inference through a managed `llama-server` subprocess.

mod client;
mod download;
mod error;
mod provision;
mod query;
pub mod registry;
mod server;
mod weights;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

pub use download::DownloadProgress;
pub use provision::ENGINE_RELEASE;
pub use query::QueryEmbedder;
pub use server::ServerRole;
pub use weights::{DEFAULT_MODEL_URL, ModelSource};

use provision::EngineInstaller;
use server::{InferenceService, ServerConfig};

/// What the embedding job needs from an inference engine.
pub trait InferenceBackend {
    /// Makes the engine and model weights available locally.
    fn prepare(&mut self, on_progress: &mut dyn FnMut(DownloadProgress)) -> Result<()>;

    /// Starts the server if needed and returns its port.
    fn start(&mut self) -> Result<u16>;

    /// One batched request; vectors come back in input order.
    fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn stop(&mut self);

    fn server_pid(&self) -> Option<u32>;

    fn model_id(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct LocalInferenceConfig {
    pub engine_dir: PathBuf,
    pub models_dir: PathBuf,
    pub model: ModelSource,
    /// Use this executable instead of provisioning the pinned release.
    pub server_binary: Option<PathBuf>,
    pub threads: Option<usize>,
}

/// [`InferenceBackend`] backed by a provisioned `llama-server`.
#[derive(Debug)]
pub struct LocalInference {
    config: LocalInferenceConfig,
    role: ServerRole,
    service: Option<InferenceService>,
}

impl LocalInference {
    pub fn new(config: LocalInferenceConfig, role: ServerRole) -> Self {
        Self {
            config,
            role,
            service: None,
        }
    }

    fn service_mut(&mut self) -> Result<&mut InferenceService> {
        self.service
            .as_mut()
            .context("inference backend used before prepare()")
    }
}

impl InferenceBackend for LocalInference {
    fn prepare(&mut self, on_progress: &mut dyn FnMut(DownloadProgress)) -> Result<()> {
        if self.service.is_some() {
            return Ok(());
        }

        let executable = match &self.config.server_binary {
            Some(path) => path.clone(),
            None => EngineInstaller::new(&self.config.engine_dir)
                .ensure(on_progress)
                .context("failed to provision the inference engine")?,
        };
        let model = self
            .config
            .model
            .ensure(&self.config.models_dir, on_progress)
            .context("failed to fetch model weights")?;
        info!(
            executable = %executable.display(),
            model = %model.display(),
            role = self.role.as_str(),
            "inference backend prepared"
        );

        let mut server_config = ServerConfig::new(executable, model);
        server_config.threads = self.config.threads;
        self.service = Some(InferenceService::new(server_config, self.role));
        Ok(())
    }

    fn start(&mut self) -> Result<u16> {
        let port = self.service_mut()?.start()?;
        Ok(port)
    }

    fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = self.service_mut()?.embed(texts)?;
        Ok(vectors)
    }

    fn stop(&mut self) {
        if let Some(service) = self.service.as_mut() {
            service.stop();
        }
    }

    fn server_pid(&self) -> Option<u32> {
        self.service.as_ref().and_then(InferenceService::pid)
    }

    fn model_id(&self) -> String {
        self.config.model.model_id().to_string()
    }
}
