use thiserror::Error;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("no prebuilt inference engine for {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("download of {url} failed: {detail}")]
    Download { url: String, detail: String },

    #[error("engine archive is unusable: {0}")]
    Archive(String),

    #[error("inference server exited during startup ({status}); recent stderr:\n{stderr}")]
    ExitedEarly { status: String, stderr: String },

    #[error("inference server did not become healthy within {seconds}s; recent stderr:\n{stderr}")]
    StartupTimeout { seconds: u64, stderr: String },

    #[error("embedding request failed: {0}")]
    Request(String),

    #[error("unexpected embedding response: {0}")]
    Response(String),

    #[error("inference server is not running")]
    NotRunning,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl InferenceError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
