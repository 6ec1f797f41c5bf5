use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::inference::DEFAULT_MODEL_URL;
use crate::vector::DEFAULT_EMBEDDING_DIM;

#[derive(Parser, Debug)]
#[command(
    name = "chatindex",
    version,
    about = "Local hybrid search index for chat history"
)]
pub struct Cli {
    /// Root of the data directory (store, locks, models, progress).
    #[arg(long, global = true, env = "CHATINDEX_HOME")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Embed every message still carrying a placeholder vector.
    Embed(EmbedArgs),
    /// Show progress, calibration profile and lock holders.
    Status(StatusArgs),
    /// Embed one search query on a dedicated server and print the vector.
    EmbedQuery(EmbedQueryArgs),
    #[command(hide = true)]
    Preflight(PreflightArgs),
}

#[derive(Args, Debug, Clone)]
pub struct InferenceArgs {
    #[arg(long, env = "CHATINDEX_MODEL_URL", default_value = DEFAULT_MODEL_URL)]
    pub model_url: String,

    /// Use this llama-server instead of downloading the pinned release.
    #[arg(long, env = "CHATINDEX_LLAMA_SERVER")]
    pub server_binary: Option<PathBuf>,

    #[arg(long)]
    pub threads: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct EmbedArgs {
    /// Run the full calibration sweep and print the comparison table.
    #[arg(long, default_value_t = false)]
    pub benchmark: bool,

    /// Re-launch in the background with output sent to the data directory log.
    #[arg(long, default_value_t = false)]
    pub detach: bool,

    #[arg(long, hide = true, default_value_t = false)]
    pub background: bool,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long, default_value_t = 100)]
    pub write_chunk: usize,

    #[arg(long)]
    pub max_chars: Option<usize>,

    #[arg(long)]
    pub inter_batch_delay_ms: Option<u64>,

    #[arg(long, env = "CHATINDEX_DIMENSION", default_value_t = DEFAULT_EMBEDDING_DIM)]
    pub dimension: usize,

    #[arg(long, default_value_t = 500)]
    pub vector_index_every: usize,

    #[command(flatten)]
    pub inference: InferenceArgs,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Reset the persisted progress back to idle.
    #[arg(long, default_value_t = false)]
    pub clear: bool,
}

#[derive(Args, Debug, Clone)]
pub struct EmbedQueryArgs {
    #[arg(long)]
    pub text: String,

    #[command(flatten)]
    pub inference: InferenceArgs,
}

#[derive(Args, Debug, Clone)]
pub struct PreflightArgs {
    #[arg(long)]
    pub store_dir: PathBuf,

    #[arg(long)]
    pub table: Option<String>,
}
