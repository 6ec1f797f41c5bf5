use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::cli::EmbedQueryArgs;
use crate::commands::embed::local_inference_config;
use crate::inference::{LocalInference, QueryEmbedder, ServerRole};
use crate::paths::DataPaths;

#[derive(Debug, Serialize)]
struct QueryEmbedding {
    model: String,
    dimensions: usize,
    vector: Vec<f32>,
}

pub fn run(args: EmbedQueryArgs, data_dir: Option<&Path>) -> Result<i32> {
    let paths = DataPaths::resolve(data_dir)?;
    paths.ensure()?;

    let config = local_inference_config(&paths, &args.inference);
    let model = config.model.model_id().to_string();
    let mut embedder = QueryEmbedder::new(LocalInference::new(config, ServerRole::Query));
    let vector = embedder.embed_query(&args.text)?;
    info!(
        pid = ?embedder.server_pid(),
        dimensions = vector.len(),
        "query embedded"
    );
    embedder.shutdown();

    let output = QueryEmbedding {
        model,
        dimensions: vector.len(),
        vector,
    };
    println!("{}", serde_json::to_string(&output)?);
    Ok(0)
}
