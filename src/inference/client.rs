use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::InferenceError;
use crate::util::duration_millis;

pub const MODEL_ALIAS: &str = "embedding";
const MAX_RESPONSE_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EmbeddingItem {
    pub index: usize,
    pub embedding: EmbeddingValue,
}

/// Some server builds wrap a pooled embedding in an extra array.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingValue {
    Flat(Vec<f32>),
    Nested(Vec<Vec<f32>>),
}

impl EmbeddingValue {
    fn into_vector(self) -> Vec<f32> {
        match self {
            Self::Flat(values) => values,
            Self::Nested(rows) => rows.into_iter().next().unwrap_or_default(),
        }
    }
}

/// Posts one batched `/embeddings` request and returns vectors in input
/// order.
pub fn embed_batch(
    agent: &ureq::Agent,
    base_url: &str,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, InferenceError> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let body = serde_json::to_vec(&EmbeddingRequest {
        input: texts,
        model: MODEL_ALIAS,
    })
    .map_err(|err| InferenceError::Request(format!("failed to serialize request: {err}")))?;

    let started = std::time::Instant::now();
    let mut response = agent
        .post(format!("{base_url}/embeddings"))
        .header("Content-Type", "application/json")
        .send(&body[..])
        .map_err(|err| InferenceError::Request(err.to_string()))?;

    let text = response
        .body_mut()
        .with_config()
        .limit(MAX_RESPONSE_BYTES)
        .read_to_string()
        .map_err(|err| InferenceError::Request(format!("failed to read response: {err}")))?;
    debug!(
        texts = texts.len(),
        elapsed_ms = duration_millis(started.elapsed()),
        "embedding request finished"
    );

    let parsed: EmbeddingResponse = serde_json::from_str(&text).map_err(|err| {
        InferenceError::Response(format!(
            "{err}: {}",
            text.chars().take(200).collect::<String>()
        ))
    })?;
    order_by_index(parsed.data, texts.len())
}

/// Results may come back in any order under continuous batching; sort by
/// the server-assigned index and require exactly one result per input.
pub fn order_by_index(
    mut items: Vec<EmbeddingItem>,
    expected: usize,
) -> Result<Vec<Vec<f32>>, InferenceError> {
    if items.len() != expected {
        return Err(InferenceError::Response(format!(
            "expected {expected} embeddings, received {}",
            items.len()
        )));
    }

    items.sort_by_key(|item| item.index);
    for (position, item) in items.iter().enumerate() {
        if item.index != position {
            return Err(InferenceError::Response(format!(
                "embedding indices are not 0..{expected}: found {} at position {position}",
                item.index
            )));
        }
    }

    Ok(items
        .into_iter()
        .map(|item| item.embedding.into_vector())
        .collect())
}
