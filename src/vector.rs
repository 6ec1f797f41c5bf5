pub const DEFAULT_EMBEDDING_DIM: usize = 768;

pub fn encode_vector_blob(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::<u8>::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decodes a little-endian f32 blob. A blob whose length is not a multiple of
/// four is rejected rather than truncated.
pub fn decode_vector_blob(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }

    let mut out = Vec::<f32>::with_capacity(blob.len() / 4);
    for chunk in blob.chunks_exact(4) {
        out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Some(out)
}

pub fn placeholder_vector(dimensions: usize) -> Vec<f32> {
    vec![0_f32; dimensions]
}

pub fn is_placeholder(values: &[f32]) -> bool {
    values.iter().all(|value| *value == 0.0)
}

/// A row needs embedding when it still carries the placeholder or when its
/// vector was produced by a model with a different dimension.
pub fn needs_embedding(values: &[f32], dimensions: usize) -> bool {
    values.len() != dimensions || is_placeholder(values)
}

pub fn squared_distance(left: &[f32], right: &[f32]) -> f64 {
    left.iter()
        .zip(right.iter())
        .map(|(left_value, right_value)| {
            let delta = f64::from(*left_value) - f64::from(*right_value);
            delta * delta
        })
        .sum::<f64>()
}
