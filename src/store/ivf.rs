//! Inverted-file partitioning for approximate nearest-neighbour search.
//!
//! Vectors are clustered with a few rounds of Lloyd's k-means; a query only
//! scans the rows assigned to its closest partitions.

use crate::vector::squared_distance;

pub const MAX_PARTITIONS: usize = 256;
const TRAINING_ITERATIONS: usize = 10;

#[derive(Debug, Clone)]
pub struct IvfModel {
    pub centroids: Vec<Vec<f32>>,
    pub assignments: Vec<usize>,
}

/// Square root of the row count, the usual default for IVF partition counts.
pub fn default_partition_count(rows: usize) -> usize {
    ((rows as f64).sqrt().round() as usize).clamp(1, MAX_PARTITIONS)
}

pub fn train(vectors: &[Vec<f32>], partitions: usize) -> IvfModel {
    if vectors.is_empty() {
        return IvfModel {
            centroids: Vec::new(),
            assignments: Vec::new(),
        };
    }

    let k = partitions.clamp(1, vectors.len());
    let stride = vectors.len() / k;
    let mut centroids = (0..k)
        .map(|index| vectors[index * stride].clone())
        .collect::<Vec<Vec<f32>>>();
    let mut assignments = vec![0usize; vectors.len()];

    for _ in 0..TRAINING_ITERATIONS {
        let mut changed = false;
        for (row, vector) in vectors.iter().enumerate() {
            let nearest = nearest_centroid(&centroids, vector);
            if assignments[row] != nearest {
                assignments[row] = nearest;
                changed = true;
            }
        }

        let dims = centroids[0].len();
        let mut sums = vec![vec![0_f64; dims]; k];
        let mut counts = vec![0usize; k];
        for (row, vector) in vectors.iter().enumerate() {
            let cluster = assignments[row];
            counts[cluster] += 1;
            for (sum, value) in sums[cluster].iter_mut().zip(vector.iter()) {
                *sum += f64::from(*value);
            }
        }

        for cluster in 0..k {
            // An empty cluster keeps its previous centroid.
            if counts[cluster] == 0 {
                continue;
            }
            centroids[cluster] = sums[cluster]
                .iter()
                .map(|sum| (*sum / counts[cluster] as f64) as f32)
                .collect();
        }

        if !changed {
            break;
        }
    }

    IvfModel {
        centroids,
        assignments,
    }
}

pub fn nearest_centroid(centroids: &[Vec<f32>], vector: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_distance = f64::MAX;
    for (index, centroid) in centroids.iter().enumerate() {
        let distance = squared_distance(centroid, vector);
        if distance < best_distance {
            best = index;
            best_distance = distance;
        }
    }
    best
}
