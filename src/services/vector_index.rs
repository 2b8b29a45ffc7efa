//! Exact nearest-neighbour search over catalog embeddings.
//!
//! The index is a flat row-major matrix scanned in full for every query:
//! O(n·d) per search, deterministic, and with no approximation error. With the
//! cosine metric rows are normalized once at build time and the query at
//! search time, so both sides of every comparison use the same metric.

use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::fmt::Display;

use crate::{
    error::{AppError, AppResult},
    models::CatalogId,
};

/// Similarity metric, fixed per index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cosine,
    InnerProduct,
}

impl Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::Cosine => write!(f, "cosine"),
            Metric::InnerProduct => write!(f, "inner_product"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub id: CatalogId,
    pub score: f32,
}

/// Heap entry ordered so that "greater" means "ranks higher":
/// higher score first, then lower id.
#[derive(Debug, Clone, Copy)]
struct Ranked {
    score: f32,
    id: CatalogId,
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        // -0.0 and 0.0 are the same similarity
        (self.score + 0.0)
            .total_cmp(&(other.score + 0.0))
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    metric: Metric,
    dimension: usize,
    ids: Vec<CatalogId>,
    matrix: Vec<f32>,
}

impl VectorIndex {
    /// Builds an index where row `i` of `vectors` belongs to `ids[i]`
    pub fn build(vectors: Vec<Vec<f32>>, ids: Vec<CatalogId>, metric: Metric) -> AppResult<Self> {
        if vectors.len() != ids.len() {
            return Err(AppError::IndexUnavailable(format!(
                "Vector count {} does not match id count {}",
                vectors.len(),
                ids.len()
            )));
        }

        let dimension = match vectors.first() {
            Some(first) if !first.is_empty() => first.len(),
            Some(_) => {
                return Err(AppError::IndexUnavailable(
                    "Embedding vectors have zero dimension".to_string(),
                ))
            }
            None => {
                return Err(AppError::IndexUnavailable(
                    "Cannot build an index with no rows".to_string(),
                ))
            }
        };

        let mut seen = HashSet::with_capacity(ids.len());
        let mut matrix = Vec::with_capacity(vectors.len() * dimension);

        for (mut vector, id) in vectors.into_iter().zip(ids.iter()) {
            if !seen.insert(*id) {
                return Err(AppError::IndexUnavailable(format!(
                    "Id {} appears more than once",
                    id
                )));
            }
            if vector.len() != dimension {
                return Err(AppError::IndexUnavailable(format!(
                    "Vector for id {} has dimension {} (expected {})",
                    id,
                    vector.len(),
                    dimension
                )));
            }
            if vector.iter().any(|v| !v.is_finite()) {
                return Err(AppError::IndexUnavailable(format!(
                    "Vector for id {} contains non-finite values",
                    id
                )));
            }

            if metric == Metric::Cosine {
                normalize(&mut vector);
            }
            matrix.extend_from_slice(&vector);
        }

        Ok(Self {
            metric,
            dimension,
            ids,
            matrix,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Row → id mapping, in row order
    pub fn ids(&self) -> &[CatalogId] {
        &self.ids
    }

    /// Returns the `min(k, len)` best rows, best first, ties by ascending id
    pub fn search(&self, query: &[f32], k: usize) -> AppResult<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(AppError::IndexUnavailable(format!(
                "Query vector has dimension {} but the index has {}",
                query.len(),
                self.dimension
            )));
        }
        if query.iter().any(|v| !v.is_finite()) {
            return Err(AppError::InvalidInput(
                "Query embedding contains non-finite values".to_string(),
            ));
        }

        let k = k.min(self.len());
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut query = query.to_vec();
        if self.metric == Metric::Cosine {
            normalize(&mut query);
        }

        // Min-heap of the k best so far; the root is the weakest kept entry
        let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(k + 1);
        for (row, id) in self.ids.iter().enumerate() {
            let start = row * self.dimension;
            let score = dot(&query, &self.matrix[start..start + self.dimension]);
            let entry = Ranked { score, id: *id };

            if heap.len() < k {
                heap.push(Reverse(entry));
            } else if let Some(Reverse(weakest)) = heap.peek() {
                if entry > *weakest {
                    heap.pop();
                    heap.push(Reverse(entry));
                }
            }
        }

        let mut ranked: Vec<Ranked> = heap.into_iter().map(|Reverse(entry)| entry).collect();
        ranked.sort_by(|a, b| b.cmp(a));

        Ok(ranked
            .into_iter()
            .map(|entry| SearchHit {
                id: entry.id,
                score: entry.score,
            })
            .collect())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Scales to unit length; zero vectors are left as they are
fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[u64]) -> Vec<CatalogId> {
        values.iter().map(|v| CatalogId(*v)).collect()
    }

    fn sample_index(metric: Metric) -> VectorIndex {
        VectorIndex::build(
            vec![
                vec![1.0, 0.0, 0.0],
                vec![0.0, 1.0, 0.0],
                vec![0.7, 0.7, 0.0],
                vec![0.0, 0.0, 2.0],
            ],
            ids(&[10, 20, 30, 40]),
            metric,
        )
        .unwrap()
    }

    #[test]
    fn test_build_keeps_row_to_id_mapping() {
        let index = sample_index(Metric::Cosine);
        assert_eq!(index.len(), 4);
        assert_eq!(index.dimension(), 3);
        assert_eq!(index.ids(), ids(&[10, 20, 30, 40]).as_slice());
    }

    #[test]
    fn test_search_orders_by_score() {
        let index = sample_index(Metric::Cosine);
        let hits = index.search(&[1.0, 0.1, 0.0], 3).unwrap();

        let found: Vec<u64> = hits.iter().map(|h| h.id.0).collect();
        assert_eq!(found, vec![10, 30, 20]);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_cosine_ignores_magnitude() {
        let index = sample_index(Metric::Cosine);
        let hits = index.search(&[0.0, 0.0, 0.5], 1).unwrap();
        assert_eq!(hits[0].id, CatalogId(40));
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_inner_product_keeps_magnitude() {
        let index = sample_index(Metric::InnerProduct);
        let hits = index.search(&[0.0, 0.0, 1.0], 1).unwrap();
        assert_eq!(hits[0].id, CatalogId(40));
        assert!((hits[0].score - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_ties_broken_by_id() {
        let index = VectorIndex::build(
            vec![vec![1.0, 0.0], vec![1.0, 0.0], vec![1.0, 0.0], vec![0.0, 1.0]],
            ids(&[9, 3, 5, 1]),
            Metric::Cosine,
        )
        .unwrap();

        let hits = index.search(&[1.0, 0.0], 3).unwrap();
        let found: Vec<u64> = hits.iter().map(|h| h.id.0).collect();
        assert_eq!(found, vec![3, 5, 9]);
    }

    #[test]
    fn test_signed_zero_scores_tie_by_id() {
        let index = VectorIndex::build(
            vec![vec![-1.0, -1.0], vec![1.0, 1.0]],
            ids(&[1, 2]),
            Metric::Cosine,
        )
        .unwrap();

        let hits = index.search(&[0.0, 0.0], 2).unwrap();
        let found: Vec<u64> = hits.iter().map(|h| h.id.0).collect();
        assert_eq!(found, vec![1, 2]);
    }

    #[test]
    fn test_k_larger_than_index_returns_all() {
        let index = sample_index(Metric::Cosine);
        let hits = index.search(&[1.0, 1.0, 1.0], 100).unwrap();
        assert_eq!(hits.len(), 4);
    }

    #[test]
    fn test_k_zero_returns_nothing() {
        let index = sample_index(Metric::Cosine);
        assert!(index.search(&[1.0, 0.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_search_is_deterministic() {
        let index = sample_index(Metric::Cosine);
        let first = index.search(&[0.3, 0.2, 0.1], 4).unwrap();
        let second = index.search(&[0.3, 0.2, 0.1], 4).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_query_dimension_mismatch() {
        let index = sample_index(Metric::Cosine);
        assert!(index.search(&[1.0, 0.0], 1).is_err());
    }

    #[test]
    fn test_build_rejects_misaligned_input() {
        let result = VectorIndex::build(vec![vec![1.0]], ids(&[1, 2]), Metric::Cosine);
        assert!(result.is_err());
    }

    #[test]
    fn test_build_rejects_mixed_dimensions() {
        let result = VectorIndex::build(
            vec![vec![1.0, 0.0], vec![1.0]],
            ids(&[1, 2]),
            Metric::Cosine,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_build_rejects_duplicate_ids() {
        let result = VectorIndex::build(
            vec![vec![1.0], vec![2.0]],
            ids(&[1, 1]),
            Metric::InnerProduct,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_build_rejects_empty_and_non_finite() {
        assert!(VectorIndex::build(vec![], vec![], Metric::Cosine).is_err());
        assert!(VectorIndex::build(vec![vec![f32::NAN]], ids(&[1]), Metric::Cosine).is_err());
    }

    #[test]
    fn test_metric_serialization() {
        assert_eq!(serde_json::to_string(&Metric::Cosine).unwrap(), "\"cosine\"");
        assert_eq!(
            serde_json::to_string(&Metric::InnerProduct).unwrap(),
            "\"inner_product\""
        );
    }
}
