//! Similarity index contract and an exact inner-product implementation.

use std::cmp::Ordering;

use crate::error::MemoryError;

/// Append-only vector index searched by inner product.
///
/// Slots are dense, assigned in insertion order starting at 0, and only
/// reused after [`clear`](VectorIndex::clear).
pub trait VectorIndex: Send + Sync {
    fn dimension(&self) -> usize;

    /// Append a vector, returning its slot.
    fn add(&mut self, vector: &[f32]) -> Result<usize, MemoryError>;

    /// Up to `limit` `(slot, score)` pairs, best first.
    fn search(&self, query: &[f32], limit: usize) -> Vec<(usize, f32)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);
}

/// Brute-force index. Exact, linear in the number of vectors.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

impl FlatIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Vec::new(),
        }
    }
}

impl VectorIndex for FlatIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn add(&mut self, vector: &[f32]) -> Result<usize, MemoryError> {
        if vector.len() != self.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        self.vectors.push(vector.to_vec());
        Ok(self.vectors.len() - 1)
    }

    fn search(&self, query: &[f32], limit: usize) -> Vec<(usize, f32)> {
        if query.len() != self.dimension || limit == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(slot, v)| (slot, dot(v, query)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.truncate(limit);
        scored
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn clear(&mut self) {
        self.vectors.clear();
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
