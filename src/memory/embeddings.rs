//! Embedding providers.
//!
//! The store only needs "text → fixed-length unit vector". Real models plug
//! in behind [`EmbeddingProvider`]; [`HashEmbeddings`] is a deterministic
//! stand-in that keeps the similarity path exercisable without one.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::MemoryError;

/// Computes embeddings for text.
///
/// Contract: deterministic for a given input, unit L2 norm, and always
/// `dimension()` components long.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;
}

/// Hash-derived pseudo-embeddings.
///
/// Identical text maps to identical vectors; anything else is effectively
/// random, so only exact matches score high.
#[derive(Debug, Clone)]
pub struct HashEmbeddings {
    dimension: usize,
}

impl HashEmbeddings {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn compute(&self, text: &str) -> Vec<f32> {
        let mut vector = Vec::with_capacity(self.dimension);
        let mut block: u32 = 0;

        while vector.len() < self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(block.to_le_bytes());
            hasher.update(text.as_bytes());
            let digest = hasher.finalize();

            for byte in digest.iter() {
                if vector.len() == self.dimension {
                    break;
                }
                vector.push(f32::from(*byte) / 127.5 - 1.0);
            }
            block = block.wrapping_add(1);
        }

        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddings {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        if self.dimension == 0 {
            return Err(MemoryError::Embedding {
                reason: "embedding dimension must be positive".to_string(),
            });
        }
        Ok(self.compute(text))
    }
}

/// Scale `vector` to unit length in place.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    } else if let Some(first) = vector.first_mut() {
        *first = 1.0;
    }
}
