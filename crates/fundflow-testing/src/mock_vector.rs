//! Deterministic mock vector index.

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use fundflow::adapters::VectorIndex;
use fundflow::Result;

/// Mock embedding/vector index.
///
/// Embeddings are derived from a SHA-256 of the input text, so identical
/// texts embed identically and different texts are (almost surely) far
/// apart - enough structure for dedup tests without a model. Upserted
/// vectors are searched brute-force by cosine.
pub struct MockVectorIndex {
    dimensions: usize,
    vectors: Mutex<Vec<(String, Vec<f32>)>>,
}

impl MockVectorIndex {
    /// Index with the given embedding dimension.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            vectors: Mutex::new(Vec::new()),
        }
    }

    /// Number of stored vectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vectors.lock().len()
    }

    /// True when nothing has been upserted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vectors.lock().is_empty()
    }

    fn hash_embed(&self, text: &str) -> Vec<f32> {
        let mut values = Vec::with_capacity(self.dimensions);
        let mut counter = 0u32;
        while values.len() < self.dimensions {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for byte in digest {
                if values.len() == self.dimensions {
                    break;
                }
                values.push(f32::from(byte) / 255.0 - 0.5);
            }
            counter += 1;
        }
        // Unit-normalize so cosine is a plain dot product.
        let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut values {
                *value /= norm;
            }
        }
        values
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorIndex for MockVectorIndex {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.hash_embed(text))
    }

    async fn upsert(&self, id: &str, vector: &[f32], _metadata: serde_json::Value) -> Result<()> {
        let mut vectors = self.vectors.lock();
        if let Some(entry) = vectors.iter_mut().find(|(existing, _)| existing == id) {
            entry.1 = vector.to_vec();
        } else {
            vectors.push((id.to_string(), vector.to_vec()));
        }
        Ok(())
    }

    async fn query_top_k(
        &self,
        vector: &[f32],
        k: usize,
        _filter: Option<serde_json::Value>,
    ) -> Result<Vec<(String, f32)>> {
        let vectors = self.vectors.lock();
        let mut scored: Vec<(String, f32)> = vectors
            .iter()
            .map(|(id, stored)| (id.clone(), cosine(vector, stored)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        Ok(scored)
    }
}
