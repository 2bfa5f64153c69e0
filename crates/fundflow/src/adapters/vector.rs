//! Vector-index adapter for semantic similarity lookups.

use async_trait::async_trait;

use crate::error::Result;

/// Embedding/vector index shared client. Scores returned by
/// `query_top_k` are cosine similarities in [-1, 1].
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Embed a text with the index's embedding model.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Upsert a vector with metadata under `id`.
    async fn upsert(&self, id: &str, vector: &[f32], metadata: serde_json::Value) -> Result<()>;

    /// Nearest neighbours of `vector`, optionally filtered, as
    /// `(id, cosine score)` pairs.
    async fn query_top_k(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<serde_json::Value>,
    ) -> Result<Vec<(String, f32)>>;
}
