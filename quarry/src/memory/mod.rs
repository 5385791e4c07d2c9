//! Similarity-searchable stores.
//!
//! The plan cache and failure cache are the engine's only learning signal:
//! successful plans are stored with an embedding of their originating
//! query, failures likewise, and future planning retrieves them by vector
//! similarity. The embedding function and the vector index are injected;
//! in-memory defaults are provided for tests and single-process
//! deployments.

pub mod docs;
pub mod failure_cache;
pub mod plan_cache;

pub use docs::DocSnippetIndex;
pub use failure_cache::{CachedFailureRecord, FailureCache, FailureMatch, RemediationAdvice};
pub use plan_cache::{CachedPlanRecord, PlanCache, PlanMatch};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::config::SimilarityConfig;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("vector index failed: {0}")]
    Index(String),
}

/// Compute cosine similarity between two embeddings.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum();
    let mag_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

/// Embedding service for semantic matching, injected.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;
}

/// Similarity-search store, injected. Implementations only hold vectors;
/// record metadata stays with the caches.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, id: Uuid, vector: Vec<f32>) -> Result<(), MemoryError>;
    /// Ranked `(id, score)` pairs, best first.
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<(Uuid, f64)>, MemoryError>;
    async fn remove(&self, id: Uuid) -> Result<(), MemoryError>;
}

/// Classification of how closely a new query matches a cached one.
/// `High` is safe to reuse verbatim, `Moderate` serves as a worked example
/// only, `Low` is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimilarityBand {
    High,
    Moderate,
    Low,
}

impl SimilarityBand {
    pub fn classify(score: f64, config: &SimilarityConfig) -> Self {
        if score >= config.high {
            SimilarityBand::High
        } else if score >= config.moderate {
            SimilarityBand::Moderate
        } else {
            SimilarityBand::Low
        }
    }

    /// Whether a match of this band may be used at all (as example or
    /// verbatim).
    pub fn is_usable(&self) -> bool {
        !matches!(self, SimilarityBand::Low)
    }
}

/// Cache counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
}

/// Exhaustive-scan vector index. Fine for the record counts the caches
/// hold in one process; larger deployments inject a real store.
#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    vectors: DashMap<Uuid, Vec<f32>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, id: Uuid, vector: Vec<f32>) -> Result<(), MemoryError> {
        self.vectors.insert(id, vector);
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<(Uuid, f64)>, MemoryError> {
        let mut scored: Vec<(Uuid, f64)> = self
            .vectors
            .iter()
            .map(|entry| (*entry.key(), cosine_similarity(vector, entry.value())))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn remove(&self, id: Uuid) -> Result<(), MemoryError> {
        self.vectors.remove(&id);
        Ok(())
    }
}

/// Deterministic hash-based embedder. Identical text always maps to the
/// identical unit vector; unrelated text lands near-orthogonal because the
/// components are centered. Used as the default and in tests; production
/// deployments inject a model-backed provider.
#[derive(Debug, Clone)]
pub struct HashEmbedding {
    dimension: usize,
}

impl HashEmbedding {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn generate(&self, text: &str) -> Vec<f32> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        text.trim().to_lowercase().hash(&mut hasher);
        let hash = hasher.finish();

        let mut embedding = Vec::with_capacity(self.dimension);
        for i in 0..self.dimension {
            let seed = hash.wrapping_add(i as u64);
            let mut local = DefaultHasher::new();
            seed.hash(&mut local);
            // Centered so unrelated texts score near zero cosine.
            let value = local.finish() as f32 / u64::MAX as f32 - 0.5;
            embedding.push(value);
        }

        normalize(&mut embedding);
        embedding
    }
}

impl Default for HashEmbedding {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        Ok(self.generate(text))
    }
}

fn normalize(vector: &mut [f32]) {
    let magnitude: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in vector.iter_mut() {
            *value /= magnitude;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_embedding_is_deterministic_and_normalized() {
        let embedder = HashEmbedding::default();
        let a = embedder.generate("show open orders");
        let b = embedder.generate("show open orders");
        let c = embedder.generate("something else entirely");

        assert_eq!(a, b);
        assert_ne!(a, c);
        let magnitude: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_unrelated_texts_score_low() {
        let embedder = HashEmbedding::default();
        let a = embedder.generate("show open orders");
        let b = embedder.generate("quarterly revenue by region");
        assert!(cosine_similarity(&a, &b).abs() < 0.5);
    }

    #[test]
    fn test_band_classification() {
        let config = SimilarityConfig::default();
        assert_eq!(SimilarityBand::classify(0.95, &config), SimilarityBand::High);
        assert_eq!(
            SimilarityBand::classify(0.75, &config),
            SimilarityBand::Moderate
        );
        assert_eq!(SimilarityBand::classify(0.3, &config), SimilarityBand::Low);
        assert!(!SimilarityBand::Low.is_usable());
    }

    #[tokio::test]
    async fn test_in_memory_index_ranks_by_similarity() {
        let embedder = HashEmbedding::default();
        let index = InMemoryVectorIndex::new();

        let target = Uuid::new_v4();
        let other = Uuid::new_v4();
        index
            .upsert(target, embedder.generate("list customers"))
            .await
            .unwrap();
        index
            .upsert(other, embedder.generate("completely different"))
            .await
            .unwrap();

        let results = index
            .query(&embedder.generate("list customers"), 2)
            .await
            .unwrap();
        assert_eq!(results[0].0, target);
        assert!(results[0].1 > 0.999);
        assert!(results[1].1 < results[0].1);
    }
}
