//! Documentation snippet index.
//!
//! A small similarity-searchable store of prose snippets (API notes,
//! entity guides) that the planner folds into its prompt. Shares the
//! embedding/index substrate with the plan and failure caches.

use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{EmbeddingProvider, MemoryError, VectorIndex};

pub struct DocSnippetIndex {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    snippets: DashMap<Uuid, String>,
    retrieval_floor: f64,
}

impl DocSnippetIndex {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        retrieval_floor: f64,
    ) -> Self {
        Self {
            embedder,
            index,
            snippets: DashMap::new(),
            retrieval_floor,
        }
    }

    pub async fn add(&self, snippet: impl Into<String>) -> Result<Uuid, MemoryError> {
        let snippet = snippet.into();
        let vector = self.embedder.embed(&snippet).await?;
        let id = Uuid::new_v4();
        self.index.upsert(id, vector).await?;
        self.snippets.insert(id, snippet);
        Ok(id)
    }

    /// Snippets relevant to the query, best first.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<String>, MemoryError> {
        let vector = self.embedder.embed(query).await?;
        let scored = self.index.query(&vector, top_k).await?;
        Ok(scored
            .into_iter()
            .filter(|(_, score)| *score >= self.retrieval_floor)
            .filter_map(|(id, _)| self.snippets.get(&id).map(|s| s.clone()))
            .collect())
    }

    pub fn len(&self) -> usize {
        self.snippets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HashEmbedding, InMemoryVectorIndex};

    #[tokio::test]
    async fn test_add_and_search() {
        let index = DocSnippetIndex::new(
            Arc::new(HashEmbedding::default()),
            Arc::new(InMemoryVectorIndex::new()),
            0.5,
        );
        index
            .add("orders support the items relation for line details")
            .await
            .unwrap();

        let hits = index
            .search("orders support the items relation for line details", 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let none = index.search("unrelated astronomy question", 2).await.unwrap();
        assert!(none.is_empty());
    }
}
