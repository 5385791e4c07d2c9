//! Plan cache: (query -> plan) records, searchable by query similarity.
//!
//! Records are created on first successful execution and never
//! hard-deleted except by explicit purge or age-based eviction. Reuse
//! bumps the success counter and `last_used`; age-based eviction keys on
//! `last_used` so a plan that keeps earning reuse is never evicted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{CacheStats, EmbeddingProvider, MemoryError, SimilarityBand, VectorIndex};
use crate::config::SimilarityConfig;
use crate::types::QueryPlan;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPlanRecord {
    pub id: Uuid,
    pub query: String,
    pub plan: QueryPlan,
    pub success_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// A ranked cache match.
#[derive(Debug, Clone)]
pub struct PlanMatch {
    pub record: CachedPlanRecord,
    pub score: f64,
    pub band: SimilarityBand,
}

pub struct PlanCache {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    records: DashMap<Uuid, CachedPlanRecord>,
    by_query: DashMap<String, Uuid>,
    similarity: SimilarityConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
}

impl PlanCache {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        similarity: SimilarityConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            records: DashMap::new(),
            by_query: DashMap::new(),
            similarity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            puts: AtomicU64::new(0),
        }
    }

    /// Embed and upsert. A verbatim-identical query updates its existing
    /// record in place (plan replaced, success counter bumped) rather than
    /// creating a duplicate.
    pub async fn store(&self, query: &str, plan: QueryPlan) -> Result<Uuid, MemoryError> {
        let key = normalize_query(query);

        if let Some(existing) = self.by_query.get(&key) {
            let id = *existing;
            drop(existing);
            if let Some(mut record) = self.records.get_mut(&id) {
                record.plan = plan;
                record.success_count += 1;
                record.last_used = Utc::now();
                return Ok(id);
            }
        }

        let vector = self.embedder.embed(query).await?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.index.upsert(id, vector).await?;
        self.records.insert(
            id,
            CachedPlanRecord {
                id,
                query: query.to_string(),
                plan,
                success_count: 1,
                created_at: now,
                last_used: now,
            },
        );
        self.by_query.insert(key, id);
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Ranked matches above the retrieval floor, banded.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<PlanMatch>, MemoryError> {
        let vector = self.embedder.embed(query).await?;
        let scored = self.index.query(&vector, top_k).await?;

        let matches: Vec<PlanMatch> = scored
            .into_iter()
            .filter(|(_, score)| *score >= self.similarity.retrieval_floor)
            .filter_map(|(id, score)| {
                self.records.get(&id).map(|record| PlanMatch {
                    record: record.clone(),
                    score,
                    band: SimilarityBand::classify(score, &self.similarity),
                })
            })
            .collect();

        if matches.is_empty() {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(matches)
    }

    /// Top match, only if it clears the moderate threshold.
    pub async fn find_best(&self, query: &str) -> Result<Option<PlanMatch>, MemoryError> {
        let matches = self.search(query, 1).await?;
        Ok(matches.into_iter().find(|m| m.band.is_usable()))
    }

    /// The engine's learning signal: reuse bumps the counter and
    /// freshness. Lost updates under concurrency are tolerated.
    pub fn record_success(&self, id: Uuid) {
        if let Some(mut record) = self.records.get_mut(&id) {
            record.success_count += 1;
            record.last_used = Utc::now();
        }
    }

    pub fn get(&self, id: Uuid) -> Option<CachedPlanRecord> {
        self.records.get(&id).map(|r| r.clone())
    }

    /// Evict records not used within `max_age`. Returns how many were
    /// removed.
    pub async fn purge_older_than(&self, max_age: Duration) -> usize {
        let stale: Vec<Uuid> = self
            .records
            .iter()
            .filter(|entry| is_older_than(entry.last_used, max_age))
            .map(|entry| entry.id)
            .collect();

        for id in &stale {
            if let Some((_, record)) = self.records.remove(id) {
                self.by_query.remove(&normalize_query(&record.query));
            }
            if let Err(e) = self.index.remove(*id).await {
                log::warn!("[plan_cache] index removal failed for {}: {}", id, e);
            }
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn normalize_query(query: &str) -> String {
    query.trim().to_lowercase()
}

pub(crate) fn is_older_than(timestamp: DateTime<Utc>, max_age: Duration) -> bool {
    (Utc::now() - timestamp)
        .to_std()
        .map(|age| age > max_age)
        .unwrap_or(false)
}
