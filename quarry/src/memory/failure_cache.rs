//! Failure cache: (query -> failed attempt) records, searchable by query
//! similarity and used to detect recurring failure patterns.
//!
//! Records are created on execution failure, updated in place when a
//! later success is judged to resolve the same pattern, and eligible for
//! age-based eviction only while unresolved.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::plan_cache::is_older_than;
use super::{EmbeddingProvider, MemoryError, SimilarityBand, VectorIndex};
use crate::config::SimilarityConfig;
use crate::types::{ErrorCode, FailureInfo, QueryPlan};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedFailureRecord {
    pub id: Uuid,
    pub query: String,
    /// The plan that was attempted, when planning got that far.
    pub plan: Option<QueryPlan>,
    pub failed_step: Option<usize>,
    pub error_code: ErrorCode,
    pub message: String,
    pub suggested_fix: Option<String>,
    /// Plan-cache record that later resolved the same pattern.
    pub resolved_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FailureMatch {
    pub record: CachedFailureRecord,
    pub score: f64,
    pub band: SimilarityBand,
}

/// What `analyze` hands back to a caller deciding how to re-prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct RemediationAdvice {
    pub suggestion: String,
    /// The resolved failure the suggestion was lifted from, if any.
    pub from_failure: Option<Uuid>,
}

pub struct FailureCache {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    records: DashMap<Uuid, CachedFailureRecord>,
    similarity: SimilarityConfig,
}

impl FailureCache {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        similarity: SimilarityConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            records: DashMap::new(),
            similarity,
        }
    }

    pub async fn store(
        &self,
        query: &str,
        plan: Option<QueryPlan>,
        info: &FailureInfo,
    ) -> Result<Uuid, MemoryError> {
        let vector = self.embedder.embed(query).await?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.index.upsert(id, vector).await?;
        self.records.insert(
            id,
            CachedFailureRecord {
                id,
                query: query.to_string(),
                plan,
                failed_step: info.failed_step,
                error_code: info.code,
                message: info.message.clone(),
                suggested_fix: info.suggested_fix.clone(),
                resolved_by: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<FailureMatch>, MemoryError> {
        let vector = self.embedder.embed(query).await?;
        let scored = self.index.query(&vector, top_k).await?;
        Ok(scored
            .into_iter()
            .filter(|(_, score)| *score >= self.similarity.retrieval_floor)
            .filter_map(|(id, score)| {
                self.records.get(&id).map(|record| FailureMatch {
                    record: record.clone(),
                    score,
                    band: SimilarityBand::classify(score, &self.similarity),
                })
            })
            .collect())
    }

    /// Record that a later successful plan resolved this failure pattern.
    /// Returns false when the failure id is unknown.
    pub fn mark_resolved(&self, failure_id: Uuid, resolving_plan_id: Uuid) -> bool {
        match self.records.get_mut(&failure_id) {
            Some(mut record) => {
                record.resolved_by = Some(resolving_plan_id);
                record.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Remediation for a failing query: prefer the fix attached to a
    /// similar failure that was since resolved, else fall back to the
    /// canned, error-code-specific suggestion.
    pub async fn analyze(&self, query: &str, code: ErrorCode) -> RemediationAdvice {
        match self.search(query, 3).await {
            Ok(matches) => {
                for m in matches {
                    if !m.band.is_usable() || m.record.resolved_by.is_none() {
                        continue;
                    }
                    let suggestion = m
                        .record
                        .suggested_fix
                        .clone()
                        .unwrap_or_else(|| canned_suggestion(code).to_string());
                    return RemediationAdvice {
                        suggestion,
                        from_failure: Some(m.record.id),
                    };
                }
            }
            Err(e) => log::warn!("[failure_cache] similarity search failed: {}", e),
        }
        RemediationAdvice {
            suggestion: canned_suggestion(code).to_string(),
            from_failure: None,
        }
    }

    /// Age-based purge; resolved records are kept as learning material.
    pub async fn purge_older_than(&self, max_age: Duration) -> usize {
        let stale: Vec<Uuid> = self
            .records
            .iter()
            .filter(|entry| entry.resolved_by.is_none() && is_older_than(entry.created_at, max_age))
            .map(|entry| entry.id)
            .collect();

        for id in &stale {
            self.records.remove(id);
            if let Err(e) = self.index.remove(*id).await {
                log::warn!("[failure_cache] index removal failed for {}: {}", id, e);
            }
        }
        stale.len()
    }

    pub fn get(&self, id: Uuid) -> Option<CachedFailureRecord> {
        self.records.get(&id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn canned_suggestion(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::NoResults => {
            "No records matched; broaden or drop filters and verify the search phrase"
        }
        ErrorCode::ApiError => "Upstream call failed; retry later or check the entity's API path",
        ErrorCode::ExtractionFailed => {
            "The extraction field was absent from the step result; extract a field the entity actually has, such as id"
        }
        ErrorCode::PlanGenerationFailed => {
            "No provider produced a valid plan; retry or simplify the question"
        }
        ErrorCode::EntityNotFound => {
            "The target entity is not registered; check the name or register its schema"
        }
        ErrorCode::PermissionDenied => {
            "The caller lacks access to this entity; request access or target another entity"
        }
        ErrorCode::Timeout => "The backend timed out; narrow the query or retry later",
        ErrorCode::ValidationError => {
            "A step referenced a value no earlier step produced; re-plan with an explicit extraction step"
        }
        ErrorCode::Unknown => "Unrecognized failure; inspect the execution log",
    }
}
