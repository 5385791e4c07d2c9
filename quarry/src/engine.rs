//! Engine facade.
//!
//! `QueryEngine` owns every piece of process-wide state (schema cache,
//! plan/failure stores, rotation state) as explicitly constructed, injected
//! objects, built once at process start and passed by reference, so tests
//! substitute isolated instances freely. The upward contract is three
//! calls: `plan`, `execute`, `record_outcome`.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::classifier::EntityClassifier;
use crate::config::EngineConfig;
use crate::executor::adapters::AdapterSet;
use crate::executor::{ExecutionOutcome, PlanExecutor};
use crate::memory::{
    DocSnippetIndex, EmbeddingProvider, FailureCache, HashEmbedding, InMemoryVectorIndex,
    PlanCache, SimilarityBand, VectorIndex,
};
use crate::mining::ContextMiners;
use crate::planner::{GeneratedPlan, QueryPlanner};
use crate::rotation::{CompletionProvider, ModelRotator};
use crate::schema::{DocLookup, EntityRegistry, SchemaResolver};
use crate::types::{ErrorCode, FailureInfo, QueryPlan};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("a completion provider is required")]
    MissingCompletion,
    #[error("a data adapter set is required")]
    MissingAdapters,
}

pub struct QueryEngine {
    planner: QueryPlanner,
    executor: PlanExecutor,
    plan_cache: Arc<PlanCache>,
    failure_cache: Arc<FailureCache>,
    rotator: Arc<ModelRotator>,
}

impl QueryEngine {
    pub fn builder() -> QueryEngineBuilder {
        QueryEngineBuilder::new()
    }

    /// Generate a plan for a free-text query. Never fails; total provider
    /// failure yields the heuristic fallback plan.
    pub async fn plan(&self, query: &str, hinted_entities: &[String]) -> GeneratedPlan {
        self.planner.generate_plan(query, hinted_entities).await
    }

    /// Enrich and execute a plan, returning the final data and the
    /// per-step execution log.
    pub async fn execute(&self, plan: &QueryPlan) -> ExecutionOutcome {
        let enriched = self.planner.enrich_plan(plan).await;
        self.executor.execute(&enriched).await
    }

    /// Feed an outcome back into the caches, the engine's only learning
    /// signal. Success stores the plan (or bumps the matching record);
    /// failure lands in the failure cache with the attempted plan.
    pub async fn record_outcome(
        &self,
        query: &str,
        plan: &QueryPlan,
        success: bool,
        error_info: Option<FailureInfo>,
    ) {
        if success {
            let plan_record = match self.plan_cache.find_best(query).await {
                Ok(Some(m)) if m.band == SimilarityBand::High => {
                    self.plan_cache.record_success(m.record.id);
                    Some(m.record.id)
                }
                Ok(_) => match self.plan_cache.store(query, plan.clone()).await {
                    Ok(id) => Some(id),
                    Err(e) => {
                        log::warn!("[engine] failed to store successful plan: {}", e);
                        None
                    }
                },
                Err(e) => {
                    log::warn!("[engine] plan cache lookup failed: {}", e);
                    None
                }
            };
            // A success over a query that previously failed resolves the
            // recorded failure pattern.
            if let Some(resolving_id) = plan_record {
                self.resolve_matching_failures(query, resolving_id).await;
            }
        } else {
            let info = error_info.unwrap_or_else(|| FailureInfo {
                failed_step: None,
                code: ErrorCode::Unknown,
                message: "unspecified failure".to_string(),
                suggested_fix: None,
            });
            if let Err(e) = self
                .failure_cache
                .store(query, Some(plan.clone()), &info)
                .await
            {
                log::warn!("[engine] failed to store failure record: {}", e);
            }
        }
    }

    /// Mark still-unresolved failure records that closely match a now
    /// successful query as resolved by the given plan record.
    async fn resolve_matching_failures(&self, query: &str, resolving_plan_id: uuid::Uuid) {
        match self.failure_cache.search(query, 3).await {
            Ok(matches) => {
                for m in matches {
                    if m.band == SimilarityBand::High && m.record.resolved_by.is_none() {
                        self.failure_cache.mark_resolved(m.record.id, resolving_plan_id);
                        log::debug!(
                            "[engine] failure {} resolved by plan {}",
                            m.record.id,
                            resolving_plan_id
                        );
                    }
                }
            }
            Err(e) => log::warn!("[engine] failure cache lookup failed: {}", e),
        }
    }

    pub fn plan_cache(&self) -> &Arc<PlanCache> {
        &self.plan_cache
    }

    pub fn failure_cache(&self) -> &Arc<FailureCache> {
        &self.failure_cache
    }

    pub fn rotator(&self) -> &Arc<ModelRotator> {
        &self.rotator
    }
}

pub struct QueryEngineBuilder {
    config: EngineConfig,
    registry: EntityRegistry,
    source_root: Option<PathBuf>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    plan_index: Option<Arc<dyn VectorIndex>>,
    failure_index: Option<Arc<dyn VectorIndex>>,
    doc_index: Option<Arc<dyn VectorIndex>>,
    doc_lookup: Option<Arc<dyn DocLookup>>,
    completion: Option<Arc<dyn CompletionProvider>>,
    adapters: Option<AdapterSet>,
    doc_snippets: Vec<String>,
}

impl QueryEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            registry: EntityRegistry::new(),
            source_root: None,
            embedder: None,
            plan_index: None,
            failure_index: None,
            doc_index: None,
            doc_lookup: None,
            completion: None,
            adapters: None,
            doc_snippets: vec![],
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: EntityRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Source tree for the context miners.
    pub fn source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source_root = Some(root.into());
        self
    }

    pub fn embedding(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Similarity stores for plans, failures and doc snippets. Defaults to
    /// in-memory indexes when not provided.
    pub fn vector_indexes(
        mut self,
        plan: Arc<dyn VectorIndex>,
        failure: Arc<dyn VectorIndex>,
        docs: Arc<dyn VectorIndex>,
    ) -> Self {
        self.plan_index = Some(plan);
        self.failure_index = Some(failure);
        self.doc_index = Some(docs);
        self
    }

    pub fn doc_lookup(mut self, lookup: Arc<dyn DocLookup>) -> Self {
        self.doc_lookup = Some(lookup);
        self
    }

    pub fn completion(mut self, completion: Arc<dyn CompletionProvider>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn adapters(mut self, adapters: AdapterSet) -> Self {
        self.adapters = Some(adapters);
        self
    }

    /// Documentation snippet made retrievable during prompt assembly.
    pub fn doc_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.doc_snippets.push(snippet.into());
        self
    }

    pub async fn build(self) -> Result<QueryEngine, BuildError> {
        let completion = self.completion.ok_or(BuildError::MissingCompletion)?;
        let adapters = self.adapters.ok_or(BuildError::MissingAdapters)?;

        let miners = Arc::new(
            self.source_root
                .map(ContextMiners::new)
                .unwrap_or_else(ContextMiners::disabled),
        );
        let resolver = {
            let mut resolver = SchemaResolver::new(Arc::new(self.registry), miners.clone())
                .with_config(self.config.schema.clone());
            if let Some(lookup) = self.doc_lookup {
                resolver = resolver.with_doc_lookup(lookup);
            }
            Arc::new(resolver)
        };
        let classifier = Arc::new(EntityClassifier::new(resolver.clone()));

        let embedder = self
            .embedder
            .unwrap_or_else(|| Arc::new(HashEmbedding::new(self.config.memory.embedding_dimension)));
        let plan_index = self
            .plan_index
            .unwrap_or_else(|| Arc::new(InMemoryVectorIndex::new()));
        let failure_index = self
            .failure_index
            .unwrap_or_else(|| Arc::new(InMemoryVectorIndex::new()));
        let doc_vector_index = self
            .doc_index
            .unwrap_or_else(|| Arc::new(InMemoryVectorIndex::new()));

        let plan_cache = Arc::new(PlanCache::new(
            embedder.clone(),
            plan_index,
            self.config.similarity,
        ));
        let failure_cache = Arc::new(FailureCache::new(
            embedder.clone(),
            failure_index,
            self.config.similarity,
        ));
        let doc_index = Arc::new(DocSnippetIndex::new(
            embedder,
            doc_vector_index,
            self.config.similarity.retrieval_floor,
        ));
        for snippet in self.doc_snippets {
            if let Err(e) = doc_index.add(snippet).await {
                log::warn!("[engine] failed to index doc snippet: {}", e);
            }
        }

        let rotator = Arc::new(ModelRotator::new(self.config.rotation.clone()));
        let planner = QueryPlanner::new(
            resolver,
            miners,
            classifier,
            plan_cache.clone(),
            rotator.clone(),
            completion,
        )
        .with_doc_index(doc_index)
        .with_config(self.config.planner.clone());

        Ok(QueryEngine {
            planner,
            executor: PlanExecutor::new(adapters),
            plan_cache,
            failure_cache,
            rotator,
        })
    }
}

impl Default for QueryEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::adapters::{
        AdapterError, AdapterResponse, DataAdapter, FilterMap, Pagination,
    };
    use crate::rotation::CompletionError;
    use crate::schema::registry::core_entity;
    use crate::types::{AccessMethod, PlanStep, StepOperation};
    use async_trait::async_trait;
    use serde_json::json;

    struct NoCompletion;

    #[async_trait]
    impl CompletionProvider for NoCompletion {
        async fn complete(&self, _model: &str, _prompt: &str) -> Result<String, CompletionError> {
            Err(CompletionError::Other("unavailable".to_string()))
        }
    }

    struct EmptyAdapter;

    #[async_trait]
    impl DataAdapter for EmptyAdapter {
        async fn list(
            &self,
            _entity: &str,
            _filters: &FilterMap,
            _relations: &[String],
            _pagination: &Pagination,
        ) -> Result<AdapterResponse, AdapterError> {
            Ok(AdapterResponse {
                payload: json!({"data": []}),
                count: Some(0),
            })
        }

        async fn retrieve(
            &self,
            _entity: &str,
            _filters: &FilterMap,
            _relations: &[String],
            _pagination: &Pagination,
        ) -> Result<AdapterResponse, AdapterError> {
            Ok(AdapterResponse {
                payload: json!({"data": []}),
                count: None,
            })
        }

        async fn list_and_count(
            &self,
            _entity: &str,
            _filters: &FilterMap,
            _relations: &[String],
            _pagination: &Pagination,
        ) -> Result<AdapterResponse, AdapterError> {
            Ok(AdapterResponse {
                payload: json!({"data": []}),
                count: Some(0),
            })
        }
    }

    async fn engine() -> QueryEngine {
        QueryEngine::builder()
            .registry(EntityRegistry::new().with(core_entity(
                "order",
                AccessMethod::HttpApi,
                &["items"],
                &["status"],
            )))
            .completion(Arc::new(NoCompletion))
            .adapters(AdapterSet::uniform(Arc::new(EmptyAdapter)))
            .build()
            .await
            .unwrap()
    }

    fn sample_plan() -> QueryPlan {
        QueryPlan {
            steps: vec![PlanStep::new(1, "order", StepOperation::List)],
            final_entity: "order".to_string(),
            explanation: "list orders".to_string(),
            action: None,
        }
    }

    #[tokio::test]
    async fn test_builder_requires_collaborators() {
        let missing = QueryEngine::builder().build().await;
        assert!(matches!(missing, Err(BuildError::MissingCompletion)));

        let missing = QueryEngine::builder()
            .completion(Arc::new(NoCompletion))
            .build()
            .await;
        assert!(matches!(missing, Err(BuildError::MissingAdapters)));
    }

    #[tokio::test]
    async fn test_successful_outcome_lands_in_plan_cache() {
        let engine = engine().await;
        engine
            .record_outcome("list all orders", &sample_plan(), true, None)
            .await;
        assert_eq!(engine.plan_cache().len(), 1);

        // The same query succeeding again bumps the counter instead of
        // duplicating the record.
        engine
            .record_outcome("list all orders", &sample_plan(), true, None)
            .await;
        assert_eq!(engine.plan_cache().len(), 1);
        let best = engine
            .plan_cache()
            .find_best("list all orders")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(best.record.success_count, 2);
    }

    #[tokio::test]
    async fn test_failed_outcome_lands_in_failure_cache() {
        let engine = engine().await;
        engine
            .record_outcome(
                "orders for customer nobody",
                &sample_plan(),
                false,
                Some(FailureInfo {
                    failed_step: Some(1),
                    code: ErrorCode::NoResults,
                    message: "no rows".to_string(),
                    suggested_fix: None,
                }),
            )
            .await;

        assert_eq!(engine.failure_cache().len(), 1);
        let matches = engine
            .failure_cache()
            .search("orders for customer nobody", 1)
            .await
            .unwrap();
        assert_eq!(matches[0].record.error_code, ErrorCode::NoResults);
        assert!(matches[0].record.plan.is_some());
    }

    #[tokio::test]
    async fn test_later_success_resolves_recorded_failure() {
        let engine = engine().await;
        let query = "list all orders";

        engine
            .record_outcome(
                query,
                &sample_plan(),
                false,
                Some(FailureInfo {
                    failed_step: Some(1),
                    code: ErrorCode::ApiError,
                    message: "upstream down".to_string(),
                    suggested_fix: None,
                }),
            )
            .await;
        engine
            .record_outcome(query, &sample_plan(), true, None)
            .await;

        let matches = engine.failure_cache().search(query, 1).await.unwrap();
        let resolved_by = matches[0].record.resolved_by;
        assert!(resolved_by.is_some());
        assert!(engine.plan_cache().get(resolved_by.unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_execute_runs_enriched_plan() {
        let engine = engine().await;
        let outcome = engine.execute(&sample_plan()).await;
        assert!(outcome.success());
        assert_eq!(outcome.final_result, Some(json!([])));
    }
}
