//! Query planner.
//!
//! Turns a free-text question plus detected entity names into a sanitized,
//! executable `QueryPlan`. Schema resolution and context mining run
//! concurrently, the plan cache contributes worked examples (or a verbatim
//! high-band reuse), model providers are tried in rotation order, and if
//! every attempt fails a heuristic single-step plan is produced. The
//! planner never fails a query outright.

pub mod prompt;
pub mod sanitize;

pub use sanitize::PlanParseError;

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use itertools::Itertools;

use crate::classifier::{Classification, EntityClassifier, ResponseExpectation};
use crate::config::PlannerConfig;
use crate::memory::{DocSnippetIndex, PlanCache, SimilarityBand};
use crate::mining::ContextMiners;
use crate::rotation::{CompletionProvider, ModelRotator, STEP_KIND_PLANNING};
use crate::schema::SchemaResolver;
use crate::types::{EntityDescriptor, FilterValue, PlanStep, QueryPlan, StepOperation};

// `"John Smith"` / `'John Smith'` quoted phrases.
static QUOTED_PHRASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"]+)"|'([^']+)'"#).unwrap());

// Multi-word Capitalized Phrase, the usual shape of a name in a question.
static CAPITALIZED_PHRASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)\b").unwrap());

/// Where a generated plan came from.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanSource {
    /// High-band cache match reused verbatim.
    CacheHit { record_id: Uuid },
    /// Produced by a model provider.
    Model { provider: String },
    /// Heuristic single-step fallback after every provider failed.
    Fallback,
}

/// Trace of planning decisions for debugging and audit.
#[derive(Debug, Default)]
pub struct PlanningTrace {
    pub query: String,
    pub events: Vec<TraceEvent>,
}

impl PlanningTrace {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            events: vec![],
        }
    }

    pub fn push(&mut self, event: TraceEvent) {
        self.events.push(event);
    }
}

#[derive(Debug)]
pub enum TraceEvent {
    CacheSearched { matches: usize },
    CacheHit { record_id: Uuid, score: f64 },
    ProviderAttempted { provider: String },
    ProviderFailed { provider: String, reason: String },
    ProviderRateLimited { provider: String },
    PlanAccepted { provider: String, steps: usize },
    OperationCoerced { step: usize, raw: String },
    PaginationStripped { step: usize, key: String },
    InvalidReferenceDropped { step: usize, key: String, referenced: usize },
    RelationsDropped { step: usize, entity: String, dropped: Vec<String> },
    FallbackUsed { entity: String },
}

/// Result of a planning call.
#[derive(Debug)]
pub struct GeneratedPlan {
    pub plan: QueryPlan,
    pub source: PlanSource,
    pub trace: PlanningTrace,
}

/// A plan step augmented with everything the executor needs: its
/// classification, expected response shape, a human-readable description,
/// and its dependency set.
#[derive(Debug, Clone)]
pub struct EnrichedStep {
    pub step: PlanStep,
    pub classification: Classification,
    pub expectation: ResponseExpectation,
    pub description: String,
    pub depends_on: BTreeSet<usize>,
}

#[derive(Debug, Clone)]
pub struct EnrichedPlan {
    pub steps: Vec<EnrichedStep>,
    pub final_entity: String,
    pub explanation: String,
}

pub struct QueryPlanner {
    resolver: Arc<SchemaResolver>,
    miners: Arc<ContextMiners>,
    classifier: Arc<EntityClassifier>,
    plan_cache: Arc<PlanCache>,
    doc_index: Option<Arc<DocSnippetIndex>>,
    rotator: Arc<ModelRotator>,
    completion: Arc<dyn CompletionProvider>,
    config: PlannerConfig,
}

impl QueryPlanner {
    pub fn new(
        resolver: Arc<SchemaResolver>,
        miners: Arc<ContextMiners>,
        classifier: Arc<EntityClassifier>,
        plan_cache: Arc<PlanCache>,
        rotator: Arc<ModelRotator>,
        completion: Arc<dyn CompletionProvider>,
    ) -> Self {
        Self {
            resolver,
            miners,
            classifier,
            plan_cache,
            doc_index: None,
            rotator,
            completion,
            config: PlannerConfig::default(),
        }
    }

    pub fn with_doc_index(mut self, doc_index: Arc<DocSnippetIndex>) -> Self {
        self.doc_index = Some(doc_index);
        self
    }

    pub fn with_config(mut self, config: PlannerConfig) -> Self {
        self.config = config;
        self
    }

    /// Generate a plan for a query. Never fails: total provider failure
    /// degrades to the heuristic fallback plan.
    pub async fn generate_plan(&self, query: &str, detected_entities: &[String]) -> GeneratedPlan {
        let request_id = Uuid::new_v4().to_string();
        let mut trace = PlanningTrace::new(query);

        // Schema resolution, context mining and the cache lookup are all
        // read-only and independent; run them concurrently.
        let miners = Arc::clone(&self.miners);
        let mine_handle = tokio::task::spawn_blocking(move || miners.mine().clone());
        let (descriptors, mined, cache_result) = tokio::join!(
            self.resolver.resolve_many(detected_entities),
            async move { mine_handle.await.unwrap_or_default() },
            self.plan_cache.search(query, self.config.max_worked_examples)
        );

        let worked = match cache_result {
            Ok(matches) => matches,
            Err(e) => {
                log::warn!("[planner] plan cache search failed: {}", e);
                vec![]
            }
        };
        trace.push(TraceEvent::CacheSearched {
            matches: worked.len(),
        });

        if let Some(best) = worked.iter().find(|m| m.band == SimilarityBand::High) {
            trace.push(TraceEvent::CacheHit {
                record_id: best.record.id,
                score: best.score,
            });
            log::debug!(
                "[planner] {} high-band cache hit ({:.3}) reused verbatim",
                request_id,
                best.score
            );
            return GeneratedPlan {
                plan: best.record.plan.clone(),
                source: PlanSource::CacheHit {
                    record_id: best.record.id,
                },
                trace,
            };
        }
        let examples: Vec<&crate::memory::PlanMatch> = worked
            .iter()
            .filter(|m| m.band == SimilarityBand::Moderate)
            .collect();

        let snippets = match &self.doc_index {
            Some(index) => index
                .search(query, self.config.max_doc_snippets)
                .await
                .unwrap_or_else(|e| {
                    log::warn!("[planner] doc snippet search failed: {}", e);
                    vec![]
                }),
            None => vec![],
        };

        let mut described: Vec<&EntityDescriptor> = descriptors.values().collect();
        described.sort_by(|a, b| a.name.cmp(&b.name));
        let prompt = prompt::build_prompt(query, &described, &mined, &examples, &snippets);

        for model_id in self.rotator.get_models(STEP_KIND_PLANNING, &request_id) {
            trace.push(TraceEvent::ProviderAttempted {
                provider: model_id.clone(),
            });
            self.rotator.pace_before_call().await;

            match self.completion.complete(&model_id, &prompt).await {
                Ok(response) => match sanitize::parse_model_plan(&response) {
                    Ok(raw) => {
                        let plan = sanitize::sanitize_plan(&self.classifier, raw, &mut trace).await;
                        self.rotator.mark_success(&model_id);
                        trace.push(TraceEvent::PlanAccepted {
                            provider: model_id.clone(),
                            steps: plan.steps.len(),
                        });
                        return GeneratedPlan {
                            plan,
                            source: PlanSource::Model { provider: model_id },
                            trace,
                        };
                    }
                    Err(e) => {
                        log::debug!("[planner] {} rejected response from {}: {}", request_id, model_id, e);
                        trace.push(TraceEvent::ProviderFailed {
                            provider: model_id,
                            reason: e.to_string(),
                        });
                    }
                },
                Err(e) => {
                    if ModelRotator::is_rate_limit_error(&e) {
                        self.rotator.mark_rate_limited(&model_id);
                        trace.push(TraceEvent::ProviderRateLimited { provider: model_id });
                    } else {
                        trace.push(TraceEvent::ProviderFailed {
                            provider: model_id,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        let plan = self.fallback_plan(query, detected_entities, &descriptors);
        log::info!(
            "[planner] {} all providers failed; heuristic fallback targeting {}",
            request_id,
            plan.final_entity
        );
        trace.push(TraceEvent::FallbackUsed {
            entity: plan.final_entity.clone(),
        });
        GeneratedPlan {
            plan,
            source: PlanSource::Fallback,
            trace,
        }
    }

    /// Heuristic single-step plan: first detected entity (or the
    /// configured default), a `q` filter from a quoted or capitalized
    /// phrase when one is present, and up to three registered relations.
    fn fallback_plan(
        &self,
        query: &str,
        detected_entities: &[String],
        descriptors: &HashMap<String, EntityDescriptor>,
    ) -> QueryPlan {
        let entity = detected_entities
            .first()
            .map(|e| e.to_lowercase())
            .or_else(|| self.config.default_entity.clone())
            .or_else(|| self.resolver.registry().names().next().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());

        let mut step = PlanStep::new(1, entity.clone(), StepOperation::List);
        if let Some(phrase) = extract_search_phrase(query) {
            step.filters.insert("q".to_string(), FilterValue::literal(phrase));
        }
        if let Some(descriptor) = descriptors
            .get(&entity)
            .or_else(|| self.resolver.registry().get(&entity))
        {
            step.relations = descriptor
                .relations
                .iter()
                .take(self.config.max_fallback_relations)
                .cloned()
                .collect();
        }

        QueryPlan {
            steps: vec![step],
            final_entity: entity.clone(),
            explanation: format!("Fallback plan: list {} matching the question", entity),
            action: None,
        }
    }

    /// Augment a plan with classifications, response expectations,
    /// descriptions and dependency sets. Always applied before execution,
    /// independent of where the plan came from.
    pub async fn enrich_plan(&self, plan: &QueryPlan) -> EnrichedPlan {
        let mut steps = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            let classification = self.classifier.classify(&step.entity).await;
            let expectation = self
                .classifier
                .response_expectation(&step.entity, classification.is_core)
                .await;
            let depends_on = EntityClassifier::find_dependencies(&step.filters);
            let description = describe_step(step, &depends_on);
            steps.push(EnrichedStep {
                step: step.clone(),
                classification,
                expectation,
                description,
                depends_on,
            });
        }
        EnrichedPlan {
            steps,
            final_entity: plan.final_entity.clone(),
            explanation: plan.explanation.clone(),
        }
    }
}

/// Quoted phrase first, else a multi-word capitalized phrase.
fn extract_search_phrase(query: &str) -> Option<String> {
    if let Some(captures) = QUOTED_PHRASE.captures(query) {
        let phrase = captures
            .get(1)
            .or_else(|| captures.get(2))
            .map(|m| m.as_str().trim().to_string());
        if let Some(phrase) = phrase {
            if !phrase.is_empty() {
                return Some(phrase);
            }
        }
    }
    CAPITALIZED_PHRASE
        .captures(query)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn describe_step(step: &PlanStep, depends_on: &BTreeSet<usize>) -> String {
    let mut text = format!("Step {}: {} {}", step.step, step.operation.as_str(), step.entity);
    if !step.filters.is_empty() {
        text.push_str(&format!(" filtered by {}", step.filters.keys().join(", ")));
    }
    if !step.relations.is_empty() {
        text.push_str(&format!(" expanding {}", step.relations.join(", ")));
    }
    if let Some(extract) = &step.extract {
        text.push_str(&format!(" extracting {}", extract));
    }
    if !depends_on.is_empty() {
        let deps: Vec<String> = depends_on.iter().map(|d| d.to_string()).collect();
        text.push_str(&format!(" (uses step {})", deps.join(", ")));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RotationConfig, SimilarityConfig};
    use crate::memory::{HashEmbedding, InMemoryVectorIndex};
    use crate::rotation::CompletionError;
    use crate::schema::registry::{core_entity, with_cross_ref};
    use crate::schema::EntityRegistry;
    use crate::types::AccessMethod;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedCompletion {
        responses: Vec<Result<String, &'static str>>,
        calls: AtomicUsize,
    }

    impl ScriptedCompletion {
        fn new(responses: Vec<Result<String, &'static str>>) -> Self {
            Self {
                responses,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedCompletion {
        async fn complete(&self, _model: &str, _prompt: &str) -> Result<String, CompletionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.responses.get(call) {
                Some(Ok(text)) => Ok(text.clone()),
                Some(Err(message)) => Err(CompletionError::Other(message.to_string())),
                None => Err(CompletionError::Other("script exhausted".to_string())),
            }
        }
    }

    fn registry() -> Arc<EntityRegistry> {
        Arc::new(
            EntityRegistry::new()
                .with(core_entity("customer", AccessMethod::HttpApi, &[], &["q", "name"]))
                .with(with_cross_ref(
                    core_entity(
                        "order",
                        AccessMethod::HttpApi,
                        &["items"],
                        &["status", "customer_id"],
                    ),
                    "customer_id",
                    "customer",
                    &["q"],
                )),
        )
    }

    fn planner_with(completion: Arc<ScriptedCompletion>, providers: usize) -> QueryPlanner {
        let resolver = Arc::new(SchemaResolver::new(
            registry(),
            Arc::new(ContextMiners::disabled()),
        ));
        let classifier = Arc::new(EntityClassifier::new(resolver.clone()));
        let plan_cache = Arc::new(PlanCache::new(
            Arc::new(HashEmbedding::default()),
            Arc::new(InMemoryVectorIndex::new()),
            SimilarityConfig::default(),
        ));
        let mut routes = std::collections::HashMap::new();
        routes.insert(
            STEP_KIND_PLANNING.to_string(),
            (0..providers).map(|i| format!("model-{}", i)).collect(),
        );
        let rotator = Arc::new(ModelRotator::new(RotationConfig {
            routes,
            min_call_spacing: Duration::ZERO,
            rate_limit_cooldown: Duration::ZERO,
            demotion_window: Duration::from_secs(60),
        }));
        QueryPlanner::new(
            resolver,
            Arc::new(ContextMiners::disabled()),
            classifier,
            plan_cache,
            rotator,
            completion,
        )
    }

    const GOOD_PLAN: &str = r#"```json
{
  "steps": [
    {"step": 1, "entity": "customer", "operation": "list", "filters": {"q": "John Smith"}, "extract": "id"},
    {"step": 2, "entity": "order", "operation": "list", "filters": {"customer_id": "$1", "limit": 5}, "relations": ["items", "fake"]}
  ],
  "finalEntity": "order",
  "explanation": "Resolve the customer, then list orders."
}
```"#;

    #[tokio::test]
    async fn test_model_plan_is_parsed_and_sanitized() {
        let completion = Arc::new(ScriptedCompletion::new(vec![Ok(GOOD_PLAN.to_string())]));
        let planner = planner_with(completion, 1);

        let generated = planner
            .generate_plan(
                "show orders for customer John Smith",
                &["customer".to_string(), "order".to_string()],
            )
            .await;

        assert_eq!(
            generated.source,
            PlanSource::Model {
                provider: "model-0".to_string()
            }
        );
        let plan = &generated.plan;
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].relations, vec!["items"]);
        assert!(!plan.steps[1].filters.contains_key("limit"));
        assert_eq!(
            plan.steps[1].filters["customer_id"],
            FilterValue::step_ref(1)
        );
    }

    #[tokio::test]
    async fn test_second_provider_wins_after_first_fails() {
        let completion = Arc::new(ScriptedCompletion::new(vec![
            Ok("this is not a plan".to_string()),
            Ok(GOOD_PLAN.to_string()),
        ]));
        let planner = planner_with(completion, 2);

        let generated = planner
            .generate_plan("orders for John Smith", &["order".to_string()])
            .await;
        assert_eq!(
            generated.source,
            PlanSource::Model {
                provider: "model-1".to_string()
            }
        );
        assert!(generated
            .trace
            .events
            .iter()
            .any(|e| matches!(e, TraceEvent::ProviderFailed { .. })));
    }

    #[tokio::test]
    async fn test_fallback_guarantee_when_every_provider_throws() {
        let completion = Arc::new(ScriptedCompletion::new(vec![
            Err("boom"),
            Err("rate limit exceeded"),
        ]));
        let planner = planner_with(completion, 2);

        let generated = planner
            .generate_plan(
                r#"orders for "John Smith" please"#,
                &["order".to_string()],
            )
            .await;

        assert_eq!(generated.source, PlanSource::Fallback);
        let plan = &generated.plan;
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].entity, "order");
        assert_eq!(plan.final_entity, "order");
        assert_eq!(
            plan.steps[0].filters["q"],
            FilterValue::literal("John Smith")
        );
        assert_eq!(plan.steps[0].relations, vec!["items"]);
        assert!(generated
            .trace
            .events
            .iter()
            .any(|e| matches!(e, TraceEvent::ProviderRateLimited { .. })));
    }

    #[tokio::test]
    async fn test_high_band_cache_hit_skips_providers() {
        let completion = Arc::new(ScriptedCompletion::new(vec![]));
        let planner = planner_with(completion.clone(), 1);

        let cached = QueryPlan {
            steps: vec![PlanStep::new(1, "order", StepOperation::List)],
            final_entity: "order".to_string(),
            explanation: "cached".to_string(),
            action: None,
        };
        planner
            .plan_cache
            .store("list all orders", cached.clone())
            .await
            .unwrap();

        let generated = planner.generate_plan("list all orders", &[]).await;
        assert!(matches!(generated.source, PlanSource::CacheHit { .. }));
        assert_eq!(generated.plan, cached);
        assert_eq!(completion.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_enrich_plan_builds_executor_input() {
        let completion = Arc::new(ScriptedCompletion::new(vec![]));
        let planner = planner_with(completion, 0);

        let plan = QueryPlan {
            steps: vec![
                PlanStep::new(1, "customer", StepOperation::List)
                    .with_filter("q", FilterValue::literal("Acme"))
                    .with_extract("id"),
                PlanStep::new(2, "order", StepOperation::List)
                    .with_filter("customer_id", FilterValue::step_ref(1))
                    .with_relations(vec!["items".to_string()]),
            ],
            final_entity: "order".to_string(),
            explanation: "two step".to_string(),
            action: None,
        };

        let enriched = planner.enrich_plan(&plan).await;
        assert_eq!(enriched.steps.len(), 2);
        assert!(enriched.steps[0].classification.is_core);
        assert!(enriched.steps[0].depends_on.is_empty());
        assert_eq!(
            enriched.steps[1].depends_on.iter().copied().collect::<Vec<_>>(),
            vec![1]
        );
        assert!(enriched.steps[1].description.contains("order"));
        assert!(enriched.steps[1].description.contains("uses step 1"));
    }

    #[test]
    fn test_extract_search_phrase_forms() {
        assert_eq!(
            extract_search_phrase(r#"orders for "John Smith" please"#),
            Some("John Smith".to_string())
        );
        assert_eq!(
            extract_search_phrase("orders for customer John Smith"),
            Some("John Smith".to_string())
        );
        assert_eq!(extract_search_phrase("list all orders"), None);
    }
}
