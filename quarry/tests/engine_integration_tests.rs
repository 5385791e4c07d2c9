//! End-to-end engine tests: plan generation through execution and the
//! learning loop, with scripted model and adapter collaborators.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quarry::config::{EngineConfig, RotationConfig};
use quarry::executor::adapters::{
    AdapterError, AdapterResponse, AdapterSet, DataAdapter, FilterMap, Pagination,
};
use quarry::planner::PlanSource;
use quarry::prelude::*;
use quarry::rotation::{CompletionError, STEP_KIND_PLANNING};
use quarry::schema::registry::{core_entity, with_cross_ref};
use quarry::types::{ErrorCode, FailureInfo, FilterValue, StepOperation};

/// Completion provider that replays a fixed response and counts calls.
struct FixedCompletion {
    response: Result<String, String>,
    calls: AtomicUsize,
}

impl FixedCompletion {
    fn ok(response: &str) -> Self {
        Self {
            response: Ok(response.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    fn failing(message: &str) -> Self {
        Self {
            response: Err(message.to_string()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CompletionProvider for FixedCompletion {
    async fn complete(&self, _model: &str, _prompt: &str) -> Result<String, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.response {
            Ok(text) => Ok(text.clone()),
            Err(message) => Err(CompletionError::Other(message.clone())),
        }
    }
}

/// Adapter with canned rows per entity.
struct FixtureAdapter {
    rows: HashMap<String, serde_json::Value>,
}

impl FixtureAdapter {
    fn new() -> Self {
        let mut rows = HashMap::new();
        rows.insert(
            "customer".to_string(),
            json!([{"id": "cus_42", "name": "John Smith"}]),
        );
        rows.insert(
            "order".to_string(),
            json!([
                {"id": "ord_1", "status": "open", "items": [{"sku": "A"}]},
                {"id": "ord_2", "status": "shipped", "items": []}
            ]),
        );
        Self { rows }
    }

    fn respond(&self, entity: &str) -> Result<AdapterResponse, AdapterError> {
        match self.rows.get(entity) {
            Some(rows) => Ok(AdapterResponse {
                payload: json!({ "data": rows }),
                count: rows.as_array().map(|a| a.len() as u64),
            }),
            None => Err(AdapterError::NotFound(entity.to_string())),
        }
    }
}

#[async_trait]
impl DataAdapter for FixtureAdapter {
    async fn list(
        &self,
        entity: &str,
        _filters: &FilterMap,
        _relations: &[String],
        _pagination: &Pagination,
    ) -> Result<AdapterResponse, AdapterError> {
        self.respond(entity)
    }

    async fn retrieve(
        &self,
        entity: &str,
        _filters: &FilterMap,
        _relations: &[String],
        _pagination: &Pagination,
    ) -> Result<AdapterResponse, AdapterError> {
        self.respond(entity)
    }

    async fn list_and_count(
        &self,
        entity: &str,
        _filters: &FilterMap,
        _relations: &[String],
        _pagination: &Pagination,
    ) -> Result<AdapterResponse, AdapterError> {
        self.respond(entity)
    }
}

fn registry() -> EntityRegistry {
    EntityRegistry::new()
        .with(core_entity(
            "customer",
            AccessMethod::HttpApi,
            &[],
            &["q", "name"],
        ))
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
        ))
}

fn engine_config() -> EngineConfig {
    let mut routes = HashMap::new();
    routes.insert(STEP_KIND_PLANNING.to_string(), vec!["primary".to_string()]);
    let mut config = EngineConfig::default();
    config.rotation = RotationConfig {
        routes,
        min_call_spacing: Duration::ZERO,
        rate_limit_cooldown: Duration::ZERO,
        demotion_window: Duration::from_secs(60),
    };
    config
}

async fn engine_with(completion: Arc<FixedCompletion>) -> QueryEngine {
    QueryEngine::builder()
        .config(engine_config())
        .registry(registry())
        .completion(completion)
        .adapters(AdapterSet::uniform(Arc::new(FixtureAdapter::new())))
        .build()
        .await
        .expect("engine builds")
}

const TWO_STEP_RESPONSE: &str = r#"```json
{
  "steps": [
    {"step": 1, "entity": "customer", "operation": "list",
     "filters": {"q": "John Smith", "limit": 10}, "extract": "id"},
    {"step": 2, "entity": "order", "operation": "list",
     "filters": {"customer_id": "$1"}, "relations": ["items", "bogus_relation"]}
  ],
  "finalEntity": "order",
  "explanation": "Resolve the customer id, then list that customer's orders."
}
```"#;

#[tokio::test]
async fn test_two_step_scenario_plans_and_executes() {
    let completion = Arc::new(FixedCompletion::ok(TWO_STEP_RESPONSE));
    let engine = engine_with(completion).await;

    let generated = engine
        .plan(
            "show orders for customer John Smith",
            &["customer".to_string(), "order".to_string()],
        )
        .await;

    assert_eq!(
        generated.source,
        PlanSource::Model {
            provider: "primary".to_string()
        }
    );

    // The exact two-step shape: resolve the customer, then list orders.
    let plan = &generated.plan;
    assert_eq!(plan.final_entity, "order");
    assert_eq!(plan.steps.len(), 2);

    let first = &plan.steps[0];
    assert_eq!(first.entity, "customer");
    assert_eq!(first.operation, StepOperation::List);
    assert_eq!(first.filters["q"], FilterValue::literal("John Smith"));
    assert_eq!(first.extract.as_deref(), Some("id"));
    assert!(!first.filters.contains_key("limit"), "pagination key survived");

    let second = &plan.steps[1];
    assert_eq!(second.entity, "order");
    assert_eq!(second.operation, StepOperation::List);
    assert_eq!(second.filters["customer_id"], FilterValue::step_ref(1));
    assert_eq!(second.relations, vec!["items"]);

    // Execute: step 2's back-reference resolves to the extracted id and
    // the final entity's rows come back with a full per-step log.
    let outcome = engine.execute(plan).await;
    assert!(outcome.success());
    assert_eq!(outcome.step_logs.len(), 2);
    assert!(outcome.step_logs.iter().all(|l| l.success));
    let rows = outcome.final_result.expect("order rows");
    assert_eq!(rows.as_array().map(|a| a.len()), Some(2));
}

#[tokio::test]
async fn test_learning_loop_reuses_recorded_plan() {
    let completion = Arc::new(FixedCompletion::ok(TWO_STEP_RESPONSE));
    let engine = engine_with(completion.clone()).await;

    let query = "show orders for customer John Smith";
    let generated = engine
        .plan(query, &["customer".to_string(), "order".to_string()])
        .await;
    engine
        .record_outcome(query, &generated.plan, true, None)
        .await;
    let calls_after_first = completion.calls.load(Ordering::SeqCst);
    assert_eq!(calls_after_first, 1);

    // Replanning the same query is a verbatim high-band cache hit; no
    // model call is spent.
    let replanned = engine
        .plan(query, &["customer".to_string(), "order".to_string()])
        .await;
    assert!(matches!(replanned.source, PlanSource::CacheHit { .. }));
    assert_eq!(replanned.plan, generated.plan);
    assert_eq!(completion.calls.load(Ordering::SeqCst), calls_after_first);
}

#[tokio::test]
async fn test_total_provider_failure_still_yields_a_plan() {
    let completion = Arc::new(FixedCompletion::failing("rate limit exceeded"));
    let engine = engine_with(completion).await;

    let generated = engine
        .plan(
            "show orders for customer John Smith",
            &["order".to_string()],
        )
        .await;

    assert_eq!(generated.source, PlanSource::Fallback);
    let plan = &generated.plan;
    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.steps[0].entity, "order");
    assert_eq!(
        plan.steps[0].filters["q"],
        FilterValue::literal("John Smith")
    );
    assert_eq!(plan.steps[0].relations, vec!["items"]);

    // The fallback plan is executable as-is.
    let outcome = engine.execute(plan).await;
    assert!(outcome.success());

    // And the rate-limited provider was demoted.
    assert_eq!(engine.rotator().metrics().rate_limits, 1);
}

#[tokio::test]
async fn test_failure_outcome_feeds_failure_cache_analysis() {
    let completion = Arc::new(FixedCompletion::failing("no capacity"));
    let engine = engine_with(completion).await;

    let query = "orders for customer Nobody Atall";
    let generated = engine.plan(query, &["order".to_string()]).await;
    engine
        .record_outcome(
            query,
            &generated.plan,
            false,
            Some(FailureInfo {
                failed_step: Some(1),
                code: ErrorCode::NoResults,
                message: "no customer matched".to_string(),
                suggested_fix: None,
            }),
        )
        .await;

    assert_eq!(engine.failure_cache().len(), 1);
    let advice = engine
        .failure_cache()
        .analyze(query, ErrorCode::NoResults)
        .await;
    // Unresolved failures fall back to the canned per-code suggestion.
    assert!(advice.suggestion.contains("No records matched"));
    assert!(advice.from_failure.is_none());
}
