//! Entity classifier.
//!
//! Answers, for any entity name: is it core, how is it reached, and which
//! relations are real. `validate_relations` is the single authoritative
//! gate that prevents a plan from requesting a relation that does not
//! exist; `find_dependencies` derives a step's dependency edges from its
//! filter map so the planner never has to declare them explicitly.

use std::collections::BTreeSet;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::schema::SchemaResolver;
use crate::types::{AccessMethod, EntityCategory, FilterValue};

/// How an entity should be approached by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Pre-registered entities are core: owned data, authoritative schema.
    pub is_core: bool,
    pub category: EntityCategory,
    pub access: AccessMethod,
    pub valid_relations: Vec<String>,
}

/// Result of gating proposed relations against the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationCheck {
    pub valid: Vec<String>,
    pub invalid: Vec<String>,
}

/// Where the rows live inside an access method's response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultEnvelope {
    /// `{ "data": [...], "count": n }` wrapper (http-api).
    DataField,
    /// Bare record or array (in-process services).
    Bare,
    /// `{ "nodes": [...] }` wrapper (graph traversal).
    Nodes,
}

/// Expected response shape, so the executor extracts results uniformly
/// regardless of access method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseExpectation {
    pub envelope: ResultEnvelope,
    pub is_core: bool,
}

pub struct EntityClassifier {
    resolver: Arc<SchemaResolver>,
}

impl EntityClassifier {
    pub fn new(resolver: Arc<SchemaResolver>) -> Self {
        Self { resolver }
    }

    pub async fn classify(&self, entity: &str) -> Classification {
        let descriptor = self.resolver.resolve(entity).await;
        Classification {
            is_core: descriptor.category == EntityCategory::PreRegistered,
            category: descriptor.category,
            access: descriptor.access,
            valid_relations: descriptor.relations,
        }
    }

    /// Strip relations absent from the registry and report what was
    /// dropped.
    pub async fn validate_relations(&self, entity: &str, proposed: &[String]) -> RelationCheck {
        let descriptor = self.resolver.resolve(entity).await;
        let (valid, invalid): (Vec<String>, Vec<String>) = proposed
            .iter()
            .cloned()
            .partition(|relation| descriptor.relations.iter().any(|r| r == relation));
        if !invalid.is_empty() {
            log::debug!(
                "[classifier] dropped {} invalid relation(s) for {}: {}",
                invalid.len(),
                entity,
                invalid.join(", ")
            );
        }
        RelationCheck { valid, invalid }
    }

    pub async fn response_expectation(&self, entity: &str, is_core: bool) -> ResponseExpectation {
        let descriptor = self.resolver.resolve(entity).await;
        ResponseExpectation {
            envelope: envelope_for(descriptor.access),
            is_core,
        }
    }

    /// Step indices a filter map depends on. Tolerates planner mistakes:
    /// edges come from the filters that actually exist, not from anything
    /// the planner declared.
    pub fn find_dependencies(filters: &IndexMap<String, FilterValue>) -> BTreeSet<usize> {
        filters
            .values()
            .filter_map(|value| match value {
                FilterValue::StepRef { step, .. } => Some(*step),
                FilterValue::Literal(_) => None,
            })
            .collect()
    }
}

pub(crate) fn envelope_for(access: AccessMethod) -> ResultEnvelope {
    match access {
        AccessMethod::HttpApi => ResultEnvelope::DataField,
        AccessMethod::InProcessService => ResultEnvelope::Bare,
        AccessMethod::GraphTraversal => ResultEnvelope::Nodes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mining::ContextMiners;
    use crate::schema::registry::core_entity;
    use crate::schema::EntityRegistry;

    fn classifier() -> EntityClassifier {
        let registry = Arc::new(
            EntityRegistry::new()
                .with(core_entity(
                    "design",
                    AccessMethod::GraphTraversal,
                    &["specifications", "revisions"],
                    &["q"],
                ))
                .with(core_entity("order", AccessMethod::HttpApi, &["items"], &["status"])),
        );
        let resolver = SchemaResolver::new(registry, Arc::new(ContextMiners::disabled()));
        EntityClassifier::new(Arc::new(resolver))
    }

    #[tokio::test]
    async fn test_classify_core_entity() {
        let classification = classifier().classify("order").await;
        assert!(classification.is_core);
        assert_eq!(classification.access, AccessMethod::HttpApi);
        assert_eq!(classification.valid_relations, vec!["items"]);
    }

    #[tokio::test]
    async fn test_validate_relations_gates_unregistered_names() {
        let check = classifier()
            .validate_relations(
                "design",
                &["specifications".to_string(), "bogus_relation".to_string()],
            )
            .await;
        assert_eq!(check.valid, vec!["specifications"]);
        assert_eq!(check.invalid, vec!["bogus_relation"]);
    }

    #[tokio::test]
    async fn test_unknown_entity_has_no_valid_relations() {
        let check = classifier()
            .validate_relations("mystery", &["anything".to_string()])
            .await;
        assert!(check.valid.is_empty());
        assert_eq!(check.invalid, vec!["anything"]);
    }

    #[tokio::test]
    async fn test_response_expectation_follows_access_method() {
        let c = classifier();
        let http = c.response_expectation("order", true).await;
        assert_eq!(http.envelope, ResultEnvelope::DataField);
        let graph = c.response_expectation("design", true).await;
        assert_eq!(graph.envelope, ResultEnvelope::Nodes);
    }

    #[test]
    fn test_find_dependencies_scans_filter_values() {
        let mut filters = IndexMap::new();
        filters.insert("status".to_string(), FilterValue::literal("open"));
        filters.insert("customer_id".to_string(), FilterValue::step_ref(1));
        filters.insert(
            "design_id".to_string(),
            FilterValue::StepRef {
                step: 2,
                field: Some("id".to_string()),
            },
        );

        let deps = EntityClassifier::find_dependencies(&filters);
        assert_eq!(deps.into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }
}
