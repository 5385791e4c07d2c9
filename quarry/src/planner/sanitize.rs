//! Parsing and sanitization of model-produced plans.
//!
//! Raw model output is fence-stripped, parsed into typed raw-plan
//! structures, then sanitized. Sanitization is a hard invariant, not
//! optional cleanup: invalid relations are dropped through the classifier
//! gate, unknown operations are coerced to `list`, pagination keys are
//! stripped from filters, and forward or self references are removed so
//! the surviving plan is a backward-edged DAG by construction.

use indexmap::IndexMap;
use serde::Deserialize;
use thiserror::Error;

use super::{PlanningTrace, TraceEvent};
use crate::classifier::EntityClassifier;
use crate::types::{
    AccessMethod, FilterValue, PlanStep, QueryPlan, StepOperation, PAGINATION_KEYS,
};

/// Why a model response did not yield a usable plan. Treated as a planning
/// failure for that provider; the next candidate is tried.
#[derive(Debug, Error)]
pub enum PlanParseError {
    #[error("response is not valid plan JSON: {0}")]
    Json(String),
    #[error("plan has no steps")]
    Empty,
    #[error("plan has no final entity")]
    NoFinalEntity,
}

/// Plan as the model wrote it, before sanitization.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawPlan {
    pub steps: Vec<RawStep>,
    pub final_entity: String,
    pub explanation: String,
    #[serde(default)]
    pub action: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawStep {
    pub entity: String,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub filters: IndexMap<String, FilterValue>,
    #[serde(default)]
    pub relations: Vec<String>,
    #[serde(default)]
    pub extract: Option<String>,
    #[serde(default)]
    pub access_hint: Option<AccessMethod>,
}

/// Strip code fencing and isolate the JSON object in a model response.
pub(crate) fn extract_json(response: &str) -> &str {
    if let Some(start) = response.find("```json") {
        let after = &response[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = response.find("```") {
        let after = &response[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = response.find('{') {
        if let Some(end) = response.rfind('}') {
            return &response[start..=end];
        }
    }
    response.trim()
}

/// Parse and schema-validate a model response.
pub(crate) fn parse_model_plan(response: &str) -> Result<RawPlan, PlanParseError> {
    let json = extract_json(response);
    let raw: RawPlan =
        serde_json::from_str(json).map_err(|e| PlanParseError::Json(e.to_string()))?;
    if raw.steps.is_empty() {
        return Err(PlanParseError::Empty);
    }
    if raw.final_entity.trim().is_empty() {
        return Err(PlanParseError::NoFinalEntity);
    }
    Ok(raw)
}

/// Sanitize a parsed plan. Steps are renumbered positionally from 1; the
/// prompt instructs models to number the same way, so well-formed
/// back-references keep their meaning.
pub(crate) async fn sanitize_plan(
    classifier: &EntityClassifier,
    raw: RawPlan,
    trace: &mut PlanningTrace,
) -> QueryPlan {
    let mut steps = Vec::with_capacity(raw.steps.len());

    for (index, raw_step) in raw.steps.into_iter().enumerate() {
        let sequence = index + 1;
        let entity = raw_step.entity.trim().to_lowercase();

        let operation = match raw_step.operation.as_deref() {
            None => StepOperation::List,
            Some(op) => {
                let parsed = StepOperation::parse_or_list(op);
                if parsed.as_str() != op.trim() && !matches!(op.trim(), "get" | "count") {
                    trace.push(TraceEvent::OperationCoerced {
                        step: sequence,
                        raw: op.to_string(),
                    });
                }
                parsed
            }
        };

        let mut filters = IndexMap::new();
        for (key, value) in raw_step.filters {
            if is_pagination_key(&key) {
                trace.push(TraceEvent::PaginationStripped {
                    step: sequence,
                    key,
                });
                continue;
            }
            if let FilterValue::StepRef { step: referenced, .. } = &value {
                // Back-references must point strictly backward.
                if *referenced == 0 || *referenced >= sequence {
                    trace.push(TraceEvent::InvalidReferenceDropped {
                        step: sequence,
                        key,
                        referenced: *referenced,
                    });
                    continue;
                }
            }
            filters.insert(key, value);
        }

        let check = classifier.validate_relations(&entity, &raw_step.relations).await;
        if !check.invalid.is_empty() {
            trace.push(TraceEvent::RelationsDropped {
                step: sequence,
                entity: entity.clone(),
                dropped: check.invalid,
            });
        }

        steps.push(PlanStep {
            step: sequence,
            entity,
            operation,
            filters,
            relations: check.valid,
            extract: raw_step.extract,
            access_hint: raw_step.access_hint,
        });
    }

    QueryPlan {
        steps,
        final_entity: raw.final_entity.trim().to_lowercase(),
        explanation: raw.explanation,
        action: raw.action,
    }
}

fn is_pagination_key(key: &str) -> bool {
    PAGINATION_KEYS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(key))
}
