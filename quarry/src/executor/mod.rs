//! Plan executor.
//!
//! Executes enriched plan steps strictly in ascending sequence order.
//! The ordering is required, not incidental: later steps reference earlier
//! results. Back-references are substituted with concrete values at
//! dispatch time; a reference to a value no earlier step produced fails
//! the step with `VALIDATION_ERROR`, never a silent empty substitution. A
//! failed step aborts the remainder and the partial log is returned.

pub mod adapters;

use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;

use adapters::{AdapterSet, FilterMap, Pagination};

use crate::classifier::ResultEnvelope;
use crate::planner::{EnrichedPlan, EnrichedStep};
use crate::types::{EntityCategory, ErrorCode, FilterValue, StepError, StepLog, StepOperation};

/// The failed step and its categorized error.
#[derive(Debug, Clone)]
pub struct ExecutionFailure {
    pub step: usize,
    pub error: StepError,
}

/// Everything a caller needs to render an answer with provenance.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Rows of the final entity's step, when execution got there.
    pub final_result: Option<Value>,
    pub step_logs: Vec<StepLog>,
    pub failure: Option<ExecutionFailure>,
}

impl ExecutionOutcome {
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Concrete values one completed step makes available to later steps.
#[derive(Debug)]
struct StepOutput {
    rows: Value,
    first: Option<Value>,
    extracted: Option<Value>,
}

pub struct PlanExecutor {
    adapters: AdapterSet,
}

impl PlanExecutor {
    pub fn new(adapters: AdapterSet) -> Self {
        Self { adapters }
    }

    pub async fn execute(&self, plan: &EnrichedPlan) -> ExecutionOutcome {
        let mut ordered: Vec<&EnrichedStep> = plan.steps.iter().collect();
        ordered.sort_by_key(|s| s.step.step);

        let mut outputs: HashMap<usize, StepOutput> = HashMap::new();
        let mut step_logs = Vec::with_capacity(ordered.len());
        let mut failure = None;
        let mut final_result = None;
        let mut last_rows = None;

        for enriched in ordered {
            let number = enriched.step.step;
            let started = Instant::now();

            match self.execute_step(enriched, &outputs).await {
                Ok(output) => {
                    step_logs.push(StepLog {
                        step: number,
                        success: true,
                        duration_ms: started.elapsed().as_millis() as u64,
                        error: None,
                    });
                    if enriched.step.entity == plan.final_entity {
                        final_result = Some(output.rows.clone());
                    }
                    last_rows = Some(output.rows.clone());
                    outputs.insert(number, output);
                }
                Err(error) => {
                    log::debug!("[executor] step {} failed: {}", number, error);
                    step_logs.push(StepLog {
                        step: number,
                        success: false,
                        duration_ms: started.elapsed().as_millis() as u64,
                        error: Some(error.clone()),
                    });
                    failure = Some(ExecutionFailure {
                        step: number,
                        error,
                    });
                    break;
                }
            }
        }

        if final_result.is_none() && failure.is_none() {
            final_result = last_rows;
        }

        ExecutionOutcome {
            final_result,
            step_logs,
            failure,
        }
    }

    async fn execute_step(
        &self,
        enriched: &EnrichedStep,
        outputs: &HashMap<usize, StepOutput>,
    ) -> Result<StepOutput, StepError> {
        let step = &enriched.step;

        if enriched.classification.category == EntityCategory::Unknown {
            return Err(StepError::new(
                ErrorCode::EntityNotFound,
                format!("entity {} is unknown and cannot be queried", step.entity),
            ));
        }

        let mut filters = FilterMap::new();
        for (key, value) in &step.filters {
            let concrete = match value {
                FilterValue::Literal(v) => v.clone(),
                FilterValue::StepRef { step: referenced, field } => {
                    resolve_reference(*referenced, field.as_deref(), outputs)?
                }
            };
            filters.insert(key.clone(), concrete);
        }

        let adapter = self.adapters.for_method(enriched.classification.access);
        let pagination = Pagination::default();
        let response = match step.operation {
            StepOperation::List => {
                adapter
                    .list(&step.entity, &filters, &step.relations, &pagination)
                    .await
            }
            StepOperation::Retrieve => {
                adapter
                    .retrieve(&step.entity, &filters, &step.relations, &pagination)
                    .await
            }
            StepOperation::ListAndCount => {
                adapter
                    .list_and_count(&step.entity, &filters, &step.relations, &pagination)
                    .await
            }
        }
        .map_err(|e| StepError::new(e.code(), e.to_string()))?;

        let rows = extract_rows(&response.payload, enriched.expectation.envelope);
        let first = first_record(&rows);

        let extracted = match &step.extract {
            Some(field) => {
                // A pure extraction step with nothing to extract from is a
                // distinct condition: later steps cannot proceed without it.
                if rows_are_empty(&rows) {
                    return Err(StepError::new(
                        ErrorCode::NoResults,
                        format!(
                            "step {} found no {} to extract '{}' from",
                            step.step, step.entity, field
                        ),
                    ));
                }
                match first.as_ref().and_then(|record| record.get(field)) {
                    Some(value) => Some(value.clone()),
                    None => {
                        return Err(StepError::new(
                            ErrorCode::ExtractionFailed,
                            format!(
                                "step {} result has no field '{}' to extract",
                                step.step, field
                            ),
                        ));
                    }
                }
            }
            None => None,
        };

        Ok(StepOutput {
            rows,
            first,
            extracted,
        })
    }
}

/// Substitute a `$N` / `$N.field` back-reference with the value step N
/// produced.
fn resolve_reference(
    referenced: usize,
    field: Option<&str>,
    outputs: &HashMap<usize, StepOutput>,
) -> Result<Value, StepError> {
    let output = outputs.get(&referenced).ok_or_else(|| {
        StepError::new(
            ErrorCode::ValidationError,
            format!("reference to step {} which has not completed", referenced),
        )
    })?;

    match field {
        None => output
            .extracted
            .clone()
            .or_else(|| output.first.clone())
            .ok_or_else(|| {
                StepError::new(
                    ErrorCode::ValidationError,
                    format!("step {} produced no extractable value", referenced),
                )
            }),
        Some(name) => output
            .first
            .as_ref()
            .and_then(|record| record.get(name))
            .cloned()
            .ok_or_else(|| {
                StepError::new(
                    ErrorCode::ValidationError,
                    format!("step {} produced no field '{}'", referenced, name),
                )
            }),
    }
}

/// Pull the rows out of a payload according to the expected envelope,
/// falling back to the payload itself when the wrapper is absent.
fn extract_rows(payload: &Value, envelope: ResultEnvelope) -> Value {
    let unwrapped = match envelope {
        ResultEnvelope::DataField => payload.get("data"),
        ResultEnvelope::Nodes => payload.get("nodes"),
        ResultEnvelope::Bare => None,
    };
    unwrapped.cloned().unwrap_or_else(|| payload.clone())
}

fn first_record(rows: &Value) -> Option<Value> {
    match rows {
        Value::Array(items) => items.first().cloned(),
        Value::Null => None,
        other => Some(other.clone()),
    }
}

fn rows_are_empty(rows: &Value) -> bool {
    match rows {
        Value::Array(items) => items.is_empty(),
        Value::Null => true,
        _ => false,
    }
}
