//! Shared data model for the planning and execution engine.
//!
//! Everything that crosses a subsystem boundary lives here: entity
//! descriptors, query plans and their steps, the tagged filter values that
//! carry back-references between steps, and the error taxonomy shared by
//! planning and execution.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// Filter keys that describe pagination. Pagination is a property of
/// execution configuration, never of a filter predicate, so these keys are
/// stripped from every filter map during sanitization.
pub const PAGINATION_KEYS: &[&str] = &["limit", "take", "offset", "skip", "page", "pageSize"];

/// How an entity became known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityCategory {
    /// Known in advance in the static registry; owned data, authoritative.
    #[serde(rename = "pre-registered")]
    PreRegistered,
    /// Recognized at runtime via external documentation lookup.
    #[serde(rename = "discovered")]
    Discovered,
    /// Not recognized at all. Carries an empty relation set and must never
    /// be queried directly.
    #[serde(rename = "unknown")]
    Unknown,
}

/// The mechanism used to fetch an entity's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMethod {
    #[serde(rename = "http-api")]
    HttpApi,
    #[serde(rename = "in-process-service")]
    InProcessService,
    #[serde(rename = "graph-traversal")]
    GraphTraversal,
}

impl fmt::Display for AccessMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessMethod::HttpApi => "http-api",
            AccessMethod::InProcessService => "in-process-service",
            AccessMethod::GraphTraversal => "graph-traversal",
        };
        write!(f, "{}", s)
    }
}

/// Rule for resolving a reference field (e.g. `customer_id`) through a
/// lookup on another entity before the referencing step can run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossRef {
    /// Entity the field points at.
    pub entity: String,
    /// Fields of the target entity that a free-text value may be searched by.
    pub search_by: Vec<String>,
}

/// Everything the engine knows about one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    pub category: EntityCategory,
    pub access: AccessMethod,
    /// Valid expansion names. Always validated against the registry before use.
    pub relations: Vec<String>,
    /// Fields a filter predicate may target.
    pub filterable: Vec<String>,
    /// Enumerated values for fields that have a closed value set.
    #[serde(default)]
    pub enum_values: HashMap<String, Vec<String>>,
    /// Cross-reference resolution rules, keyed by the referencing field.
    #[serde(default)]
    pub resolvable_refs: HashMap<String, CrossRef>,
}

impl EntityDescriptor {
    /// Descriptor for a name nothing in the system recognizes. Unknown
    /// entities carry no relations and are refused by the executor.
    pub fn unknown(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: EntityCategory::Unknown,
            access: AccessMethod::HttpApi,
            relations: vec![],
            filterable: vec![],
            enum_values: HashMap::new(),
            resolvable_refs: HashMap::new(),
        }
    }

    pub fn is_queryable(&self) -> bool {
        self.category != EntityCategory::Unknown
    }
}

/// Retrieval operation a plan step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOperation {
    #[serde(rename = "list")]
    List,
    #[serde(rename = "retrieve")]
    Retrieve,
    #[serde(rename = "listAndCount")]
    ListAndCount,
}

impl StepOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOperation::List => "list",
            StepOperation::Retrieve => "retrieve",
            StepOperation::ListAndCount => "listAndCount",
        }
    }

    /// Coerce a raw operation name; anything outside the closed set
    /// becomes `list`, the safest retrieval.
    pub fn parse_or_list(raw: &str) -> Self {
        match raw.trim() {
            "retrieve" | "get" => StepOperation::Retrieve,
            "listAndCount" | "count" => StepOperation::ListAndCount,
            _ => StepOperation::List,
        }
    }
}

/// A filter value is either a literal or a back-reference to the output of
/// an earlier step (`$N` for the whole first result, `$N.field` for one of
/// its fields). Modeled as a tagged value rather than string interpolation
/// so the dependency graph is explicit and cycle-free by construction.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Literal(serde_json::Value),
    StepRef { step: usize, field: Option<String> },
}

impl FilterValue {
    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        FilterValue::Literal(value.into())
    }

    pub fn step_ref(step: usize) -> Self {
        FilterValue::StepRef { step, field: None }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, FilterValue::StepRef { .. })
    }

    /// Parse `$N` / `$N.field` syntax. Returns `None` for anything that is
    /// not a well-formed back-reference (the value stays a literal then).
    pub fn parse_reference(text: &str) -> Option<(usize, Option<String>)> {
        let rest = text.strip_prefix('$')?;
        let (digits, field) = match rest.split_once('.') {
            Some((_, f)) if f.is_empty() => return None,
            Some((d, f)) => (d, Some(f.to_string())),
            None => (rest, None),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some((digits.parse().ok()?, field))
    }

    /// Classify an arbitrary JSON value.
    pub fn from_json(value: serde_json::Value) -> Self {
        if let serde_json::Value::String(s) = &value {
            if let Some((step, field)) = Self::parse_reference(s) {
                return FilterValue::StepRef { step, field };
            }
        }
        FilterValue::Literal(value)
    }
}

impl Serialize for FilterValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FilterValue::Literal(v) => v.serialize(serializer),
            FilterValue::StepRef { step, field } => {
                let text = match field {
                    Some(f) => format!("${}.{}", step, f),
                    None => format!("${}", step),
                };
                serializer.serialize_str(&text)
            }
        }
    }
}

impl<'de> Deserialize<'de> for FilterValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(FilterValue::from_json(value))
    }
}

/// One retrieval operation within a query plan, targeting one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    /// 1-based sequence number; back-references point at these.
    pub step: usize,
    pub entity: String,
    pub operation: StepOperation,
    /// Field -> literal or back-reference. Never contains pagination keys.
    #[serde(default)]
    pub filters: IndexMap<String, FilterValue>,
    #[serde(default)]
    pub relations: Vec<String>,
    /// Field this step exists to produce for a later step, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_hint: Option<AccessMethod>,
}

impl PlanStep {
    pub fn new(step: usize, entity: impl Into<String>, operation: StepOperation) -> Self {
        Self {
            step,
            entity: entity.into(),
            operation,
            filters: IndexMap::new(),
            relations: vec![],
            extract: None,
            access_hint: None,
        }
    }

    pub fn with_filter(mut self, field: impl Into<String>, value: FilterValue) -> Self {
        self.filters.insert(field.into(), value);
        self
    }

    pub fn with_relations(mut self, relations: Vec<String>) -> Self {
        self.relations = relations;
        self
    }

    pub fn with_extract(mut self, field: impl Into<String>) -> Self {
        self.extract = Some(field.into());
        self
    }
}

/// An ordered, dependency-closed retrieval plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlan {
    pub steps: Vec<PlanStep>,
    /// Entity whose data answers the question.
    pub final_entity: String,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl QueryPlan {
    pub fn step(&self, number: usize) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.step == number)
    }
}

/// Categorized error codes, used consistently across planning and
/// execution and stored in failure records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NoResults,
    ApiError,
    ExtractionFailed,
    PlanGenerationFailed,
    EntityNotFound,
    PermissionDenied,
    Timeout,
    ValidationError,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NoResults => "NO_RESULTS",
            ErrorCode::ApiError => "API_ERROR",
            ErrorCode::ExtractionFailed => "EXTRACTION_FAILED",
            ErrorCode::PlanGenerationFailed => "PLAN_GENERATION_FAILED",
            ErrorCode::EntityNotFound => "ENTITY_NOT_FOUND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A categorized step failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub code: ErrorCode,
    pub message: String,
}

impl StepError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Per-step execution log entry, returned alongside the final data so
/// callers can render provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepLog {
    pub step: usize,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

/// What went wrong with a query, as handed to the failure cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub failed_step: Option<usize>,
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}
