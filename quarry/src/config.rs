//! Engine configuration.
//!
//! Every empirically-chosen constant (similarity thresholds, TTLs,
//! retention windows, pacing delays) lives here as plain configuration
//! with defaults, so deployments can tune them without code changes.

use std::collections::HashMap;
use std::time::Duration;

/// Top-level configuration, one section per subsystem.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub schema: SchemaConfig,
    pub similarity: SimilarityConfig,
    pub memory: MemoryConfig,
    pub rotation: RotationConfig,
    pub planner: PlannerConfig,
}

/// Schema resolver behavior.
#[derive(Debug, Clone)]
pub struct SchemaConfig {
    /// How long a resolved descriptor stays fresh.
    pub cache_ttl: Duration,
    /// Hard cap on concurrently-resolved entities in a batch.
    pub max_concurrency: usize,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30 * 60),
            max_concurrency: 5,
        }
    }
}

/// Similarity banding for the plan and failure caches. The thresholds are
/// empirically chosen constants, preserved as configuration.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityConfig {
    /// Matches below this are not retrieved at all.
    pub retrieval_floor: f64,
    /// At or above this a match is usable as a worked example.
    pub moderate: f64,
    /// At or above this a match is safe to reuse verbatim.
    pub high: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            retrieval_floor: 0.5,
            moderate: 0.7,
            high: 0.9,
        }
    }
}

/// Cache sizing and retention.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Age-based purge window; failure records are only purged while
    /// unresolved.
    pub retention: Duration,
    /// Dimension of the default hash embedder.
    pub embedding_dimension: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            embedding_dimension: 384,
        }
    }
}

/// Model provider rotation and pacing.
#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Ordered candidate providers per logical step kind.
    pub routes: HashMap<String, Vec<String>>,
    /// Minimum spacing between any two model calls, process-wide.
    pub min_call_spacing: Duration,
    /// Mandatory delay before the next candidate after a detected rate
    /// limit.
    pub rate_limit_cooldown: Duration,
    /// How long a rate-limited provider stays demoted.
    pub demotion_window: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
            min_call_spacing: Duration::from_millis(250),
            rate_limit_cooldown: Duration::from_secs(2),
            demotion_window: Duration::from_secs(60),
        }
    }
}

/// Planner prompting and fallback behavior.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Worked examples retrieved from the plan cache per prompt.
    pub max_worked_examples: usize,
    /// Documentation snippets retrieved per prompt.
    pub max_doc_snippets: usize,
    /// Relations the heuristic fallback plan may request.
    pub max_fallback_relations: usize,
    /// Entity the fallback targets when nothing was detected in the query.
    pub default_entity: Option<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_worked_examples: 3,
            max_doc_snippets: 2,
            max_fallback_relations: 3,
            default_entity: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.schema.cache_ttl, Duration::from_secs(1800));
        assert_eq!(config.schema.max_concurrency, 5);
        assert_eq!(config.similarity.retrieval_floor, 0.5);
        assert_eq!(config.memory.retention, Duration::from_secs(2_592_000));
        assert_eq!(config.planner.max_worked_examples, 3);
    }
}
