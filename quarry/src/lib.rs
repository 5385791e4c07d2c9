// Quarry
// Query planning and execution engine for heterogeneous business entities:
// free-text questions are classified, planned as dependency-ordered
// retrieval steps, executed against per-entity access methods, and the
// outcomes are fed back into similarity-searchable caches.

pub mod classifier;
pub mod config;
pub mod engine;
pub mod executor;
pub mod memory;
pub mod mining;
pub mod planner;
pub mod rotation;
pub mod schema;
pub mod types;

/// Convenience re-exports for embedders of the engine.
pub mod prelude {
    pub use crate::classifier::{Classification, EntityClassifier, RelationCheck};
    pub use crate::config::EngineConfig;
    pub use crate::engine::{QueryEngine, QueryEngineBuilder};
    pub use crate::executor::adapters::{AdapterResponse, AdapterSet, DataAdapter, Pagination};
    pub use crate::executor::{ExecutionOutcome, PlanExecutor};
    pub use crate::memory::{
        EmbeddingProvider, FailureCache, HashEmbedding, InMemoryVectorIndex, PlanCache,
        SimilarityBand, VectorIndex,
    };
    pub use crate::mining::{ContextMiners, MinedContext};
    pub use crate::planner::{GeneratedPlan, PlanSource, QueryPlanner};
    pub use crate::rotation::{CompletionError, CompletionProvider, ModelRotator};
    pub use crate::schema::{DocEntry, DocLookup, EntityRegistry, SchemaResolver};
    pub use crate::types::{
        AccessMethod, EntityCategory, EntityDescriptor, ErrorCode, FilterValue, PlanStep,
        QueryPlan, StepOperation,
    };
}
