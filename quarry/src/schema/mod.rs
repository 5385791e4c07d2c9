//! Entity schema registry and dynamic resolution.
//!
//! The static registry is the authoritative table for owned,
//! pre-registered entities. The resolver layers a TTL cache, an external
//! documentation lookup, and miner-derived facts on top of it so that
//! entities named in free text can still be given a usable descriptor.

pub mod registry;
pub mod resolver;

pub use registry::EntityRegistry;
pub use resolver::{DiscoveryResult, DocEntry, DocLookup, SchemaResolver};

use thiserror::Error;

/// Errors surfaced by injected schema collaborators. Resolution itself
/// absorbs these; they only degrade descriptor quality.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("documentation lookup failed: {0}")]
    Lookup(String),
}
