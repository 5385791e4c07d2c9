//! Dynamic schema resolver.
//!
//! `resolve` layers, in order: a TTL cache, the static registry (always
//! authoritative for pre-registered entities), the external documentation
//! service, the registry again as fallback, then miner-derived facts. All
//! paths populate the same cache so repeated queries are cheap. Lookup
//! failures are absorbed: a descriptor is always produced, in the worst
//! case an unqueryable `unknown` one.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use super::{EntityRegistry, SchemaError};
use crate::config::SchemaConfig;
use crate::mining::ContextMiners;
use crate::types::{AccessMethod, EntityCategory, EntityDescriptor};

/// Schema facts returned by the external documentation service.
#[derive(Debug, Clone, Default)]
pub struct DocEntry {
    pub relations: Vec<String>,
    pub filters: Vec<String>,
    pub api_path: Option<String>,
}

/// External documentation lookup, injected. Returns `None` for names the
/// service does not know.
#[async_trait]
pub trait DocLookup: Send + Sync {
    async fn lookup(&self, entity: &str) -> Result<Option<DocEntry>, SchemaError>;
}

/// Outcome of trying to recognize a name extracted from free text.
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub is_valid: bool,
    pub category: EntityCategory,
    pub descriptor: Option<EntityDescriptor>,
}

struct CacheEntry {
    descriptor: EntityDescriptor,
    cached_at: Instant,
}

pub struct SchemaResolver {
    registry: Arc<EntityRegistry>,
    docs: Option<Arc<dyn DocLookup>>,
    miners: Arc<ContextMiners>,
    cache: DashMap<String, CacheEntry>,
    config: SchemaConfig,
}

impl SchemaResolver {
    pub fn new(registry: Arc<EntityRegistry>, miners: Arc<ContextMiners>) -> Self {
        Self {
            registry,
            docs: None,
            miners,
            cache: DashMap::new(),
            config: SchemaConfig::default(),
        }
    }

    pub fn with_doc_lookup(mut self, docs: Arc<dyn DocLookup>) -> Self {
        self.docs = Some(docs);
        self
    }

    pub fn with_config(mut self, config: SchemaConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Resolve one entity name to a descriptor. Never fails; unknown names
    /// yield an unqueryable descriptor.
    pub async fn resolve(&self, name: &str) -> EntityDescriptor {
        let key = name.to_lowercase();

        if let Some(entry) = self.cache.get(&key) {
            if entry.cached_at.elapsed() < self.config.cache_ttl {
                return entry.descriptor.clone();
            }
        }

        let descriptor = self.resolve_uncached(&key).await;
        self.cache.insert(
            key,
            CacheEntry {
                descriptor: descriptor.clone(),
                cached_at: Instant::now(),
            },
        );
        descriptor
    }

    async fn resolve_uncached(&self, name: &str) -> EntityDescriptor {
        // Pre-registered entities are owned data; the registry is
        // authoritative and external documentation is never consulted.
        if let Some(known) = self.registry.get(name) {
            if known.category == EntityCategory::PreRegistered {
                return known.clone();
            }
        }

        if let Some(docs) = &self.docs {
            match docs.lookup(name).await {
                Ok(Some(entry)) => return descriptor_from_doc(name, entry),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("[schema] documentation lookup failed for {}: {}", name, e);
                }
            }
        }

        if let Some(known) = self.registry.get(name) {
            return known.clone();
        }

        let mined = self.miners.mine();
        let mined_entity = mined.entities.get(name);
        let mined_relations = mined.relations_for(name);
        if mined_entity.is_some() || !mined_relations.is_empty() {
            log::debug!("[schema] descriptor for {} derived from mined context", name);
            return EntityDescriptor {
                name: name.to_string(),
                category: EntityCategory::Discovered,
                access: AccessMethod::HttpApi,
                relations: mined_relations,
                filterable: mined_entity.map(|m| m.fields.clone()).unwrap_or_default(),
                enum_values: mined_entity.map(|m| m.enum_values.clone()).unwrap_or_default(),
                resolvable_refs: HashMap::new(),
            };
        }

        EntityDescriptor::unknown(name)
    }

    /// Recognize a candidate name extracted from free text, attempting
    /// external discovery before declaring it unknown.
    pub async fn discover(&self, candidate: &str) -> DiscoveryResult {
        let descriptor = self.resolve(candidate).await;
        if descriptor.is_queryable() {
            DiscoveryResult {
                is_valid: true,
                category: descriptor.category,
                descriptor: Some(descriptor),
            }
        } else {
            DiscoveryResult {
                is_valid: false,
                category: EntityCategory::Unknown,
                descriptor: None,
            }
        }
    }

    /// Resolve a batch concurrently, capped at the configured concurrency
    /// to bound latency and documentation-service cost.
    pub async fn resolve_many(&self, names: &[String]) -> HashMap<String, EntityDescriptor> {
        stream::iter(names.iter().cloned())
            .map(|name| async move {
                let descriptor = self.resolve(&name).await;
                (name.to_lowercase(), descriptor)
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await
    }

    /// Drop one cached descriptor, forcing re-resolution.
    pub fn invalidate(&self, name: &str) {
        self.cache.remove(&name.to_lowercase());
    }
}

fn descriptor_from_doc(name: &str, entry: DocEntry) -> EntityDescriptor {
    EntityDescriptor {
        name: name.to_string(),
        category: EntityCategory::Discovered,
        access: AccessMethod::HttpApi,
        relations: entry.relations,
        filterable: entry.filters,
        enum_values: HashMap::new(),
        resolvable_refs: HashMap::new(),
    }
}
