//! Static entity registry.
//!
//! Owned data, authoritative: descriptors registered here always win for
//! pre-registered entities. Insertion order is preserved so prompt
//! assembly and tests see a deterministic entity listing.

use indexmap::IndexMap;

use crate::types::{AccessMethod, CrossRef, EntityCategory, EntityDescriptor};

#[derive(Debug, Default, Clone)]
pub struct EntityRegistry {
    entries: IndexMap<String, EntityDescriptor>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = EntityDescriptor>) -> Self {
        let mut registry = Self::new();
        for descriptor in descriptors {
            registry.insert(descriptor);
        }
        registry
    }

    /// Register or replace a descriptor. Keys are lowercased names.
    pub fn insert(&mut self, descriptor: EntityDescriptor) {
        self.entries
            .insert(descriptor.name.to_lowercase(), descriptor);
    }

    /// Builder-style registration.
    pub fn with(mut self, descriptor: EntityDescriptor) -> Self {
        self.insert(descriptor);
        self
    }

    pub fn get(&self, name: &str) -> Option<&EntityDescriptor> {
        self.entries.get(&name.to_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_lowercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shorthand for building a pre-registered descriptor, the common case
/// when seeding the registry at process start.
pub fn core_entity(
    name: &str,
    access: AccessMethod,
    relations: &[&str],
    filterable: &[&str],
) -> EntityDescriptor {
    EntityDescriptor {
        name: name.to_string(),
        category: EntityCategory::PreRegistered,
        access,
        relations: relations.iter().map(|r| r.to_string()).collect(),
        filterable: filterable.iter().map(|f| f.to_string()).collect(),
        enum_values: Default::default(),
        resolvable_refs: Default::default(),
    }
}

/// Attach a cross-reference resolution rule to a descriptor.
pub fn with_cross_ref(
    mut descriptor: EntityDescriptor,
    field: &str,
    target: &str,
    search_by: &[&str],
) -> EntityDescriptor {
    descriptor.resolvable_refs.insert(
        field.to_string(),
        CrossRef {
            entity: target.to_string(),
            search_by: search_by.iter().map(|s| s.to_string()).collect(),
        },
    );
    descriptor
}
