//! Context miners
//!
//! Static analyzers that read structured source artifacts (entity/model
//! definitions, cross-entity link declarations, API route declarations,
//! event/workflow chains) and produce machine-readable fact tables. Miners
//! are pattern extractors over raw text, not parsers: they tolerate partial
//! matches, and a miner that fails returns whatever it parsed (possibly
//! nothing) because missing context degrades plan quality, not correctness.
//!
//! Mining runs once per process behind an initialization gate; repeated
//! calls are free.

pub mod entities;
pub mod links;
pub mod routes;
pub mod workflows;

use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Files larger than this are skipped; generated bundles and lockfiles are
/// not worth pattern-matching.
const MAX_SOURCE_BYTES: u64 = 512 * 1024;

/// Directories that never contain minable declarations.
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "target", "dist", "build", "vendor"];

/// One source artifact handed to the miners.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub content: String,
}

impl SourceFile {
    /// In-memory artifact, used by tests and embedders that already hold
    /// the source text.
    pub fn inline(name: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self {
            path: name.into(),
            content: content.into(),
        }
    }
}

/// Facts mined for one entity definition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MinedEntity {
    pub fields: Vec<String>,
    /// Field name -> closed value set, where one was declared.
    pub enum_values: HashMap<String, Vec<String>>,
}

/// Kind of a mined cross-entity link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    HasMany,
    HasOne,
    BelongsTo,
    References,
}

/// One declared link from an owning entity to a target.
#[derive(Debug, Clone, PartialEq)]
pub struct MinedLink {
    /// Relation or foreign-key field name as declared.
    pub name: String,
    pub target: String,
    pub kind: LinkKind,
}

/// One declared API route.
#[derive(Debug, Clone, PartialEq)]
pub struct MinedRoute {
    pub method: String,
    pub path: String,
    /// Entity inferred from the path, if any.
    pub entity: Option<String>,
}

/// One event trigger and the side effects chained off it.
#[derive(Debug, Clone, PartialEq)]
pub struct MinedChain {
    pub trigger: String,
    pub effects: Vec<String>,
}

/// Merged output of all four miners.
#[derive(Debug, Clone, Default)]
pub struct MinedContext {
    pub entities: HashMap<String, MinedEntity>,
    /// Owning entity -> declared links.
    pub links: HashMap<String, Vec<MinedLink>>,
    pub routes: Vec<MinedRoute>,
    pub workflows: Vec<MinedChain>,
}

impl MinedContext {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.links.is_empty()
            && self.routes.is_empty()
            && self.workflows.is_empty()
    }

    /// Relation names declared for an entity, for schema fallback.
    pub fn relations_for(&self, entity: &str) -> Vec<String> {
        self.links
            .get(entity)
            .map(|links| links.iter().map(|l| l.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Short prose summary of everything mined about one entity, used in
    /// prompt assembly. `None` when nothing was mined for it.
    pub fn describe_entity(&self, entity: &str) -> Option<String> {
        let mut parts: Vec<String> = Vec::new();

        if let Some(mined) = self.entities.get(entity) {
            if !mined.fields.is_empty() {
                parts.push(format!("fields: {}", mined.fields.join(", ")));
            }
            for (field, values) in &mined.enum_values {
                parts.push(format!("{} one of [{}]", field, values.join(", ")));
            }
        }
        if let Some(links) = self.links.get(entity) {
            let names: Vec<&str> = links.iter().map(|l| l.name.as_str()).collect();
            if !names.is_empty() {
                parts.push(format!("links: {}", names.join(", ")));
            }
        }
        let routes: Vec<String> = self
            .routes
            .iter()
            .filter(|r| r.entity.as_deref() == Some(entity))
            .map(|r| format!("{} {}", r.method, r.path))
            .collect();
        if !routes.is_empty() {
            parts.push(format!("routes: {}", routes.join(", ")));
        }
        let chains: Vec<String> = self
            .workflows
            .iter()
            .filter(|c| c.trigger.starts_with(&format!("{}.", entity)))
            .map(|c| format!("{} -> {}", c.trigger, c.effects.join(" -> ")))
            .collect();
        if !chains.is_empty() {
            parts.push(format!("events: {}", chains.join("; ")));
        }

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

/// Run all four miners over a set of sources.
pub fn mine_sources(sources: &[SourceFile]) -> MinedContext {
    MinedContext {
        entities: entities::mine(sources),
        links: links::mine(sources),
        routes: routes::mine(sources),
        workflows: workflows::mine(sources),
    }
}

/// Process-wide miner front end with a single initialization gate.
pub struct ContextMiners {
    root: Option<PathBuf>,
    context: OnceCell<MinedContext>,
}

impl ContextMiners {
    /// Mine the source tree under `root` on first use.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            context: OnceCell::new(),
        }
    }

    /// No source tree configured; `mine()` yields an empty context.
    pub fn disabled() -> Self {
        Self {
            root: None,
            context: OnceCell::new(),
        }
    }

    /// Idempotent: only the first call performs work.
    pub fn mine(&self) -> &MinedContext {
        self.context.get_or_init(|| match &self.root {
            Some(root) => {
                let sources = gather_sources(root);
                let context = mine_sources(&sources);
                log::info!(
                    "[mining] {} files mined: {} entities, {} link owners, {} routes, {} chains",
                    sources.len(),
                    context.entities.len(),
                    context.links.len(),
                    context.routes.len(),
                    context.workflows.len()
                );
                context
            }
            None => MinedContext::default(),
        })
    }
}

/// Recursively collect minable source files. IO failures are absorbed with
/// a warning; an unreadable tree yields an empty set.
fn gather_sources(root: &Path) -> Vec<SourceFile> {
    let mut sources = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("[mining] skipping unreadable dir {}: {}", dir.display(), e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !SKIPPED_DIRS.contains(&name.as_ref()) && !name.starts_with('.') {
                    pending.push(path);
                }
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                if meta.len() > MAX_SOURCE_BYTES {
                    continue;
                }
            }
            match fs::read_to_string(&path) {
                Ok(content) => sources.push(SourceFile { path, content }),
                // Binary or non-UTF-8; not a minable artifact.
                Err(_) => continue,
            }
        }
    }

    sources
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"
model Order {
  id: string
  status: enum(open, shipped, closed)
  total: number
}

Order belongs_to Customer
Customer has_many orders

router.get("/api/orders", listOrders)

on("order.created").emit("invoice.create").emit("notify.sales")
"#;

    #[test]
    fn test_mine_sources_merges_all_families() {
        let sources = vec![SourceFile::inline("app.src", FIXTURE)];
        let context = mine_sources(&sources);

        assert!(context.entities.contains_key("order"));
        assert!(context.links.contains_key("order"));
        assert_eq!(context.routes.len(), 1);
        assert_eq!(context.workflows.len(), 1);
    }

    #[test]
    fn test_describe_entity_summarizes_facts() {
        let sources = vec![SourceFile::inline("app.src", FIXTURE)];
        let context = mine_sources(&sources);

        let summary = context.describe_entity("order").unwrap();
        assert!(summary.contains("status"));
        assert!(summary.contains("customer"));
        assert!(summary.contains("GET /api/orders"));
        assert!(summary.contains("order.created"));

        assert!(context.describe_entity("unheard_of").is_none());
    }

    #[test]
    fn test_gate_is_idempotent_and_failure_yields_empty() {
        let miners = ContextMiners::new("/definitely/not/a/real/path");
        let first = miners.mine() as *const MinedContext;
        let second = miners.mine() as *const MinedContext;
        assert_eq!(first, second);
        assert!(miners.mine().is_empty());
    }

    #[test]
    fn test_gather_sources_reads_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("models.src"), FIXTURE).unwrap();
        std::fs::create_dir(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("node_modules/skip.src"), "model Junk {}").unwrap();

        let miners = ContextMiners::new(dir.path());
        let context = miners.mine();
        assert!(context.entities.contains_key("order"));
        assert!(!context.entities.contains_key("junk"));
    }
}
