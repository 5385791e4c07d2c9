//! API route miner.
//!
//! Extracts `router.get("/api/orders", …)` style declarations and infers
//! the entity a path serves from its first meaningful segment.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{MinedRoute, SourceFile};

static ROUTE_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:router|app|api)\.(get|post|put|patch|delete)\s*\(\s*['"]([^'"]+)['"]"#)
        .unwrap()
});

pub(crate) fn mine(sources: &[SourceFile]) -> Vec<MinedRoute> {
    let mut routes = Vec::new();

    for source in sources {
        for capture in ROUTE_CALL.captures_iter(&source.content) {
            let path = capture[2].to_string();
            let route = MinedRoute {
                method: capture[1].to_uppercase(),
                entity: infer_entity(&path),
                path,
            };
            if !routes.contains(&route) {
                routes.push(route);
            }
        }
    }

    routes
}

/// First path segment that is not a version or `api` prefix, singularized.
fn infer_entity(path: &str) -> Option<String> {
    let segment = path
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .find(|s| {
            !s.eq_ignore_ascii_case("api")
                && !s.starts_with(':')
                && !s.starts_with('{')
                && !is_version(s)
        })?;
    Some(singularize(&segment.to_lowercase()))
}

fn is_version(segment: &str) -> bool {
    let mut chars = segment.chars();
    matches!(chars.next(), Some('v')) && chars.all(|c| c.is_ascii_digit())
}

fn singularize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        format!("{}y", stem)
    } else if word.ends_with("ss") || word.ends_with("us") {
        word.to_string()
    } else if let Some(stem) = word.strip_suffix('s') {
        stem.to_string()
    } else {
        word.to_string()
    }
}
