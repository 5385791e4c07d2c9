//! Entity definition miner.
//!
//! Extracts field names and enumerated value sets from `model`/`entity`/
//! `class` blocks. Works on balanced-brace blocks rather than a grammar, so
//! a malformed file still yields the definitions that do match.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use super::{MinedEntity, SourceFile};

static ENTITY_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:model|entity|class)\s+([A-Z][A-Za-z0-9_]*)\s*\{").unwrap()
});

// `name: string` / `total Number` style lines inside a block body.
static FIELD_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*([a-z_][a-z0-9_]*)\s*:?\s+([A-Za-z(][^\s;,]*)").unwrap());

// `status: enum(open, shipped, closed)` inline enums.
static INLINE_ENUM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*([a-z_][a-z0-9_]*)\s*:?\s*enum\s*\(([^)]+)\)").unwrap());

// Standalone `enum Status { Open Shipped }` blocks, matched by type name.
static ENUM_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"enum\s+([A-Z][A-Za-z0-9_]*)\s*\{([^}]+)\}").unwrap());

/// Mine entity definitions from all sources. Keys are lowercased entity
/// names.
pub(crate) fn mine(sources: &[SourceFile]) -> HashMap<String, MinedEntity> {
    let mut entities: HashMap<String, MinedEntity> = HashMap::new();

    for source in sources {
        let standalone_enums = collect_enum_blocks(&source.content);

        for header in ENTITY_HEADER.captures_iter(&source.content) {
            let name = header[1].to_lowercase();
            let open = match header.get(0) {
                Some(m) => m.end() - 1,
                None => continue,
            };
            let body = match balanced_block(&source.content, open) {
                Some(body) => body,
                // Unbalanced braces; take what we can see to end of file.
                None => &source.content[open + 1..],
            };

            let entry = entities.entry(name).or_default();
            mine_block(body, &standalone_enums, entry);
        }
    }

    entities
}

fn mine_block(body: &str, standalone_enums: &HashMap<String, Vec<String>>, out: &mut MinedEntity) {
    for capture in INLINE_ENUM.captures_iter(body) {
        let field = capture[1].to_string();
        let values = split_values(&capture[2]);
        if !values.is_empty() {
            out.enum_values.insert(field, values);
        }
    }

    for capture in FIELD_LINE.captures_iter(body) {
        let field = capture[1].to_string();
        if field == "enum" {
            continue;
        }
        let type_name = capture[2].trim_end_matches(|c| c == ';' || c == ',');
        if let Some(values) = standalone_enums.get(type_name) {
            out.enum_values.insert(field.clone(), values.clone());
        }
        if !out.fields.contains(&field) {
            out.fields.push(field);
        }
    }
}

fn collect_enum_blocks(content: &str) -> HashMap<String, Vec<String>> {
    ENUM_BLOCK
        .captures_iter(content)
        .map(|c| (c[1].to_string(), split_values(&c[2])))
        .collect()
}

fn split_values(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Slice of `text` between the brace at `open` and its balanced partner.
fn balanced_block(text: &str, open: usize) -> Option<&str> {
    let mut depth = 0usize;
    for (idx, ch) in text[open..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[open + 1..open + idx]);
                }
            }
            _ => {}
        }
    }
    None
}
