//! Cross-entity link miner.
//!
//! Extracts `has_many`/`has_one`/`belongs_to` declarations and
//! `references` foreign-key lines into per-entity link tables.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use super::{LinkKind, MinedLink, SourceFile};

// `Customer has_many orders` / `Order belongs_to Customer`
static RELATION_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*([A-Za-z_]\w*)\s+(has_many|hasMany|has_one|hasOne|belongs_to|belongsTo)\s+([A-Za-z_]\w*)")
        .unwrap()
});

// `order.customer_id references customer(id)`
static REFERENCE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)([a-z_]\w*)\.([a-z_]\w*)\s+references\s+([a-z_]\w*)\s*\(\s*[a-z_]\w*\s*\)")
        .unwrap()
});

/// Mine link declarations; keys are lowercased owning-entity names.
pub(crate) fn mine(sources: &[SourceFile]) -> HashMap<String, Vec<MinedLink>> {
    let mut links: HashMap<String, Vec<MinedLink>> = HashMap::new();

    for source in sources {
        for capture in RELATION_LINE.captures_iter(&source.content) {
            let owner = capture[1].to_lowercase();
            let kind = match &capture[2] {
                "has_many" | "hasMany" => LinkKind::HasMany,
                "has_one" | "hasOne" => LinkKind::HasOne,
                _ => LinkKind::BelongsTo,
            };
            let target = capture[3].to_lowercase();
            push_unique(
                links.entry(owner).or_default(),
                MinedLink {
                    name: capture[3].to_lowercase(),
                    target,
                    kind,
                },
            );
        }

        for capture in REFERENCE_LINE.captures_iter(&source.content) {
            let owner = capture[1].to_lowercase();
            push_unique(
                links.entry(owner).or_default(),
                MinedLink {
                    name: capture[2].to_string(),
                    target: capture[3].to_lowercase(),
                    kind: LinkKind::References,
                },
            );
        }
    }

    links
}

fn push_unique(list: &mut Vec<MinedLink>, link: MinedLink) {
    if !list.iter().any(|l| l.name == link.name && l.kind == link.kind) {
        list.push(link);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mines_relation_declarations() {
        let src = SourceFile::inline(
            "links.src",
            r#"
Customer has_many orders
Order belongs_to Customer
Order has_one invoice
"#,
        );
        let mined = mine(&[src]);
        assert_eq!(mined["customer"].len(), 1);
        assert_eq!(mined["customer"][0].kind, LinkKind::HasMany);
        assert_eq!(mined["order"].len(), 2);
        assert!(mined["order"].iter().any(|l| l.kind == LinkKind::BelongsTo));
    }

    #[test]
    fn test_mines_foreign_key_references() {
        let src = SourceFile::inline("fk.src", "order.customer_id references customer(id)");
        let mined = mine(&[src]);
        let link = &mined["order"][0];
        assert_eq!(link.name, "customer_id");
        assert_eq!(link.target, "customer");
        assert_eq!(link.kind, LinkKind::References);
    }

    #[test]
    fn test_duplicate_declarations_collapse() {
        let src = SourceFile::inline(
            "dup.src",
            "Customer has_many orders\nCustomer has_many orders\n",
        );
        let mined = mine(&[src]);
        assert_eq!(mined["customer"].len(), 1);
    }
}
