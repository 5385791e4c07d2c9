//! Event/workflow chain miner.
//!
//! Extracts `on("order.created")` triggers and the `emit("…")` side
//! effects chained after them. Association is positional: emits belong to
//! the most recent trigger in the same file.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{MinedChain, SourceFile};

static TRIGGER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bon\s*\(\s*['"]([\w.-]+)['"]"#).unwrap());

static EFFECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bemit\s*\(\s*['"]([\w.-]+)['"]"#).unwrap());

pub(crate) fn mine(sources: &[SourceFile]) -> Vec<MinedChain> {
    let mut chains = Vec::new();

    for source in sources {
        let triggers: Vec<(usize, String)> = TRIGGER
            .captures_iter(&source.content)
            .filter_map(|c| c.get(1).map(|m| (m.start(), m.as_str().to_string())))
            .collect();
        if triggers.is_empty() {
            continue;
        }

        let mut file_chains: Vec<MinedChain> = triggers
            .iter()
            .map(|(_, trigger)| MinedChain {
                trigger: trigger.clone(),
                effects: vec![],
            })
            .collect();

        for capture in EFFECT.captures_iter(&source.content) {
            let matched = match capture.get(1) {
                Some(m) => m,
                None => continue,
            };
            // Attach to the last trigger declared before this emit.
            let owner = triggers
                .iter()
                .rposition(|(start, _)| *start < matched.start());
            if let Some(idx) = owner {
                file_chains[idx].effects.push(matched.as_str().to_string());
            }
        }

        chains.extend(file_chains.into_iter().filter(|c| !c.effects.is_empty()));
    }

    chains
}
