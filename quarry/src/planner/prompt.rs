//! Prompt assembly for plan generation.
//!
//! The prompt combines the entity registry description (relations,
//! filterable fields, enums, cross-reference rules), retrieved worked
//! examples, mined codebase context, documentation snippets, and a fixed
//! set of canonical pattern examples, followed by a strict JSON output
//! contract.

use itertools::Itertools;

use crate::memory::PlanMatch;
use crate::mining::MinedContext;
use crate::types::EntityDescriptor;

/// Fixed worked examples covering the plan shapes the engine expects
/// models to produce.
const CANONICAL_EXAMPLES: &str = r#"PATTERN EXAMPLES:

1. Simple list ("show all orders"):
{"steps": [{"step": 1, "entity": "order", "operation": "list", "filters": {}, "relations": []}], "finalEntity": "order", "explanation": "List all orders."}

2. Name search ("find the customer called Acme"):
{"steps": [{"step": 1, "entity": "customer", "operation": "list", "filters": {"q": "Acme"}, "relations": []}], "finalEntity": "customer", "explanation": "Search customers by name."}

3. Two-step resolution via extraction ("orders for customer Acme"):
{"steps": [{"step": 1, "entity": "customer", "operation": "list", "filters": {"q": "Acme"}, "extract": "id"}, {"step": 2, "entity": "order", "operation": "list", "filters": {"customer_id": "$1"}, "relations": []}], "finalEntity": "order", "explanation": "Resolve the customer id, then list its orders."}

4. Filter without pagination ("count shipped orders"):
{"steps": [{"step": 1, "entity": "order", "operation": "listAndCount", "filters": {"status": "shipped"}, "relations": []}], "finalEntity": "order", "explanation": "Count orders by status. Pagination keys (limit, offset, page) are never filters."}

5. Linked-data fetch ("orders with their line items"):
{"steps": [{"step": 1, "entity": "order", "operation": "list", "filters": {}, "relations": ["items"]}], "finalEntity": "order", "explanation": "List orders expanding the items relation."}"#;

/// Render one descriptor for the registry section.
fn describe_entity(descriptor: &EntityDescriptor) -> String {
    let mut lines = vec![format!(
        "- {} (access: {})",
        descriptor.name, descriptor.access
    )];
    if !descriptor.relations.is_empty() {
        lines.push(format!("  relations: {}", descriptor.relations.join(", ")));
    }
    if !descriptor.filterable.is_empty() {
        lines.push(format!("  filterable: {}", descriptor.filterable.join(", ")));
    }
    for (field, values) in descriptor
        .enum_values
        .iter()
        .sorted_by(|a, b| a.0.cmp(b.0))
    {
        lines.push(format!("  {} one of: {}", field, values.join(", ")));
    }
    for (field, rule) in descriptor
        .resolvable_refs
        .iter()
        .sorted_by(|a, b| a.0.cmp(b.0))
    {
        lines.push(format!(
            "  {} resolves via {} (search by {})",
            field,
            rule.entity,
            rule.search_by.join(", ")
        ));
    }
    lines.join("\n")
}

pub(crate) fn build_prompt(
    query: &str,
    descriptors: &[&EntityDescriptor],
    mined: &MinedContext,
    worked_examples: &[&PlanMatch],
    doc_snippets: &[String],
) -> String {
    let registry_section = if descriptors.is_empty() {
        "(no entities resolved)".to_string()
    } else {
        descriptors.iter().map(|d| describe_entity(d)).join("\n")
    };

    let mined_section = descriptors
        .iter()
        .filter_map(|d| {
            mined
                .describe_entity(&d.name.to_lowercase())
                .map(|facts| format!("- {}: {}", d.name, facts))
        })
        .join("\n");
    let mined_section = if mined_section.is_empty() {
        String::new()
    } else {
        format!("\nCODEBASE CONTEXT:\n{}\n", mined_section)
    };

    let examples_section = if worked_examples.is_empty() {
        String::new()
    } else {
        let rendered = worked_examples
            .iter()
            .filter_map(|m| {
                serde_json::to_string(&m.record.plan)
                    .ok()
                    .map(|plan| format!("Q: {}\nPlan: {}", m.record.query, plan))
            })
            .join("\n\n");
        format!("\nPREVIOUSLY SUCCESSFUL PLANS FOR SIMILAR QUESTIONS:\n{}\n", rendered)
    };

    let docs_section = if doc_snippets.is_empty() {
        String::new()
    } else {
        format!(
            "\nDOCUMENTATION:\n{}\n",
            doc_snippets.iter().map(|s| format!("- {}", s)).join("\n")
        )
    };

    format!(
        r#"You are a retrieval planner for business data. Translate the question into an ordered plan of retrieval steps.

ENTITIES:
{registry_section}
{mined_section}{examples_section}{docs_section}
RULES:
1. Use only the entities and relations listed above.
2. Allowed operations: "list", "retrieve", "listAndCount".
3. Filters target filterable fields. NEVER put pagination keys (limit, take, offset, skip, page, pageSize) in filters.
4. When a filter needs a value produced by an earlier step, reference it as "$N" (whole first result of step N) or "$N.field". Steps may only reference earlier steps.
5. A step that exists to feed a later step sets "extract" to the field it produces.
6. Resolve reference fields (for example customer_id) with a prior search step on the target entity, as in pattern 3.

{canonical}

QUESTION: "{query}"

Respond with ONLY valid JSON:
{{
  "steps": [
    {{
      "step": 1,
      "entity": "entity_name",
      "operation": "list|retrieve|listAndCount",
      "filters": {{"field": "value or $N reference"}},
      "relations": ["relation_name"],
      "extract": "field_or_omit"
    }}
  ],
  "finalEntity": "entity_name",
  "explanation": "What the plan does"
}}
"#,
        registry_section = registry_section,
        mined_section = mined_section,
        examples_section = examples_section,
        docs_section = docs_section,
        canonical = CANONICAL_EXAMPLES,
        query = query,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::registry::{core_entity, with_cross_ref};
    use crate::types::AccessMethod;

    #[test]
    fn test_prompt_lists_registry_and_rules() {
        let order = with_cross_ref(
            core_entity("order", AccessMethod::HttpApi, &["items"], &["status", "customer_id"]),
            "customer_id",
            "customer",
            &["q"],
        );
        let customer = core_entity("customer", AccessMethod::HttpApi, &[], &["q", "name"]);

        let prompt = build_prompt(
            "show orders for customer John Smith",
            &[&customer, &order],
            &MinedContext::default(),
            &[],
            &[],
        );

        assert!(prompt.contains("- customer (access: http-api)"));
        assert!(prompt.contains("customer_id resolves via customer (search by q)"));
        assert!(prompt.contains("NEVER put pagination keys"));
        assert!(prompt.contains("PATTERN EXAMPLES"));
        assert!(prompt.contains(r#"QUESTION: "show orders for customer John Smith""#));
        assert!(prompt.contains("Respond with ONLY valid JSON"));
    }

    #[test]
    fn test_prompt_folds_in_doc_snippets() {
        let prompt = build_prompt(
            "anything",
            &[],
            &MinedContext::default(),
            &[],
            &["orders support the items relation".to_string()],
        );
        assert!(prompt.contains("DOCUMENTATION:"));
        assert!(prompt.contains("- orders support the items relation"));
    }
}
