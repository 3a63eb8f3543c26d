//! Defensive parsing of classification replies.
//!
//! Models wrap JSON in code fences, invent category labels, and sometimes
//! answer in prose. The parse ladder here guarantees the category closure
//! invariant: whatever comes back, the result's category is a member of the
//! enumeration.

use serde::Deserialize;

use tally_core::{Category, ClassificationResult};

#[derive(Deserialize)]
struct Reply {
    category: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Parse a raw model reply into a result.
///
/// Ladder: typed JSON parse (with code-fence stripping) → best-effort textual
/// match of a label in the raw text → zero-confidence fallback.
pub fn parse_reply(raw: &str) -> ClassificationResult {
    let body = strip_code_fence(raw);

    if let Ok(reply) = serde_json::from_str::<Reply>(body) {
        return from_reply(reply);
    }

    if let Some(category) = scan_label(raw) {
        return ClassificationResult::new(
            category,
            0.3,
            format!("Recovered category '{}' from unstructured reply", category),
        );
    }

    ClassificationResult::fallback("Classification reply was not parseable")
}

fn from_reply(reply: Reply) -> ClassificationResult {
    match Category::from_label(&reply.category) {
        Some(category) => ClassificationResult::new(
            category,
            reply.confidence,
            reply
                .reasoning
                .unwrap_or_else(|| "No reasoning provided".to_string()),
        ),
        None => ClassificationResult::substituted(&reply.category, reply.confidence),
    }
}

/// Strip a ``` / ```json fence if the reply is wrapped in one.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Look for a category label inside free text, longest label first so
/// e.g. "Office Supplies" wins over a shorter label embedded in it.
fn scan_label(raw: &str) -> Option<Category> {
    let haystack = raw.to_ascii_lowercase();
    let mut labels: Vec<Category> = Category::ALL.to_vec();
    labels.sort_by_key(|c| std::cmp::Reverse(c.label().len()));
    labels
        .into_iter()
        .find(|c| haystack.contains(&c.label().to_ascii_lowercase()))
}
