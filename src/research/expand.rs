//! Deterministic query expansion
//!
//! Used when no semantic scorer is installed: each research approach
//! maps the topic through a fixed template set, then variants are
//! deduplicated by normalized form.

use serde::{Deserialize, Serialize};

/// Research strategy; shapes query expansion and source weighting.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Approach {
    #[default]
    Broad,
    Focused,
    Academic,
    CurrentEvents,
    Comparative,
}

impl Approach {
    fn templates(self) -> &'static [&'static str] {
        match self {
            Self::Broad => &[
                "{topic}",
                "{topic} overview",
                "what is {topic}",
                "{topic} guide",
                "{topic} explained",
                "{topic} examples",
                "introduction to {topic}",
            ],
            Self::Focused => &[
                "{topic}",
                "{topic} specification",
                "{topic} details",
                "how {topic} works",
                "{topic} implementation",
                "{topic} internals",
            ],
            Self::Academic => &[
                "{topic}",
                "{topic} research",
                "{topic} study",
                "{topic} survey",
                "{topic} analysis",
                "{topic} literature review",
                "{topic} methodology",
            ],
            Self::CurrentEvents => &[
                "{topic}",
                "{topic} news",
                "{topic} latest",
                "{topic} recent developments",
                "{topic} update",
                "{topic} announcement",
            ],
            Self::Comparative => &[
                "{topic}",
                "{topic} comparison",
                "{topic} vs alternatives",
                "{topic} pros and cons",
                "alternatives to {topic}",
                "best {topic}",
            ],
        }
    }
}

/// Normalized form used for deduplication.
fn normalize(query: &str) -> String {
    query
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Produce up to `count` query variants for a topic.
#[must_use]
pub fn expand(topic: &str, approach: Approach, count: usize) -> Vec<String> {
    let topic = topic.trim();
    let mut seen = std::collections::HashSet::new();
    let mut queries = Vec::new();
    for template in approach.templates() {
        let query = template.replace("{topic}", topic);
        if seen.insert(normalize(&query)) {
            queries.push(query);
            if queries.len() >= count {
                break;
            }
        }
    }
    queries
}

/// Merge externally produced variants with the deterministic set,
/// deduplicating by normalized form.
#[must_use]
pub fn merge_variants(primary: Vec<String>, fallback: Vec<String>, count: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for query in primary.into_iter().chain(fallback) {
        let query = query.trim().to_string();
        if query.is_empty() {
            continue;
        }
        if seen.insert(normalize(&query)) {
            out.push(query);
            if out.len() >= count {
                break;
            }
        }
    }
    out
}
