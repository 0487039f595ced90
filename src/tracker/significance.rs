//! Change significance scoring
//!
//! Compares two page feature sets along four axes and folds them into
//! one score in `[0, 1]`:
//!   content (token edit distance, weight 0.4), structure (tag
//!   sequence edit distance, 0.2), metadata (key/value Jaccard, 0.2),
//!   visual (element count ratio + CSS class Jaccard, 0.2).
//! A component with no signal on either side (no metadata, no classes)
//! is excluded and the remaining weights renormalized, so a full text
//! rewrite on a bare page still registers as a major change.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::TrackerConfig;
use crate::extract::{ContentExtractor, PageSkeleton};
use crate::rank::tokenize;

/// Cap on sequence length for edit-distance computation.
const EDIT_DISTANCE_CAP: usize = 512;

/// Categorical change label.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Significance {
    None,
    Minor,
    Moderate,
    Major,
    Critical,
}

impl Significance {
    /// Map a score through the configured thresholds.
    #[must_use]
    pub fn from_score(score: f64, thresholds: &[f64; 4]) -> Self {
        if score < thresholds[0] {
            Self::None
        } else if score < thresholds[1] {
            Self::Minor
        } else if score < thresholds[2] {
            Self::Moderate
        } else if score < thresholds[3] {
            Self::Major
        } else {
            Self::Critical
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Minor => "minor",
            Self::Moderate => "moderate",
            Self::Major => "major",
            Self::Critical => "critical",
        }
    }
}

/// Everything the comparison needs, extracted once per page version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageFeatures {
    pub text: String,
    pub tags: Vec<String>,
    pub classes: BTreeSet<String>,
    pub element_count: usize,
    pub metadata_pairs: BTreeMap<String, String>,
    /// Heading -> hash of the section text that follows it.
    pub sections: BTreeMap<String, u64>,
}

impl PageFeatures {
    /// Extract features from HTML, honoring excluded selectors.
    #[must_use]
    pub fn build(
        extractor: &dyn ContentExtractor,
        html: &str,
        excluded_selectors: &[String],
        text_only: bool,
    ) -> Self {
        let html = extractor.strip(html, excluded_selectors);
        let text = extractor.text(&html);
        let (tags, classes, element_count) = if text_only {
            (Vec::new(), BTreeSet::new(), 0)
        } else {
            let PageSkeleton {
                tags,
                classes,
                element_count,
            } = extractor.skeleton(&html);
            (tags, classes, element_count)
        };

        let meta = extractor.metadata(&html);
        let mut metadata_pairs = BTreeMap::new();
        if let Some(title) = &meta.title {
            metadata_pairs.insert("title".to_string(), title.clone());
        }
        if let Some(description) = &meta.description {
            metadata_pairs.insert("description".to_string(), description.clone());
        }
        for (k, v) in &meta.open_graph {
            metadata_pairs.insert(format!("og:{k}"), v.clone());
        }
        for (k, v) in &meta.twitter {
            metadata_pairs.insert(format!("twitter:{k}"), v.clone());
        }

        let sections = section_hashes(extractor, &html, &text);

        Self {
            text,
            tags,
            classes,
            element_count,
            metadata_pairs,
            sections,
        }
    }

    #[must_use]
    pub fn text_hash(&self) -> String {
        format!("{:016x}", xxh3_64(self.text.as_bytes()))
    }

    #[must_use]
    pub fn structural_hash(&self) -> String {
        format!("{:016x}", xxh3_64(self.tags.join(">").as_bytes()))
    }
}

/// Hash the text run following each heading; the preamble before the
/// first heading hashes under "_preamble".
fn section_hashes(
    extractor: &dyn ContentExtractor,
    html: &str,
    text: &str,
) -> BTreeMap<String, u64> {
    let headings = extractor.headings(html);
    let mut sections = BTreeMap::new();
    if headings.is_empty() {
        sections.insert("_page".to_string(), xxh3_64(text.as_bytes()));
        return sections;
    }

    let mut remainder = text;
    let mut previous: Option<String> = None;
    for heading in &headings {
        if let Some(at) = remainder.find(heading.as_str()) {
            let (before, after) = remainder.split_at(at);
            let key = previous.take().unwrap_or_else(|| "_preamble".to_string());
            sections.insert(key, xxh3_64(before.trim().as_bytes()));
            remainder = &after[heading.len()..];
            previous = Some(heading.clone());
        }
    }
    if let Some(last) = previous {
        sections.insert(last, xxh3_64(remainder.trim().as_bytes()));
    }
    sections
}

/// Result of one comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeAnalysis {
    /// Content similarity in `[0, 1]`.
    pub similarity: f64,
    /// Combined change score in `[0, 1]`.
    pub score: f64,
    pub significance: Significance,
    pub content_change: f64,
    pub structural_change: f64,
    pub metadata_change: Option<f64>,
    pub visual_change: Option<f64>,
    pub sections_changed: Vec<String>,
}

/// Bounded Levenshtein over arbitrary comparable items, normalized to
/// `[0, 1]` by the longer sequence.
fn normalized_edit_distance<T: PartialEq>(a: &[T], b: &[T]) -> f64 {
    let a = &a[..a.len().min(EDIT_DISTANCE_CAP)];
    let b = &b[..b.len().min(EDIT_DISTANCE_CAP)];
    let (n, m) = (a.len(), b.len());
    if n == 0 && m == 0 {
        return 0.0;
    }
    if n == 0 || m == 0 {
        return 1.0;
    }
    let mut previous: Vec<usize> = (0..=m).collect();
    let mut current = vec![0usize; m + 1];
    for i in 1..=n {
        current[0] = i;
        for j in 1..=m {
            let substitution = previous[j - 1] + usize::from(a[i - 1] != b[j - 1]);
            current[j] = substitution
                .min(previous[j] + 1)
                .min(current[j - 1] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[m] as f64 / n.max(m) as f64
}

fn jaccard<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

/// Compare two feature sets under the configured weights.
#[must_use]
pub fn analyze(old: &PageFeatures, new: &PageFeatures, config: &TrackerConfig) -> ChangeAnalysis {
    let old_tokens = tokenize(&old.text);
    let new_tokens = tokenize(&new.text);
    let content_change = normalized_edit_distance(&old_tokens, &new_tokens);
    let similarity = 1.0 - content_change;

    let structural_change = if old.tags.is_empty() && new.tags.is_empty() {
        0.0
    } else {
        normalized_edit_distance(&old.tags, &new.tags)
    };

    let metadata_change = if old.metadata_pairs.is_empty() && new.metadata_pairs.is_empty() {
        None
    } else {
        let old_pairs: BTreeSet<String> = old
            .metadata_pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let new_pairs: BTreeSet<String> = new
            .metadata_pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        Some(1.0 - jaccard(&old_pairs, &new_pairs))
    };

    let visual_change = if old.classes.is_empty() && new.classes.is_empty() {
        None
    } else {
        let class_similarity = jaccard(&old.classes, &new.classes);
        let count_similarity = {
            let (small, large) = (
                old.element_count.min(new.element_count) as f64,
                old.element_count.max(new.element_count) as f64,
            );
            if large == 0.0 { 1.0 } else { small / large }
        };
        Some(1.0 - 0.5 * (class_similarity + count_similarity))
    };

    // Exclude no-signal components and renormalize the weights.
    let mut score = config.weight_content * content_change
        + config.weight_structural * structural_change;
    let mut weight_total = config.weight_content + config.weight_structural;
    if let Some(change) = metadata_change {
        score += config.weight_metadata * change;
        weight_total += config.weight_metadata;
    }
    if let Some(change) = visual_change {
        score += config.weight_visual * change;
        weight_total += config.weight_visual;
    }
    let score = if weight_total > 0.0 {
        (score / weight_total).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let sections_changed = diff_sections(&old.sections, &new.sections);

    ChangeAnalysis {
        similarity,
        score,
        significance: Significance::from_score(score, &config.thresholds),
        content_change,
        structural_change,
        metadata_change,
        visual_change,
        sections_changed,
    }
}

fn diff_sections(old: &BTreeMap<String, u64>, new: &BTreeMap<String, u64>) -> Vec<String> {
    let mut changed = Vec::new();
    for (key, hash) in new {
        match old.get(key) {
            Some(previous) if previous == hash => {}
            _ => changed.push(key.clone()),
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            changed.push(key.clone());
        }
    }
    changed.sort();
    changed.dedup();
    changed
}
