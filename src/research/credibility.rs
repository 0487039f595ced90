//! Source credibility heuristics
//!
//! A deterministic `[0, 1]` credibility estimate from source signals:
//! transport security, domain class, metadata completeness, and
//! outbound references. This is the metric the research orchestrator
//! filters on, separate from topical relevance.

use serde::{Deserialize, Serialize};

use crate::guard::CanonicalUrl;

/// Coarse source classification used by source-type filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Academic,
    Government,
    News,
    Reference,
    Blog,
    Other,
}

impl SourceType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Academic => "academic",
            Self::Government => "government",
            Self::News => "news",
            Self::Reference => "reference",
            Self::Blog => "blog",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "academic" => Some(Self::Academic),
            "government" => Some(Self::Government),
            "news" => Some(Self::News),
            "reference" => Some(Self::Reference),
            "blog" => Some(Self::Blog),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Classify a source by host shape.
#[must_use]
pub fn classify(url: &CanonicalUrl) -> SourceType {
    let host = url.host();
    if host.ends_with(".gov") || host.contains(".gov.") {
        return SourceType::Government;
    }
    if host.ends_with(".edu")
        || host.contains("arxiv.")
        || host.contains("doi.org")
        || host.contains("scholar.")
    {
        return SourceType::Academic;
    }
    if host.contains("wikipedia.") || host.contains("wiktionary.") {
        return SourceType::Reference;
    }
    if host.contains("news") || host.starts_with("feeds.") {
        return SourceType::News;
    }
    if host.contains("blog") || host.contains("medium.") || host.contains("substack.") {
        return SourceType::Blog;
    }
    SourceType::Other
}

/// Signals observed about one source document.
#[derive(Debug, Clone, Default)]
pub struct SourceSignals {
    pub has_title: bool,
    pub has_description: bool,
    /// Outbound links in the document body.
    pub reference_count: usize,
    pub word_count: usize,
}

/// Estimate credibility in `[0, 1]`.
#[must_use]
pub fn score(url: &CanonicalUrl, signals: &SourceSignals) -> f64 {
    let mut score: f64 = 0.25;

    if url.scheme() == "https" {
        score += 0.15;
    }
    score += match classify(url) {
        SourceType::Government | SourceType::Academic => 0.3,
        SourceType::Reference => 0.25,
        SourceType::News => 0.15,
        SourceType::Blog => 0.05,
        SourceType::Other => 0.1,
    };
    if signals.has_title {
        score += 0.05;
    }
    if signals.has_description {
        score += 0.05;
    }
    if signals.reference_count >= 5 {
        score += 0.1;
    } else if signals.reference_count >= 1 {
        score += 0.05;
    }
    if signals.word_count >= 300 {
        score += 0.1;
    }

    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> CanonicalUrl {
        CanonicalUrl::parse(s).expect("url")
    }

    #[test]
    fn classification_by_host() {
        assert_eq!(classify(&url("https://www.nih.gov/x")), SourceType::Government);
        assert_eq!(classify(&url("https://cs.stanford.edu/p")), SourceType::Academic);
        assert_eq!(classify(&url("https://en.wikipedia.org/wiki/X")), SourceType::Reference);
        assert_eq!(classify(&url("https://blog.example.com/")), SourceType::Blog);
        assert_eq!(classify(&url("https://example.com/")), SourceType::Other);
    }

    #[test]
    fn rich_academic_https_beats_bare_http_blog() {
        let strong = score(
            &url("https://research.mit.edu/paper"),
            &SourceSignals {
                has_title: true,
                has_description: true,
                reference_count: 12,
                word_count: 2_000,
            },
        );
        let weak = score(&url("http://myblog.example.com/"), &SourceSignals::default());
        assert!(strong > 0.8);
        assert!(weak < 0.5);
        assert!(strong <= 1.0);
    }

    #[test]
    fn source_type_round_trips_strings() {
        for t in [
            SourceType::Academic,
            SourceType::Government,
            SourceType::News,
            SourceType::Reference,
            SourceType::Blog,
            SourceType::Other,
        ] {
            assert_eq!(SourceType::parse(t.as_str()), Some(t));
        }
        assert_eq!(SourceType::parse("junk"), None);
    }
}
