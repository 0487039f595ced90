//! BM25 ranking with field boosts
//!
//! Standard Okapi BM25 (`k1 = 1.2`, `b = 0.75`, `k3 = 1.2`) over a
//! per-call corpus: document frequencies are computed from the ranked
//! set itself, matching the session-scoped IDF model. Title matches
//! are boosted x2.0 and heading matches x1.5, combined additively with
//! the body score. Ties keep insertion order.

use std::collections::{HashMap, HashSet};

/// Default field boosts.
const TITLE_BOOST: f64 = 2.0;
const HEADING_BOOST: f64 = 1.5;

/// Unicode-aware tokenization: lowercase, split on anything that is
/// not alphanumeric, drop tokens shorter than two characters.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_string)
        .collect()
}

/// A document to rank.
#[derive(Debug, Clone, Default)]
pub struct RankDoc {
    pub title: String,
    pub headings: Vec<String>,
    pub body: String,
}

impl RankDoc {
    #[must_use]
    pub fn from_body(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }
}

/// Result of ranking: index into the input slice plus score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredDoc {
    pub index: usize,
    pub score: f64,
}

struct FieldStats {
    /// term -> frequency per document
    term_freqs: Vec<HashMap<String, f64>>,
    /// document lengths in tokens
    lengths: Vec<f64>,
    avg_len: f64,
}

impl FieldStats {
    fn build(token_sets: Vec<Vec<String>>) -> Self {
        let lengths: Vec<f64> = token_sets.iter().map(|t| t.len() as f64).collect();
        let avg_len = if lengths.is_empty() {
            0.0
        } else {
            lengths.iter().sum::<f64>() / lengths.len() as f64
        };
        let term_freqs = token_sets
            .into_iter()
            .map(|tokens| {
                let mut freqs: HashMap<String, f64> = HashMap::new();
                for token in tokens {
                    *freqs.entry(token).or_insert(0.0) += 1.0;
                }
                freqs
            })
            .collect();
        Self {
            term_freqs,
            lengths,
            avg_len,
        }
    }

    fn score_term(&self, doc: usize, term: &str, k1: f64, b: f64) -> f64 {
        let Some(tf) = self.term_freqs[doc].get(term) else {
            return 0.0;
        };
        let dl = self.lengths[doc];
        let avg = if self.avg_len > 0.0 { self.avg_len } else { 1.0 };
        (tf * (k1 + 1.0)) / (tf + k1 * (1.0 - b + b * dl / avg))
    }
}

/// BM25 ranker. One instance may be reused; all state is per-call.
#[derive(Debug, Clone)]
pub struct Bm25 {
    pub k1: f64,
    pub b: f64,
    pub k3: f64,
    pub stopwords: Option<HashSet<String>>,
}

impl Default for Bm25 {
    fn default() -> Self {
        Self {
            k1: 1.2,
            b: 0.75,
            k3: 1.2,
            stopwords: None,
        }
    }
}

impl Bm25 {
    fn query_terms(&self, query: &str) -> Vec<(String, f64)> {
        let mut counts: Vec<(String, f64)> = Vec::new();
        for token in tokenize(query) {
            if let Some(stop) = &self.stopwords {
                if stop.contains(&token) {
                    continue;
                }
            }
            match counts.iter_mut().find(|(t, _)| *t == token) {
                Some((_, n)) => *n += 1.0,
                None => counts.push((token, 1.0)),
            }
        }
        counts
    }

    /// Rank `docs` against `query`, descending by score, stable on
    /// ties.
    #[must_use]
    pub fn rank(&self, query: &str, docs: &[RankDoc]) -> Vec<ScoredDoc> {
        let terms = self.query_terms(query);
        if terms.is_empty() || docs.is_empty() {
            return docs
                .iter()
                .enumerate()
                .map(|(index, _)| ScoredDoc { index, score: 0.0 })
                .collect();
        }

        let body = FieldStats::build(docs.iter().map(|d| tokenize(&d.body)).collect());
        let title = FieldStats::build(docs.iter().map(|d| tokenize(&d.title)).collect());
        let headings = FieldStats::build(
            docs.iter()
                .map(|d| tokenize(&d.headings.join(" ")))
                .collect(),
        );

        // Session-scoped document frequency: a term counts once per
        // document regardless of field.
        let n = docs.len() as f64;
        let mut df: HashMap<&str, f64> = HashMap::new();
        for (term, _) in &terms {
            let count = (0..docs.len())
                .filter(|&i| {
                    body.term_freqs[i].contains_key(term)
                        || title.term_freqs[i].contains_key(term)
                        || headings.term_freqs[i].contains_key(term)
                })
                .count() as f64;
            df.insert(term.as_str(), count);
        }

        let mut scored: Vec<ScoredDoc> = (0..docs.len())
            .map(|i| {
                let mut score = 0.0;
                for (term, qtf) in &terms {
                    let dfi = df.get(term.as_str()).copied().unwrap_or(0.0);
                    if dfi == 0.0 {
                        continue;
                    }
                    let idf = (1.0 + (n - dfi + 0.5) / (dfi + 0.5)).ln();
                    let qweight = ((self.k3 + 1.0) * qtf) / (self.k3 + qtf);
                    let field_score = body.score_term(i, term, self.k1, self.b)
                        + TITLE_BOOST * title.score_term(i, term, self.k1, self.b)
                        + HEADING_BOOST * headings.score_term(i, term, self.k1, self.b);
                    score += idf * qweight * field_score;
                }
                ScoredDoc { index: i, score }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.index.cmp(&b.index))
        });
        scored
    }

    /// Normalize a score list into `[0, 1]` by the maximum.
    #[must_use]
    pub fn normalize(scored: &[ScoredDoc]) -> Vec<ScoredDoc> {
        let max = scored.iter().map(|s| s.score).fold(0.0_f64, f64::max);
        if max <= 0.0 {
            return scored.to_vec();
        }
        scored
            .iter()
            .map(|s| ScoredDoc {
                index: s.index,
                score: s.score / max,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs() -> Vec<RankDoc> {
        vec![
            RankDoc {
                title: "Rust async runtime".into(),
                headings: vec!["Executors".into()],
                body: "Tokio is an asynchronous runtime for the Rust language.".into(),
            },
            RankDoc {
                title: "Gardening at home".into(),
                headings: vec!["Soil".into()],
                body: "Tomatoes need sunlight, water, and patience.".into(),
            },
            RankDoc {
                title: "Cooking pasta".into(),
                headings: vec![],
                body: "Asynchronous cooking is not a thing, but rust on pans is.".into(),
            },
        ]
    }

    #[test]
    fn tokenizer_lowercases_and_drops_short() {
        assert_eq!(
            tokenize("The HTTP/2 protocol, v2!"),
            ["the", "http", "protocol", "v2"]
        );
        assert_eq!(tokenize("a b c"), Vec::<String>::new());
    }

    #[test]
    fn relevant_doc_ranks_first() {
        let ranked = Bm25::default().rank("rust async runtime", &docs());
        assert_eq!(ranked[0].index, 0);
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn title_boost_outweighs_body_mention() {
        let corpus = vec![
            RankDoc {
                title: "irrelevant".into(),
                headings: vec![],
                body: "budget report".into(),
            },
            RankDoc {
                title: "budget report".into(),
                headings: vec![],
                body: "irrelevant".into(),
            },
        ];
        let ranked = Bm25::default().rank("budget report", &corpus);
        assert_eq!(ranked[0].index, 1, "title match should win");
    }

    #[test]
    fn ties_keep_insertion_order() {
        let corpus = vec![
            RankDoc::from_body("identical words here"),
            RankDoc::from_body("identical words here"),
        ];
        let ranked = Bm25::default().rank("identical words", &corpus);
        assert_eq!(ranked[0].index, 0);
        assert_eq!(ranked[1].index, 1);
    }

    #[test]
    fn stopwords_are_ignored() {
        let mut ranker = Bm25::default();
        ranker.stopwords = Some(["the".to_string()].into_iter().collect());
        let ranked = ranker.rank("the", &docs());
        assert!(ranked.iter().all(|s| s.score == 0.0));
    }

    #[test]
    fn normalize_caps_at_one() {
        let ranked = Bm25::default().rank("rust", &docs());
        let normalized = Bm25::normalize(&ranked);
        assert!(normalized[0].score <= 1.0 + f64::EPSILON);
        assert!((normalized[0].score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn empty_query_scores_zero() {
        let ranked = Bm25::default().rank("", &docs());
        assert_eq!(ranked.len(), 3);
        assert!(ranked.iter().all(|s| s.score == 0.0));
    }
}
