//! Research orchestration
//!
//! Expands a topic into queries, gathers candidate sources through the
//! search capability, fetches and extracts them through the shared
//! pipeline, scores relevance (BM25, optionally blended with a
//! semantic scorer) and credibility, detects conflicting claims, and
//! synthesizes. Budgets and the cancellation token bound the whole
//! run; exhausting any budget returns partial results flagged
//! `truncated`.

pub mod credibility;
pub mod expand;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capabilities::{Capabilities, SearchHit, Synthesis};
use crate::error::{HarvestError, HarvestResult};
use crate::guard::CanonicalUrl;
use crate::pipeline::{FetchOptions, Pipeline};
use crate::rank::{Bm25, RankDoc, simhash64};

pub use credibility::{SourceSignals, SourceType, classify};
pub use expand::{Approach, expand};

/// Validated research parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchRequest {
    pub topic: String,
    pub approach: Approach,
    pub max_depth: u32,
    pub max_urls: u32,
    pub time_limit_ms: u64,
    pub source_types: Option<Vec<String>>,
    pub credibility_threshold: f64,
}

impl ResearchRequest {
    pub fn validate(&self) -> HarvestResult<()> {
        if self.topic.trim().is_empty() {
            return Err(HarvestError::InvalidArgument("topic is empty".into()));
        }
        if !(0.0..=1.0).contains(&self.credibility_threshold) {
            return Err(HarvestError::OutOfRange {
                field: "credibility_threshold".into(),
                message: "must be in 0..=1".into(),
            });
        }
        if self.max_urls == 0 {
            return Err(HarvestError::OutOfRange {
                field: "max_urls".into(),
                message: "must be >= 1".into(),
            });
        }
        if let Some(types) = &self.source_types {
            for t in types {
                if SourceType::parse(t).is_none() {
                    return Err(HarvestError::InvalidArgument(format!(
                        "unknown source type '{t}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One scored source in the findings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub url: String,
    pub title: String,
    pub source_type: String,
    pub relevance: f64,
    pub credibility: f64,
    /// Representative quote from the document.
    pub excerpt: String,
}

/// A pair of sentences that agree lexically but disagree in polarity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub url_a: String,
    pub sentence_a: String,
    pub url_b: String,
    pub sentence_b: String,
    pub lexical_similarity: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchMetrics {
    pub queries: usize,
    pub sources_discovered: usize,
    pub sources_fetched: usize,
    pub sources_discarded: usize,
    pub duration_ms: u64,
}

/// Full research result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchOutcome {
    pub topic: String,
    pub findings: Vec<Finding>,
    /// Statements supported by more than one source.
    pub consensus: Vec<String>,
    pub conflicts: Vec<Conflict>,
    pub synthesis: Option<Synthesis>,
    pub truncated: bool,
    pub metrics: ResearchMetrics,
}

struct FetchedSource {
    url: CanonicalUrl,
    title: String,
    text: String,
    signals: SourceSignals,
}

pub struct ResearchOrchestrator {
    pipeline: Arc<Pipeline>,
    capabilities: Capabilities,
}

impl ResearchOrchestrator {
    #[must_use]
    pub fn new(pipeline: Arc<Pipeline>, capabilities: Capabilities) -> Self {
        Self {
            pipeline,
            capabilities,
        }
    }

    pub async fn run(
        &self,
        request: &ResearchRequest,
        cancel: &CancellationToken,
    ) -> HarvestResult<ResearchOutcome> {
        request.validate()?;
        let started = Instant::now();
        let deadline = started + Duration::from_millis(request.time_limit_ms);
        let mut metrics = ResearchMetrics::default();
        let mut truncated = false;

        // Stage 1: query expansion.
        let variant_count = self.pipeline.config().research.query_variants;
        let queries = self
            .expanded_queries(&request.topic, request.approach, variant_count)
            .await;
        metrics.queries = queries.len();
        debug!(topic = %request.topic, queries = metrics.queries, "queries expanded");

        // Stage 2: source gathering.
        let hits = self.gather(&queries, request, deadline, cancel).await;
        metrics.sources_discovered = hits.len();
        if hits.is_empty() {
            info!(topic = %request.topic, "no sources discovered");
            metrics.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(ResearchOutcome {
                topic: request.topic.clone(),
                findings: Vec::new(),
                consensus: Vec::new(),
                conflicts: Vec::new(),
                synthesis: None,
                truncated: false,
                metrics,
            });
        }

        // Stage 3: fetch and extract concurrently.
        let (sources, cut_off) = self.fetch_sources(hits, request, deadline, cancel).await;
        truncated |= cut_off;
        metrics.sources_fetched = sources.len();

        // Stage 4: relevance + credibility.
        let (findings, discarded, source_texts) =
            self.score_sources(&request.topic, request, sources).await;
        metrics.sources_discarded = discarded;

        // Stage 5: conflicts + consensus from claim sentences.
        let (consensus, conflicts) = claim_analysis(&source_texts);

        // Stage 6: synthesis.
        let synthesis = self.synthesize(&request.topic, &findings).await;

        metrics.duration_ms = started.elapsed().as_millis() as u64;
        if Instant::now() >= deadline {
            truncated = true;
        }
        info!(
            topic = %request.topic,
            findings = findings.len(),
            conflicts = conflicts.len(),
            truncated,
            "research complete"
        );

        Ok(ResearchOutcome {
            topic: request.topic.clone(),
            findings,
            consensus,
            conflicts,
            synthesis,
            truncated,
            metrics,
        })
    }

    async fn expanded_queries(
        &self,
        topic: &str,
        approach: Approach,
        count: usize,
    ) -> Vec<String> {
        let primary = match &self.capabilities.semantic {
            Some(scorer) => match scorer.expand_queries(topic, count).await {
                Ok(variants) => variants,
                Err(e) => {
                    warn!(error = %e, "semantic expansion failed, using templates");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        expand::merge_variants(primary, expand(topic, approach, count), count)
    }

    /// Union search hits across queries, guard-admitted and
    /// SimHash-deduplicated on title+snippet.
    async fn gather(
        &self,
        queries: &[String],
        request: &ResearchRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Vec<(CanonicalUrl, SearchHit)> {
        let Some(search) = &self.capabilities.search else {
            // No search capability: the topic itself may be a URL seed.
            if let Ok(url) = self.pipeline.guard().admit(&request.topic).await {
                let hit = SearchHit {
                    url: url.as_str().to_string(),
                    title: request.topic.clone(),
                    snippet: String::new(),
                };
                return vec![(url, hit)];
            }
            return Vec::new();
        };

        let per_query = (request.max_urls as usize / queries.len().max(1)).max(3);
        let mut admitted: Vec<(CanonicalUrl, SearchHit)> = Vec::new();
        let mut seen_urls: HashSet<String> = HashSet::new();

        for query in queries {
            if cancel.is_cancelled() || Instant::now() >= deadline {
                break;
            }
            let hits = match search.search(query, per_query).await {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(query = %query, error = %e, "search failed");
                    continue;
                }
            };
            for hit in hits {
                let Ok(url) = self.pipeline.guard().admit(&hit.url).await else {
                    continue;
                };
                if !seen_urls.insert(url.as_str().to_string()) {
                    continue;
                }
                admitted.push((url, hit));
            }
        }

        // Near-duplicate titles/snippets collapse to the longest
        // snippet representative.
        let hashes: Vec<u64> = admitted
            .iter()
            .map(|(_, h)| simhash64(&format!("{} {}", h.title, h.snippet)))
            .collect();
        let quality: Vec<f64> = admitted
            .iter()
            .map(|(_, h)| (h.title.len() + h.snippet.len()) as f64)
            .collect();
        let keep = crate::rank::dedup_keep_best(&hashes, &quality, crate::rank::simhash::DEFAULT_THRESHOLD);
        let mut kept: Vec<(CanonicalUrl, SearchHit)> = keep
            .into_iter()
            .map(|i| admitted[i].clone())
            .collect();
        kept.truncate(request.max_urls as usize);
        kept
    }

    async fn fetch_sources(
        &self,
        hits: Vec<(CanonicalUrl, SearchHit)>,
        request: &ResearchRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> (Vec<FetchedSource>, bool) {
        let concurrency = self.pipeline.config().crawl.concurrency.max(1);
        let options = FetchOptions::default();
        let mut truncated = false;

        let total = hits.len();
        let fetches = futures::stream::iter(hits.into_iter().map(|(url, hit)| {
            let pipeline = Arc::clone(&self.pipeline);
            let options = options.clone();
            let cancel = cancel.clone();
            async move {
                if Instant::now() >= deadline || cancel.is_cancelled() {
                    return None;
                }
                let page = match pipeline.fetch_admitted(url.clone(), &options, &cancel).await {
                    Ok(page) => page,
                    Err(e) => {
                        debug!(url = %url, error = %e, "source fetch failed");
                        return None;
                    }
                };
                let html = page.text();
                let extractor = Arc::clone(pipeline.extractor());
                let hit_title = hit.title.clone();
                let base = url.clone();
                let parsed = pipeline
                    .workers()
                    .submit(&cancel, move || {
                        let article = extractor.article(&html);
                        let meta = extractor.metadata(&html);
                        let references = extractor.links(&html, &base).len();
                        (article, meta, references)
                    })
                    .await
                    .ok()?;
                let (article, meta, reference_count) = parsed;
                let title = meta
                    .title
                    .or(article.title.clone())
                    .unwrap_or(hit_title);
                let signals = SourceSignals {
                    has_title: !title.is_empty(),
                    has_description: meta.description.is_some(),
                    reference_count,
                    word_count: article.word_count,
                };
                Some(FetchedSource {
                    url,
                    title,
                    text: article.text,
                    signals,
                })
            }
        }))
        .buffer_unordered(concurrency)
        .collect::<Vec<Option<FetchedSource>>>()
        .await;

        let sources: Vec<FetchedSource> = fetches.into_iter().flatten().collect();
        if sources.len() < total && (Instant::now() >= deadline || cancel.is_cancelled()) {
            truncated = true;
        }
        (sources, truncated)
    }

    async fn score_sources(
        &self,
        topic: &str,
        request: &ResearchRequest,
        sources: Vec<FetchedSource>,
    ) -> (Vec<Finding>, usize, Vec<(String, String)>) {
        let type_filter: Option<Vec<SourceType>> = request.source_types.as_ref().map(|types| {
            types.iter().filter_map(|t| SourceType::parse(t)).collect()
        });

        let docs: Vec<RankDoc> = sources
            .iter()
            .map(|s| RankDoc {
                title: s.title.clone(),
                headings: Vec::new(),
                body: s.text.clone(),
            })
            .collect();
        let ranked = Bm25::normalize(&Bm25::default().rank(topic, &docs));
        let mut bm25_by_index = vec![0.0f64; sources.len()];
        for scored in &ranked {
            bm25_by_index[scored.index] = scored.score;
        }

        let mut findings = Vec::new();
        let mut discarded = 0usize;
        let mut texts = Vec::new();

        for (i, source) in sources.iter().enumerate() {
            let source_type = classify(&source.url);
            if let Some(filter) = &type_filter {
                if !filter.contains(&source_type) {
                    discarded += 1;
                    continue;
                }
            }

            let relevance = match &self.capabilities.semantic {
                Some(scorer) => match scorer.score(topic, &source.text).await {
                    Ok(semantic) => 0.4 * bm25_by_index[i] + 0.6 * semantic,
                    Err(_) => bm25_by_index[i],
                },
                None => bm25_by_index[i],
            };

            let credibility = credibility::score(&source.url, &source.signals);
            if credibility < request.credibility_threshold {
                discarded += 1;
                continue;
            }

            texts.push((source.url.as_str().to_string(), source.text.clone()));
            findings.push(Finding {
                url: source.url.as_str().to_string(),
                title: source.title.clone(),
                source_type: source_type.as_str().to_string(),
                relevance,
                credibility,
                excerpt: best_excerpt(topic, &source.text),
            });
        }

        findings.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        (findings, discarded, texts)
    }

    async fn synthesize(&self, topic: &str, findings: &[Finding]) -> Option<Synthesis> {
        let synthesizer = self.capabilities.synthesizer.as_ref()?;
        let excerpts: Vec<String> = findings
            .iter()
            .take(10)
            .map(|f| format!("[{}] {}", f.url, f.excerpt))
            .collect();
        match synthesizer.synthesize(topic, &excerpts).await {
            Ok(synthesis) => Some(synthesis),
            Err(e) => {
                warn!(error = %e, "synthesis failed");
                None
            }
        }
    }
}

/// The sentence scoring best against the topic terms.
fn best_excerpt(topic: &str, text: &str) -> String {
    let topic_tokens: HashSet<String> = crate::rank::tokenize(topic).into_iter().collect();
    split_sentences(text)
        .into_iter()
        .max_by_key(|sentence| {
            crate::rank::tokenize(sentence)
                .iter()
                .filter(|t| topic_tokens.contains(*t))
                .count()
        })
        .unwrap_or_default()
        .chars()
        .take(400)
        .collect()
}

fn split_sentences(text: &str) -> Vec<String> {
    text.split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| s.split_whitespace().count() >= 4)
        .map(str::to_string)
        .collect()
}

const NEGATION_MARKERS: &[&str] = &[
    "not", "no", "never", "cannot", "isn", "aren", "wasn", "doesn", "don", "won", "shouldn",
    "false", "incorrect", "myth",
];

fn polarity_negative(sentence: &str) -> bool {
    crate::rank::tokenize(sentence)
        .iter()
        .any(|t| NEGATION_MARKERS.contains(&t.as_str()))
}

fn lexical_similarity(a: &str, b: &str) -> f64 {
    let ta: HashSet<String> = crate::rank::tokenize(a)
        .into_iter()
        .filter(|t| !NEGATION_MARKERS.contains(&t.as_str()))
        .collect();
    let tb: HashSet<String> = crate::rank::tokenize(b)
        .into_iter()
        .filter(|t| !NEGATION_MARKERS.contains(&t.as_str()))
        .collect();
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    intersection / union
}

/// Cross-source sentence analysis: repeated claims become consensus,
/// lexically-similar claims with opposite polarity become conflicts.
fn claim_analysis(sources: &[(String, String)]) -> (Vec<String>, Vec<Conflict>) {
    let mut sentences: Vec<(usize, String)> = Vec::new();
    for (i, (_, text)) in sources.iter().enumerate() {
        for sentence in split_sentences(text).into_iter().take(40) {
            sentences.push((i, sentence));
        }
    }

    let mut consensus = Vec::new();
    let mut conflicts = Vec::new();
    let mut consumed: HashSet<usize> = HashSet::new();

    for a in 0..sentences.len() {
        for b in (a + 1)..sentences.len() {
            let (src_a, ref sent_a) = sentences[a];
            let (src_b, ref sent_b) = sentences[b];
            if src_a == src_b {
                continue;
            }
            let similarity = lexical_similarity(sent_a, sent_b);
            if similarity < 0.6 {
                continue;
            }
            let (neg_a, neg_b) = (polarity_negative(sent_a), polarity_negative(sent_b));
            if neg_a != neg_b {
                conflicts.push(Conflict {
                    url_a: sources[src_a].0.clone(),
                    sentence_a: sent_a.clone(),
                    url_b: sources[src_b].0.clone(),
                    sentence_b: sent_b.clone(),
                    lexical_similarity: similarity,
                });
            } else if consumed.insert(a) {
                consensus.push(sent_a.clone());
            }
        }
    }

    consensus.truncate(10);
    conflicts.truncate(10);
    (consensus, conflicts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentences_split_and_filter_short() {
        let text = "One two three four. Too short. Five six seven eight nine!";
        let sentences = split_sentences(text);
        assert_eq!(sentences.len(), 2);
    }

    #[test]
    fn polarity_detection() {
        assert!(polarity_negative("This claim is not true at all"));
        assert!(!polarity_negative("This claim is completely true"));
    }

    #[test]
    fn conflicting_claims_detected() {
        let sources = vec![
            (
                "https://a.example/".to_string(),
                "The moon landing happened in 1969 according to records.".to_string(),
            ),
            (
                "https://b.example/".to_string(),
                "The moon landing never happened in 1969 according to records.".to_string(),
            ),
        ];
        let (_, conflicts) = claim_analysis(&sources);
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].lexical_similarity >= 0.6);
    }

    #[test]
    fn repeated_claims_become_consensus() {
        let sources = vec![
            (
                "https://a.example/".to_string(),
                "Rust guarantees memory safety without garbage collection.".to_string(),
            ),
            (
                "https://b.example/".to_string(),
                "Rust guarantees memory safety without garbage collection.".to_string(),
            ),
        ];
        let (consensus, conflicts) = claim_analysis(&sources);
        assert_eq!(consensus.len(), 1);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn excerpt_picks_topical_sentence() {
        let text = "Weather was mild today overall. Tokio provides an async runtime \
            for Rust applications. Lunch was good too actually.";
        let excerpt = best_excerpt("rust async runtime", text);
        assert!(excerpt.contains("Tokio"));
    }

    #[test]
    fn request_validation() {
        let mut request = ResearchRequest {
            topic: "test topic".into(),
            approach: Approach::Broad,
            max_depth: 2,
            max_urls: 10,
            time_limit_ms: 1_000,
            source_types: None,
            credibility_threshold: 0.3,
        };
        assert!(request.validate().is_ok());
        request.credibility_threshold = 1.5;
        assert!(request.validate().is_err());
        request.credibility_threshold = 0.5;
        request.source_types = Some(vec!["blogzz".into()]);
        assert!(request.validate().is_err());
        request.source_types = Some(vec!["academic".into()]);
        request.topic = "  ".into();
        assert!(request.validate().is_err());
    }
}
