//! Ranking and near-duplicate detection
//!
//! BM25 scoring with field boosts drives search and research
//! relevance; SimHash clustering collapses near-duplicate documents.

pub mod bm25;
pub mod simhash;

pub use bm25::{Bm25, RankDoc, ScoredDoc, tokenize};
pub use simhash::{dedup_keep_best, hamming, simhash64};
