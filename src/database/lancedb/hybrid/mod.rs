//! Scoring helpers for keyword and hybrid retrieval.
//!
//! Keyword relevance is BM25 over lowercase alphanumeric tokens. Hybrid
//! ranking min-max normalises the dense and keyword scores of the candidate
//! set and combines them with weights that are normalised to sum to 1.


use std::cmp::Ordering;
use std::collections::HashMap;

use super::{ChunkMetadata, SearchResult};

pub const BM25_K1: f32 = 1.2;
pub const BM25_B: f32 = 0.75;

/// Split text into lowercase alphanumeric tokens, dropping single characters
#[inline]
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() > 1)
        .map(str::to_lowercase)
        .collect()
}

/// In-memory BM25 index over a fixed set of documents
#[derive(Debug, Clone, Default)]
pub struct Bm25Index {
    term_frequencies: Vec<HashMap<String, u32>>,
    lengths: Vec<usize>,
    document_frequencies: HashMap<String, usize>,
    average_length: f32,
}

impl Bm25Index {
    #[inline]
    pub fn new<'a>(documents: impl IntoIterator<Item = &'a str>) -> Self {
        let mut term_frequencies = Vec::new();
        let mut lengths = Vec::new();
        let mut document_frequencies: HashMap<String, usize> = HashMap::new();

        for document in documents {
            let tokens = tokenize(document);
            let mut frequencies: HashMap<String, u32> = HashMap::new();
            for token in &tokens {
                *frequencies.entry(token.clone()).or_insert(0) += 1;
            }
            for term in frequencies.keys() {
                *document_frequencies.entry(term.clone()).or_insert(0) += 1;
            }
            lengths.push(tokens.len());
            term_frequencies.push(frequencies);
        }

        let average_length = if lengths.is_empty() {
            0.0
        } else {
            lengths.iter().sum::<usize>() as f32 / lengths.len() as f32
        };

        Self {
            term_frequencies,
            lengths,
            document_frequencies,
            average_length,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    /// BM25 score of every document for the query, in document order
    #[inline]
    pub fn score(&self, query: &str) -> Vec<f32> {
        let mut query_terms = tokenize(query);
        query_terms.sort_unstable();
        query_terms.dedup();

        let total = self.len() as f32;
        let idfs: Vec<(String, f32)> = query_terms
            .into_iter()
            .filter_map(|term| {
                let df = *self.document_frequencies.get(&term)? as f32;
                let idf = ((total - df + 0.5) / (df + 0.5)).ln_1p();
                Some((term, idf))
            })
            .collect();

        self.term_frequencies
            .iter()
            .zip(&self.lengths)
            .map(|(frequencies, &length)| {
                let length_ratio = if self.average_length > 0.0 {
                    length as f32 / self.average_length
                } else {
                    0.0
                };
                idfs.iter()
                    .filter_map(|(term, idf)| {
                        let tf = *frequencies.get(term)? as f32;
                        let norm = BM25_K1 * (1.0 - BM25_B + BM25_B * length_ratio);
                        Some(idf * tf * (BM25_K1 + 1.0) / (tf + norm))
                    })
                    .sum()
            })
            .collect()
    }
}

/// Map a LanceDB cosine distance (0..=2) to a similarity in 0..=1
#[inline]
pub fn dense_score_from_distance(distance: f32) -> f32 {
    (1.0 - distance / 2.0).clamp(0.0, 1.0)
}

/// Same mapping as [`dense_score_from_distance`], computed from raw vectors
#[inline]
pub fn dense_score_from_vectors(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.5;
    }
    let cosine = dot / (norm_a * norm_b);
    dense_score_from_distance(1.0 - cosine)
}

/// Scale scores to 0..=1. Equal positive scores map to 1, all-zero stays 0.
#[inline]
pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    let Some(max) = scores.iter().copied().reduce(f32::max) else {
        return Vec::new();
    };
    let min = scores.iter().copied().fold(max, f32::min);

    if (max - min).abs() <= f32::EPSILON {
        let value = if max > 0.0 { 1.0 } else { 0.0 };
        return vec![value; scores.len()];
    }

    scores.iter().map(|s| (s - min) / (max - min)).collect()
}

/// Scale scores by the maximum so the best match is 1
#[inline]
pub fn max_normalize(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(0.0, f32::max);
    if max <= 0.0 {
        return vec![0.0; scores.len()];
    }
    scores.iter().map(|s| s / max).collect()
}

/// A chunk with both raw scores, before fusion
#[derive(Debug, Clone)]
pub struct Candidate {
    pub metadata: ChunkMetadata,
    pub dense_score: f32,
    pub keyword_score: f32,
}

/// Combine candidates into the top `k` hybrid results
#[inline]
pub fn fuse(
    candidates: Vec<Candidate>,
    dense_weight: f32,
    keyword_weight: f32,
    k: usize,
) -> Vec<SearchResult> {
    let total_weight = dense_weight + keyword_weight;
    let (dense_weight, keyword_weight) = if total_weight > 0.0 {
        (dense_weight / total_weight, keyword_weight / total_weight)
    } else {
        (0.5, 0.5)
    };

    let dense: Vec<f32> = candidates.iter().map(|c| c.dense_score).collect();
    let keyword: Vec<f32> = candidates.iter().map(|c| c.keyword_score).collect();
    let dense_normalized = min_max_normalize(&dense);
    let keyword_normalized = min_max_normalize(&keyword);

    let results = candidates
        .into_iter()
        .zip(dense_normalized.into_iter().zip(keyword_normalized))
        .map(|(candidate, (d, kw))| SearchResult {
            score: (dense_weight * d + keyword_weight * kw).clamp(0.0, 1.0),
            dense_score: candidate.dense_score,
            keyword_score: kw,
            metadata: candidate.metadata,
        })
        .collect();

    rank(results, k)
}

/// Sort results best-first and keep at most `k`
#[inline]
pub fn rank(mut results: Vec<SearchResult>, k: usize) -> Vec<SearchResult> {
    results.sort_by(compare_results);
    results.truncate(k);
    results
}

/// Descending score, then descending dense score, then ascending source and offset
#[inline]
pub fn compare_results(a: &SearchResult, b: &SearchResult) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.dense_score.total_cmp(&a.dense_score))
        .then_with(|| a.metadata.source_uri.cmp(&b.metadata.source_uri))
        .then_with(|| a.metadata.char_offset.cmp(&b.metadata.char_offset))
}
