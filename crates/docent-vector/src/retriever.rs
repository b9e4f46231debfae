//! Brute-force cosine similarity ranking over a session's embedding cache.
//!
//! Every query scans all chunks. Per-session chunk counts are in the tens, so
//! no index structure is built or maintained.

use std::cmp::Ordering;

use docent_core::types::Chunk;

use crate::cache::EmbeddingCache;

/// Default number of chunks returned by [`retrieve`].
pub const DEFAULT_TOP_K: usize = 4;

/// Guards the cosine denominator against zero-magnitude vectors.
const EPSILON: f64 = 1e-9;

/// A chunk together with its similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f64,
}

/// Compute cosine similarity between two vectors.
///
/// Returns 0.0 if the vectors differ in length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum();

    let mag_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();

    dot / (mag_a * mag_b + EPSILON)
}

/// Score every chunk in `cache` against `query` and return the best `k`.
///
/// Sorted by descending score; equal scores keep ascending chunk index.
/// `k` is clamped to the number of cached chunks.
pub fn rank(query: &[f32], cache: &EmbeddingCache, k: usize) -> Vec<ScoredChunk> {
    let mut scored: Vec<ScoredChunk> = cache
        .entries()
        .iter()
        .map(|(chunk, embedding)| ScoredChunk {
            chunk: chunk.clone(),
            score: cosine_similarity(query, &embedding.vector),
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk.index.cmp(&b.chunk.index))
    });
    scored.truncate(k);
    scored
}

/// Return the `k` chunks most similar to `query`, best first.
pub fn retrieve(query: &[f32], cache: &EmbeddingCache, k: usize) -> Vec<Chunk> {
    rank(query, cache, k).into_iter().map(|s| s.chunk).collect()
}
