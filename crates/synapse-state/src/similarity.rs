//! Similarity measures shared by the backends and the core ranker.

use std::collections::HashSet;

use crate::storage_traits::{MemoryFilter, MemoryItem};

/// Lowercased alphanumeric words of at least two characters.
pub fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 2)
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard similarity of two keyword sets; 0 when either is empty.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

/// Cosine similarity; 0 for mismatched lengths or zero vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum();
    let norm_a: f64 = a.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Keywords of an item's content plus its entity names.
pub fn item_keywords(item: &MemoryItem) -> HashSet<String> {
    let mut words = keywords(&item.content);
    words.extend(item.entities.iter().map(|e| e.to_lowercase()));
    words
}

/// Scores items against the ranking hints of a [`MemoryFilter`].
///
/// Cosine similarity when both the filter and the item carry an embedding,
/// keyword Jaccard over text and entities otherwise.
pub struct HintScorer<'a> {
    embedding: Option<&'a [f32]>,
    words: HashSet<String>,
}

impl<'a> HintScorer<'a> {
    /// `None` when the filter carries no ranking hints.
    pub fn for_filter(filter: &'a MemoryFilter) -> Option<Self> {
        let mut words = filter.text.as_deref().map(keywords).unwrap_or_default();
        words.extend(filter.entities.iter().map(|e| e.to_lowercase()));
        let embedding = filter.embedding.as_deref();
        if embedding.is_none() && words.is_empty() {
            return None;
        }
        Some(Self { embedding, words })
    }

    pub fn score(&self, item: &MemoryItem) -> f64 {
        let raw = match (self.embedding, item.embedding.as_deref()) {
            (Some(query), Some(stored)) => cosine(query, stored),
            _ => jaccard(&self.words, &item_keywords(item)),
        };
        if raw.is_finite() {
            raw
        } else {
            0.0
        }
    }
}

/// Order `items` best match first (newest first on ties, or newest first
/// outright when the filter has no hints) and keep at most `limit`.
pub fn rank_by_hints(filter: &MemoryFilter, items: Vec<MemoryItem>, limit: usize) -> Vec<MemoryItem> {
    let scorer = HintScorer::for_filter(filter);
    let mut scored: Vec<(f64, MemoryItem)> = items
        .into_iter()
        .map(|item| {
            let score = scorer.as_ref().map_or(0.0, |s| s.score(&item));
            (score, item)
        })
        .collect();
    // Stable, so callers' tie order (e.g. write order) survives.
    scored.sort_by(|(sa, a), (sb, b)| {
        sb.total_cmp(sa)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
    scored.truncate(limit);
    scored.into_iter().map(|(_, item)| item).collect()
}
