//! Relevance scoring and token-budgeted packing of retrieved items.
//!
//! Combined score = `relevance * decay_score * confidence`, where relevance
//! depends on the tier:
//!
//! | tier            | relevance                                              |
//! |-----------------|--------------------------------------------------------|
//! | ephemeral       | 1.0                                                    |
//! | episodic        | `exp(-age / recency_half_life)`                        |
//! | semantic        | cosine similarity, keyword Jaccard without embeddings  |
//! | knowledge graph | `1 / (1 + hops)` from the query entities, 0 if unreachable |
//! | procedural      | keyword Jaccard                                        |

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use synapse_state::{MemoryItem, MemoryTier};

use super::router::MemoryQuery;

pub use synapse_state::similarity::{cosine, jaccard, keywords};
use synapse_state::similarity::item_keywords;

/// Similarity of two stored items: cosine when both carry embeddings,
/// keyword Jaccard over the content otherwise.
pub fn item_similarity(a: &MemoryItem, b: &MemoryItem) -> f64 {
    match (&a.embedding, &b.embedding) {
        (Some(ea), Some(eb)) => cosine(ea, eb),
        _ => jaccard(&keywords(&a.content), &keywords(&b.content)),
    }
}

/// Token cost of a piece of text: `ceil(chars / chars_per_token)`, at least 1.
pub fn estimate_tokens(text: &str, chars_per_token: usize) -> usize {
    let chars = text.chars().count();
    chars.div_ceil(chars_per_token.max(1)).max(1)
}

/// Hop distances from the query entities over the edges of the returned
/// knowledge-graph items. Each item links every pair of its entities.
#[derive(Debug, Default)]
pub struct GraphDistances {
    hops: HashMap<String, usize>,
}

impl GraphDistances {
    pub fn build(edges: &[MemoryItem], sources: &HashSet<String>) -> Self {
        let mut adjacency: HashMap<String, HashSet<String>> = HashMap::new();
        for item in edges {
            let nodes: Vec<String> = item.entities.iter().map(|e| e.to_lowercase()).collect();
            for node in &nodes {
                let neighbours = adjacency.entry(node.clone()).or_default();
                neighbours.extend(nodes.iter().filter(|n| *n != node).cloned());
            }
        }

        let mut hops = HashMap::new();
        let mut queue = VecDeque::new();
        for source in sources {
            if adjacency.contains_key(source) && hops.insert(source.clone(), 0).is_none() {
                queue.push_back(source.clone());
            }
        }
        while let Some(node) = queue.pop_front() {
            let depth = hops.get(&node).copied().unwrap_or(0);
            if let Some(neighbours) = adjacency.get(&node) {
                for next in neighbours {
                    if !hops.contains_key(next) {
                        hops.insert(next.clone(), depth + 1);
                        queue.push_back(next.clone());
                    }
                }
            }
        }
        Self { hops }
    }

    /// Fewest hops from any query entity to any endpoint of `item`.
    pub fn hops_to(&self, item: &MemoryItem) -> Option<usize> {
        item.entities
            .iter()
            .filter_map(|e| self.hops.get(&e.to_lowercase()).copied())
            .min()
    }
}

/// Query-side inputs shared by every item of one retrieval.
pub struct RelevanceInputs<'a> {
    pub query: &'a MemoryQuery,
    pub query_keywords: HashSet<String>,
    pub graph: GraphDistances,
    pub recency_half_life_secs: f64,
    pub now: DateTime<Utc>,
}

impl<'a> RelevanceInputs<'a> {
    pub fn new(
        query: &'a MemoryQuery,
        graph_items: &[MemoryItem],
        recency_half_life_secs: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let mut query_keywords = keywords(&query.text);
        query_keywords.extend(query.entities.iter().map(|e| e.to_lowercase()));
        let graph = GraphDistances::build(graph_items, &query_keywords);
        Self {
            query,
            query_keywords,
            graph,
            recency_half_life_secs: recency_half_life_secs.max(1) as f64,
            now,
        }
    }

    /// Tier-appropriate relevance of `item`, clamped to `[0,1]`.
    pub fn relevance(&self, item: &MemoryItem) -> f64 {
        let raw = match item.tier {
            MemoryTier::Ephemeral => 1.0,
            MemoryTier::Episodic => {
                let age = (self.now - item.created_at).num_milliseconds().max(0) as f64 / 1_000.0;
                (-age / self.recency_half_life_secs).exp()
            }
            MemoryTier::Semantic => match (&self.query.embedding, &item.embedding) {
                (Some(q), Some(e)) => cosine(q, e),
                _ => self.keyword_overlap(item),
            },
            MemoryTier::KnowledgeGraph => match self.graph.hops_to(item) {
                Some(hops) => 1.0 / (1.0 + hops as f64),
                None => 0.0,
            },
            MemoryTier::Procedural => self.keyword_overlap(item),
        };
        if raw.is_finite() {
            raw.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    fn keyword_overlap(&self, item: &MemoryItem) -> f64 {
        jaccard(&self.query_keywords, &item_keywords(item))
    }
}

/// One item selected into a [`RankedContext`].
#[derive(Debug, Clone, Serialize)]
pub struct RankedItem {
    pub item: MemoryItem,
    pub relevance: f64,
    pub score: f64,
    pub tokens: usize,
}

/// Query-scoped, score-ordered context; discarded after prompt assembly.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RankedContext {
    pub items: Vec<RankedItem>,
    pub total_tokens: usize,
    pub token_budget: usize,
    /// Candidates left out once the budget was reached.
    pub dropped: usize,
    /// Tiers that failed or timed out and were treated as empty.
    pub degraded_tiers: Vec<MemoryTier>,
}

impl RankedContext {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Render as prompt lines, highest score first.
    pub fn render(&self) -> String {
        self.items
            .iter()
            .map(|r| format!("- [{}] {}", r.item.tier, r.item.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Sort by score (newest first on ties) and pack greedily: items are added
/// until the next one would exceed `token_budget`, then packing stops.
pub fn pack(mut candidates: Vec<RankedItem>, token_budget: usize) -> RankedContext {
    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.item.created_at.cmp(&a.item.created_at))
    });

    let mut context = RankedContext {
        token_budget,
        ..RankedContext::default()
    };
    let total = candidates.len();
    for candidate in candidates {
        if context.total_tokens + candidate.tokens > token_budget {
            break;
        }
        context.total_tokens += candidate.tokens;
        context.items.push(candidate);
    }
    context.dropped = total - context.items.len();
    context
}
