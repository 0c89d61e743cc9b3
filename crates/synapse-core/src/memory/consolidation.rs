//! Merging near-duplicate items into one canonical item.
//!
//! Items are only compared within the same tenant and session scope; two
//! items from different sessions are never merged unless both are
//! session-independent. Clusters are the connected components of the
//! "similarity above threshold" relation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use synapse_state::{MemoryItem, MemoryItemId, TenantId};

use crate::memory::ranking::item_similarity;

/// One merge: `merged` replaces itself and every item in `absorbed`.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub merged: MemoryItem,
    pub absorbed: Vec<MemoryItemId>,
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[rb.max(ra)] = ra.min(rb);
        }
    }
}

/// Find clusters of similar items and describe how to merge each one.
pub fn plan_merges(items: &[MemoryItem], threshold: f64) -> Vec<MergePlan> {
    let mut scopes: BTreeMap<(TenantId, Option<String>), Vec<&MemoryItem>> = BTreeMap::new();
    for item in items {
        scopes
            .entry((item.tenant_id().clone(), item.session_id.clone()))
            .or_default()
            .push(item);
    }

    let mut plans = Vec::new();
    for group in scopes.values() {
        let mut uf = UnionFind::new(group.len());
        for i in 0..group.len() {
            for j in (i + 1)..group.len() {
                if item_similarity(group[i], group[j]) > threshold {
                    uf.union(i, j);
                }
            }
        }

        let mut clusters: HashMap<usize, Vec<&MemoryItem>> = HashMap::new();
        for (idx, item) in group.iter().enumerate() {
            clusters.entry(uf.find(idx)).or_default().push(item);
        }

        let mut roots: Vec<usize> = clusters.keys().copied().collect();
        roots.sort_unstable();
        for root in roots {
            if let Some(cluster) = clusters.remove(&root) {
                if cluster.len() > 1 {
                    plans.push(merge_cluster(&cluster));
                }
            }
        }
    }
    plans
}

/// Merge a cluster into its canonical item (most accessed, then oldest).
///
/// Confidence is the access-count-weighted mean of the inputs (plain mean
/// when none has been accessed); sources and entities are unioned; access
/// counts are summed.
pub fn merge_cluster(cluster: &[&MemoryItem]) -> MergePlan {
    let canonical = cluster
        .iter()
        .copied()
        .max_by(|a, b| {
            a.access_count
                .cmp(&b.access_count)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| b.id.cmp(&a.id))
        })
        .unwrap_or(cluster[0]);

    let total_access: u64 = cluster.iter().map(|i| i.access_count).sum();
    let confidence = if total_access == 0 {
        cluster.iter().map(|i| i.confidence).sum::<f64>() / cluster.len() as f64
    } else {
        cluster
            .iter()
            .map(|i| i.confidence * i.access_count as f64)
            .sum::<f64>()
            / total_access as f64
    };

    let mut merged = canonical.clone();
    merged.confidence = confidence.clamp(0.0, 1.0);
    merged.access_count = total_access;

    let mut entities: BTreeSet<String> = BTreeSet::new();
    for item in cluster {
        merged
            .source_attribution
            .extend(item.source_attribution.iter().cloned());
        entities.extend(item.entities.iter().cloned());
        merged.decay_score = merged.decay_score.max(item.decay_score);
        merged.created_at = merged.created_at.min(item.created_at);
        merged.last_accessed_at = merged.last_accessed_at.max(item.last_accessed_at);
        let anchor = item.decayed_at.unwrap_or(item.created_at).max(item.created_at);
        merged.decayed_at = Some(merged.decayed_at.map_or(anchor, |d| d.max(anchor)));
    }
    merged.entities = entities.into_iter().collect();

    let absorbed = cluster
        .iter()
        .filter(|i| i.id != canonical.id)
        .map(|i| i.id.clone())
        .collect();

    MergePlan { merged, absorbed }
}
