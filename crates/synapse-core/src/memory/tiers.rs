//! The set of tier backends shared by the router and the decay job.

use std::collections::BTreeMap;
use std::sync::Arc;

use synapse_state::fakes::InMemoryBackend;
use synapse_state::{MemoryBackend, MemoryTier};

/// One backend per configured tier. Tiers without a backend are skipped by
/// reads and rejected by writes.
#[derive(Clone, Default)]
pub struct MemoryTiers {
    backends: BTreeMap<MemoryTier, Arc<dyn MemoryBackend>>,
}

impl MemoryTiers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` under the tier it reports. Replaces any previous one.
    pub fn with_backend(mut self, backend: Arc<dyn MemoryBackend>) -> Self {
        self.backends.insert(backend.tier(), backend);
        self
    }

    /// All five tiers backed by [`InMemoryBackend`].
    pub fn in_memory() -> Self {
        MemoryTier::ALL.into_iter().fold(Self::new(), |tiers, tier| {
            tiers.with_backend(Arc::new(InMemoryBackend::new(tier)))
        })
    }

    pub fn get(&self, tier: MemoryTier) -> Option<&Arc<dyn MemoryBackend>> {
        self.backends.get(&tier)
    }

    pub fn tiers(&self) -> impl Iterator<Item = MemoryTier> + '_ {
        self.backends.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MemoryTier, &Arc<dyn MemoryBackend>)> {
        self.backends.iter().map(|(tier, backend)| (*tier, backend))
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl std::fmt::Debug for MemoryTiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.backends.keys()).finish()
    }
}
