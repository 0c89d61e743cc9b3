//! In-memory fakes for the storage traits (testing and local runs)
//!
//! [`InMemoryBackend`] satisfies the [`MemoryBackend`] contract without any
//! external dependencies, and can be told to misbehave: ignore the tenant
//! filter ([`InMemoryBackend::leaky`]) or fail the next few calls
//! ([`InMemoryBackend::fail_next`]).

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::similarity::rank_by_hints;
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct State {
    /// `(tenant, id)` -> `(write sequence, item)`
    rows: HashMap<(TenantId, MemoryItemId), (u64, MemoryItem)>,
    next_seq: u64,
    pending_faults: u32,
    faults_transient: bool,
}

/// In-memory backend for a single tier.
#[derive(Debug)]
pub struct InMemoryBackend {
    tier: MemoryTier,
    leaky: bool,
    state: Mutex<State>,
}

impl InMemoryBackend {
    pub fn new(tier: MemoryTier) -> Self {
        InMemoryBackend {
            tier,
            leaky: false,
            state: Mutex::new(State::default()),
        }
    }

    /// A backend that ignores the tenant filter on `query` and `scan`,
    /// returning every row. Used to exercise the read-side tenant checks.
    pub fn leaky(tier: MemoryTier) -> Self {
        InMemoryBackend {
            leaky: true,
            ..Self::new(tier)
        }
    }

    /// Make the next `n` calls fail. Transient faults report
    /// [`StorageError::Transient`]; otherwise [`StorageError::Backend`].
    pub fn fail_next(&self, n: u32, transient: bool) {
        let mut state = self.lock();
        state.pending_faults = n;
        state.faults_transient = transient;
    }

    /// Plant a row as-is, bypassing tier and validation checks.
    pub fn seed_unchecked(&self, item: MemoryItem) {
        let mut state = self.lock();
        state.next_seq += 1;
        let seq = state.next_seq;
        let key = (item.tenant_id().clone(), item.id.clone());
        state.rows.insert(key, (seq, item));
    }

    /// Every stored row, in write order.
    pub fn snapshot(&self) -> Vec<MemoryItem> {
        let state = self.lock();
        let mut rows: Vec<_> = state.rows.values().cloned().collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, item)| item).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_fault(state: &mut State, tier: MemoryTier) -> StorageResult<()> {
        if state.pending_faults == 0 {
            return Ok(());
        }
        state.pending_faults -= 1;
        let msg = format!("injected fault on {tier} backend");
        if state.faults_transient {
            Err(StorageError::Transient(msg))
        } else {
            Err(StorageError::Backend(msg))
        }
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    fn tier(&self) -> MemoryTier {
        self.tier
    }

    async fn put(&self, item: MemoryItem) -> StorageResult<()> {
        if item.tier != self.tier {
            return Err(StorageError::TierMismatch {
                expected: self.tier,
                actual: item.tier,
            });
        }
        item.validate()
            .map_err(|reason| StorageError::InvalidItem {
                id: item.id.to_string(),
                reason,
            })?;

        let mut state = self.lock();
        Self::take_fault(&mut state, self.tier)?;

        let key = (item.tenant_id().clone(), item.id.clone());
        // Upserts keep their original write position.
        let seq = match state.rows.get(&key) {
            Some((seq, _)) => *seq,
            None => {
                state.next_seq += 1;
                state.next_seq
            }
        };
        state.rows.insert(key, (seq, item));
        Ok(())
    }

    async fn query(&self, filter: &MemoryFilter, limit: usize) -> StorageResult<Vec<MemoryItem>> {
        let mut state = self.lock();
        Self::take_fault(&mut state, self.tier)?;

        let mut hits: Vec<(u64, MemoryItem)> = state
            .rows
            .values()
            .filter(|(_, item)| {
                if self.leaky {
                    true
                } else {
                    filter.matches(item)
                }
            })
            .cloned()
            .collect();

        hits.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| seq_b.cmp(seq_a))
        });
        let hits = hits.into_iter().map(|(_, item)| item).collect();
        Ok(rank_by_hints(filter, hits, limit))
    }

    async fn record_access(
        &self,
        tenant: &TenantId,
        id: &MemoryItemId,
        at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut state = self.lock();
        Self::take_fault(&mut state, self.tier)?;

        let key = (tenant.clone(), id.clone());
        Ok(match state.rows.get_mut(&key) {
            Some((_, item)) => {
                item.access_count = item.access_count.saturating_add(1);
                item.last_accessed_at = item.last_accessed_at.max(at);
                true
            }
            None => false,
        })
    }

    async fn set_decay(
        &self,
        tenant: &TenantId,
        id: &MemoryItemId,
        decay_score: f64,
        decayed_at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut state = self.lock();
        Self::take_fault(&mut state, self.tier)?;

        let key = (tenant.clone(), id.clone());
        Ok(match state.rows.get_mut(&key) {
            Some((_, item)) => {
                item.decay_score = decay_score;
                item.decayed_at = Some(decayed_at);
                true
            }
            None => false,
        })
    }

    async fn scan(
        &self,
        tenant: &TenantId,
        after: Option<&ScanCursor>,
        limit: usize,
    ) -> StorageResult<Vec<MemoryItem>> {
        let mut state = self.lock();
        Self::take_fault(&mut state, self.tier)?;

        let mut page: Vec<MemoryItem> = state
            .rows
            .values()
            .map(|(_, item)| item)
            .filter(|item| self.leaky || item.belongs_to(tenant))
            .filter(|item| after.map_or(true, |cursor| cursor.precedes(item)))
            .cloned()
            .collect();
        page.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        page.truncate(limit);
        Ok(page)
    }

    async fn delete(&self, target: &DeleteTarget) -> StorageResult<usize> {
        let mut state = self.lock();
        Self::take_fault(&mut state, self.tier)?;

        match target {
            DeleteTarget::Id { tenant_id, id } => {
                let key = (tenant_id.clone(), id.clone());
                Ok(usize::from(state.rows.remove(&key).is_some()))
            }
            DeleteTarget::Filter(filter) => {
                let before = state.rows.len();
                state.rows.retain(|_, (_, item)| !filter.matches(item));
                Ok(before - state.rows.len())
            }
        }
    }

    async fn tenants(&self) -> StorageResult<Vec<TenantId>> {
        let mut state = self.lock();
        Self::take_fault(&mut state, self.tier)?;

        let mut tenants: Vec<TenantId> = state
            .rows
            .keys()
            .map(|(tenant, _)| tenant.clone())
            .collect();
        tenants.sort();
        tenants.dedup();
        Ok(tenants)
    }
}
