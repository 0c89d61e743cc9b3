//! Scheduled decay, expiry and consolidation over every tier.
//!
//! A pass walks tenant partitions one at a time; within a tenant each tier
//! is paged through in full, decayed, expired items are deleted, and the
//! semantic and knowledge-graph tiers are then consolidated. Decay writes
//! only the score, so a concurrent read or delete is never overwritten.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use synapse_state::{DeleteTarget, MemoryBackend, MemoryItem, MemoryTier, ScanCursor, TenantId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::DecayConfig;
use crate::memory::consolidation::plan_merges;
use crate::memory::decay::{apply_decay, DecayOutcome};
use crate::memory::tiers::MemoryTiers;
use crate::metrics::METRICS;
use crate::obs;

/// Outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecayReport {
    pub tenants_processed: usize,
    pub items_scanned: usize,
    pub items_decayed: usize,
    pub items_expired: usize,
    /// Items absorbed into a canonical item.
    pub items_consolidated: usize,
    pub clusters_merged: usize,
    pub errors: usize,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl DecayReport {
    /// Number of items written or deleted by the pass.
    pub fn changes(&self) -> usize {
        self.items_decayed + self.items_expired + self.items_consolidated + self.clusters_merged
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Periodic decay & consolidation job.
pub struct DecayJob {
    tiers: MemoryTiers,
    config: DecayConfig,
}

impl DecayJob {
    pub fn new(tiers: MemoryTiers, config: DecayConfig) -> Self {
        Self { tiers, config }
    }

    pub async fn run_once(&self) -> DecayReport {
        self.run_once_at(Utc::now()).await
    }

    /// Run one pass as of `now`.
    #[instrument(skip(self))]
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> DecayReport {
        let started = Instant::now();
        let mut report = DecayReport::default();

        let mut tenants: BTreeSet<TenantId> = BTreeSet::new();
        for (tier, backend) in self.tiers.iter() {
            match backend.tenants().await {
                Ok(found) => tenants.extend(found),
                Err(e) => {
                    warn!(tier = %tier, error = %e, "failed to list tenants");
                    report.errors += 1;
                }
            }
        }

        for tenant in &tenants {
            for (tier, backend) in self.tiers.iter() {
                self.process_partition(tenant, tier, backend, now, &mut report)
                    .await;
            }
            report.tenants_processed += 1;
        }

        report.duration = started.elapsed();
        METRICS.inc_decay_passes();
        obs::emit_decay_pass_finished(&report);
        report
    }

    /// Run a pass every `interval` until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.config.interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("decay job cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        let report = self.run_once().await;
                        debug!(changes = report.changes(), "decay tick complete");
                    }
                }
            }
        })
    }

    /// Walk one tenant's partition of `tier` page by page, oldest first.
    async fn process_partition(
        &self,
        tenant: &TenantId,
        tier: MemoryTier,
        backend: &Arc<dyn MemoryBackend>,
        now: DateTime<Utc>,
        report: &mut DecayReport,
    ) {
        let page_size = self.config.scan_limit.max(1);
        let consolidates = matches!(tier, MemoryTier::Semantic | MemoryTier::KnowledgeGraph);
        let mut survivors: Vec<MemoryItem> = Vec::new();
        let mut cursor: Option<ScanCursor> = None;

        loop {
            let page = match backend.scan(tenant, cursor.as_ref(), page_size).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(tenant_id = %tenant, tier = %tier, error = %e, "decay scan failed");
                    report.errors += 1;
                    return;
                }
            };
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(ScanCursor::after(last));
            let full = page.len() >= page_size;

            for item in page {
                if let Some(kept) = self.decay_item(tenant, tier, item, backend, now, report).await {
                    if consolidates {
                        survivors.push(kept);
                    }
                }
            }
            if !full {
                break;
            }
        }

        if consolidates {
            self.consolidate(tenant, backend, &survivors, report).await;
        }
    }

    /// Decay or expire one item; returns it when it is still stored.
    async fn decay_item(
        &self,
        tenant: &TenantId,
        tier: MemoryTier,
        item: MemoryItem,
        backend: &Arc<dyn MemoryBackend>,
        now: DateTime<Utc>,
        report: &mut DecayReport,
    ) -> Option<MemoryItem> {
        // Partitions are only ever touched under their own tenant.
        if !item.belongs_to(tenant) || item.tier != tier {
            METRICS.inc_items_discarded();
            return None;
        }
        report.items_scanned += 1;
        match apply_decay(&item, self.config.policy(tier), now) {
            DecayOutcome::Unchanged => Some(item),
            DecayOutcome::Decayed(decayed) => {
                let written = backend
                    .set_decay(tenant, &decayed.id, decayed.decay_score, now)
                    .await;
                match written {
                    Ok(true) => {
                        report.items_decayed += 1;
                        Some(decayed)
                    }
                    // Deleted since the page was read.
                    Ok(false) => None,
                    Err(e) => {
                        warn!(item_id = %item.id, error = %e, "failed to write decayed item");
                        report.errors += 1;
                        Some(item)
                    }
                }
            }
            DecayOutcome::Expired => {
                if self.delete(tenant, &item, backend, report).await {
                    report.items_expired += 1;
                    METRICS.inc_items_expired();
                    None
                } else {
                    Some(item)
                }
            }
        }
    }

    async fn consolidate(
        &self,
        tenant: &TenantId,
        backend: &Arc<dyn MemoryBackend>,
        items: &[MemoryItem],
        report: &mut DecayReport,
    ) {
        for plan in plan_merges(items, self.config.consolidation_threshold) {
            if let Err(e) = backend.put(plan.merged.clone()).await {
                warn!(item_id = %plan.merged.id, error = %e, "failed to write merged item");
                report.errors += 1;
                continue;
            }
            report.clusters_merged += 1;
            for id in &plan.absorbed {
                let target = DeleteTarget::Id {
                    tenant_id: tenant.clone(),
                    id: id.clone(),
                };
                match backend.delete(&target).await {
                    Ok(_) => {
                        report.items_consolidated += 1;
                        METRICS.inc_items_consolidated();
                    }
                    Err(e) => {
                        warn!(item_id = %id, error = %e, "failed to delete absorbed item");
                        report.errors += 1;
                    }
                }
            }
        }
    }

    async fn delete(
        &self,
        tenant: &TenantId,
        item: &MemoryItem,
        backend: &Arc<dyn MemoryBackend>,
        report: &mut DecayReport,
    ) -> bool {
        let target = DeleteTarget::Id {
            tenant_id: tenant.clone(),
            id: item.id.clone(),
        };
        match backend.delete(&target).await {
            Ok(_) => true,
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "failed to delete expired item");
                report.errors += 1;
                false
            }
        }
    }
}

impl std::fmt::Debug for DecayJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecayJob")
            .field("tiers", &self.tiers)
            .field("interval_secs", &self.config.interval_secs)
            .finish()
    }
}
