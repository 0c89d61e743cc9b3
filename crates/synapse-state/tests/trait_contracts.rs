//! Contract tests for MemoryBackend.
//!
//! Each contract is a plain async fn over `&dyn MemoryBackend` and is run
//! against both the in-memory fake and the SurrealDB adapter (`mem://`).

use std::time::Duration;

use chrono::Utc;
use synapse_state::fakes::InMemoryBackend;
use synapse_state::*;

fn acme() -> TenantId {
    TenantId::new("acme")
}

fn globex() -> TenantId {
    TenantId::new("globex")
}

async fn surreal(tier: MemoryTier) -> SurrealMemoryBackend {
    SurrealMemoryBackend::in_memory(tier).await.unwrap()
}

// ===========================================================================
// Contracts
// ===========================================================================

async fn contract_query_is_tenant_scoped(backend: &dyn MemoryBackend) {
    let tier = backend.tier();
    backend
        .put(MemoryItem::new(tier, acme(), "acme fact"))
        .await
        .unwrap();
    backend
        .put(MemoryItem::new(tier, globex(), "globex fact"))
        .await
        .unwrap();

    let hits = backend
        .query(&MemoryFilter::tenant(acme()), 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].content, "acme fact");
    assert!(hits.iter().all(|i| i.belongs_to(&acme())));
}

async fn contract_put_is_upsert(backend: &dyn MemoryBackend) {
    let tier = backend.tier();
    let mut item = MemoryItem::new(tier, acme(), "v1");
    backend.put(item.clone()).await.unwrap();

    item.content = "v2".to_string();
    item.access_count = 3;
    backend.put(item.clone()).await.unwrap();

    let hits = backend
        .query(&MemoryFilter::tenant(acme()), 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].content, "v2");
    assert_eq!(hits[0].access_count, 3);
}

async fn contract_newest_first_and_limit(backend: &dyn MemoryBackend) {
    let tier = backend.tier();
    let base = Utc::now() - chrono::Duration::minutes(10);
    for n in 0..5 {
        let item = MemoryItem::new(tier, acme(), format!("turn {n}"))
            .with_session("s1")
            .created_at(base + chrono::Duration::seconds(n));
        backend.put(item).await.unwrap();
    }

    let hits = backend
        .query(&MemoryFilter::tenant(acme()).with_session("s1"), 3)
        .await
        .unwrap();
    let contents: Vec<_> = hits.iter().map(|i| i.content.as_str()).collect();
    assert_eq!(contents, vec!["turn 4", "turn 3", "turn 2"]);
}

async fn contract_session_and_window_filters(backend: &dyn MemoryBackend) {
    let tier = backend.tier();
    let now = Utc::now();
    backend
        .put(
            MemoryItem::new(tier, acme(), "old")
                .with_session("s1")
                .created_at(now - chrono::Duration::days(2)),
        )
        .await
        .unwrap();
    backend
        .put(MemoryItem::new(tier, acme(), "recent").with_session("s1").created_at(now))
        .await
        .unwrap();
    backend
        .put(MemoryItem::new(tier, acme(), "other session").with_session("s2"))
        .await
        .unwrap();

    let filter = MemoryFilter::tenant(acme())
        .with_session("s1")
        .after(now - chrono::Duration::hours(1));
    let hits = backend.query(&filter, 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].content, "recent");
}

async fn contract_delete_counts_and_respects_tenant(backend: &dyn MemoryBackend) {
    let tier = backend.tier();
    let mine = MemoryItem::new(tier, acme(), "mine").with_session("s1");
    let theirs = MemoryItem::new(tier, globex(), "theirs").with_session("s1");
    backend.put(mine.clone()).await.unwrap();
    backend.put(theirs.clone()).await.unwrap();

    // Deleting another tenant's id through our tenant removes nothing.
    let removed = backend
        .delete(&DeleteTarget::Id {
            tenant_id: acme(),
            id: theirs.id.clone(),
        })
        .await
        .unwrap();
    assert_eq!(removed, 0);

    let removed = backend
        .delete(&DeleteTarget::Filter(
            MemoryFilter::tenant(acme()).with_session("s1"),
        ))
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let left = backend
        .query(&MemoryFilter::tenant(globex()), 10)
        .await
        .unwrap();
    assert_eq!(left.len(), 1);
}

async fn contract_tenants_lists_partitions(backend: &dyn MemoryBackend) {
    let tier = backend.tier();
    backend.put(MemoryItem::new(tier, globex(), "g")).await.unwrap();
    backend.put(MemoryItem::new(tier, acme(), "a1")).await.unwrap();
    backend.put(MemoryItem::new(tier, acme(), "a2")).await.unwrap();

    assert_eq!(backend.tenants().await.unwrap(), vec![acme(), globex()]);
}

async fn contract_rejects_wrong_tier(backend: &dyn MemoryBackend) {
    let other = if backend.tier() == MemoryTier::Semantic {
        MemoryTier::Episodic
    } else {
        MemoryTier::Semantic
    };
    let err = backend
        .put(MemoryItem::new(other, acme(), "misrouted"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::TierMismatch { .. }));
}

async fn contract_updates_never_resurrect(backend: &dyn MemoryBackend) {
    let tier = backend.tier();
    let item = MemoryItem::new(tier, acme(), "read me");
    backend.put(item.clone()).await.unwrap();

    let later = item.created_at + chrono::Duration::minutes(5);
    assert!(backend.record_access(&acme(), &item.id, later).await.unwrap());
    assert!(backend.set_decay(&acme(), &item.id, 0.5, later).await.unwrap());
    // Another tenant cannot touch it.
    assert!(!backend.record_access(&globex(), &item.id, later).await.unwrap());

    let hits = backend.query(&MemoryFilter::tenant(acme()), 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].access_count, 1);
    assert_eq!(hits[0].decay_score, 0.5);
    assert!(hits[0].decayed_at.is_some());

    let removed = backend
        .delete(&DeleteTarget::Id {
            tenant_id: acme(),
            id: item.id.clone(),
        })
        .await
        .unwrap();
    assert_eq!(removed, 1);

    assert!(!backend.record_access(&acme(), &item.id, later).await.unwrap());
    assert!(!backend.set_decay(&acme(), &item.id, 0.1, later).await.unwrap());
    assert!(backend.query(&MemoryFilter::tenant(acme()), 10).await.unwrap().is_empty());
    assert!(backend.tenants().await.unwrap().is_empty());
}

async fn contract_scan_pages_the_whole_partition(backend: &dyn MemoryBackend) {
    let tier = backend.tier();
    let base = Utc::now() - chrono::Duration::hours(1);
    for n in 0..7 {
        // Pairs share a timestamp so the id breaks ties.
        let item = MemoryItem::new(tier, acme(), format!("item {n}"))
            .created_at(base + chrono::Duration::seconds(n / 2));
        backend.put(item).await.unwrap();
    }
    backend.put(MemoryItem::new(tier, globex(), "foreign")).await.unwrap();

    let mut seen: Vec<MemoryItem> = Vec::new();
    let mut cursor: Option<ScanCursor> = None;
    loop {
        let page = backend.scan(&acme(), cursor.as_ref(), 3).await.unwrap();
        assert!(page.len() <= 3);
        let Some(last) = page.last() else {
            break;
        };
        cursor = Some(ScanCursor::after(last));
        seen.extend(page);
    }

    assert_eq!(seen.len(), 7);
    assert!(seen.iter().all(|i| i.belongs_to(&acme())));
    assert!(seen
        .windows(2)
        .all(|w| (w[0].created_at, &w[0].id) < (w[1].created_at, &w[1].id)));
}

async fn contract_hints_rank_old_matches_first(backend: &dyn MemoryBackend) {
    let tier = backend.tier();
    let now = Utc::now();
    backend
        .put(
            MemoryItem::new(tier, acme(), "the api rate limit is 100 rps")
                .with_embedding(vec![1.0, 0.0])
                .created_at(now - chrono::Duration::days(30)),
        )
        .await
        .unwrap();
    for n in 0..10 {
        backend
            .put(
                MemoryItem::new(tier, acme(), format!("lunch menu for day {n}"))
                    .with_embedding(vec![0.0, 1.0])
                    .created_at(now - chrono::Duration::minutes(n)),
            )
            .await
            .unwrap();
    }

    let by_text = backend
        .query(&MemoryFilter::tenant(acme()).with_text("api rate limit"), 3)
        .await
        .unwrap();
    assert_eq!(by_text.len(), 3);
    assert_eq!(by_text[0].content, "the api rate limit is 100 rps");

    let by_vector = backend
        .query(&MemoryFilter::tenant(acme()).with_embedding(vec![0.9, 0.1]), 1)
        .await
        .unwrap();
    assert_eq!(by_vector[0].content, "the api rate limit is 100 rps");

    // No hints: plain recency.
    let newest = backend.query(&MemoryFilter::tenant(acme()), 1).await.unwrap();
    assert_eq!(newest[0].content, "lunch menu for day 0");
}

// ===========================================================================
// In-memory fake
// ===========================================================================

#[tokio::test]
async fn fake_query_is_tenant_scoped() {
    contract_query_is_tenant_scoped(&InMemoryBackend::new(MemoryTier::Semantic)).await;
}

#[tokio::test]
async fn fake_put_is_upsert() {
    contract_put_is_upsert(&InMemoryBackend::new(MemoryTier::Ephemeral)).await;
}

#[tokio::test]
async fn fake_newest_first_and_limit() {
    contract_newest_first_and_limit(&InMemoryBackend::new(MemoryTier::Episodic)).await;
}

#[tokio::test]
async fn fake_session_and_window_filters() {
    contract_session_and_window_filters(&InMemoryBackend::new(MemoryTier::Episodic)).await;
}

#[tokio::test]
async fn fake_delete_counts_and_respects_tenant() {
    contract_delete_counts_and_respects_tenant(&InMemoryBackend::new(MemoryTier::Ephemeral))
        .await;
}

#[tokio::test]
async fn fake_tenants_lists_partitions() {
    contract_tenants_lists_partitions(&InMemoryBackend::new(MemoryTier::KnowledgeGraph)).await;
}

#[tokio::test]
async fn fake_rejects_wrong_tier() {
    contract_rejects_wrong_tier(&InMemoryBackend::new(MemoryTier::Procedural)).await;
}

#[tokio::test]
async fn fake_updates_never_resurrect() {
    contract_updates_never_resurrect(&InMemoryBackend::new(MemoryTier::Semantic)).await;
}

#[tokio::test]
async fn fake_scan_pages_the_whole_partition() {
    contract_scan_pages_the_whole_partition(&InMemoryBackend::new(MemoryTier::Episodic)).await;
}

#[tokio::test]
async fn fake_hints_rank_old_matches_first() {
    contract_hints_rank_old_matches_first(&InMemoryBackend::new(MemoryTier::Semantic)).await;
}

#[tokio::test]
async fn fake_upsert_keeps_write_position_on_timestamp_ties() {
    let backend = InMemoryBackend::new(MemoryTier::Ephemeral);
    let at = Utc::now();
    let first = MemoryItem::new(MemoryTier::Ephemeral, acme(), "first").created_at(at);
    let second = MemoryItem::new(MemoryTier::Ephemeral, acme(), "second").created_at(at);
    backend.put(first.clone()).await.unwrap();
    backend.put(second).await.unwrap();

    let mut bumped = first;
    bumped.access_count += 1;
    backend.put(bumped).await.unwrap();

    let hits = backend
        .query(&MemoryFilter::tenant(acme()), 10)
        .await
        .unwrap();
    assert_eq!(hits[0].content, "second");
    assert_eq!(hits[1].content, "first");
}

#[tokio::test]
async fn fake_leaky_backend_ignores_tenant_filter() {
    let backend = InMemoryBackend::leaky(MemoryTier::Semantic);
    backend.seed_unchecked(MemoryItem::new(MemoryTier::Semantic, globex(), "foreign"));

    let hits = backend
        .query(&MemoryFilter::tenant(acme()), 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].belongs_to(&globex()));
}

#[tokio::test]
async fn fake_fault_injection_is_consumed() {
    let backend = InMemoryBackend::new(MemoryTier::Semantic);
    backend.fail_next(2, true);

    let filter = MemoryFilter::tenant(acme());
    let first = backend.query(&filter, 1).await.unwrap_err();
    assert!(first.is_transient());
    assert!(backend.query(&filter, 1).await.is_err());
    assert!(backend.query(&filter, 1).await.is_ok());

    backend.fail_next(1, false);
    let err = backend.query(&filter, 1).await.unwrap_err();
    assert!(!err.is_transient());
}

#[tokio::test]
async fn fake_rejects_invalid_items() {
    let backend = InMemoryBackend::new(MemoryTier::Semantic);
    let bad = MemoryItem::new(MemoryTier::Semantic, acme(), "x").with_confidence(2.0);
    let err = backend.put(bad).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidItem { .. }));
    assert!(backend.is_empty());
}

// ===========================================================================
// SurrealDB adapter
// ===========================================================================

#[tokio::test]
async fn surreal_query_is_tenant_scoped() {
    contract_query_is_tenant_scoped(&surreal(MemoryTier::Semantic).await).await;
}

#[tokio::test]
async fn surreal_put_is_upsert() {
    contract_put_is_upsert(&surreal(MemoryTier::Ephemeral).await).await;
}

#[tokio::test]
async fn surreal_newest_first_and_limit() {
    contract_newest_first_and_limit(&surreal(MemoryTier::Episodic).await).await;
}

#[tokio::test]
async fn surreal_session_and_window_filters() {
    contract_session_and_window_filters(&surreal(MemoryTier::Episodic).await).await;
}

#[tokio::test]
async fn surreal_delete_counts_and_respects_tenant() {
    contract_delete_counts_and_respects_tenant(&surreal(MemoryTier::Ephemeral).await).await;
}

#[tokio::test]
async fn surreal_tenants_lists_partitions() {
    contract_tenants_lists_partitions(&surreal(MemoryTier::KnowledgeGraph).await).await;
}

#[tokio::test]
async fn surreal_rejects_wrong_tier() {
    contract_rejects_wrong_tier(&surreal(MemoryTier::Procedural).await).await;
}

#[tokio::test]
async fn surreal_tiers_share_a_table_without_crosstalk() {
    let db = synapse_state::surreal_backend::open("mem://").await.unwrap();
    let backends = SurrealMemoryBackend::all_tiers(&db);
    assert_eq!(backends.len(), 5);

    for backend in &backends {
        backend
            .put(MemoryItem::new(backend.tier(), acme(), backend.tier().as_str()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    for backend in &backends {
        let hits = backend
            .query(&MemoryFilter::tenant(acme()), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tier, backend.tier());
        assert_eq!(hits[0].content, backend.tier().as_str());
    }
}

#[tokio::test]
async fn surreal_updates_never_resurrect() {
    contract_updates_never_resurrect(&surreal(MemoryTier::Semantic).await).await;
}

#[tokio::test]
async fn surreal_scan_pages_the_whole_partition() {
    contract_scan_pages_the_whole_partition(&surreal(MemoryTier::Episodic).await).await;
}

#[tokio::test]
async fn surreal_hints_rank_old_matches_first() {
    contract_hints_rank_old_matches_first(&surreal(MemoryTier::Semantic).await).await;
}

#[tokio::test]
async fn surreal_schema_setup_is_repeatable() {
    let db = synapse_state::surreal_backend::open("mem://").await.unwrap();
    synapse_state::migrations::init_schema(&db).await.unwrap();

    let backend = SurrealMemoryBackend::new(db, MemoryTier::Semantic);
    backend
        .put(MemoryItem::new(MemoryTier::Semantic, acme(), "after re-init"))
        .await
        .unwrap();
    assert_eq!(backend.query(&MemoryFilter::tenant(acme()), 10).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn surreal_upsert_is_never_observed_half_done() {
    let backend = surreal(MemoryTier::Ephemeral).await;
    let mut item = MemoryItem::new(MemoryTier::Ephemeral, acme(), "v0");
    backend.put(item.clone()).await.unwrap();

    let writer = {
        let backend = backend.clone();
        tokio::spawn(async move {
            for n in 1..=50 {
                item.content = format!("v{n}");
                backend.put(item.clone()).await.unwrap();
            }
        })
    };
    for _ in 0..50 {
        let hits = backend.query(&MemoryFilter::tenant(acme()), 10).await.unwrap();
        assert_eq!(hits.len(), 1, "upsert exposed a missing or duplicate row");
    }
    writer.await.unwrap();
}
