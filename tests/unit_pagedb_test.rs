// tests/unit_pagedb_test.rs

#[cfg(test)]
mod unit_pagedb_test {
    use pageveil::core::clock::{Clock, ManualClock, ONE_DAY_MS};
    use pageveil::core::pagedb::{
        AcquireOptions, Aggregator, NewPageApprover, PageDb, PageEntry, PageStatus, SearchInfo,
    };
    use pageveil::core::random::{RandomSource, SeededRandom};
    use pageveil::core::storage::bloom::{BloomFilter, BloomFilterConfig};
    use pageveil::core::storage::hashes::PersistedHashes;
    use pageveil::core::storage::kv::{KeyValueStore, MemoryKvStore};
    use serde_json::json;
    use std::sync::Arc;

    const START: u64 = 1_700_000_000_000;

    struct Fixture {
        db: PageDb,
        approver: Arc<NewPageApprover>,
        store: Arc<MemoryKvStore>,
        clock: Arc<ManualClock>,
    }

    async fn setup() -> Fixture {
        let store = Arc::new(MemoryKvStore::new());
        let privacy_store = Arc::new(MemoryKvStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let hashes = Arc::new(PersistedHashes::new(
            privacy_store.clone() as Arc<dyn KeyValueStore>,
            clock.clone() as Arc<dyn Clock>,
            "pageCooldowns",
            2 * ONE_DAY_MS,
        ));
        hashes.open().await.unwrap();
        let bloom = Arc::new(
            BloomFilter::new(
                privacy_store.clone() as Arc<dyn KeyValueStore>,
                BloomFilterConfig::new("privatePages", vec![1009, 1013, 1019]),
            )
            .unwrap(),
        );
        bloom.ready(START).await.unwrap();
        let approver = Arc::new(NewPageApprover::new(
            hashes,
            bloom,
            Arc::new(SeededRandom::new(99)) as Arc<dyn RandomSource>,
        ));
        let db = PageDb::new(
            store.clone() as Arc<dyn KeyValueStore>,
            clock.clone() as Arc<dyn Clock>,
            approver.clone(),
        );
        Fixture {
            db,
            approver,
            store,
            clock,
        }
    }

    fn page(url: &str, last_updated_at: u64) -> PageEntry {
        PageEntry {
            url: url.to_string(),
            status: PageStatus::Complete,
            page_load_method: Some("full-page-load".to_string()),
            title: "a title".to_string(),
            search: None,
            referrer: None,
            redirects: None,
            pre_doublefetch: Some(json!({ "noindex": false })),
            lang: Some("en".to_string()),
            last_updated_at,
            aggregator: Aggregator::default(),
        }
    }

    fn force_all() -> AcquireOptions {
        AcquireOptions {
            force_expiration: true,
            ..AcquireOptions::default()
        }
    }

    #[tokio::test]
    async fn test_tracking_and_promotion() {
        let fixture = setup().await;
        fixture
            .db
            .update_pages(vec![page("https://example.com/article", START)], None)
            .await
            .unwrap();
        assert_eq!(fixture.db.tracked_page_count().await, 1);
        assert_eq!(fixture.store.keys().await.unwrap().len(), 1);

        let promoted = fixture.db.acquire_expired_pages(force_all()).await.unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].url, "https://example.com/article");

        // Consumed pages leave both memory and storage.
        assert_eq!(fixture.db.tracked_page_count().await, 0);
        assert!(fixture.store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cooldown_blocks_recreation() {
        let fixture = setup().await;
        let url = "https://example.com/article";
        fixture
            .db
            .update_pages(vec![page(url, START)], None)
            .await
            .unwrap();
        fixture.db.acquire_expired_pages(force_all()).await.unwrap();

        // The approver recorded a cooldown on first admission.
        fixture
            .db
            .update_pages(vec![page(url, START + 1000)], None)
            .await
            .unwrap();
        assert_eq!(fixture.db.tracked_page_count().await, 0);
    }

    #[tokio::test]
    async fn test_fragments_are_stripped_and_deduplicated() {
        let fixture = setup().await;
        fixture
            .db
            .update_pages(
                vec![
                    page("https://example.com/a#one", START),
                    page("https://example.com/a#two", START + 1),
                ],
                None,
            )
            .await
            .unwrap();
        assert_eq!(fixture.db.tracked_page_count().await, 1);
        let promoted = fixture.db.acquire_expired_pages(force_all()).await.unwrap();
        assert_eq!(promoted[0].url, "https://example.com/a");
    }

    #[tokio::test]
    async fn test_merge_search_depth_one_dominates() {
        let fixture = setup().await;
        let url = "https://example.com/landing";
        let mut first = page(url, START);
        first.search = Some(SearchInfo {
            category: "search-go".to_string(),
            query: "rust".to_string(),
            depth: 1,
        });
        fixture.db.update_pages(vec![first], None).await.unwrap();

        // A newer observation with a deeper search context merges in because
        // the page is the active tab, but depth 1 must survive.
        let mut second = page(url, START + 5000);
        second.search = Some(SearchInfo {
            category: "search-go".to_string(),
            query: "rust".to_string(),
            depth: 3,
        });
        second.title = "updated title".to_string();
        fixture
            .db
            .update_pages(vec![second], Some(url))
            .await
            .unwrap();

        let promoted = fixture.db.acquire_expired_pages(force_all()).await.unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].title, "updated title");
        assert_eq!(promoted[0].search.as_ref().unwrap().depth, 1);
    }

    #[tokio::test]
    async fn test_stale_update_of_inactive_page_is_ignored() {
        let fixture = setup().await;
        let url = "https://example.com/a";
        fixture
            .db
            .update_pages(vec![page(url, START + 100)], None)
            .await
            .unwrap();

        let mut stale = page(url, START + 50);
        stale.title = "stale".to_string();
        fixture.db.update_pages(vec![stale], None).await.unwrap();

        let promoted = fixture.db.acquire_expired_pages(force_all()).await.unwrap();
        assert_eq!(promoted[0].title, "a title");
    }

    #[tokio::test]
    async fn test_incomplete_pages_are_consumed_but_not_promoted() {
        let fixture = setup().await;
        let mut incomplete = page("https://example.com/loading", START);
        incomplete.status = PageStatus::Loading;
        let mut no_prefetch = page("https://example.com/bare", START);
        no_prefetch.pre_doublefetch = None;

        fixture
            .db
            .update_pages(vec![incomplete, no_prefetch], None)
            .await
            .unwrap();
        let promoted = fixture.db.acquire_expired_pages(force_all()).await.unwrap();
        assert!(promoted.is_empty());
        assert_eq!(fixture.db.tracked_page_count().await, 0);
        assert!(fixture.store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_noindex_pages_are_marked_private() {
        let fixture = setup().await;
        let url = "https://example.com/private-profile";
        let mut entry = page(url, START);
        entry.pre_doublefetch = Some(json!({ "noindex": true }));
        fixture.db.update_pages(vec![entry], None).await.unwrap();

        let promoted = fixture.db.acquire_expired_pages(force_all()).await.unwrap();
        assert!(promoted.is_empty());
        assert!(fixture.approver.is_marked_private(url).await.unwrap());
    }

    #[tokio::test]
    async fn test_serps_are_marked_private() {
        let fixture = setup().await;
        let url = "https://www.google.com/search";
        let mut entry = page(url, START);
        entry.search = Some(SearchInfo {
            category: "search-go".to_string(),
            query: "rust".to_string(),
            depth: 0,
        });
        fixture.db.update_pages(vec![entry], None).await.unwrap();

        let promoted = fixture.db.acquire_expired_pages(force_all()).await.unwrap();
        assert!(promoted.is_empty());
        assert!(fixture.approver.is_marked_private(url).await.unwrap());
    }

    #[tokio::test]
    async fn test_pages_wait_out_their_cooldown() {
        let fixture = setup().await;
        fixture
            .db
            .update_pages(vec![page("https://example.com/slow", START)], None)
            .await
            .unwrap();

        // Not expired yet.
        let promoted = fixture
            .db
            .acquire_expired_pages(AcquireOptions::default())
            .await
            .unwrap();
        assert!(promoted.is_empty());
        assert_eq!(fixture.db.tracked_page_count().await, 1);

        // Past the cooldown it pops.
        fixture.clock.set(START + 31 * 60 * 1000);
        let promoted = fixture
            .db
            .acquire_expired_pages(AcquireOptions::default())
            .await
            .unwrap();
        assert_eq!(promoted.len(), 1);
    }

    #[tokio::test]
    async fn test_restore_cleans_bad_keys() {
        let fixture = setup().await;
        let entry = page("https://example.com/x", START);
        fixture
            .store
            .set(
                &format!("{START}:https://example.com/x"),
                serde_json::to_value(&entry).unwrap(),
            )
            .await
            .unwrap();
        fixture
            .store
            .set("malformed-key", json!({}))
            .await
            .unwrap();
        fixture
            .store
            .set(
                &format!("{}:https://example.com/future", START + 2 * ONE_DAY_MS),
                serde_json::to_value(&entry).unwrap(),
            )
            .await
            .unwrap();

        fixture.db.restore().await.unwrap();
        assert_eq!(fixture.db.tracked_page_count().await, 1);
        let keys = fixture.store.keys().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].ends_with("example.com/x"));
        assert!(fixture.db.self_checks().await.is_ok());
    }

    #[tokio::test]
    async fn test_emergency_cleanup_wipes_oversized_store() {
        let fixture = setup().await;
        for i in 0..2100u32 {
            fixture
                .store
                .set(&format!("{START}:https://example.com/{i}"), json!({}))
                .await
                .unwrap();
        }
        fixture.db.restore().await.unwrap();
        assert!(fixture.store.keys().await.unwrap().is_empty());
        assert_eq!(fixture.db.tracked_page_count().await, 0);
    }

    #[tokio::test]
    async fn test_self_checks_pass_with_tracked_pages() {
        let fixture = setup().await;
        for i in 0..5 {
            fixture
                .db
                .update_pages(vec![page(&format!("https://example.com/{i}"), START + i)], None)
                .await
                .unwrap();
        }
        assert!(fixture.db.self_checks().await.is_ok());
    }
}
