// tests/unit_bloom_filter_test.rs

#[cfg(test)]
mod unit_bloom_filter_test {
    use pageveil::core::PageVeilError;
    use pageveil::core::storage::bloom::{BloomFilter, BloomFilterConfig};
    use pageveil::core::storage::kv::{KeyValueStore, MemoryKvStore};
    use std::sync::Arc;

    fn store() -> Arc<MemoryKvStore> {
        Arc::new(MemoryKvStore::new())
    }

    fn filter(store: &Arc<MemoryKvStore>, config: BloomFilterConfig) -> BloomFilter {
        BloomFilter::new(store.clone() as Arc<dyn KeyValueStore>, config).unwrap()
    }

    #[tokio::test]
    async fn test_add_and_might_contain() {
        let store = store();
        let bf = filter(&store, BloomFilterConfig::new("t", vec![101, 103, 107]));
        bf.ready(0).await.unwrap();

        assert!(!bf.might_contain("https://example.com/a", false).await.unwrap());
        bf.add("https://example.com/a").await.unwrap();
        assert!(bf.might_contain("https://example.com/a", false).await.unwrap());
        assert!(!bf.might_contain("https://example.com/b", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_membership_survives_reopen() {
        let store = store();
        {
            let bf = filter(&store, BloomFilterConfig::new("t", vec![101, 103, 107]));
            bf.ready(0).await.unwrap();
            bf.add("hello").await.unwrap();
        }
        let bf = filter(&store, BloomFilterConfig::new("t", vec![101, 103, 107]));
        bf.ready(10).await.unwrap();
        assert!(bf.might_contain("hello", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_rotation_drops_old_generation() {
        // Literal rotation scenario: partitions [7,11,13], two generations,
        // 100ms interval.
        let store = store();
        let config =
            BloomFilterConfig::new("t", vec![7, 11, 13]).with_rotation(2, 100);
        let bf = filter(&store, config);

        bf.ready(0).await.unwrap();
        bf.add("x").await.unwrap();
        assert!(bf.might_contain("x", false).await.unwrap());

        // At t=250 the generation from t=0 is older than
        // rotation_interval * max_generations and gets discarded.
        bf.ready(250).await.unwrap();
        assert!(!bf.might_contain("x", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_ttl_refreshes_into_newest_generation() {
        let store = store();
        let config =
            BloomFilterConfig::new("t", vec![101, 103, 107]).with_rotation(2, 1000);
        let bf = filter(&store, config);

        bf.ready(0).await.unwrap();
        bf.add("keep").await.unwrap();
        bf.add("lose").await.unwrap();

        // Second generation appears at t=1000; refresh only "keep".
        bf.ready(1000).await.unwrap();
        assert!(bf.might_contain("keep", true).await.unwrap());
        assert!(bf.might_contain("lose", false).await.unwrap());

        // Two more rotations age the original generation out entirely.
        bf.ready(2000).await.unwrap();
        bf.ready(3000).await.unwrap();
        assert!(bf.might_contain("keep", false).await.unwrap());
        assert!(!bf.might_contain("lose", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_no_rotation_mode_keeps_single_generation() {
        let store = store();
        let bf = filter(&store, BloomFilterConfig::new("t", vec![101, 103, 107]));
        bf.ready(0).await.unwrap();
        bf.add("x").await.unwrap();

        // With max_generations=1 and a zero interval, ready() never rotates,
        // no matter how far time advances.
        bf.ready(10_000_000).await.unwrap();
        assert!(bf.might_contain("x", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_ready_cleans_foreign_and_obsolete_keys() {
        let store = store();
        store
            .set("bf|t|weird", serde_json::json!("junk"))
            .await
            .unwrap();
        store
            .set("bf|t|v1|0|0", serde_json::json!("00"))
            .await
            .unwrap();
        store
            .set("bf|t|v2|zzz|0", serde_json::json!("00"))
            .await
            .unwrap();

        let bf = filter(&store, BloomFilterConfig::new("t", vec![101, 103, 107]));
        bf.ready(0).await.unwrap();

        let keys = store.keys().await.unwrap();
        assert!(!keys.iter().any(|k| k == "bf|t|weird"));
        assert!(!keys.iter().any(|k| k.starts_with("bf|t|v1|")));
        assert!(!keys.iter().any(|k| k == "bf|t|v2|zzz|0"));
    }

    #[tokio::test]
    async fn test_future_generation_is_discarded_as_clock_jump() {
        let store = store();
        let config =
            BloomFilterConfig::new("t", vec![101, 103, 107]).with_rotation(2, 1000);
        {
            let bf = filter(&store, config.clone());
            bf.ready(1_000_000).await.unwrap();
            bf.add("x").await.unwrap();
        }
        // Reopening far in the "past" makes the stored generation sit more
        // than two rotation intervals in the future.
        let bf = filter(&store, config);
        bf.ready(0).await.unwrap();
        assert!(!bf.might_contain("x", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_configuration_errors() {
        let no_partitions = BloomFilterConfig::new("t", vec![]);
        assert!(matches!(
            BloomFilter::new(store() as Arc<dyn KeyValueStore>, no_partitions),
            Err(PageVeilError::BloomConfig(_))
        ));

        let zero_partition = BloomFilterConfig::new("t", vec![7, 0, 13]);
        assert!(BloomFilter::new(store() as Arc<dyn KeyValueStore>, zero_partition).is_err());

        let pipe_in_name = BloomFilterConfig::new("a|b", vec![7, 11]);
        assert!(BloomFilter::new(store() as Arc<dyn KeyValueStore>, pipe_in_name).is_err());
    }

    #[tokio::test]
    async fn test_self_checks_require_ready() {
        let store = store();
        let bf = filter(&store, BloomFilterConfig::new("t", vec![101, 103, 107]));
        assert!(!bf.self_checks().await.is_ok());
        bf.ready(0).await.unwrap();
        assert!(bf.self_checks().await.is_ok());
    }
}
