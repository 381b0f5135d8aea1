// tests/unit_bitarray_test.rs

#[cfg(test)]
mod unit_bitarray_test {
    use pageveil::core::PageVeilError;
    use pageveil::core::storage::bitarray::PersistedBitarray;
    use pageveil::core::storage::kv::{KeyValueStore, MemoryKvStore};
    use std::sync::Arc;

    fn store() -> Arc<MemoryKvStore> {
        Arc::new(MemoryKvStore::new())
    }

    #[tokio::test]
    async fn test_set_and_test_bits() {
        let store = store();
        let bits = PersistedBitarray::new(store.clone(), "ba|test", 1000, 256).unwrap();

        // 1. Fresh bits read as unset.
        assert!(!bits.test(5).await.unwrap());

        // 2. Set a few bits across shards.
        bits.set(5).await.unwrap();
        bits.set_many(&[0, 255, 256, 999]).await.unwrap();

        let hits = bits.test_many(&[0, 5, 255, 256, 999, 998]).await.unwrap();
        assert_eq!(hits, vec![true, true, true, true, true, false]);
    }

    #[tokio::test]
    async fn test_writes_are_buffered_until_flush() {
        let store = store();
        let bits = PersistedBitarray::new(store.clone(), "ba|test", 1024, 256).unwrap();

        bits.set_many(&[1, 300, 1023]).await.unwrap();
        // Nothing persisted yet.
        assert!(store.keys().await.unwrap().is_empty());

        bits.flush().await.unwrap();
        let mut keys = store.keys().await.unwrap();
        keys.sort();
        // Bits 1, 300 and 1023 live in shards 0, 1 and 3.
        assert_eq!(keys, vec!["ba|test|0", "ba|test|1", "ba|test|3"]);
    }

    #[tokio::test]
    async fn test_reopen_reads_persisted_shards() {
        let store = store();
        {
            let bits = PersistedBitarray::new(store.clone(), "ba|test", 512, 256).unwrap();
            bits.set_many(&[3, 400]).await.unwrap();
            bits.flush().await.unwrap();
        }
        let reopened = PersistedBitarray::new(store.clone(), "ba|test", 512, 256).unwrap();
        assert!(reopened.test(3).await.unwrap());
        assert!(reopened.test(400).await.unwrap());
        assert!(!reopened.test(4).await.unwrap());
    }

    #[tokio::test]
    async fn test_out_of_range_index_is_an_error() {
        let bits = PersistedBitarray::new(store(), "ba|test", 100, 256).unwrap();
        assert!(bits.set(100).await.is_err());
        assert!(bits.test(1000).await.is_err());
    }

    #[tokio::test]
    async fn test_corrupted_shard_resets_to_zero() {
        let store = store();
        store
            .set("ba|test|0", serde_json::json!("not-hex!"))
            .await
            .unwrap();
        let bits = PersistedBitarray::new(store.clone(), "ba|test", 256, 256).unwrap();
        assert!(!bits.test(0).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_configuration_is_rejected() {
        assert!(matches!(
            PersistedBitarray::new(store(), "ba|test", 0, 256),
            Err(PageVeilError::InvalidConfig(_))
        ));
        // Shard sizes must be whole bytes.
        assert!(PersistedBitarray::new(store(), "ba|test", 100, 12).is_err());
    }

    #[tokio::test]
    async fn test_self_checks_report_pending_flushes() {
        let store = store();
        let bits = PersistedBitarray::new(store, "ba|test", 256, 256).unwrap();
        assert!(bits.self_checks().is_ok());

        bits.set(1).await.unwrap();
        let report = bits.self_checks();
        assert!(report.is_ok());
        assert_eq!(report.warnings.len(), 1);

        bits.flush().await.unwrap();
        assert!(bits.self_checks().warnings.is_empty());
    }
}
