// tests/unit_persisted_hashes_test.rs

#[cfg(test)]
mod unit_persisted_hashes_test {
    use pageveil::core::clock::{Clock, ManualClock, ONE_DAY_MS};
    use pageveil::core::storage::hashes::PersistedHashes;
    use pageveil::core::storage::kv::{KeyValueStore, MemoryKvStore};
    use std::sync::Arc;

    fn setup(now: u64) -> (Arc<MemoryKvStore>, Arc<ManualClock>, PersistedHashes) {
        let store = Arc::new(MemoryKvStore::new());
        let clock = Arc::new(ManualClock::new(now));
        let hashes = PersistedHashes::new(
            store.clone() as Arc<dyn KeyValueStore>,
            clock.clone() as Arc<dyn Clock>,
            "cooldowns",
            ONE_DAY_MS,
        );
        (store, clock, hashes)
    }

    #[tokio::test]
    async fn test_add_has_delete() {
        let (_, _, hashes) = setup(1000);
        assert!(hashes.add(42, 5000));
        // A second add of the same hash is not a new insert and keeps the
        // original expiry.
        assert!(!hashes.add(42, 9999));
        assert!(hashes.has(42));
        assert!(!hashes.has(43));

        assert!(hashes.delete(42));
        assert!(!hashes.delete(42));
        assert!(!hashes.has(42));
    }

    #[tokio::test]
    async fn test_flush_and_reopen() {
        let (store, clock, hashes) = setup(1000);
        hashes.add(1, 50_000);
        hashes.add(2, 60_000);
        hashes.flush().await.unwrap();

        let reopened = PersistedHashes::new(
            store.clone() as Arc<dyn KeyValueStore>,
            clock.clone() as Arc<dyn Clock>,
            "cooldowns",
            ONE_DAY_MS,
        );
        reopened.open().await.unwrap();
        assert!(reopened.has(1));
        assert!(reopened.has(2));
        assert_eq!(reopened.len(), 2);
    }

    #[tokio::test]
    async fn test_flush_skips_when_clean() {
        let (store, _, hashes) = setup(1000);
        hashes.add(1, 50_000);
        hashes.flush().await.unwrap();
        let before = store.get("cooldowns").await.unwrap();

        // No changes since the last flush; the blob must stay untouched.
        hashes.flush().await.unwrap();
        assert_eq!(store.get("cooldowns").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_entries() {
        let (_, clock, hashes) = setup(1000);
        hashes.add(1, 2000);
        hashes.add(2, 10_000);

        clock.set(5000);
        hashes.sweep();
        assert!(!hashes.has(1));
        assert!(hashes.has(2));
    }

    #[tokio::test]
    async fn test_sweep_removes_clock_jump_artifacts() {
        let (_, _, hashes) = setup(1000);
        // An expiry more than max_ttl past now can only come from a clock
        // jump while the entry was written.
        hashes.add(7, 1000 + ONE_DAY_MS + 1);
        hashes.add(8, 1000 + ONE_DAY_MS - 1);
        hashes.sweep();
        assert!(!hashes.has(7));
        assert!(hashes.has(8));
    }

    #[tokio::test]
    async fn test_open_drops_unreadable_entries() {
        let (store, clock, _) = setup(1000);
        store
            .set(
                "cooldowns",
                serde_json::json!([
                    { "h": 1, "expireAt": 50_000 },
                    { "bogus": true },
                    { "h": 2, "expireAt": 60_000 },
                ]),
            )
            .await
            .unwrap();

        let hashes = PersistedHashes::new(
            store.clone() as Arc<dyn KeyValueStore>,
            clock.clone() as Arc<dyn Clock>,
            "cooldowns",
            ONE_DAY_MS,
        );
        hashes.open().await.unwrap();
        assert!(hashes.has(1));
        assert!(hashes.has(2));
        assert_eq!(hashes.len(), 2);
    }
}
