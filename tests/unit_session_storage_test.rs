// tests/unit_session_storage_test.rs

#[cfg(test)]
mod unit_session_storage_test {
    use async_trait::async_trait;
    use pageveil::core::PageVeilError;
    use pageveil::core::storage::session::{SessionApi, SessionStorageWrapper};
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct MockSessionApi {
        entries: parking_lot::Mutex<HashMap<String, Value>>,
        fail_writes: AtomicBool,
        set_calls: AtomicUsize,
    }

    #[async_trait]
    impl SessionApi for MockSessionApi {
        async fn session_get(
            &self,
            prefix: &str,
        ) -> Result<HashMap<String, Value>, PageVeilError> {
            Ok(self
                .entries
                .lock()
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }

        async fn session_set(
            &self,
            entries: HashMap<String, Value>,
        ) -> Result<(), PageVeilError> {
            self.set_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(PageVeilError::Storage("quota".to_string()));
            }
            self.entries.lock().extend(entries);
            Ok(())
        }

        async fn session_remove(&self, keys: &[String]) -> Result<(), PageVeilError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(PageVeilError::Storage("quota".to_string()));
            }
            let mut entries = self.entries.lock();
            for key in keys {
                entries.remove(key);
            }
            Ok(())
        }
    }

    async fn setup() -> (Arc<MockSessionApi>, Arc<SessionStorageWrapper>) {
        let api = Arc::new(MockSessionApi::default());
        let wrapper = Arc::new(SessionStorageWrapper::new(
            Some(api.clone() as Arc<dyn SessionApi>),
            "test",
            1,
        ));
        wrapper.init().await.unwrap();
        (api, wrapper)
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_flush_writes_namespaced_keys() {
        let (api, wrapper) = setup().await;
        wrapper.set("alpha", json!(1));
        wrapper.set("beta", json!({"x": true}));

        // Nothing hits the API before the debounce window elapses.
        assert!(api.entries.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(400)).await;
        let entries = api.entries.lock().clone();
        assert_eq!(entries.get("test::v1::alpha"), Some(&json!(1)));
        assert_eq!(entries.get("test::v1::beta"), Some(&json!({"x": true})));
        // Both keys went out in one batched write.
        assert_eq!(api.set_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_deletes_from_backend() {
        let (api, wrapper) = setup().await;
        wrapper.set("gone", json!("soon"));
        wrapper.flush().await.unwrap();
        assert!(api.entries.lock().contains_key("test::v1::gone"));

        wrapper.remove("gone");
        assert!(wrapper.get("gone").is_none());
        wrapper.flush().await.unwrap();
        assert!(!api.entries.lock().contains_key("test::v1::gone"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_loads_only_own_namespace() {
        let api = Arc::new(MockSessionApi::default());
        api.entries
            .lock()
            .insert("test::v1::mine".to_string(), json!(7));
        api.entries
            .lock()
            .insert("other::v1::theirs".to_string(), json!(8));

        let wrapper = Arc::new(SessionStorageWrapper::new(
            Some(api.clone() as Arc<dyn SessionApi>),
            "test",
            1,
        ));
        wrapper.init().await.unwrap();
        assert_eq!(wrapper.get("mine"), Some(json!(7)));
        assert!(wrapper.get("theirs").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_resyncs_everything() {
        let (api, wrapper) = setup().await;
        wrapper.set("a", json!(1));
        wrapper.flush().await.unwrap();

        api.fail_writes.store(true, Ordering::SeqCst);
        wrapper.set("b", json!(2));
        assert!(wrapper.flush().await.is_err());

        // Once the backend recovers, the next flush re-writes every cached
        // key, not just the one that failed.
        api.fail_writes.store(false, Ordering::SeqCst);
        api.entries.lock().clear();
        wrapper.flush().await.unwrap();
        let entries = api.entries.lock().clone();
        assert_eq!(entries.get("test::v1::a"), Some(&json!(1)));
        assert_eq!(entries.get("test::v1::b"), Some(&json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_fallback_without_api() {
        let wrapper = Arc::new(SessionStorageWrapper::new(None, "test", 1));
        wrapper.init().await.unwrap();
        wrapper.set("k", json!("v"));
        assert_eq!(wrapper.get("k"), Some(json!("v")));
        wrapper.flush().await.unwrap();
        wrapper.remove("k");
        assert!(wrapper.get("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_checks_pass_in_steady_state() {
        let (_, wrapper) = setup().await;
        assert!(wrapper.self_checks().is_ok());

        wrapper.set("pending", json!(1));
        // Dirty but with a scheduled flush: still healthy.
        assert!(wrapper.self_checks().is_ok());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(wrapper.self_checks().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unload_flushes_and_deactivates() {
        let (api, wrapper) = setup().await;
        wrapper.set("last", json!("write"));
        wrapper.unload().await;
        assert!(api.entries.lock().contains_key("test::v1::last"));
    }
}
