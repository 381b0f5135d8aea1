// tests/unit_quorum_test.rs

#[cfg(test)]
mod unit_quorum_test {
    use async_trait::async_trait;
    use pageveil::core::PageVeilError;
    use pageveil::core::quorum::{QuorumChecker, QuorumService};
    use pageveil::core::storage::session::SessionStorageWrapper;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockQuorumService {
        increments: AtomicUsize,
        consents: AtomicUsize,
        consent: AtomicBool,
    }

    #[async_trait]
    impl QuorumService for MockQuorumService {
        async fn send_quorum_increment(&self, _text: &str) -> Result<(), PageVeilError> {
            self.increments.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn check_quorum_consent(&self, _text: &str) -> Result<bool, PageVeilError> {
            self.consents.fetch_add(1, Ordering::SeqCst);
            Ok(self.consent.load(Ordering::SeqCst))
        }
    }

    async fn setup(consent: bool) -> (Arc<MockQuorumService>, QuorumChecker, Arc<SessionStorageWrapper>) {
        let service = Arc::new(MockQuorumService::default());
        service.consent.store(consent, Ordering::SeqCst);
        let cache = Arc::new(SessionStorageWrapper::new(None, "quorum-test", 1));
        cache.init().await.unwrap();
        let checker = QuorumChecker::new(service.clone() as Arc<dyn QuorumService>, cache.clone());
        (service, checker, cache)
    }

    #[tokio::test]
    async fn test_one_shot_per_fingerprint() {
        // Literal one-shot scenario: a fixed config votes exactly once no
        // matter how many messages are generated from it.
        let (service, checker, _) = setup(true).await;
        let ballot = json!({
            "browser": "Firefox",
            "version": "122",
            "os": "Linux",
            "language": "en-US",
            "ctry": "de",
        });

        assert!(checker.check(&ballot).await.unwrap());
        assert!(checker.check(&ballot).await.unwrap());
        assert_eq!(service.increments.load(Ordering::SeqCst), 1);
        assert_eq!(service.consents.load(Ordering::SeqCst), 1);

        // Changing the country changes the fingerprint and triggers a
        // second round.
        let mut us_ballot = ballot.clone();
        us_ballot["ctry"] = json!("us");
        assert!(checker.check(&us_ballot).await.unwrap());
        assert_eq!(service.increments.load(Ordering::SeqCst), 2);
        assert_eq!(service.consents.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refusal_is_cached_too() {
        // A static config must not creep over the threshold by re-voting
        // every time it is checked.
        let (service, checker, _) = setup(false).await;
        let ballot = json!({ "ctry": "de" });
        assert!(!checker.check(&ballot).await.unwrap());
        assert!(!checker.check(&ballot).await.unwrap());
        assert!(!checker.check(&ballot).await.unwrap());
        assert_eq!(service.increments.load(Ordering::SeqCst), 1);
        assert_eq!(service.consents.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_key_order_does_not_change_the_fingerprint() {
        let (service, checker, _) = setup(true).await;
        // serde_json preserves insertion order, so these two differ as raw
        // text and must still map to one fingerprint.
        let ab = json!({ "a": 1, "b": 2 });
        let ba = json!({ "b": 2, "a": 1 });
        checker.check(&ab).await.unwrap();
        checker.check(&ba).await.unwrap();
        assert_eq!(service.increments.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pending_record_skips_the_increment() {
        // A crash between the increment and the consent check leaves a
        // pending record; the retry must not vote again.
        let (service, checker, cache) = setup(true).await;
        let ballot = json!({ "ctry": "de" });
        let text = pageveil::core::fingerprint::stable_stringify(&ballot);
        cache.set(format!("quorum::{text}"), json!({ "pending": true }));

        assert!(checker.check(&ballot).await.unwrap());
        assert_eq!(service.increments.load(Ordering::SeqCst), 0);
        assert_eq!(service.consents.load(Ordering::SeqCst), 1);

        // The outcome is now cached normally.
        assert!(checker.check(&ballot).await.unwrap());
        assert_eq!(service.consents.load(Ordering::SeqCst), 1);
    }
}
