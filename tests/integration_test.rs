// tests/integration_test.rs

//! End-to-end pipeline tests with every external collaborator mocked:
//! observer events go in, anonymized messages come out of the transport.

#[cfg(test)]
mod integration_test {
    use async_trait::async_trait;
    use pageveil::config::{BrowserInfo, ReportingConfig};
    use pageveil::core::PageVeilError;
    use pageveil::core::clock::{Clock, LocalTrustedClock, ManualClock, TrustedClock};
    use pageveil::core::pagedb::{Aggregator, PageEntry, PageStatus};
    use pageveil::core::patterns::DoublefetchRequest;
    use pageveil::core::quorum::QuorumService;
    use pageveil::core::random::{RandomSource, SeededRandom};
    use pageveil::core::reporting::jobs::{DoublefetchResponse, Doublefetcher};
    use pageveil::core::reporting::messages::{CountryProvider, Transport};
    use pageveil::core::reporting::{PageEvent, Reporting, ReportingServices};
    use pageveil::core::storage::kv::MemoryKvStore;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const START: u64 = 1_700_000_000_000;

    #[derive(Default)]
    struct MockTransport {
        messages: parking_lot::Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, message: Value) -> Result<(), PageVeilError> {
            self.messages.lock().push(message);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockQuorum {
        increments: AtomicUsize,
    }

    #[async_trait]
    impl QuorumService for MockQuorum {
        async fn send_quorum_increment(&self, _text: &str) -> Result<(), PageVeilError> {
            self.increments.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn check_quorum_consent(&self, _text: &str) -> Result<bool, PageVeilError> {
            Ok(true)
        }
    }

    struct MockCountry;

    #[async_trait]
    impl CountryProvider for MockCountry {
        async fn current_country(&self) -> Result<String, PageVeilError> {
            Ok("de".to_string())
        }
    }

    /// Returns a canned body and echoes the request URL as the final URL.
    #[derive(Default)]
    struct MockDoublefetcher {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl Doublefetcher for MockDoublefetcher {
        async fn fetch(
            &self,
            request: &DoublefetchRequest,
        ) -> Result<DoublefetchResponse, PageVeilError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(DoublefetchResponse {
                status: 200,
                final_url: request.url.clone(),
                body: "<html><body>canned</body></html>".to_string(),
            })
        }
    }

    struct Fixture {
        reporting: Arc<Reporting>,
        transport: Arc<MockTransport>,
        quorum: Arc<MockQuorum>,
        clock: Arc<ManualClock>,
    }

    async fn setup() -> Fixture {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let clock = Arc::new(ManualClock::new(START));
        let transport = Arc::new(MockTransport::default());
        let quorum = Arc::new(MockQuorum::default());
        let config = ReportingConfig {
            // Empty URLs keep the remote downloads off; rules are installed
            // directly below.
            patterns_url: String::new(),
            config_url: String::new(),
            browser: BrowserInfo {
                browser: "Firefox".to_string(),
                version: "122".to_string(),
                os: "Linux".to_string(),
                language: "en-US".to_string(),
            },
            ..ReportingConfig::default()
        };
        let services = ReportingServices {
            storage: Arc::new(MemoryKvStore::new()),
            session_api: None,
            transport: transport.clone(),
            quorum_service: quorum.clone(),
            country: Arc::new(MockCountry),
            clock: clock.clone(),
            trusted_clock: Arc::new(LocalTrustedClock::new(clock.clone() as Arc<dyn Clock>))
                as Arc<dyn TrustedClock>,
            random: Arc::new(SeededRandom::new(1234)) as Arc<dyn RandomSource>,
            doublefetch: Some(Arc::new(MockDoublefetcher::default())),
        };
        let reporting = Reporting::new(config, services).unwrap();
        reporting.init().await.unwrap();
        reporting.patterns().update_patterns(json!({
            "_meta": { "version": 7 },
            "page": {
                "input": {
                    "url": { "from": "url", "transform": [["maskU"]] },
                    "title": { "from": "title" }
                },
                "output": { "fields": ["url", "title"] },
                "doublefetch": { "followRedirects": true }
            },
            "search-go": {
                "input": {
                    "q": { "from": "query" },
                    "qurl": { "from": "qurl", "transform": [["maskU"]] }
                },
                "output": { "fields": ["q", "qurl"] },
                "doublefetch": {}
            }
        }));
        Fixture {
            reporting,
            transport,
            quorum,
            clock,
        }
    }

    fn complete_page(url: &str, now: u64) -> PageEntry {
        PageEntry {
            url: url.to_string(),
            status: PageStatus::Complete,
            page_load_method: Some("full-page-load".to_string()),
            title: "An Example Article".to_string(),
            search: None,
            referrer: None,
            redirects: None,
            pre_doublefetch: Some(json!({ "noindex": false })),
            lang: Some("en".to_string()),
            last_updated_at: now,
            aggregator: Aggregator::default(),
        }
    }

    fn messages_with_action(transport: &MockTransport, action: &str) -> Vec<Value> {
        transport
            .messages
            .lock()
            .iter()
            .filter(|m| m.get("action").and_then(Value::as_str) == Some(action))
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn test_search_landing_produces_a_query_message() {
        let fixture = setup().await;
        fixture
            .reporting
            .on_page_event(PageEvent::SafeSearchLanding {
                url: "https://www.google.com/search?q=rust+async".to_string(),
            })
            .await
            .unwrap();

        fixture.reporting.process_pending_jobs().await.unwrap();

        let messages = messages_with_action(&fixture.transport, "search-go");
        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(message["ver"], json!(7));
        assert_eq!(message["ctry"], json!("de"));
        assert_eq!(message["payload"]["q"], json!("rust async"));
        assert_eq!(
            message["payload"]["qurl"],
            json!("https://www.google.com/search?q=rust+async")
        );
        // Trusted-clock day stamp: 8 digits.
        assert_eq!(message["ts"].as_str().unwrap().len(), 8);
        assert!(message.get("anti-duplicates").is_some());
        // One quorum vote for the query fingerprint.
        assert_eq!(fixture.quorum.increments.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_suspicious_queries_never_become_jobs() {
        let fixture = setup().await;
        fixture
            .reporting
            .on_page_event(PageEvent::SafeSearchLanding {
                url: "https://www.google.com/search?q=jane.doe%40example.com".to_string(),
            })
            .await
            .unwrap();
        fixture.reporting.process_pending_jobs().await.unwrap();
        assert!(messages_with_action(&fixture.transport, "search-go").is_empty());
    }

    #[tokio::test]
    async fn test_page_flow_from_navigation_to_message() {
        let fixture = setup().await;
        let url = "https://example.com/articles/rust-ownership";
        fixture
            .reporting
            .on_page_event(PageEvent::SafePageNavigation {
                open_pages: vec![complete_page(url, START)],
                active_url: Some(url.to_string()),
            })
            .await
            .unwrap();

        // Let the page cooldown and the seeded collector both come due.
        fixture.clock.set(START + 31 * 60 * 1000);
        fixture.reporting.process_pending_jobs().await.unwrap();

        // The send-message cooldown staggers multiple outgoing messages.
        fixture.clock.set(START + 31 * 60 * 1000 + 2000);
        fixture.reporting.process_pending_jobs().await.unwrap();

        let pages = messages_with_action(&fixture.transport, "page");
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0]["payload"]["url"], json!(url));
        assert_eq!(pages[0]["payload"]["title"], json!("An Example Article"));
    }

    #[tokio::test]
    async fn test_alive_message_carries_config_only_with_consent() {
        let fixture = setup().await;
        // Make the seeded alive job due.
        fixture.clock.set(START + 31 * 60 * 1000);
        fixture.reporting.process_pending_jobs().await.unwrap();
        fixture.clock.set(START + 31 * 60 * 1000 + 2000);
        fixture.reporting.process_pending_jobs().await.unwrap();

        let alive = messages_with_action(&fixture.transport, "alive");
        assert_eq!(alive.len(), 1);
        let payload = &alive[0]["payload"];
        // The mock quorum consents, so the config is visible.
        assert_eq!(payload["browser"], json!("Firefox"));
        assert_eq!(payload["ctry"], json!("de"));
        // Hour stamp: 10 digits.
        assert_eq!(payload["t"].as_str().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_ignored_events_and_unload() {
        let fixture = setup().await;
        fixture
            .reporting
            .on_page_event(PageEvent::PageUpdated {
                open_pages: vec![complete_page("https://example.com/x", START)],
                active_url: None,
            })
            .await
            .unwrap();
        assert_eq!(fixture.reporting.pagedb().tracked_page_count().await, 0);

        fixture.reporting.unload().await;
        assert!(!fixture.reporting.is_active());
        let result = fixture
            .reporting
            .on_page_event(PageEvent::SafeSearchLanding {
                url: "https://www.google.com/search?q=rust".to_string(),
            })
            .await;
        assert!(matches!(result, Err(PageVeilError::Unloaded)));
    }

    #[tokio::test]
    async fn test_self_checks_after_activity() {
        let fixture = setup().await;
        fixture
            .reporting
            .on_page_event(PageEvent::SafePageNavigation {
                open_pages: vec![complete_page("https://example.com/a", START)],
                active_url: None,
            })
            .await
            .unwrap();
        let report = fixture.reporting.self_checks().await;
        assert!(report.is_ok(), "unexpected errors: {:?}", report.errors);
    }
}
