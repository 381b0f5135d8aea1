// src/core/reporting/mod.rs

//! The orchestrator. Wires the storage primitives, the scheduler, the page
//! store, the redaction machinery and the quorum gate into one pipeline and
//! feeds it from the host's page observer events.
//!
//! Steady-state flow: page events land in PageDB (admission via the
//! approver), expired pages are promoted by the collect job, doublefetched,
//! pushed through the pattern rules, quorum-checked, and finally handed to
//! the transport. Every transition is a scheduler job; every persisted
//! write is batched.

pub mod alive;
pub mod jobs;
pub mod messages;

pub use alive::AliveCheck;
pub use messages::{CountryProvider, MessageFactory, Transport};

use crate::config::ReportingConfig;
use crate::core::SelfCheckResult;
use crate::core::analyzer::{UrlAnalysis, UrlAnalyzer};
use crate::core::clock::{Clock, ONE_DAY_MS, TrustedClock};
use crate::core::errors::PageVeilError;
use crate::core::pagedb::{AcquireOptions, NewPageApprover, PageDb, PageEntry};
use crate::core::patterns::{Patterns, PatternsUpdater};
use crate::core::quorum::{QuorumChecker, QuorumService};
use crate::core::random::RandomSource;
use crate::core::sanitizer::check_suspicious_query;
use crate::core::scheduler::{Job, JobConfig, JobScheduler, ProcessOptions};
use crate::core::storage::bloom::{BloomFilter, BloomFilterConfig};
use crate::core::storage::hashes::PersistedHashes;
use crate::core::storage::kv::{KeyValueStore, PrefixedKvStore};
use crate::core::storage::session::{SessionApi, SessionStorageWrapper};
use jobs::{
    AliveMessageHandler, CollectExpiredPagesHandler, DoublefetchClient, DoublefetchPageHandler,
    DoublefetchQueryHandler, Doublefetcher, JOB_ALIVE_MESSAGE, JOB_COLLECT_EXPIRED_PAGES,
    JOB_DOUBLEFETCH_PAGE, JOB_DOUBLEFETCH_QUERY, JOB_PAGE_QUORUM_CHECK, JOB_SEND_MESSAGE,
    JOB_UPDATE_PATTERNS, QueryDoublefetchArgs, QuorumCheckHandler, SendMessageHandler,
    UpdatePatternsHandler,
};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Partition sizes of the private-pages Bloom filter: the five largest
/// primes below 2^15, pairwise coprime by construction.
const PRIVATE_PAGES_PARTITIONS: [u32; 5] = [32749, 32719, 32717, 32713, 32707];
const PRIVATE_PAGES_MAX_GENERATIONS: usize = 4;
const PRIVATE_PAGES_ROTATION_MS: u64 = 30 * ONE_DAY_MS;

/// Page cooldowns legitimately reach ~26h, so their clock-jump window is
/// two days rather than the generic one.
const PAGE_COOLDOWNS_MAX_TTL_MS: u64 = 2 * ONE_DAY_MS;

const SESSION_NAMESPACE: &str = "pageveil";
const SESSION_VERSION: u32 = 1;
const SCHEDULER_STORAGE_KEY: &str = "jobScheduler";
const PAGE_STORE_PREFIX: &str = "pages::";
const PRIVACY_STORE_PREFIX: &str = "privacy::";
const PAGE_COOLDOWNS_KEY: &str = "pageCooldowns";

/// Events from the external tab/page observer. Only the `safe-*` events
/// carry content the pipeline may look at; everything else is dropped here.
#[derive(Debug, Clone)]
pub enum PageEvent {
    SafePageNavigation {
        open_pages: Vec<PageEntry>,
        active_url: Option<String>,
    },
    SafeSearchLanding {
        url: String,
    },
    PageUpdated {
        open_pages: Vec<PageEntry>,
        active_url: Option<String>,
    },
}

/// The external collaborators the host must supply.
pub struct ReportingServices {
    pub storage: Arc<dyn KeyValueStore>,
    pub session_api: Option<Arc<dyn SessionApi>>,
    pub transport: Arc<dyn Transport>,
    pub quorum_service: Arc<dyn QuorumService>,
    pub country: Arc<dyn CountryProvider>,
    pub clock: Arc<dyn Clock>,
    pub trusted_clock: Arc<dyn TrustedClock>,
    pub random: Arc<dyn RandomSource>,
    /// Custom fetch layer; `None` selects the built-in reqwest client.
    pub doublefetch: Option<Arc<dyn Doublefetcher>>,
}

pub struct Reporting {
    config: ReportingConfig,
    clock: Arc<dyn Clock>,
    scheduler: Arc<JobScheduler>,
    pagedb: Arc<PageDb>,
    approver: Arc<NewPageApprover>,
    hashes: Arc<PersistedHashes>,
    bloom: Arc<BloomFilter>,
    patterns: Arc<Patterns>,
    updater: Arc<PatternsUpdater>,
    doublefetch: Arc<dyn Doublefetcher>,
    analyzer: UrlAnalyzer,
    quorum: Arc<QuorumChecker>,
    session: Arc<SessionStorageWrapper>,
    alive: Arc<AliveCheck>,
    factory: Arc<MessageFactory>,
    transport: Arc<dyn Transport>,
    country: Arc<dyn CountryProvider>,
    active: AtomicBool,
    handlers_registered: AtomicBool,
    /// Single-writer region for init/unload; the last call wins.
    lifecycle: AsyncMutex<()>,
}

impl Reporting {
    pub fn new(
        config: ReportingConfig,
        services: ReportingServices,
    ) -> Result<Arc<Self>, PageVeilError> {
        config.validate()?;

        let privacy_store: Arc<dyn KeyValueStore> = Arc::new(PrefixedKvStore::new(
            Arc::clone(&services.storage),
            PRIVACY_STORE_PREFIX,
        ));
        let page_store: Arc<dyn KeyValueStore> = Arc::new(PrefixedKvStore::new(
            Arc::clone(&services.storage),
            PAGE_STORE_PREFIX,
        ));

        let hashes = Arc::new(PersistedHashes::new(
            Arc::clone(&privacy_store),
            Arc::clone(&services.clock),
            PAGE_COOLDOWNS_KEY,
            PAGE_COOLDOWNS_MAX_TTL_MS,
        ));
        let bloom = Arc::new(BloomFilter::new(
            Arc::clone(&privacy_store),
            BloomFilterConfig::new("privatePages", PRIVATE_PAGES_PARTITIONS.to_vec())
                .with_rotation(PRIVATE_PAGES_MAX_GENERATIONS, PRIVATE_PAGES_ROTATION_MS),
        )?);
        let approver = Arc::new(NewPageApprover::new(
            Arc::clone(&hashes),
            Arc::clone(&bloom),
            Arc::clone(&services.random),
        ));
        let pagedb = Arc::new(PageDb::new(
            page_store,
            Arc::clone(&services.clock),
            Arc::clone(&approver),
        ));

        let scheduler = Arc::new(JobScheduler::new(
            Arc::clone(&services.storage),
            Arc::clone(&services.clock),
            Arc::clone(&services.random),
            SCHEDULER_STORAGE_KEY,
        ));

        let session = Arc::new(SessionStorageWrapper::new(
            services.session_api.clone(),
            SESSION_NAMESPACE,
            SESSION_VERSION,
        ));

        let patterns = Arc::new(Patterns::new());
        let updater = Arc::new(PatternsUpdater::new(
            Arc::clone(&patterns),
            reqwest::Client::new(),
            config.patterns_url.clone(),
        ));
        let doublefetch: Arc<dyn Doublefetcher> = match services.doublefetch.clone() {
            Some(custom) => custom,
            None => Arc::new(DoublefetchClient::new()?),
        };
        let analyzer = UrlAnalyzer::new(Arc::clone(&patterns));

        let quorum = Arc::new(QuorumChecker::new(
            Arc::clone(&services.quorum_service),
            Arc::clone(&session),
        ));
        let factory = Arc::new(MessageFactory::new(
            Arc::clone(&services.trusted_clock),
            Arc::clone(&services.random),
            config.allowed_country_codes.clone(),
        ));
        let alive = Arc::new(AliveCheck::new(
            Arc::clone(&quorum),
            Arc::clone(&factory),
            Arc::clone(&patterns),
            config.browser.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            clock: services.clock,
            scheduler,
            pagedb,
            approver,
            hashes,
            bloom,
            patterns,
            updater,
            doublefetch,
            analyzer,
            quorum,
            session,
            alive,
            factory,
            transport: services.transport,
            country: services.country,
            active: AtomicBool::new(false),
            handlers_registered: AtomicBool::new(false),
            lifecycle: AsyncMutex::new(()),
        }))
    }

    /// Brings every component up: session cache, cooldown hashes, Bloom
    /// rotation, handler registration, queue restore, page restore, and the
    /// recurring seed jobs. Idempotent while already initialized.
    pub async fn init(self: &Arc<Self>) -> Result<(), PageVeilError> {
        let _guard = self.lifecycle.lock().await;
        if self.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        let now = self.clock.now_ms();

        self.session.init().await?;
        self.hashes.open().await?;
        self.hashes.sweep();
        self.bloom.ready(now).await?;
        self.register_handlers()?;
        self.scheduler.load().await?;
        self.pagedb.restore().await?;
        self.seed_recurring_jobs()?;

        self.active.store(true, Ordering::SeqCst);
        info!("reporting pipeline initialized");
        Ok(())
    }

    fn register_handlers(&self) -> Result<(), PageVeilError> {
        if self.handlers_registered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let collect = JobConfig {
            priority: -5,
            cooldown_in_ms: 60_000,
            ..JobConfig::default()
        };
        self.scheduler.register_handler(
            JOB_COLLECT_EXPIRED_PAGES,
            self.config.job_config_for(JOB_COLLECT_EXPIRED_PAGES, collect),
            Arc::new(CollectExpiredPagesHandler::new(
                Arc::clone(&self.pagedb),
                AcquireOptions::default(),
            )),
        )?;

        let doublefetch_config = JobConfig {
            priority: 0,
            cooldown_in_ms: 2_000,
            max_auto_retries_after_error: 2,
            ..JobConfig::default()
        };
        self.scheduler.register_handler(
            JOB_DOUBLEFETCH_PAGE,
            self.config
                .job_config_for(JOB_DOUBLEFETCH_PAGE, doublefetch_config.clone()),
            Arc::new(DoublefetchPageHandler::new(
                Arc::clone(&self.patterns),
                Arc::clone(&self.doublefetch),
            )),
        )?;
        self.scheduler.register_handler(
            JOB_DOUBLEFETCH_QUERY,
            self.config
                .job_config_for(JOB_DOUBLEFETCH_QUERY, doublefetch_config),
            Arc::new(DoublefetchQueryHandler::new(
                Arc::clone(&self.patterns),
                Arc::clone(&self.doublefetch),
            )),
        )?;

        let quorum_config = JobConfig {
            priority: 5,
            max_auto_retries_after_error: 3,
            ..JobConfig::default()
        };
        self.scheduler.register_handler(
            JOB_PAGE_QUORUM_CHECK,
            self.config.job_config_for(JOB_PAGE_QUORUM_CHECK, quorum_config),
            Arc::new(QuorumCheckHandler::new(
                Arc::clone(&self.quorum),
                Arc::clone(&self.factory),
                Arc::clone(&self.patterns),
                Arc::clone(&self.country),
            )),
        )?;

        let send_config = JobConfig {
            priority: 10,
            cooldown_in_ms: 1_000,
            max_auto_retries_after_error: 3,
            ..JobConfig::default()
        };
        self.scheduler.register_handler(
            JOB_SEND_MESSAGE,
            self.config.job_config_for(JOB_SEND_MESSAGE, send_config),
            Arc::new(SendMessageHandler::new(Arc::clone(&self.transport))),
        )?;

        let patterns_config = JobConfig {
            priority: 20,
            cooldown_in_ms: 30 * 60_000,
            max_auto_retries_after_error: 1,
            ..JobConfig::default()
        };
        self.scheduler.register_handler(
            JOB_UPDATE_PATTERNS,
            self.config.job_config_for(JOB_UPDATE_PATTERNS, patterns_config),
            Arc::new(UpdatePatternsHandler::new(Arc::clone(&self.updater))),
        )?;

        let alive_config = JobConfig {
            priority: -10,
            max_auto_retries_after_error: 1,
            ..JobConfig::default()
        };
        self.scheduler.register_handler(
            JOB_ALIVE_MESSAGE,
            self.config.job_config_for(JOB_ALIVE_MESSAGE, alive_config),
            Arc::new(AliveMessageHandler::new(
                Arc::clone(&self.alive),
                Arc::clone(&self.factory),
                Arc::clone(&self.country),
            )),
        )?;
        Ok(())
    }

    /// The recurring jobs re-arm themselves; seeding is only needed when the
    /// restored queues carry no pending instance.
    fn seed_recurring_jobs(&self) -> Result<(), PageVeilError> {
        let mut seeds: Vec<(&str, u64, u64)> = vec![
            (JOB_COLLECT_EXPIRED_PAGES, 60_000, 5 * 60_000),
            (JOB_ALIVE_MESSAGE, 60_000, 10 * 60_000),
        ];
        // An empty PATTERNS_URL means the host ships its own rules and
        // remote updates stay off.
        if !self.config.patterns_url.is_empty() {
            seeds.push((JOB_UPDATE_PATTERNS, 0, 60_000));
        }
        for (job_type, min, max) in seeds {
            if self.scheduler.jobs_of_type(job_type) == 0 {
                self.scheduler
                    .register_job(Job::new(job_type, Value::Null).ready_in(min, max))?;
            }
        }
        Ok(())
    }

    /// Consumes one observer event. Non-`safe-*` events are ignored.
    pub async fn on_page_event(&self, event: PageEvent) -> Result<(), PageVeilError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(PageVeilError::Unloaded);
        }
        match event {
            PageEvent::SafePageNavigation {
                open_pages,
                active_url,
            } => {
                self.pagedb
                    .update_pages(open_pages, active_url.as_deref())
                    .await
            }
            PageEvent::SafeSearchLanding { url } => self.handle_search_landing(&url),
            PageEvent::PageUpdated { .. } => {
                debug!("ignoring page event without the safe- prefix");
                Ok(())
            }
        }
    }

    fn handle_search_landing(&self, url: &str) -> Result<(), PageVeilError> {
        let analysis = self.analyzer.analyze(url);
        let UrlAnalysis::Supported {
            category,
            query,
            doublefetch_request,
        } = analysis
        else {
            debug!("search landing not supported for reporting");
            return Ok(());
        };

        let verdict = check_suspicious_query(&query);
        if !verdict.accept {
            debug!(
                "dropping suspicious query ({})",
                verdict.reason.unwrap_or("unspecified")
            );
            return Ok(());
        }

        let args = QueryDoublefetchArgs {
            category,
            query,
            request: doublefetch_request,
        };
        self.scheduler
            .register_job(Job::new(JOB_DOUBLEFETCH_QUERY, serde_json::to_value(args)?))
    }

    /// Drains runnable jobs, re-arming itself across cooldowns.
    pub async fn process_pending_jobs(self: &Arc<Self>) -> Result<usize, PageVeilError> {
        self.scheduler
            .process_pending_jobs(ProcessOptions {
                max_jobs_to_run: None,
                auto_resume_after_cooldowns: true,
            })
            .await
    }

    /// Flushes everything and deactivates. In-flight handler results are
    /// discarded once the flag flips; the last init/unload call wins.
    pub async fn unload(&self) {
        let _guard = self.lifecycle.lock().await;
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.scheduler.unload().await;
        if let Err(e) = self.pagedb.flush().await {
            warn!("pagedb flush on unload failed: {e}");
        }
        if let Err(e) = self.hashes.flush().await {
            warn!("cooldown flush on unload failed: {e}");
        }
        self.session.unload().await;
        info!("reporting pipeline unloaded");
    }

    pub async fn self_checks(&self) -> SelfCheckResult {
        let mut result = SelfCheckResult::default();
        result.merge(self.session.self_checks());
        result.merge(self.pagedb.self_checks().await);
        result.merge(self.bloom.self_checks().await);
        if self.scheduler.running_total() > 1 {
            result.error("more than one job is marked running");
        }
        result
    }

    // --- component access for hosts and tests ---

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    pub fn pagedb(&self) -> &Arc<PageDb> {
        &self.pagedb
    }

    pub fn patterns(&self) -> &Arc<Patterns> {
        &self.patterns
    }

    pub fn approver(&self) -> &Arc<NewPageApprover> {
        &self.approver
    }

    pub fn alive(&self) -> &Arc<AliveCheck> {
        &self.alive
    }

    pub fn session(&self) -> &Arc<SessionStorageWrapper> {
        &self.session
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
