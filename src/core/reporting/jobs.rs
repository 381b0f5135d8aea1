// src/core/reporting/jobs.rs

//! Job handlers wiring the pipeline stages together, plus the cookie-free
//! doublefetch client they share.
//!
//! Stages hand work to each other exclusively through follow-up jobs, so
//! every transition survives a restart and respects the scheduler's
//! priorities and cooldowns.

use crate::core::errors::PageVeilError;
use crate::core::fingerprint::stable_stringify;
use crate::core::pagedb::{AcquireOptions, PageDb, PageEntry};
use crate::core::patterns::{DoublefetchRequest, Patterns, PatternsUpdater};
use crate::core::quorum::QuorumChecker;
use crate::core::reporting::alive::AliveCheck;
use crate::core::reporting::messages::{CountryProvider, MessageFactory, REDACTED, Transport};
use crate::core::scheduler::{Job, JobError, JobHandler};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// Job type names. One registered handler each.
pub const JOB_COLLECT_EXPIRED_PAGES: &str = "collect-expired-pages";
pub const JOB_DOUBLEFETCH_PAGE: &str = "doublefetch-page";
pub const JOB_DOUBLEFETCH_QUERY: &str = "doublefetch-query";
pub const JOB_PAGE_QUORUM_CHECK: &str = "page-quorum-check";
pub const JOB_SEND_MESSAGE: &str = "send-message";
pub const JOB_UPDATE_PATTERNS: &str = "update-patterns";
pub const JOB_ALIVE_MESSAGE: &str = "alive-message";

/// Bodies above this size abort the doublefetch.
pub const MAX_DOUBLEFETCH_BODY_BYTES: usize = 2 * 1024 * 1024;

const DOUBLEFETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// How soon the recurring collectors re-arm themselves, in milliseconds.
const COLLECT_INTERVAL: (u64, u64) = (60_000, 5 * 60_000);
const PATTERNS_INTERVAL: (u64, u64) = (60 * 60_000, 2 * 60 * 60_000);
const ALIVE_INTERVAL: (u64, u64) = (60 * 60_000, 90 * 60_000);

#[derive(Debug, Clone)]
pub struct DoublefetchResponse {
    pub status: u16,
    pub final_url: String,
    pub body: String,
}

/// The fetch seam. Browser hosts route doublefetches through their own
/// fetch layer; the built-in `DoublefetchClient` covers everything else.
#[async_trait]
pub trait Doublefetcher: Send + Sync {
    async fn fetch(
        &self,
        request: &DoublefetchRequest,
    ) -> Result<DoublefetchResponse, PageVeilError>;
}

/// The second, cookie-free fetch of a landing URL. reqwest keeps no cookie
/// store unless asked for one, which is exactly the isolation doublefetch
/// needs; redirect behavior is the only per-request knob.
pub struct DoublefetchClient {
    follow: reqwest::Client,
    no_follow: reqwest::Client,
}

impl DoublefetchClient {
    pub fn new() -> Result<Self, PageVeilError> {
        let follow = reqwest::Client::builder()
            .timeout(DOUBLEFETCH_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        let no_follow = reqwest::Client::builder()
            .timeout(DOUBLEFETCH_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { follow, no_follow })
    }

    pub async fn fetch(
        &self,
        request: &DoublefetchRequest,
    ) -> Result<DoublefetchResponse, PageVeilError> {
        let client = if request.follow_redirects() {
            &self.follow
        } else {
            &self.no_follow
        };
        let mut builder = client.get(&request.url);
        if let Some(headers) = request.headers() {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    builder = builder.header(name, value);
                }
            }
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        if !(200..300).contains(&status) {
            return Err(PageVeilError::HttpClientError(format!(
                "doublefetch returned status {status}"
            )));
        }
        if response
            .content_length()
            .is_some_and(|len| len as usize > MAX_DOUBLEFETCH_BODY_BYTES)
        {
            return Err(PageVeilError::HttpClientError(
                "doublefetch body exceeds the size limit".to_string(),
            ));
        }
        let body = if request.wants_empty_html() {
            String::new()
        } else {
            let text = response.text().await?;
            if text.len() > MAX_DOUBLEFETCH_BODY_BYTES {
                return Err(PageVeilError::HttpClientError(
                    "doublefetch body exceeds the size limit".to_string(),
                ));
            }
            text
        };
        Ok(DoublefetchResponse {
            status,
            final_url,
            body,
        })
    }
}

#[async_trait]
impl Doublefetcher for DoublefetchClient {
    async fn fetch(
        &self,
        request: &DoublefetchRequest,
    ) -> Result<DoublefetchResponse, PageVeilError> {
        DoublefetchClient::fetch(self, request).await
    }
}

// --- job argument shapes ---

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryDoublefetchArgs {
    pub category: String,
    pub query: String,
    pub request: DoublefetchRequest,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuorumCheckArgs {
    #[serde(rename = "quorumText")]
    pub quorum_text: String,
    pub action: String,
    pub payload: Value,
}

// --- handlers ---

/// Pops expired pages out of PageDB and fans them out as doublefetch jobs.
/// Re-arms itself with a jittered delay.
pub struct CollectExpiredPagesHandler {
    pagedb: Arc<PageDb>,
    options: AcquireOptions,
}

impl CollectExpiredPagesHandler {
    pub fn new(pagedb: Arc<PageDb>, options: AcquireOptions) -> Self {
        Self { pagedb, options }
    }
}

#[async_trait]
impl JobHandler for CollectExpiredPagesHandler {
    async fn run(&self, _job: &Job) -> Result<Vec<Job>, JobError> {
        let promoted = self
            .pagedb
            .acquire_expired_pages(self.options)
            .await
            .map_err(|e| JobError::recoverable(e.to_string()))?;
        let mut follow_ups: Vec<Job> = promoted
            .into_iter()
            .filter_map(|page| match serde_json::to_value(&page) {
                Ok(args) => Some(Job::new(JOB_DOUBLEFETCH_PAGE, args)),
                Err(e) => {
                    warn!("failed to serialize promoted page: {e}");
                    None
                }
            })
            .collect();
        follow_ups.push(
            Job::new(JOB_COLLECT_EXPIRED_PAGES, Value::Null)
                .ready_in(COLLECT_INTERVAL.0, COLLECT_INTERVAL.1),
        );
        Ok(follow_ups)
    }
}

/// Doublefetches a promoted page and runs the `page` rule over the result.
pub struct DoublefetchPageHandler {
    patterns: Arc<Patterns>,
    client: Arc<dyn Doublefetcher>,
}

impl DoublefetchPageHandler {
    pub fn new(patterns: Arc<Patterns>, client: Arc<dyn Doublefetcher>) -> Self {
        Self { patterns, client }
    }
}

#[async_trait]
impl JobHandler for DoublefetchPageHandler {
    async fn run(&self, job: &Job) -> Result<Vec<Job>, JobError> {
        let page: PageEntry = serde_json::from_value(job.args.clone())
            .map_err(|e| JobError::permanent(format!("bad doublefetch-page args: {e}")))?;

        let Some(request) = self.patterns.create_doublefetch_request("page", &page.url) else {
            debug!("no page doublefetch rule loaded; dropping {}", page.url);
            return Ok(vec![]);
        };
        let response = self
            .client
            .fetch(&request)
            .await
            .map_err(|e| JobError::recoverable(e.to_string()))?;

        let Some(snapshot) = self.patterns.snapshot() else {
            return Ok(vec![]);
        };
        let Some(rule) = snapshot.rule("page") else {
            return Ok(vec![]);
        };

        let mut context = Map::new();
        context.insert("url".to_string(), Value::String(response.final_url.clone()));
        context.insert("originalUrl".to_string(), Value::String(page.url.clone()));
        context.insert("title".to_string(), Value::String(page.title.clone()));
        if let Some(lang) = &page.lang {
            context.insert("lang".to_string(), Value::String(lang.clone()));
        }
        if let Some(referrer) = &page.referrer {
            context.insert("ref".to_string(), Value::String(referrer.clone()));
        }
        context.insert("html".to_string(), Value::String(response.body));

        let payload = match rule.evaluate(&context) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!("page rule produced no message for {}", page.url);
                return Ok(vec![]);
            }
            Err(e) => {
                warn!("page rule aborted for {}: {e}", page.url);
                return Ok(vec![]);
            }
        };

        let ballot = json!({ "page": page.url });
        let args = QuorumCheckArgs {
            quorum_text: stable_stringify(&ballot),
            action: "page".to_string(),
            payload: Value::Object(payload),
        };
        Ok(vec![Job::new(
            JOB_PAGE_QUORUM_CHECK,
            serde_json::to_value(args)
                .map_err(|e| JobError::permanent(e.to_string()))?,
        )])
    }
}

/// Doublefetches a recognized SERP and runs its category rule.
pub struct DoublefetchQueryHandler {
    patterns: Arc<Patterns>,
    client: Arc<dyn Doublefetcher>,
}

impl DoublefetchQueryHandler {
    pub fn new(patterns: Arc<Patterns>, client: Arc<dyn Doublefetcher>) -> Self {
        Self { patterns, client }
    }
}

#[async_trait]
impl JobHandler for DoublefetchQueryHandler {
    async fn run(&self, job: &Job) -> Result<Vec<Job>, JobError> {
        let args: QueryDoublefetchArgs = serde_json::from_value(job.args.clone())
            .map_err(|e| JobError::permanent(format!("bad doublefetch-query args: {e}")))?;

        let response = self
            .client
            .fetch(&args.request)
            .await
            .map_err(|e| JobError::recoverable(e.to_string()))?;

        let Some(snapshot) = self.patterns.snapshot() else {
            return Ok(vec![]);
        };
        let Some(rule) = snapshot.rule(&args.category) else {
            debug!("no rule for category {}; dropping query", args.category);
            return Ok(vec![]);
        };

        let mut context = Map::new();
        context.insert("url".to_string(), Value::String(response.final_url));
        context.insert("qurl".to_string(), Value::String(args.request.url.clone()));
        context.insert("query".to_string(), Value::String(args.query.clone()));
        context.insert("html".to_string(), Value::String(response.body));

        let payload = match rule.evaluate(&context) {
            Ok(Some(payload)) => payload,
            Ok(None) => return Ok(vec![]),
            Err(e) => {
                warn!("rule '{}' aborted: {e}", args.category);
                return Ok(vec![]);
            }
        };

        let ballot = json!({ "category": args.category.clone(), "q": args.query.clone() });
        let check = QuorumCheckArgs {
            quorum_text: stable_stringify(&ballot),
            action: args.category,
            payload: Value::Object(payload),
        };
        Ok(vec![Job::new(
            JOB_PAGE_QUORUM_CHECK,
            serde_json::to_value(check)
                .map_err(|e| JobError::permanent(e.to_string()))?,
        )])
    }
}

/// Releases a record only with quorum consent, then assembles the envelope.
pub struct QuorumCheckHandler {
    quorum: Arc<QuorumChecker>,
    factory: Arc<MessageFactory>,
    patterns: Arc<Patterns>,
    country: Arc<dyn CountryProvider>,
}

impl QuorumCheckHandler {
    pub fn new(
        quorum: Arc<QuorumChecker>,
        factory: Arc<MessageFactory>,
        patterns: Arc<Patterns>,
        country: Arc<dyn CountryProvider>,
    ) -> Self {
        Self {
            quorum,
            factory,
            patterns,
            country,
        }
    }
}

#[async_trait]
impl JobHandler for QuorumCheckHandler {
    async fn run(&self, job: &Job) -> Result<Vec<Job>, JobError> {
        let args: QuorumCheckArgs = serde_json::from_value(job.args.clone())
            .map_err(|e| JobError::permanent(format!("bad quorum-check args: {e}")))?;

        let consent = self
            .quorum
            .check_text(&args.quorum_text)
            .await
            .map_err(|e| JobError::recoverable(e.to_string()))?;
        if !consent {
            debug!("quorum refused '{}' message; dropping it", args.action);
            return Ok(vec![]);
        }

        let ver = self.patterns.snapshot().map(|s| s.version).unwrap_or(0);
        let ctry = match self.country.current_country().await {
            Ok(raw) => self.factory.sanitize_country(&raw),
            Err(_) => REDACTED.to_string(),
        };
        let ts = self.factory.day_timestamp();
        let message = self.factory.build(&args.action, ver, &ctry, &ts, args.payload);
        Ok(vec![Job::new(JOB_SEND_MESSAGE, message)])
    }
}

/// Hands a finished message to the transport.
pub struct SendMessageHandler {
    transport: Arc<dyn Transport>,
}

impl SendMessageHandler {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl JobHandler for SendMessageHandler {
    async fn run(&self, job: &Job) -> Result<Vec<Job>, JobError> {
        self.transport
            .send(job.args.clone())
            .await
            .map_err(|e| JobError::recoverable(e.to_string()))?;
        Ok(vec![])
    }
}

/// Downloads fresh pattern rules and re-arms itself.
pub struct UpdatePatternsHandler {
    updater: Arc<PatternsUpdater>,
}

impl UpdatePatternsHandler {
    pub fn new(updater: Arc<PatternsUpdater>) -> Self {
        Self { updater }
    }
}

#[async_trait]
impl JobHandler for UpdatePatternsHandler {
    async fn run(&self, _job: &Job) -> Result<Vec<Job>, JobError> {
        let next = Job::new(JOB_UPDATE_PATTERNS, Value::Null)
            .ready_in(PATTERNS_INTERVAL.0, PATTERNS_INTERVAL.1);
        match self.updater.update().await {
            Ok(status) => {
                debug!("pattern update finished: {status}");
                Ok(vec![next])
            }
            Err(e) => {
                // The previous snapshot stays active; try again later.
                warn!("pattern update failed: {e}");
                Ok(vec![next])
            }
        }
    }
}

/// Emits the periodic alive ping and re-arms itself.
pub struct AliveMessageHandler {
    alive: Arc<AliveCheck>,
    factory: Arc<MessageFactory>,
    country: Arc<dyn CountryProvider>,
}

impl AliveMessageHandler {
    pub fn new(
        alive: Arc<AliveCheck>,
        factory: Arc<MessageFactory>,
        country: Arc<dyn CountryProvider>,
    ) -> Self {
        Self {
            alive,
            factory,
            country,
        }
    }
}

#[async_trait]
impl JobHandler for AliveMessageHandler {
    async fn run(&self, _job: &Job) -> Result<Vec<Job>, JobError> {
        let ctry = match self.country.current_country().await {
            Ok(raw) => self.factory.sanitize_country(&raw),
            Err(_) => REDACTED.to_string(),
        };
        let hour = self.factory.hour_timestamp();
        let message = self
            .alive
            .generate_message(&ctry, &hour)
            .await
            .map_err(|e| JobError::recoverable(e.to_string()))?;
        Ok(vec![
            Job::new(JOB_SEND_MESSAGE, message),
            Job::new(JOB_ALIVE_MESSAGE, Value::Null)
                .ready_in(ALIVE_INTERVAL.0, ALIVE_INTERVAL.1),
        ])
    }
}
