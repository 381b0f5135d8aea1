// src/core/scheduler/mod.rs

//! The persistent job scheduler: per-type priority queues with cooldowns,
//! retries, TTLs and batched persistence.
//!
//! Execution is wrapped in a single executor mutex, so at most one job runs
//! at any instant regardless of how many types are registered. Handlers
//! return follow-up jobs, which are registered after the handler resolves.
//! The full queue map is persisted as one blob through a serialized writer.

pub mod events;
pub mod handler;
pub mod job;

pub use events::{SchedulerEvent, SchedulerEvents};
pub use handler::{JobError, JobHandler};
pub use job::{
    GLOBAL_JOB_LIMIT, Job, JobConfig, JobConfigOverride, JobEntry, JobMeta, JobState, TypeQueues,
};

use crate::core::clock::Clock;
use crate::core::errors::PageVeilError;
use crate::core::random::RandomSource;
use crate::core::storage::kv::KeyValueStore;
use indexmap::IndexMap;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

/// Version embedded in the persisted queue blob.
pub const DB_VERSION: u32 = 1;

/// Hook invoked when a persisted blob carries an older `dbVersion`.
pub type MigrationHook =
    Box<dyn Fn(u32, Value) -> Result<Value, PageVeilError> + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessOptions {
    /// Upper bound on jobs executed in this call. `None` drains everything runnable.
    pub max_jobs_to_run: Option<usize>,
    /// When nothing is runnable but cooled-down types have ready entries,
    /// schedule a re-check at the earliest cooldown expiry.
    pub auto_resume_after_cooldowns: bool,
}

struct HandlerEntry {
    config: JobConfig,
    handler: Arc<dyn JobHandler>,
}

#[derive(Default)]
struct SchedulerState {
    queues: IndexMap<String, TypeQueues>,
    /// Dispatch order among equal-priority types; rotated after every dispatch.
    rotation: Vec<String>,
    /// Per-type cooldown expiry. Never persisted.
    cooldowns: HashMap<String, u64>,
}

/// Result of one dispatch attempt.
struct Picked {
    entry: Option<(String, JobEntry)>,
    /// Earliest cooldown expiry among blocked types that have runnable entries.
    cooldown_hint: Option<u64>,
}

pub struct JobScheduler {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    storage_key: String,
    global_job_limit: usize,
    events: SchedulerEvents,
    handlers: parking_lot::RwLock<HashMap<String, HandlerEntry>>,
    state: parking_lot::Mutex<SchedulerState>,
    /// Held for the whole of `process_pending_jobs`: the "at most one
    /// running job globally" invariant lives here.
    executor: AsyncMutex<()>,
    /// Serialized writer for the persisted blob.
    persist_lock: AsyncMutex<()>,
    migration: Option<MigrationHook>,
    dirty: AtomicBool,
    active: AtomicBool,
    resume_scheduled: AtomicBool,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
        storage_key: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            random,
            storage_key: storage_key.into(),
            global_job_limit: GLOBAL_JOB_LIMIT,
            events: SchedulerEvents::default(),
            handlers: parking_lot::RwLock::new(HashMap::new()),
            state: parking_lot::Mutex::new(SchedulerState::default()),
            executor: AsyncMutex::new(()),
            persist_lock: AsyncMutex::new(()),
            migration: None,
            dirty: AtomicBool::new(false),
            active: AtomicBool::new(true),
            resume_scheduled: AtomicBool::new(false),
        }
    }

    /// Installs the version migration hook. Must be set before `load`.
    pub fn set_migration(&mut self, hook: MigrationHook) {
        self.migration = Some(hook);
    }

    /// Replaces the global cap. Embedders with tighter memory budgets may
    /// lower it; the default is `GLOBAL_JOB_LIMIT`.
    pub fn with_global_job_limit(mut self, limit: usize) -> Self {
        self.global_job_limit = limit;
        self
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Registers the handler for a job type with its fully resolved config.
    pub fn register_handler(
        &self,
        job_type: &str,
        config: JobConfig,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), PageVeilError> {
        if job_type.is_empty() {
            return Err(PageVeilError::BadJobHandler(
                "job type must not be empty".to_string(),
            ));
        }
        config.validate()?;
        let config = config.clamped();
        let mut handlers = self.handlers.write();
        if handlers.contains_key(job_type) {
            return Err(PageVeilError::BadJobHandler(format!(
                "handler for '{job_type}' is already registered"
            )));
        }
        handlers.insert(job_type.to_string(), HandlerEntry { config, handler });
        drop(handlers);

        let mut state = self.state.lock();
        state.queues.entry(job_type.to_string()).or_default();
        if !state.rotation.iter().any(|t| t == job_type) {
            state.rotation.push(job_type.to_string());
        }
        Ok(())
    }

    /// Admits a job into its type's queues. Fails with `BadJob` for
    /// construction errors and `JobRejected` when no capacity can be freed.
    pub fn register_job(&self, job: Job) -> Result<(), PageVeilError> {
        let now = self.clock.now_ms();
        let config = {
            let handlers = self.handlers.read();
            let Some(entry) = handlers.get(&job.job_type) else {
                return Err(PageVeilError::BadJob(format!(
                    "no handler registered for job type '{}'",
                    job.job_type
                )));
            };
            entry.config.clone()
        };

        let meta = self.build_meta(&job, &config, now)?;
        let mut pending_events: Vec<SchedulerEvent> = Vec::new();
        let admitted = {
            let mut state = self.state.lock();
            let global_total: usize = state.queues.values().map(TypeQueues::total).sum();
            if global_total >= self.global_job_limit {
                pending_events.push(SchedulerEvent::JobRejected {
                    job_type: job.job_type.clone(),
                    reason: "global job limit reached".to_string(),
                });
                false
            } else {
                let queues = state.queues.entry(job.job_type.clone()).or_default();
                if queues.total() >= config.max_jobs_total {
                    Self::expire_queue_heads(queues, now, &job.job_type, &mut pending_events);
                }
                if queues.total() >= config.max_jobs_total && !queues.retryable.is_empty() {
                    queues.retryable.remove(0);
                    pending_events.push(SchedulerEvent::JobRejected {
                        job_type: job.job_type.clone(),
                        reason: "evicted oldest retryable job to admit a new one".to_string(),
                    });
                }
                if queues.total() >= config.max_jobs_total {
                    pending_events.push(SchedulerEvent::JobRejected {
                        job_type: job.job_type.clone(),
                        reason: "per-type job limit reached".to_string(),
                    });
                    false
                } else {
                    let job_type = job.job_type.clone();
                    let entry = JobEntry { job, meta };
                    if entry.meta.ready_at <= now {
                        TypeQueues::insert_sorted(&mut queues.ready, entry);
                    } else {
                        TypeQueues::insert_sorted(&mut queues.waiting, entry);
                    }
                    pending_events.push(SchedulerEvent::JobRegistered { job_type });
                    true
                }
            }
        };

        for event in pending_events {
            self.events.publish(event);
        }
        if admitted {
            self.dirty.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(PageVeilError::JobRejected(
                "job limits exhausted".to_string(),
            ))
        }
    }

    fn build_meta(
        &self,
        job: &Job,
        config: &JobConfig,
        now: u64,
    ) -> Result<JobMeta, PageVeilError> {
        let created_at = now;
        let ready_at = if let Some(ready_at) = job.timing.ready_at {
            ready_at.max(created_at)
        } else if let Some(window) = job.timing.ready_in {
            if window.min > window.max {
                return Err(PageVeilError::BadJob(format!(
                    "readyIn window is inverted ({} > {})",
                    window.min, window.max
                )));
            }
            created_at + self.random.uniform(window.min as f64, window.max as f64).ceil() as u64
        } else {
            created_at
        };
        let expire_at = job
            .timing
            .expire_at
            .unwrap_or_else(|| created_at.saturating_add(config.ttl_in_ms))
            .min(created_at.saturating_add(job::MAX_TTL_MS));
        if expire_at < ready_at {
            return Err(PageVeilError::BadJob(format!(
                "job '{}' would expire at {expire_at} before becoming ready at {ready_at}",
                job.job_type
            )));
        }
        Ok(JobMeta {
            created_at,
            ready_at,
            expire_at,
            attempts_left: None,
        })
    }

    /// Drops expired entries from the head of every non-running queue.
    fn expire_queue_heads(
        queues: &mut TypeQueues,
        now: u64,
        job_type: &str,
        events: &mut Vec<SchedulerEvent>,
    ) {
        for queue in [
            &mut queues.ready,
            &mut queues.waiting,
            &mut queues.retryable,
        ] {
            while queue.first().is_some_and(|e| e.is_expired(now)) {
                queue.remove(0);
                events.push(SchedulerEvent::JobExpired {
                    job_type: job_type.to_string(),
                });
            }
        }
    }

    /// Selects the next runnable entry and moves it into `running`.
    fn pick_next(&self, now: u64) -> Picked {
        let handlers = self.handlers.read();
        let mut state = self.state.lock();
        let mut events: Vec<SchedulerEvent> = Vec::new();

        // Priority first; rotation order breaks ties (stable sort).
        let mut order = state.rotation.clone();
        order.sort_by_key(|t| {
            std::cmp::Reverse(handlers.get(t).map(|h| h.config.priority).unwrap_or(0))
        });

        let mut cooldown_hint: Option<u64> = None;
        let mut picked: Option<(String, JobEntry)> = None;

        for job_type in order {
            let cooldown_until = state.cooldowns.get(&job_type).copied().unwrap_or(0);
            let Some(queues) = state.queues.get_mut(&job_type) else {
                continue;
            };
            Self::expire_queue_heads(queues, now, &job_type, &mut events);

            // Promote waiting entries that became due.
            while queues.waiting.first().is_some_and(|e| e.meta.ready_at <= now) {
                let entry = queues.waiting.remove(0);
                TypeQueues::insert_sorted(&mut queues.ready, entry);
            }

            let runnable = !queues.ready.is_empty() || !queues.retryable.is_empty();
            if !runnable {
                continue;
            }
            if cooldown_until > now {
                cooldown_hint = Some(cooldown_hint.map_or(cooldown_until, |h| h.min(cooldown_until)));
                continue;
            }

            // Ready entries precede retries; retries are a last-resort source.
            let entry = if !queues.ready.is_empty() {
                queues.ready.remove(0)
            } else {
                queues.retryable.remove(0)
            };
            queues.running.push(entry.clone());
            picked = Some((job_type, entry));
            break;
        }
        drop(state);
        drop(handlers);

        if !events.is_empty() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        for event in events {
            self.events.publish(event);
        }

        Picked {
            entry: picked,
            cooldown_hint,
        }
    }

    fn remove_running(&self, job_type: &str, entry: &JobEntry) {
        let mut state = self.state.lock();
        if let Some(queues) = state.queues.get_mut(job_type)
            && let Some(position) = queues.running.iter().position(|e| e == entry)
        {
            queues.running.remove(position);
        }
    }

    /// Runs ready jobs until nothing is runnable or the budget is spent.
    pub async fn process_pending_jobs(
        self: &Arc<Self>,
        opts: ProcessOptions,
    ) -> Result<usize, PageVeilError> {
        let _exec = self.executor.lock().await;
        let budget = opts.max_jobs_to_run.unwrap_or(usize::MAX);
        let mut jobs_run = 0usize;

        while jobs_run < budget && self.active.load(Ordering::SeqCst) {
            let now = self.clock.now_ms();
            let picked = self.pick_next(now);
            let Some((job_type, entry)) = picked.entry else {
                if opts.auto_resume_after_cooldowns
                    && let Some(resume_at) = picked.cooldown_hint
                {
                    self.schedule_resume(resume_at);
                }
                break;
            };

            // Round-robin fairness among equal-priority types.
            {
                let mut state = self.state.lock();
                if let Some(last) = state.rotation.pop() {
                    state.rotation.insert(0, last);
                }
            }

            self.events.publish(SchedulerEvent::JobStarted {
                job_type: job_type.clone(),
            });

            let handler = {
                let handlers = self.handlers.read();
                handlers
                    .get(&job_type)
                    .map(|h| (h.config.clone(), Arc::clone(&h.handler)))
            };
            let Some((config, handler)) = handler else {
                warn!("handler for '{job_type}' vanished mid-dispatch; dropping job");
                self.remove_running(&job_type, &entry);
                continue;
            };

            let result = handler.run(&entry.job).await;
            self.remove_running(&job_type, &entry);
            self.dirty.store(true, Ordering::SeqCst);
            jobs_run += 1;

            if !self.active.load(Ordering::SeqCst) {
                // Unloaded while the handler ran; its outcome is discarded.
                break;
            }

            if config.cooldown_in_ms > 0 {
                let until = self.clock.now_ms() + config.cooldown_in_ms;
                self.state.lock().cooldowns.insert(job_type.clone(), until);
            }

            match result {
                Ok(follow_ups) => {
                    // A success unblocks one stuck retry of the same type.
                    {
                        let mut state = self.state.lock();
                        if let Some(queues) = state.queues.get_mut(&job_type)
                            && !queues.retryable.is_empty()
                        {
                            let entry = queues.retryable.remove(0);
                            TypeQueues::insert_sorted(&mut queues.ready, entry);
                        }
                    }
                    self.events.publish(SchedulerEvent::JobSucceeded {
                        job_type: job_type.clone(),
                    });
                    for follow_up in follow_ups {
                        if let Err(e) = self.register_job(follow_up) {
                            warn!("failed to register follow-up of '{job_type}': {e}");
                        }
                    }
                }
                Err(JobError::Recoverable(message)) => {
                    let attempts = entry
                        .meta
                        .attempts_left
                        .unwrap_or(config.max_auto_retries_after_error);
                    if attempts > 0 {
                        let mut retry = entry.clone();
                        retry.meta.attempts_left = Some(attempts - 1);
                        {
                            let mut state = self.state.lock();
                            if let Some(queues) = state.queues.get_mut(&job_type) {
                                queues.retryable.push(retry);
                            }
                        }
                        self.events.publish(SchedulerEvent::JobFailed {
                            job_type: job_type.clone(),
                            pending_retry: true,
                            error: message,
                        });
                    } else {
                        warn!("job '{job_type}' exhausted its retries: {message}");
                        self.events.publish(SchedulerEvent::JobFailed {
                            job_type: job_type.clone(),
                            pending_retry: false,
                            error: message,
                        });
                    }
                }
                Err(JobError::Permanent(message)) => {
                    error!("job '{job_type}' failed permanently: {message}");
                    self.events.publish(SchedulerEvent::JobFailed {
                        job_type: job_type.clone(),
                        pending_retry: false,
                        error: message,
                    });
                }
            }
        }
        drop(_exec);

        self.sync_to_disk().await?;
        Ok(jobs_run)
    }

    fn schedule_resume(self: &Arc<Self>, resume_at_ms: u64) {
        if self.resume_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let delay = resume_at_ms.saturating_sub(self.clock.now_ms()).max(1);
        debug!("scheduling cooldown re-check in {delay}ms");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            this.resume_scheduled.store(false, Ordering::SeqCst);
            if this.active.load(Ordering::SeqCst) {
                let opts = ProcessOptions {
                    max_jobs_to_run: None,
                    auto_resume_after_cooldowns: true,
                };
                if let Err(e) = this.process_pending_jobs(opts).await {
                    warn!("cooldown re-check failed: {e}");
                }
            }
        });
    }

    /// Restores the queue map from storage. Handlers must already be
    /// registered; entries of unknown types, corrupted entries and entries
    /// created in the future are dropped. The `running` queue is always
    /// cleared: an interrupted job will be re-enqueued by its originator if
    /// it is repeatable.
    pub async fn load(&self) -> Result<(), PageVeilError> {
        let Some(mut value) = self.store.get(&self.storage_key).await? else {
            return Ok(());
        };
        let now = self.clock.now_ms();
        let version = value
            .get("dbVersion")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        if version != DB_VERSION {
            match &self.migration {
                Some(migrate) => {
                    info!("migrating job queues from dbVersion {version} to {DB_VERSION}");
                    value = migrate(version, value)?;
                }
                None => {
                    warn!("persisted job queues have dbVersion {version}; discarding them");
                    self.store.delete(&self.storage_key).await?;
                    return Ok(());
                }
            }
        }
        let Some(queue_map) = value.get("jobQueues").and_then(Value::as_object) else {
            warn!("persisted job queues blob has no jobQueues map; discarding it");
            self.store.delete(&self.storage_key).await?;
            return Ok(());
        };

        let handlers = self.handlers.read();
        let mut state = self.state.lock();
        for (job_type, queues_value) in queue_map {
            if !handlers.contains_key(job_type) {
                warn!("dropping persisted jobs of unknown type '{job_type}'");
                continue;
            }
            let mut restored = TypeQueues::default();
            let parsed: TypeQueues = match serde_json::from_value(queues_value.clone()) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("dropping corrupted queues for '{job_type}': {e}");
                    continue;
                }
            };
            // Interrupted running jobs are not resumed.
            for (source, target) in [
                (parsed.ready, &mut restored.ready),
                (parsed.waiting, &mut restored.waiting),
                (parsed.retryable, &mut restored.retryable),
            ] {
                for entry in source {
                    match entry.validate_on_restore(now) {
                        Ok(()) => TypeQueues::insert_sorted(target, entry),
                        Err(e) => warn!("dropping persisted job of '{job_type}': {e}"),
                    }
                }
            }
            state.queues.insert(job_type.clone(), restored);
        }
        drop(state);
        drop(handlers);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Writes the queue map through the serialized writer. A failed write
    /// re-flags the state dirty so the next call retries.
    pub async fn sync_to_disk(&self) -> Result<(), PageVeilError> {
        let _guard = self.persist_lock.lock().await;
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let blob = {
            let state = self.state.lock();
            json!({
                "dbVersion": DB_VERSION,
                "jobQueues": serde_json::to_value(&state.queues)?,
            })
        };
        if let Err(e) = self.store.set(&self.storage_key, blob).await {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        self.events.publish(SchedulerEvent::SyncedToDisk);
        Ok(())
    }

    /// Stops dispatching and persists the queues a final time.
    pub async fn unload(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Err(e) = self.sync_to_disk().await {
            warn!("final job queue sync failed: {e}");
        }
    }

    // --- Introspection (used by orchestrator status and tests) ---

    pub fn total_jobs(&self) -> usize {
        self.state.lock().queues.values().map(TypeQueues::total).sum()
    }

    pub fn jobs_of_type(&self, job_type: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(job_type)
            .map(TypeQueues::total)
            .unwrap_or(0)
    }

    pub fn jobs_in_state(&self, job_type: &str, job_state: JobState) -> usize {
        let state = self.state.lock();
        state
            .queues
            .get(job_type)
            .map(|q| match job_state {
                JobState::Running => q.running.len(),
                JobState::Ready => q.ready.len(),
                JobState::Waiting => q.waiting.len(),
                JobState::Retryable => q.retryable.len(),
            })
            .unwrap_or(0)
    }

    pub fn running_total(&self) -> usize {
        self.state
            .lock()
            .queues
            .values()
            .map(|q| q.running.len())
            .sum()
    }

    /// Expired-entry cleanup outside of dispatch, used by hosts that want
    /// eager expiry. Returns how many entries were dropped.
    pub fn expire_pending(&self) -> usize {
        let now = self.clock.now_ms();
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let types: Vec<String> = state.queues.keys().cloned().collect();
            for job_type in types {
                if let Some(queues) = state.queues.get_mut(&job_type) {
                    Self::expire_queue_heads(queues, now, &job_type, &mut events);
                }
            }
        }
        let count = events.len();
        for event in events {
            self.events.publish(event);
        }
        if count > 0 {
            self.dirty.store(true, Ordering::SeqCst);
        }
        count
    }
}
