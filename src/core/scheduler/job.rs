// src/core/scheduler/job.rs

//! Job, configuration and queue-entry types for the scheduler.

use crate::core::clock::ONE_DAY_MS;
use crate::core::errors::PageVeilError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};

/// Hard cap on jobs across every type and state.
pub const GLOBAL_JOB_LIMIT: usize = 10_000;

/// Default per-type cap.
pub const DEFAULT_MAX_JOBS_TOTAL: usize = 1000;

/// Default time-to-live for a registered job.
pub const DEFAULT_TTL_MS: u64 = 7 * ONE_DAY_MS;

/// No TTL may exceed six months, configured or per-job.
pub const MAX_TTL_MS: u64 = 180 * ONE_DAY_MS;

/// Fully resolved per-type scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    /// Higher runs first.
    pub priority: i32,
    pub ttl_in_ms: u64,
    pub max_jobs_total: usize,
    pub cooldown_in_ms: u64,
    pub max_auto_retries_after_error: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            priority: 0,
            ttl_in_ms: DEFAULT_TTL_MS,
            max_jobs_total: DEFAULT_MAX_JOBS_TOTAL,
            cooldown_in_ms: 0,
            max_auto_retries_after_error: 0,
        }
    }
}

impl JobConfig {
    pub fn validate(&self) -> Result<(), PageVeilError> {
        if self.ttl_in_ms == 0 {
            return Err(PageVeilError::BadJobHandler(
                "ttlInMs must be positive".to_string(),
            ));
        }
        if self.max_jobs_total == 0 {
            return Err(PageVeilError::BadJobHandler(
                "maxJobsTotal must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// TTLs above the global cap are clamped, not rejected.
    pub fn clamped(mut self) -> Self {
        self.ttl_in_ms = self.ttl_in_ms.min(MAX_TTL_MS);
        self
    }
}

/// A partial configuration, typically deserialized from the host config.
/// Unknown keys are a hard error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct JobConfigOverride {
    pub priority: Option<i32>,
    pub ttl_in_ms: Option<u64>,
    pub max_jobs_total: Option<usize>,
    pub cooldown_in_ms: Option<u64>,
    pub max_auto_retries_after_error: Option<u32>,
}

impl JobConfigOverride {
    /// Overlays the set fields onto `base`.
    pub fn apply(&self, base: JobConfig) -> JobConfig {
        JobConfig {
            priority: self.priority.unwrap_or(base.priority),
            ttl_in_ms: self.ttl_in_ms.unwrap_or(base.ttl_in_ms),
            max_jobs_total: self.max_jobs_total.unwrap_or(base.max_jobs_total),
            cooldown_in_ms: self.cooldown_in_ms.unwrap_or(base.cooldown_in_ms),
            max_auto_retries_after_error: self
                .max_auto_retries_after_error
                .unwrap_or(base.max_auto_retries_after_error),
        }
    }

    pub fn resolve(&self) -> JobConfig {
        self.apply(JobConfig::default())
    }
}

/// Randomized readiness window relative to registration time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReadyWindow {
    pub min: u64,
    pub max: u64,
}

/// Per-job timing overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct JobTiming {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_in: Option<ReadyWindow>,
}

impl JobTiming {
    pub fn is_empty(&self) -> bool {
        self.ready_at.is_none() && self.expire_at.is_none() && self.ready_in.is_none()
    }
}

/// A unit of deferred work: a registered type plus opaque serializable args.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    #[serde(rename = "type")]
    pub job_type: String,
    pub args: Value,
    #[serde(default, skip_serializing_if = "JobTiming::is_empty")]
    pub timing: JobTiming,
}

impl Job {
    pub fn new(job_type: impl Into<String>, args: Value) -> Self {
        Self {
            job_type: job_type.into(),
            args,
            timing: JobTiming::default(),
        }
    }

    pub fn ready_at(mut self, ready_at: u64) -> Self {
        self.timing.ready_at = Some(ready_at);
        self
    }

    pub fn expire_at(mut self, expire_at: u64) -> Self {
        self.timing.expire_at = Some(expire_at);
        self
    }

    pub fn ready_in(mut self, min: u64, max: u64) -> Self {
        self.timing.ready_in = Some(ReadyWindow { min, max });
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobMeta {
    pub created_at: u64,
    pub ready_at: u64,
    pub expire_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts_left: Option<u32>,
}

/// A job plus its scheduling metadata, living in exactly one queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEntry {
    pub job: Job,
    pub meta: JobMeta,
}

impl JobEntry {
    /// Selection key within a type: `max(createdAt, readyAt)`. Monotone in
    /// time, so relative order between two entries never flips.
    pub fn selection_key(&self) -> u64 {
        self.meta.created_at.max(self.meta.ready_at)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.meta.expire_at
    }

    /// Restore-time validation: ordered timestamps and no creation time from
    /// the future beyond the clock-jump window.
    pub fn validate_on_restore(&self, now_ms: u64) -> Result<(), PageVeilError> {
        if self.meta.created_at > self.meta.ready_at || self.meta.ready_at > self.meta.expire_at {
            return Err(PageVeilError::Corrupted(format!(
                "job '{}' has unordered timestamps",
                self.job.job_type
            )));
        }
        if self.meta.created_at > now_ms + ONE_DAY_MS {
            return Err(PageVeilError::Corrupted(format!(
                "job '{}' was created in the future",
                self.job.job_type
            )));
        }
        Ok(())
    }
}

/// The four per-type queues.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Ready,
    Waiting,
    Retryable,
}

/// Queue map for a single job type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeQueues {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub running: Vec<JobEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ready: Vec<JobEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waiting: Vec<JobEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retryable: Vec<JobEntry>,
}

impl TypeQueues {
    pub fn total(&self) -> usize {
        self.running.len() + self.ready.len() + self.waiting.len() + self.retryable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Inserts keeping the queue sorted ascending by selection key.
    pub fn insert_sorted(queue: &mut Vec<JobEntry>, entry: JobEntry) {
        let key = entry.selection_key();
        let position = queue
            .iter()
            .position(|e| e.selection_key() > key)
            .unwrap_or(queue.len());
        queue.insert(position, entry);
    }
}
