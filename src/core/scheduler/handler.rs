// src/core/scheduler/handler.rs

//! The handler contract: one registered implementation per job type.

use crate::core::scheduler::job::Job;
use async_trait::async_trait;
use thiserror::Error;

/// Failure modes a handler may report. Recoverable errors requeue the job
/// for retry (bounded by `maxAutoRetriesAfterError`); permanent errors drop
/// it with a log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("recoverable job error: {0}")]
    Recoverable(String),

    #[error("permanent job error: {0}")]
    Permanent(String),
}

impl JobError {
    pub fn recoverable(msg: impl Into<String>) -> Self {
        JobError::Recoverable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        JobError::Permanent(msg.into())
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, JobError::Recoverable(_))
    }
}

/// A job handler. Returned jobs are registered after the handler resolves,
/// which is how one pipeline stage feeds the next. Handlers must not call
/// back into `process_pending_jobs`; the executor lock is held while they
/// run.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &Job) -> Result<Vec<Job>, JobError>;
}
