// src/core/scheduler/events.rs

//! Observer bus for scheduler lifecycle events, built on a broadcast
//! channel so any number of observers can watch without back-pressure on
//! the scheduler.

use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the observer channel. Large enough that a burst of job
/// completions does not lag a slow observer.
const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    JobRegistered {
        job_type: String,
    },
    JobStarted {
        job_type: String,
    },
    JobSucceeded {
        job_type: String,
    },
    JobFailed {
        job_type: String,
        pending_retry: bool,
        error: String,
    },
    JobExpired {
        job_type: String,
    },
    JobRejected {
        job_type: String,
        reason: String,
    },
    SyncedToDisk,
}

#[derive(Debug)]
pub struct SchedulerEvents {
    sender: broadcast::Sender<SchedulerEvent>,
}

impl Default for SchedulerEvents {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }
}

impl SchedulerEvents {
    pub fn publish(&self, event: SchedulerEvent) {
        if self.sender.send(event).is_err() {
            debug!("scheduler event published with no active observers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }
}
