// src/core/clock.rs

//! Injected time sources. The pipeline never reads the system clock
//! directly; every component takes an `Arc<dyn Clock>` so tests run with a
//! fully deterministic timeline.

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// One day in milliseconds, the window used for clock-jump defense on restore.
pub const ONE_DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// A monotonic-enough wall clock reporting epoch milliseconds.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> u64;
}

/// Production clock backed by `SystemTime`.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A hand-driven clock for tests. `advance` and `set` make timer-dependent
/// behavior (cooldowns, TTLs, rotations) fully reproducible.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// The server-attested clock used for message timestamps. Kept separate from
/// `Clock` so a skewed local clock cannot leak into outgoing payloads.
pub trait TrustedClock: Send + Sync {
    /// The current day as `YYYYMMDD`.
    fn time_as_yyyymmdd(&self) -> String;
    /// The current hour as `YYYYMMDDHH`.
    fn time_as_yyyymmddhh(&self) -> String;
}

/// A `TrustedClock` derived from the injected local clock. Hosts that have a
/// server-synchronized time source should supply their own implementation.
pub struct LocalTrustedClock {
    clock: Arc<dyn Clock>,
}

impl LocalTrustedClock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn utc_now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.clock.now_ms() as i64).unwrap_or_default()
    }
}

impl TrustedClock for LocalTrustedClock {
    fn time_as_yyyymmdd(&self) -> String {
        self.utc_now().format("%Y%m%d").to_string()
    }

    fn time_as_yyyymmddhh(&self) -> String {
        self.utc_now().format("%Y%m%d%H").to_string()
    }
}

/// Milliseconds from `now_ms` until the next UTC midnight.
pub fn time_to_next_utc_midnight_ms(now_ms: u64) -> u64 {
    let now = DateTime::<Utc>::from_timestamp_millis(now_ms as i64).unwrap_or_default();
    let midnight = (now + ChronoDuration::days(1))
        .with_hour(0)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    (midnight.timestamp_millis() as u64).saturating_sub(now_ms)
}
