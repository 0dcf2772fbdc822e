//! Readiness polling against freshly fetched remote state.
//!
//! [`wait_until`] re-fetches a snapshot, reports a progress tick, and
//! evaluates a predicate until it holds. All waiting goes through a
//! [`Clock`] so the loop can be driven deterministically in tests.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Default interval between polls.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;

/// Source of time for polling and settle delays.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Suspend for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock: `sleep` returns immediately and advances time.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    /// Create a clock starting at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Virtual time elapsed so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every sleep requested, in order.
    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        *self.elapsed.lock().unwrap_or_else(PoisonError::into_inner) += duration;
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
    }
}

/// Polling budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between fetches.
    pub interval: Duration,
    /// Give up once this much time has passed. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Give up after this many fetches. `None` means no cap.
    pub max_attempts: Option<u32>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            timeout: None,
            max_attempts: None,
        }
    }
}

impl PollConfig {
    /// Set the overall timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the attempt cap.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    fn exhausted(&self, attempts: u32, elapsed: Duration) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
            || self.timeout.is_some_and(|timeout| elapsed >= timeout)
    }
}

/// Errors that end a poll.
#[derive(Error, Debug)]
pub enum PollError<E> {
    /// Fetching the snapshot failed.
    #[error("{0}")]
    Fetch(#[source] E),

    /// The budget ran out before the condition held.
    #[error("condition not met after {attempts} attempts ({}s)", .elapsed.as_secs())]
    Exhausted { attempts: u32, elapsed: Duration },
}

/// Poll `fetch` until `predicate` holds for the fetched snapshot.
///
/// `on_tick` runs once per fetched snapshot, including the final one.
/// It only reports progress and cannot influence the loop.
///
/// # Errors
/// Returns [`PollError::Fetch`] as soon as a fetch fails, or
/// [`PollError::Exhausted`] when the configured budget runs out.
pub async fn wait_until<T, E, F, Fut, P>(
    clock: &dyn Clock,
    config: &PollConfig,
    mut fetch: F,
    predicate: P,
    on_tick: &(dyn Fn() + Sync),
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&T) -> bool,
{
    let start = clock.now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let snapshot = fetch().await.map_err(PollError::Fetch)?;
        on_tick();

        if predicate(&snapshot) {
            debug!(attempts, "Poll condition met");
            return Ok(snapshot);
        }

        let elapsed = clock.now().saturating_duration_since(start);
        if config.exhausted(attempts, elapsed) {
            return Err(PollError::Exhausted { attempts, elapsed });
        }

        clock.sleep(config.interval).await;
    }
}
