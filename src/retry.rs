//! Retry with exponential backoff, and a rolling-window circuit breaker.
//!
//! The retry loop re-attempts only failures that `errors::is_transient`
//! recognizes. Delays are jittered ±25% so concurrently-failing operations
//! do not retry in lockstep.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::Rng;

use crate::errors::{is_transient, ErrorKind};

/// Backoff parameters for [`execute_with_retry`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based), with jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        let jittered = (base * jitter).min(self.max_delay_ms as f64);
        Duration::from_millis(jittered as u64)
    }

    /// Expected (jitter-free) delay, exposed for monotonicity checks.
    pub fn expected_delay_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        base.min(self.max_delay_ms as f64) as u64
    }
}

/// Run `op` up to `policy.max_retries` times, sleeping between attempts.
///
/// Non-transient failures and the final attempt's failure re-raise the
/// original error immediately.
pub async fn execute_with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_retries.max(1);
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt == attempts || !is_transient(&err) {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    max = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
    unreachable!("retry loop returns from within");
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failure ratio over the window crossed the threshold; reject calls.
    Open,
    /// Cooldown elapsed; allow probes through.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerWindow {
    /// (when, succeeded) samples inside the rolling window.
    samples: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
}

/// Rolling-window failure-ratio circuit breaker.
///
/// Opens once at least `min_samples` outcomes landed inside `window` and the
/// failure ratio reaches `failure_ratio`. After `cooldown` the breaker goes
/// half-open and a success closes it again.
///
/// Billing failures must never be recorded here: they reflect account state,
/// not call health, and counting them would trip the breaker on a problem
/// retries cannot fix. [`record_failure`](Self::record_failure) enforces the
/// exclusion.
#[derive(Debug)]
pub struct CircuitBreaker {
    window: Duration,
    min_samples: usize,
    failure_ratio: f64,
    cooldown: Duration,
    inner: Mutex<BreakerWindow>,
}

impl CircuitBreaker {
    pub fn new(window: Duration, min_samples: usize, failure_ratio: f64, cooldown: Duration) -> Self {
        Self {
            window,
            min_samples,
            failure_ratio,
            cooldown,
            inner: Mutex::new(BreakerWindow {
                samples: VecDeque::new(),
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.opened_at {
            Some(opened) if opened.elapsed() >= self.cooldown => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
            None => {
                self.prune(&mut inner);
                CircuitState::Closed
            }
        }
    }

    pub fn can_execute(&self) -> bool {
        !matches!(self.state(), CircuitState::Open)
    }

    /// Milliseconds until a probe is allowed, 0 unless open.
    pub fn retry_after_ms(&self) -> u64 {
        let inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.opened_at {
            Some(opened) => {
                let elapsed = opened.elapsed();
                self.cooldown.saturating_sub(elapsed).as_millis() as u64
            }
            None => 0,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        if inner.opened_at.is_some() {
            // Half-open probe succeeded: close and start fresh.
            inner.opened_at = None;
            inner.samples.clear();
        }
        inner.samples.push_back((Instant::now(), true));
        self.prune(&mut inner);
    }

    /// Record a failed call of the given kind. Billing failures are dropped.
    pub fn record_failure(&self, kind: ErrorKind) {
        if kind == ErrorKind::Billing {
            return;
        }
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        if inner.opened_at.is_some() {
            // A failed half-open probe restarts the cooldown.
            inner.opened_at = Some(Instant::now());
            return;
        }
        inner.samples.push_back((Instant::now(), false));
        self.prune(&mut inner);

        let total = inner.samples.len();
        if total >= self.min_samples {
            let failures = inner.samples.iter().filter(|(_, ok)| !ok).count();
            if failures as f64 / total as f64 >= self.failure_ratio {
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    fn prune(&self, inner: &mut BreakerWindow) {
        let cutoff = Instant::now() - self.window;
        while let Some(&(when, _)) = inner.samples.front() {
            if when < cutoff {
                inner.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        // 60s window, at least 5 outcomes, half of them failed, 30s cooldown.
        Self::new(Duration::from_secs(60), 5, 0.5, Duration::from_secs(30))
    }
}
