//! Consecutive-failure circuit breaker.
//!
//! Closed until `failure_threshold` consecutive failures, then open. Opening
//! schedules a detached reset task that, after `reset_timeout`, puts the
//! breaker back to closed with a zero counter. There is no half-open probe:
//! admission resumes blindly whether or not the downstream has recovered.
//!
//! The reset task never checks whether the breaker was reset and reopened in
//! the meantime. An older timer can therefore close a breaker that a newer
//! burst of failures opened. Callers that need the newer window honoured can
//! use [`CircuitBreaker::cancel_pending_reset`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::PulseError;
use crate::metrics::{MetricsSink, BREAKER_TRANSITIONS};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    Closed,
    Open,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    reset_deadline: Option<Instant>,
    reset_task: Option<JoinHandle<()>>,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Arc<Mutex<BreakerInner>>,
    metrics: Arc<dyn MetricsSink>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        reset_timeout: Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            inner: Arc::new(Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                reset_deadline: None,
                reset_task: None,
            })),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failures
    }

    pub fn reset_deadline(&self) -> Option<Instant> {
        self.inner.lock().reset_deadline
    }

    /// Run `op` unless the breaker is open
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, PulseError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PulseError>>,
    {
        self.try_acquire()?;
        let result = op().await;
        self.record(&result);
        result
    }

    /// Admission check. Open breakers reject without touching the downstream.
    pub fn try_acquire(&self) -> Result<(), PulseError> {
        if self.inner.lock().state == BreakerState::Open {
            self.metrics.increment(
                BREAKER_TRANSITIONS,
                &[("breaker", self.name.as_str()), ("state", "rejected")],
            );
            log::debug!("Breaker {}: open, rejecting call", self.name);
            return Err(PulseError::CircuitOpen(self.name.clone()));
        }
        Ok(())
    }

    /// Feed a call outcome back into the breaker
    pub fn record<T>(&self, result: &Result<T, PulseError>) {
        match result {
            Ok(_) => self.record_success(),
            Err(err) if counts_as_failure(err) => self.record_failure(),
            Err(_) => {}
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::Closed {
            inner.failures = 0;
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        if inner.state == BreakerState::Open || inner.failures < self.failure_threshold {
            return;
        }

        inner.state = BreakerState::Open;
        inner.reset_deadline = Some(Instant::now() + self.reset_timeout);
        log::warn!(
            "Breaker {}: opened after {} consecutive failures (reset in {:?})",
            self.name,
            inner.failures,
            self.reset_timeout
        );
        self.metrics.increment(
            BREAKER_TRANSITIONS,
            &[("breaker", self.name.as_str()), ("state", "open")],
        );

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                // A previous handle, if any, is dropped without aborting its task
                inner.reset_task = Some(handle.spawn(reset_after(
                    Arc::clone(&self.inner),
                    self.reset_timeout,
                    self.name.clone(),
                    Arc::clone(&self.metrics),
                )));
            }
            Err(_) => {
                log::error!(
                    "Breaker {}: no async runtime to schedule reset; staying open until reset()",
                    self.name
                );
            }
        }
    }

    /// Close the breaker now. Does not cancel a pending reset timer.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.reset_deadline = None;
    }

    /// Abort the most recently scheduled reset timer, if still pending
    pub fn cancel_pending_reset(&self) -> bool {
        match self.inner.lock().reset_task.take() {
            Some(task) if !task.is_finished() => {
                task.abort();
                true
            }
            _ => false,
        }
    }
}

async fn reset_after(
    inner: Arc<Mutex<BreakerInner>>,
    timeout: Duration,
    name: String,
    metrics: Arc<dyn MetricsSink>,
) {
    tokio::time::sleep(timeout).await;
    {
        let mut inner = inner.lock();
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.reset_deadline = None;
    }
    metrics.increment(BREAKER_TRANSITIONS, &[("breaker", name.as_str()), ("state", "closed")]);
    log::info!("Breaker {}: reset timer fired, closed", name);
}

/// Missing records and local rejections say nothing about downstream health
fn counts_as_failure(err: &PulseError) -> bool {
    !matches!(
        err,
        PulseError::NotFound(_) | PulseError::AdmissionRejected { .. } | PulseError::CircuitOpen(_)
    )
}

/// One breaker per logical downstream call, created on first use
pub struct BreakerSet {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    failure_threshold: u32,
    reset_timeout: Duration,
    metrics: Arc<dyn MetricsSink>,
}

impl BreakerSet {
    pub fn new(failure_threshold: u32, reset_timeout: Duration, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            breakers: DashMap::new(),
            failure_threshold,
            reset_timeout,
            metrics,
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        let breaker = self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    name,
                    self.failure_threshold,
                    self.reset_timeout,
                    Arc::clone(&self.metrics),
                ))
            });
        Arc::clone(breaker.value())
    }

    /// Name and state of every breaker created so far
    pub fn states(&self) -> Vec<(String, BreakerState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
