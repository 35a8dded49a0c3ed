//! Resilience wrappers for calls to unreliable collaborators.
//!
//! [`CircuitBreaker`] and [`retry_with_backoff`] compose in either order.
//! [`Resilience::call`] guards a whole retried call with the breaker, so one
//! exhausted call counts as a single breaker failure and an open breaker
//! rejects the call before the first attempt.

mod breaker;
mod retry;

use std::future::Future;

pub use breaker::{
    BreakerSet, BreakerState, CircuitBreaker, DEFAULT_FAILURE_THRESHOLD, DEFAULT_RESET_TIMEOUT,
};
pub use retry::{retry_with_backoff, RetryPolicy};

use crate::error::PulseError;

pub struct Resilience {
    pub retry: RetryPolicy,
    pub breakers: BreakerSet,
}

impl Resilience {
    pub fn new(retry: RetryPolicy, breakers: BreakerSet) -> Self {
        Self { retry, breakers }
    }

    /// Call `op` through the breaker named `name`, retrying transient failures
    pub async fn call<T, F, Fut>(&self, name: &str, op: F) -> Result<T, PulseError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PulseError>>,
    {
        let breaker = self.breakers.get(name);
        breaker
            .call(|| retry_with_backoff(&self.retry, name, op))
            .await
    }
}
