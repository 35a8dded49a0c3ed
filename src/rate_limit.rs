//! Sliding-window admission control per caller identity.
//!
//! Each client has an ordered window of request timestamps. Every check
//! prunes the window, compares against the limit and appends under a single
//! lock, so concurrent callers cannot double-count or skip a prune.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::error::PulseError;
use crate::metrics::{MetricsSink, RATE_LIMIT};

pub const DEFAULT_REQUESTS_PER_MINUTE: usize = 60;
pub const DEFAULT_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected,
}

pub struct RateLimiter {
    limit: usize,
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl RateLimiter {
    pub fn new(
        limit: usize,
        window_secs: i64,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            limit,
            window: Duration::seconds(window_secs),
            windows: Mutex::new(HashMap::new()),
            clock,
            metrics,
        }
    }

    /// Record a request from `client_id` if it fits in the window
    pub fn admit(&self, client_id: &str) -> Admission {
        let now = self.clock.now();
        let cutoff = now - self.window;

        let decision = {
            let mut windows = self.windows.lock();
            let window = windows.entry(client_id.to_string()).or_default();
            while window.front().is_some_and(|ts| *ts <= cutoff) {
                window.pop_front();
            }
            if window.len() >= self.limit {
                Admission::Rejected
            } else {
                window.push_back(now);
                Admission::Allowed
            }
        };

        match decision {
            Admission::Allowed => self.metrics.increment(RATE_LIMIT, &[("decision", "allow")]),
            Admission::Rejected => {
                self.metrics.increment(RATE_LIMIT, &[("decision", "reject")]);
                log::debug!("RateLimiter: rejected {}", client_id);
            }
        }
        decision
    }

    /// `admit` as a `Result`, for use with `?` on the request path
    pub fn check(&self, client_id: &str) -> Result<(), PulseError> {
        match self.admit(client_id) {
            Admission::Allowed => Ok(()),
            Admission::Rejected => Err(PulseError::AdmissionRejected {
                client_id: client_id.to_string(),
            }),
        }
    }

    /// Requests currently counted against `client_id`
    pub fn in_window(&self, client_id: &str) -> usize {
        let cutoff = self.clock.now() - self.window;
        self.windows
            .lock()
            .get(client_id)
            .map(|w| w.iter().filter(|ts| **ts > cutoff).count())
            .unwrap_or(0)
    }

    /// Forget clients whose windows have fully aged out
    pub fn evict_idle(&self) -> usize {
        let cutoff = self.clock.now() - self.window;
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| w.back().is_some_and(|ts| *ts > cutoff));
        before - windows.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::{MetricsRecorder, NoopMetrics};

    fn limiter(clock: Arc<ManualClock>) -> RateLimiter {
        RateLimiter::new(
            DEFAULT_REQUESTS_PER_MINUTE,
            DEFAULT_WINDOW_SECS,
            clock,
            Arc::new(NoopMetrics),
        )
    }

    #[test]
    fn test_61st_call_in_one_second_is_rejected() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = limiter(clock.clone());
        for i in 0..60 {
            clock.advance(Duration::milliseconds(10));
            assert_eq!(limiter.admit("client"), Admission::Allowed, "call {}", i + 1);
        }
        assert_eq!(limiter.admit("client"), Admission::Rejected);
        assert_eq!(limiter.in_window("client"), 60);
    }

    #[test]
    fn test_window_slides_after_sixty_seconds() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = limiter(clock.clone());
        for _ in 0..60 {
            limiter.admit("client");
        }
        assert!(limiter.check("client").is_err());

        clock.advance(Duration::seconds(61));
        assert_eq!(limiter.admit("client"), Admission::Allowed);
        assert_eq!(limiter.in_window("client"), 1);
    }

    #[test]
    fn test_clients_are_independent() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = limiter(clock);
        for _ in 0..60 {
            limiter.admit("a");
        }
        assert_eq!(limiter.admit("a"), Admission::Rejected);
        assert_eq!(limiter.admit("b"), Admission::Allowed);
    }

    #[test]
    fn test_rejection_maps_to_admission_error() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let metrics = Arc::new(MetricsRecorder::new());
        let limiter = RateLimiter::new(1, 60, clock, metrics.clone());
        assert!(limiter.check("c").is_ok());
        let err = limiter.check("c").unwrap_err();
        assert!(matches!(err, PulseError::AdmissionRejected { ref client_id } if client_id == "c"));
        assert_eq!(metrics.counter(RATE_LIMIT, &[("decision", "reject")]), 1);
    }

    #[test]
    fn test_evict_idle_drops_aged_out_clients() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = limiter(clock.clone());
        limiter.admit("old");
        clock.advance(Duration::seconds(30));
        limiter.admit("recent");
        clock.advance(Duration::seconds(40));
        assert_eq!(limiter.evict_idle(), 1);
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn test_concurrent_callers_never_exceed_limit() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = Arc::new(limiter(clock));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| limiter.admit("shared") == Admission::Allowed)
                        .count()
                })
            })
            .collect();
        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, DEFAULT_REQUESTS_PER_MINUTE);
    }
}
