use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::cache::TtlCache;
use crate::clock::{Clock, SystemClock};
use crate::config::PulseConfig;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::rate_limit::RateLimiter;
use crate::registry::ConnectionRegistry;
use crate::resilience::{BreakerSet, Resilience};
use crate::store::StoreAdapter;
use crate::types::{JobId, JobReport};

/// Shared service state.
///
/// Every registry lives here and is handed to the scheduler and the request
/// path explicitly; nothing is a process-wide singleton.
pub struct PulseState {
    pub config: PulseConfig,
    pub store: Arc<dyn StoreAdapter>,
    pub registry: ConnectionRegistry,
    pub cache: TtlCache,
    pub limiter: RateLimiter,
    pub resilience: Resilience,
    pub metrics: Arc<dyn MetricsSink>,
    pub clock: Arc<dyn Clock>,
    last_scheduled_run: Mutex<HashMap<JobId, DateTime<Utc>>>,
    last_reports: Mutex<HashMap<JobId, JobReport>>,
}

impl PulseState {
    /// Wall clock, no metrics backend
    pub fn new(config: PulseConfig, store: Arc<dyn StoreAdapter>) -> Self {
        Self::with_parts(config, store, Arc::new(SystemClock), Arc::new(NoopMetrics))
    }

    pub fn with_parts(
        config: PulseConfig,
        store: Arc<dyn StoreAdapter>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let limiter = RateLimiter::new(
            config.rate_limit.requests_per_minute,
            config.rate_limit.window_secs,
            Arc::clone(&clock),
            Arc::clone(&metrics),
        );
        let resilience = Resilience::new(
            config.retry.policy(),
            BreakerSet::new(
                config.breaker.failure_threshold,
                config.breaker.reset_timeout(),
                Arc::clone(&metrics),
            ),
        );

        Self {
            registry: ConnectionRegistry::new(Arc::clone(&metrics)),
            cache: TtlCache::new(Arc::clone(&clock), Arc::clone(&metrics)),
            limiter,
            resilience,
            store,
            metrics,
            clock,
            config,
            last_scheduled_run: Mutex::new(HashMap::new()),
            last_reports: Mutex::new(HashMap::new()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Record the schedule slot a job was last started for
    pub fn set_last_scheduled_run(&self, job: JobId, time: DateTime<Utc>) {
        self.last_scheduled_run.lock().insert(job, time);
    }

    pub fn get_last_scheduled_run(&self, job: JobId) -> Option<DateTime<Utc>> {
        self.last_scheduled_run.lock().get(&job).copied()
    }

    pub fn record_report(&self, report: JobReport) {
        self.last_reports.lock().insert(report.job, report);
    }

    pub fn last_report(&self, job: JobId) -> Option<JobReport> {
        self.last_reports.lock().get(&job).cloned()
    }
}
