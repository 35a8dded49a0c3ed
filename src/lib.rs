pub mod analytics;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod resilience;
pub mod scheduler;
pub mod scoring;
pub mod service;
pub mod state;
pub mod store;
pub mod types;

use std::sync::Arc;

pub use error::{ErrorPayload, PulseError};
pub use scheduler::Scheduler;
pub use scoring::compute_score;
pub use service::PulseService;
pub use state::PulseState;

use config::PulseConfig;
use metrics::MetricsRecorder;
use registry::CLOSE_GOING_AWAY;
use store::MemoryStore;

/// Run the engine until Ctrl-C, then drain in-flight jobs and close every
/// push connection.
pub async fn run(config: PulseConfig) -> Result<(), PulseError> {
    let recorder = Arc::new(MetricsRecorder::new());
    let state = Arc::new(PulseState::with_parts(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(clock::SystemClock),
        recorder.clone(),
    ));

    let scheduler = Arc::new(Scheduler::new(Arc::clone(&state)));
    let runner = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };

    for job in types::JobId::ALL {
        let status = scheduler.status(job);
        match (status.enabled, status.next_run) {
            (true, Some(next)) => log::info!("{}: next run at {}", job, next),
            _ => log::info!("{}: disabled", job),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| PulseError::Configuration(format!("Cannot listen for Ctrl-C: {}", e)))?;
    log::info!("Shutdown requested, waiting for running jobs");

    scheduler.shutdown().await;
    if let Err(e) = runner.await {
        log::error!("Scheduler task ended abnormally: {}", e);
    }

    let closed = state.registry.close_all(CLOSE_GOING_AWAY).await;
    log::info!("Closed {} push connection(s)", closed);

    log_metrics(&recorder);
    Ok(())
}

/// Dump the in-memory metrics at shutdown
fn log_metrics(recorder: &MetricsRecorder) {
    log::info!(
        "Metrics: {} background task outcomes, {} score updates",
        recorder.counter_total(metrics::BACKGROUND_TASKS),
        recorder.counter_total(metrics::SCORE_UPDATES)
    );
    let snapshot = recorder.snapshot();
    for (series, value) in &snapshot.counters {
        log::info!("Metrics: {} = {}", series, value);
    }
    for rollup in &snapshot.histograms {
        log::info!(
            "Metrics: {} n={} p50={:.3} p95={:.3} max={:.3}",
            rollup.series,
            rollup.sample_count,
            rollup.p50,
            rollup.p95,
            rollup.max
        );
    }
}
