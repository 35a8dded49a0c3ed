//! Job bodies run by the scheduler.
//!
//! - ScoreRefresh: recompute, persist and push every entity's score
//! - RetentionCleanup: bulk-delete events past the retention horizon
//! - AggregateSummary: cross-entity summary written through the cache
//!
//! Every store call goes through `Resilience`. A job never propagates an
//! error to the scheduler: `run_job` turns the outcome into a `JobReport`
//! and an outcome counter.

use chrono::{DateTime, Duration, Utc};

use crate::analytics::{self, SUMMARY_CACHE_KEY};
use crate::error::PulseError;
use crate::metrics::{BACKGROUND_TASKS, JOB_FAILURES, PROCESSING_TIME, SCORE_UPDATES};
use crate::scoring::compute_score;
use crate::state::PulseState;
use crate::types::{JobId, JobReport, JobTrigger, PushMessage};

/// Per-run counts
#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    processed: usize,
    failed: usize,
}

/// Run one job to completion and record its outcome
pub async fn run_job(state: &PulseState, job: JobId, trigger: JobTrigger) -> JobReport {
    let started_at = state.now();
    let timer = tokio::time::Instant::now();
    log::info!("{}: starting ({:?})", job, trigger);

    let result = match job {
        JobId::ScoreRefresh => score_refresh(state).await,
        JobId::RetentionCleanup => retention_cleanup(state).await,
        JobId::AggregateSummary => aggregate_summary(state).await,
    };

    let elapsed = timer.elapsed().as_secs_f64();
    state
        .metrics
        .observe(PROCESSING_TIME, &[("task_type", job.as_str())], elapsed);

    let (tally, error) = match result {
        Ok(tally) => {
            log::info!(
                "{}: finished in {:.2}s ({} processed, {} failed)",
                job,
                elapsed,
                tally.processed,
                tally.failed
            );
            (tally, None)
        }
        Err(e) => {
            log::error!("{}: run failed after {:.2}s: {}", job, elapsed, e);
            state.metrics.increment(
                JOB_FAILURES,
                &[("task_type", job.as_str()), ("kind", e.outcome_label())],
            );
            (Tally::default(), Some(e.to_string()))
        }
    };

    let status = if error.is_none() { "success" } else { "error" };
    state.metrics.increment(
        BACKGROUND_TASKS,
        &[("task_type", job.as_str()), ("status", status)],
    );

    let report = JobReport {
        job,
        trigger,
        started_at,
        finished_at: state.now(),
        processed: tally.processed,
        failed: tally.failed,
        error,
    };
    state.record_report(report.clone());
    report
}

/// Recompute, persist and push one entity's score as of `now`
pub async fn refresh_entity(
    state: &PulseState,
    entity_id: &str,
    now: DateTime<Utc>,
) -> Result<f64, PulseError> {
    let events = state
        .resilience
        .call("list_events", || state.store.list_events(entity_id))
        .await?;

    let score = compute_score(entity_id, &events, now);

    state
        .resilience
        .call("persist_score", || state.store.persist_score(entity_id, score, now))
        .await?;
    state.metrics.increment(SCORE_UPDATES, &[]);

    match state
        .registry
        .push(entity_id, &PushMessage::score_update(entity_id, score, now))
        .await
    {
        Ok(delivered) if delivered > 0 => {
            log::debug!("ScoreRefresh: pushed {} to {} subscriber(s)", entity_id, delivered)
        }
        Ok(_) => {}
        // The score is already persisted; a push problem must not undo that
        Err(e) => log::warn!("ScoreRefresh: push for {} failed: {}", entity_id, e),
    }
    Ok(score)
}

async fn score_refresh(state: &PulseState) -> Result<Tally, PulseError> {
    let now = state.now();
    let entities = state
        .resilience
        .call("list_entities", || state.store.list_entities())
        .await?;

    let mut tally = Tally::default();
    for entity in &entities {
        match refresh_entity(state, &entity.id, now).await {
            Ok(_) => {
                tally.processed += 1;
                state.metrics.increment(
                    BACKGROUND_TASKS,
                    &[("task_type", "score_update"), ("status", "success")],
                );
            }
            Err(e) => {
                tally.failed += 1;
                log::warn!("ScoreRefresh: entity {} failed: {}", entity.id, e);
                state.metrics.increment(
                    BACKGROUND_TASKS,
                    &[("task_type", "score_update"), ("status", "error")],
                );
                state.metrics.increment(
                    JOB_FAILURES,
                    &[("task_type", "score_update"), ("kind", e.outcome_label())],
                );
            }
        }
    }
    Ok(tally)
}

async fn retention_cleanup(state: &PulseState) -> Result<Tally, PulseError> {
    let cutoff = state.now() - Duration::days(state.config.scoring.retention_days);
    let removed = state
        .resilience
        .call("delete_events_before", || state.store.delete_events_before(cutoff))
        .await?;
    log::info!("RetentionCleanup: removed {} events older than {}", removed, cutoff);

    let evicted = state.limiter.evict_idle();
    if evicted > 0 {
        log::debug!("RetentionCleanup: evicted {} idle rate windows", evicted);
    }

    Ok(Tally {
        processed: removed as usize,
        failed: 0,
    })
}

async fn aggregate_summary(state: &PulseState) -> Result<Tally, PulseError> {
    let entities = state
        .resilience
        .call("list_entities", || state.store.list_entities())
        .await?;
    let counts = state
        .resilience
        .call("engagement_counts", || state.store.engagement_counts(None))
        .await?;

    let purged = state.cache.purge_expired();
    if purged > 0 {
        log::debug!("AggregateSummary: purged {} expired cache entries", purged);
    }

    let summary = analytics::summarize(&entities, &counts, state.now());
    state.cache.set(
        SUMMARY_CACHE_KEY,
        &summary,
        state.config.cache.summary_ttl_minutes,
    )?;

    Ok(Tally {
        processed: summary.entity_count,
        failed: 0,
    })
}
