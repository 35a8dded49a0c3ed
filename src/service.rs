//! Request-path facade.
//!
//! Every entry point passes the rate limiter before touching anything else,
//! and every store call goes through the same retry/breaker wrapper the jobs
//! use.

use std::sync::Arc;

use crate::analytics::{self, enterprise_cache_key, EnterpriseData};
use crate::error::PulseError;
use crate::jobs;
use crate::registry::PushConnection;
use crate::state::PulseState;

pub struct PulseService {
    state: Arc<PulseState>,
}

impl PulseService {
    pub fn new(state: Arc<PulseState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<PulseState> {
        &self.state
    }

    /// Recompute, persist and push one entity's score now
    pub async fn refresh_entity(&self, client_id: &str, entity_id: &str) -> Result<f64, PulseError> {
        self.state.limiter.check(client_id)?;
        let state = &self.state;
        state
            .resilience
            .call("get_entity", || state.store.get_entity(entity_id))
            .await?;
        jobs::refresh_entity(state, entity_id, state.now()).await
    }

    /// Last persisted score
    pub async fn entity_score(&self, client_id: &str, entity_id: &str) -> Result<f64, PulseError> {
        self.state.limiter.check(client_id)?;
        let state = &self.state;
        let entity = state
            .resilience
            .call("get_entity", || state.store.get_entity(entity_id))
            .await?;
        Ok(entity.score)
    }

    /// Score trends and engagement mix over the last `days` days, clamped to
    /// the retention horizon. Served from the cache while fresh.
    pub async fn enterprise_data(
        &self,
        client_id: &str,
        days: i64,
    ) -> Result<EnterpriseData, PulseError> {
        self.state.limiter.check(client_id)?;
        let state = &self.state;
        let days = days.clamp(1, state.config.scoring.retention_days.max(1));
        let key = enterprise_cache_key(days);

        if let Some(cached) = state.cache.get::<EnterpriseData>(&key)? {
            return Ok(cached);
        }

        let now = state.now();
        let since = analytics::window_start(now, days);
        let entities = state
            .resilience
            .call("list_entities", || state.store.list_entities())
            .await?;
        let counts = state
            .resilience
            .call("engagement_counts", || state.store.engagement_counts(Some(since)))
            .await?;

        let data = analytics::enterprise_view(&entities, &counts, days, now);
        state
            .cache
            .set(&key, &data, state.config.cache.enterprise_ttl_minutes)?;
        Ok(data)
    }

    pub async fn subscribe(
        &self,
        client_id: &str,
        conn: Arc<dyn PushConnection>,
        entity_id: &str,
    ) -> Result<(), PulseError> {
        self.state.limiter.check(client_id)?;
        self.state.registry.connect(conn, entity_id).await
    }

    pub fn unsubscribe(
        &self,
        client_id: &str,
        conn: &dyn PushConnection,
        entity_id: &str,
    ) -> Result<bool, PulseError> {
        self.state.limiter.check(client_id)?;
        Ok(self.state.registry.disconnect(conn, entity_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::PulseConfig;
    use crate::metrics::MetricsRecorder;
    use crate::registry::{ChannelConnection, Frame};
    use crate::store::{MemoryStore, StoreOp};
    use crate::types::{EngagementEvent, EngagementType, Entity};
    use chrono::{DateTime, Duration, Utc};

    struct Fixture {
        service: PulseService,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let now = DateTime::parse_from_rfc3339("2026-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let store = Arc::new(MemoryStore::new());
        store.insert_entity(Entity::new("u1"));
        for _ in 0..3 {
            store.add_event(EngagementEvent::new("u1", EngagementType::Like, Some(0.5), now));
        }
        let clock = Arc::new(ManualClock::new(now));
        let state = PulseState::with_parts(
            PulseConfig::default(),
            store.clone(),
            clock.clone(),
            Arc::new(MetricsRecorder::new()),
        );
        Fixture {
            service: PulseService::new(Arc::new(state)),
            store,
            clock,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_persists_and_notifies_subscriber() {
        let f = fixture();
        let (conn, mut rx) = ChannelConnection::pair(4);
        f.service.subscribe("client-a", conn, "u1").await.unwrap();

        let score = f.service.refresh_entity("client-a", "u1").await.unwrap();
        assert!((score - 22.5).abs() < 1e-9);
        assert!((f.service.entity_score("client-a", "u1").await.unwrap() - 22.5).abs() < 1e-9);

        assert_eq!(rx.recv().await, Some(Frame::Accepted));
        assert!(matches!(rx.recv().await, Some(Frame::Message(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_entity_is_not_found() {
        let f = fixture();
        let err = f.service.refresh_entity("client-a", "ghost").await.unwrap_err();
        assert!(matches!(err, PulseError::NotFound(_)));
        assert!(matches!(
            f.service.entity_score("client-a", "ghost").await,
            Err(PulseError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_entry_point_is_rate_limited() {
        let f = fixture();
        for _ in 0..60 {
            f.service.entity_score("client-a", "u1").await.unwrap();
        }
        assert!(matches!(
            f.service.refresh_entity("client-a", "u1").await,
            Err(PulseError::AdmissionRejected { .. })
        ));
        assert!(matches!(
            f.service.enterprise_data("client-a", 30).await,
            Err(PulseError::AdmissionRejected { .. })
        ));
        let (conn, _rx) = ChannelConnection::pair(1);
        assert!(f.service.subscribe("client-a", conn.clone(), "u1").await.is_err());
        assert!(f.service.unsubscribe("client-a", conn.as_ref(), "u1").is_err());

        // Other clients have their own window
        assert!(f.service.entity_score("client-b", "u1").await.is_ok());

        f.clock.advance(Duration::seconds(61));
        assert!(f.service.entity_score("client-a", "u1").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enterprise_data_is_cached_for_ttl() {
        let f = fixture();
        f.service.refresh_entity("client-a", "u1").await.unwrap();

        let first = f.service.enterprise_data("client-a", 7).await.unwrap();
        assert_eq!(first.score_trends.len(), 1);
        assert_eq!(first.engagement_distribution.get("like"), Some(&3));
        let listed = f.store.calls(StoreOp::ListEntities);

        let second = f.service.enterprise_data("client-a", 7).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.store.calls(StoreOp::ListEntities), listed);

        f.clock.advance(Duration::minutes(5));
        let third = f.service.enterprise_data("client-a", 7).await.unwrap();
        assert!(f.store.calls(StoreOp::ListEntities) > listed);
        assert_eq!(third.generated_at, f.clock.now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enterprise_days_clamped_to_retention() {
        let f = fixture();
        let data = f.service.enterprise_data("client-a", i64::MAX).await.unwrap();
        assert_eq!(data.days, 90);
        assert_eq!(data.engagement_distribution.get("like"), Some(&3));

        let data = f.service.enterprise_data("client-a", i64::MIN).await.unwrap();
        assert_eq!(data.days, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_store_failure_surfaces_after_retries() {
        let f = fixture();
        f.store.fail_transient(StoreOp::GetEntity, 3);
        let err = f.service.entity_score("client-a", "u1").await.unwrap_err();
        assert!(matches!(err, PulseError::RetryExhausted { attempts: 3, .. }));
        assert!(matches!(
            err.root_cause(),
            PulseError::TransientDownstream(_)
        ));
    }
}
