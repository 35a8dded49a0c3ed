//! Store adapter seam plus an in-memory reference implementation.
//!
//! The scheduler and request path only ever talk to [`StoreAdapter`]. Any
//! backend error must be reported as `TransientDownstream` (worth retrying)
//! or `PermanentDownstream`; a missing entity is `NotFound`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::error::PulseError;
use crate::types::{EngagementEvent, EngagementType, Entity};

#[async_trait]
pub trait StoreAdapter: Send + Sync {
    async fn get_entity(&self, id: &str) -> Result<Entity, PulseError>;

    async fn list_entities(&self) -> Result<Vec<Entity>, PulseError>;

    async fn list_events(&self, entity_id: &str) -> Result<Vec<EngagementEvent>, PulseError>;

    /// Bulk delete; returns the number of events removed
    async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64, PulseError>;

    async fn persist_score(
        &self,
        entity_id: &str,
        score: f64,
        processed_at: DateTime<Utc>,
    ) -> Result<(), PulseError>;

    /// Event counts per engagement type, optionally limited to events created at or after `since`.
    ///
    /// The default walks every entity's history; backends with a query
    /// language should override it with a grouped count.
    async fn engagement_counts(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<HashMap<EngagementType, u64>, PulseError> {
        let mut counts = HashMap::new();
        for entity in self.list_entities().await? {
            for event in self.list_events(&entity.id).await? {
                if since.is_some_and(|cutoff| event.created_at < cutoff) {
                    continue;
                }
                *counts.entry(event.engagement_type).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}

/// Store operations, used to target injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GetEntity,
    ListEntities,
    ListEvents,
    DeleteEventsBefore,
    PersistScore,
}

#[derive(Debug, Clone)]
struct Fault {
    op: StoreOp,
    entity_id: Option<String>,
    /// None = fail forever
    remaining: Option<u32>,
    transient: bool,
}

/// In-memory store. Used by the binary and by tests, which can inject
/// transient or permanent failures per operation (and optionally per entity).
#[derive(Default)]
pub struct MemoryStore {
    entities: RwLock<HashMap<String, Entity>>,
    events: RwLock<HashMap<String, Vec<EngagementEvent>>>,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<HashMap<StoreOp, usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_entity(&self, entity: Entity) {
        self.entities.write().insert(entity.id.clone(), entity);
    }

    pub fn add_event(&self, event: EngagementEvent) {
        self.events
            .write()
            .entry(event.entity_id.clone())
            .or_default()
            .push(event);
    }

    /// Snapshot of an entity without going through the async seam
    pub fn entity(&self, id: &str) -> Option<Entity> {
        self.entities.read().get(id).cloned()
    }

    pub fn event_count(&self) -> usize {
        self.events.read().values().map(Vec::len).sum()
    }

    /// Fail the next `times` calls to `op` with a transient error
    pub fn fail_transient(&self, op: StoreOp, times: u32) {
        self.faults.lock().push(Fault {
            op,
            entity_id: None,
            remaining: Some(times),
            transient: true,
        });
    }

    /// Fail every call to `op` with a permanent error
    pub fn fail_permanent(&self, op: StoreOp) {
        self.faults.lock().push(Fault {
            op,
            entity_id: None,
            remaining: None,
            transient: false,
        });
    }

    /// Fail every call to `op` that concerns `entity_id`
    pub fn fail_entity(&self, op: StoreOp, entity_id: &str, transient: bool) {
        self.faults.lock().push(Fault {
            op,
            entity_id: Some(entity_id.to_string()),
            remaining: None,
            transient,
        });
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// How many times `op` has been called, including failed calls
    pub fn calls(&self, op: StoreOp) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    fn enter(&self, op: StoreOp, entity_id: Option<&str>) -> Result<(), PulseError> {
        *self.calls.lock().entry(op).or_insert(0) += 1;

        let mut faults = self.faults.lock();
        let hit = faults.iter_mut().position(|fault| {
            fault.op == op
                && fault.remaining != Some(0)
                && match (&fault.entity_id, entity_id) {
                    (None, _) => true,
                    (Some(target), Some(id)) => target == id,
                    (Some(_), None) => false,
                }
        });
        let Some(idx) = hit else {
            return Ok(());
        };

        let fault = &mut faults[idx];
        if let Some(remaining) = fault.remaining.as_mut() {
            *remaining -= 1;
        }
        let target = entity_id.unwrap_or("*");
        Err(if fault.transient {
            PulseError::TransientDownstream(format!("injected {:?} failure for {}", op, target))
        } else {
            PulseError::PermanentDownstream(format!("injected {:?} failure for {}", op, target))
        })
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn get_entity(&self, id: &str) -> Result<Entity, PulseError> {
        self.enter(StoreOp::GetEntity, Some(id))?;
        self.entity(id)
            .ok_or_else(|| PulseError::NotFound(format!("entity {}", id)))
    }

    async fn list_entities(&self) -> Result<Vec<Entity>, PulseError> {
        self.enter(StoreOp::ListEntities, None)?;
        let mut entities: Vec<Entity> = self.entities.read().values().cloned().collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entities)
    }

    async fn list_events(&self, entity_id: &str) -> Result<Vec<EngagementEvent>, PulseError> {
        self.enter(StoreOp::ListEvents, Some(entity_id))?;
        Ok(self
            .events
            .read()
            .get(entity_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64, PulseError> {
        self.enter(StoreOp::DeleteEventsBefore, None)?;
        let mut events = self.events.write();
        let mut removed = 0u64;
        for history in events.values_mut() {
            let before = history.len();
            history.retain(|e| e.created_at >= cutoff);
            removed += (before - history.len()) as u64;
        }
        events.retain(|_, history| !history.is_empty());
        Ok(removed)
    }

    async fn persist_score(
        &self,
        entity_id: &str,
        score: f64,
        processed_at: DateTime<Utc>,
    ) -> Result<(), PulseError> {
        self.enter(StoreOp::PersistScore, Some(entity_id))?;
        let mut entities = self.entities.write();
        let entity = entities
            .get_mut(entity_id)
            .ok_or_else(|| PulseError::NotFound(format!("entity {}", entity_id)))?;
        entity.score = score;
        entity.last_processed = Some(processed_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_entity(Entity::new("u1"));
        store.insert_entity(Entity::new("u2"));
        store.add_event(EngagementEvent::new("u1", EngagementType::Like, None, now));
        store.add_event(EngagementEvent::new(
            "u1",
            EngagementType::Reply,
            Some(0.2),
            now - Duration::days(100),
        ));
        store.add_event(EngagementEvent::new("u2", EngagementType::Retweet, None, now));
        store
    }

    #[tokio::test]
    async fn test_get_missing_entity_is_not_found() {
        let store = seeded();
        let err = store.get_entity("nobody").await.unwrap_err();
        assert!(matches!(err, PulseError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_events_before_cutoff() {
        let store = seeded();
        let removed = store
            .delete_events_before(Utc::now() - Duration::days(90))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.event_count(), 2);
    }

    #[tokio::test]
    async fn test_persist_score_updates_entity() {
        let store = seeded();
        let at = Utc::now();
        store.persist_score("u2", 12.5, at).await.unwrap();
        let entity = store.entity("u2").unwrap();
        assert_eq!(entity.score, 12.5);
        assert_eq!(entity.last_processed, Some(at));
    }

    #[tokio::test]
    async fn test_default_engagement_counts_respects_since() {
        let store = seeded();
        let all = store.engagement_counts(None).await.unwrap();
        assert_eq!(all.values().sum::<u64>(), 3);
        let recent = store
            .engagement_counts(Some(Utc::now() - Duration::days(30)))
            .await
            .unwrap();
        assert_eq!(recent.get(&EngagementType::Reply), None);
        assert_eq!(recent.get(&EngagementType::Like), Some(&1));
    }

    #[tokio::test]
    async fn test_transient_fault_expires() {
        let store = seeded();
        store.fail_transient(StoreOp::ListEntities, 1);
        let err = store.list_entities().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.list_entities().await.unwrap().len(), 2);
        assert_eq!(store.calls(StoreOp::ListEntities), 2);
    }

    #[tokio::test]
    async fn test_entity_fault_targets_one_entity() {
        let store = seeded();
        store.fail_entity(StoreOp::ListEvents, "u1", false);
        assert!(store.list_events("u1").await.is_err());
        assert_eq!(store.list_events("u2").await.unwrap().len(), 1);
    }
}
