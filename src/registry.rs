//! Live push-channel registry.
//!
//! Maps entity id -> connections currently subscribed to that entity's
//! score. Mutations go through a single lock that is never held across a
//! send, so a slow or failing subscriber cannot stall connect/disconnect.
//! Connections whose delivery fails are dropped rather than retried.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::PulseError;
use crate::metrics::{MetricsSink, PUSH};
use crate::types::PushMessage;

/// Close code sent to subscribers when the service shuts down
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// A persistent push channel to one subscriber
#[async_trait]
pub trait PushConnection: Send + Sync {
    /// Stable identity used for membership and removal
    fn id(&self) -> &str;

    async fn accept(&self) -> Result<(), PulseError>;

    async fn send(&self, payload: &serde_json::Value) -> Result<(), PulseError>;

    async fn close(&self, code: u16) -> Result<(), PulseError>;
}

pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Vec<Arc<dyn PushConnection>>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl ConnectionRegistry {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Complete the handshake and subscribe `conn` to `entity_id`
    pub async fn connect(
        &self,
        conn: Arc<dyn PushConnection>,
        entity_id: &str,
    ) -> Result<(), PulseError> {
        conn.accept().await?;
        let mut connections = self.connections.lock();
        let subscribers = connections.entry(entity_id.to_string()).or_default();
        if !subscribers.iter().any(|c| c.id() == conn.id()) {
            subscribers.push(conn);
        }
        log::info!(
            "Registry: connection subscribed to {} ({} live)",
            entity_id,
            subscribers.len()
        );
        Ok(())
    }

    /// Unsubscribe `conn`; the entity key goes away with its last connection
    pub fn disconnect(&self, conn: &dyn PushConnection, entity_id: &str) -> bool {
        let removed = self.remove_ids(entity_id, &[conn.id().to_string()]);
        if removed > 0 {
            log::info!("Registry: connection unsubscribed from {}", entity_id);
        }
        removed > 0
    }

    /// Deliver `message` to every subscriber of `entity_id`.
    ///
    /// Returns the number of successful deliveries. Subscribers that fail are
    /// removed; their failure does not affect delivery to the others.
    pub async fn push(&self, entity_id: &str, message: &PushMessage) -> Result<usize, PulseError> {
        let subscribers = match self.connections.lock().get(entity_id) {
            Some(subscribers) => subscribers.clone(),
            None => return Ok(0),
        };

        let payload = message.to_json()?;
        let mut delivered = 0;
        let mut failed = Vec::new();
        for conn in &subscribers {
            match conn.send(&payload).await {
                Ok(()) => {
                    delivered += 1;
                    self.metrics.increment(PUSH, &[("status", "delivered")]);
                }
                Err(e) => {
                    log::warn!(
                        "Registry: dropping connection {} for {} after failed send: {}",
                        conn.id(),
                        entity_id,
                        e
                    );
                    self.metrics.increment(PUSH, &[("status", "dropped")]);
                    failed.push(conn.id().to_string());
                }
            }
        }

        if !failed.is_empty() {
            self.remove_ids(entity_id, &failed);
        }
        Ok(delivered)
    }

    /// Handle a frame received from a subscriber. Pings are answered with a pong.
    pub async fn handle_inbound(
        &self,
        conn: &dyn PushConnection,
        text: &str,
    ) -> Result<PushMessage, PulseError> {
        let message = PushMessage::parse(text)?;
        match &message {
            PushMessage::Ping => conn.send(&PushMessage::Pong.to_json()?).await?,
            PushMessage::Pong => {}
            PushMessage::ScoreUpdate { .. } => {
                return Err(PulseError::PermanentDownstream(
                    "score_update is server-to-client only".to_string(),
                ))
            }
        }
        Ok(message)
    }

    /// Close and forget every connection
    pub async fn close_all(&self, code: u16) -> usize {
        let drained: Vec<Arc<dyn PushConnection>> = {
            let mut connections = self.connections.lock();
            connections.drain().flat_map(|(_, conns)| conns).collect()
        };
        for conn in &drained {
            if let Err(e) = conn.close(code).await {
                log::debug!("Registry: close failed for {}: {}", conn.id(), e);
            }
        }
        drained.len()
    }

    pub fn connection_count(&self, entity_id: &str) -> usize {
        self.connections
            .lock()
            .get(entity_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn contains_entity(&self, entity_id: &str) -> bool {
        self.connections.lock().contains_key(entity_id)
    }

    pub fn entity_count(&self) -> usize {
        self.connections.lock().len()
    }

    fn remove_ids(&self, entity_id: &str, ids: &[String]) -> usize {
        let mut connections = self.connections.lock();
        let Some(subscribers) = connections.get_mut(entity_id) else {
            return 0;
        };
        let before = subscribers.len();
        subscribers.retain(|c| !ids.iter().any(|id| id == c.id()));
        let removed = before - subscribers.len();
        if subscribers.is_empty() {
            connections.remove(entity_id);
        }
        removed
    }
}

/// What a [`ChannelConnection`] hands to its reader side
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Accepted,
    Message(serde_json::Value),
    Closed(u16),
}

/// Push transport over a bounded tokio channel.
///
/// A full buffer counts as a failed delivery, so a subscriber that stops
/// reading is disconnected instead of back-pressuring the fan-out.
pub struct ChannelConnection {
    id: String,
    sender: mpsc::Sender<Frame>,
}

impl ChannelConnection {
    pub fn pair(buffer: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let conn = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender,
        });
        (conn, receiver)
    }

    fn deliver(&self, frame: Frame) -> Result<(), PulseError> {
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                PulseError::TransientDownstream(format!("connection {} buffer full", self.id))
            }
            mpsc::error::TrySendError::Closed(_) => {
                PulseError::PermanentDownstream(format!("connection {} closed", self.id))
            }
        })
    }
}

#[async_trait]
impl PushConnection for ChannelConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn accept(&self) -> Result<(), PulseError> {
        self.deliver(Frame::Accepted)
    }

    async fn send(&self, payload: &serde_json::Value) -> Result<(), PulseError> {
        self.deliver(Frame::Message(payload.clone()))
    }

    async fn close(&self, code: u16) -> Result<(), PulseError> {
        self.deliver(Frame::Closed(code))
    }
}
