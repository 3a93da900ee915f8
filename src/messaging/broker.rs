use super::topology::{BindingSpec, ExchangeSpec, QueueSpec};
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A serialized message ready to hand to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub message_id: String,
    /// Publish time, Unix seconds.
    pub timestamp: u64,
    pub content_type: &'static str,
    pub persistent: bool,
}

impl Envelope {
    pub fn json(exchange: &str, routing_key: &str, message_id: String, body: Vec<u8>) -> Self {
        Self {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            message_id,
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
            content_type: CONTENT_TYPE_JSON,
            persistent: true,
        }
    }
}

/// Point-in-time counters for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Messages ready for delivery.
    pub messages: u32,
    pub consumers: u32,
    /// Delivered but not yet settled. `None` when the broker does not report it.
    pub unacknowledged: Option<u32>,
}

/// A message taken off a queue. Must be settled exactly once.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn body(&self) -> &[u8];
    fn message_id(&self) -> Option<&str>;
    async fn ack(&self) -> Result<()>;
    /// Rejects the delivery; without `requeue` the broker dead-letters it.
    async fn reject(&self, requeue: bool) -> Result<()>;
}

pub type DeliveryStream = BoxStream<'static, Result<Box<dyn Delivery>>>;

/// Declares exchanges, queues and bindings.
///
/// Re-declaring with identical parameters must succeed; incompatible
/// parameters fail with `TOPOLOGY_MISMATCH`.
#[async_trait]
pub trait TopologyDeclarer: Send + Sync {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()>;
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;
    async fn bind_queue(&self, spec: &BindingSpec) -> Result<()>;
}

/// Publish/subscribe access to a message broker.
#[async_trait]
pub trait Broker: TopologyDeclarer {
    /// Returns once the broker has accepted the message.
    async fn publish(&self, envelope: Envelope) -> Result<()>;
    /// Starts a consumer on `queue`, delivering one message at a time.
    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream>;
    async fn inspect_queue(&self, queue: &str) -> Result<QueueStats>;
    async fn close(&self) -> Result<()>;
}
