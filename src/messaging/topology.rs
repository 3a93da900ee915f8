//! The fixed broker topology of the pipeline: exchanges, dead-letter-linked
//! queues and their bindings.

use super::broker::TopologyDeclarer;
use crate::domain::payment::ProviderType;
use crate::error::Result;
use std::fmt;

pub const PAYMENT_EXCHANGE: &str = "payment_exchange";
pub const PAYMENT_STATUS_EXCHANGE: &str = "payment_status_exchange";
pub const DEAD_LETTER_EXCHANGE: &str = "dead_letter_exchange";
/// The broker's nameless exchange routing by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

pub const PAYMENT_QUEUE: &str = "payments";
pub const PAYMENT_STATUS_QUEUE: &str = "payment_status";
pub const NOTIFICATION_QUEUE: &str = "notifications";

/// 24 hours. Encoded as a signed 32-bit value on the wire.
pub const MESSAGE_TTL_MS: i32 = 86_400_000;

pub const ALL_QUEUES: [&str; 3] = [PAYMENT_QUEUE, PAYMENT_STATUS_QUEUE, NOTIFICATION_QUEUE];

pub fn payment_routing_key(provider: &ProviderType) -> String {
    format!("payment.{provider}")
}

pub fn status_routing_key(order_id: &str) -> String {
    format!("status.{order_id}")
}

/// Queue a publish on `exchange` is destined for, used to label metrics.
pub fn destination_queue<'a>(exchange: &'a str, routing_key: &'a str) -> &'a str {
    match exchange {
        PAYMENT_EXCHANGE => PAYMENT_QUEUE,
        PAYMENT_STATUS_EXCHANGE => PAYMENT_STATUS_QUEUE,
        DEFAULT_EXCHANGE => routing_key,
        other => other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Topic,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => f.write_str("direct"),
            ExchangeKind::Topic => f.write_str("topic"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn durable(name: &str, kind: ExchangeKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub dead_letter_exchange: Option<String>,
    pub message_ttl_ms: Option<i32>,
}

impl QueueSpec {
    /// Durable queue dead-lettering into [`DEAD_LETTER_EXCHANGE`] with a 24h TTL.
    pub fn dead_lettered(name: &str) -> Self {
        Self {
            name: name.to_string(),
            durable: true,
            dead_letter_exchange: Some(DEAD_LETTER_EXCHANGE.to_string()),
            message_ttl_ms: Some(MESSAGE_TTL_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl BindingSpec {
    pub fn new(queue: &str, exchange: &str, routing_key: &str) -> Self {
        Self {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

impl Topology {
    /// Exchanges, queues and bindings used by the payment pipeline.
    ///
    /// The dead-letter exchange has no bound queue: rejected messages are
    /// dropped unless an operator binds one.
    pub fn payment_pipeline() -> Self {
        Self {
            exchanges: vec![
                ExchangeSpec::durable(DEAD_LETTER_EXCHANGE, ExchangeKind::Direct),
                ExchangeSpec::durable(PAYMENT_EXCHANGE, ExchangeKind::Topic),
                ExchangeSpec::durable(PAYMENT_STATUS_EXCHANGE, ExchangeKind::Topic),
            ],
            queues: ALL_QUEUES.iter().map(|q| QueueSpec::dead_lettered(q)).collect(),
            bindings: vec![
                BindingSpec::new(PAYMENT_QUEUE, PAYMENT_EXCHANGE, "payment.#"),
                BindingSpec::new(PAYMENT_STATUS_QUEUE, PAYMENT_STATUS_EXCHANGE, "status.#"),
            ],
        }
    }

    /// Declares exchanges, then queues, then bindings. Stops at the first
    /// failure; errors are returned as-is and never retried.
    pub async fn declare(&self, declarer: &dyn TopologyDeclarer) -> Result<()> {
        for exchange in &self.exchanges {
            declarer.declare_exchange(exchange).await?;
            tracing::debug!(exchange = %exchange.name, kind = %exchange.kind, "Exchange declared");
        }
        for queue in &self.queues {
            declarer.declare_queue(queue).await?;
            tracing::debug!(queue = %queue.name, "Queue declared");
        }
        for binding in &self.bindings {
            declarer.bind_queue(binding).await?;
            tracing::debug!(
                queue = %binding.queue,
                exchange = %binding.exchange,
                routing_key = %binding.routing_key,
                "Queue bound"
            );
        }
        tracing::info!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            bindings = self.bindings.len(),
            "Topology declared"
        );
        Ok(())
    }
}
