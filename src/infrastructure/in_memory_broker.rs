use crate::error::{PaymentError, Result, codes};
use crate::messaging::broker::{
    Broker, Delivery, DeliveryStream, Envelope, QueueStats, TopologyDeclarer,
};
use crate::messaging::topology::{
    BindingSpec, DEFAULT_EXCHANGE, ExchangeKind, ExchangeSpec, QueueSpec,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// A message rejected without requeue and routed to the queue's dead-letter exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub queue: String,
    pub dead_letter_exchange: Option<String>,
    pub envelope: Envelope,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Envelope>,
    unacked: u32,
    consumers: u32,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct Inner {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingSpec>,
    published: Vec<Envelope>,
    dead_letters: Vec<DeadLetter>,
    fail_publishes: u32,
    closed: bool,
}

impl Inner {
    fn route(&self, envelope: &Envelope) -> Result<Vec<String>> {
        if envelope.exchange == DEFAULT_EXCHANGE {
            return Ok(self
                .queues
                .contains_key(&envelope.routing_key)
                .then(|| envelope.routing_key.clone())
                .into_iter()
                .collect());
        }

        let exchange = self.exchanges.get(&envelope.exchange).ok_or_else(|| {
            PaymentError::messaging(
                codes::UNKNOWN_EXCHANGE,
                format!("Exchange {} is not declared", envelope.exchange),
            )
            .with_retryable(false)
        })?;

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange.name) {
            let matched = match exchange.kind {
                ExchangeKind::Direct => binding.routing_key == envelope.routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, &envelope.routing_key),
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, queue: &str, envelope: Envelope, front: bool) {
        if let Some(state) = self.queues.get_mut(queue) {
            if front {
                state.ready.push_front(envelope);
            } else {
                state.ready.push_back(envelope);
            }
            state.notify.notify_one();
        }
    }

    fn dead_letter(&mut self, queue: &str, envelope: Envelope) {
        let dlx = self
            .queues
            .get(queue)
            .and_then(|q| q.spec.dead_letter_exchange.clone());

        // Rejected messages keep their original routing key.
        if let Some(exchange) = &dlx {
            let rerouted = Envelope {
                exchange: exchange.clone(),
                ..envelope.clone()
            };
            if let Ok(targets) = self.route(&rerouted) {
                for target in targets {
                    self.enqueue(&target, rerouted.clone(), false);
                }
            }
        }

        self.dead_letters.push(DeadLetter {
            queue: queue.to_string(),
            dead_letter_exchange: dlx,
            envelope,
        });
    }

    fn settle(&mut self, queue: &str) {
        if let Some(state) = self.queues.get_mut(queue) {
            state.unacked = state.unacked.saturating_sub(1);
        }
    }
}

/// AMQP topic matching: `*` matches one word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((first, key_rest)) => (word == "*" || word == *first) && match_words(rest, key_rest),
            None => false,
        },
    }
}

/// In-process broker with AMQP routing semantics: direct, topic and default
/// exchanges, dead-letter exchanges, requeue on reject and on dropped
/// deliveries.
///
/// Cloning shares the same broker state.
#[derive(Default, Clone)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `count` publishes fail as if the broker were unreachable.
    pub fn fail_next_publishes(&self, count: u32) {
        self.lock().fail_publishes = count;
    }

    /// Every envelope accepted so far, in publish order.
    pub fn published(&self) -> Vec<Envelope> {
        self.lock().published.clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }

    /// Number of ready messages on `queue`, zero if it does not exist.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Injects a raw body straight into `queue`, bypassing exchanges.
    pub fn push_raw(&self, queue: &str, body: impl Into<Vec<u8>>) -> Result<()> {
        let mut inner = self.lock();
        if !inner.queues.contains_key(queue) {
            return Err(unknown_queue(queue));
        }
        let envelope = Envelope::json(DEFAULT_EXCHANGE, queue, String::new(), body.into());
        inner.enqueue(queue, envelope, false);
        Ok(())
    }
}

fn unknown_queue(queue: &str) -> PaymentError {
    PaymentError::messaging(codes::UNKNOWN_QUEUE, format!("Queue {queue} is not declared"))
        .with_retryable(false)
}

fn mismatch(message: String) -> PaymentError {
    PaymentError::messaging(codes::TOPOLOGY_MISMATCH, message).with_retryable(false)
}

#[async_trait]
impl TopologyDeclarer for InMemoryBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        let mut inner = self.lock();
        match inner.exchanges.get(&spec.name) {
            Some(existing) if existing != spec => Err(mismatch(format!(
                "Exchange {} already declared as {} (durable: {})",
                spec.name, existing.kind, existing.durable
            ))),
            Some(_) => Ok(()),
            None => {
                inner.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let mut inner = self.lock();
        match inner.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(mismatch(format!(
                "Queue {} already declared with different arguments",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                inner.queues.insert(
                    spec.name.clone(),
                    QueueState {
                        spec: spec.clone(),
                        ready: VecDeque::new(),
                        unacked: 0,
                        consumers: 0,
                        notify: Arc::new(Notify::new()),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, spec: &BindingSpec) -> Result<()> {
        let mut inner = self.lock();
        if !inner.queues.contains_key(&spec.queue) {
            return Err(unknown_queue(&spec.queue));
        }
        if !inner.exchanges.contains_key(&spec.exchange) {
            return Err(PaymentError::messaging(
                codes::UNKNOWN_EXCHANGE,
                format!("Exchange {} is not declared", spec.exchange),
            )
            .with_retryable(false));
        }
        if !inner.bindings.contains(spec) {
            inner.bindings.push(spec.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(PaymentError::messaging(codes::CHANNEL_CLOSED, "Broker is closed"));
        }
        if inner.fail_publishes > 0 {
            inner.fail_publishes -= 1;
            return Err(PaymentError::messaging(
                codes::CONNECTION_ERROR,
                "Broker unavailable",
            ));
        }

        let targets = inner.route(&envelope)?;
        if targets.is_empty() {
            tracing::debug!(
                exchange = %envelope.exchange,
                routing_key = %envelope.routing_key,
                "Message unroutable, dropped"
            );
        }
        for target in &targets {
            inner.enqueue(target, envelope.clone(), false);
        }
        inner.published.push(envelope);
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream> {
        let notify = {
            let mut inner = self.lock();
            let state = inner.queues.get_mut(queue).ok_or_else(|| unknown_queue(queue))?;
            state.consumers += 1;
            state.notify.clone()
        };

        let subscription = Subscription {
            broker: self.clone(),
            queue: queue.to_string(),
            notify,
        };

        let stream = futures::stream::unfold(subscription, |sub| async move {
            loop {
                let polled = {
                    let mut inner = sub.broker.lock();
                    if inner.closed {
                        None
                    } else {
                        inner.queues.get_mut(&sub.queue).map(|state| {
                            let envelope = state.ready.pop_front();
                            if envelope.is_some() {
                                state.unacked += 1;
                            }
                            envelope
                        })
                    }
                };

                match polled {
                    None => return None,
                    Some(Some(envelope)) => {
                        let delivery: Box<dyn Delivery> = Box::new(InMemoryDelivery {
                            broker: sub.broker.clone(),
                            queue: sub.queue.clone(),
                            envelope,
                            settled: AtomicBool::new(false),
                        });
                        return Some((Ok(delivery), sub));
                    }
                    Some(None) => sub.notify.notified().await,
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn inspect_queue(&self, queue: &str) -> Result<QueueStats> {
        let inner = self.lock();
        let state = inner.queues.get(queue).ok_or_else(|| unknown_queue(queue))?;
        Ok(QueueStats {
            messages: state.ready.len() as u32,
            consumers: state.consumers,
            unacknowledged: Some(state.unacked),
        })
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.closed = true;
        for state in inner.queues.values() {
            state.notify.notify_waiters();
            state.notify.notify_one();
        }
        Ok(())
    }
}

struct Subscription {
    broker: InMemoryBroker,
    queue: String,
    notify: Arc<Notify>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(state) = self.broker.lock().queues.get_mut(&self.queue) {
            state.consumers = state.consumers.saturating_sub(1);
        }
    }
}

struct InMemoryDelivery {
    broker: InMemoryBroker,
    queue: String,
    envelope: Envelope,
    settled: AtomicBool,
}

impl InMemoryDelivery {
    fn mark_settled(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(PaymentError::messaging(
                codes::ACK_ERROR,
                "Delivery already settled",
            )
            .with_retryable(false));
        }
        Ok(())
    }
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.envelope.body
    }

    fn message_id(&self) -> Option<&str> {
        Some(self.envelope.message_id.as_str()).filter(|id| !id.is_empty())
    }

    async fn ack(&self) -> Result<()> {
        self.mark_settled()?;
        self.broker.lock().settle(&self.queue);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.mark_settled()?;
        let mut inner = self.broker.lock();
        inner.settle(&self.queue);
        if requeue {
            inner.enqueue(&self.queue, self.envelope.clone(), true);
        } else {
            inner.dead_letter(&self.queue, self.envelope.clone());
        }
        Ok(())
    }
}

impl Drop for InMemoryDelivery {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::Acquire) {
            let mut inner = self.broker.lock();
            inner.settle(&self.queue);
            inner.enqueue(&self.queue, self.envelope.clone(), true);
        }
    }
}
