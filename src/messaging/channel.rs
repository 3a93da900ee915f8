use super::broker::{Broker, Delivery, Envelope};
use super::topology::destination_queue;
use crate::domain::message::QueueMessage;
use crate::domain::ports::MetricsRef;
use crate::error::{PaymentError, Result, codes};
use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pause after a failed receive before polling the stream again.
pub const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Processes one decoded message. An `Err` requeues the delivery.
#[async_trait]
pub trait MessageHandler<M>: Send + Sync {
    async fn handle(&self, message: M) -> Result<()>;
}

/// Typed publish/consume over a [`Broker`] with the pipeline's ack policy:
///
/// - body that does not decode: rejected without requeue (dead-lettered)
/// - handler error: rejected with requeue
/// - handler success: acknowledged
pub struct MessageChannel {
    broker: Arc<dyn Broker>,
    metrics: MetricsRef,
    shutdown: CancellationToken,
    consumers: Mutex<HashMap<String, JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MessageChannel {
    /// Creates an open channel with no consumers.
    ///
    /// # Arguments
    ///
    /// * `broker` - Transport for publishes and subscriptions. Closed by
    ///   [`MessageChannel::close`].
    /// * `metrics` - Receives publish, processing, retry and dead-letter counts.
    pub fn new(broker: Arc<dyn Broker>, metrics: MetricsRef) -> Self {
        Self {
            broker,
            metrics,
            shutdown: CancellationToken::new(),
            consumers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Serializes `message` and publishes it as a persistent JSON message.
    pub async fn publish<M: QueueMessage>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &M,
    ) -> Result<()> {
        let queue = destination_queue(exchange, routing_key);
        if self.is_closed() {
            return Err(PaymentError::messaging(
                codes::CHANNEL_CLOSED,
                "Message channel is closed",
            )
            .with_retryable(false));
        }

        let body = serde_json::to_vec(message).map_err(|e| {
            self.metrics.record_error(queue, "marshal_error");
            PaymentError::internal(codes::MARSHAL_ERROR, "Failed to serialize message")
                .with_source(e)
        })?;

        let envelope = Envelope::json(exchange, routing_key, message.message_id(), body);
        if let Err(e) = self.broker.publish(envelope).await {
            self.metrics.record_error(queue, "publish_error");
            return Err(PaymentError::messaging(
                codes::PUBLISH_ERROR,
                format!("Failed to publish to {exchange} with key {routing_key}"),
            )
            .with_source(e));
        }

        self.metrics.record_published(queue, message.label());
        tracing::debug!(exchange, routing_key, message_id = %message.message_id(), "Message published");
        Ok(())
    }

    /// Starts the single consumer for `queue`. Deliveries are handled one at a
    /// time on a dedicated task until [`MessageChannel::close`] is called.
    pub async fn consume<M>(&self, queue: &str, handler: Arc<dyn MessageHandler<M>>) -> Result<()>
    where
        M: DeserializeOwned + QueueMessage + 'static,
    {
        if self.is_closed() {
            return Err(PaymentError::messaging(
                codes::CHANNEL_CLOSED,
                "Message channel is closed",
            )
            .with_retryable(false));
        }

        let mut consumers = self.consumers.lock().await;
        if consumers.contains_key(queue) {
            return Err(PaymentError::messaging(
                codes::DUPLICATE_CONSUMER,
                format!("A consumer is already registered on queue {queue}"),
            )
            .with_retryable(false));
        }

        let mut deliveries = self.broker.subscribe(queue).await.map_err(|e| {
            PaymentError::messaging(
                codes::CONSUME_ERROR,
                format!("Failed to register a consumer on queue {queue}"),
            )
            .with_source(e)
        })?;

        let token = self.shutdown.child_token();
        let metrics = self.metrics.clone();
        let queue_name = queue.to_string();

        let handle = tokio::spawn(async move {
            tracing::info!(queue = %queue_name, "Consumer started");
            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = deliveries.next() => next,
                };

                let delivery = match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        tracing::error!(queue = %queue_name, error = %e, "Failed to receive delivery");
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => continue,
                        }
                    }
                    None => {
                        tracing::warn!(queue = %queue_name, "Delivery stream ended");
                        break;
                    }
                };

                // An abandoned delivery is redelivered by the broker.
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = process_delivery(&queue_name, delivery, handler.as_ref(), &metrics) => {}
                }
            }
            tracing::info!(queue = %queue_name, "Consumer stopped");
        });

        consumers.insert(queue.to_string(), handle);
        Ok(())
    }

    /// Stops every consumer and closes the broker. Only the first call does work.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();

        let handles: Vec<(String, JoinHandle<()>)> = self.consumers.lock().await.drain().collect();
        for (queue, handle) in handles {
            if let Err(e) = handle.await {
                tracing::error!(queue = %queue, error = %e, "Consumer task failed");
            }
        }

        self.broker.close().await?;
        tracing::info!("Message channel closed");
        Ok(())
    }
}

async fn process_delivery<M>(
    queue: &str,
    delivery: Box<dyn Delivery>,
    handler: &dyn MessageHandler<M>,
    metrics: &MetricsRef,
) where
    M: DeserializeOwned + QueueMessage,
{
    let started = Instant::now();

    match serde_json::from_slice::<M>(delivery.body()) {
        Err(e) => {
            tracing::warn!(
                queue,
                message_id = delivery.message_id().unwrap_or_default(),
                error = %e,
                "Failed to decode message, dead-lettering"
            );
            metrics.record_error(queue, "unmarshal_error");
            if let Err(e) = delivery.reject(false).await {
                tracing::error!(queue, error = %e, "Failed to reject delivery");
            }
            metrics.record_dead_letter(queue, "unmarshal_error");
        }
        Ok(message) => {
            let label = message.label();
            match handler.handle(message).await {
                Err(e) => {
                    tracing::warn!(queue, error = %e, "Handler failed, requeueing");
                    metrics.record_error(queue, "handler_error");
                    if let Err(e) = delivery.reject(true).await {
                        tracing::error!(queue, error = %e, "Failed to requeue delivery");
                    }
                    metrics.record_retry(queue, "handler_error");
                }
                Ok(()) => {
                    if let Err(e) = delivery.ack().await {
                        tracing::error!(queue, error = %e, "Failed to acknowledge delivery");
                    }
                    metrics.record_processed(queue, label);
                }
            }
        }
    }

    metrics.record_processing_time(queue, started.elapsed());
}
