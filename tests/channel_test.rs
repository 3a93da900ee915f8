mod common;

use async_trait::async_trait;
use common::{Harness, wait_until};
use futures::StreamExt;
use payment_pipeline::domain::message::{NotificationMessage, PaymentStatusMessage};
use payment_pipeline::domain::payment::PaymentStatus;
use payment_pipeline::error::{PaymentError, Result, codes};
use payment_pipeline::infrastructure::in_memory::{InMemoryMetrics, MetricKind};
use payment_pipeline::infrastructure::in_memory_broker::InMemoryBroker;
use payment_pipeline::messaging::channel::RECEIVE_ERROR_BACKOFF;
use payment_pipeline::messaging::topology::{
    BindingSpec, DEAD_LETTER_EXCHANGE, DEFAULT_EXCHANGE, ExchangeSpec, NOTIFICATION_QUEUE,
    PAYMENT_QUEUE, PAYMENT_STATUS_EXCHANGE, PAYMENT_STATUS_QUEUE, QueueSpec,
};
use payment_pipeline::messaging::{
    Broker, Delivery, DeliveryStream, Envelope, MessageChannel, MessageHandler, QueueStats,
    Topology, TopologyDeclarer,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Fails the first `failures` deliveries, then succeeds.
struct FlakyHandler {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl MessageHandler<PaymentStatusMessage> for FlakyHandler {
    async fn handle(&self, _message: PaymentStatusMessage) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(PaymentError::database(codes::DB_ERROR, "database is locked"));
        }
        Ok(())
    }
}

/// Broker whose delivery stream yields nothing but receive errors.
#[derive(Default)]
struct BrokenStreamBroker {
    polls: Arc<AtomicU32>,
}

#[async_trait]
impl TopologyDeclarer for BrokenStreamBroker {
    async fn declare_exchange(&self, _spec: &ExchangeSpec) -> Result<()> {
        Ok(())
    }

    async fn declare_queue(&self, _spec: &QueueSpec) -> Result<()> {
        Ok(())
    }

    async fn bind_queue(&self, _spec: &BindingSpec) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Broker for BrokenStreamBroker {
    async fn publish(&self, _envelope: Envelope) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, _queue: &str) -> Result<DeliveryStream> {
        let polls = self.polls.clone();
        Ok(futures::stream::repeat_with(move || {
            polls.fetch_add(1, Ordering::SeqCst);
            Err::<Box<dyn Delivery>, _>(PaymentError::messaging(
                codes::CONSUME_ERROR,
                "connection reset",
            ))
        })
        .boxed())
    }

    async fn inspect_queue(&self, _queue: &str) -> Result<QueueStats> {
        Ok(QueueStats::default())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

async fn channel() -> (InMemoryBroker, Arc<InMemoryMetrics>, MessageChannel) {
    let broker = InMemoryBroker::new();
    Topology::payment_pipeline().declare(&broker).await.unwrap();
    let metrics = Arc::new(InMemoryMetrics::new());
    let channel = MessageChannel::new(Arc::new(broker.clone()), metrics.clone());
    (broker, metrics, channel)
}

#[tokio::test]
async fn test_undecodable_payment_is_dead_lettered() {
    let h = Harness::new().await;
    h.start().await;

    h.broker.push_raw(PAYMENT_QUEUE, "{not json").unwrap();

    assert!(wait_until(|| async { h.broker.dead_letters().len() == 1 }).await);
    let dead = &h.broker.dead_letters()[0];
    assert_eq!(dead.queue, PAYMENT_QUEUE);
    assert_eq!(dead.dead_letter_exchange.as_deref(), Some(DEAD_LETTER_EXCHANGE));
    assert_eq!(dead.envelope.body, b"{not json".to_vec());

    assert!(
        wait_until(|| async {
            h.metrics.count(MetricKind::DeadLetter, PAYMENT_QUEUE, "unmarshal_error") == 1
        })
        .await
    );
    assert_eq!(h.broker.queue_len(PAYMENT_QUEUE), 0);
    assert!(h.store.is_empty().await);

    h.shutdown().await;
}

#[tokio::test]
async fn test_handler_failure_requeues_until_success() {
    let (broker, metrics, channel) = channel().await;
    let handler = Arc::new(FlakyHandler {
        failures: 2,
        calls: AtomicU32::new(0),
    });
    channel
        .consume::<PaymentStatusMessage>(PAYMENT_STATUS_QUEUE, handler.clone())
        .await
        .unwrap();

    let message = PaymentStatusMessage::new("O1", PaymentStatus::Pending, PaymentStatus::Completed);
    channel
        .publish(PAYMENT_STATUS_EXCHANGE, "status.O1", &message)
        .await
        .unwrap();

    assert!(
        wait_until(|| async {
            metrics.count(MetricKind::Processed, PAYMENT_STATUS_QUEUE, "completed") == 1
        })
        .await
    );
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert_eq!(metrics.count(MetricKind::Retry, PAYMENT_STATUS_QUEUE, "handler_error"), 2);
    assert!(broker.dead_letters().is_empty());
    assert!(metrics.timings(PAYMENT_STATUS_QUEUE) >= 2);

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_second_consumer_on_queue_is_rejected() {
    let (_broker, _metrics, channel) = channel().await;
    let handler = Arc::new(FlakyHandler {
        failures: 0,
        calls: AtomicU32::new(0),
    });
    channel
        .consume::<PaymentStatusMessage>(PAYMENT_STATUS_QUEUE, handler.clone())
        .await
        .unwrap();

    let err = channel
        .consume::<PaymentStatusMessage>(PAYMENT_STATUS_QUEUE, handler)
        .await
        .unwrap_err();
    assert_eq!(err.code, codes::DUPLICATE_CONSUMER);

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_publish_records_destination_queue() {
    let (broker, metrics, channel) = channel().await;
    let notification = NotificationMessage::email("a@example.com", "Hi", "Body");

    channel
        .publish(DEFAULT_EXCHANGE, NOTIFICATION_QUEUE, &notification)
        .await
        .unwrap();

    assert_eq!(broker.queue_len(NOTIFICATION_QUEUE), 1);
    assert_eq!(metrics.count(MetricKind::Published, NOTIFICATION_QUEUE, "email"), 1);
    let envelope = &broker.published()[0];
    assert_eq!(envelope.message_id, notification.id.to_string());
    assert_eq!(envelope.content_type, "application/json");
    assert!(envelope.persistent);
}

#[tokio::test]
async fn test_close_is_idempotent_and_blocks_publish() {
    let (_broker, _metrics, channel) = channel().await;
    channel.close().await.unwrap();
    channel.close().await.unwrap();
    assert!(channel.is_closed());

    let message = PaymentStatusMessage::new("O1", PaymentStatus::Pending, PaymentStatus::Failed);
    let err = channel
        .publish(PAYMENT_STATUS_EXCHANGE, "status.O1", &message)
        .await
        .unwrap_err();
    assert_eq!(err.code, codes::CHANNEL_CLOSED);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_receive_errors_back_off_until_close() {
    let broker = BrokenStreamBroker::default();
    let polls = broker.polls.clone();
    let channel = MessageChannel::new(Arc::new(broker), Arc::new(InMemoryMetrics::new()));
    let handler = Arc::new(FlakyHandler {
        failures: 0,
        calls: AtomicU32::new(0),
    });
    channel
        .consume::<PaymentStatusMessage>(PAYMENT_STATUS_QUEUE, handler)
        .await
        .unwrap();

    tokio::time::sleep(RECEIVE_ERROR_BACKOFF / 5).await;
    assert_eq!(polls.load(Ordering::SeqCst), 1);

    tokio::time::timeout(Duration::from_millis(500), channel.close())
        .await
        .expect("close interrupts the backoff")
        .unwrap();
}
