use crate::domain::message::NotificationMessage;
use crate::domain::payment::{Payment, Transition};
use crate::domain::ports::{InsertOutcome, MetricsRecorder, Notifier, PaymentStore, StatusUpdate};
use crate::error::{PaymentError, Result, codes};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;

/// A thread-safe in-memory payment store.
///
/// Every write takes the single write lock, which makes the read-then-write
/// of `insert_if_absent` and `update_status` atomic per order.
#[derive(Default, Clone)]
pub struct InMemoryPaymentStore {
    payments: Arc<RwLock<HashMap<String, Payment>>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.payments.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.payments.read().await.is_empty()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments.get(order_id).cloned())
    }

    async fn find_by_transaction_id(&self, transaction_id: &str) -> Result<Option<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments
            .values()
            .find(|p| p.transaction_id.as_deref() == Some(transaction_id))
            .cloned())
    }

    async fn insert_if_absent(&self, payment: Payment) -> Result<InsertOutcome> {
        let mut payments = self.payments.write().await;
        if let Some(existing) = payments.get(&payment.order_id) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        payments.insert(payment.order_id.clone(), payment);
        Ok(InsertOutcome::Inserted)
    }

    async fn update_status(&self, update: StatusUpdate) -> Result<(Transition, Payment)> {
        let mut payments = self.payments.write().await;
        let payment = payments
            .get_mut(&update.order_id)
            .ok_or_else(|| PaymentError::not_found(update.order_id.clone()))?;

        let transition =
            payment.apply_status(update.status, update.transaction_id.as_deref(), Utc::now())?;
        Ok((transition, payment.clone()))
    }
}

/// Notifier keeping every published notification in memory. Can be told to
/// fail so that failure isolation can be observed.
#[derive(Default, Clone)]
pub struct RecordingNotifier {
    sent: Arc<RwLock<Vec<NotificationMessage>>>,
    failures: Arc<AtomicU32>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<NotificationMessage> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, notification: NotificationMessage) -> Result<()> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PaymentError::messaging(
                codes::PUBLISH_ERROR,
                "Notification publish failed",
            ));
        }
        self.sent.write().await.push(notification);
        Ok(())
    }
}

/// Metric kinds counted by [`InMemoryMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Processed,
    Error,
    Retry,
    DeadLetter,
    Published,
}

/// Counting metrics recorder for tests and local runs.
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<(MetricKind, String, String), u64>>,
    timings: Mutex<HashMap<String, Vec<Duration>>>,
    depths: Mutex<HashMap<String, (u32, u32)>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, kind: MetricKind, queue: &str, label: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters
            .get(&(kind, queue.to_string(), label.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Sum over every label for `kind` on `queue`.
    pub fn total(&self, kind: MetricKind, queue: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters
            .iter()
            .filter(|((k, q, _), _)| *k == kind && q == queue)
            .map(|(_, n)| n)
            .sum()
    }

    pub fn timings(&self, queue: &str) -> usize {
        let timings = self.timings.lock().unwrap_or_else(PoisonError::into_inner);
        timings.get(queue).map_or(0, Vec::len)
    }

    /// Last `(messages, consumers)` recorded for `queue`.
    pub fn depth(&self, queue: &str) -> Option<(u32, u32)> {
        let depths = self.depths.lock().unwrap_or_else(PoisonError::into_inner);
        depths.get(queue).copied()
    }

    fn incr(&self, kind: MetricKind, queue: &str, label: &str) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        *counters
            .entry((kind, queue.to_string(), label.to_string()))
            .or_default() += 1;
    }
}

impl MetricsRecorder for InMemoryMetrics {
    fn record_processed(&self, queue: &str, label: &str) {
        self.incr(MetricKind::Processed, queue, label);
    }

    fn record_error(&self, queue: &str, label: &str) {
        self.incr(MetricKind::Error, queue, label);
    }

    fn record_retry(&self, queue: &str, label: &str) {
        self.incr(MetricKind::Retry, queue, label);
    }

    fn record_dead_letter(&self, queue: &str, reason: &str) {
        self.incr(MetricKind::DeadLetter, queue, reason);
    }

    fn record_published(&self, queue: &str, label: &str) {
        self.incr(MetricKind::Published, queue, label);
    }

    fn record_processing_time(&self, queue: &str, elapsed: Duration) {
        let mut timings = self.timings.lock().unwrap_or_else(PoisonError::into_inner);
        timings.entry(queue.to_string()).or_default().push(elapsed);
    }

    fn record_queue_depth(&self, queue: &str, messages: u32, consumers: u32) {
        let mut depths = self.depths.lock().unwrap_or_else(PoisonError::into_inner);
        depths.insert(queue.to_string(), (messages, consumers));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payment::{Amount, Currency, PaymentStatus, ProviderType};
    use rust_decimal_macros::dec;

    fn payment(order_id: &str) -> Payment {
        Payment::new(
            order_id,
            Amount::new(dec!(100.0)).unwrap(),
            Currency::new("USD").unwrap(),
            ProviderType::STRIPE,
        )
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_first_row() {
        let store = InMemoryPaymentStore::new();
        let first = payment("O1");

        assert_eq!(store.insert_if_absent(first.clone()).await.unwrap(), InsertOutcome::Inserted);

        let mut second = payment("O1");
        second.status = PaymentStatus::Completed;
        match store.insert_if_absent(second).await.unwrap() {
            InsertOutcome::Existing(existing) => assert_eq!(existing, first),
            other => panic!("expected existing row, got {other:?}"),
        }
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_create_one_row() {
        let store = InMemoryPaymentStore::new();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.insert_if_absent(payment("O1")).await.unwrap()
            }));
        }

        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() == InsertOutcome::Inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_status_applies_state_machine() {
        let store = InMemoryPaymentStore::new();
        store.insert_if_absent(payment("O1")).await.unwrap();

        let (transition, updated) = store
            .update_status(StatusUpdate {
                order_id: "O1".into(),
                status: PaymentStatus::Completed,
                transaction_id: Some("ch_1".into()),
            })
            .await
            .unwrap();
        assert!(matches!(transition, Transition::Applied { .. }));
        assert_eq!(updated.status, PaymentStatus::Completed);

        let found = store.find_by_transaction_id("ch_1").await.unwrap().unwrap();
        assert_eq!(found.order_id, "O1");

        let err = store
            .update_status(StatusUpdate {
                order_id: "O1".into(),
                status: PaymentStatus::Pending,
                transaction_id: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::INVALID_TRANSITION);
    }

    #[tokio::test]
    async fn test_update_missing_payment() {
        let store = InMemoryPaymentStore::new();
        let err = store
            .update_status(StatusUpdate {
                order_id: "missing".into(),
                status: PaymentStatus::Refunded,
                transaction_id: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::PAYMENT_NOT_FOUND);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_recording_notifier_failure() {
        let notifier = RecordingNotifier::new();
        notifier.fail_next(1);
        let msg = NotificationMessage::email("a@b.c", "s", "c");
        assert!(notifier.publish(msg.clone()).await.is_err());
        assert!(notifier.publish(msg).await.is_ok());
        assert_eq!(notifier.sent().await.len(), 1);
    }

    #[test]
    fn test_metrics_counts() {
        let metrics = InMemoryMetrics::new();
        metrics.record_error("payments", "handler_error");
        metrics.record_error("payments", "unmarshal_error");
        metrics.record_error("payments", "handler_error");

        assert_eq!(metrics.count(MetricKind::Error, "payments", "handler_error"), 2);
        assert_eq!(metrics.total(MetricKind::Error, "payments"), 3);
        assert_eq!(metrics.total(MetricKind::Error, "notifications"), 0);
    }
}
