use super::message::NotificationMessage;
use super::payment::{Payment, PaymentStatus, Transition};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Result of [`PaymentStore::insert_if_absent`].
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same `order_id` already existed and was left untouched.
    Existing(Payment),
}

/// Requested status change, applied atomically by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub order_id: String,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
}

/// Durable payment records keyed by `order_id`.
///
/// Implementations must make both write operations atomic per order so that
/// concurrent consumers cannot create duplicates or lose transitions.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<Payment>>;
    async fn find_by_transaction_id(&self, transaction_id: &str) -> Result<Option<Payment>>;
    async fn insert_if_absent(&self, payment: Payment) -> Result<InsertOutcome>;
    /// Applies the transition through [`Payment::apply_status`]. A missing row
    /// is `PAYMENT_NOT_FOUND`; a forbidden transition is `INVALID_TRANSITION`.
    async fn update_status(&self, update: StatusUpdate) -> Result<(Transition, Payment)>;
}

/// Emits notification messages for downstream delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, notification: NotificationMessage) -> Result<()>;
}

/// Final destination of notifications taken off the queue (mail, SMS, ...).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &NotificationMessage) -> Result<()>;
}

/// Recording hooks for pipeline metrics. Implementations must not block.
pub trait MetricsRecorder: Send + Sync {
    fn record_processed(&self, queue: &str, label: &str);
    fn record_error(&self, queue: &str, label: &str);
    fn record_retry(&self, queue: &str, label: &str);
    fn record_dead_letter(&self, queue: &str, reason: &str);
    fn record_published(&self, queue: &str, label: &str);
    fn record_processing_time(&self, queue: &str, elapsed: Duration);
    fn record_queue_depth(&self, queue: &str, messages: u32, consumers: u32);
}

pub type PaymentStoreRef = Arc<dyn PaymentStore>;
pub type NotifierRef = Arc<dyn Notifier>;
pub type NotificationSinkRef = Arc<dyn NotificationSink>;
pub type MetricsRef = Arc<dyn MetricsRecorder>;
