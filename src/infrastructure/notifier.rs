use crate::domain::message::NotificationMessage;
use crate::domain::ports::{NotificationSink, Notifier};
use crate::error::Result;
use crate::messaging::MessageChannel;
use crate::messaging::topology::{DEFAULT_EXCHANGE, NOTIFICATION_QUEUE};
use async_trait::async_trait;
use std::sync::Arc;

/// Publishes notifications onto the `notifications` queue through the
/// default exchange.
pub struct QueueNotifier {
    channel: Arc<MessageChannel>,
}

impl QueueNotifier {
    pub fn new(channel: Arc<MessageChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl Notifier for QueueNotifier {
    async fn publish(&self, notification: NotificationMessage) -> Result<()> {
        self.channel
            .publish(DEFAULT_EXCHANGE, NOTIFICATION_QUEUE, &notification)
            .await
    }
}

/// Sink that only logs what it would have sent.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn deliver(&self, notification: &NotificationMessage) -> Result<()> {
        tracing::info!(
            id = %notification.id,
            kind = notification.kind.as_str(),
            recipient = %notification.recipient,
            subject = %notification.subject,
            "Notification delivered"
        );
        Ok(())
    }
}
