use crate::domain::message::{NotificationMessage, PaymentMessage, PaymentStatusMessage};
use crate::domain::payment::{Payment, PaymentStatus, Transition};
use crate::domain::ports::{
    InsertOutcome, NotificationSinkRef, NotifierRef, PaymentStoreRef, StatusUpdate,
};
use crate::error::{PaymentError, Result, codes};
use crate::messaging::topology::{
    NOTIFICATION_QUEUE, PAYMENT_EXCHANGE, PAYMENT_QUEUE, PAYMENT_STATUS_EXCHANGE,
    PAYMENT_STATUS_QUEUE, payment_routing_key, status_routing_key,
};
use crate::messaging::{MessageChannel, MessageHandler};
use crate::retry::{RetryStrategy, with_retry};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Owns every payment mutation.
///
/// Producer side: publishes payment snapshots and status changes. Consumer
/// side: applies them idempotently to the store and emits notifications.
/// Notification failures are logged and never undo a state change.
pub struct PaymentOrchestrator {
    store: PaymentStoreRef,
    notifier: NotifierRef,
    channel: Arc<MessageChannel>,
    retry: RetryStrategy,
    shutdown: CancellationToken,
}

impl PaymentOrchestrator {
    pub fn new(
        store: PaymentStoreRef,
        notifier: NotifierRef,
        channel: Arc<MessageChannel>,
        retry: RetryStrategy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            notifier,
            channel,
            retry,
            shutdown,
        }
    }

    /// Registers the payment, status and notification consumers.
    pub async fn start_consumers(self: &Arc<Self>, sink: NotificationSinkRef) -> Result<()> {
        self.channel
            .consume::<PaymentMessage>(PAYMENT_QUEUE, self.clone())
            .await?;
        self.channel
            .consume::<PaymentStatusMessage>(PAYMENT_STATUS_QUEUE, self.clone())
            .await?;
        self.channel
            .consume::<NotificationMessage>(
                NOTIFICATION_QUEUE,
                Arc::new(NotificationDispatcher::new(sink)),
            )
            .await?;
        tracing::info!("Started processing async operations");
        Ok(())
    }

    /// Publishes `payment` for durable recording, retrying transient failures.
    pub async fn process_payment_async(&self, payment: &Payment) -> Result<()> {
        let message = PaymentMessage::from(payment);
        let routing_key = payment_routing_key(&payment.provider_type);
        let (channel, message, routing_key) = (&self.channel, &message, routing_key.as_str());

        with_retry(&self.shutdown, &self.retry, move || async move {
            channel
                .publish(PAYMENT_EXCHANGE, routing_key, message)
                .await
                .map_err(|e| {
                    PaymentError::messaging(codes::PUBLISH_ERROR, "Failed to publish payment message")
                        .with_order_id(message.order_id.clone())
                        .with_retryable(e.is_retryable())
                        .with_source(e)
                })
        })
        .await
    }

    /// Publishes a status change request, retrying transient failures.
    pub async fn update_payment_status_async(
        &self,
        order_id: &str,
        old_status: PaymentStatus,
        new_status: PaymentStatus,
        transaction_id: Option<String>,
    ) -> Result<()> {
        let mut message = PaymentStatusMessage::new(order_id, old_status, new_status);
        message.transaction_id = transaction_id;
        let routing_key = status_routing_key(order_id);
        let (channel, message, routing_key) = (&self.channel, &message, routing_key.as_str());

        with_retry(&self.shutdown, &self.retry, move || async move {
            channel
                .publish(PAYMENT_STATUS_EXCHANGE, routing_key, message)
                .await
                .map_err(|e| {
                    PaymentError::messaging(
                        codes::STATUS_PUBLISH_ERROR,
                        "Failed to publish status update message",
                    )
                    .with_order_id(message.order_id.clone())
                    .with_retryable(e.is_retryable())
                    .with_source(e)
                })
        })
        .await
    }

    async fn record_payment(&self, message: &PaymentMessage) -> Result<()> {
        if !message.status.is_known() {
            return Err(PaymentError::validation(
                codes::INVALID_STATUS,
                "Payment message carries no known status",
            )
            .with_order_id(message.order_id.clone()));
        }
        // A snapshot may only carry a state reachable directly from Pending.
        if message.status != PaymentStatus::Pending
            && !PaymentStatus::Pending.can_transition_to(message.status)
        {
            return Err(PaymentError::validation(
                codes::INVALID_TRANSITION,
                format!("Payment cannot be recorded as {}", message.status),
            )
            .with_order_id(message.order_id.clone()));
        }

        match self.store.insert_if_absent(message.to_payment()).await? {
            InsertOutcome::Inserted => {
                tracing::info!(
                    order_id = %message.order_id,
                    status = %message.status,
                    provider = %message.provider,
                    "Payment recorded"
                );
                let notification = NotificationMessage::email(
                    &message.customer_email,
                    format!("Payment Received - Order {}", message.order_id),
                    format!(
                        "We have received your payment of {} {}",
                        message.amount, message.currency
                    ),
                )
                .with_metadata("order_id", &message.order_id);
                self.notify(&message.order_id, notification).await;
                Ok(())
            }
            InsertOutcome::Existing(existing)
                if existing.status == PaymentStatus::Pending
                    && message.status != PaymentStatus::Pending =>
            {
                self.apply_status(StatusUpdate {
                    order_id: message.order_id.clone(),
                    status: message.status,
                    transaction_id: message.transaction_id.clone(),
                })
                .await
            }
            InsertOutcome::Existing(existing) => {
                tracing::debug!(
                    order_id = %message.order_id,
                    status = %existing.status,
                    "Duplicate payment message ignored"
                );
                Ok(())
            }
        }
    }

    async fn apply_status(&self, update: StatusUpdate) -> Result<()> {
        let order_id = update.order_id.clone();
        let requested = update.status;

        match self.store.update_status(update).await {
            Ok((Transition::Applied { from, to }, payment)) => {
                tracing::info!(order_id = %order_id, from = %from, to = %to, "Payment status updated");
                let notification = NotificationMessage::email(
                    &payment.customer_email,
                    format!("Payment Status Updated - Order {order_id}"),
                    format!("Your payment status has been updated to {to}"),
                )
                .with_metadata("order_id", &order_id)
                .with_metadata("status", to.as_str());
                self.notify(&order_id, notification).await;
                Ok(())
            }
            Ok((Transition::Unchanged, _)) => {
                tracing::debug!(order_id = %order_id, status = %requested, "Status already applied");
                Ok(())
            }
            Err(e) if e.code == codes::INVALID_TRANSITION => {
                tracing::warn!(order_id = %order_id, error = %e, "Stale status message ignored");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn notify(&self, order_id: &str, notification: NotificationMessage) {
        if let Err(e) = self.notifier.publish(notification).await {
            tracing::warn!(order_id, error = %e, "Failed to send notification");
        }
    }
}

#[async_trait]
impl MessageHandler<PaymentMessage> for PaymentOrchestrator {
    async fn handle(&self, message: PaymentMessage) -> Result<()> {
        let (this, message) = (self, &message);
        with_retry(&self.shutdown, &self.retry, move || this.record_payment(message)).await
    }
}

#[async_trait]
impl MessageHandler<PaymentStatusMessage> for PaymentOrchestrator {
    async fn handle(&self, message: PaymentStatusMessage) -> Result<()> {
        if !message.new_status.is_known() {
            return Err(PaymentError::validation(
                codes::INVALID_STATUS,
                "Status message carries no known status",
            )
            .with_order_id(message.order_id));
        }

        let update = StatusUpdate {
            order_id: message.order_id,
            status: message.new_status,
            transaction_id: message.transaction_id,
        };
        let (this, update) = (self, &update);
        with_retry(&self.shutdown, &self.retry, move || this.apply_status(update.clone())).await
    }
}

/// Hands notifications taken off the queue to the configured sink.
pub struct NotificationDispatcher {
    sink: NotificationSinkRef,
}

impl NotificationDispatcher {
    pub fn new(sink: NotificationSinkRef) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl MessageHandler<NotificationMessage> for NotificationDispatcher {
    async fn handle(&self, message: NotificationMessage) -> Result<()> {
        self.sink.deliver(&message).await
    }
}
