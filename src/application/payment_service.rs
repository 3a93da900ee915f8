use super::orchestrator::PaymentOrchestrator;
use crate::domain::payment::{Amount, Payment, PaymentStatus, ProviderType};
use crate::domain::ports::PaymentStoreRef;
use crate::error::{PaymentError, Result, codes};
use crate::provider::{PaymentRequest, ProviderRegistry, WebhookEvent};
use crate::retry::{RetryStrategy, with_retry};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Provider-facing operations.
///
/// Talks to the payment backends and hands every resulting state change to
/// the [`PaymentOrchestrator`] as a message; it never writes the store itself.
pub struct PaymentService {
    registry: Arc<ProviderRegistry>,
    store: PaymentStoreRef,
    orchestrator: Arc<PaymentOrchestrator>,
    retry: RetryStrategy,
}

impl PaymentService {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: PaymentStoreRef,
        orchestrator: Arc<PaymentOrchestrator>,
        retry: RetryStrategy,
    ) -> Self {
        Self {
            registry,
            store,
            orchestrator,
            retry,
        }
    }

    /// Charges `request` through `provider_type` and publishes the resulting
    /// snapshot. A declined charge is returned as a `Failed` payment.
    pub async fn submit_payment(
        &self,
        cancel: &CancellationToken,
        request: PaymentRequest,
        provider_type: &ProviderType,
    ) -> Result<Payment> {
        let provider = self.registry.get(provider_type)?;
        let request_ref = &request;
        let response = with_retry(cancel, &self.retry, || {
            provider.process_payment(request_ref)
        })
        .await
        .map_err(|e| e.with_order_id(request.order_id.clone()))?;

        let mut payment = Payment::new(
            request.order_id,
            request.amount,
            request.currency,
            provider_type.clone(),
        );
        payment.customer_id = request.customer_id;
        payment.customer_email = request.customer_email;
        payment.description = request.description;
        payment.metadata = request.metadata;
        payment.transaction_id = response.transaction_id;
        payment.payment_details = response.payment_details;
        payment.error_message = response.error_message;
        payment.status = match response.status {
            PaymentStatus::Unknown => PaymentStatus::Pending,
            status => status,
        };
        if payment.status == PaymentStatus::Completed {
            payment.completed_at = Some(payment.updated_at);
        }

        tracing::info!(
            order_id = %payment.order_id,
            provider = %provider_type,
            status = %payment.status,
            success = response.success,
            "Payment processed by provider"
        );

        self.orchestrator.process_payment_async(&payment).await?;
        Ok(payment)
    }

    /// Refunds a completed payment, in full when `amount` is `None`.
    pub async fn refund_payment(
        &self,
        cancel: &CancellationToken,
        order_id: &str,
        amount: Option<Amount>,
    ) -> Result<()> {
        let payment = self.get_payment(order_id).await?;

        if payment.status != PaymentStatus::Completed {
            return Err(PaymentError::validation(
                codes::INVALID_REFUND,
                format!("Cannot refund a {} payment", payment.status),
            )
            .with_order_id(order_id));
        }
        let Some(transaction_id) = payment.transaction_id.clone() else {
            return Err(PaymentError::validation(
                codes::INVALID_REFUND,
                "Payment has no provider transaction",
            )
            .with_order_id(order_id));
        };
        let amount = amount.unwrap_or(payment.amount);
        if amount.value() > payment.amount.value() {
            return Err(PaymentError::validation(
                codes::INVALID_REFUND,
                format!(
                    "Refund of {amount} exceeds payment amount {}",
                    payment.amount
                ),
            )
            .with_order_id(order_id));
        }

        let provider = self.registry.get(&payment.provider_type)?;
        let (tx, currency) = (transaction_id.as_str(), &payment.currency);
        with_retry(cancel, &self.retry, || {
            provider.refund_payment(tx, amount, currency)
        })
        .await
        .map_err(|e| e.with_order_id(order_id))?;

        tracing::info!(order_id, amount = %amount, "Refund confirmed by provider");
        self.orchestrator
            .update_payment_status_async(
                order_id,
                PaymentStatus::Completed,
                PaymentStatus::Refunded,
                Some(transaction_id),
            )
            .await
    }

    /// Verifies and applies a provider webhook. Events without a status
    /// change are acknowledged and ignored.
    pub async fn handle_webhook(
        &self,
        cancel: &CancellationToken,
        provider_type: &ProviderType,
        payload: &[u8],
        signature: &str,
    ) -> Result<WebhookEvent> {
        let provider = self.registry.get(provider_type)?;
        let event = provider.validate_webhook(payload, signature).inspect_err(|e| {
            tracing::warn!(provider = %provider_type, error = %e, "Rejected webhook");
        })?;

        if !event.status.is_known() {
            tracing::debug!(provider = %provider_type, event_type = %event.event_type, "Ignoring webhook event");
            return Ok(event);
        }
        let Some(transaction_id) = event.transaction_id.as_deref() else {
            return Err(PaymentError::validation(
                codes::INVALID_WEBHOOK,
                format!("Webhook event {} carries no transaction id", event.event_type),
            ));
        };

        let store = &self.store;
        let payment = with_retry(cancel, &self.retry, || {
            store.find_by_transaction_id(transaction_id)
        })
        .await?
        .ok_or_else(|| {
            PaymentError::database(
                codes::PAYMENT_NOT_FOUND,
                format!("No payment for transaction {transaction_id}"),
            )
            .with_retryable(false)
        })?;

        if payment.status != event.status {
            tracing::info!(
                order_id = %payment.order_id,
                event_type = %event.event_type,
                from = %payment.status,
                to = %event.status,
                "Webhook changes payment status"
            );
            self.orchestrator
                .update_payment_status_async(
                    &payment.order_id,
                    payment.status,
                    event.status,
                    Some(transaction_id.to_string()),
                )
                .await?;
        }
        Ok(event)
    }

    /// Polls the provider for the current status and publishes a change the
    /// same way a webhook would. Provider failures yield `Unknown`.
    pub async fn reconcile_status(
        &self,
        cancel: &CancellationToken,
        order_id: &str,
    ) -> Result<PaymentStatus> {
        let payment = self.get_payment(order_id).await?;
        let Some(transaction_id) = payment.transaction_id.as_deref() else {
            tracing::debug!(order_id, "No provider transaction to reconcile");
            return Ok(payment.status);
        };

        let provider = self.registry.get(&payment.provider_type)?;
        let status = match with_retry(cancel, &self.retry, || {
            provider.get_payment_status(transaction_id)
        })
        .await
        {
            Ok(status) => status,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                tracing::warn!(order_id, error = %e, "Failed to fetch provider status");
                return Ok(PaymentStatus::Unknown);
            }
        };

        if status.is_known() && status != payment.status {
            tracing::info!(order_id, from = %payment.status, to = %status, "Reconciled payment status");
            self.orchestrator
                .update_payment_status_async(
                    order_id,
                    payment.status,
                    status,
                    Some(transaction_id.to_string()),
                )
                .await?;
        }
        Ok(status)
    }

    pub async fn get_payment(&self, order_id: &str) -> Result<Payment> {
        self.store
            .find_by_order_id(order_id)
            .await?
            .ok_or_else(|| PaymentError::not_found(order_id))
    }
}
