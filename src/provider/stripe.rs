use super::signature::{STRIPE_TOLERANCE_SECS, verify_stripe_signature};
use super::{
    GatewayError, GatewayResult, PaymentProvider, PaymentRequest, PaymentResponse,
    ProviderConfig, WebhookEvent, gateway_failure, invalid_webhook,
};
use crate::domain::payment::{Amount, Currency, Details, PaymentStatus, ProviderType};
use crate::error::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct StripeChargeRequest {
    /// Amount in the currency's smallest unit.
    pub amount: i64,
    /// Lower-case ISO code, as Stripe expects.
    pub currency: String,
    pub description: String,
    pub receipt_email: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Sent as the `Idempotency-Key` header; stable across retries of one order.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StripeOutcome {
    pub risk_level: Option<String>,
    pub seller_message: Option<String>,
}

/// The subset of a Stripe charge object the provider reads.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StripeCharge {
    pub id: String,
    #[serde(default)]
    pub paid: bool,
    #[serde(default)]
    pub refunded: bool,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub amount_refunded: i64,
    #[serde(default)]
    pub currency: String,
    pub receipt_url: Option<String>,
    pub payment_method: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub outcome: Option<StripeOutcome>,
}

impl StripeCharge {
    fn status(&self) -> PaymentStatus {
        if self.paid {
            PaymentStatus::Completed
        } else if self.status == "failed" {
            PaymentStatus::Failed
        } else {
            PaymentStatus::Pending
        }
    }

    /// Status as seen by a reconciliation poll, where refunds take precedence.
    fn polled_status(&self) -> PaymentStatus {
        if self.refunded {
            PaymentStatus::Refunded
        } else {
            self.status()
        }
    }
}

/// REST calls against the Stripe API.
#[async_trait]
pub trait StripeApi: Send + Sync {
    async fn create_charge(&self, request: &StripeChargeRequest) -> GatewayResult<StripeCharge>;
    async fn create_refund(&self, charge_id: &str, amount: i64) -> GatewayResult<()>;
    async fn retrieve_charge(&self, charge_id: &str) -> GatewayResult<StripeCharge>;
}

#[derive(Deserialize)]
struct StripeEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Deserialize)]
struct StripeEventData {
    object: Value,
}

pub struct StripeProvider {
    api: Arc<dyn StripeApi>,
    webhook_secret: String,
    test_mode: bool,
}

impl StripeProvider {
    pub fn new(api: Arc<dyn StripeApi>) -> Self {
        Self {
            api,
            webhook_secret: String::new(),
            test_mode: false,
        }
    }

    pub fn is_test_mode(&self) -> bool {
        self.test_mode
    }

    fn minor_to_decimal(amount: i64, currency: &str) -> Option<Decimal> {
        let exponent = Currency::new(currency).ok()?.minor_unit_exponent();
        Some(Decimal::new(amount, exponent))
    }
}

fn charge_details(charge: &StripeCharge) -> Details {
    let outcome = charge.outcome.clone().unwrap_or_default();
    let value = json!({
        "charge_id": charge.id,
        "payment_method": charge.payment_method,
        "receipt_url": charge.receipt_url,
        "risk_level": outcome.risk_level,
        "seller_message": outcome.seller_message,
    });
    match value {
        Value::Object(map) => map,
        _ => Details::new(),
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn initialize(&mut self, config: &ProviderConfig) -> Result<()> {
        // The key itself is held by the gateway client; only its presence is checked here.
        config.require(ProviderConfig::SECRET_KEY)?;
        self.webhook_secret = config.require(ProviderConfig::WEBHOOK_SECRET)?.to_string();
        self.test_mode = config.flag(ProviderConfig::TEST_MODE);
        tracing::debug!(provider = "stripe", test_mode = self.test_mode, "Provider initialized");
        Ok(())
    }

    async fn process_payment(&self, request: &PaymentRequest) -> Result<PaymentResponse> {
        let mut metadata: BTreeMap<String, String> = request
            .metadata
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect();
        metadata.insert("order_id".into(), request.order_id.clone());

        let charge_request = StripeChargeRequest {
            amount: request.amount.to_minor_units(&request.currency)?,
            currency: request.currency.code().to_ascii_lowercase(),
            description: request.description.clone(),
            receipt_email: Some(request.customer_email.clone()).filter(|e| !e.is_empty()),
            metadata,
            idempotency_key: format!("charge-{}", request.order_id),
        };

        match self.api.create_charge(&charge_request).await {
            Ok(charge) => {
                let status = charge.status();
                Ok(PaymentResponse {
                    success: charge.paid,
                    transaction_id: Some(charge.id.clone()),
                    status,
                    error_message: charge.failure_message.clone(),
                    payment_details: charge_details(&charge),
                })
            }
            Err(GatewayError::Declined(message)) => {
                tracing::info!(order_id = %request.order_id, reason = %message, "Stripe charge declined");
                Ok(PaymentResponse::declined(message))
            }
            Err(e) => Err(gateway_failure(&ProviderType::STRIPE, "charge", e)
                .with_order_id(request.order_id.clone())),
        }
    }

    fn validate_webhook(&self, payload: &[u8], signature: &str) -> Result<WebhookEvent> {
        verify_stripe_signature(
            payload,
            signature,
            &self.webhook_secret,
            STRIPE_TOLERANCE_SECS,
            chrono::Utc::now().timestamp(),
        )?;

        let event: StripeEvent = serde_json::from_slice(payload)
            .map_err(|e| invalid_webhook("Malformed Stripe event").with_source(e))?;

        let status = match event.event_type.as_str() {
            "charge.succeeded" => PaymentStatus::Completed,
            "charge.failed" => PaymentStatus::Failed,
            "charge.refunded" => PaymentStatus::Refunded,
            _ => PaymentStatus::Unknown,
        };

        if status == PaymentStatus::Unknown {
            return Ok(WebhookEvent {
                event_type: event.event_type,
                transaction_id: event.data.object.get("id").and_then(Value::as_str).map(String::from),
                status,
                amount: None,
                currency: None,
                payment_details: Details::new(),
            });
        }

        let charge: StripeCharge = serde_json::from_value(event.data.object)
            .map_err(|e| invalid_webhook("Malformed Stripe charge").with_source(e))?;

        let mut details = Details::new();
        let minor = match status {
            PaymentStatus::Completed => {
                details.insert("receipt_url".into(), json!(charge.receipt_url));
                details.insert("payment_method".into(), json!(charge.payment_method));
                charge.amount
            }
            PaymentStatus::Failed => {
                details.insert("failure_code".into(), json!(charge.failure_code));
                details.insert("failure_message".into(), json!(charge.failure_message));
                charge.amount
            }
            _ => charge.amount_refunded,
        };

        Ok(WebhookEvent {
            event_type: event.event_type,
            transaction_id: Some(charge.id.clone()),
            status,
            amount: Self::minor_to_decimal(minor, &charge.currency),
            currency: Some(charge.currency.to_ascii_uppercase()).filter(|c| !c.is_empty()),
            payment_details: details,
        })
    }

    async fn refund_payment(
        &self,
        transaction_id: &str,
        amount: Amount,
        currency: &Currency,
    ) -> Result<()> {
        let minor = amount.to_minor_units(currency)?;
        self.api
            .create_refund(transaction_id, minor)
            .await
            .map_err(|e| gateway_failure(&ProviderType::STRIPE, "refund", e))
    }

    async fn get_payment_status(&self, transaction_id: &str) -> Result<PaymentStatus> {
        let charge = self
            .api
            .retrieve_charge(transaction_id)
            .await
            .map_err(|e| gateway_failure(&ProviderType::STRIPE, "charge lookup", e))?;
        Ok(charge.polled_status())
    }
}
