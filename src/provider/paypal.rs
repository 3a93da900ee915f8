use super::signature::verify_paypal_signature;
use super::{
    GatewayError, GatewayResult, PaymentProvider, PaymentRequest, PaymentResponse,
    ProviderConfig, WebhookEvent, gateway_failure, invalid_webhook,
};
use crate::domain::payment::{Amount, Currency, Details, PaymentStatus, ProviderType};
use crate::error::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayPalMoney {
    pub currency_code: String,
    pub value: String,
}

impl PayPalMoney {
    /// Formats `amount` with exactly as many decimals as the currency uses.
    pub fn new(amount: Amount, currency: &Currency) -> Self {
        let scale = currency.minor_unit_exponent();
        Self {
            currency_code: currency.code().to_string(),
            value: format!("{:.*}", scale as usize, amount.value().round_dp(scale)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayPalOrderRequest {
    pub reference_id: String,
    pub custom_id: String,
    pub amount: PayPalMoney,
    pub description: String,
    /// Sent as `PayPal-Request-Id` so a repeated create returns the same order.
    pub request_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PayPalOrder {
    pub id: String,
    #[serde(default)]
    pub status: String,
}

/// The subset of a PayPal capture resource the provider reads.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PayPalCapture {
    pub id: String,
    #[serde(default)]
    pub status: String,
    pub amount: Option<PayPalMoney>,
    pub create_time: Option<String>,
    pub update_time: Option<String>,
}

/// REST calls against the PayPal Orders and Payments APIs.
#[async_trait]
pub trait PayPalApi: Send + Sync {
    async fn create_order(&self, request: &PayPalOrderRequest) -> GatewayResult<PayPalOrder>;
    /// `request_id` is sent as `PayPal-Request-Id`; a repeat returns the first capture.
    async fn capture_order(
        &self,
        order_id: &str,
        request_id: &str,
    ) -> GatewayResult<PayPalCapture>;
    async fn refund_capture(&self, capture_id: &str, amount: &PayPalMoney) -> GatewayResult<()>;
    async fn get_capture(&self, capture_id: &str) -> GatewayResult<PayPalCapture>;
}

#[derive(Deserialize)]
struct PayPalEvent {
    event_type: String,
    #[serde(default)]
    resource_type: String,
    #[serde(default)]
    resource: Value,
}

fn capture_status(status: &str) -> PaymentStatus {
    match status {
        "COMPLETED" => PaymentStatus::Completed,
        "DECLINED" => PaymentStatus::Failed,
        "REFUNDED" => PaymentStatus::Refunded,
        _ => PaymentStatus::Pending,
    }
}

pub struct PayPalProvider {
    api: Arc<dyn PayPalApi>,
    client_id: String,
    webhook_secret: String,
    test_mode: bool,
}

impl PayPalProvider {
    pub fn new(api: Arc<dyn PayPalApi>) -> Self {
        Self {
            api,
            client_id: String::new(),
            webhook_secret: String::new(),
            test_mode: false,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_test_mode(&self) -> bool {
        self.test_mode
    }
}

#[async_trait]
impl PaymentProvider for PayPalProvider {
    fn initialize(&mut self, config: &ProviderConfig) -> Result<()> {
        self.client_id = config.require(ProviderConfig::CLIENT_ID)?.to_string();
        config.require(ProviderConfig::SECRET_KEY)?;
        self.webhook_secret = config.require(ProviderConfig::WEBHOOK_SECRET)?.to_string();
        self.test_mode = config.flag(ProviderConfig::TEST_MODE);
        tracing::debug!(provider = "paypal", test_mode = self.test_mode, "Provider initialized");
        Ok(())
    }

    async fn process_payment(&self, request: &PaymentRequest) -> Result<PaymentResponse> {
        let order_request = PayPalOrderRequest {
            reference_id: request.order_id.clone(),
            custom_id: request.order_id.clone(),
            amount: PayPalMoney::new(request.amount, &request.currency),
            description: request.description.clone(),
            request_id: format!("order-{}", request.order_id),
        };

        let declined = |message: String| {
            tracing::info!(order_id = %request.order_id, reason = %message, "PayPal payment declined");
            Ok(PaymentResponse::declined(message))
        };

        let order = match self.api.create_order(&order_request).await {
            Ok(order) => order,
            Err(GatewayError::Declined(message)) => return declined(message),
            Err(e) => {
                return Err(gateway_failure(&ProviderType::PAYPAL, "order creation", e)
                    .with_order_id(request.order_id.clone()));
            }
        };

        let capture_request_id = format!("capture-{}", request.order_id);
        let capture = match self.api.capture_order(&order.id, &capture_request_id).await {
            Ok(capture) => capture,
            Err(GatewayError::Declined(message)) => return declined(message),
            Err(e) => {
                return Err(gateway_failure(&ProviderType::PAYPAL, "capture", e)
                    .with_order_id(request.order_id.clone()));
            }
        };

        // A refund cannot be the outcome of a fresh capture.
        let status = match capture_status(&capture.status) {
            PaymentStatus::Refunded => PaymentStatus::Pending,
            status => status,
        };
        let details = json!({
            "order_id": order.id,
            "capture_id": capture.id,
            "status": capture.status,
            "create_time": capture.create_time,
            "update_time": capture.update_time,
        });

        Ok(PaymentResponse {
            success: status == PaymentStatus::Completed,
            transaction_id: Some(capture.id.clone()),
            status,
            error_message: None,
            payment_details: match details {
                Value::Object(map) => map,
                _ => Details::new(),
            },
        })
    }

    fn validate_webhook(&self, payload: &[u8], signature: &str) -> Result<WebhookEvent> {
        verify_paypal_signature(payload, signature, &self.webhook_secret)?;

        let event: PayPalEvent = serde_json::from_slice(payload)
            .map_err(|e| invalid_webhook("Malformed PayPal event").with_source(e))?;

        if event.resource_type != "capture" {
            return Ok(WebhookEvent {
                event_type: event.event_type,
                transaction_id: None,
                status: PaymentStatus::Unknown,
                amount: None,
                currency: None,
                payment_details: Details::new(),
            });
        }

        let capture: PayPalCapture = serde_json::from_value(event.resource)
            .map_err(|e| invalid_webhook("Malformed PayPal capture").with_source(e))?;

        let status = match event.event_type.as_str() {
            "PAYMENT.CAPTURE.COMPLETED" => PaymentStatus::Completed,
            "PAYMENT.CAPTURE.DENIED" => PaymentStatus::Failed,
            "PAYMENT.CAPTURE.REFUNDED" => PaymentStatus::Refunded,
            _ => PaymentStatus::Unknown,
        };

        let mut details = Details::new();
        details.insert("capture_id".into(), json!(capture.id));
        details.insert("status".into(), json!(capture.status));
        details.insert("create_time".into(), json!(capture.create_time));
        details.insert("update_time".into(), json!(capture.update_time));

        Ok(WebhookEvent {
            event_type: event.event_type,
            transaction_id: Some(capture.id),
            status,
            amount: capture
                .amount
                .as_ref()
                .and_then(|m| Decimal::from_str(&m.value).ok()),
            currency: capture.amount.map(|m| m.currency_code),
            payment_details: details,
        })
    }

    async fn refund_payment(
        &self,
        transaction_id: &str,
        amount: Amount,
        currency: &Currency,
    ) -> Result<()> {
        self.api
            .refund_capture(transaction_id, &PayPalMoney::new(amount, currency))
            .await
            .map_err(|e| gateway_failure(&ProviderType::PAYPAL, "refund", e))
    }

    async fn get_payment_status(&self, transaction_id: &str) -> Result<PaymentStatus> {
        let capture = self
            .api
            .get_capture(transaction_id)
            .await
            .map_err(|e| gateway_failure(&ProviderType::PAYPAL, "capture lookup", e))?;
        Ok(capture_status(&capture.status))
    }
}
