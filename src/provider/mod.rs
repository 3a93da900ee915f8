//! Uniform contract over payment backends.
//!
//! Each backend implements [`PaymentProvider`] on top of a thin gateway trait
//! (`StripeApi`, `PayPalApi`) that performs the actual REST calls, and is
//! registered in a [`ProviderRegistry`] under its [`ProviderType`].

pub mod paypal;
pub mod registry;
pub mod signature;
pub mod stripe;

use crate::domain::payment::{Amount, Currency, Details, PaymentStatus};
use crate::error::{PaymentError, Result, codes};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use thiserror::Error;

pub use crate::domain::payment::ProviderType;
pub use paypal::{PayPalApi, PayPalProvider};
pub use registry::{ProviderRegistry, ProviderRegistryBuilder};
pub use stripe::{StripeApi, StripeProvider};

/// Charge request handed to a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRequest {
    pub order_id: String,
    pub amount: Amount,
    pub currency: Currency,
    pub customer_id: String,
    pub customer_email: String,
    pub description: String,
    pub metadata: Details,
}

/// Normalized provider answer. A declined charge is a response with
/// `success == false` and `status == Failed`, not an error.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PaymentResponse {
    pub success: bool,
    pub transaction_id: Option<String>,
    pub status: PaymentStatus,
    pub error_message: Option<String>,
    pub payment_details: Details,
}

impl PaymentResponse {
    pub fn declined(message: impl Into<String>) -> Self {
        Self {
            success: false,
            transaction_id: None,
            status: PaymentStatus::Failed,
            error_message: Some(message.into()),
            payment_details: Details::new(),
        }
    }
}

/// A verified, normalized webhook notification.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub event_type: String,
    pub transaction_id: Option<String>,
    /// `Unknown` for event types that carry no status change.
    pub status: PaymentStatus,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub payment_details: Details,
}

/// String key/value configuration passed to [`PaymentProvider::initialize`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderConfig(HashMap<String, String>);

impl ProviderConfig {
    pub const SECRET_KEY: &'static str = "secret_key";
    pub const WEBHOOK_SECRET: &'static str = "webhook_secret";
    pub const CLIENT_ID: &'static str = "client_id";
    pub const TEST_MODE: &'static str = "test_mode";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// A required, non-empty value.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).filter(|v| !v.trim().is_empty()).ok_or_else(|| {
            PaymentError::validation(
                codes::PROVIDER_CONFIG,
                format!("Missing required provider setting '{key}'"),
            )
        })
    }

    /// Boolean flag; anything other than `"true"` is false.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

/// Capability set every payment backend offers.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Validates and stores configuration. Called once, before the provider
    /// is shared.
    fn initialize(&mut self, config: &ProviderConfig) -> Result<()>;

    async fn process_payment(&self, request: &PaymentRequest) -> Result<PaymentResponse>;

    /// Verifies the signature and normalizes the event. Signature failures
    /// are `INVALID_SIGNATURE` and never retryable.
    fn validate_webhook(&self, payload: &[u8], signature: &str) -> Result<WebhookEvent>;

    async fn refund_payment(
        &self,
        transaction_id: &str,
        amount: Amount,
        currency: &Currency,
    ) -> Result<()>;

    async fn get_payment_status(&self, transaction_id: &str) -> Result<PaymentStatus>;
}

/// Failure reported by a gateway (the REST client behind a provider).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The backend refused the operation (card declined, refund refused).
    #[error("declined: {0}")]
    Declined(String),
    /// The backend could not be reached or answered with a server error.
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Maps a gateway failure onto the pipeline error taxonomy.
pub(crate) fn gateway_failure(
    provider: &ProviderType,
    operation: &str,
    err: GatewayError,
) -> PaymentError {
    let message = format!("{provider} {operation} failed");
    match err {
        GatewayError::Transport(_) => {
            PaymentError::payment(codes::PROVIDER_UNAVAILABLE, message)
                .with_retryable(true)
                .with_source(err)
        }
        GatewayError::Authentication(_) => {
            PaymentError::authentication(codes::PROVIDER_AUTH, message).with_source(err)
        }
        GatewayError::Declined(_) => {
            PaymentError::payment(codes::PROVIDER_DECLINED, message).with_source(err)
        }
    }
}

fn invalid_webhook(message: impl Into<String>) -> PaymentError {
    PaymentError::validation(codes::INVALID_WEBHOOK, message)
}
