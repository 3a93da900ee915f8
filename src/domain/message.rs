//! Wire messages exchanged over the broker. All bodies are JSON with
//! snake_case field names.

use super::payment::{Amount, Currency, Details, Payment, PaymentStatus, ProviderType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A message that can travel through the message channel.
pub trait QueueMessage: Serialize + Send + Sync {
    /// Business key stamped on the envelope as its `message_id`.
    fn message_id(&self) -> String;

    /// Short label used when recording metrics for this message, usually the
    /// status it carries.
    fn label(&self) -> &'static str;
}

/// Full snapshot of a payment that needs durable recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMessage {
    pub order_id: String,
    pub amount: Amount,
    pub currency: Currency,
    pub status: PaymentStatus,
    pub provider: ProviderType,
    #[serde(default)]
    pub customer_id: String,
    #[serde(default)]
    pub customer_email: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Details::is_empty")]
    pub payment_details: Details,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Details::is_empty")]
    pub metadata: Details,
    pub created_at: DateTime<Utc>,
}

impl PaymentMessage {
    /// Materializes the payment row described by this message.
    pub fn to_payment(&self) -> Payment {
        let mut payment = Payment::new(
            self.order_id.clone(),
            self.amount,
            self.currency.clone(),
            self.provider.clone(),
        );
        payment.customer_id = self.customer_id.clone();
        payment.customer_email = self.customer_email.clone();
        payment.description = self.description.clone();
        payment.status = self.status;
        payment.transaction_id = self.transaction_id.clone();
        payment.payment_details = self.payment_details.clone();
        payment.metadata = self.metadata.clone();
        payment.error_message = self.error_message.clone();
        payment.created_at = self.created_at;
        if self.status == PaymentStatus::Completed {
            payment.completed_at = Some(payment.updated_at);
        }
        payment
    }
}

impl From<&Payment> for PaymentMessage {
    fn from(payment: &Payment) -> Self {
        Self {
            order_id: payment.order_id.clone(),
            amount: payment.amount,
            currency: payment.currency.clone(),
            status: payment.status,
            provider: payment.provider_type.clone(),
            customer_id: payment.customer_id.clone(),
            customer_email: payment.customer_email.clone(),
            description: payment.description.clone(),
            transaction_id: payment.transaction_id.clone(),
            payment_details: payment.payment_details.clone(),
            error_message: payment.error_message.clone(),
            metadata: payment.metadata.clone(),
            created_at: payment.created_at,
        }
    }
}

impl QueueMessage for PaymentMessage {
    fn message_id(&self) -> String {
        self.order_id.clone()
    }

    fn label(&self) -> &'static str {
        self.status.as_str()
    }
}

/// A requested status change for an existing payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentStatusMessage {
    pub order_id: String,
    pub old_status: PaymentStatus,
    pub new_status: PaymentStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Details::is_empty")]
    pub metadata: Details,
}

impl PaymentStatusMessage {
    pub fn new(order_id: impl Into<String>, old_status: PaymentStatus, new_status: PaymentStatus) -> Self {
        Self {
            order_id: order_id.into(),
            old_status,
            new_status,
            updated_at: Utc::now(),
            transaction_id: None,
            description: String::new(),
            metadata: Details::new(),
        }
    }
}

impl QueueMessage for PaymentStatusMessage {
    fn message_id(&self) -> String {
        self.order_id.clone()
    }

    fn label(&self) -> &'static str {
        self.new_status.as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Email,
    Sms,
    Push,
    Webhook,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Email => "email",
            NotificationType::Sms => "sms",
            NotificationType::Push => "push",
            NotificationType::Webhook => "webhook",
        }
    }
}

/// Outbound notification. Its delivery never affects payment state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub recipient: String,
    pub subject: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl NotificationMessage {
    pub fn email(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: NotificationType::Email,
            recipient: recipient.into(),
            subject: subject.into(),
            content: content.into(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl QueueMessage for NotificationMessage {
    fn message_id(&self) -> String {
        self.id.to_string()
    }

    fn label(&self) -> &'static str {
        self.kind.as_str()
    }
}
