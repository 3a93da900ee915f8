use crate::error::{PaymentError, Result, codes};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque provider detail bag kept for audit.
pub type Details = serde_json::Map<String, serde_json::Value>;

/// Lifecycle state of a payment.
///
/// `Pending` → `Completed` | `Failed` | `Cancelled`, and `Completed` →
/// `Refunded`. Everything else is final. `Unknown` is only ever reported by a
/// provider that could not be reached; it is never a transition target.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Completed,
    Failed,
    Cancelled,
    Refunded,
    Unknown,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Unknown => "unknown",
        }
    }

    /// No transition may leave a final state.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Failed | PaymentStatus::Cancelled | PaymentStatus::Refunded
        )
    }

    pub fn is_known(&self) -> bool {
        *self != PaymentStatus::Unknown
    }

    /// Whether moving from `self` to `next` is a real transition.
    /// Re-applying the current status is not a transition; see [`Payment::apply_status`].
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Completed) | (Pending, Failed) | (Pending, Cancelled) | (Completed, Refunded)
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            "refunded" => Ok(PaymentStatus::Refunded),
            "unknown" => Ok(PaymentStatus::Unknown),
            other => Err(PaymentError::validation(
                codes::INVALID_STATUS,
                format!("Unknown payment status '{other}'"),
            )),
        }
    }
}

/// Key identifying a payment backend in the provider registry.
///
/// Open-ended so that new backends can be registered without touching this type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderType(Cow<'static, str>);

impl ProviderType {
    pub const STRIPE: ProviderType = ProviderType(Cow::Borrowed("stripe"));
    pub const PAYPAL: ProviderType = ProviderType(Cow::Borrowed("paypal"));

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into().to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A strictly positive monetary amount.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(PaymentError::validation(
                codes::INVALID_AMOUNT,
                "Amount must be positive",
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Converts to the currency's smallest unit (cents for USD, yen for JPY).
    /// Fails when the amount has more precision than the currency allows.
    pub fn to_minor_units(&self, currency: &Currency) -> Result<i64> {
        let factor = Decimal::from(10i64.pow(currency.minor_unit_exponent()));
        let scaled = self.0.checked_mul(factor).ok_or_else(|| {
            PaymentError::validation(codes::INVALID_AMOUNT, "Amount out of range")
        })?;
        if !scaled.fract().is_zero() {
            return Err(PaymentError::validation(
                codes::INVALID_AMOUNT,
                format!("Amount {} has too many decimal places for {}", self.0, currency),
            ));
        }
        scaled.to_i64().ok_or_else(|| {
            PaymentError::validation(codes::INVALID_AMOUNT, "Amount out of range")
        })
    }

    pub fn from_minor_units(units: i64, currency: &Currency) -> Result<Self> {
        Self::new(Decimal::new(units, currency.minor_unit_exponent()))
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = PaymentError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// ISO 4217 currency code, normalized to upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "BIF", "CLP", "DJF", "GNF", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF", "UGX", "VND", "VUV",
    "XAF", "XOF", "XPF",
];
const THREE_DECIMAL_CURRENCIES: &[&str] = &["BHD", "JOD", "KWD", "OMR", "TND"];

impl Currency {
    pub fn new(code: &str) -> Result<Self> {
        let code = code.trim().to_ascii_uppercase();
        if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self(code))
        } else {
            Err(PaymentError::validation(
                codes::INVALID_CURRENCY,
                format!("'{code}' is not an ISO 4217 currency code"),
            ))
        }
    }

    pub fn code(&self) -> &str {
        &self.0
    }

    pub fn minor_unit_exponent(&self) -> u32 {
        if ZERO_DECIMAL_CURRENCIES.contains(&self.0.as_str()) {
            0
        } else if THREE_DECIMAL_CURRENCIES.contains(&self.0.as_str()) {
            3
        } else {
            2
        }
    }
}

impl TryFrom<String> for Currency {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of applying a status to a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied { from: PaymentStatus, to: PaymentStatus },
    /// The payment already had the requested status.
    Unchanged,
}

/// The durable record of a payment attempt. Never deleted.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Payment {
    pub id: Uuid,
    /// Business key, unique across the store.
    pub order_id: String,
    pub customer_id: String,
    pub customer_email: String,
    pub amount: Amount,
    pub currency: Currency,
    pub description: String,
    pub status: PaymentStatus,
    pub provider_type: ProviderType,
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub payment_details: Details,
    #[serde(default)]
    pub metadata: Details,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn new(
        order_id: impl Into<String>,
        amount: Amount,
        currency: Currency,
        provider_type: ProviderType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            order_id: order_id.into(),
            customer_id: String::new(),
            customer_email: String::new(),
            amount,
            currency,
            description: String::new(),
            status: PaymentStatus::Pending,
            provider_type,
            transaction_id: None,
            payment_details: Details::new(),
            metadata: Details::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Moves the payment to `next`, enforcing the status state machine.
    ///
    /// A provider-assigned transaction id is recorded only if none is known yet.
    pub fn apply_status(
        &mut self,
        next: PaymentStatus,
        transaction_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Transition> {
        if next == self.status {
            return Ok(Transition::Unchanged);
        }
        if !self.status.can_transition_to(next) {
            return Err(PaymentError::validation(
                codes::INVALID_TRANSITION,
                format!("Cannot move payment from {} to {}", self.status, next),
            )
            .with_order_id(self.order_id.clone()));
        }

        let from = self.status;
        self.status = next;
        self.updated_at = at;
        if next == PaymentStatus::Completed {
            self.completed_at = Some(at);
        }
        if self.transaction_id.is_none()
            && let Some(id) = transaction_id.filter(|id| !id.is_empty())
        {
            self.transaction_id = Some(id.to_string());
        }
        Ok(Transition::Applied { from, to: next })
    }
}
