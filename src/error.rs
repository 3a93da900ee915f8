use crate::retry::{Cancelled, Retryable};
use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PaymentError>;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Machine-readable error codes shared across the pipeline.
pub mod codes {
    pub const INVALID_AMOUNT: &str = "INVALID_AMOUNT";
    pub const INVALID_CURRENCY: &str = "INVALID_CURRENCY";
    pub const INVALID_STATUS: &str = "INVALID_STATUS";
    pub const INVALID_TRANSITION: &str = "INVALID_TRANSITION";
    pub const INVALID_REFUND: &str = "INVALID_REFUND";
    pub const INVALID_SIGNATURE: &str = "INVALID_SIGNATURE";
    pub const INVALID_WEBHOOK: &str = "INVALID_WEBHOOK";
    pub const PAYMENT_NOT_FOUND: &str = "PAYMENT_NOT_FOUND";
    pub const DB_ERROR: &str = "DB_ERROR";
    pub const STATUS_UPDATE_ERROR: &str = "STATUS_UPDATE_ERROR";
    pub const PUBLISH_ERROR: &str = "PUBLISH_ERROR";
    pub const STATUS_PUBLISH_ERROR: &str = "STATUS_PUBLISH_ERROR";
    pub const MARSHAL_ERROR: &str = "MARSHAL_ERROR";
    pub const CONSUME_ERROR: &str = "CONSUME_ERROR";
    pub const CONNECTION_ERROR: &str = "CONNECTION_ERROR";
    pub const TOPOLOGY_MISMATCH: &str = "TOPOLOGY_MISMATCH";
    pub const UNKNOWN_EXCHANGE: &str = "UNKNOWN_EXCHANGE";
    pub const UNKNOWN_QUEUE: &str = "UNKNOWN_QUEUE";
    pub const ACK_ERROR: &str = "ACK_ERROR";
    pub const CHANNEL_CLOSED: &str = "CHANNEL_CLOSED";
    pub const DUPLICATE_CONSUMER: &str = "DUPLICATE_CONSUMER";
    pub const PROVIDER_CONFIG: &str = "PROVIDER_CONFIG";
    pub const PROVIDER_UNAVAILABLE: &str = "PROVIDER_UNAVAILABLE";
    pub const PROVIDER_AUTH: &str = "PROVIDER_AUTH";
    pub const PROVIDER_DECLINED: &str = "PROVIDER_DECLINED";
    pub const UNSUPPORTED_PROVIDER: &str = "UNSUPPORTED_PROVIDER";
    pub const CANCELLED: &str = "CANCELLED";
}

/// Coarse classification of a [`PaymentError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input. Never retried.
    Validation,
    /// Store failure. Retryable when transient.
    Database,
    /// Provider rejected or could not be reached.
    Payment,
    /// Broker publish/consume failure.
    Messaging,
    Authentication,
    Internal,
    /// The caller's cancellation token fired.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Database => "database",
            ErrorKind::Payment => "payment",
            ErrorKind::Messaging => "messaging",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Internal => "internal",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error carried through every layer of the pipeline.
///
/// Retry eligibility is decided solely by the `retryable` flag; the kind is
/// informational and drives the defaults chosen by the constructors.
#[derive(Error, Debug)]
#[error("[{kind}] {code}: {message}{}", order_suffix(.order_id))]
pub struct PaymentError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub message: String,
    pub order_id: Option<String>,
    pub retryable: bool,
    #[source]
    pub source: Option<BoxError>,
}

fn order_suffix(order_id: &Option<String>) -> String {
    order_id
        .as_deref()
        .map(|id| format!(" (order {id})"))
        .unwrap_or_default()
}

impl PaymentError {
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            order_id: None,
            retryable: matches!(kind, ErrorKind::Messaging),
            source: None,
        }
    }

    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, code, message)
    }

    /// Store failures default to retryable; use [`PaymentError::with_retryable`]
    /// for permanent ones such as a missing row.
    pub fn database(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, code, message).with_retryable(true)
    }

    pub fn payment(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Payment, code, message)
    }

    pub fn messaging(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Messaging, code, message)
    }

    pub fn authentication(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, code, message)
    }

    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, code, message)
    }

    pub fn not_found(order_id: impl Into<String>) -> Self {
        Self::database(codes::PAYMENT_NOT_FOUND, "Payment not found")
            .with_retryable(false)
            .with_order_id(order_id)
    }

    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl Retryable for PaymentError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<Cancelled> for PaymentError {
    fn from(cancelled: Cancelled) -> Self {
        Self::new(ErrorKind::Cancelled, codes::CANCELLED, "Operation cancelled").with_source(cancelled)
    }
}
