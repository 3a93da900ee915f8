//! Application services.
//!
//! [`PaymentOrchestrator`] is the only component that mutates payments; it
//! consumes the payment and status queues. [`PaymentService`] is the
//! provider-facing entry point and feeds the orchestrator through the broker.

pub mod orchestrator;
pub mod payment_service;

pub use orchestrator::{NotificationDispatcher, PaymentOrchestrator};
pub use payment_service::PaymentService;
