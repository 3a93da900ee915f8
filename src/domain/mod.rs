//! Core domain: the payment record, its status state machine, the wire
//! messages, and the ports implemented by infrastructure adapters.

pub mod message;
pub mod payment;
pub mod ports;
