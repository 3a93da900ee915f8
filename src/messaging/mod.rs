//! Broker-facing plumbing: the declared topology, the broker port and the
//! typed message channel applying the ack/requeue/dead-letter policy.

pub mod broker;
pub mod channel;
pub mod topology;

pub use broker::{Broker, Delivery, DeliveryStream, Envelope, QueueStats, TopologyDeclarer};
pub use channel::{MessageChannel, MessageHandler};
pub use topology::Topology;
