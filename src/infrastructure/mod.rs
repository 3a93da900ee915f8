//! Adapters implementing the domain and messaging ports.

pub mod in_memory;
pub mod in_memory_broker;
pub mod metrics;
pub mod notifier;
pub mod queue_monitor;
pub mod rabbitmq;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
