pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod messaging;
pub mod provider;
pub mod retry;
pub mod telemetry;
