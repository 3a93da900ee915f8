use crate::domain::ports::MetricsRecorder;
use std::time::Duration;

/// Emits every metric as a structured `tracing` event on the `metrics` target,
/// leaving aggregation to whatever subscriber is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsRecorder for TracingMetrics {
    fn record_processed(&self, queue: &str, label: &str) {
        tracing::debug!(target: "metrics", metric = "messages_consumed", queue, label);
    }

    fn record_error(&self, queue: &str, label: &str) {
        tracing::debug!(target: "metrics", metric = "processing_errors", queue, label);
    }

    fn record_retry(&self, queue: &str, label: &str) {
        tracing::debug!(target: "metrics", metric = "retry_attempts", queue, label);
    }

    fn record_dead_letter(&self, queue: &str, reason: &str) {
        tracing::debug!(target: "metrics", metric = "dead_letter_messages", queue, reason);
    }

    fn record_published(&self, queue: &str, label: &str) {
        tracing::debug!(target: "metrics", metric = "messages_published", queue, label);
    }

    fn record_processing_time(&self, queue: &str, elapsed: Duration) {
        tracing::trace!(
            target: "metrics",
            metric = "message_processing_seconds",
            queue,
            seconds = elapsed.as_secs_f64()
        );
    }

    fn record_queue_depth(&self, queue: &str, messages: u32, consumers: u32) {
        tracing::debug!(target: "metrics", metric = "queue_depth", queue, messages, consumers);
    }
}
