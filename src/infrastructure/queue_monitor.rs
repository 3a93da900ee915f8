use crate::domain::ports::MetricsRef;
use crate::messaging::Broker;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Periodically records queue depth and consumer counts, warning when a
/// queue looks stuck: nothing ready, consumers attached, deliveries unacked.
pub struct QueueMonitor {
    broker: Arc<dyn Broker>,
    metrics: MetricsRef,
    queues: Vec<String>,
    interval: Duration,
}

impl QueueMonitor {
    /// Creates a monitor polling `queues` every [`DEFAULT_POLL_INTERVAL`].
    ///
    /// # Arguments
    ///
    /// * `broker` - Source of the per-queue counters.
    /// * `metrics` - Receives the depth and consumer gauges.
    /// * `queues` - Queue names to inspect on each tick.
    pub fn new(broker: Arc<dyn Broker>, metrics: MetricsRef, queues: &[&str]) -> Self {
        Self {
            broker,
            metrics,
            queues: queues.iter().map(|q| q.to_string()).collect(),
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides the poll period.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Inspects every queue once. Inspection failures are logged and skipped.
    pub async fn collect_once(&self) {
        for queue in &self.queues {
            let stats = match self.broker.inspect_queue(queue).await {
                Ok(stats) => stats,
                Err(e) => {
                    tracing::warn!(queue = %queue, error = %e, "Failed to inspect queue");
                    continue;
                }
            };

            self.metrics
                .record_queue_depth(queue, stats.messages, stats.consumers);

            if let Some(unacked) = stats.unacknowledged
                && stats.messages == 0
                && stats.consumers > 0
                && unacked > 0
            {
                tracing::warn!(queue = %queue, unacked, "Queue has unacknowledged messages");
            }
        }
    }

    /// Polls until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => self.collect_once().await,
                }
            }
            tracing::debug!("Queue monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::in_memory::InMemoryMetrics;
    use crate::infrastructure::in_memory_broker::InMemoryBroker;
    use crate::messaging::Topology;
    use crate::messaging::topology::{PAYMENT_QUEUE, PAYMENT_STATUS_QUEUE};

    #[tokio::test]
    async fn test_collect_records_depth() {
        let broker = InMemoryBroker::new();
        Topology::payment_pipeline().declare(&broker).await.unwrap();
        broker.push_raw(PAYMENT_QUEUE, "a").unwrap();
        broker.push_raw(PAYMENT_QUEUE, "b").unwrap();

        let metrics = Arc::new(InMemoryMetrics::new());
        let monitor = QueueMonitor::new(
            Arc::new(broker),
            metrics.clone(),
            &[PAYMENT_QUEUE, PAYMENT_STATUS_QUEUE, "missing"],
        );
        monitor.collect_once().await;

        assert_eq!(metrics.depth(PAYMENT_QUEUE), Some((2, 0)));
        assert_eq!(metrics.depth(PAYMENT_STATUS_QUEUE), Some((0, 0)));
        assert_eq!(metrics.depth("missing"), None);
    }

    #[tokio::test]
    async fn test_spawn_stops_on_shutdown() {
        let broker = InMemoryBroker::new();
        Topology::payment_pipeline().declare(&broker).await.unwrap();
        let metrics = Arc::new(InMemoryMetrics::new());
        let monitor = QueueMonitor::new(Arc::new(broker), metrics.clone(), &[PAYMENT_QUEUE])
            .with_interval(Duration::from_millis(10));

        let token = CancellationToken::new();
        let handle = monitor.spawn(token.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(metrics.depth(PAYMENT_QUEUE), Some((0, 0)));
    }
}
