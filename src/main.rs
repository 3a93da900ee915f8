use clap::Parser;
use miette::{IntoDiagnostic, Result};
use payment_pipeline::application::PaymentOrchestrator;
use payment_pipeline::config::PipelineConfig;
use payment_pipeline::domain::ports::{MetricsRef, NotifierRef, PaymentStoreRef};
use payment_pipeline::infrastructure::in_memory::InMemoryPaymentStore;
use payment_pipeline::infrastructure::metrics::TracingMetrics;
use payment_pipeline::infrastructure::notifier::{LogNotificationSink, QueueNotifier};
use payment_pipeline::infrastructure::queue_monitor::QueueMonitor;
use payment_pipeline::infrastructure::rabbitmq::RabbitMqBroker;
use payment_pipeline::messaging::topology::ALL_QUEUES;
use payment_pipeline::messaging::{Broker, MessageChannel, Topology};
use payment_pipeline::telemetry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn open_store(config: &PipelineConfig) -> Result<PaymentStoreRef> {
    match &config.db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => {
            let store = payment_pipeline::infrastructure::rocksdb::RocksDBStore::open(path)
                .into_diagnostic()?;
            tracing::info!(path = %path.display(), "Using RocksDB payment store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(path) => {
            eprintln!(
                "WARNING: Persistent storage requested via --db-path ({}), but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage.",
                path.display()
            );
            Ok(Arc::new(InMemoryPaymentStore::new()))
        }
        None => Ok(Arc::new(InMemoryPaymentStore::new())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = PipelineConfig::parse();
    telemetry::init_tracing(&config.log_level, config.log_json);

    let store = open_store(&config)?;

    let rabbit = RabbitMqBroker::connect(&config.amqp_url)
        .await
        .into_diagnostic()?;
    Topology::payment_pipeline()
        .declare(&rabbit)
        .await
        .into_diagnostic()?;
    tracing::info!("Queue topology declared");

    let broker: Arc<dyn Broker> = Arc::new(rabbit);
    let metrics: MetricsRef = Arc::new(TracingMetrics);
    let shutdown = CancellationToken::new();

    let channel = Arc::new(MessageChannel::new(broker.clone(), metrics.clone()));
    let notifier: NotifierRef = Arc::new(QueueNotifier::new(channel.clone()));
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        store,
        notifier,
        channel.clone(),
        config.retry_strategy(),
        shutdown.clone(),
    ));
    orchestrator
        .start_consumers(Arc::new(LogNotificationSink))
        .await
        .into_diagnostic()?;

    let monitor = QueueMonitor::new(broker.clone(), metrics, &ALL_QUEUES)
        .with_interval(config.queue_poll_interval())
        .spawn(shutdown.clone());

    tracing::info!("Payment pipeline worker running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.into_diagnostic()?;
    tracing::info!("Shutting down");

    shutdown.cancel();
    if let Err(e) = monitor.await {
        tracing::warn!(error = %e, "Queue monitor task ended abnormally");
    }
    channel.close().await.into_diagnostic()?;

    Ok(())
}
