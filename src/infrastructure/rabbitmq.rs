use crate::error::{PaymentError, Result, codes};
use crate::messaging::broker::{
    Broker, Delivery, DeliveryStream, Envelope, QueueStats, TopologyDeclarer,
};
use crate::messaging::topology::{BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;

const REPLY_SUCCESS: u16 = 200;

/// AMQP 0-9-1 broker backed by `lapin`.
///
/// Publishes go through one channel in confirm mode. Every consumer gets its
/// own channel with a prefetch of one.
pub struct RabbitMqBroker {
    connection: Connection,
    publisher: Channel,
    consumer_channels: Mutex<Vec<Channel>>,
}

impl RabbitMqBroker {
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| connection_error("Failed to connect to RabbitMQ", e))?;

        let publisher = connection
            .create_channel()
            .await
            .map_err(|e| connection_error("Failed to open channel", e))?;
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| connection_error("Failed to enable publisher confirms", e))?;

        tracing::info!("Connected to RabbitMQ");
        Ok(Self {
            connection,
            publisher,
            consumer_channels: Mutex::new(Vec::new()),
        })
    }
}

fn connection_error(message: &str, source: lapin::Error) -> PaymentError {
    PaymentError::messaging(codes::CONNECTION_ERROR, message).with_source(source)
}

/// Declaration failures are never retried. A `PRECONDITION_FAILED` reply
/// means the entity exists with different arguments.
fn declare_error(what: String, source: lapin::Error) -> PaymentError {
    let code = if source.to_string().contains("PRECONDITION_FAILED") {
        codes::TOPOLOGY_MISMATCH
    } else {
        codes::CONNECTION_ERROR
    };
    PaymentError::messaging(code, format!("Failed to declare {what}"))
        .with_retryable(false)
        .with_source(source)
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(dlx) = &spec.dead_letter_exchange {
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(dlx.as_str())),
        );
    }
    if let Some(ttl) = spec.message_ttl_ms {
        args.insert(ShortString::from("x-message-ttl"), AMQPValue::LongInt(ttl));
    }
    args
}

#[async_trait]
impl TopologyDeclarer for RabbitMqBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        let kind = match spec.kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };
        self.publisher
            .exchange_declare(
                &spec.name,
                kind,
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error(format!("exchange {}", spec.name), e))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.publisher
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                queue_arguments(spec),
            )
            .await
            .map(|_| ())
            .map_err(|e| declare_error(format!("queue {}", spec.name), e))
    }

    async fn bind_queue(&self, spec: &BindingSpec) -> Result<()> {
        self.publisher
            .queue_bind(
                &spec.queue,
                &spec.exchange,
                &spec.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error(format!("binding {} -> {}", spec.exchange, spec.queue), e))
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(envelope.content_type))
            .with_message_id(ShortString::from(envelope.message_id.as_str()))
            .with_timestamp(envelope.timestamp);
        if envelope.persistent {
            properties = properties.with_delivery_mode(2);
        }

        let confirmation = self
            .publisher
            .basic_publish(
                &envelope.exchange,
                &envelope.routing_key,
                BasicPublishOptions::default(),
                &envelope.body,
                properties,
            )
            .await
            .map_err(|e| connection_error("Failed to publish message", e))?
            .await
            .map_err(|e| connection_error("Publisher confirm failed", e))?;

        if confirmation.is_nack() {
            return Err(PaymentError::messaging(
                codes::PUBLISH_ERROR,
                "Broker refused the message",
            ));
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| connection_error("Failed to open consumer channel", e))?;
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| connection_error("Failed to set prefetch", e))?;

        let consumer = channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                PaymentError::messaging(
                    codes::CONSUME_ERROR,
                    format!("Failed to register a consumer on {queue}"),
                )
                .with_source(e)
            })?;

        self.consumer_channels.lock().await.push(channel);

        let stream = consumer.map(|next| {
            next.map(|delivery| Box::new(AmqpDelivery(delivery)) as Box<dyn Delivery>)
                .map_err(|e| {
                    PaymentError::messaging(codes::CONSUME_ERROR, "Failed to receive delivery")
                        .with_source(e)
                })
        });
        Ok(stream.boxed())
    }

    async fn inspect_queue(&self, queue: &str) -> Result<QueueStats> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| connection_error("Failed to open inspection channel", e))?;

        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        if let Err(e) = channel.close(REPLY_SUCCESS, "Bye").await {
            tracing::debug!(error = %e, "Failed to close inspection channel");
        }

        let declared = declared.map_err(|e| {
            PaymentError::messaging(codes::UNKNOWN_QUEUE, format!("Failed to inspect queue {queue}"))
                .with_source(e)
        })?;

        Ok(QueueStats {
            messages: declared.message_count(),
            consumers: declared.consumer_count(),
            unacknowledged: None,
        })
    }

    async fn close(&self) -> Result<()> {
        for channel in self.consumer_channels.lock().await.drain(..) {
            if let Err(e) = channel.close(REPLY_SUCCESS, "Bye").await {
                tracing::warn!(error = %e, "Failed to close consumer channel");
            }
        }
        if let Err(e) = self.publisher.close(REPLY_SUCCESS, "Bye").await {
            tracing::warn!(error = %e, "Failed to close publisher channel");
        }
        self.connection
            .close(REPLY_SUCCESS, "Bye")
            .await
            .map_err(|e| connection_error("Failed to close connection", e))
    }
}

struct AmqpDelivery(lapin::message::Delivery);

#[async_trait]
impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.0.data
    }

    fn message_id(&self) -> Option<&str> {
        self.0.properties.message_id().as_ref().map(|id| id.as_str())
    }

    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| PaymentError::messaging(codes::ACK_ERROR, "Failed to ack").with_source(e))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| PaymentError::messaging(codes::ACK_ERROR, "Failed to reject").with_source(e))
    }
}
