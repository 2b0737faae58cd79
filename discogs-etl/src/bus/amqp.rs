use std::sync::Arc;

use async_trait::async_trait;
use discogs_config::shared::AmqpConfig;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use secrecy::ExposeSecret;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bail;
use crate::bus::{Acknowledger, BusConsumer, BusDelivery, ConsumerHandle, MessageBus, queue_name};
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::resilience::{ConnectionHealth, Connector, ResilientConnection};
use crate::types::{BusMessage, DataType};

/// AMQP delivery mode of messages that survive a broker restart.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Reply code of a regular channel or connection close.
const REPLY_SUCCESS: u16 = 200;

/// Opens AMQP connections to the configured broker.
pub struct AmqpConnector {
    config: AmqpConfig,
}

impl Connector for AmqpConnector {
    type Connection = Arc<Connection>;

    fn name(&self) -> &str {
        "amqp"
    }

    async fn connect(&self) -> EtlResult<Arc<Connection>> {
        let connection = Connection::connect(
            self.config.url.expose_secret(),
            ConnectionProperties::default(),
        )
        .await?;

        Ok(Arc::new(connection))
    }

    async fn probe(&self, connection: &Arc<Connection>) -> EtlResult<()> {
        if !connection.status().connected() {
            bail!(
                ErrorKind::BusConnectionFailed,
                "AMQP connection is no longer connected"
            );
        }

        let channel = connection.create_channel().await?;
        channel.close(REPLY_SUCCESS, "health probe").await?;

        Ok(())
    }

    async fn close(&self, connection: Arc<Connection>) {
        if let Err(err) = connection.close(REPLY_SUCCESS, "closing").await {
            debug!(error = %err, "error while closing amqp connection");
        }
    }
}

/// [`MessageBus`] backed by an AMQP 0.9.1 broker.
///
/// Records are published with publisher confirms and persistent delivery mode to one durable
/// topic exchange, routed by data type. Every consumer subscribes on its own channel so the
/// prefetch window applies per data type.
pub struct AmqpBus {
    config: AmqpConfig,
    connection: ResilientConnection<AmqpConnector>,
    publish_channel: Mutex<Option<Channel>>,
}

impl AmqpBus {
    pub fn new(config: AmqpConfig) -> Self {
        let connection = ResilientConnection::new(
            AmqpConnector {
                config: config.clone(),
            },
            &config.resilience,
        );

        Self {
            config,
            connection,
            publish_channel: Mutex::new(None),
        }
    }

    /// Connects eagerly, so a misconfigured broker fails the service at startup.
    pub async fn connect(&self) -> EtlResult<()> {
        self.connection
            .execute("amqp_connect", |_| async { Ok(()) })
            .await?;
        info!(exchange = %self.config.exchange, "connected to amqp broker");

        Ok(())
    }

    pub fn spawn_health_monitor(&self, shutdown_rx: ShutdownRx) -> tokio::task::JoinHandle<()> {
        self.connection.spawn_health_monitor(shutdown_rx)
    }

    async fn publish_channel(&self, connection: &Connection) -> EtlResult<Channel> {
        let mut slot = self.publish_channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        *slot = Some(channel.clone());

        Ok(channel)
    }

    async fn publish_confirmed(
        &self,
        connection: &Connection,
        routing_key: &str,
        payload: &[u8],
    ) -> EtlResult<()> {
        let channel = self.publish_channel(connection).await?;

        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_content_type("application/json".into());
        let confirm = channel
            .basic_publish(
                &self.config.exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?;

        let confirmation =
            tokio::time::timeout(self.config.publish_confirm_timeout(), confirm).await??;
        if confirmation.is_nack() {
            bail!(
                ErrorKind::BusPublishNacked,
                "Broker rejected the message",
                format!("routing key {routing_key}")
            );
        }

        Ok(())
    }

    async fn declare_queue(
        &self,
        channel: &Channel,
        consumer_group: &str,
        data_type: DataType,
    ) -> EtlResult<String> {
        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let queue = queue_name(&self.config.queue_prefix, consumer_group, data_type);
        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &queue,
                &self.config.exchange,
                data_type.as_str(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(queue)
    }
}

impl MessageBus for AmqpBus {
    fn name(&self) -> &str {
        self.connection.name()
    }

    async fn declare_topology(&self, data_types: &[DataType]) -> EtlResult<()> {
        self.connection
            .execute("amqp_declare_topology", |connection| async move {
                let channel = connection.create_channel().await?;
                for consumer_group in &self.config.consumer_groups {
                    for data_type in data_types {
                        let queue = self.declare_queue(&channel, consumer_group, *data_type).await?;
                        debug!(%queue, "declared queue");
                    }
                }
                channel.close(REPLY_SUCCESS, "topology declared").await?;

                Ok(())
            })
            .await
    }

    async fn publish(&self, message: &BusMessage) -> EtlResult<()> {
        let payload = message.to_bytes()?;
        let payload = payload.as_slice();
        let routing_key = message.data_type.as_str();

        self.connection
            .execute("amqp_publish", |connection| async move {
                self.publish_confirmed(&connection, routing_key, payload)
                    .await
            })
            .await
    }

    async fn consume(
        &self,
        consumer_group: &str,
        data_type: DataType,
        prefetch: u16,
    ) -> EtlResult<BusConsumer> {
        let tag = format!("{consumer_group}-{data_type}-{}", Uuid::new_v4());
        let tag_ref = tag.as_str();

        let (channel, consumer) = self
            .connection
            .execute("amqp_consume", |connection| async move {
                let channel = connection.create_channel().await?;
                channel
                    .basic_qos(prefetch, BasicQosOptions::default())
                    .await?;
                let queue = self.declare_queue(&channel, consumer_group, data_type).await?;
                let consumer = channel
                    .basic_consume(
                        &queue,
                        tag_ref,
                        BasicConsumeOptions::default(),
                        FieldTable::default(),
                    )
                    .await?;

                Ok((channel, consumer))
            })
            .await?;

        info!(%consumer_group, %data_type, prefetch, tag = %tag, "subscribed to queue");

        let stream = consumer
            .filter_map(|delivery| async move {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(err) => return Some(Err(EtlError::from(err))),
                };

                match BusMessage::from_bytes(&delivery.data) {
                    Ok(message) => Some(Ok(BusDelivery {
                        message,
                        redelivered: delivery.redelivered,
                        acker: Box::new(AmqpAcker {
                            acker: delivery.acker,
                        }),
                    })),
                    Err(err) => {
                        // Redelivering a message that cannot be decoded would loop forever.
                        warn!(
                            error = %err,
                            bytes = delivery.data.len(),
                            "discarding undecodable message"
                        );
                        let options = BasicNackOptions {
                            requeue: false,
                            ..Default::default()
                        };
                        if let Err(err) = delivery.acker.nack(options).await {
                            warn!(error = %err, "failed to reject undecodable message");
                        }
                        None
                    }
                }
            })
            .boxed();

        let handle = AmqpConsumerHandle {
            channel,
            tag: tag.clone(),
        };

        Ok(BusConsumer::new(tag, data_type, stream, Box::new(handle)))
    }

    fn health(&self) -> ConnectionHealth {
        self.connection.health()
    }

    async fn close(&self) {
        if let Some(channel) = self.publish_channel.lock().await.take() {
            if let Err(err) = channel.close(REPLY_SUCCESS, "closing").await {
                debug!(error = %err, "error while closing publish channel");
            }
        }
        self.connection.close().await;
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> EtlResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(EtlError::from)
    }

    async fn nack(&self, requeue: bool) -> EtlResult<()> {
        let options = BasicNackOptions {
            requeue,
            ..Default::default()
        };

        self.acker
            .nack(options)
            .await
            .map(|_| ())
            .map_err(EtlError::from)
    }
}

struct AmqpConsumerHandle {
    channel: Channel,
    tag: String,
}

#[async_trait]
impl ConsumerHandle for AmqpConsumerHandle {
    async fn cancel(&self) -> EtlResult<()> {
        self.channel
            .basic_cancel(&self.tag, BasicCancelOptions::default())
            .await?;
        self.channel
            .close(REPLY_SUCCESS, "consumer cancelled")
            .await?;
        debug!(tag = %self.tag, "amqp consumer cancelled");

        Ok(())
    }
}
