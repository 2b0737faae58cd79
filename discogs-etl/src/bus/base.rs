use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::EtlResult;
use crate::resilience::ConnectionHealth;
use crate::types::{BusMessage, DataType};

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    async fn ack(&self) -> EtlResult<()>;

    /// Rejects the delivery. With `requeue` the broker delivers it again.
    async fn nack(&self, requeue: bool) -> EtlResult<()>;
}

/// A message received from the bus that still has to be acknowledged.
pub struct BusDelivery {
    pub message: BusMessage,
    /// Set when the broker delivered this message before.
    pub redelivered: bool,
    pub acker: Box<dyn Acknowledger>,
}

impl fmt::Debug for BusDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusDelivery")
            .field("message", &self.message)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

pub type DeliveryStream = BoxStream<'static, EtlResult<BusDelivery>>;

/// Stops a running subscription.
#[async_trait]
pub trait ConsumerHandle: Send + Sync + 'static {
    async fn cancel(&self) -> EtlResult<()>;
}

/// Subscription to the queue of one data type.
///
/// The stream ends once the subscription is cancelled. Deliveries taken from the stream can
/// still be settled after cancellation.
pub struct BusConsumer {
    pub tag: String,
    pub data_type: DataType,
    pub stream: DeliveryStream,
    handle: Box<dyn ConsumerHandle>,
}

impl BusConsumer {
    pub fn new(
        tag: impl Into<String>,
        data_type: DataType,
        stream: DeliveryStream,
        handle: Box<dyn ConsumerHandle>,
    ) -> Self {
        Self {
            tag: tag.into(),
            data_type,
            stream,
            handle,
        }
    }

    /// Takes `&mut self` so a future holding the consumer across this call stays `Send`.
    pub async fn cancel(&mut self) -> EtlResult<()> {
        self.handle.cancel().await
    }
}

impl fmt::Debug for BusConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConsumer")
            .field("tag", &self.tag)
            .field("data_type", &self.data_type)
            .finish_non_exhaustive()
    }
}

/// Name of the durable queue holding `data_type` messages for a consumer group.
pub fn queue_name(prefix: &str, consumer_group: &str, data_type: DataType) -> String {
    format!("{prefix}-{consumer_group}-{data_type}")
}

/// At-least-once message bus.
///
/// Messages are routed by data type. Every consumer group has its own queue per data type, so
/// each group receives every message once and FIFO order per data type is preserved.
pub trait MessageBus: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Declares the exchange and the queues of every consumer group for `data_types`.
    ///
    /// Idempotent. Called before publishing so messages are retained while no loader runs.
    fn declare_topology(
        &self,
        data_types: &[DataType],
    ) -> impl Future<Output = EtlResult<()>> + Send;

    /// Publishes `message` and waits for the broker confirmation.
    ///
    /// Returns once the broker took responsibility for the message.
    fn publish(&self, message: &BusMessage) -> impl Future<Output = EtlResult<()>> + Send;

    /// Subscribes to the `data_type` queue of `consumer_group` with at most `prefetch`
    /// unacknowledged deliveries.
    fn consume(
        &self,
        consumer_group: &str,
        data_type: DataType,
        prefetch: u16,
    ) -> impl Future<Output = EtlResult<BusConsumer>> + Send;

    fn health(&self) -> ConnectionHealth;

    fn close(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}
