use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::bail;
use crate::bus::{Acknowledger, BusConsumer, BusDelivery, ConsumerHandle, MessageBus};
use crate::error::{ErrorKind, EtlResult};
use crate::resilience::{CircuitBreakerSnapshot, CircuitState, ConnectionHealth};
use crate::types::{BusMessage, DataType};

type QueueKey = (String, DataType);

#[derive(Debug)]
struct QueuedMessage {
    message: BusMessage,
    redelivered: bool,
}

#[derive(Debug)]
struct Subscription {
    tag: String,
    prefetch: usize,
    sender: mpsc::UnboundedSender<EtlResult<BusDelivery>>,
}

#[derive(Debug, Default)]
struct Queue {
    ready: VecDeque<QueuedMessage>,
    unacked: usize,
    subscription: Option<Subscription>,
}

#[derive(Debug, Default)]
struct Inner {
    consumer_groups: Vec<String>,
    queues: HashMap<QueueKey, Queue>,
    published: Vec<BusMessage>,
    failing_publishes: u32,
    failing_consumes: u32,
    next_consumer_id: u64,
}

/// In-process bus with broker semantics: durable per group queues, prefetch limits,
/// redelivery on nack and on unsettled drop.
///
/// Used by tests and local runs.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBus {
    /// Creates a bus that fans out every message to the queues of `consumer_groups`.
    pub fn new<I, S>(consumer_groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let inner = Inner {
            consumer_groups: consumer_groups.into_iter().map(Into::into).collect(),
            ..Default::default()
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Every message accepted by [`MessageBus::publish`], in publish order.
    pub fn published_messages(&self) -> Vec<BusMessage> {
        lock(&self.inner).published.clone()
    }

    /// Messages waiting in a queue, excluding unacknowledged deliveries.
    pub fn ready_count(&self, consumer_group: &str, data_type: DataType) -> usize {
        lock(&self.inner)
            .queues
            .get(&(consumer_group.to_string(), data_type))
            .map(|queue| queue.ready.len())
            .unwrap_or(0)
    }

    pub fn unacked_count(&self, consumer_group: &str, data_type: DataType) -> usize {
        lock(&self.inner)
            .queues
            .get(&(consumer_group.to_string(), data_type))
            .map(|queue| queue.unacked)
            .unwrap_or(0)
    }

    pub fn is_subscribed(&self, consumer_group: &str, data_type: DataType) -> bool {
        lock(&self.inner)
            .queues
            .get(&(consumer_group.to_string(), data_type))
            .is_some_and(|queue| queue.subscription.is_some())
    }

    /// Makes the next `count` publishes fail with a transient error.
    pub fn fail_next_publishes(&self, count: u32) {
        lock(&self.inner).failing_publishes = count;
    }

    /// Makes the next `count` subscriptions fail with a transient error.
    pub fn fail_next_consumes(&self, count: u32) {
        lock(&self.inner).failing_consumes = count;
    }

    /// Drops the subscription of a queue as a lost connection would.
    ///
    /// The consumer stream ends and its unsettled deliveries return to the queue.
    pub fn disconnect(&self, consumer_group: &str, data_type: DataType) {
        let subscription = lock(&self.inner)
            .queues
            .get_mut(&(consumer_group.to_string(), data_type))
            .and_then(|queue| queue.subscription.take());
        drop(subscription);
    }

    /// Enqueues `message` for one consumer group only, bypassing routing.
    pub fn enqueue(&self, consumer_group: &str, message: BusMessage) {
        let key = (consumer_group.to_string(), message.data_type);
        let mut inner = lock(&self.inner);
        inner
            .queues
            .entry(key.clone())
            .or_default()
            .ready
            .push_back(QueuedMessage {
                message,
                redelivered: false,
            });
        let detached = dispatch(&self.inner, &mut inner, &key);
        drop(inner);
        drop(detached);
    }
}

impl MessageBus for MemoryBus {
    fn name(&self) -> &str {
        "memory-bus"
    }

    async fn declare_topology(&self, data_types: &[DataType]) -> EtlResult<()> {
        let mut inner = lock(&self.inner);
        let groups = inner.consumer_groups.clone();
        for group in groups {
            for data_type in data_types {
                inner.queues.entry((group.clone(), *data_type)).or_default();
            }
        }

        Ok(())
    }

    async fn publish(&self, message: &BusMessage) -> EtlResult<()> {
        let mut inner = lock(&self.inner);

        if inner.failing_publishes > 0 {
            inner.failing_publishes -= 1;
            bail!(
                ErrorKind::BusPublishFailed,
                "Publish rejected by the bus",
                format!("injected failure for {} message", message.data_type)
            );
        }

        inner.published.push(message.clone());

        let keys: Vec<QueueKey> = inner
            .queues
            .keys()
            .filter(|(_, data_type)| *data_type == message.data_type)
            .cloned()
            .collect();
        let mut detached = Vec::new();
        for key in keys {
            if let Some(queue) = inner.queues.get_mut(&key) {
                queue.ready.push_back(QueuedMessage {
                    message: message.clone(),
                    redelivered: false,
                });
            }
            detached.extend(dispatch(&self.inner, &mut inner, &key));
        }
        drop(inner);
        drop(detached);

        Ok(())
    }

    async fn consume(
        &self,
        consumer_group: &str,
        data_type: DataType,
        prefetch: u16,
    ) -> EtlResult<BusConsumer> {
        let key = (consumer_group.to_string(), data_type);
        let (sender, receiver) = mpsc::unbounded_channel();

        let (tag, detached) = {
            let mut inner = lock(&self.inner);
            if inner.failing_consumes > 0 {
                inner.failing_consumes -= 1;
                bail!(
                    ErrorKind::BusConsumeFailed,
                    "Subscription rejected by the bus",
                    format!("injected failure for {consumer_group}/{data_type}")
                );
            }
            inner.next_consumer_id += 1;
            let tag = format!("{consumer_group}-{data_type}-{}", inner.next_consumer_id);

            let queue = inner.queues.entry(key.clone()).or_default();
            if queue.subscription.is_some() {
                bail!(
                    ErrorKind::InvalidState,
                    "Queue already has a consumer",
                    format!("{consumer_group}/{data_type}")
                );
            }
            queue.subscription = Some(Subscription {
                tag: tag.clone(),
                prefetch: prefetch.max(1) as usize,
                sender,
            });
            let detached = dispatch(&self.inner, &mut inner, &key);

            (tag, detached)
        };
        drop(detached);

        let handle = MemoryConsumerHandle {
            bus: self.inner.clone(),
            key,
            tag: tag.clone(),
        };

        Ok(BusConsumer::new(
            tag,
            data_type,
            UnboundedReceiverStream::new(receiver).boxed(),
            Box::new(handle),
        ))
    }

    fn health(&self) -> ConnectionHealth {
        ConnectionHealth {
            name: self.name().to_string(),
            healthy: true,
            connected: true,
            circuit_breaker: CircuitBreakerSnapshot {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                total_trips: 0,
                retry_in_ms: None,
                seconds_since_last_failure: None,
            },
            pool: None,
            connections_established: 1,
            last_check: None,
            last_error: None,
        }
    }
}

struct MemoryConsumerHandle {
    bus: Arc<Mutex<Inner>>,
    key: QueueKey,
    tag: String,
}

#[async_trait]
impl ConsumerHandle for MemoryConsumerHandle {
    async fn cancel(&self) -> EtlResult<()> {
        let subscription = {
            let mut inner = lock(&self.bus);
            inner.queues.get_mut(&self.key).and_then(|queue| {
                let owned = queue
                    .subscription
                    .as_ref()
                    .is_some_and(|subscription| subscription.tag == self.tag);
                if owned { queue.subscription.take() } else { None }
            })
        };

        // Dropped outside the lock, buffered deliveries requeue themselves.
        if subscription.is_some() {
            drop(subscription);
            debug!(tag = %self.tag, "memory consumer cancelled");
        }

        Ok(())
    }
}

struct MemoryAcker {
    bus: Arc<Mutex<Inner>>,
    key: QueueKey,
    message: BusMessage,
    settled: Arc<AtomicBool>,
}

impl MemoryAcker {
    fn settle(&self, requeue: bool) -> EtlResult<()> {
        let mut inner = lock(&self.bus);
        if self.settled.swap(true, Ordering::SeqCst) {
            bail!(ErrorKind::InvalidState, "Delivery was already settled");
        }

        if let Some(queue) = inner.queues.get_mut(&self.key) {
            queue.unacked = queue.unacked.saturating_sub(1);
            if requeue {
                queue.ready.push_front(QueuedMessage {
                    message: self.message.clone(),
                    redelivered: true,
                });
            }
        }
        let detached = dispatch(&self.bus, &mut inner, &self.key);
        drop(inner);
        drop(detached);

        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> EtlResult<()> {
        self.settle(false)
    }

    async fn nack(&self, requeue: bool) -> EtlResult<()> {
        self.settle(requeue)
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        // Unsettled deliveries go back to the queue, like on a closed channel.
        if !self.settled.load(Ordering::SeqCst) {
            let _ = self.settle(true);
        }
    }
}

/// Hands ready messages to the subscriber while its prefetch window has room.
///
/// Returns the subscription when its stream is gone. The caller drops it after releasing the
/// lock, since buffered deliveries requeue themselves on drop.
#[must_use]
fn dispatch(bus: &Arc<Mutex<Inner>>, inner: &mut Inner, key: &QueueKey) -> Option<Subscription> {
    let queue = inner.queues.get_mut(key)?;

    loop {
        let subscription = queue.subscription.as_ref()?;
        if queue.unacked >= subscription.prefetch {
            return None;
        }
        let queued = queue.ready.pop_front()?;
        let redelivered = queued.redelivered;

        // Disarmed until the delivery was handed over.
        let settled = Arc::new(AtomicBool::new(true));
        let acker = MemoryAcker {
            bus: bus.clone(),
            key: key.clone(),
            message: queued.message.clone(),
            settled: settled.clone(),
        };
        let delivery = BusDelivery {
            message: queued.message,
            redelivered,
            acker: Box::new(acker),
        };

        match subscription.sender.send(Ok(delivery)) {
            Ok(()) => {
                queue.unacked += 1;
                settled.store(false, Ordering::SeqCst);
            }
            Err(mpsc::error::SendError(returned)) => {
                // The stream was dropped without cancelling.
                if let Ok(delivery) = returned {
                    queue.ready.push_front(QueuedMessage {
                        message: delivery.message,
                        redelivered,
                    });
                }
                return queue.subscription.take();
            }
        }
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;
    use crate::types::{ArtistRecord, ExtractedRecord};

    fn record_message(id: &str) -> BusMessage {
        BusMessage::record(ExtractedRecord::new(ArtistRecord::new(id, "name")).unwrap())
    }

    fn next_now(consumer: &mut BusConsumer) -> Option<BusDelivery> {
        consumer
            .stream
            .next()
            .now_or_never()
            .flatten()
            .map(|delivery| delivery.unwrap())
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_declared_groups() {
        let bus = MemoryBus::new(["graphinator", "tableinator"]);
        bus.declare_topology(&[DataType::Artists]).await.unwrap();

        bus.publish(&record_message("a1")).await.unwrap();
        bus.publish(&BusMessage::file_complete(DataType::Labels, 0, "f")).await.unwrap();

        assert_eq!(bus.ready_count("graphinator", DataType::Artists), 1);
        assert_eq!(bus.ready_count("tableinator", DataType::Artists), 1);
        // No queue is bound for labels.
        assert_eq!(bus.ready_count("graphinator", DataType::Labels), 0);
        assert_eq!(bus.published_messages().len(), 2);
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked_deliveries() {
        let bus = MemoryBus::new(["graphinator"]);
        bus.declare_topology(&[DataType::Artists]).await.unwrap();
        for id in ["a1", "a2", "a3"] {
            bus.publish(&record_message(id)).await.unwrap();
        }

        let mut consumer = bus.consume("graphinator", DataType::Artists, 2).await.unwrap();
        let first = next_now(&mut consumer).unwrap();
        let _second = next_now(&mut consumer).unwrap();
        assert!(next_now(&mut consumer).is_none());
        assert_eq!(bus.unacked_count("graphinator", DataType::Artists), 2);

        first.acker.ack().await.unwrap();
        let third = next_now(&mut consumer).unwrap();
        assert_eq!(third.message.into_record().unwrap().id, "a3");
    }

    #[tokio::test]
    async fn test_nack_with_requeue_redelivers_first() {
        let bus = MemoryBus::new(["graphinator"]);
        bus.declare_topology(&[DataType::Artists]).await.unwrap();
        bus.publish(&record_message("a1")).await.unwrap();
        bus.publish(&record_message("a2")).await.unwrap();

        let mut consumer = bus.consume("graphinator", DataType::Artists, 1).await.unwrap();
        let delivery = next_now(&mut consumer).unwrap();
        assert!(!delivery.redelivered);
        delivery.acker.nack(true).await.unwrap();

        let again = next_now(&mut consumer).unwrap();
        assert!(again.redelivered);
        assert_eq!(again.message.into_record().unwrap().id, "a1");
        assert!(again.acker.ack().await.is_ok());
        assert!(again.acker.ack().await.is_err());
    }

    #[tokio::test]
    async fn test_unsettled_deliveries_return_after_cancel() {
        let bus = MemoryBus::new(["graphinator"]);
        bus.declare_topology(&[DataType::Artists]).await.unwrap();
        bus.publish(&record_message("a1")).await.unwrap();

        let mut consumer = bus.consume("graphinator", DataType::Artists, 10).await.unwrap();
        let delivery = next_now(&mut consumer).unwrap();
        consumer.cancel().await.unwrap();
        assert!(!bus.is_subscribed("graphinator", DataType::Artists));

        drop(delivery);
        assert_eq!(bus.ready_count("graphinator", DataType::Artists), 1);
        assert_eq!(bus.unacked_count("graphinator", DataType::Artists), 0);
    }

    #[tokio::test]
    async fn test_disconnect_ends_stream_and_requeues() {
        let bus = MemoryBus::new(["graphinator"]);
        bus.declare_topology(&[DataType::Artists]).await.unwrap();
        bus.publish(&record_message("a1")).await.unwrap();

        let mut consumer = bus.consume("graphinator", DataType::Artists, 10).await.unwrap();
        let delivery = next_now(&mut consumer).unwrap();
        bus.disconnect("graphinator", DataType::Artists);

        assert!(!bus.is_subscribed("graphinator", DataType::Artists));
        assert!(consumer.stream.next().await.is_none());
        drop(delivery);
        assert_eq!(bus.ready_count("graphinator", DataType::Artists), 1);
        assert_eq!(bus.unacked_count("graphinator", DataType::Artists), 0);

        bus.fail_next_consumes(1);
        let err = bus
            .consume("graphinator", DataType::Artists, 10)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BusConsumeFailed);
        assert!(err.is_transient());
        assert!(bus.consume("graphinator", DataType::Artists, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_publish_failures_are_transient() {
        let bus = MemoryBus::new(["graphinator"]);
        bus.fail_next_publishes(1);

        let err = bus.publish(&record_message("a1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BusPublishFailed);
        assert!(err.is_transient());
        assert!(bus.publish(&record_message("a1")).await.is_ok());
    }
}
