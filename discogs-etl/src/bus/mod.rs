//! Durable message bus between the extractor and the loaders.

pub mod amqp;
mod base;
pub mod memory;

pub use base::{
    Acknowledger, BusConsumer, BusDelivery, ConsumerHandle, DeliveryStream, MessageBus, queue_name,
};
