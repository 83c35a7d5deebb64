//! Queue fabric: one durable at-least-once queue per channel plus the
//! dead-letter channel.

use async_trait::async_trait;

use crate::{
    error::DispatchError,
    models::{
        message::{DeadLetterEntry, QueueMessage},
        request::Channel,
    },
};

/// Settles a received delivery with the broker.
#[async_trait]
pub trait DeliveryHandle: Send + Sync {
    async fn ack(&self) -> Result<(), DispatchError>;

    async fn nack(&self, requeue: bool) -> Result<(), DispatchError>;
}

pub struct Delivery<T> {
    pub payload: T,
    pub redelivered: bool,
    handle: Box<dyn DeliveryHandle>,
}

impl<T> Delivery<T> {
    pub fn new(payload: T, redelivered: bool, handle: Box<dyn DeliveryHandle>) -> Self {
        Self {
            payload,
            redelivered,
            handle,
        }
    }

    pub async fn ack(&self) -> Result<(), DispatchError> {
        self.handle.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), DispatchError> {
        self.handle.nack(requeue).await
    }
}

#[async_trait]
pub trait MessageSource<T: Send>: Send {
    /// Waits for the next delivery. `None` once the subscription is closed.
    ///
    /// Must be cancel-safe: dropping the future loses no message.
    async fn next(&mut self) -> Option<Result<Delivery<T>, DispatchError>>;
}

#[async_trait]
pub trait QueueFabric: Send + Sync {
    /// Publishes to the message's channel queue. Messages with a future
    /// `not_before` take the delay path and surface once due.
    async fn publish(&self, message: &QueueMessage) -> Result<(), DispatchError>;

    async fn subscribe(
        &self,
        channel: Channel,
        consumer_tag: &str,
    ) -> Result<Box<dyn MessageSource<QueueMessage>>, DispatchError>;

    async fn publish_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), DispatchError>;

    async fn subscribe_dead_letters(
        &self,
        consumer_tag: &str,
    ) -> Result<Box<dyn MessageSource<DeadLetterEntry>>, DispatchError>;

    async fn ping(&self) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// Broker priority for a request priority: higher is sooner, clamped to 0..=9.
pub fn broker_priority(priority: i32) -> u8 {
    priority.clamp(0, 9) as u8
}
