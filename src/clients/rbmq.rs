use std::marker::PhantomData;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel as AmqpChannel, Connection, ConnectionProperties, Consumer,
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, error, info};

use crate::{
    config::Config,
    error::DispatchError,
    models::{
        message::{DeadLetterEntry, QueueMessage},
        request::Channel,
    },
    queue::{Delivery, DeliveryHandle, MessageSource, QueueFabric, broker_priority},
};

const MAX_PRIORITY: u8 = 9;
const PERSISTENT: u8 = 2;

fn delay_queue_name(queue: &str) -> String {
    format!("{}.delay", queue)
}

fn parking_queue_name(queue: &str) -> String {
    format!("{}.unparsed", queue)
}

/// Arguments for a consumed queue: messages its consumers reject are
/// dead-lettered into `<queue>.unparsed`.
fn consumed_queue_args(queue: &str) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString("".into()),
    );
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(parking_queue_name(queue).into()),
    );
    args
}

/// RabbitMQ queue fabric.
///
/// Each channel has a durable priority queue plus a `<queue>.delay` queue.
/// Delayed messages sit in the delay queue with a per-message TTL and are
/// dead-lettered back into the channel queue when it expires. Consumed
/// queues park rejected messages in `<queue>.unparsed` for inspection.
pub struct RabbitMqFabric {
    connection: Connection,
    publisher: AmqpChannel,
    email_queue: String,
    push_queue: String,
    failed_queue: String,
    prefetch_count: u16,
}

impl RabbitMqFabric {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ...");

        let connection = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        let publisher = connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to enable publisher confirms: {}", e))?;

        let fabric = Self {
            connection,
            publisher,
            email_queue: config.email_queue_name.clone(),
            push_queue: config.push_queue_name.clone(),
            failed_queue: config.failed_queue_name.clone(),
            prefetch_count: config.prefetch_count,
        };

        for queue in [&fabric.email_queue, &fabric.push_queue] {
            fabric.declare_channel_queues(queue).await?;
        }
        fabric
            .declare(&parking_queue_name(&fabric.failed_queue), FieldTable::default())
            .await?;
        fabric
            .declare(&fabric.failed_queue, consumed_queue_args(&fabric.failed_queue))
            .await?;

        info!("RabbitMQ connection established and queues declared");
        Ok(fabric)
    }

    async fn declare_channel_queues(&self, queue: &str) -> Result<(), Error> {
        self.declare(&parking_queue_name(queue), FieldTable::default())
            .await?;

        let mut main_args = consumed_queue_args(queue);
        main_args.insert(
            "x-max-priority".into(),
            AMQPValue::ShortShortUInt(MAX_PRIORITY),
        );
        self.declare(queue, main_args).await?;

        let mut delay_args = FieldTable::default();
        delay_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString("".into()),
        );
        delay_args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(queue.into()),
        );
        self.declare(&delay_queue_name(queue), delay_args).await
    }

    async fn declare(&self, queue: &str, arguments: FieldTable) -> Result<(), Error> {
        self.publisher
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| anyhow!("Failed to declare queue {}: {}", queue, e))?;

        debug!(queue, "Queue declared");
        Ok(())
    }

    fn queue_name(&self, channel: Channel) -> &str {
        match channel {
            Channel::Email => &self.email_queue,
            Channel::Push => &self.push_queue,
        }
    }

    async fn publish_json<T: Serialize>(
        &self,
        routing_key: &str,
        payload: &T,
        properties: BasicProperties,
    ) -> Result<(), DispatchError> {
        let body = serde_json::to_vec(payload)?;

        let confirmation = self
            .publisher
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties
                    .with_delivery_mode(PERSISTENT)
                    .with_content_type("application/json".into()),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(DispatchError::Internal(anyhow!(
                "Broker refused message for {}",
                routing_key
            )));
        }

        Ok(())
    }

    async fn consume<T>(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<RabbitMqSource<T>, DispatchError> {
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await?;

        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        debug!(queue, consumer_tag, "Consumer created");

        Ok(RabbitMqSource {
            _channel: channel,
            consumer,
            queue: queue.to_string(),
            _payload: PhantomData,
        })
    }
}

#[async_trait]
impl QueueFabric for RabbitMqFabric {
    async fn publish(&self, message: &QueueMessage) -> Result<(), DispatchError> {
        let queue = self.queue_name(message.channel());
        let properties =
            BasicProperties::default().with_priority(broker_priority(message.request.priority));

        let remaining_ms = (message.not_before - Utc::now()).num_milliseconds();

        if remaining_ms > 0 {
            let delay_queue = delay_queue_name(queue);
            debug!(queue = %delay_queue, remaining_ms, "Publishing delayed message");
            self.publish_json(
                &delay_queue,
                message,
                properties.with_expiration(remaining_ms.to_string().into()),
            )
            .await
        } else {
            self.publish_json(queue, message, properties).await
        }
    }

    async fn subscribe(
        &self,
        channel: Channel,
        consumer_tag: &str,
    ) -> Result<Box<dyn MessageSource<QueueMessage>>, DispatchError> {
        let queue = self.queue_name(channel).to_string();
        Ok(Box::new(self.consume::<QueueMessage>(&queue, consumer_tag).await?))
    }

    async fn publish_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), DispatchError> {
        self.publish_json(&self.failed_queue, entry, BasicProperties::default())
            .await
    }

    async fn subscribe_dead_letters(
        &self,
        consumer_tag: &str,
    ) -> Result<Box<dyn MessageSource<DeadLetterEntry>>, DispatchError> {
        let queue = self.failed_queue.clone();
        Ok(Box::new(
            self.consume::<DeadLetterEntry>(&queue, consumer_tag).await?,
        ))
    }

    async fn ping(&self) -> Result<(), DispatchError> {
        if self.connection.status().connected() {
            Ok(())
        } else {
            Err(DispatchError::Internal(anyhow!(
                "RabbitMQ connection is not open"
            )))
        }
    }
}

struct RabbitMqSource<T> {
    _channel: AmqpChannel,
    consumer: Consumer,
    queue: String,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T: DeserializeOwned + Send + 'static> MessageSource<T> for RabbitMqSource<T> {
    async fn next(&mut self) -> Option<Result<Delivery<T>, DispatchError>> {
        loop {
            let delivery = match self.consumer.next().await? {
                Ok(delivery) => delivery,
                Err(e) => return Some(Err(e.into())),
            };

            match serde_json::from_slice::<T>(&delivery.data) {
                Ok(payload) => {
                    return Some(Ok(Delivery::new(
                        payload,
                        delivery.redelivered,
                        Box::new(RabbitMqHandle {
                            acker: delivery.acker,
                        }),
                    )));
                }
                Err(e) => {
                    error!(
                        queue = %self.queue,
                        parked_in = %parking_queue_name(&self.queue),
                        error = %e,
                        "Undecodable message, rejecting to parking queue"
                    );
                    if let Err(e) = delivery
                        .acker
                        .reject(BasicRejectOptions { requeue: false })
                        .await
                    {
                        error!(error = %e, "Failed to reject undecodable message");
                    }
                }
            }
        }
    }
}

struct RabbitMqHandle {
    acker: Acker,
}

#[async_trait]
impl DeliveryHandle for RabbitMqHandle {
    async fn ack(&self) -> Result<(), DispatchError> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), DispatchError> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}
