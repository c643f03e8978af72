use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Event, ExchangeKind,
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{
    Acknowledge, BrokerConnector, BrokerLink, BrokerSession, Delivery, DeliveryStream,
    OutboundMessage, QueueArguments,
};

/// Opens AMQP connections with `lapin`.
pub struct RabbitMqConnector {
    url: String,
    prefetch_count: u16,
}

impl RabbitMqConnector {
    pub fn new(url: &str, prefetch_count: u16) -> Self {
        Self {
            url: url.to_string(),
            prefetch_count,
        }
    }
}

#[async_trait]
impl BrokerConnector for RabbitMqConnector {
    async fn connect(&self) -> Result<BrokerLink, Error> {
        debug!("Connecting to RabbitMQ");

        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let mut events = Box::pin(connection.events_listener());
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    Event::Error(err) => {
                        let _ = closed_tx.send(err.to_string());
                        break;
                    }
                    Event::ConnectionBlocked(reason) => {
                        warn!(reason = %reason, "RabbitMQ blocked the connection");
                    }
                    Event::ConnectionUnblocked => info!("RabbitMQ unblocked the connection"),
                    _ => {}
                }
            }
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to set up QoS: {}", e))?;

        info!(prefetch_count = self.prefetch_count, "RabbitMQ channel created");

        Ok(BrokerLink {
            session: Arc::new(RabbitMqSession {
                connection,
                channel,
            }),
            closed: closed_rx,
        })
    }
}

pub struct RabbitMqSession {
    connection: Connection,
    channel: Channel,
}

fn field_table(arguments: QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        table.insert(key.into(), AMQPValue::LongString(value.into()));
    }
    table
}

#[async_trait]
impl BrokerSession for RabbitMqSession {
    async fn declare_exchange(&self, name: &str) -> Result<(), Error> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to declare exchange {}: {}", name, e))?;

        Ok(())
    }

    async fn declare_queue(&self, name: &str, arguments: QueueArguments) -> Result<(), Error> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                field_table(arguments),
            )
            .await
            .map_err(|e| anyhow!("Failed to declare queue {}: {}", name, e))?;

        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Error> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to bind queue {} to {}: {}", queue, exchange, e))?;

        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), Error> {
        let mut properties =
            BasicProperties::default().with_content_type(message.content_type.clone().into());
        if message.persistent {
            properties = properties.with_delivery_mode(2);
        }

        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
            .map_err(|e| anyhow!("Failed to publish message: {}", e))?;

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, Error> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to create consumer: {}", e))?;

        info!(queue, consumer_tag, "Consumer registered");

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|delivery| Delivery {
                        data: delivery.data,
                        redelivered: delivery.redelivered,
                        acker: Box::new(RabbitMqAcker(delivery.acker)),
                    })
                    .map_err(|e| anyhow!("Failed to receive delivery: {}", e))
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), Error> {
        self.channel
            .close(200, "Bye")
            .await
            .map_err(|e| anyhow!("Error closing channel: {}", e))?;

        self.connection
            .close(200, "Bye")
            .await
            .map_err(|e| anyhow!("Error closing connection: {}", e))?;

        Ok(())
    }
}

struct RabbitMqAcker(Acker);

#[async_trait]
impl Acknowledge for RabbitMqAcker {
    async fn ack(&self) -> Result<(), Error> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|_| anyhow!("Failed to acknowledge message"))
    }

    async fn reject(&self, requeue: bool) -> Result<(), Error> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(|_| anyhow!("Failed to reject message"))
    }
}
