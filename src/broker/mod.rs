//! Delayed dispatch pipeline on top of a message broker.
//!
//! The broker itself is reached through [`BrokerConnector`] and
//! [`BrokerSession`]; `clients::rbmq` provides the AMQP implementation.

pub mod connection;
pub mod consumer;
pub mod publisher;
pub mod topology;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    broker::{
        connection::ConnectionManager,
        consumer::{Consumer, SenderRegistry},
        publisher::Publisher,
    },
    models::notification::Notification,
    services::status::StatusTracker,
};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Extra `x-` arguments attached to a queue declaration.
pub type QueueArguments = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub content_type: String,
    pub persistent: bool,
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), Error>;

    async fn reject(&self, requeue: bool) -> Result<(), Error>;
}

pub struct Delivery {
    pub data: Vec<u8>,
    pub redelivered: bool,
    pub acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub async fn ack(&self) -> Result<(), Error> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), Error> {
        self.acker.reject(requeue).await
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, Error>>;

/// An open connection + channel pair.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Declares a durable direct exchange.
    async fn declare_exchange(&self, name: &str) -> Result<(), Error>;

    async fn declare_queue(&self, name: &str, arguments: QueueArguments) -> Result<(), Error>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
    -> Result<(), Error>;

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), Error>;

    /// Registers a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, Error>;

    async fn close(&self) -> Result<(), Error>;
}

/// A freshly opened session plus its liveness subscription. The receiver
/// yields (or closes) when the broker drops the link.
pub struct BrokerLink {
    pub session: Arc<dyn BrokerSession>,
    pub closed: tokio::sync::mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<BrokerLink, Error>;
}

pub struct NotificationBroker {
    connection: Arc<ConnectionManager>,
    publisher: Publisher,
    tracker: Arc<StatusTracker>,
    queue_name: String,
    consumer_tag: String,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationBroker {
    pub fn new(
        connection: Arc<ConnectionManager>,
        tracker: Arc<StatusTracker>,
        publish_timeout: Duration,
        shutdown_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Self {
        let queue_name = connection.topology().queue.clone();

        Self {
            publisher: Publisher::new(Arc::clone(&connection), publish_timeout),
            connection,
            tracker,
            queue_name,
            consumer_tag: format!("delay-notifier-{}", uuid::Uuid::new_v4()),
            shutdown: cancel.child_token(),
            shutdown_timeout,
            worker: Mutex::new(None),
        }
    }

    pub async fn publish(&self, notification: &Notification) -> Result<(), Error> {
        self.publisher.publish(notification).await
    }

    /// Registers the consumer and starts the processing task. Only one
    /// consumer may run per broker.
    pub async fn start_consuming(&self, senders: SenderRegistry) -> Result<(), Error> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Err(anyhow!("Consumer already running"));
        }

        let consumer = Consumer::new(
            Arc::clone(&self.connection),
            senders,
            Arc::clone(&self.tracker),
            &self.queue_name,
            &self.consumer_tag,
            self.shutdown.clone(),
        );

        let deliveries = consumer.subscribe().await?;

        *worker = Some(tokio::spawn(consumer.run(deliveries)));

        info!(queue = %self.queue_name, consumer_tag = %self.consumer_tag, "Consumer started");

        Ok(())
    }

    pub async fn stop(&self) -> Result<(), Error> {
        info!("Stopping notification broker");

        self.shutdown.cancel();

        if let Some(mut handle) = self.worker.lock().await.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Consumer task ended abnormally"),
                Err(_) => {
                    warn!(
                        timeout_ms = self.shutdown_timeout.as_millis() as u64,
                        "Consumer did not stop in time, aborting"
                    );
                    handle.abort();
                }
            }
        }

        self.connection.close().await?;

        info!("Notification broker stopped");
        Ok(())
    }
}
