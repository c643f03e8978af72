use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use futures_util::StreamExt;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    broker::{Delivery, DeliveryStream, connection::ConnectionManager},
    channels::{ChannelSender, SendError},
    models::{channel::Channel, notification::Notification, status::NotificationStatus},
    services::status::StatusTracker,
};

/// Channel selector → sender, resolved once at startup.
#[derive(Clone, Default)]
pub struct SenderRegistry {
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
}

impl SenderRegistry {
    pub fn new(email: Arc<dyn ChannelSender>, chat: Arc<dyn ChannelSender>) -> Self {
        Self::default().register(email).register(chat)
    }

    pub fn register(mut self, sender: Arc<dyn ChannelSender>) -> Self {
        self.senders.insert(sender.channel(), sender);
        self
    }

    pub fn get(&self, channel: &Channel) -> Option<&Arc<dyn ChannelSender>> {
        self.senders.get(channel)
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.senders.keys().cloned().collect()
    }
}

pub struct Subscription {
    pub deliveries: DeliveryStream,
    pub generation: u64,
}

enum Flow {
    Continue,
    Stop,
}

/// Processes deliveries of the main queue one at a time, holding each until
/// its scheduled instant.
pub struct Consumer {
    connection: Arc<ConnectionManager>,
    senders: SenderRegistry,
    tracker: Arc<StatusTracker>,
    queue: String,
    consumer_tag: String,
    cancel: CancellationToken,
}

impl Consumer {
    pub fn new(
        connection: Arc<ConnectionManager>,
        senders: SenderRegistry,
        tracker: Arc<StatusTracker>,
        queue: &str,
        consumer_tag: &str,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connection,
            senders,
            tracker,
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            cancel,
        }
    }

    pub async fn subscribe(&self) -> anyhow::Result<Subscription> {
        let (session, generation) = self.connection.session_with_generation().await;
        let deliveries = session.consume(&self.queue, &self.consumer_tag).await?;

        Ok(Subscription {
            deliveries,
            generation,
        })
    }

    pub async fn run(self, subscription: Subscription) {
        let Subscription {
            mut deliveries,
            mut generation,
        } = subscription;

        info!(
            queue = %self.queue,
            channels = ?self.senders.channels(),
            "Consumer loop started"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Consumer cancelled");
                    break;
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    if let Flow::Stop = self.handle(delivery).await {
                        break;
                    }
                    continue;
                }
                Some(Err(e)) => {
                    error!(error = %e, "Delivery stream failed");
                }
                None => {
                    warn!("Delivery channel closed");
                }
            }

            match self.resubscribe(generation).await {
                Some(subscription) => {
                    deliveries = subscription.deliveries;
                    generation = subscription.generation;
                }
                None => break,
            }
        }

        info!(queue = %self.queue, "Consumer loop stopped");
    }

    /// Waits for the connection manager to bring up a newer session and
    /// registers on it again.
    async fn resubscribe(&self, mut generation: u64) -> Option<Subscription> {
        loop {
            info!(generation, "Waiting for broker reconnect before consuming again");

            let (session, next_generation) = self
                .connection
                .wait_for_session_after(generation, &self.cancel)
                .await?;

            match session.consume(&self.queue, &self.consumer_tag).await {
                Ok(deliveries) => {
                    info!(generation = next_generation, "Consumer re-registered");
                    return Some(Subscription {
                        deliveries,
                        generation: next_generation,
                    });
                }
                Err(e) => {
                    error!(error = %e, generation = next_generation, "Failed to re-register consumer");
                    generation = next_generation;
                }
            }
        }
    }

    async fn handle(&self, delivery: Delivery) -> Flow {
        let notification: Notification = match serde_json::from_slice(&delivery.data) {
            Ok(notification) => notification,
            Err(e) => {
                error!(error = %e, "Failed to unmarshal notification");
                self.reject(&delivery, None, false).await;
                return Flow::Continue;
            }
        };

        let note_id = notification.id;

        debug!(
            note_id = %note_id,
            channel = %notification.channel,
            redelivered = delivery.redelivered,
            "Notification received"
        );

        if let Some(wait) = notification.time_until_due(Utc::now()) {
            debug!(note_id = %note_id, wait_ms = wait.as_millis() as u64, "Waiting for scheduled time");

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(note_id = %note_id, "Context cancelled while waiting, requeueing");
                    self.reject(&delivery, Some(note_id), true).await;
                    return Flow::Stop;
                }
                _ = sleep(wait) => {
                    info!(note_id = %note_id, "Time to send notification");
                }
            }
        }

        match self.tracker.get_status(note_id).await {
            Ok(Some(NotificationStatus::Canceled)) => {
                info!(note_id = %note_id, "Notification was canceled, dropping");
                self.ack(&delivery, note_id).await;
                return Flow::Continue;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(note_id = %note_id, error = %e, "Could not check notification status");
            }
        }

        let Some(sender) = self.senders.get(&notification.channel) else {
            warn!(note_id = %note_id, channel = %notification.channel, "Unknown notification channel");
            self.reject(&delivery, Some(note_id), false).await;
            return Flow::Continue;
        };

        match sender
            .send(&self.cancel, &notification.message, &notification.destination)
            .await
        {
            Ok(()) => {
                self.ack(&delivery, note_id).await;
                self.record(note_id, NotificationStatus::Sent).await;
                info!(note_id = %note_id, channel = %notification.channel, "Notification sent");
                Flow::Continue
            }
            Err(SendError::Canceled) => {
                info!(note_id = %note_id, "Context cancelled during send, requeueing");
                self.reject(&delivery, Some(note_id), true).await;
                Flow::Stop
            }
            Err(e) => {
                error!(
                    note_id = %note_id,
                    channel = %notification.channel,
                    error = %e,
                    "Failed to send notification"
                );
                match self.tracker.record_failure(note_id).await {
                    Ok(status) if status.is_terminal() => {
                        info!(note_id = %note_id, status = %status, "Notification settled during send, dropping");
                        self.ack(&delivery, note_id).await;
                        return Flow::Continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(note_id = %note_id, error = %e, "Failed to record failed attempt");
                    }
                }
                self.reject(&delivery, Some(note_id), true).await;
                Flow::Continue
            }
        }
    }

    async fn record(&self, note_id: Uuid, status: NotificationStatus) {
        if let Err(e) = self.tracker.set_status(note_id, status).await {
            error!(note_id = %note_id, status = %status, error = %e, "Failed to update status");
        }
    }

    async fn ack(&self, delivery: &Delivery, note_id: Uuid) {
        if let Err(e) = delivery.ack().await {
            error!(note_id = %note_id, error = %e, "Failed to acknowledge message");
        }
    }

    async fn reject(&self, delivery: &Delivery, note_id: Option<Uuid>, requeue: bool) {
        if let Err(e) = delivery.reject(requeue).await {
            error!(note_id = ?note_id, requeue, error = %e, "Failed to reject message");
        }
    }
}
