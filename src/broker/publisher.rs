use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use tokio::time::timeout;
use tracing::{error, info};

use crate::{
    broker::{JSON_CONTENT_TYPE, OutboundMessage, connection::ConnectionManager},
    models::notification::Notification,
};

pub struct Publisher {
    connection: Arc<ConnectionManager>,
    publish_timeout: Duration,
}

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>, publish_timeout: Duration) -> Self {
        Self {
            connection,
            publish_timeout,
        }
    }

    /// Publishes a persistent JSON copy of `notification` to the main queue.
    /// Failures are returned as-is; re-submitting is up to the caller.
    pub async fn publish(&self, notification: &Notification) -> Result<(), Error> {
        let payload = serde_json::to_vec(notification).map_err(|e| {
            error!(error = %e, note_id = %notification.id, "Failed to serialize notification");
            anyhow!("Failed to serialize notification: {}", e)
        })?;

        let message = OutboundMessage {
            payload,
            content_type: JSON_CONTENT_TYPE.to_string(),
            persistent: true,
        };

        let queue = &self.connection.topology().queue;
        let session = self.connection.session().await;

        match timeout(self.publish_timeout, session.publish(queue, message)).await {
            Ok(Ok(())) => {
                info!(
                    note_id = %notification.id,
                    channel = %notification.channel,
                    send_at = %notification.send_at,
                    "Notification published"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, note_id = %notification.id, "Failed to publish notification");
                Err(anyhow!("Failed to publish notification: {}", e))
            }
            Err(_) => {
                error!(
                    note_id = %notification.id,
                    timeout_ms = self.publish_timeout.as_millis() as u64,
                    "Publishing notification timed out"
                );
                Err(anyhow!("Publishing notification timed out"))
            }
        }
    }
}
