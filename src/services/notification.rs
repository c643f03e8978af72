use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    broker::NotificationBroker,
    clients::NotificationRepository,
    models::{
        notification::{CreateNotification, Notification},
        status::NotificationStatus,
    },
    services::status::StatusTracker,
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("notification {0} not found")]
    NotFound(Uuid),

    #[error("scheduled time {0} is not in the future")]
    InvalidSchedule(DateTime<Utc>),

    #[error("notification {0} is already {1}")]
    AlreadyFinished(Uuid, NotificationStatus),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Entry point for the caller layer: persists, tracks and enqueues
/// notifications.
pub struct NotificationService {
    repository: Arc<dyn NotificationRepository>,
    tracker: Arc<StatusTracker>,
    broker: Arc<NotificationBroker>,
}

impl NotificationService {
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        tracker: Arc<StatusTracker>,
        broker: Arc<NotificationBroker>,
    ) -> Self {
        Self {
            repository,
            tracker,
            broker,
        }
    }

    pub async fn create(&self, request: CreateNotification) -> Result<Notification, ServiceError> {
        if request.send_at <= Utc::now() {
            return Err(ServiceError::InvalidSchedule(request.send_at));
        }

        let mut notification = Notification::new(
            request.message,
            request.destination,
            request.channel,
            request.send_at,
        );

        let note_id = self.repository.create(&notification).await.map_err(|e| {
            error!(error = %e, "Failed to create notification in repository");
            e
        })?;

        self.tracker
            .cache_status(note_id, NotificationStatus::Created)
            .await;

        info!(note_id = %note_id, channel = %notification.channel, "Notification created");

        // Pending is recorded before publishing so a fast consumer's `sent`
        // can never be overwritten by it.
        self.tracker
            .set_status(note_id, NotificationStatus::Pending)
            .await?;

        if let Err(e) = self.broker.publish(&notification).await {
            error!(note_id = %note_id, error = %e, "Failed to publish notification");
            if let Err(revert_err) = self
                .tracker
                .set_status(note_id, NotificationStatus::Created)
                .await
            {
                warn!(note_id = %note_id, error = %revert_err, "Failed to revert status to created");
            }
            return Err(e.into());
        }

        notification.status = NotificationStatus::Pending;

        Ok(notification)
    }

    pub async fn status(&self, id: Uuid) -> Result<NotificationStatus, ServiceError> {
        self.tracker
            .get_status(id)
            .await?
            .ok_or(ServiceError::NotFound(id))
    }

    /// Marks a not-yet-delivered notification as canceled. A delivery already
    /// handed to a sender is not interrupted.
    pub async fn cancel(&self, id: Uuid) -> Result<(), ServiceError> {
        let status = self.status(id).await?;

        if status.is_terminal() {
            return Err(ServiceError::AlreadyFinished(id, status));
        }

        self.repository.cancel(id).await?;
        self.tracker
            .cache_status(id, NotificationStatus::Canceled)
            .await;

        info!(note_id = %id, "Notification canceled");
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Notification, ServiceError> {
        self.repository
            .get(id)
            .await?
            .ok_or(ServiceError::NotFound(id))
    }

    pub async fn list_all(&self) -> Result<Vec<Notification>, ServiceError> {
        Ok(self.repository.list_all().await?)
    }
}
