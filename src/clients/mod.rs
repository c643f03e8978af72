pub mod database;
pub mod health;
pub mod rbmq;
pub mod redis;

use std::time::Duration;

use anyhow::{Error, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{notification::Notification, status::NotificationStatus};

/// Durable store of notification records.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn create(&self, notification: &Notification) -> Result<Uuid, Error>;

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, Error>;

    async fn status(&self, id: Uuid) -> Result<Option<NotificationStatus>, Error>;

    async fn set_status(&self, id: Uuid, status: NotificationStatus) -> Result<(), Error>;

    /// Records a failed attempt unless the notification already reached
    /// `sent` or `canceled`. Returns the status left in the store.
    async fn mark_failed(&self, id: Uuid) -> Result<NotificationStatus, Error>;

    async fn cancel(&self, id: Uuid) -> Result<(), Error>;

    async fn list_all(&self) -> Result<Vec<Notification>, Error>;

    async fn health_check(&self) -> Result<(), Error>;
}

/// Remote key-value cache. `get` returns `None` on a miss.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error>;

    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn health_check(&self) -> Result<(), Error>;
}
