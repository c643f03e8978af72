use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    clients::{Cache, NotificationRepository},
    models::status::NotificationStatus,
};

pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(5 * 60);

pub fn status_cache_key(id: Uuid) -> String {
    format!("notification:status:{}", id)
}

/// Write-through status bookkeeping: the repository is authoritative, the
/// cache is best-effort on both paths.
pub struct StatusTracker {
    repository: Arc<dyn NotificationRepository>,
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl StatusTracker {
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        cache: Arc<dyn Cache>,
        ttl: Duration,
    ) -> Self {
        Self {
            repository,
            cache,
            ttl,
        }
    }

    pub async fn set_status(&self, id: Uuid, status: NotificationStatus) -> Result<(), Error> {
        self.repository.set_status(id, status).await?;
        self.cache_status(id, status).await;
        Ok(())
    }

    /// Marks a failed attempt without overriding a terminal status and
    /// caches whatever status the repository kept.
    pub async fn record_failure(&self, id: Uuid) -> Result<NotificationStatus, Error> {
        let status = self.repository.mark_failed(id).await?;
        self.cache_status(id, status).await;
        Ok(status)
    }

    /// Cache first, then the repository. `None` means the repository has no
    /// record of `id`.
    pub async fn get_status(&self, id: Uuid) -> Result<Option<NotificationStatus>, Error> {
        let key = status_cache_key(id);

        match self.cache.get(&key).await {
            Ok(Some(value)) => match value.parse::<NotificationStatus>() {
                Ok(status) => {
                    debug!(note_id = %id, "Cache hit for status");
                    return Ok(Some(status));
                }
                Err(e) => warn!(note_id = %id, error = %e, "Ignoring unreadable cached status"),
            },
            Ok(None) => debug!(note_id = %id, "Cache miss for status"),
            Err(e) => warn!(note_id = %id, error = %e, "Status cache unavailable"),
        }

        let Some(status) = self.repository.status(id).await? else {
            return Ok(None);
        };

        self.cache_status(id, status).await;

        Ok(Some(status))
    }

    /// Caches a status that was already written to the repository.
    pub async fn cache_status(&self, id: Uuid, status: NotificationStatus) {
        if let Err(e) = self
            .cache
            .set(&status_cache_key(id), status.as_str(), self.ttl)
            .await
        {
            warn!(note_id = %id, status = %status, error = %e, "Failed to cache notification status");
        }
    }
}
