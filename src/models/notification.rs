use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{channel::Channel, status::NotificationStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub message: String,
    pub destination: String,
    pub channel: Channel,
    pub status: NotificationStatus,

    #[serde(rename = "data_sent_at")]
    pub send_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        message: impl Into<String>,
        destination: impl Into<String>,
        channel: Channel,
        send_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message: message.into(),
            destination: destination.into(),
            channel,
            status: NotificationStatus::Created,
            send_at,
            created_at: Utc::now(),
        }
    }

    /// Time left until delivery is due, `None` once the moment has passed.
    pub fn time_until_due(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        (self.send_at - now).to_std().ok().filter(|d| !d.is_zero())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNotification {
    pub message: String,
    pub destination: String,
    pub channel: Channel,

    #[serde(rename = "data_sent_at")]
    pub send_at: DateTime<Utc>,
}
