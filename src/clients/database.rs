use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    clients::NotificationRepository,
    models::{channel::Channel, notification::Notification, status::NotificationStatus},
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS notifications (
        id UUID PRIMARY KEY,
        message TEXT NOT NULL,
        destination TEXT NOT NULL,
        channel TEXT NOT NULL,
        status TEXT NOT NULL,
        data_sent_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

const SELECT_COLUMNS: &str =
    "SELECT id, message, destination, channel, status, data_sent_at, created_at FROM notifications";

pub struct PostgresRepository {
    client: Client,
}

impl PostgresRepository {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection terminated");
            }
        });

        client
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| anyhow!("Failed to prepare notifications table: {}", e))?;

        info!("PostgreSQL connection established");

        Ok(Self { client })
    }
}

fn notification_from_row(row: &Row) -> Result<Notification, Error> {
    let channel: String = row.try_get("channel")?;
    let status: String = row.try_get("status")?;
    let send_at: DateTime<Utc> = row.try_get("data_sent_at")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    Ok(Notification {
        id: row.try_get("id")?,
        message: row.try_get("message")?,
        destination: row.try_get("destination")?,
        channel: Channel::from(channel),
        status: status.parse()?,
        send_at,
        created_at,
    })
}

#[async_trait]
impl NotificationRepository for PostgresRepository {
    async fn create(&self, notification: &Notification) -> Result<Uuid, Error> {
        let status = NotificationStatus::Created.to_string();

        self.client
            .execute(
                r#"
                INSERT INTO notifications (id, message, destination, channel, data_sent_at, status, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
                &[
                    &notification.id,
                    &notification.message,
                    &notification.destination,
                    &notification.channel.as_str(),
                    &notification.send_at,
                    &status,
                    &notification.created_at,
                ],
            )
            .await
            .map_err(|e| anyhow!("Failed to insert notification: {}", e))?;

        debug!(note_id = %notification.id, "Notification row created");

        Ok(notification.id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, Error> {
        let row = self
            .client
            .query_opt(&format!("{} WHERE id = $1", SELECT_COLUMNS), &[&id])
            .await
            .map_err(|e| anyhow!("Failed to load notification: {}", e))?;

        row.as_ref().map(notification_from_row).transpose()
    }

    async fn status(&self, id: Uuid) -> Result<Option<NotificationStatus>, Error> {
        let row = self
            .client
            .query_opt("SELECT status FROM notifications WHERE id = $1", &[&id])
            .await
            .map_err(|e| anyhow!("Failed to load notification status: {}", e))?;

        match row {
            Some(row) => {
                let status: String = row.try_get("status")?;
                Ok(Some(status.parse()?))
            }
            None => Ok(None),
        }
    }

    async fn set_status(&self, id: Uuid, status: NotificationStatus) -> Result<(), Error> {
        let updated = self
            .client
            .execute(
                "UPDATE notifications SET status = $1 WHERE id = $2",
                &[&status.as_str(), &id],
            )
            .await
            .map_err(|e| anyhow!("Failed to update notification status: {}", e))?;

        if updated == 0 {
            return Err(anyhow!("Notification {} not found", id));
        }

        debug!(note_id = %id, status = %status, "Notification status updated");

        Ok(())
    }

    async fn mark_failed(&self, id: Uuid) -> Result<NotificationStatus, Error> {
        let row = self
            .client
            .query_opt(
                r#"
                UPDATE notifications
                SET status = CASE WHEN status IN ('sent', 'canceled') THEN status ELSE 'failed' END
                WHERE id = $1
                RETURNING status
                "#,
                &[&id],
            )
            .await
            .map_err(|e| anyhow!("Failed to record failed attempt: {}", e))?
            .ok_or_else(|| anyhow!("Notification {} not found", id))?;

        let status: String = row.try_get("status")?;
        let status: NotificationStatus = status.parse()?;

        debug!(note_id = %id, status = %status, "Failed attempt recorded");

        Ok(status)
    }

    async fn cancel(&self, id: Uuid) -> Result<(), Error> {
        self.set_status(id, NotificationStatus::Canceled).await
    }

    async fn list_all(&self) -> Result<Vec<Notification>, Error> {
        let rows = self
            .client
            .query(&format!("{} ORDER BY created_at", SELECT_COLUMNS), &[])
            .await
            .map_err(|e| anyhow!("Failed to list notifications: {}", e))?;

        rows.iter().map(notification_from_row).collect()
    }

    async fn health_check(&self) -> Result<(), Error> {
        self.client
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| anyhow!("Database health check failed: {}", e))?;

        Ok(())
    }
}
