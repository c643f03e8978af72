use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    channels::{ChannelSender, SendError, run_detached},
    models::channel::Channel,
};

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub api_url: String,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct BotApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

pub struct TelegramSender {
    http_client: Client,
    send_message_url: String,
}

impl TelegramSender {
    pub fn new(config: &TelegramConfig) -> Result<Self, Error> {
        if config.bot_token.is_empty() {
            return Err(anyhow!("Telegram bot token must not be empty"));
        }

        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|_| anyhow!("Failed to create HTTP client"))?;

        let send_message_url = format!(
            "{}/bot{}/sendMessage",
            config.api_url.trim_end_matches('/'),
            config.bot_token
        );

        info!(api_url = %config.api_url, "Telegram sender initialized");

        Ok(Self {
            http_client,
            send_message_url,
        })
    }
}

#[async_trait]
impl ChannelSender for TelegramSender {
    async fn send(
        &self,
        ctx: &CancellationToken,
        message: &str,
        destination: &str,
    ) -> Result<(), SendError> {
        let chat_id: i64 =
            destination
                .trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| SendError::InvalidDestination {
                    destination: destination.to_string(),
                    reason: format!("invalid chat ID: {}", e),
                })?;

        debug!(chat_id, "Sending telegram notification");

        let request = self.http_client.post(&self.send_message_url).json(&SendMessageRequest {
            chat_id,
            text: message,
        });

        run_detached(ctx, async move {
            let response = request
                .send()
                .await
                .map_err(|e| anyhow!("Telegram request failed: {}", e))?;

            let status = response.status();
            let body: BotApiResponse = response
                .json()
                .await
                .map_err(|e| anyhow!("Telegram returned status {} with invalid body: {}", status, e))?;

            if status.is_success() && body.ok {
                Ok(())
            } else {
                Err(SendError::Transport(anyhow!(
                    "Telegram returned status {}: {}",
                    status,
                    body.description.unwrap_or_default()
                )))
            }
        })
        .await?;

        info!(chat_id, "Telegram notification sent");
        Ok(())
    }

    fn channel(&self) -> Channel {
        Channel::Telegram
    }
}
