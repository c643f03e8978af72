use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::{
    broker::topology::QueueTopology,
    channels::{email::SmtpConfig, telegram::TelegramConfig},
};

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub rabbitmq_url: String,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default = "default_dead_letter_exchange")]
    pub dead_letter_exchange: String,
    #[serde(default = "default_dead_letter_queue")]
    pub dead_letter_queue: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default = "default_reconnect_interval_seconds")]
    pub reconnect_interval_seconds: u64,

    pub redis_url: String,
    #[serde(default = "default_status_cache_ttl_seconds")]
    pub status_cache_ttl_seconds: u64,

    pub database_url: String,

    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: String,
    #[serde(default)]
    pub smtp_password: String,
    pub smtp_from: String,

    pub telegram_bot_token: String,
    #[serde(default = "default_telegram_api_url")]
    pub telegram_api_url: String,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
}

fn default_queue_name() -> String {
    "notifications.delayed".to_string()
}

fn default_dead_letter_exchange() -> String {
    "notifications.dlx".to_string()
}

fn default_dead_letter_queue() -> String {
    "notifications.dlq".to_string()
}

fn default_prefetch_count() -> u16 {
    1
}

fn default_publish_timeout_ms() -> u64 {
    5_000
}

fn default_reconnect_interval_seconds() -> u64 {
    5
}

fn default_status_cache_ttl_seconds() -> u64 {
    300
}

fn default_smtp_port() -> u16 {
    587
}

fn default_telegram_api_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_server_port() -> u16 {
    8080
}

fn default_shutdown_timeout_seconds() -> u64 {
    10
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        Ok(config)
    }

    pub fn topology(&self) -> QueueTopology {
        QueueTopology::new(
            &self.queue_name,
            &self.dead_letter_exchange,
            &self.dead_letter_queue,
        )
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_seconds)
    }

    pub fn status_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.status_cache_ttl_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn smtp_config(&self) -> SmtpConfig {
        SmtpConfig {
            host: self.smtp_host.clone(),
            port: self.smtp_port,
            username: self.smtp_username.clone(),
            password: self.smtp_password.clone(),
            from: self.smtp_from.clone(),
        }
    }

    pub fn telegram_config(&self) -> TelegramConfig {
        TelegramConfig {
            bot_token: self.telegram_bot_token.clone(),
            api_url: self.telegram_api_url.clone(),
        }
    }
}
