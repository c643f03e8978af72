use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    channels::{ChannelSender, SendError, run_detached},
    models::channel::Channel,
};

const SUBJECT: &str = "Notification";

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

pub struct EmailSender {
    transport: Arc<AsyncSmtpTransport<Tokio1Executor>>,
    from: Mailbox,
}

impl EmailSender {
    pub fn new(config: &SmtpConfig) -> Result<Self, Error> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| anyhow!("Invalid SMTP sender address: {}", e))?;

        // No credentials means a local relay (Mailpit/Mailhog) without TLS.
        let transport = if config.username.is_empty() {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
                .port(config.port)
                .build()
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| anyhow!("Failed to create SMTP relay: {}", e))?
                .port(config.port)
                .credentials(Credentials::new(
                    config.username.clone(),
                    config.password.clone(),
                ))
                .build()
        };

        info!(host = %config.host, port = config.port, "Email sender initialized");

        Ok(Self {
            transport: Arc::new(transport),
            from,
        })
    }

    fn build_message(&self, message: &str, destination: &str) -> Result<Message, SendError> {
        let to: Mailbox = destination
            .parse()
            .map_err(|e: lettre::address::AddressError| SendError::InvalidDestination {
                destination: destination.to_string(),
                reason: e.to_string(),
            })?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(SUBJECT)
            .header(ContentType::TEXT_PLAIN)
            .body(message.to_string())
            .map_err(|e| SendError::Transport(anyhow!("Failed to build email: {}", e)))
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    async fn send(
        &self,
        ctx: &CancellationToken,
        message: &str,
        destination: &str,
    ) -> Result<(), SendError> {
        let email = self.build_message(message, destination)?;
        let transport = Arc::clone(&self.transport);

        debug!(destination, "Sending email notification");

        run_detached(ctx, async move {
            transport
                .send(email)
                .await
                .map(|_| ())
                .map_err(|e| SendError::Transport(anyhow!("Failed to send mail: {}", e)))
        })
        .await?;

        info!(destination, "Email notification sent");
        Ok(())
    }

    fn channel(&self) -> Channel {
        Channel::Email
    }
}
