//! Delivery media. Every sender funnels its transport call through
//! [`run_detached`] so cancellation is honoured even while the transport
//! itself cannot be interrupted.

pub mod email;
pub mod telegram;

use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::models::channel::Channel;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("send canceled")]
    Canceled,

    #[error("invalid destination '{destination}': {reason}")]
    InvalidDestination { destination: String, reason: String },

    #[error("{0}")]
    Transport(#[from] anyhow::Error),
}

#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(
        &self,
        ctx: &CancellationToken,
        message: &str,
        destination: &str,
    ) -> Result<(), SendError>;

    fn channel(&self) -> Channel;
}

/// Runs `operation` on its own task and waits for either its result or
/// cancellation. On cancellation the task is left to finish on its own.
pub async fn run_detached<F>(ctx: &CancellationToken, operation: F) -> Result<(), SendError>
where
    F: Future<Output = Result<(), SendError>> + Send + 'static,
{
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        let _ = done_tx.send(operation.await);
    });

    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(SendError::Canceled),
        result = done_rx => match result {
            Ok(outcome) => outcome,
            Err(_) => Err(SendError::Transport(anyhow::anyhow!("send task dropped its result"))),
        },
    }
}
