use anyhow::{Error, Result, anyhow};
use tracing::{debug, info};

use crate::broker::{BrokerSession, QueueArguments};

pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub queue: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
}

impl QueueTopology {
    pub fn new(queue: &str, dead_letter_exchange: &str, dead_letter_queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            dead_letter_exchange: dead_letter_exchange.to_string(),
            dead_letter_queue: dead_letter_queue.to_string(),
        }
    }

    /// Arguments that route rejected-without-requeue messages of the main
    /// queue into the dead-letter queue.
    pub fn main_queue_arguments(&self) -> QueueArguments {
        let mut arguments = QueueArguments::new();
        arguments.insert(
            DEAD_LETTER_EXCHANGE_ARG.to_string(),
            self.dead_letter_exchange.clone(),
        );
        arguments.insert(
            DEAD_LETTER_ROUTING_KEY_ARG.to_string(),
            self.dead_letter_queue.clone(),
        );
        arguments
    }

    /// Asserts the exchange, both queues and the binding. Safe to repeat on
    /// every (re)connect: declarations with identical arguments are no-ops on
    /// the broker and never purge queued messages.
    pub async fn declare(&self, session: &dyn BrokerSession) -> Result<(), Error> {
        session
            .declare_exchange(&self.dead_letter_exchange)
            .await
            .map_err(|e| anyhow!("Failed to declare dead-letter exchange: {}", e))?;

        debug!(exchange = %self.dead_letter_exchange, "Dead-letter exchange declared");

        session
            .declare_queue(&self.dead_letter_queue, QueueArguments::new())
            .await
            .map_err(|e| anyhow!("Failed to declare dead-letter queue: {}", e))?;

        session
            .bind_queue(
                &self.dead_letter_queue,
                &self.dead_letter_exchange,
                &self.dead_letter_queue,
            )
            .await
            .map_err(|e| anyhow!("Failed to bind dead-letter queue: {}", e))?;

        debug!(queue = %self.dead_letter_queue, "Dead-letter queue declared and bound");

        session
            .declare_queue(&self.queue, self.main_queue_arguments())
            .await
            .map_err(|e| anyhow!("Failed to declare main queue: {}", e))?;

        info!(
            queue = %self.queue,
            dead_letter_exchange = %self.dead_letter_exchange,
            dead_letter_queue = %self.dead_letter_queue,
            "Queue topology declared"
        );

        Ok(())
    }
}
