use std::sync::Arc;

use anyhow::{Error, Result};
use delay_notifier::{
    api::run_api_server,
    broker::{
        NotificationBroker,
        connection::ConnectionManager,
        consumer::SenderRegistry,
    },
    channels::{email::EmailSender, telegram::TelegramSender},
    clients::{
        Cache, NotificationRepository, database::PostgresRepository, health::HealthChecker,
        rbmq::RabbitMqConnector, redis::RedisCache,
    },
    config::Config,
    services::status::StatusTracker,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .json()
        .init();

    let config = Config::load()?;

    info!("Starting delay notifier");

    let repository: Arc<dyn NotificationRepository> =
        Arc::new(PostgresRepository::connect(&config.database_url).await?);
    let cache: Arc<dyn Cache> = Arc::new(RedisCache::connect(&config).await?);
    let tracker = Arc::new(StatusTracker::new(
        Arc::clone(&repository),
        Arc::clone(&cache),
        config.status_cache_ttl(),
    ));

    let cancel = CancellationToken::new();

    let connector = Arc::new(RabbitMqConnector::new(
        &config.rabbitmq_url,
        config.prefetch_count,
    ));
    let connection = ConnectionManager::connect(
        connector,
        config.topology(),
        config.reconnect_interval(),
        &cancel,
    )
    .await?;

    let broker = NotificationBroker::new(
        Arc::clone(&connection),
        Arc::clone(&tracker),
        config.publish_timeout(),
        config.shutdown_timeout(),
        &cancel,
    );

    let senders = SenderRegistry::new(
        Arc::new(EmailSender::new(&config.smtp_config())?),
        Arc::new(TelegramSender::new(&config.telegram_config())?),
    );
    broker.start_consuming(senders).await?;

    let health_checker = HealthChecker::new(repository, cache, connection);
    let api = tokio::spawn(run_api_server(
        config.server_port,
        health_checker,
        cancel.clone(),
    ));

    wait_for_signal().await;

    info!("Shutdown signal received");

    broker.stop().await?;
    cancel.cancel();

    match api.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Health check server failed"),
        Err(e) => error!(error = %e, "Health check server task panicked"),
    }

    info!("Delay notifier stopped");

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
