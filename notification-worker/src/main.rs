//! Consume notification requests from Kafka and hand them to the notification sender.
use std::sync::Arc;

use common_kafka::{Client, ConsumeError, KafkaClientConfig};
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use notification_worker::config::Config;
use notification_worker::error::WorkerError;
use notification_worker::notification::{LogNotificationSender, NotificationHandler};
use notification_worker::signals::wait_for_shutdown_signal;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let kafka_config = KafkaClientConfig::new(config.kafka_overrides())?;
    let client = Client::new(kafka_config).await?;

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_shutdown.cancel();
    });

    let handler = Arc::new(NotificationHandler::new(Arc::new(LogNotificationSender)));
    match client
        .consume(shutdown.clone(), config.notification_topics.0.clone(), handler)
        .await
    {
        Ok(()) => info!("Consuming notification requests"),
        Err(ConsumeError::Cancelled) => info!("Shutdown requested before joining the group"),
        Err(e) => {
            shutdown.cancel();
            client.close().await?;
            return Err(e.into());
        }
    }

    shutdown.cancelled().await;
    client.close().await?;
    info!("Notification worker stopped");

    Ok(())
}
