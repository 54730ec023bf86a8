use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::broker::{BrokerBackend, SyncProducer};
use crate::config::KafkaClientConfig;
use crate::error::{
    BrokerError, ClientError, CloseError, ConfigError, ConsumeError, PublishError,
};
use crate::kafka_backend::KafkaBackend;
use crate::message::{Delivery, MessageHandler};
use crate::metrics_consts::{MESSAGES_PUBLISHED, PUBLISH_FAILURES};
use crate::signal::OnceSignal;
use crate::supervisor::{Supervisor, SupervisorState};

/// Publishes to and consumes from Kafka on behalf of a whole service.
///
/// One client is built at startup and shared by every task that publishes.
/// `consume` may be called once; `close` tears everything down and leaves
/// the client inert.
pub struct Client {
    config: KafkaClientConfig,
    backend: Arc<dyn BrokerBackend>,
    producer: Arc<dyn SyncProducer>,
    supervisor: Mutex<Option<Arc<Supervisor>>>,
    closed: OnceSignal,
    tasks: TaskTracker,
}

impl Client {
    pub async fn new(config: KafkaClientConfig) -> Result<Self, ClientError> {
        Self::with_backend(config, Arc::new(KafkaBackend)).await
    }

    pub async fn with_backend(
        config: KafkaClientConfig,
        backend: Arc<dyn BrokerBackend>,
    ) -> Result<Self, ClientError> {
        config.validate()?;

        let producer = backend
            .producer(&config)
            .await
            .map_err(ClientError::Producer)?;

        Ok(Self {
            config,
            backend,
            producer,
            supervisor: Mutex::new(None),
            closed: OnceSignal::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &KafkaClientConfig {
        &self.config
    }

    /// Sends one message and waits for the broker to acknowledge it, or for
    /// the configured producer timeout.
    pub async fn publish(
        &self,
        topic: &str,
        key: &[u8],
        value: &[u8],
    ) -> Result<Delivery, PublishError> {
        if self.closed.is_fired() {
            return Err(PublishError::ClientClosed);
        }

        let result = match self
            .producer
            .send(topic, key, value, self.config.producer_timeout)
            .await
        {
            // close won the race after the check above
            Err(PublishError::Broker(BrokerError::ProducerClosed)) => {
                return Err(PublishError::ClientClosed)
            }
            result => result,
        };

        match &result {
            Ok(_) => {
                metrics::counter!(MESSAGES_PUBLISHED, "topic" => topic.to_string()).increment(1);
            }
            Err(e) => {
                let reason = match e {
                    PublishError::Timeout => "timeout",
                    _ => "broker",
                };
                metrics::counter!(PUBLISH_FAILURES, "topic" => topic.to_string(), "reason" => reason)
                    .increment(1);
            }
        }
        result
    }

    /// Serializes `record` as JSON and publishes it.
    pub async fn publish_json<T: Serialize>(
        &self,
        topic: &str,
        key: &[u8],
        record: &T,
    ) -> Result<Delivery, PublishError> {
        let payload = serde_json::to_vec(record)?;
        self.publish(topic, key, &payload).await
    }

    /// Joins the configured consumer group and feeds every message of
    /// `topics` to `handler`.
    ///
    /// Returns once the first group session is active; consumption then
    /// carries on in the background until `ctx` is cancelled or the client is
    /// closed.
    pub async fn consume(
        &self,
        ctx: CancellationToken,
        topics: Vec<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ConsumeError> {
        let group_id = self.config.consumer_group()?.to_string();
        if topics.is_empty() {
            return Err(ConfigError::NoTopics.into());
        }

        if self.closed.is_fired() {
            return Err(ConsumeError::ClientClosed);
        }
        if self.supervisor.lock().is_some() {
            return Err(ConsumeError::AlreadyConsuming);
        }

        let group = self
            .backend
            .consumer_group(&self.config, &group_id)
            .await
            .map_err(ConsumeError::Broker)?;

        let attached = {
            let mut slot = self.supervisor.lock();
            // Checked again under the lock: close fires the signal before taking it
            if self.closed.is_fired() {
                Err(ConsumeError::ClientClosed)
            } else if slot.is_some() {
                Err(ConsumeError::AlreadyConsuming)
            } else {
                let supervisor = Arc::new(Supervisor::start(
                    group.clone(),
                    topics.clone(),
                    handler,
                    ctx.child_token(),
                    &self.tasks,
                ));
                *slot = Some(supervisor.clone());
                Ok(supervisor)
            }
        };

        let supervisor = match attached {
            Ok(supervisor) => supervisor,
            Err(e) => {
                if let Err(close_error) = group.close().await {
                    warn!("Failed to close unused consumer group: {}", close_error);
                }
                return Err(e);
            }
        };

        info!(group = %group_id, topics = ?topics, "Joining consumer group");
        supervisor.wait_ready().await
    }

    /// State of the consumer group loop, if `consume` was called.
    pub fn consumer_state(&self) -> Option<SupervisorState> {
        self.supervisor.lock().as_ref().map(|s| s.state())
    }

    /// Number of background tasks still running.
    pub fn background_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_fired()
    }

    /// Shuts the client down and waits for background consumption to finish.
    ///
    /// Safe to call more than once: later calls only wait for the background
    /// tasks and return `Ok(())`.
    pub async fn close(&self) -> Result<(), CloseError> {
        if !self.closed.fire() {
            self.tasks.close();
            self.tasks.wait().await;
            return Ok(());
        }

        let mut failures = CloseError::default();

        if let Err(e) = self.producer.close().await {
            error!("Failed to close producer: {}", e);
            failures.errors.push(e);
        }

        let supervisor = self.supervisor.lock().clone();
        if let Some(supervisor) = supervisor {
            supervisor.stop();
            match supervisor.group().close().await {
                Ok(()) | Err(BrokerError::ConsumerGroupClosed) => {}
                Err(e) => {
                    error!("Failed to close consumer group: {}", e);
                    failures.errors.push(e);
                }
            }
        }

        self.tasks.close();
        self.tasks.wait().await;
        info!("Kafka client closed");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }
}
