use std::fmt;

use rdkafka::error::KafkaError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no brokers specified")]
    NoBrokers,
    #[error("consumer group not specified")]
    MissingConsumerGroup,
    #[error("no topics to consume")]
    NoTopics,
}

/// Failures reported by the underlying broker library.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    /// The consumer group handle was already closed. Expected during shutdown.
    #[error("tried to use consumer group that was closed")]
    ConsumerGroupClosed,
    #[error("tried to use producer that was closed")]
    ProducerClosed,
    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            BrokerError::ConsumerGroupClosed | BrokerError::ProducerClosed
        )
    }
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("client closed")]
    ClientClosed,
    #[error("failed to serialize: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to produce to kafka: {0}")]
    Broker(#[source] BrokerError),
    #[error("failed to produce to kafka (timeout)")]
    Timeout,
}

/// Error returned by a [`crate::MessageHandler`]. Never propagated past the
/// partition it happened on.
pub type HandlerError = anyhow::Error;

/// A consumer group session ended abnormally. The supervisor retries these.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("consumer group session failed: {0}")]
    Broker(#[from] BrokerError),
    #[error("consumer group session setup failed: {0}")]
    Setup(String),
}

impl From<KafkaError> for SessionError {
    fn from(error: KafkaError) -> Self {
        SessionError::Broker(BrokerError::Kafka(error))
    }
}

#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("client closed")]
    ClientClosed,
    #[error("client is already consuming")]
    AlreadyConsuming,
    #[error("failed to create consumer group: {0}")]
    Broker(#[source] BrokerError),
    #[error("consumption was cancelled before the group session started")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to create producer: {0}")]
    Producer(#[source] BrokerError),
}

/// Failures collected while tearing down the client.
#[derive(Debug, Default)]
pub struct CloseError {
    pub errors: Vec<BrokerError>,
}

impl CloseError {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to close kafka client")?;
        for (index, error) in self.errors.iter().enumerate() {
            let sep = if index == 0 { ": " } else { "; " };
            write!(f, "{sep}{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseError {}
