//! The seam between the client and the underlying broker library.
//!
//! The client only orchestrates: sending, group membership, partition
//! assignment and offset storage all live behind these traits. The rdkafka
//! implementation is in [`crate::kafka_producer`] and
//! [`crate::kafka_consumer`]; [`crate::test`] has an in-memory one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::config::KafkaClientConfig;
use crate::error::{BrokerError, PublishError, SessionError};
use crate::message::{Delivery, Message};

/// Creates the broker handles owned by a [`crate::Client`].
#[async_trait]
pub trait BrokerBackend: Send + Sync {
    async fn producer(
        &self,
        config: &KafkaClientConfig,
    ) -> Result<Arc<dyn SyncProducer>, BrokerError>;

    async fn consumer_group(
        &self,
        config: &KafkaClientConfig,
        group_id: &str,
    ) -> Result<Arc<dyn ConsumerGroup>, BrokerError>;
}

/// A producer whose `send` resolves once the broker acknowledged the write.
#[async_trait]
pub trait SyncProducer: Send + Sync {
    /// Performs exactly one send; never retries on its own.
    async fn send(
        &self,
        topic: &str,
        key: &[u8],
        value: &[u8],
        timeout: Duration,
    ) -> Result<Delivery, PublishError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Membership in a consumer group.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Joins the group and runs `handler` for one session.
    ///
    /// Returns `Ok(())` when the session ends because of a rebalance or
    /// because `cancel` fired, and an error for anything else. Once closed,
    /// every call fails with [`BrokerError::ConsumerGroupClosed`].
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn GroupHandler>,
        cancel: CancellationToken,
    ) -> Result<(), SessionError>;

    /// Leaves the group. A second call returns
    /// [`BrokerError::ConsumerGroupClosed`].
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Callbacks driven by a [`ConsumerGroup`] during one session.
#[async_trait]
pub trait GroupHandler: Send + Sync {
    /// Called once at the start of a session, before any claim is consumed.
    fn setup(&self, session: &dyn GroupSession) -> Result<(), SessionError>;

    /// Called once at the end of a session, after every claim finished.
    fn cleanup(&self, session: &dyn GroupSession) -> Result<(), SessionError>;

    /// Consumes one partition claim until its message stream ends.
    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        claim: PartitionClaim,
    ) -> Result<(), SessionError>;
}

pub trait GroupSession: Send + Sync {
    /// Sequence number of this session within its consumer group.
    fn generation(&self) -> u64;

    /// Acknowledges `message`, so the group resumes after it.
    fn mark_message(&self, message: &Message);
}

/// The right to read one partition for the lifetime of a session.
///
/// The message stream is finite: it ends when the session does, and a new
/// assignment always comes with a new claim.
pub struct PartitionClaim {
    topic: String,
    partition: i32,
    messages: BoxStream<'static, Message>,
}

impl PartitionClaim {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        messages: BoxStream<'static, Message>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn into_messages(self) -> BoxStream<'static, Message> {
        self.messages
    }
}

impl fmt::Debug for PartitionClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionClaim")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .finish_non_exhaustive()
    }
}
