use async_trait::async_trait;
use rdkafka::message::{BorrowedMessage, Message as _};

use crate::error::HandlerError;

/// A record read from a partition claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: key.into(),
            value: value.into(),
        }
    }
}

impl From<&BorrowedMessage<'_>> for Message {
    fn from(message: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec).unwrap_or_default(),
            value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }
}

/// Broker acknowledgement of a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// Application callback invoked once per consumed message.
///
/// Errors are logged and the message is acknowledged anyway: a message that
/// keeps failing must not stall its partition.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: &Message) -> Result<(), HandlerError>;
}
