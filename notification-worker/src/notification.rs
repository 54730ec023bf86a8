use std::sync::Arc;

use async_trait::async_trait;
use common_kafka::{HandlerError, Message, MessageHandler};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Record carried by the notification topics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub to: String,
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("notification has no recipient")]
    MissingRecipient,
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, request: &NotificationRequest) -> Result<(), NotificationError>;
}

/// Logs notifications instead of delivering them.
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send(&self, request: &NotificationRequest) -> Result<(), NotificationError> {
        if request.to.trim().is_empty() {
            return Err(NotificationError::MissingRecipient);
        }
        info!(to = %request.to, subject = %request.subject, "Sending notification");
        Ok(())
    }
}

pub struct NotificationHandler {
    sender: Arc<dyn NotificationSender>,
}

impl NotificationHandler {
    pub fn new(sender: Arc<dyn NotificationSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl MessageHandler for NotificationHandler {
    async fn handle_message(&self, message: &Message) -> Result<(), HandlerError> {
        let request: NotificationRequest = serde_json::from_slice(&message.value)?;
        self.sender.send(&request).await?;
        Ok(())
    }
}
