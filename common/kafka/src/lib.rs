pub mod broker;
pub mod claim;
pub mod client;
pub mod config;
pub mod error;
pub mod kafka_backend;
pub mod kafka_consumer;
pub mod kafka_producer;
pub mod message;
pub mod metrics_consts;
pub mod signal;
pub mod supervisor;

pub use client::Client;
pub use config::{ConfigOverrides, KafkaClientConfig, KafkaConfig, TuningConfig};
pub use error::{
    BrokerError, ClientError, CloseError, ConfigError, ConsumeError, HandlerError, PublishError,
    SessionError,
};
pub use message::{Delivery, Message, MessageHandler};
pub use supervisor::SupervisorState;
