use common_kafka::{ClientError, CloseError, ConfigError, ConsumeError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid kafka configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to create kafka client: {0}")]
    Client(#[from] ClientError),
    #[error("failed to start consuming: {0}")]
    Consume(#[from] ConsumeError),
    #[error(transparent)]
    Close(#[from] CloseError),
}
