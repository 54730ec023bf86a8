use std::time::Duration;

use envconfig::Envconfig;

use crate::error::ConfigError;

pub const DEFAULT_BROKER: &str = "localhost:9092";
pub const DEFAULT_PRODUCER_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONSUMER_TIMEOUT: Duration = Duration::from_secs(10);

/// Kafka settings as read from the environment by the hosting service.
///
/// The core never reads the environment itself: services load this struct
/// (usually nested in their own config) and hand the result of
/// [`KafkaConfig::overrides`] to [`KafkaClientConfig::new`].
#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String, // Comma separated list of bootstrap brokers

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "10000")]
    pub kafka_message_timeout_ms: u64, // Time before a publish is reported as timed out

    #[envconfig(default = "10000")]
    pub kafka_consumer_timeout_ms: u64, // Consumer group session timeout

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // The source of this client started new groups at the tail of the log,
    // so "latest" stays the default here.
    #[envconfig(default = "latest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "2000")]
    pub kafka_rebalance_retry_backoff_ms: u64,
}

impl KafkaConfig {
    pub fn overrides(&self) -> ConfigOverrides {
        let tuning = TuningConfig {
            linger_ms: self.kafka_producer_linger_ms,
            compression_codec: self.kafka_compression_codec.clone(),
            tls: self.kafka_tls,
            offset_reset: self.kafka_consumer_offset_reset.clone(),
            rebalance_retry_backoff: Duration::from_millis(self.kafka_rebalance_retry_backoff_ms),
            ..TuningConfig::default()
        };

        ConfigOverrides {
            brokers: Some(
                self.kafka_hosts
                    .split(',')
                    .map(|host| host.to_string())
                    .collect(),
            ),
            consumer_group: None,
            producer_timeout: Some(Duration::from_millis(self.kafka_message_timeout_ms)),
            consumer_timeout: Some(Duration::from_millis(self.kafka_consumer_timeout_ms)),
            tuning: Some(tuning),
        }
    }
}

/// Knobs passed through to librdkafka, plus the few the client applies itself.
#[derive(Clone, Debug, PartialEq)]
pub struct TuningConfig {
    pub linger_ms: u32,
    pub compression_codec: String,
    pub tls: bool,
    pub offset_reset: String,
    /// Messages buffered per partition claim before the consumer loop waits
    /// for the handler to catch up.
    pub claim_buffer_size: usize,
    /// Wait applied by the rdkafka backend before reporting a failed session,
    /// so that a broken broker does not turn the rebalance loop into a spin.
    pub rebalance_retry_backoff: Duration,
    /// How long to wait for broker metadata when creating the producer.
    pub metadata_timeout: Duration,
    /// How long a revocation waits for handlers already running on the
    /// revoked partitions before giving the partitions up.
    pub revoke_drain_timeout: Duration,
    /// Raw librdkafka properties, applied last.
    pub extra: Vec<(String, String)>,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            linger_ms: 20,
            compression_codec: "none".to_string(),
            tls: false,
            offset_reset: "latest".to_string(),
            claim_buffer_size: 256,
            rebalance_retry_backoff: Duration::from_secs(2),
            metadata_timeout: Duration::from_secs(15),
            revoke_drain_timeout: Duration::from_secs(10),
            extra: Vec::new(),
        }
    }
}

/// Partial configuration; every unset field falls back to its default.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub brokers: Option<Vec<String>>,
    pub consumer_group: Option<String>,
    pub producer_timeout: Option<Duration>,
    pub consumer_timeout: Option<Duration>,
    pub tuning: Option<TuningConfig>,
}

impl ConfigOverrides {
    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct KafkaClientConfig {
    pub brokers: Vec<String>,
    pub consumer_group: Option<String>,
    pub producer_timeout: Duration,
    pub consumer_timeout: Duration,
    pub tuning: TuningConfig,
}

impl KafkaClientConfig {
    pub fn new(overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let brokers: Vec<String> = overrides
            .brokers
            .unwrap_or_else(|| vec![DEFAULT_BROKER.to_string()])
            .iter()
            .map(|broker| broker.trim())
            .filter(|broker| !broker.is_empty())
            .map(str::to_string)
            .collect();

        let config = Self {
            brokers,
            consumer_group: overrides.consumer_group,
            producer_timeout: overrides.producer_timeout.unwrap_or(DEFAULT_PRODUCER_TIMEOUT),
            consumer_timeout: overrides.consumer_timeout.unwrap_or(DEFAULT_CONSUMER_TIMEOUT),
            tuning: overrides.tuning.unwrap_or_default(),
        };
        config.validate()?;

        Ok(config)
    }

    /// Checks the invariants the client relies on. Fields are public, so the
    /// client validates again at construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.is_empty() {
            return Err(ConfigError::NoBrokers);
        }
        Ok(())
    }

    /// Returns the consumer group id, or an error if it is unset or blank.
    pub fn consumer_group(&self) -> Result<&str, ConfigError> {
        match self.consumer_group.as_deref().map(str::trim) {
            Some(group) if !group.is_empty() => Ok(group),
            _ => Err(ConfigError::MissingConsumerGroup),
        }
    }

    /// Value for librdkafka's `bootstrap.servers`.
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

impl Default for KafkaClientConfig {
    fn default() -> Self {
        Self {
            brokers: vec![DEFAULT_BROKER.to_string()],
            consumer_group: None,
            producer_timeout: DEFAULT_PRODUCER_TIMEOUT,
            consumer_timeout: DEFAULT_CONSUMER_TIMEOUT,
            tuning: TuningConfig::default(),
        }
    }
}
