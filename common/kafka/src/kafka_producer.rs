use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::{debug, error, info};

use crate::broker::SyncProducer;
use crate::config::KafkaClientConfig;
use crate::error::{BrokerError, PublishError};
use crate::message::Delivery;

pub struct KafkaContext {}

impl rdkafka::ClientContext for KafkaContext {}

pub async fn create_kafka_producer(
    config: &KafkaClientConfig,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let tuning = &config.tuning;
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", tuning.linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.producer_timeout.as_millis().to_string(),
        )
        .set("compression.codec", tuning.compression_codec.to_owned())
        // Wait for the full ISR before reporting a send as acknowledged
        .set("acks", "all");

    if tuning.tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    for (key, value) in &tuning.extra {
        client_config.set(key, value);
    }

    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer<KafkaContext> = client_config.create_with_context(KafkaContext {})?;

    // "Ping" the Kafka brokers by requesting metadata
    match api.client().fetch_metadata(None, tuning.metadata_timeout) {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

/// [`SyncProducer`] over an rdkafka `FutureProducer`: `send` resolves on the
/// delivery report.
pub struct KafkaSyncProducer {
    producer: FutureProducer<KafkaContext>,
    flush_timeout: Duration,
    closed: AtomicBool,
}

impl KafkaSyncProducer {
    pub fn new(producer: FutureProducer<KafkaContext>, flush_timeout: Duration) -> Self {
        Self {
            producer,
            flush_timeout,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SyncProducer for KafkaSyncProducer {
    async fn send(
        &self,
        topic: &str,
        key: &[u8],
        value: &[u8],
        timeout: Duration,
    ) -> Result<Delivery, PublishError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PublishError::Broker(BrokerError::ProducerClosed));
        }

        let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(topic).payload(value);
        if !key.is_empty() {
            record = record.key(key);
        }

        match self.producer.send(record, Timeout::After(timeout)).await {
            Ok((partition, offset)) => Ok(Delivery { partition, offset }),
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut), _)) => {
                Err(PublishError::Timeout)
            }
            Err((e, _)) => Err(PublishError::Broker(e.into())),
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::ProducerClosed);
        }

        // flush blocks the calling thread until the queue drains
        let producer = self.producer.clone();
        let timeout = self.flush_timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BrokerError::Other(format!("producer flush task failed: {e}")))??;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::create_mock_kafka;

    #[tokio::test]
    async fn test_send_is_acknowledged() {
        let (cluster, config) = create_mock_kafka();
        cluster
            .create_topic("events", 1, 1)
            .expect("failed to create mock topic");

        let producer = create_kafka_producer(&config)
            .await
            .expect("failed to create mocked kafka producer");
        let producer = KafkaSyncProducer::new(producer, Duration::from_secs(5));

        let delivery = producer
            .send("events", b"user-1", b"{}", Duration::from_secs(5))
            .await
            .expect("send should be acknowledged");
        assert_eq!(delivery.partition, 0);

        producer.close().await.unwrap();
        assert!(matches!(
            producer.close().await,
            Err(BrokerError::ProducerClosed)
        ));
        assert!(matches!(
            producer
                .send("events", b"", b"{}", Duration::from_secs(5))
                .await,
            Err(PublishError::Broker(BrokerError::ProducerClosed))
        ));
    }
}
