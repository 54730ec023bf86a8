use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::{BrokerBackend, ConsumerGroup, SyncProducer};
use crate::config::KafkaClientConfig;
use crate::error::BrokerError;
use crate::kafka_consumer::KafkaConsumerGroup;
use crate::kafka_producer::{create_kafka_producer, KafkaSyncProducer};

/// Production backend: librdkafka through the `rdkafka` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct KafkaBackend;

#[async_trait]
impl BrokerBackend for KafkaBackend {
    async fn producer(
        &self,
        config: &KafkaClientConfig,
    ) -> Result<Arc<dyn SyncProducer>, BrokerError> {
        let producer = create_kafka_producer(config).await?;
        Ok(Arc::new(KafkaSyncProducer::new(
            producer,
            config.producer_timeout,
        )))
    }

    async fn consumer_group(
        &self,
        config: &KafkaClientConfig,
        group_id: &str,
    ) -> Result<Arc<dyn ConsumerGroup>, BrokerError> {
        let group = KafkaConsumerGroup::new(config, group_id)?;
        Ok(Arc::new(group))
    }
}
