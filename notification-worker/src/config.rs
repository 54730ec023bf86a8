use std::str::FromStr;

use common_kafka::{ConfigOverrides, KafkaConfig};
use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(from = "KAFKA_CONSUMER_GROUP", default = "notification-worker")]
    pub kafka_consumer_group: String,

    #[envconfig(from = "NOTIFICATION_TOPICS", default = "auth.login,email.notifications")]
    pub notification_topics: TopicList,
}

impl Config {
    pub fn kafka_overrides(&self) -> ConfigOverrides {
        self.kafka
            .overrides()
            .with_consumer_group(self.kafka_consumer_group.clone())
    }
}

/// Comma separated topic names; blank entries are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicList(pub Vec<String>);

impl FromStr for TopicList {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TopicList(
            s.split(',')
                .map(str::trim)
                .filter(|topic| !topic.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_list_parsing() {
        let topics: TopicList = " auth.login, ,email.notifications".parse().unwrap();
        assert_eq!(
            topics,
            TopicList(vec![
                "auth.login".to_string(),
                "email.notifications".to_string()
            ])
        );
    }
}
