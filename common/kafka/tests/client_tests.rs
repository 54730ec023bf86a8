use std::sync::Arc;
use std::time::Duration;

use common_kafka::broker::SyncProducer;
use common_kafka::test::{
    ConsumerEvent, EventLog, FakeBroker, FakeClaim, FakeConsumerGroup, FakeProducer,
    FakeSessionScript, NoopHandler, RecordingHandler,
};
use common_kafka::{
    BrokerError, Client, ConfigError, ConfigOverrides, ConsumeError, KafkaClientConfig,
    PublishError, SupervisorState,
};
use tokio_util::sync::CancellationToken;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn config_with_group(group: &str) -> KafkaClientConfig {
    KafkaClientConfig::new(ConfigOverrides::default().with_consumer_group(group)).unwrap()
}

async fn client_for(broker: &Arc<FakeBroker>, config: KafkaClientConfig) -> Client {
    Client::with_backend(config, broker.clone())
        .await
        .expect("failed to create client")
}

fn topics() -> Vec<String> {
    vec!["auth.login".to_string(), "email.notifications".to_string()]
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn publish_is_acknowledged() {
    let broker = Arc::new(FakeBroker::default());
    let client = client_for(&broker, KafkaClientConfig::default()).await;

    let delivery = client
        .publish("email.notifications", b"user-1", b"{\"to\":\"a@b.c\"}")
        .await
        .unwrap();

    let sent = broker.producer.sent_at(delivery.offset).unwrap();
    assert_eq!(sent.topic, "email.notifications");
    assert_eq!(sent.key, b"user-1");
    assert_eq!(broker.producer.sends(), 1);
}

#[tokio::test]
async fn publish_json_serializes_record() {
    let broker = Arc::new(FakeBroker::default());
    let client = client_for(&broker, KafkaClientConfig::default()).await;

    let record = serde_json::json!({ "to": "someone@example.com", "subject": "hi" });
    let delivery = client
        .publish_json("email.notifications", b"", &record)
        .await
        .unwrap();

    let sent = broker.producer.sent_at(delivery.offset).unwrap();
    let decoded: serde_json::Value = serde_json::from_slice(&sent.value).unwrap();
    assert_eq!(decoded, record);
}

#[tokio::test]
async fn publish_after_close_never_reaches_the_broker() {
    let broker = Arc::new(FakeBroker::default());
    let client = client_for(&broker, KafkaClientConfig::default()).await;

    client.close().await.unwrap();

    for (topic, key, value) in [
        ("auth.login", &b""[..], &b""[..]),
        ("email.notifications", &b"key"[..], &b"{}"[..]),
        ("", &b"k"[..], &b"fail"[..]),
    ] {
        let result = client.publish(topic, key, value).await;
        assert!(matches!(result, Err(PublishError::ClientClosed)));
    }
    assert_eq!(broker.producer.sends(), 0);
}

#[tokio::test]
async fn publish_errors_are_surfaced_without_retry() {
    let broker = Arc::new(FakeBroker::default());
    let client = client_for(&broker, KafkaClientConfig::default()).await;

    let result = client.publish("auth.login", b"", b"fail please").await;

    assert!(matches!(
        result,
        Err(PublishError::Broker(BrokerError::Other(_)))
    ));
    assert_eq!(broker.producer.sends(), 1);
}

#[tokio::test]
async fn publish_racing_close_reports_client_closed() {
    let broker = Arc::new(FakeBroker::default());
    let client = client_for(&broker, KafkaClientConfig::default()).await;

    // The producer is already shut down while the client still looks open
    broker.producer.close().await.unwrap();

    let result = client.publish("auth.login", b"", b"{}").await;
    assert!(matches!(result, Err(PublishError::ClientClosed)));
    assert_eq!(broker.producer.sends(), 1);
}

#[tokio::test]
async fn concurrent_publishes_get_their_own_outcome() {
    let broker = Arc::new(FakeBroker::default());
    let client = Arc::new(client_for(&broker, KafkaClientConfig::default()).await);

    let handles: Vec<_> = (0..64)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let value = if i % 3 == 0 {
                    format!("fail-{i}")
                } else {
                    format!("ok-{i}")
                };
                let result = client.publish("auth.login", b"", value.as_bytes()).await;
                (value, result)
            })
        })
        .collect();

    for handle in handles {
        let (value, result) = handle.await.unwrap();
        if value.starts_with("fail") {
            assert!(result.is_err(), "{value} should have been rejected");
        } else {
            let delivery = result.unwrap();
            let sent = broker.producer.sent_at(delivery.offset).unwrap();
            assert_eq!(sent.value, value.as_bytes());
        }
    }
    assert_eq!(broker.producer.sends(), 64);
}

#[tokio::test]
async fn consume_without_group_fails_fast() {
    let broker = Arc::new(FakeBroker::default());
    let client = client_for(&broker, KafkaClientConfig::default()).await;

    let result = client
        .consume(CancellationToken::new(), topics(), Arc::new(NoopHandler))
        .await;

    assert!(matches!(
        result,
        Err(ConsumeError::Config(ConfigError::MissingConsumerGroup))
    ));
    assert_eq!(client.background_tasks(), 0);
    assert_eq!(broker.groups_created(), 0);
    assert_eq!(client.consumer_state(), None);
}

#[tokio::test]
async fn consume_without_topics_fails_fast() {
    let broker = Arc::new(FakeBroker::default());
    let client = client_for(&broker, config_with_group("workers")).await;

    let result = client
        .consume(CancellationToken::new(), vec![], Arc::new(NoopHandler))
        .await;

    assert!(matches!(
        result,
        Err(ConsumeError::Config(ConfigError::NoTopics))
    ));
    assert_eq!(client.background_tasks(), 0);
}

#[tokio::test]
async fn consume_returns_once_session_is_active() {
    let broker = Arc::new(FakeBroker::default());
    let client = client_for(&broker, config_with_group("workers")).await;

    tokio::time::timeout(
        TEST_TIMEOUT,
        client.consume(CancellationToken::new(), topics(), Arc::new(NoopHandler)),
    )
    .await
    .expect("consume did not return")
    .unwrap();

    assert_eq!(client.consumer_state(), Some(SupervisorState::Active));
    assert_eq!(client.background_tasks(), 1);

    let second = client
        .consume(CancellationToken::new(), topics(), Arc::new(NoopHandler))
        .await;
    assert!(matches!(second, Err(ConsumeError::AlreadyConsuming)));

    client.close().await.unwrap();
    assert_eq!(client.background_tasks(), 0);
    assert_eq!(client.consumer_state(), Some(SupervisorState::Stopped));
}

#[tokio::test]
async fn messages_are_handled_then_marked_in_order() {
    let log = EventLog::default();
    let group = FakeConsumerGroup::new(vec![FakeSessionScript::hold(vec![FakeClaim::with_messages(
        "auth.login",
        0,
        20,
    )])])
    .with_log(log.clone());
    let broker = Arc::new(FakeBroker::new(group));
    let client = client_for(&broker, config_with_group("workers")).await;

    client
        .consume(
            CancellationToken::new(),
            topics(),
            Arc::new(RecordingHandler::new(log.clone())),
        )
        .await
        .unwrap();
    wait_until(|| log.marked().len() == 20).await;

    let expected: Vec<ConsumerEvent> = (0..20)
        .flat_map(|offset| {
            [
                ConsumerEvent::Handled {
                    partition: 0,
                    offset,
                },
                ConsumerEvent::Marked {
                    partition: 0,
                    offset,
                },
            ]
        })
        .collect();
    assert_eq!(log.events(), expected);

    client.close().await.unwrap();
}

#[tokio::test]
async fn handler_failure_does_not_stop_the_partition() {
    let log = EventLog::default();
    let group = FakeConsumerGroup::new(vec![FakeSessionScript::hold(vec![
        FakeClaim::with_messages("auth.login", 0, 10),
        FakeClaim::with_messages("auth.login", 1, 10),
    ])])
    .with_log(log.clone());
    let broker = Arc::new(FakeBroker::new(group));
    let client = client_for(&broker, config_with_group("workers")).await;

    let handler = RecordingHandler::new(log.clone()).failing_on(&[3]);
    client
        .consume(CancellationToken::new(), topics(), Arc::new(handler))
        .await
        .unwrap();
    wait_until(|| log.marked().len() == 20).await;

    for partition in [0, 1] {
        let marked: Vec<i64> = log
            .marked()
            .into_iter()
            .filter(|(p, _)| *p == partition)
            .map(|(_, offset)| offset)
            .collect();
        assert_eq!(marked, (0..10).collect::<Vec<_>>());
    }

    client.close().await.unwrap();
}

#[tokio::test]
async fn failing_joins_are_retried_indefinitely() {
    let broker = Arc::new(FakeBroker::new(FakeConsumerGroup::failing(
        "coordinator not available",
    )));
    let client = Arc::new(client_for(&broker, config_with_group("workers")).await);
    let ctx = CancellationToken::new();

    let consuming = {
        let client = client.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            client
                .consume(ctx, topics(), Arc::new(NoopHandler))
                .await
        })
    };

    wait_until(|| broker.group.joins() >= 3).await;
    assert!(!consuming.is_finished());
    assert_ne!(client.consumer_state(), Some(SupervisorState::Stopped));

    ctx.cancel();
    let result = tokio::time::timeout(TEST_TIMEOUT, consuming)
        .await
        .expect("consume did not return after cancellation")
        .unwrap();
    assert!(matches!(result, Err(ConsumeError::Cancelled)));

    let joins_after_cancel = broker.group.joins();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.group.joins(), joins_after_cancel);
    assert_eq!(client.consumer_state(), Some(SupervisorState::Stopped));

    client.close().await.unwrap();
}

#[tokio::test]
async fn cancellation_stops_the_supervisor() {
    let broker = Arc::new(FakeBroker::default());
    let client = client_for(&broker, config_with_group("workers")).await;
    let ctx = CancellationToken::new();

    client
        .consume(ctx.clone(), topics(), Arc::new(NoopHandler))
        .await
        .unwrap();
    assert_eq!(broker.group.joins(), 1);

    ctx.cancel();
    wait_until(|| client.background_tasks() == 0).await;

    assert_eq!(client.consumer_state(), Some(SupervisorState::Stopped));
    assert_eq!(broker.group.joins(), 1);
    client.close().await.unwrap();
}

#[tokio::test]
async fn close_twice_is_safe() {
    let broker = Arc::new(FakeBroker::default());
    let client = client_for(&broker, config_with_group("workers")).await;

    client
        .consume(CancellationToken::new(), topics(), Arc::new(NoopHandler))
        .await
        .unwrap();

    tokio::time::timeout(TEST_TIMEOUT, client.close())
        .await
        .expect("first close hung")
        .unwrap();
    tokio::time::timeout(TEST_TIMEOUT, client.close())
        .await
        .expect("second close hung")
        .unwrap();

    assert!(client.is_closed());
    assert!(broker.group.is_closed());
    assert_eq!(client.background_tasks(), 0);
}

#[tokio::test]
async fn close_reports_unexpected_failures_once() {
    let broker = Arc::new(
        FakeBroker::default().with_producer(FakeProducer::failing_close("flush timed out")),
    );
    let client = client_for(&broker, config_with_group("workers")).await;

    let error = client.close().await.unwrap_err();
    assert_eq!(error.errors.len(), 1);
    assert!(error.to_string().contains("flush timed out"));

    client.close().await.unwrap();
}

#[tokio::test]
async fn consume_after_close_is_rejected() {
    let broker = Arc::new(FakeBroker::default());
    let client = client_for(&broker, config_with_group("workers")).await;

    client.close().await.unwrap();
    let result = client
        .consume(CancellationToken::new(), topics(), Arc::new(NoopHandler))
        .await;

    assert!(matches!(result, Err(ConsumeError::ClientClosed)));
    assert_eq!(client.background_tasks(), 0);
}
