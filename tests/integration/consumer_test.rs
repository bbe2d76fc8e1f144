use std::time::{Duration, Instant};

use mq_bridge::consumer::UNKNOWN;
use mq_bridge::{BridgeError, InMemoryBroker, Message, Producer, SyncConsumer};

use crate::common::connected;

const QUEUE: &str = "DEV.QUEUE.1";

#[tokio::test(flavor = "multi_thread")]
async fn test_hundred_messages_arrive_in_order() {
    let broker = InMemoryBroker::new();
    let manager = connected(&broker).await;

    let mut producer = Producer::new(manager.clone());
    producer.initialize(QUEUE).await.unwrap();
    let sent = producer.send_batch(100).await.unwrap();
    assert_eq!(sent.count, 100);

    let mut consumer = SyncConsumer::new(manager.clone());
    consumer.initialize(QUEUE).await.unwrap();
    let summary = consumer
        .drain_until_timeout(Duration::from_millis(5000))
        .await
        .unwrap();

    assert_eq!(summary.received, 100);
    assert_eq!(summary.failed, 0);
    let numbers: Vec<i32> = summary.records.iter().map(|r| r.message_number).collect();
    assert_eq!(numbers, (1..=100).collect::<Vec<i32>>());
    for record in &summary.records {
        assert_eq!(record.message_type, "TEST");
        assert_eq!(record.queue_name, QUEUE);
        assert!(record.message_id.is_some());
        assert!(record.timestamp.is_some());
        assert!(record
            .text
            .starts_with(&format!("Message #{} | Timestamp: ", record.message_number)));
    }

    producer.close().await.unwrap();
    consumer.close().await.unwrap();
    assert!(manager.disconnect().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_text_and_properties_survive_round_trip() {
    let broker = InMemoryBroker::new();
    let manager = connected(&broker).await;

    let mut producer = Producer::new(manager.clone());
    producer.initialize(QUEUE).await.unwrap();
    producer
        .send(
            Message::text("héllo\nworld")
                .with_property("MessageNumber", 42)
                .with_property("MessageType", "ORDER"),
        )
        .await
        .unwrap();

    let mut consumer = SyncConsumer::new(manager);
    consumer.initialize(QUEUE).await.unwrap();
    let summary = consumer
        .receive_exactly(1, Duration::from_millis(200))
        .await
        .unwrap();

    let record = &summary.records[0];
    assert_eq!(record.text, "héllo\nworld");
    assert_eq!(record.message_number, 42);
    assert_eq!(record.message_type, "ORDER");
    assert_eq!(record.queue_name, UNKNOWN);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_drain_waits_full_timeout() {
    let broker = InMemoryBroker::new();
    let mut consumer = SyncConsumer::new(connected(&broker).await);
    consumer.initialize(QUEUE).await.unwrap();

    let timeout = Duration::from_millis(150);
    let started = Instant::now();
    let summary = consumer.drain_until_timeout(timeout).await.unwrap();

    assert_eq!(summary.received, 0);
    assert!(summary.records.is_empty());
    assert!(started.elapsed() >= timeout);
    assert!(summary.elapsed >= timeout);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_receive_exactly_returns_short_count() {
    let broker = InMemoryBroker::new();
    for n in 1..=3 {
        broker.enqueue(QUEUE, Message::text(format!("m{}", n)));
    }
    let mut consumer = SyncConsumer::new(connected(&broker).await);
    consumer.initialize(QUEUE).await.unwrap();

    let timeout = Duration::from_millis(100);
    let started = Instant::now();
    let summary = consumer.receive_exactly(10, timeout).await.unwrap();
    assert_eq!(summary.received, 3);
    // one empty poll ends the call
    assert!(started.elapsed() < timeout * 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_send_outside_lifecycle_is_illegal() {
    let broker = InMemoryBroker::new();
    let mut producer = Producer::new(connected(&broker).await);

    let before = producer.send(Message::text("too early")).await.unwrap_err();
    assert!(matches!(before, BridgeError::IllegalState(_)));

    producer.initialize(QUEUE).await.unwrap();
    producer.send(Message::text("ok")).await.unwrap();
    producer.close().await.unwrap();

    let after = producer.send(Message::text("too late")).await.unwrap_err();
    assert!(matches!(after, BridgeError::IllegalState(_)));
    assert_eq!(broker.queue_depth(QUEUE), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_double_close_is_noop() {
    let broker = InMemoryBroker::new();
    let manager = connected(&broker).await;

    let mut producer = Producer::new(manager.clone());
    producer.initialize(QUEUE).await.unwrap();
    let mut consumer = SyncConsumer::new(manager.clone());
    consumer.initialize(QUEUE).await.unwrap();

    producer.close().await.unwrap();
    producer.close().await.unwrap();
    consumer.close().await.unwrap();
    consumer.close().await.unwrap();
    assert!(manager.disconnect().await.is_empty());
    assert!(manager.disconnect().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_stops_at_first_send_failure() {
    let broker = InMemoryBroker::new();
    let mut producer = Producer::new(connected(&broker).await);
    producer.initialize(QUEUE).await.unwrap();
    broker.fail_sends_after(5);

    let err = producer.send_batch(20).await.unwrap_err();
    assert!(matches!(err, BridgeError::SendError(_)));
    assert_eq!(producer.sent_count(), 5);
    assert_eq!(broker.queue_depth(QUEUE), 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_drain_cut_short_by_disconnect_keeps_received_messages() {
    let broker = InMemoryBroker::new();
    let manager = connected(&broker).await;
    broker.enqueue(QUEUE, Message::text("first"));

    let mut consumer = SyncConsumer::new(manager.clone());
    consumer.initialize(QUEUE).await.unwrap();

    let teardown = {
        let manager = manager.clone();
        let broker = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            manager.disconnect().await;
            broker.enqueue(QUEUE, Message::text("second"));
        })
    };

    let summary = consumer
        .drain_until_timeout(Duration::from_millis(500))
        .await
        .unwrap();
    teardown.await.unwrap();

    assert_eq!(summary.received, 1);
    assert_eq!(summary.records[0].text, "first");
    assert!(summary.interrupted.is_some());
    assert_eq!(broker.queue_depth(QUEUE), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_receive_failure_before_any_message_is_an_error() {
    let broker = InMemoryBroker::new();
    let manager = connected(&broker).await;
    let mut consumer = SyncConsumer::new(manager.clone());
    consumer.initialize(QUEUE).await.unwrap();

    manager.disconnect().await;
    let result = consumer.drain_until_timeout(Duration::from_millis(50)).await;
    assert!(matches!(result, Err(BridgeError::Transport(_))));
}
