use std::sync::Arc;
use std::time::Duration;

use mq_bridge::{AsyncListener, InMemoryBroker, Message, Producer, ShutdownCoordinator, ShutdownState};

use crate::common::connected;

const QUEUE: &str = "DEV.QUEUE.SHUTDOWN";

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_reports_then_closes_listener_then_disconnects() {
    let broker = InMemoryBroker::new();
    let manager = connected(&broker).await;
    let listener = Arc::new(AsyncListener::new(QUEUE));
    listener.initialize(&manager).await.unwrap();

    for n in 0..4 {
        broker.enqueue(QUEUE, Message::text(format!("m{}", n)));
    }
    tokio::time::timeout(Duration::from_secs(5), async {
        while listener.message_count() < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let coordinator = ShutdownCoordinator::new(manager.clone(), Some(listener.clone()));
    let report = coordinator.shutdown().await.unwrap();

    assert_eq!(report.messages_processed, Some(4));
    assert_eq!(report.failures, 0);
    assert_eq!(coordinator.state(), ShutdownState::Closed);
    assert!(!listener.is_initialized().await);
    assert!(!manager.is_connected());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_triggers_tear_down_once() {
    let broker = InMemoryBroker::new();
    let manager = connected(&broker).await;
    let listener = Arc::new(AsyncListener::new(QUEUE));
    listener.initialize(&manager).await.unwrap();
    let coordinator = ShutdownCoordinator::new(manager, Some(listener));

    let (a, b) = tokio::join!(coordinator.shutdown(), coordinator.shutdown());
    assert_eq!(a.is_some() as u8 + b.is_some() as u8, 1);
    assert!(coordinator.shutdown().await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_teardown_failures_are_logged_not_raised() {
    let broker = InMemoryBroker::new();
    let manager = connected(&broker).await;
    broker.fail_session_close(true);
    broker.fail_connection_close(true);

    let coordinator = ShutdownCoordinator::new(manager.clone(), None);
    let report = coordinator.shutdown().await.unwrap();
    assert_eq!(report.failures, 2);
    assert_eq!(coordinator.state(), ShutdownState::Closed);
    assert!(!manager.is_connected());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_request_lets_producer_close_before_disconnect() {
    let broker = InMemoryBroker::new();
    let manager = connected(&broker).await;
    let coordinator = ShutdownCoordinator::new(manager.clone(), None);

    let mut producer = Producer::new(manager.clone());
    producer.initialize(QUEUE).await.unwrap();
    coordinator.request_stop();

    let outcome = tokio::select! {
        result = producer.send_batch(1000) => Some(result),
        _ = coordinator.stop_requested() => None,
    };
    assert!(outcome.is_none());
    assert!(producer.sent_count() <= 10);
    assert!(manager.is_connected());

    producer.close().await.unwrap();
    let report = coordinator.shutdown().await.unwrap();
    assert_eq!(report.failures, 0);
    assert!(!manager.is_connected());
    assert_eq!(broker.queue_depth(QUEUE) as u64, producer.sent_count());
}
