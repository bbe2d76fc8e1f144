use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mq_bridge::listener::{summarize, BodySummary};
use mq_bridge::{AsyncListener, InMemoryBroker, Message, MessageBody, Producer, SyncConsumer};

use crate::common::{connected, manager_for};

const QUEUE: &str = "DEV.QUEUE.LISTEN";

async fn wait_for_count(listener: &AsyncListener, expected: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while listener.message_count() < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("listener did not see the expected messages in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_large_bytes_messages_counted() {
    let broker = InMemoryBroker::new();
    let manager = connected(&broker).await;

    let sizes = Arc::new(Mutex::new(Vec::new()));
    let sink = sizes.clone();
    let listener = AsyncListener::new(QUEUE).with_observer(move |_, message| {
        let summary = summarize(message, 0).unwrap();
        sink.lock().unwrap().push(summary.body);
    });
    listener.initialize(&manager).await.unwrap();

    let mut producer = Producer::new(manager.clone());
    producer.initialize(QUEUE).await.unwrap();
    for _ in 0..5 {
        producer.send(Message::bytes(vec![0x5A; 2000])).await.unwrap();
    }

    wait_for_count(&listener, 5).await;
    assert_eq!(listener.message_count(), 5);
    assert_eq!(listener.failure_count(), 0);
    for body in sizes.lock().unwrap().iter() {
        assert_eq!(
            body,
            &BodySummary::Bytes {
                length: 2000,
                hex_preview: None
            }
        );
    }

    listener.close().await.unwrap();
    producer.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sequence_numbers_follow_delivery_order() {
    let broker = InMemoryBroker::new();
    let manager = connected(&broker).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener = AsyncListener::new(QUEUE).with_observer(move |sequence, message| {
        let number = message.int_property("MessageNumber").unwrap().unwrap();
        sink.lock().unwrap().push((sequence, number));
    });
    listener.initialize(&manager).await.unwrap();

    let mut producer = Producer::new(manager.clone());
    producer.initialize(QUEUE).await.unwrap();
    producer.send_batch(20).await.unwrap();

    wait_for_count(&listener, 20).await;
    let seen = seen.lock().unwrap().clone();
    let expected: Vec<(u64, i32)> = (1..=20).map(|n| (n as u64, n)).collect();
    assert_eq!(seen, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failing_message_does_not_stop_delivery() {
    let broker = InMemoryBroker::new();
    let manager = connected(&broker).await;
    let listener = AsyncListener::new(QUEUE);
    listener.initialize(&manager).await.unwrap();

    broker.enqueue(
        QUEUE,
        Message::new(MessageBody::Object {
            type_name: "Order".to_string(),
            payload: b"not json".to_vec(),
        }),
    );
    broker.enqueue(QUEUE, Message::text("after the bad one"));

    wait_for_count(&listener, 2).await;
    assert_eq!(listener.failure_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_stops_deliveries_and_is_idempotent() {
    let broker = InMemoryBroker::new();
    let manager = connected(&broker).await;
    let listener = AsyncListener::new(QUEUE);
    listener.initialize(&manager).await.unwrap();

    broker.enqueue(QUEUE, Message::text("one"));
    wait_for_count(&listener, 1).await;

    listener.close().await.unwrap();
    listener.close().await.unwrap();
    broker.enqueue(QUEUE, Message::text("two"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(listener.message_count(), 1);
    assert_eq!(broker.queue_depth(QUEUE), 1);
    assert!(listener.initialize(&manager).await.unwrap_err().is_illegal_state());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_initialize_requires_connection() {
    let broker = InMemoryBroker::new();
    let listener = AsyncListener::new(QUEUE);
    let err = listener.initialize(&manager_for(&broker)).await.unwrap_err();
    assert!(err.is_illegal_state());
    assert!(!listener.is_initialized().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_consumer_async_mode_counts_deliveries() {
    let broker = InMemoryBroker::new();
    let manager = connected(&broker).await;

    let mut consumer = SyncConsumer::new(manager.clone());
    consumer.initialize(QUEUE).await.unwrap();
    let counter = consumer.receive_async().await.unwrap();
    assert_eq!(counter.message_count(), 0);

    for n in 0..3 {
        broker.enqueue(QUEUE, Message::text(format!("push {}", n)));
    }
    tokio::time::timeout(Duration::from_secs(5), async {
        while counter.message_count() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    consumer.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_lets_in_flight_delivery_finish() {
    let broker = InMemoryBroker::new();
    let manager = connected(&broker).await;

    let entered = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let listener = {
        let entered = entered.clone();
        let finished = finished.clone();
        AsyncListener::new(QUEUE).with_observer(move |_, _| {
            entered.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            finished.store(true, Ordering::SeqCst);
        })
    };
    listener.initialize(&manager).await.unwrap();
    broker.enqueue(QUEUE, Message::text("slow"));

    tokio::time::timeout(Duration::from_secs(5), async {
        while !entered.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    listener.close().await.unwrap();
    assert!(!finished.load(Ordering::SeqCst));

    tokio::time::timeout(Duration::from_secs(5), async {
        while !finished.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(listener.message_count(), 1);
    assert_eq!(listener.failure_count(), 0);
}
