use std::sync::Arc;

use mq_bridge::transport::AmqpTransport;
use mq_bridge::{BridgeError, ConnectionManager, ConnectionState, InMemoryBroker};

use crate::common::{connected, load_test_config, manager_for};

#[tokio::test(flavor = "multi_thread")]
async fn test_connection_lifecycle() {
    let broker = InMemoryBroker::new();
    let manager = manager_for(&broker);

    manager.connect().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(manager.is_connected());

    assert!(manager.disconnect().await.is_empty());
    assert!(manager.disconnect().await.is_empty());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(matches!(manager.session(), Err(e) if e.is_illegal_state()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connection_error_names_target() {
    let broker = InMemoryBroker::new();
    broker.refuse_connections("connection refused");
    let manager = manager_for(&broker);

    let err = manager.connect().await.unwrap_err();
    let text = err.to_string();
    assert!(matches!(err, BridgeError::ConnectionError { .. }));
    assert!(text.contains("QM1"));
    assert!(text.contains("1414"));
    assert!(text.contains("DEV.APP.SVRCONN"));
    assert!(!manager.is_connected());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_connect_opens_one_connection() {
    let broker = InMemoryBroker::new();
    let manager = manager_for(&broker);

    let (a, b) = tokio::join!(manager.connect(), manager.connect());
    assert!(a.is_ok() != b.is_ok());
    assert_eq!(broker.connections_opened(), 1);
    assert!(connected(&broker).await.is_connected());
}

#[test]
fn test_fixture_config_is_valid() {
    let config = load_test_config();
    config.validate().unwrap();
    assert_eq!(config.queue, "MQ.BRIDGE.TEST.QUEUE");
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn test_connection_establishes() {
    let config = load_test_config();
    let manager = ConnectionManager::new(config.connection, Arc::new(AmqpTransport::new()));

    manager.connect().await.unwrap();
    assert!(manager.is_connected());
    assert!(manager.disconnect().await.is_empty());
}
