use std::path::Path;
use std::sync::Arc;

use mq_bridge::config::{load_config_file, BridgeConfig};
use mq_bridge::{ConnectionConfig, ConnectionManager, InMemoryBroker};

pub fn manager_for(broker: &InMemoryBroker) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(
        ConnectionConfig::new("localhost", 1414, "DEV.APP.SVRCONN", "QM1"),
        Arc::new(broker.clone()),
    ))
}

pub async fn connected(broker: &InMemoryBroker) -> Arc<ConnectionManager> {
    let manager = manager_for(broker);
    manager
        .connect()
        .await
        .expect("in-memory broker accepts connections");
    manager
}

pub fn load_test_config() -> BridgeConfig {
    load_config_file(Path::new("tests/fixtures/test_config.json"))
        .expect("Failed to read test config file")
}
