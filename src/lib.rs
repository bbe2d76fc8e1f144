//! Point-to-point messaging over a broker queue: a connection manager, a
//! producer, a polling consumer, a push-based listener and a coordinated
//! shutdown, on top of a pluggable transport.

pub mod config;
pub mod connection;
pub mod consumer;
pub mod diagnostics;
pub mod display;
pub mod env;
pub mod errors;
pub mod listener;
pub mod message;
pub mod producer;
pub mod shutdown;
pub mod transport;

pub use config::{BridgeConfig, ConnectionConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use consumer::{ReceiveSummary, SyncConsumer, TextRecord};
pub use errors::{BridgeError, Result};
pub use listener::{AsyncListener, Dispatcher, MessageSummary};
pub use message::{DeliveryMode, Message, MessageBody, PropertyValue};
pub use producer::{BatchSummary, Producer};
pub use shutdown::{ShutdownCoordinator, ShutdownReport, ShutdownState};
pub use transport::{AmqpTransport, InMemoryBroker, Transport};
