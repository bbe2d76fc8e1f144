// src/transport/mod.rs
// Capabilities the bridge needs from a broker transport.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::errors::Result;
use crate::message::{DeliveryMode, Message};

pub mod amqp;
pub mod memory;

pub use amqp::AmqpTransport;
pub use memory::InMemoryBroker;

/// A named queue resolved from a session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Destination {
    name: String,
}

impl Destination {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Callback the transport invokes for every pushed message.
///
/// Invocations for one registration never overlap, but they run on a task the
/// caller does not control, so implementations must be `Send + Sync` and must
/// not block for long.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: Message);
}

impl<F> MessageHandler for F
where
    F: Fn(Message) + Send + Sync,
{
    fn on_message(&self, message: Message) {
        self(message)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a transport-level connection. The connection is not started.
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    /// Starts delivery; pushed messages flow only after this.
    async fn start(&self) -> Result<()>;

    /// Opens a non-transacted, auto-acknowledge session.
    async fn create_session(&self) -> Result<Arc<dyn Session>>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait Session: Send + Sync {
    async fn create_queue(&self, name: &str) -> Result<Destination>;

    async fn create_producer(
        &self,
        destination: &Destination,
        delivery_mode: DeliveryMode,
    ) -> Result<Box<dyn ProducerHandle>>;

    async fn create_consumer(&self, destination: &Destination) -> Result<Box<dyn ConsumerHandle>>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait ProducerHandle: Send + Sync {
    async fn send(&self, message: Message) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    /// Waits up to `timeout` for the next message. `Ok(None)` means nothing arrived.
    async fn receive(&self, timeout: Duration) -> Result<Option<Message>>;

    /// Switches the consumer to push delivery through `handler`.
    async fn set_handler(&self, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Stops further deliveries. A delivery already running is not interrupted.
    async fn close(&self) -> Result<()>;
}
