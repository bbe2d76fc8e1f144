//! In-process broker.
//!
//! Queues live in a shared map and survive individual connections, so a
//! producer and a consumer on different connections to the same broker see the
//! same messages. Used by the test suite and by `mq-bridge --in-memory`.
//! Failures can be injected to exercise connect, send and teardown paths.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{
    Connection, ConsumerHandle, Destination, MessageHandler, ProducerHandle, Session, Transport,
};
use crate::config::ConnectionConfig;
use crate::errors::{BridgeError, Result};
use crate::message::{DeliveryMode, Message};

// Delivery tasks re-check the started flag at this interval while idle.
const IDLE_RECHECK: Duration = Duration::from_millis(20);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct FailurePlan {
    refuse_connections: Option<String>,
    sends_before_failure: Option<usize>,
    fail_session_close: bool,
    fail_connection_close: bool,
}

#[derive(Default)]
struct MemoryQueue {
    messages: Mutex<VecDeque<Message>>,
    notify: Notify,
}

impl MemoryQueue {
    fn push(&self, message: Message) {
        lock(&self.messages).push_back(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Message> {
        lock(&self.messages).pop_front()
    }

    fn len(&self) -> usize {
        lock(&self.messages).len()
    }
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    failures: Mutex<FailurePlan>,
    connections_opened: AtomicU64,
}

/// Shared handle to an in-process broker; clones see the same queues.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        lock(&self.state.queues)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Number of messages waiting on `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.state.queues)
            .get(queue)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Places a message on a queue as if another client had sent it.
    pub fn enqueue(&self, queue: &str, message: Message) {
        self.queue(queue).push(stamp(message, None));
    }

    pub fn connections_opened(&self) -> u64 {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    /// Makes every following connect attempt fail with `cause`.
    pub fn refuse_connections(&self, cause: impl Into<String>) {
        lock(&self.state.failures).refuse_connections = Some(cause.into());
    }

    pub fn accept_connections(&self) {
        lock(&self.state.failures).refuse_connections = None;
    }

    /// Lets `count` more sends succeed; every send after that fails.
    pub fn fail_sends_after(&self, count: usize) {
        lock(&self.state.failures).sends_before_failure = Some(count);
    }

    pub fn fail_session_close(&self, fail: bool) {
        lock(&self.state.failures).fail_session_close = fail;
    }

    pub fn fail_connection_close(&self, fail: bool) {
        lock(&self.state.failures).fail_connection_close = fail;
    }

    fn take_send_permit(&self) -> bool {
        let mut failures = lock(&self.state.failures);
        match failures.sends_before_failure.as_mut() {
            None => true,
            Some(0) => false,
            Some(remaining) => {
                *remaining -= 1;
                true
            }
        }
    }
}

// Sets what a provider sets on send: id, timestamp and the producer's delivery mode.
fn stamp(mut message: Message, delivery_mode: Option<DeliveryMode>) -> Message {
    if message.headers.message_id.is_none() {
        message.headers.message_id = Some(format!("ID:{}", Uuid::new_v4().simple()));
    }
    if message.headers.timestamp.is_none() {
        message.headers.timestamp = Some(Utc::now());
    }
    if let Some(mode) = delivery_mode {
        message.headers.delivery_mode = mode;
    }
    message
}

/// Flags shared by a connection and everything created from it.
#[derive(Default)]
struct Link {
    open: AtomicBool,
    started: AtomicBool,
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
        if let Some(cause) = lock(&self.state.failures).refuse_connections.clone() {
            return Err(BridgeError::Transport(cause));
        }

        self.state.connections_opened.fetch_add(1, Ordering::SeqCst);
        debug!(queue_manager = %config.queue_manager, "In-memory connection opened");

        let link = Arc::new(Link::default());
        link.open.store(true, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            link,
        }))
    }
}

struct MemoryConnection {
    broker: InMemoryBroker,
    link: Arc<Link>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn start(&self) -> Result<()> {
        if !self.is_open() {
            return Err(BridgeError::Transport("connection is closed".to_string()));
        }
        self.link.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_session(&self) -> Result<Arc<dyn Session>> {
        if !self.is_open() {
            return Err(BridgeError::Transport("connection is closed".to_string()));
        }
        Ok(Arc::new(MemorySession {
            broker: self.broker.clone(),
            link: self.link.clone(),
            open: Arc::new(AtomicBool::new(true)),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.link.started.store(false, Ordering::SeqCst);
        self.link.open.store(false, Ordering::SeqCst);
        if lock(&self.broker.state.failures).fail_connection_close {
            return Err(BridgeError::Transport("injected connection close failure".to_string()));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }
}

struct MemorySession {
    broker: InMemoryBroker,
    link: Arc<Link>,
    open: Arc<AtomicBool>,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BridgeError::Transport("session is closed".to_string()))
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn create_queue(&self, name: &str) -> Result<Destination> {
        self.ensure_open()?;
        self.broker.queue(name);
        Ok(Destination::new(name))
    }

    async fn create_producer(
        &self,
        destination: &Destination,
        delivery_mode: DeliveryMode,
    ) -> Result<Box<dyn ProducerHandle>> {
        self.ensure_open()?;
        Ok(Box::new(MemoryProducer {
            broker: self.broker.clone(),
            queue: self.broker.queue(destination.name()),
            delivery_mode,
            session_open: self.open.clone(),
            link: self.link.clone(),
            open: AtomicBool::new(true),
        }))
    }

    async fn create_consumer(&self, destination: &Destination) -> Result<Box<dyn ConsumerHandle>> {
        self.ensure_open()?;
        Ok(Box::new(MemoryConsumer {
            queue: self.broker.queue(destination.name()),
            session_open: self.open.clone(),
            link: self.link.clone(),
            open: Arc::new(AtomicBool::new(true)),
            stop: Mutex::new(None),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        if lock(&self.broker.state.failures).fail_session_close {
            return Err(BridgeError::Transport("injected session close failure".to_string()));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.link.open.load(Ordering::SeqCst)
    }
}

struct MemoryProducer {
    broker: InMemoryBroker,
    queue: Arc<MemoryQueue>,
    delivery_mode: DeliveryMode,
    session_open: Arc<AtomicBool>,
    link: Arc<Link>,
    open: AtomicBool,
}

#[async_trait]
impl ProducerHandle for MemoryProducer {
    async fn send(&self, message: Message) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BridgeError::Transport("producer is closed".to_string()));
        }
        if !self.session_open.load(Ordering::SeqCst) || !self.link.open.load(Ordering::SeqCst) {
            return Err(BridgeError::Transport("session is closed".to_string()));
        }
        if !self.broker.take_send_permit() {
            return Err(BridgeError::Transport("injected send failure".to_string()));
        }

        self.queue.push(stamp(message, Some(self.delivery_mode)));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryConsumer {
    queue: Arc<MemoryQueue>,
    session_open: Arc<AtomicBool>,
    link: Arc<Link>,
    open: Arc<AtomicBool>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl MemoryConsumer {
    fn ensure_usable(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BridgeError::Transport("consumer is closed".to_string()));
        }
        if !self.session_open.load(Ordering::SeqCst) || !self.link.open.load(Ordering::SeqCst) {
            return Err(BridgeError::Transport("session is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConsumerHandle for MemoryConsumer {
    async fn receive(&self, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;

        loop {
            self.ensure_usable()?;
            if let Some(message) = self.queue.pop() {
                return Ok(Some(message));
            }
            let notified = self.queue.notify.notified();
            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    self.ensure_usable()?;
                    return Ok(self.queue.pop());
                }
            }
        }
    }

    async fn set_handler(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.ensure_usable()?;
        let mut stop_slot = lock(&self.stop);
        if stop_slot.is_some() {
            return Err(BridgeError::Transport(
                "a message handler is already registered".to_string(),
            ));
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        *stop_slot = Some(stop_tx);

        let queue = self.queue.clone();
        let link = self.link.clone();
        let open = self.open.clone();
        tokio::spawn(async move {
            loop {
                if open.load(Ordering::SeqCst) && link.started.load(Ordering::SeqCst) {
                    if let Some(message) = queue.pop() {
                        handler.on_message(message);
                        continue;
                    }
                }
                let notified = queue.notify.notified();
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = notified => {}
                    _ = tokio::time::sleep(IDLE_RECHECK) => {}
                }
            }
            debug!("In-memory delivery task stopped");
        });

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        if let Some(stop) = lock(&self.stop).take() {
            let _ = stop.send(());
        }
        Ok(())
    }
}
