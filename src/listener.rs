//! Push-based consumption.
//!
//! The transport calls [`Dispatcher::on_message`] on its own delivery task
//! whenever a message arrives. Each call takes the next sequence number from an
//! atomic counter, classifies the body, logs it together with its custom
//! properties and hands it to an optional observer. Processing failures,
//! panics included, are logged against the sequence number and never reach
//! the transport, so one bad message cannot stop later deliveries.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::connection::ConnectionManager;
use crate::display::{bytes_to_hex, wrap_text, DISPLAY_WIDTH};
use crate::errors::{BridgeError, Result};
use crate::message::{DeliveryMode, Message, MessageBody};
use crate::transport::{ConsumerHandle, MessageHandler};

/// Bytes bodies at or above this size are reported by length only.
pub const BYTES_MATERIALIZE_LIMIT: usize = 1024;

/// Application hook run for every dispatched message, after it was logged.
pub type MessageObserver = Box<dyn Fn(u64, &Message) + Send + Sync>;

#[derive(Clone, Debug, PartialEq)]
pub enum BodySummary {
    Text { length: usize, lines: Vec<String> },
    Bytes { length: usize, hex_preview: Option<String> },
    Object { type_name: String, rendering: String },
    Map { entries: Vec<(String, String)> },
    Unsupported { kind: String },
}

/// What the listener reports about one message.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageSummary {
    pub sequence: u64,
    pub kind: String,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub priority: u8,
    pub delivery_mode: DeliveryMode,
    pub body: BodySummary,
    pub properties: Vec<(String, String)>,
}

/// Classifies `message`. Fails only when a body cannot be interpreted, e.g.
/// an object payload that is not valid JSON.
pub fn summarize(message: &Message, sequence: u64) -> Result<MessageSummary> {
    let body = match &message.body {
        MessageBody::Text(text) => BodySummary::Text {
            length: text.chars().count(),
            lines: if text.is_empty() {
                Vec::new()
            } else {
                wrap_text(text, DISPLAY_WIDTH)
            },
        },
        MessageBody::Bytes(data) => BodySummary::Bytes {
            length: data.len(),
            hex_preview: if !data.is_empty() && data.len() < BYTES_MATERIALIZE_LIMIT {
                Some(bytes_to_hex(data))
            } else {
                None
            },
        },
        MessageBody::Object { type_name, payload } => {
            let value: serde_json::Value = serde_json::from_slice(payload)?;
            BodySummary::Object {
                type_name: type_name.clone(),
                rendering: value.to_string(),
            }
        }
        MessageBody::Map(entries) => BodySummary::Map {
            entries: entries
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect(),
        },
        MessageBody::Other { kind, .. } => BodySummary::Unsupported { kind: kind.clone() },
    };

    Ok(MessageSummary {
        sequence,
        kind: message.kind().to_string(),
        message_id: message.headers.message_id.clone(),
        correlation_id: message.headers.correlation_id.clone(),
        priority: message.headers.priority,
        delivery_mode: message.headers.delivery_mode,
        body,
        properties: message
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect(),
    })
}

fn log_summary(queue: &str, summary: &MessageSummary) {
    info!(
        queue,
        sequence = summary.sequence,
        message_id = summary.message_id.as_deref().unwrap_or("N/A"),
        correlation_id = summary.correlation_id.as_deref().unwrap_or("N/A"),
        priority = summary.priority,
        delivery_mode = %summary.delivery_mode,
        kind = %summary.kind,
        "Message received #{}",
        summary.sequence
    );

    match &summary.body {
        BodySummary::Text { length, lines } => {
            info!("Content length: {} characters", length);
            if lines.is_empty() {
                info!("[Empty message]");
            }
            for line in lines {
                info!("| {}", line);
            }
        }
        BodySummary::Bytes {
            length,
            hex_preview,
        } => match hex_preview {
            Some(hex) => info!("Content length: {} bytes, content (hex): {}", length, hex),
            None => info!("Content length: {} bytes", length),
        },
        BodySummary::Object {
            type_name,
            rendering,
        } => info!("Object type: {}, content: {}", type_name, rendering),
        BodySummary::Map { entries } => {
            for (name, value) in entries {
                info!("  {} = {}", name, value);
            }
        }
        BodySummary::Unsupported { kind } => {
            info!("Unsupported message type {}", kind);
        }
    }

    if !summary.properties.is_empty() {
        info!("Custom properties:");
        for (name, value) in &summary.properties {
            info!("  {} = {}", name, value);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The handler registered with the transport. Shared by [`AsyncListener`]
/// and [`crate::consumer::SyncConsumer::receive_async`].
pub struct Dispatcher {
    queue_name: String,
    counter: AtomicU64,
    failures: AtomicU64,
    observer: Option<MessageObserver>,
}

impl Dispatcher {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            counter: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            observer: None,
        }
    }

    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(u64, &Message) + Send + Sync + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Messages dispatched so far, successful or not.
    pub fn message_count(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Messages whose processing failed.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Processes one message and returns its sequence number.
    pub fn dispatch(&self, message: Message) -> u64 {
        let sequence = self.counter.fetch_add(1, Ordering::SeqCst) + 1;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<()> {
            let summary = summarize(&message, sequence)?;
            log_summary(&self.queue_name, &summary);
            if let Some(observer) = &self.observer {
                observer(sequence, &message);
            }
            Ok(())
        }));

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                let err = BridgeError::ReceiveError {
                    sequence,
                    cause: e.to_string(),
                };
                warn!(queue = %self.queue_name, "{}", err);
            }
            Err(payload) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                error!(
                    queue = %self.queue_name,
                    "Panic while processing message #{}: {}",
                    sequence,
                    panic_message(payload.as_ref())
                );
            }
        }
        sequence
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue_name", &self.queue_name)
            .field("message_count", &self.message_count())
            .field("failure_count", &self.failure_count())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl MessageHandler for Dispatcher {
    fn on_message(&self, message: Message) {
        self.dispatch(message);
    }
}

/// Registers a [`Dispatcher`] on a queue and keeps the consumer alive until
/// [`close`](AsyncListener::close).
pub struct AsyncListener {
    queue_name: String,
    dispatcher: Arc<Dispatcher>,
    consumer: Mutex<Option<Box<dyn ConsumerHandle>>>,
    closed: AtomicBool,
}

impl AsyncListener {
    pub fn new(queue_name: impl Into<String>) -> Self {
        let queue_name = queue_name.into();
        Self {
            dispatcher: Arc::new(Dispatcher::new(queue_name.clone())),
            queue_name,
            consumer: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Runs `observer` for every message after it has been logged.
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(u64, &Message) + Send + Sync + 'static,
    {
        self.dispatcher = Arc::new(Dispatcher::new(self.queue_name.clone()).with_observer(observer));
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Resolves the queue, creates a consumer and registers the dispatcher.
    /// Deliveries may start before this returns.
    pub async fn initialize(&self, manager: &ConnectionManager) -> Result<()> {
        if !manager.is_connected() {
            return Err(BridgeError::IllegalState(
                "Connection manager is not connected.".to_string(),
            ));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::IllegalState(
                "Message listener has been closed.".to_string(),
            ));
        }

        let mut slot = self.consumer.lock().await;
        if slot.is_some() {
            return Err(BridgeError::IllegalState(
                "Message listener is already initialized.".to_string(),
            ));
        }

        let session = manager.session()?;
        let destination = session.create_queue(&self.queue_name).await?;
        let consumer = session.create_consumer(&destination).await?;
        consumer.set_handler(self.dispatcher.clone()).await?;
        *slot = Some(consumer);

        info!(queue = %self.queue_name, "Message listener initialized, waiting for messages");
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        self.consumer.lock().await.is_some()
    }

    /// Safe to call while deliveries are running.
    pub fn message_count(&self) -> u64 {
        self.dispatcher.message_count()
    }

    pub fn failure_count(&self) -> u64 {
        self.dispatcher.failure_count()
    }

    /// Unregisters the handler and releases the consumer. Later calls are
    /// no-ops. A delivery already in progress runs to completion.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let consumer = self.consumer.lock().await.take();

        match consumer {
            None => Ok(()),
            Some(consumer) => {
                consumer
                    .close()
                    .await
                    .map_err(|e| BridgeError::teardown("message listener", e))?;
                info!(queue = %self.queue_name, "Message listener closed");
                Ok(())
            }
        }
    }
}
