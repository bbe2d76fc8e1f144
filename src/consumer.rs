// Pull-based consumption with a per-poll timeout.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::errors::{BridgeError, Result};
use crate::listener::Dispatcher;
use crate::message::Message;
use crate::producer::{PROP_MESSAGE_NUMBER, PROP_MESSAGE_TYPE, PROP_QUEUE_NAME};
use crate::transport::ConsumerHandle;

pub const UNKNOWN_NUMBER: i32 = -1;
pub const UNKNOWN: &str = "UNKNOWN";

const PROGRESS_EVERY: u64 = 10;

/// Fields extracted from a received text message. Missing properties fall
/// back to [`UNKNOWN_NUMBER`] and [`UNKNOWN`].
#[derive(Clone, Debug, PartialEq)]
pub struct TextRecord {
    pub sequence: u64,
    pub text: String,
    pub message_number: i32,
    pub message_type: String,
    pub queue_name: String,
    pub message_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReceiveSummary {
    /// Every message taken off the queue, whatever its kind or outcome.
    pub received: u64,
    /// Messages skipped because their properties could not be read.
    pub failed: u64,
    pub elapsed: Duration,
    pub records: Vec<TextRecord>,
    /// Transport failure that ended the poll early, after some messages had
    /// already been taken off the queue.
    pub interrupted: Option<String>,
}

impl ReceiveSummary {
    pub fn messages_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.received as f64 / secs
        } else {
            0.0
        }
    }
}

enum Mode {
    Idle,
    Polling,
    Async(Arc<Dispatcher>),
}

/// Reads text records from a message. `Ok(None)` for non-text bodies.
pub fn extract_text_record(message: &Message, sequence: u64) -> std::result::Result<Option<TextRecord>, String> {
    let Some(text) = message.text_body() else {
        return Ok(None);
    };
    let message_number = message
        .int_property(PROP_MESSAGE_NUMBER)?
        .unwrap_or(UNKNOWN_NUMBER);

    Ok(Some(TextRecord {
        sequence,
        text: text.to_string(),
        message_number,
        message_type: message
            .string_property(PROP_MESSAGE_TYPE)
            .unwrap_or_else(|| UNKNOWN.to_string()),
        queue_name: message
            .string_property(PROP_QUEUE_NAME)
            .unwrap_or_else(|| UNKNOWN.to_string()),
        message_id: message.headers.message_id.clone(),
        timestamp: message.headers.timestamp,
    }))
}

/// Synchronous receiver for one queue. A consumer either polls or runs in
/// async mode, never both.
pub struct SyncConsumer {
    manager: Arc<ConnectionManager>,
    queue_name: Option<String>,
    handle: Option<Box<dyn ConsumerHandle>>,
    mode: Mode,
    closed: bool,
}

impl SyncConsumer {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            queue_name: None,
            handle: None,
            mode: Mode::Idle,
            closed: false,
        }
    }

    pub async fn initialize(&mut self, queue_name: &str) -> Result<()> {
        if self.closed {
            return Err(BridgeError::IllegalState("Consumer has been closed.".to_string()));
        }
        if self.handle.is_some() {
            return Err(BridgeError::IllegalState(
                "Consumer is already initialized.".to_string(),
            ));
        }
        if !self.manager.is_connected() {
            return Err(BridgeError::IllegalState(
                "Connection manager is not connected.".to_string(),
            ));
        }

        let session = self.manager.session()?;
        let destination = session.create_queue(queue_name).await?;
        self.handle = Some(session.create_consumer(&destination).await?);
        self.queue_name = Some(queue_name.to_string());
        info!(queue = %queue_name, "Consumer initialized for queue");
        Ok(())
    }

    pub fn queue_name(&self) -> Option<&str> {
        self.queue_name.as_deref()
    }

    fn polling_handle(&mut self) -> Result<&dyn ConsumerHandle> {
        if self.closed {
            return Err(BridgeError::IllegalState("Consumer has been closed.".to_string()));
        }
        if let Mode::Async(_) = self.mode {
            return Err(BridgeError::IllegalState(
                "Consumer is in async mode; polling is not available.".to_string(),
            ));
        }
        match self.handle.as_deref() {
            Some(handle) => {
                self.mode = Mode::Polling;
                Ok(handle)
            }
            None => Err(BridgeError::IllegalState(
                "Consumer not initialized. Call initialize() first.".to_string(),
            )),
        }
    }

    /// Receives until one poll of `timeout` comes back empty.
    pub async fn drain_until_timeout(&mut self, timeout: Duration) -> Result<ReceiveSummary> {
        info!(
            "Receiving messages (timeout: {} ms)...",
            timeout.as_millis()
        );
        self.poll(None, timeout).await
    }

    /// Receives at most `count` messages, stopping early when a poll of
    /// `timeout` comes back empty. A short result means the queue drained.
    pub async fn receive_exactly(&mut self, count: u64, timeout: Duration) -> Result<ReceiveSummary> {
        info!("Receiving up to {} messages...", count);
        let summary = self.poll(Some(count), timeout).await?;
        if summary.received < count {
            info!(
                "Queue drained after {} of {} requested messages",
                summary.received, count
            );
        }
        Ok(summary)
    }

    async fn poll(&mut self, limit: Option<u64>, timeout: Duration) -> Result<ReceiveSummary> {
        let handle = self.polling_handle()?;
        let started = Instant::now();
        let mut summary = ReceiveSummary::default();

        while limit.map_or(true, |limit| summary.received < limit) {
            let message = match handle.receive(timeout).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!("No message within {} ms", timeout.as_millis());
                    break;
                }
                // Received messages are already acknowledged; hand them back.
                Err(e) if summary.received > 0 => {
                    warn!(
                        "Receive failed after {} messages, returning them: {}",
                        summary.received, e
                    );
                    summary.interrupted = Some(e.to_string());
                    break;
                }
                Err(e) => return Err(e),
            };
            summary.received += 1;
            let sequence = summary.received;

            match extract_text_record(&message, sequence) {
                Ok(Some(record)) => {
                    debug!(
                        sequence,
                        message_number = record.message_number,
                        message_type = %record.message_type,
                        message_id = record.message_id.as_deref().unwrap_or("N/A"),
                        "Received: {}",
                        record.text
                    );
                    summary.records.push(record);
                }
                Ok(None) => {
                    info!(sequence, "Received non-text message of type {}", message.kind());
                }
                Err(cause) => {
                    summary.failed += 1;
                    warn!("{}", BridgeError::ReceiveError { sequence, cause });
                }
            }

            if sequence % PROGRESS_EVERY == 0 {
                info!("Received {} messages so far...", sequence);
            }
        }

        summary.elapsed = started.elapsed();
        info!(
            "Received {} messages in {} ms ({:.2} messages/sec)",
            summary.received,
            summary.elapsed.as_millis(),
            summary.messages_per_second()
        );
        Ok(summary)
    }

    /// Hands the consumer to a [`Dispatcher`] and returns it at once; its
    /// counter tracks deliveries from then on.
    pub async fn receive_async(&mut self) -> Result<Arc<Dispatcher>> {
        if self.closed {
            return Err(BridgeError::IllegalState("Consumer has been closed.".to_string()));
        }
        match self.mode {
            Mode::Idle => {}
            Mode::Polling => {
                return Err(BridgeError::IllegalState(
                    "Consumer is in polling mode; async delivery is not available.".to_string(),
                ))
            }
            Mode::Async(_) => {
                return Err(BridgeError::IllegalState(
                    "Async delivery is already registered.".to_string(),
                ))
            }
        }
        let (Some(handle), Some(queue)) = (self.handle.as_deref(), self.queue_name.as_deref()) else {
            return Err(BridgeError::IllegalState(
                "Consumer not initialized. Call initialize() first.".to_string(),
            ));
        };

        let dispatcher = Arc::new(Dispatcher::new(queue));
        handle.set_handler(dispatcher.clone()).await?;
        self.mode = Mode::Async(dispatcher.clone());
        info!(queue = %queue, "Asynchronous delivery registered");
        Ok(dispatcher)
    }

    /// Later calls are no-ops.
    pub async fn close(&mut self) -> Result<()> {
        self.closed = true;
        if let Mode::Async(dispatcher) = &self.mode {
            info!("Consumer processed {} messages asynchronously", dispatcher.message_count());
        }
        if let Some(handle) = self.handle.take() {
            handle
                .close()
                .await
                .map_err(|e| BridgeError::teardown("consumer", e))?;
            info!("Consumer closed");
        }
        Ok(())
    }
}
