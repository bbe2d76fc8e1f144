use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::errors::{BridgeError, Result};
use crate::message::{DeliveryMode, Message};
use crate::transport::ProducerHandle;

pub const PROP_MESSAGE_NUMBER: &str = "MessageNumber";
pub const PROP_MESSAGE_TYPE: &str = "MessageType";
pub const PROP_QUEUE_NAME: &str = "QueueName";

const PROGRESS_EVERY: u32 = 10;

/// Result of [`Producer::send_batch`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchSummary {
    pub count: u32,
    pub elapsed: Duration,
    pub mean_latency: Duration,
}

impl BatchSummary {
    pub fn messages_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.count as f64 / secs
        } else {
            0.0
        }
    }
}

enum ProducerState {
    Created,
    Ready {
        queue: String,
        handle: Box<dyn ProducerHandle>,
    },
    Closed,
}

/// Sends persistent messages to one queue over the manager's session.
pub struct Producer {
    manager: Arc<ConnectionManager>,
    state: ProducerState,
    sent: AtomicU64,
}

impl Producer {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            state: ProducerState::Created,
            sent: AtomicU64::new(0),
        }
    }

    pub async fn initialize(&mut self, queue_name: &str) -> Result<()> {
        match self.state {
            ProducerState::Created => {}
            ProducerState::Ready { .. } => {
                return Err(BridgeError::IllegalState(
                    "Producer is already initialized.".to_string(),
                ))
            }
            ProducerState::Closed => {
                return Err(BridgeError::IllegalState("Producer has been closed.".to_string()))
            }
        }
        if !self.manager.is_connected() {
            return Err(BridgeError::IllegalState(
                "Connection manager is not connected.".to_string(),
            ));
        }

        let session = self.manager.session()?;
        let destination = session.create_queue(queue_name).await?;
        let handle = session
            .create_producer(&destination, DeliveryMode::Persistent)
            .await?;

        self.state = ProducerState::Ready {
            queue: queue_name.to_string(),
            handle,
        };
        info!(queue = %queue_name, "Producer initialized for queue");
        Ok(())
    }

    pub fn queue_name(&self) -> Option<&str> {
        match &self.state {
            ProducerState::Ready { queue, .. } => Some(queue),
            _ => None,
        }
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    /// Sends one message. Transport failures become [`BridgeError::SendError`]
    /// and are not retried.
    pub async fn send(&self, message: Message) -> Result<()> {
        let (queue, handle) = match &self.state {
            ProducerState::Ready { queue, handle } => (queue, handle),
            ProducerState::Created => {
                return Err(BridgeError::IllegalState(
                    "Producer not initialized. Call initialize() first.".to_string(),
                ))
            }
            ProducerState::Closed => {
                return Err(BridgeError::IllegalState("Producer has been closed.".to_string()))
            }
        };

        handle.send(message).await.map_err(|e| {
            BridgeError::SendError(format!("Failed to send message to {}: {}", queue, e))
        })?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Builds and sends the numbered demo text message.
    pub async fn send_numbered(&self, number: u32) -> Result<()> {
        let queue = self.queue_name().unwrap_or_default().to_string();
        let message = numbered_message(number, &queue)?;
        self.send(message).await?;
        debug!(queue = %queue, "Sent message #{}", number);
        Ok(())
    }

    /// Sends messages numbered `1..=count`. Stops at the first failure;
    /// messages already sent stay sent.
    pub async fn send_batch(&self, count: u32) -> Result<BatchSummary> {
        if i32::try_from(count).is_err() {
            return Err(BridgeError::Config(format!(
                "message count {} exceeds the largest {} ({})",
                count,
                PROP_MESSAGE_NUMBER,
                i32::MAX
            )));
        }
        info!("Sending {} messages...", count);
        let started = Instant::now();

        for number in 1..=count {
            if let Err(e) = self.send_numbered(number).await {
                warn!("Batch aborted at message #{}: {}", number, e);
                return Err(e);
            }
            if number % PROGRESS_EVERY == 0 {
                info!("Sent {}/{} messages", number, count);
                tokio::task::yield_now().await;
            }
        }

        let elapsed = started.elapsed();
        let mean_latency = if count > 0 {
            elapsed / count
        } else {
            Duration::ZERO
        };
        let summary = BatchSummary {
            count,
            elapsed,
            mean_latency,
        };
        info!(
            "Successfully sent {} messages in {} ms (average {:.2} ms per message, {:.2} messages/sec)",
            count,
            elapsed.as_millis(),
            mean_latency.as_secs_f64() * 1000.0,
            summary.messages_per_second()
        );
        Ok(summary)
    }

    /// Closes the underlying producer. Later calls are no-ops.
    pub async fn close(&mut self) -> Result<()> {
        let previous = std::mem::replace(&mut self.state, ProducerState::Closed);
        match previous {
            ProducerState::Ready { queue, handle } => {
                handle
                    .close()
                    .await
                    .map_err(|e| BridgeError::teardown("producer", e))?;
                info!(queue = %queue, "Producer closed");
                Ok(())
            }
            ProducerState::Created | ProducerState::Closed => Ok(()),
        }
    }
}

/// The demo message: `Message #<n> | Timestamp: <epoch-ms> | Status: Delivered`.
pub fn numbered_message(number: u32, queue: &str) -> Result<Message> {
    let message_number = i32::try_from(number).map_err(|_| {
        BridgeError::Config(format!(
            "message number {} does not fit in {}",
            number, PROP_MESSAGE_NUMBER
        ))
    })?;
    let body = format!(
        "Message #{} | Timestamp: {} | Status: Delivered",
        number,
        chrono::Utc::now().timestamp_millis()
    );
    Ok(Message::text(body)
        .with_property(PROP_MESSAGE_NUMBER, message_number)
        .with_property(PROP_MESSAGE_TYPE, "TEST")
        .with_property(PROP_QUEUE_NAME, queue)
        .with_delivery_mode(DeliveryMode::Persistent))
}
