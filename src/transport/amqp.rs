// src/transport/amqp.rs
// AMQP 0-9-1 transport on top of lapin.
//
// Mapping: the queue manager name is the virtual host, the channel name is the
// client connection name, a session is one lapin channel, and destinations are
// durable queues reached through the default exchange.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_lite::StreamExt;
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection as LapinConnection, ConnectionProperties,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    Connection, ConsumerHandle, Destination, MessageHandler, ProducerHandle, Session, Transport,
};
use crate::config::ConnectionConfig;
use crate::errors::{BridgeError, Result};
use crate::message::{DeliveryMode, Message, MessageBody, MessageHeaders, PropertyValue};

pub const CONTENT_TEXT: &str = "text/plain";
pub const CONTENT_BYTES: &str = "application/octet-stream";
pub const CONTENT_OBJECT: &str = "application/x-object+json";
pub const CONTENT_MAP: &str = "application/x-map+json";

// Upper bound on the gap between two basic.get polls inside receive().
const POLL_INTERVAL: Duration = Duration::from_millis(50);

const AMQP_NON_PERSISTENT: u8 = 1;
const AMQP_PERSISTENT: u8 = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connects to an AMQP broker such as RabbitMQ.
#[derive(Clone, Debug, Default)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
        info!(
            "Attempting to connect to AMQP broker at {}:{} (vhost '{}')",
            config.host, config.port, config.queue_manager
        );
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(config.channel.clone()));
        let connection = LapinConnection::connect(&config.amqp_uri(), properties).await?;
        info!("Successfully connected to AMQP broker");

        Ok(Arc::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: LapinConnection,
}

#[async_trait]
impl Connection for AmqpConnection {
    // AMQP connections deliver as soon as a consumer exists; nothing to start.
    async fn start(&self) -> Result<()> {
        if !self.is_open() {
            return Err(BridgeError::Transport("connection is not open".to_string()));
        }
        Ok(())
    }

    async fn create_session(&self) -> Result<Arc<dyn Session>> {
        let channel = self.connection.create_channel().await?;
        debug!(channel_id = channel.id(), "Created AMQP channel");
        Ok(Arc::new(AmqpSession { channel }))
    }

    async fn close(&self) -> Result<()> {
        if self.is_open() {
            info!("Closing AMQP connection gracefully");
            self.connection.close(200, "Closing connection").await?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }
}

struct AmqpSession {
    channel: Channel,
}

#[async_trait]
impl Session for AmqpSession {
    async fn create_queue(&self, name: &str) -> Result<Destination> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!(
            "Queue '{}' declared with {} messages waiting",
            name,
            queue.message_count()
        );
        Ok(Destination::new(name))
    }

    async fn create_producer(
        &self,
        destination: &Destination,
        delivery_mode: DeliveryMode,
    ) -> Result<Box<dyn ProducerHandle>> {
        Ok(Box::new(AmqpProducer {
            channel: self.channel.clone(),
            queue: destination.name().to_string(),
            delivery_mode,
        }))
    }

    async fn create_consumer(&self, destination: &Destination) -> Result<Box<dyn ConsumerHandle>> {
        Ok(Box::new(AmqpConsumer {
            channel: self.channel.clone(),
            queue: destination.name().to_string(),
            consumer_tag: Mutex::new(None),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.is_open() {
            self.channel.close(200, "Closing session").await?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

struct AmqpProducer {
    channel: Channel,
    queue: String,
    delivery_mode: DeliveryMode,
}

#[async_trait]
impl ProducerHandle for AmqpProducer {
    async fn send(&self, mut message: Message) -> Result<()> {
        message.headers.delivery_mode = self.delivery_mode;
        let (payload, properties) = encode(message)?;

        self.channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    // Producers share the session channel, so there is nothing to release here.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct AmqpConsumer {
    channel: Channel,
    queue: String,
    consumer_tag: Mutex<Option<String>>,
}

#[async_trait]
impl ConsumerHandle for AmqpConsumer {
    async fn receive(&self, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            let fetched = self
                .channel
                .basic_get(
                    &self.queue,
                    BasicGetOptions {
                        no_ack: true,
                        ..BasicGetOptions::default()
                    },
                )
                .await?;
            if let Some(got) = fetched {
                return Ok(Some(decode(&got.delivery.data, &got.delivery.properties)));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn set_handler(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if lock(&self.consumer_tag).is_some() {
            return Err(BridgeError::Transport(
                "a message handler is already registered".to_string(),
            ));
        }

        let tag = format!("mq-bridge-{}", Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        *lock(&self.consumer_tag) = Some(tag.clone());
        info!(queue = %self.queue, consumer_tag = %tag, "Started consuming");

        let queue = self.queue.clone();
        tokio::spawn(async move {
            while let Some(delivery_result) = consumer.next().await {
                match delivery_result {
                    Ok(delivery) => {
                        handler.on_message(decode(&delivery.data, &delivery.properties));
                    }
                    Err(e) => {
                        error!("Error receiving message from '{}': {}", queue, e);
                        break;
                    }
                }
            }
            debug!("Consumer stream for '{}' ended", queue);
        });

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let tag = lock(&self.consumer_tag).take();
        if let Some(tag) = tag {
            if self.channel.status().connected() {
                self.channel
                    .basic_cancel(&tag, BasicCancelOptions::default())
                    .await?;
            } else {
                warn!(consumer_tag = %tag, "Channel already closed, consumer not cancelled");
            }
        }
        Ok(())
    }
}

fn property_to_amqp(value: &PropertyValue) -> AMQPValue {
    match value {
        PropertyValue::Bool(v) => AMQPValue::Boolean(*v),
        PropertyValue::Int(v) => AMQPValue::LongInt(*v),
        PropertyValue::Long(v) => AMQPValue::LongLongInt(*v),
        PropertyValue::Double(v) => AMQPValue::Double(*v),
        PropertyValue::String(v) => AMQPValue::LongString(LongString::from(v.as_str())),
    }
}

fn property_from_amqp(value: &AMQPValue) -> Option<PropertyValue> {
    Some(match value {
        AMQPValue::Boolean(v) => PropertyValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => PropertyValue::Int(i32::from(*v)),
        AMQPValue::ShortShortUInt(v) => PropertyValue::Int(i32::from(*v)),
        AMQPValue::ShortInt(v) => PropertyValue::Int(i32::from(*v)),
        AMQPValue::ShortUInt(v) => PropertyValue::Int(i32::from(*v)),
        AMQPValue::LongInt(v) => PropertyValue::Int(*v),
        AMQPValue::LongUInt(v) => PropertyValue::Long(i64::from(*v)),
        AMQPValue::LongLongInt(v) => PropertyValue::Long(*v),
        AMQPValue::Float(v) => PropertyValue::Double(f64::from(*v)),
        AMQPValue::Double(v) => PropertyValue::Double(*v),
        AMQPValue::ShortString(v) => PropertyValue::String(v.as_str().to_string()),
        AMQPValue::LongString(v) => {
            PropertyValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
        }
        AMQPValue::Timestamp(v) => PropertyValue::Long(*v as i64),
        _ => return None,
    })
}

/// One map body entry on the wire. The tag keeps `Int` and `Long` apart, and
/// doubles travel as text so NaN and the infinities survive JSON.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
enum MapEntry {
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(String),
    String(String),
}

impl From<&PropertyValue> for MapEntry {
    fn from(value: &PropertyValue) -> Self {
        match value {
            PropertyValue::Bool(v) => MapEntry::Bool(*v),
            PropertyValue::Int(v) => MapEntry::Int(*v),
            PropertyValue::Long(v) => MapEntry::Long(*v),
            PropertyValue::Double(v) => MapEntry::Double(v.to_string()),
            PropertyValue::String(v) => MapEntry::String(v.clone()),
        }
    }
}

fn decode_map(data: &[u8]) -> std::result::Result<BTreeMap<String, PropertyValue>, String> {
    let tagged: BTreeMap<String, MapEntry> =
        serde_json::from_slice(data).map_err(|e| e.to_string())?;
    tagged
        .into_iter()
        .map(|(name, entry)| {
            let value = match entry {
                MapEntry::Bool(v) => PropertyValue::Bool(v),
                MapEntry::Int(v) => PropertyValue::Int(v),
                MapEntry::Long(v) => PropertyValue::Long(v),
                MapEntry::Double(text) => PropertyValue::Double(
                    text.parse()
                        .map_err(|_| format!("entry {} is not a double: {}", name, text))?,
                ),
                MapEntry::String(v) => PropertyValue::String(v),
            };
            Ok((name, value))
        })
        .collect()
}

/// Turns a message into an AMQP payload and property set.
pub fn encode(message: Message) -> Result<(Vec<u8>, BasicProperties)> {
    let Message {
        headers,
        body,
        properties,
    } = message;

    let mut table = FieldTable::default();
    for (name, value) in &properties {
        table.insert(ShortString::from(name.as_str()), property_to_amqp(value));
    }

    let message_id = headers
        .message_id
        .unwrap_or_else(|| format!("ID:{}", Uuid::new_v4().simple()));
    let timestamp = headers.timestamp.unwrap_or_else(Utc::now);
    let delivery_mode = match headers.delivery_mode {
        DeliveryMode::Persistent => AMQP_PERSISTENT,
        DeliveryMode::NonPersistent => AMQP_NON_PERSISTENT,
    };

    let mut props = BasicProperties::default()
        .with_message_id(ShortString::from(message_id))
        .with_priority(headers.priority)
        .with_delivery_mode(delivery_mode)
        .with_timestamp(timestamp.timestamp().max(0) as u64)
        .with_headers(table);
    if let Some(correlation_id) = headers.correlation_id {
        props = props.with_correlation_id(ShortString::from(correlation_id));
    }

    let payload = match body {
        MessageBody::Text(text) => {
            props = props.with_content_type(ShortString::from(CONTENT_TEXT));
            text.into_bytes()
        }
        MessageBody::Bytes(data) => {
            props = props.with_content_type(ShortString::from(CONTENT_BYTES));
            data
        }
        MessageBody::Object { type_name, payload } => {
            props = props
                .with_content_type(ShortString::from(CONTENT_OBJECT))
                .with_type(ShortString::from(type_name));
            payload
        }
        MessageBody::Map(entries) => {
            props = props.with_content_type(ShortString::from(CONTENT_MAP));
            let tagged: BTreeMap<&str, MapEntry> = entries
                .iter()
                .map(|(name, value)| (name.as_str(), MapEntry::from(value)))
                .collect();
            serde_json::to_vec(&tagged)?
        }
        MessageBody::Other { kind, data } => {
            props = props.with_content_type(ShortString::from(kind));
            data
        }
    };

    Ok((payload, props))
}

/// Rebuilds a message from an AMQP delivery. Never fails: bodies that cannot
/// be interpreted come back as `MessageBody::Other`.
pub fn decode(data: &[u8], props: &BasicProperties) -> Message {
    let content_type = props.content_type().as_ref().map(|c| c.as_str().to_string());

    let body = match content_type.as_deref() {
        Some(CONTENT_TEXT) => MessageBody::Text(String::from_utf8_lossy(data).into_owned()),
        Some(CONTENT_BYTES) | None => MessageBody::Bytes(data.to_vec()),
        Some(CONTENT_OBJECT) => MessageBody::Object {
            type_name: props
                .kind()
                .as_ref()
                .map(|k| k.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            payload: data.to_vec(),
        },
        Some(CONTENT_MAP) => match decode_map(data) {
            Ok(entries) => MessageBody::Map(entries),
            Err(e) => {
                warn!("Map body is not a JSON object of typed scalars: {}", e);
                MessageBody::Other {
                    kind: CONTENT_MAP.to_string(),
                    data: data.to_vec(),
                }
            }
        },
        Some(other) => MessageBody::Other {
            kind: other.to_string(),
            data: data.to_vec(),
        },
    };

    let properties = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(k, v)| property_from_amqp(v).map(|v| (k.as_str().to_string(), v)))
                .collect()
        })
        .unwrap_or_default();

    let headers = MessageHeaders {
        message_id: props.message_id().as_ref().map(|id| id.as_str().to_string()),
        correlation_id: props
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        priority: props.priority().unwrap_or(crate::message::DEFAULT_PRIORITY),
        delivery_mode: match props.delivery_mode() {
            Some(AMQP_PERSISTENT) => DeliveryMode::Persistent,
            _ => DeliveryMode::NonPersistent,
        },
        timestamp: props
            .timestamp()
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single()),
    };

    Message {
        headers,
        body,
        properties,
    }
}
