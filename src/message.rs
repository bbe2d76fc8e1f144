use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::Result;

/// Highest priority a broker accepts; larger values are clamped.
pub const MAX_PRIORITY: u8 = 9;
pub const DEFAULT_PRIORITY: u8 = 4;

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum DeliveryMode {
    #[default]
    Persistent,
    NonPersistent,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::Persistent => write!(f, "PERSISTENT"),
            DeliveryMode::NonPersistent => write!(f, "NON_PERSISTENT"),
        }
    }
}

/// A typed value carried in a message property or a map body entry.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
}

impl PropertyValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Int(_) => "int",
            PropertyValue::Long(_) => "long",
            PropertyValue::Double(_) => "double",
            PropertyValue::String(_) => "string",
        }
    }

    /// Reads the value as an int, converting longs in range and numeric strings.
    pub fn as_int(&self) -> std::result::Result<i32, String> {
        match self {
            PropertyValue::Int(v) => Ok(*v),
            PropertyValue::Long(v) => {
                i32::try_from(*v).map_err(|_| format!("value {} does not fit in an int", v))
            }
            PropertyValue::String(s) => s
                .trim()
                .parse::<i32>()
                .map_err(|e| format!("'{}' is not an int: {}", s, e)),
            other => Err(format!("cannot read {} property as int", other.type_name())),
        }
    }

    /// Reads the value as a string; every kind has a string form.
    pub fn as_string(&self) -> String {
        match self {
            PropertyValue::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Int(v) => write!(f, "{}", v),
            PropertyValue::Long(v) => write!(f, "{}", v),
            PropertyValue::Double(v) => write!(f, "{}", v),
            PropertyValue::String(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Long(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MessageBody {
    Text(String),
    Bytes(Vec<u8>),
    /// A serialized object: the producer's type name and its JSON encoding.
    Object { type_name: String, payload: Vec<u8> },
    Map(BTreeMap<String, PropertyValue>),
    /// A body kind the transport could not map onto the variants above.
    Other { kind: String, data: Vec<u8> },
}

impl MessageBody {
    pub fn kind(&self) -> &str {
        match self {
            MessageBody::Text(_) => "TextMessage",
            MessageBody::Bytes(_) => "BytesMessage",
            MessageBody::Object { .. } => "ObjectMessage",
            MessageBody::Map(_) => "MapMessage",
            MessageBody::Other { kind, .. } => kind,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MessageHeaders {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub priority: u8,
    pub delivery_mode: DeliveryMode,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Default for MessageHeaders {
    fn default() -> Self {
        Self {
            message_id: None,
            correlation_id: None,
            priority: DEFAULT_PRIORITY,
            delivery_mode: DeliveryMode::Persistent,
            timestamp: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub headers: MessageHeaders,
    pub body: MessageBody,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl Message {
    pub fn new(body: MessageBody) -> Self {
        Message {
            headers: MessageHeaders::default(),
            body,
            properties: BTreeMap::new(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MessageBody::Text(text.into()))
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageBody::Bytes(data.into()))
    }

    /// Builds an object message from any serializable value, recording its type name.
    pub fn object<T: Serialize>(value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(MessageBody::Object {
            type_name: std::any::type_name::<T>().to_string(),
            payload,
        }))
    }

    pub fn map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<PropertyValue>,
    {
        Self::new(MessageBody::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.headers.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.headers.priority = priority.min(MAX_PRIORITY);
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.headers.delivery_mode = mode;
        self
    }

    pub fn kind(&self) -> &str {
        self.body.kind()
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Reads an int property. `Ok(None)` when absent, `Err` when present but not an int.
    pub fn int_property(&self, name: &str) -> std::result::Result<Option<i32>, String> {
        match self.properties.get(name) {
            None => Ok(None),
            Some(value) => value
                .as_int()
                .map(Some)
                .map_err(|cause| format!("property '{}': {}", name, cause)),
        }
    }

    pub fn string_property(&self, name: &str) -> Option<String> {
        self.properties.get(name).map(PropertyValue::as_string)
    }

    pub fn text_body(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(text) => Some(text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Order {
        id: u32,
        item: String,
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(Message::text("hi").kind(), "TextMessage");
        assert_eq!(Message::bytes(vec![1, 2]).kind(), "BytesMessage");
        assert_eq!(Message::map([("a", 1)]).kind(), "MapMessage");
        let other = Message::new(MessageBody::Other {
            kind: "StreamMessage".to_string(),
            data: vec![],
        });
        assert_eq!(other.kind(), "StreamMessage");
    }

    #[test]
    fn test_object_message_records_type_name() {
        let msg = Message::object(&Order {
            id: 7,
            item: "widget".to_string(),
        })
        .unwrap();

        match msg.body {
            MessageBody::Object { type_name, payload } => {
                assert!(type_name.ends_with("Order"));
                let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
                assert_eq!(value["id"], 7);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_int_property_conversions() {
        let msg = Message::text("x")
            .with_property("n", 42)
            .with_property("long", 5_i64)
            .with_property("numeric", "17")
            .with_property("word", "seventeen");

        assert_eq!(msg.int_property("n").unwrap(), Some(42));
        assert_eq!(msg.int_property("long").unwrap(), Some(5));
        assert_eq!(msg.int_property("numeric").unwrap(), Some(17));
        assert_eq!(msg.int_property("missing").unwrap(), None);
        assert!(msg.int_property("word").is_err());
    }

    #[test]
    fn test_priority_is_clamped() {
        assert_eq!(Message::text("x").with_priority(200).headers.priority, MAX_PRIORITY);
        assert_eq!(Message::text("x").headers.priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn test_map_body_json_shape() {
        let msg = Message::map([("count", PropertyValue::Int(3)), ("name", "abc".into())]);
        if let MessageBody::Map(entries) = &msg.body {
            let json = serde_json::to_string(entries).unwrap();
            assert_eq!(json, r#"{"count":3,"name":"abc"}"#);
            let back: BTreeMap<String, PropertyValue> = serde_json::from_str(&json).unwrap();
            assert_eq!(&back, entries);
        } else {
            panic!("expected map body");
        }
    }
}
