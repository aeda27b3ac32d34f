use std::time::SystemTime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use crate::types::{split_service, ServiceAddress};

/// The closed set of payload kinds carried by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Availability,
    Subscription,
}

impl MessageKind {
    pub const ALL: [MessageKind; 2] = [MessageKind::Availability, MessageKind::Subscription];

    /// Wire tag for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Availability => "availability",
            MessageKind::Subscription => "subscription",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }

    /// Payload fields that must be present for this kind
    fn required_fields(&self, payload: &Map<String, Value>) -> Vec<&'static str> {
        match self {
            MessageKind::Availability => {
                let mut fields = vec!["services", "address", "available"];
                // a TTL only matters for claims of availability
                if payload.get("available").and_then(Value::as_bool) == Some(true) {
                    fields.push("ttl");
                }
                fields
            }
            MessageKind::Subscription => vec!["services", "responseDestination", "subscribe"],
        }
    }
}

/// Services are now (un)available at an address.
///
/// Service identifiers may carry a port suffix, `name:port` or
/// `name:low-high`. `ttl` is how long an availability claim stays valid
/// without a refresh; it is ignored when `available` is false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityMessage {
    pub services: Vec<String>,
    pub address: String,
    pub available: bool,
    #[serde(default)]
    pub ttl: u32,
}

impl AvailabilityMessage {
    pub fn available(services: Vec<String>, address: impl Into<String>, ttl: u32) -> Self {
        Self {
            services,
            address: address.into(),
            available: true,
            ttl,
        }
    }

    pub fn unavailable(services: Vec<String>, address: impl Into<String>) -> Self {
        Self {
            services,
            address: address.into(),
            available: false,
            ttl: 0,
        }
    }

    /// Each listed service as a bare name plus the endpoint serving it
    pub fn endpoints(&self) -> impl Iterator<Item = (&str, ServiceAddress)> + '_ {
        self.services.iter().map(move |service| {
            let (name, port) = split_service(service);
            (name, ServiceAddress::new(self.address.clone(), port))
        })
    }
}

/// Registers (or drops) interest in services. Updates are delivered to
/// `response_destination`. Service names never carry ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionMessage {
    pub services: Vec<String>,
    pub response_destination: String,
    pub subscribe: bool,
}

impl SubscriptionMessage {
    pub fn subscribe(services: Vec<String>, response_destination: impl Into<String>) -> Self {
        Self {
            services,
            response_destination: response_destination.into(),
            subscribe: true,
        }
    }

    pub fn unsubscribe(services: Vec<String>, response_destination: impl Into<String>) -> Self {
        Self {
            services,
            response_destination: response_destination.into(),
            subscribe: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Availability(AvailabilityMessage),
    Subscription(SubscriptionMessage),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Availability(_) => MessageKind::Availability,
            Message::Subscription(_) => MessageKind::Subscription,
        }
    }
}

impl From<AvailabilityMessage> for Message {
    fn from(msg: AvailabilityMessage) -> Self {
        Message::Availability(msg)
    }
}

impl From<SubscriptionMessage> for Message {
    fn from(msg: SubscriptionMessage) -> Self {
        Message::Subscription(msg)
    }
}

/// Anything that names a point in time. Conversions drop sub-second precision.
pub trait IntoTimestamp {
    fn into_timestamp(self) -> DateTime<Utc>;
}

impl IntoTimestamp for DateTime<Utc> {
    fn into_timestamp(self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.timestamp(), 0).unwrap_or(self)
    }
}

impl IntoTimestamp for SystemTime {
    fn into_timestamp(self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self).into_timestamp()
    }
}

/// Seconds since the epoch
impl IntoTimestamp for i64 {
    fn into_timestamp(self) -> DateTime<Utc> {
        DateTime::from_timestamp(self, 0).unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message kind '{0}'")]
    UnknownKind(String),

    #[error("{kind} message is missing required field '{field}'")]
    MissingField { kind: String, field: &'static str },

    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Wire form: `{"kind": ..., "timestamp": <secs>, "payload": {...}}`
#[derive(Serialize)]
struct WireEnvelope<'a, P: Serialize> {
    kind: &'static str,
    timestamp: i64,
    payload: &'a P,
}

/// A typed, timestamped message as it travels through a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    timestamp: DateTime<Utc>,
    message: Message,
}

impl Envelope {
    /// Wrap a message, stamped with the current time
    pub fn new(message: impl Into<Message>) -> Self {
        Self {
            timestamp: Utc::now().into_timestamp(),
            message: message.into(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: impl IntoTimestamp) -> Self {
        self.set_timestamp(timestamp);
        self
    }

    pub fn set_timestamp(&mut self, timestamp: impl IntoTimestamp) {
        self.timestamp = timestamp.into_timestamp();
    }

    /// Emission time, whole seconds
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let timestamp = self.timestamp.timestamp();
        match &self.message {
            Message::Availability(payload) => serde_json::to_vec(&WireEnvelope {
                kind: MessageKind::Availability.as_str(),
                timestamp,
                payload,
            }),
            Message::Subscription(payload) => serde_json::to_vec(&WireEnvelope {
                kind: MessageKind::Subscription.as_str(),
                timestamp,
                payload,
            }),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let missing = |field| DecodeError::MissingField {
            kind: "envelope".to_string(),
            field,
        };

        let tag = value.get("kind").and_then(Value::as_str).ok_or_else(|| missing("kind"))?;
        let kind = MessageKind::from_tag(tag).ok_or_else(|| DecodeError::UnknownKind(tag.to_string()))?;
        let timestamp = value
            .get("timestamp")
            .and_then(Value::as_i64)
            .ok_or_else(|| missing("timestamp"))?;
        let payload = value
            .get("payload")
            .and_then(Value::as_object)
            .ok_or_else(|| missing("payload"))?;

        if let Some(field) = kind
            .required_fields(payload)
            .into_iter()
            .find(|field| !payload.contains_key(*field))
        {
            return Err(DecodeError::MissingField {
                kind: kind.as_str().to_string(),
                field,
            });
        }

        let invalid = |source| DecodeError::InvalidPayload {
            kind: kind.as_str().to_string(),
            source,
        };
        let payload = Value::Object(payload.clone());
        let message = match kind {
            MessageKind::Availability => {
                Message::Availability(serde_json::from_value(payload).map_err(invalid)?)
            }
            MessageKind::Subscription => {
                Message::Subscription(serde_json::from_value(payload).map_err(invalid)?)
            }
        };

        Ok(Self {
            timestamp: timestamp.into_timestamp(),
            message,
        })
    }
}
