//! `groundlink-types` – shared vocabulary of the bridge.
//!
//! Everything that crosses a crate boundary or the wire lives here:
//! topic identifiers, the tagged [`Envelope`] wire format, the call frames
//! exchanged by the bridge transport, and the workspace-wide [`LinkError`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Logical channel identifier shared by every bridged process.
///
/// Applications usually keep an enum of their topics and convert it with
/// `From`; the wire only ever sees the integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(pub i32);

impl From<i32> for TopicId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "topic#{}", self.0)
    }
}

/// Identity of one side of a bridge.
///
/// Values republished from the wire are stamped with the id of the side
/// that received them, which is how a side recognises its own echoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BridgeId(Uuid);

impl BridgeId {
    /// Allocate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BridgeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire format
// ─────────────────────────────────────────────────────────────────────────────

/// A structured message packed with its type URL, in the spirit of
/// `google.protobuf.Any`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyMessage {
    pub type_url: String,
    pub value: serde_json::Value,
}

/// Exactly one populated payload variant of an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    IntegerValue(i64),
    FloatValue(#[serde(with = "wire_float")] f64),
    StringValue(String),
    BytesValue(Vec<u8>),
    MessageValue(AnyMessage),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::IntegerValue(_) => PayloadKind::Integer,
            Payload::FloatValue(_) => PayloadKind::Float,
            Payload::StringValue(_) => PayloadKind::String,
            Payload::BytesValue(_) => PayloadKind::Bytes,
            Payload::MessageValue(_) => PayloadKind::Message,
        }
    }
}

/// JSON has no literal for non-finite doubles; they travel as the strings
/// `"NaN"`, `"inf"` and `"-inf"`.
mod wire_float {
    use std::fmt;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_sign_positive() {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        deserializer.deserialize_any(FloatVisitor)
    }

    struct FloatVisitor;

    impl Visitor<'_> for FloatVisitor {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(r#"a number or one of "NaN", "inf", "-inf""#)
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
            match v {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
            }
        }
    }
}

/// Discriminant of [`Payload`], used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Integer,
    Float,
    String,
    Bytes,
    Message,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayloadKind::Integer => "integer",
            PayloadKind::Float => "float",
            PayloadKind::String => "string",
            PayloadKind::Bytes => "bytes",
            PayloadKind::Message => "message",
        };
        f.write_str(name)
    }
}

/// Tagged wire representation of one published value.
///
/// `payload` is optional only so that a frame missing it still parses and
/// can be rejected explicitly by the decoder; encoders always set it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic_id: TopicId,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    #[serde(default)]
    pub payload: Option<Payload>,
}

impl Envelope {
    pub fn new(topic_id: TopicId, at: DateTime<Utc>, payload: Payload) -> Self {
        Self {
            topic_id,
            timestamp: to_epoch_seconds(at),
            payload: Some(payload),
        }
    }

    /// The envelope timestamp as a calendar time, if it is representable.
    pub fn time(&self) -> Option<DateTime<Utc>> {
        from_epoch_seconds(self.timestamp)
    }
}

/// Convert a calendar time into fractional seconds since the epoch
/// (microsecond resolution).
pub fn to_epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

/// Inverse of [`to_epoch_seconds`]. Returns `None` for NaN, infinities and
/// out-of-range values.
pub fn from_epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    DateTime::from_timestamp_micros((seconds * 1_000_000.0).round() as i64)
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport call frames
// ─────────────────────────────────────────────────────────────────────────────

/// First frame of every bridge call; selects which of the three operations
/// the connection carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum CallRequest {
    Register,
    Listen { topic_ids: Vec<TopicId> },
    Dispatch,
}

/// Reply to `Register`: the server's current time, used by the client for
/// clock synchronisation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub timestamp: f64,
}

impl RegisterResponse {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            timestamp: to_epoch_seconds(now),
        }
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        from_epoch_seconds(self.timestamp)
    }
}

/// Completion of a `Dispatch` call; carries how many envelopes were
/// republished on the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub accepted: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Global error type spanning local misconfiguration, codec failures and
/// transport faults.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Callback already subscribed to {0}")]
    AlreadySubscribed(String),

    #[error("Callback not subscribed to {0}")]
    NotSubscribed(String),

    #[error("No {kind} codec registered for {topic}")]
    UnregisteredCodec { topic: TopicId, kind: PayloadKind },

    #[error("Malformed envelope on {topic}: {details}")]
    MalformedEnvelope { topic: TopicId, details: String },

    #[error("Encoding Error: {0}")]
    Encoding(String),

    #[error("Subscriber Fault: {0}")]
    Subscriber(String),

    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Configuration Error: {0}")]
    Config(String),
}
