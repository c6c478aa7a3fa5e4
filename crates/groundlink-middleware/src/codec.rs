//! Wire codec: [`Value`] ⇄ [`Envelope`].
//!
//! Scalars map straight onto their payload variant.  Objects need a codec
//! registered for their topic in a [`CodecRegistry`]:
//!
//! | Value | Payload | Registration |
//! |---|---|---|
//! | `Integer` | `integer_value` | – |
//! | `Float` | `float_value` | – |
//! | `Text` | `string_value` | – |
//! | `Bytes` | `bytes_value` | [`CodecRegistryBuilder::serializer`] |
//! | `Message` | `message_value` | [`CodecRegistryBuilder::message`] |
//!
//! The registry is built once at startup and shared read-only
//! (`Arc<CodecRegistry>`) by every receiver and transmitter.  Using a topic
//! with an object payload before registering it is a configuration bug and
//! is reported as [`LinkError::UnregisteredCodec`] on first use.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use groundlink_types::{AnyMessage, Envelope, LinkError, Payload, PayloadKind, TopicId};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::bus::Value;

/// Prefix of every message type URL produced by this crate.
pub const TYPE_URL_PREFIX: &str = "type.groundlink/";

type Object = Arc<dyn Any + Send + Sync>;

/// An object that knows its own binary form.
pub trait Serializable: Sized + Send + Sync + 'static {
    fn serialize(&self) -> Vec<u8>;

    fn deserialize(bytes: &[u8]) -> Result<Self, LinkError>;
}

// ---------------------------------------------------------------------------
// Type-erased per-topic codecs
// ---------------------------------------------------------------------------

trait ByteCodec: Send + Sync {
    fn serialize(&self, object: &(dyn Any + Send + Sync)) -> Option<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Object, LinkError>;
}

struct SerializableCodec<T>(PhantomData<fn() -> T>);

impl<T: Serializable> ByteCodec for SerializableCodec<T> {
    fn serialize(&self, object: &(dyn Any + Send + Sync)) -> Option<Vec<u8>> {
        object.downcast_ref::<T>().map(T::serialize)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Object, LinkError> {
        Ok(Arc::new(T::deserialize(bytes)?))
    }
}

trait MessageCodec: Send + Sync {
    fn pack(&self, object: &(dyn Any + Send + Sync)) -> Option<Result<AnyMessage, LinkError>>;
    fn unpack(&self, message: &AnyMessage) -> Result<Object, LinkError>;
    fn type_url(&self) -> &str;
}

struct JsonMessageCodec<T> {
    type_url: String,
    _message: PhantomData<fn() -> T>,
}

impl<T> MessageCodec for JsonMessageCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn pack(&self, object: &(dyn Any + Send + Sync)) -> Option<Result<AnyMessage, LinkError>> {
        let message = object.downcast_ref::<T>()?;
        Some(
            serde_json::to_value(message)
                .map(|value| AnyMessage {
                    type_url: self.type_url.clone(),
                    value,
                })
                .map_err(|e| LinkError::Encoding(e.to_string())),
        )
    }

    fn unpack(&self, message: &AnyMessage) -> Result<Object, LinkError> {
        let decoded: T = serde_json::from_value(message.value.clone())
            .map_err(|e| LinkError::Encoding(e.to_string()))?;
        Ok(Arc::new(decoded))
    }

    fn type_url(&self) -> &str {
        &self.type_url
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Builder for a [`CodecRegistry`].  Registering a topic twice keeps the
/// last registration.
#[derive(Default)]
pub struct CodecRegistryBuilder {
    serializers: HashMap<TopicId, Arc<dyn ByteCodec>>,
    messages: HashMap<TopicId, Arc<dyn MessageCodec>>,
}

impl CodecRegistryBuilder {
    /// Carry `Value::Bytes` objects of type `T` on `topic`.
    pub fn serializer<T: Serializable>(mut self, topic: TopicId) -> Self {
        self.serializers
            .insert(topic, Arc::new(SerializableCodec::<T>(PhantomData)));
        self
    }

    /// Carry `Value::Message` objects of type `T` on `topic`, packed under
    /// the type URL `type.groundlink/<name>`.
    pub fn message<T>(mut self, topic: TopicId, name: &str) -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.messages.insert(
            topic,
            Arc::new(JsonMessageCodec::<T> {
                type_url: format!("{TYPE_URL_PREFIX}{name}"),
                _message: PhantomData,
            }),
        );
        self
    }

    pub fn build(self) -> CodecRegistry {
        CodecRegistry {
            serializers: self.serializers,
            messages: self.messages,
        }
    }
}

/// Frozen per-topic codec tables.
#[derive(Default)]
pub struct CodecRegistry {
    serializers: HashMap<TopicId, Arc<dyn ByteCodec>>,
    messages: HashMap<TopicId, Arc<dyn MessageCodec>>,
}

impl CodecRegistry {
    pub fn builder() -> CodecRegistryBuilder {
        CodecRegistryBuilder::default()
    }

    /// A registry with no object codecs: only scalar payloads can cross.
    pub fn scalars_only() -> Self {
        Self::default()
    }

    /// Encode `value`, published on `topic` at `at`, into an envelope.
    ///
    /// # Errors
    ///
    /// * [`LinkError::UnregisteredCodec`] – object value on a topic without a
    ///   matching registration.
    /// * [`LinkError::Encoding`] – the object is not of the registered type,
    ///   or the message failed to serialise.
    pub fn encode(&self, topic: TopicId, value: &Value, at: DateTime<Utc>) -> Result<Envelope, LinkError> {
        let payload = match value {
            Value::Integer(v) => Payload::IntegerValue(*v),
            Value::Float(v) => Payload::FloatValue(*v),
            Value::Text(v) => Payload::StringValue(v.clone()),
            Value::Bytes(object) => {
                let codec = self.serializers.get(&topic).ok_or(LinkError::UnregisteredCodec {
                    topic,
                    kind: PayloadKind::Bytes,
                })?;
                let bytes = codec.serialize(object.as_ref()).ok_or_else(|| {
                    LinkError::Encoding(format!("object on {topic} is not of the registered serializer type"))
                })?;
                Payload::BytesValue(bytes)
            }
            Value::Message(object) => {
                let codec = self.messages.get(&topic).ok_or(LinkError::UnregisteredCodec {
                    topic,
                    kind: PayloadKind::Message,
                })?;
                let packed = codec.pack(object.as_ref()).ok_or_else(|| {
                    LinkError::Encoding(format!("message on {topic} is not of the registered type"))
                })??;
                Payload::MessageValue(packed)
            }
        };
        Ok(Envelope::new(topic, at, payload))
    }

    /// Decode the value carried by `envelope`.
    ///
    /// # Errors
    ///
    /// * [`LinkError::MalformedEnvelope`] – no payload, or a message whose
    ///   type URL does not match the registration.
    /// * [`LinkError::UnregisteredCodec`] – object payload on a topic without
    ///   a matching registration.
    /// * [`LinkError::Encoding`] – the object bytes could not be decoded.
    pub fn decode(&self, envelope: &Envelope) -> Result<Value, LinkError> {
        let topic = envelope.topic_id;
        let payload = envelope.payload.as_ref().ok_or_else(|| LinkError::MalformedEnvelope {
            topic,
            details: "no payload variant set".to_string(),
        })?;

        let value = match payload {
            Payload::IntegerValue(v) => Value::Integer(*v),
            Payload::FloatValue(v) => Value::Float(*v),
            Payload::StringValue(v) => Value::Text(v.clone()),
            Payload::BytesValue(bytes) => {
                let codec = self.serializers.get(&topic).ok_or(LinkError::UnregisteredCodec {
                    topic,
                    kind: PayloadKind::Bytes,
                })?;
                Value::Bytes(codec.deserialize(bytes)?)
            }
            Payload::MessageValue(message) => {
                let codec = self.messages.get(&topic).ok_or(LinkError::UnregisteredCodec {
                    topic,
                    kind: PayloadKind::Message,
                })?;
                if message.type_url != codec.type_url() {
                    return Err(LinkError::MalformedEnvelope {
                        topic,
                        details: format!(
                            "expected message type {}, got {}",
                            codec.type_url(),
                            message.type_url
                        ),
                    });
                }
                Value::Message(codec.unpack(message)?)
            }
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    const ALTITUDE: TopicId = TopicId(1);
    const POSITION: TopicId = TopicId(2);
    const WAYPOINT: TopicId = TopicId(3);

    #[derive(Debug, PartialEq)]
    struct Position {
        lat: f64,
        lon: f64,
    }

    impl Serializable for Position {
        fn serialize(&self) -> Vec<u8> {
            let mut out = self.lat.to_be_bytes().to_vec();
            out.extend_from_slice(&self.lon.to_be_bytes());
            out
        }

        fn deserialize(bytes: &[u8]) -> Result<Self, LinkError> {
            let (lat, lon) = bytes
                .split_first_chunk::<8>()
                .and_then(|(lat, rest)| rest.first_chunk::<8>().map(|lon| (lat, lon)))
                .ok_or_else(|| LinkError::Encoding(format!("position needs 16 bytes, got {}", bytes.len())))?;
            Ok(Position {
                lat: f64::from_be_bytes(*lat),
                lon: f64::from_be_bytes(*lon),
            })
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Waypoint {
        name: String,
        altitude_m: f32,
    }

    fn registry() -> CodecRegistry {
        CodecRegistry::builder()
            .serializer::<Position>(POSITION)
            .message::<Waypoint>(WAYPOINT, "nav.Waypoint")
            .build()
    }

    fn at() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn round_trip(registry: &CodecRegistry, topic: TopicId, value: Value) -> Value {
        let envelope = registry.encode(topic, &value, at()).unwrap();
        assert_eq!(envelope.topic_id, topic);
        assert_eq!(envelope.time(), Some(at()));
        registry.decode(&envelope).unwrap()
    }

    #[test]
    fn scalars_round_trip_without_registration() {
        let registry = CodecRegistry::scalars_only();
        assert_eq!(round_trip(&registry, ALTITUDE, Value::from(-42)), Value::Integer(-42));
        assert_eq!(round_trip(&registry, ALTITUDE, Value::from(1234.5)), Value::Float(1234.5));
        assert_eq!(round_trip(&registry, ALTITUDE, Value::from("climb")), Value::from("climb"));
    }

    #[test]
    fn serializable_object_round_trips() {
        let registry = registry();
        let sent = Position { lat: 52.52, lon: 13.405 };
        let envelope = registry
            .encode(POSITION, &Value::bytes(Position { lat: 52.52, lon: 13.405 }), at())
            .unwrap();
        assert!(matches!(envelope.payload, Some(Payload::BytesValue(ref b)) if b.len() == 16));

        let back = registry.decode(&envelope).unwrap();
        assert!(matches!(back, Value::Bytes(_)));
        assert_eq!(back.downcast_ref::<Position>(), Some(&sent));
    }

    #[test]
    fn message_round_trips_with_type_url() {
        let registry = registry();
        let value = Value::message(Waypoint {
            name: "home".to_string(),
            altitude_m: 120.0,
        });
        let envelope = registry.encode(WAYPOINT, &value, at()).unwrap();
        match &envelope.payload {
            Some(Payload::MessageValue(m)) => {
                assert_eq!(m.type_url, "type.groundlink/nav.Waypoint");
                assert_eq!(m.value["name"], "home");
            }
            other => panic!("expected message payload, got {other:?}"),
        }

        let back = registry.decode(&envelope).unwrap();
        assert_eq!(
            back.downcast_ref::<Waypoint>(),
            Some(&Waypoint {
                name: "home".to_string(),
                altitude_m: 120.0
            })
        );
    }

    #[test]
    fn unregistered_topics_fail_on_both_sides() {
        let registry = registry();
        let err = registry
            .encode(ALTITUDE, &Value::bytes(Position { lat: 0.0, lon: 0.0 }), at())
            .unwrap_err();
        assert!(matches!(
            err,
            LinkError::UnregisteredCodec { topic: ALTITUDE, kind: PayloadKind::Bytes }
        ));

        let err = registry
            .encode(POSITION, &Value::message(Waypoint { name: String::new(), altitude_m: 0.0 }), at())
            .unwrap_err();
        assert!(matches!(err, LinkError::UnregisteredCodec { kind: PayloadKind::Message, .. }));

        let incoming = Envelope::new(ALTITUDE, at(), Payload::BytesValue(vec![0; 16]));
        assert!(matches!(
            registry.decode(&incoming),
            Err(LinkError::UnregisteredCodec { kind: PayloadKind::Bytes, .. })
        ));
    }

    #[test]
    fn envelope_without_payload_is_malformed() {
        let envelope = Envelope {
            topic_id: ALTITUDE,
            timestamp: 0.0,
            payload: None,
        };
        assert!(matches!(
            registry().decode(&envelope),
            Err(LinkError::MalformedEnvelope { .. })
        ));
    }

    #[test]
    fn mismatched_type_url_is_malformed() {
        let envelope = Envelope::new(
            WAYPOINT,
            at(),
            Payload::MessageValue(AnyMessage {
                type_url: "type.groundlink/nav.Route".to_string(),
                value: serde_json::json!({"name": "x", "altitude_m": 1.0}),
            }),
        );
        assert!(matches!(
            registry().decode(&envelope),
            Err(LinkError::MalformedEnvelope { .. })
        ));
    }

    #[test]
    fn wrong_object_type_is_an_encoding_error() {
        let err = registry()
            .encode(POSITION, &Value::bytes("not a position".to_string()), at())
            .unwrap_err();
        assert!(matches!(err, LinkError::Encoding(_)));
    }

    #[test]
    fn corrupt_bytes_surface_the_serializer_error() {
        let envelope = Envelope::new(POSITION, at(), Payload::BytesValue(vec![1, 2, 3]));
        let err = registry().decode(&envelope).unwrap_err();
        assert!(err.to_string().contains("16 bytes"));
    }
}
