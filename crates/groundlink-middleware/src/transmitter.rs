//! Republishing of wire envelopes on the local bus.

use std::sync::Arc;

use groundlink_types::{BridgeId, Envelope, LinkError};
use tracing::trace;

use crate::bus::LocalBus;
use crate::codec::CodecRegistry;

/// Decodes inbound envelopes and publishes them on the local bus stamped
/// with this bridge side's [`BridgeId`], so the side's own receivers skip
/// them.
pub struct Transmitter {
    bus: Arc<LocalBus>,
    codec: Arc<CodecRegistry>,
    origin: BridgeId,
}

impl Transmitter {
    pub fn new(bus: Arc<LocalBus>, codec: Arc<CodecRegistry>, origin: BridgeId) -> Self {
        Self { bus, codec, origin }
    }

    pub fn origin(&self) -> BridgeId {
        self.origin
    }

    /// Decode `envelope` and publish it.  Returns the number of local
    /// callbacks invoked.
    ///
    /// # Errors
    ///
    /// Decoding errors ([`LinkError::MalformedEnvelope`],
    /// [`LinkError::UnregisteredCodec`], [`LinkError::Encoding`]); nothing is
    /// published in that case.
    pub fn transmit(&self, envelope: &Envelope) -> Result<usize, LinkError> {
        let value = self.codec.decode(envelope)?;
        let delivered = self.bus.publish_from(envelope.topic_id, value, self.origin);
        trace!(topic = %envelope.topic_id, delivered, "envelope republished");
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Value, callback};
    use crate::receiver::{Receiver, ReceiverConfig};
    use chrono::Utc;
    use groundlink_types::{Payload, PayloadKind, TopicId};
    use std::sync::Mutex;

    const GEAR: TopicId = TopicId(4);

    fn recorder(bus: &LocalBus) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            Some(GEAR),
            callback(move |p| {
                sink.lock().unwrap().push(p.value.clone());
                Ok(())
            }),
        )
        .unwrap();
        seen
    }

    #[test]
    fn republishes_to_local_subscribers_but_not_own_receiver() {
        let bus = Arc::new(LocalBus::new());
        let codec = Arc::new(CodecRegistry::scalars_only());
        let side = BridgeId::new();

        let rx = Receiver::new(
            Arc::clone(&bus),
            Arc::clone(&codec),
            side,
            vec![GEAR],
            ReceiverConfig::default(),
        );
        let _scope = rx.activate().unwrap();
        let seen = recorder(&bus);

        let tx = Transmitter::new(Arc::clone(&bus), codec, side);
        let envelope = Envelope::new(GEAR, Utc::now(), Payload::StringValue("D".into()));
        assert_eq!(tx.transmit(&envelope).unwrap(), 2);

        assert_eq!(*seen.lock().unwrap(), vec![Value::from("D")]);
        assert!(rx.queue().is_empty(), "receiver must not capture its own echo");
    }

    #[test]
    fn malformed_envelope_publishes_nothing() {
        let bus = Arc::new(LocalBus::new());
        let seen = recorder(&bus);
        let tx = Transmitter::new(
            Arc::clone(&bus),
            Arc::new(CodecRegistry::scalars_only()),
            BridgeId::new(),
        );

        let empty = Envelope {
            topic_id: GEAR,
            timestamp: 0.0,
            payload: None,
        };
        assert!(matches!(
            tx.transmit(&empty),
            Err(LinkError::MalformedEnvelope { .. })
        ));

        let bytes = Envelope::new(GEAR, Utc::now(), Payload::BytesValue(vec![1, 2]));
        assert!(matches!(
            tx.transmit(&bytes),
            Err(LinkError::UnregisteredCodec {
                kind: PayloadKind::Bytes,
                ..
            })
        ));
        assert!(seen.lock().unwrap().is_empty());
    }
}
