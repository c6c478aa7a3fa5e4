//! [`BridgeServer`] – the serving side of a bridge.
//!
//! The server owns nothing per peer except what a call needs while it is
//! open:
//!
//! * `register` reads the server clock.
//! * every `listen` call gets its own [`Receiver`], activated for the
//!   lifetime of the returned stream and released when the stream is
//!   dropped (peer gone) or the server shuts down;
//! * all `dispatch` calls share one [`Transmitter`].
//!
//! Listen receivers and the shared transmitter carry the server's
//! [`BridgeId`], so a value dispatched by one client is republished locally
//! but not echoed to listening clients.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{BoxStream, Stream, StreamExt};
use groundlink_kernel::{CancellationToken, Clock};
use groundlink_types::{Ack, BridgeId, Envelope, LinkError, RegisterResponse, TopicId};
use tracing::{debug, error, info, warn};

use crate::bus::LocalBus;
use crate::codec::CodecRegistry;
use crate::receiver::{Receiver, ReceiverConfig, envelope_stream};
use crate::transmitter::Transmitter;

/// Tunables for a [`BridgeServer`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BridgeServerConfig {
    /// Queue sizing of each listen call's receiver.
    pub receiver: ReceiverConfig,
    /// Longest a listen stream waits on an empty queue before re-checking
    /// for shutdown.
    pub poll_interval: Duration,
}

impl Default for BridgeServerConfig {
    fn default() -> Self {
        Self {
            receiver: ReceiverConfig::default(),
            poll_interval: Duration::from_millis(250),
        }
    }
}

pub struct BridgeServer {
    bus: Arc<LocalBus>,
    codec: Arc<CodecRegistry>,
    id: BridgeId,
    transmitter: Transmitter,
    shutdown: CancellationToken,
    config: BridgeServerConfig,
}

impl BridgeServer {
    pub fn new(bus: Arc<LocalBus>, codec: Arc<CodecRegistry>) -> Self {
        Self::with_config(bus, codec, BridgeServerConfig::default())
    }

    pub fn with_config(bus: Arc<LocalBus>, codec: Arc<CodecRegistry>, config: BridgeServerConfig) -> Self {
        let id = BridgeId::new();
        Self {
            transmitter: Transmitter::new(Arc::clone(&bus), Arc::clone(&codec), id),
            bus,
            codec,
            id,
            shutdown: CancellationToken::new(),
            config,
        }
    }

    pub fn id(&self) -> BridgeId {
        self.id
    }

    pub fn bus(&self) -> &Arc<LocalBus> {
        &self.bus
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        self.bus.clock()
    }

    /// Handshake: the server's current time.
    pub fn register(&self) -> RegisterResponse {
        let now = self.clock().now();
        debug!(server = %self.id, %now, "register");
        RegisterResponse::at(now)
    }

    /// Open a listen call for `topics` (empty = every topic).
    ///
    /// Envelopes are captured from the moment this returns.  The stream ends
    /// on [`shutdown`](Self::shutdown); dropping it releases the receiver.
    pub fn listen(&self, topics: Vec<TopicId>) -> Result<BoxStream<'static, Envelope>, LinkError> {
        let receiver = Receiver::new(
            Arc::clone(&self.bus),
            Arc::clone(&self.codec),
            self.id,
            topics,
            self.config.receiver,
        );
        let scope = receiver.activate()?;
        info!(server = %self.id, topics = ?receiver.topics(), "listen call opened");

        Ok(envelope_stream(
            receiver,
            scope,
            self.shutdown.clone(),
            self.config.poll_interval,
        ))
    }

    /// Republish every envelope of `envelopes` on the local bus until the
    /// stream ends or the server shuts down.  Envelopes that fail to decode
    /// are logged and skipped.
    pub async fn dispatch<S>(&self, envelopes: S) -> Ack
    where
        S: Stream<Item = Envelope> + Send,
    {
        let mut envelopes = pin!(envelopes);
        let mut ack = Ack::default();
        info!(server = %self.id, "dispatch call opened");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                next = envelopes.next() => next,
            };
            let Some(envelope) = next else { break };

            match self.transmitter.transmit(&envelope) {
                Ok(_) => ack.accepted += 1,
                Err(e @ (LinkError::UnregisteredCodec { .. } | LinkError::MalformedEnvelope { .. })) => {
                    error!(topic = %envelope.topic_id, error = %e, "dropping dispatched envelope")
                }
                Err(e) => warn!(topic = %envelope.topic_id, error = %e, "dropping dispatched envelope"),
            }
        }

        info!(server = %self.id, accepted = ack.accepted, "dispatch call closed");
        ack
    }

    /// End every open listen and dispatch call.  Irreversible.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
