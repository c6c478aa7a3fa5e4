//! Client-side view of the three bridge calls.
//!
//! | Call | Direction | Result |
//! |---|---|---|
//! | `register` | handshake | server time |
//! | `listen(topics)` | server → client | stream of envelopes |
//! | `dispatch(stream)` | client → server | [`Ack`] when the stream ends |
//!
//! [`InProcessTransport`] calls a [`BridgeServer`] directly;
//! [`WsTransport`](crate::ws::WsTransport) carries the calls over WebSocket.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use groundlink_types::{Ack, Envelope, LinkError, RegisterResponse, TopicId};

use crate::server::BridgeServer;

/// Inbound side of a `listen` call.  An `Err` item is a transport fault; the
/// stream ending means the server closed the call.
pub type EnvelopeStream = BoxStream<'static, Result<Envelope, LinkError>>;

/// Outbound side of a `dispatch` call.
pub type OutboundStream = BoxStream<'static, Envelope>;

#[async_trait]
pub trait BridgeTransport: Send + Sync {
    async fn register(&self) -> Result<RegisterResponse, LinkError>;

    async fn listen(&self, topics: Vec<TopicId>) -> Result<EnvelopeStream, LinkError>;

    /// Push `envelopes` to the server until the stream ends.
    async fn dispatch(&self, envelopes: OutboundStream) -> Result<Ack, LinkError>;
}

/// Transport that calls a server living in the same process.
#[derive(Clone)]
pub struct InProcessTransport {
    server: Arc<BridgeServer>,
}

impl InProcessTransport {
    pub fn new(server: Arc<BridgeServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl BridgeTransport for InProcessTransport {
    async fn register(&self) -> Result<RegisterResponse, LinkError> {
        Ok(self.server.register())
    }

    async fn listen(&self, topics: Vec<TopicId>) -> Result<EnvelopeStream, LinkError> {
        let stream = self.server.listen(topics)?;
        Ok(stream.map(Ok).boxed())
    }

    async fn dispatch(&self, envelopes: OutboundStream) -> Result<Ack, LinkError> {
        Ok(self.server.dispatch(envelopes).await)
    }
}
