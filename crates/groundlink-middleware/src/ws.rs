//! WebSocket carriage of the bridge calls.
//!
//! Every call is one WebSocket connection carrying JSON text frames.  The
//! first client frame is a [`CallRequest`]:
//!
//! | First frame | Then |
//! |---|---|
//! | `{"call":"register"}` | server answers one `RegisterResponse` frame and closes |
//! | `{"call":"listen","topic_ids":[1,2]}` | server streams `Envelope` frames until either side closes |
//! | `{"call":"dispatch"}` | client streams `Envelope` frames until it closes |
//!
//! Frames that do not parse are logged and skipped; they never end a call.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use groundlink_kernel::CancellationToken;
use groundlink_types::{Ack, CallRequest, Envelope, LinkError, RegisterResponse, TopicId};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};
use tracing::{debug, error, info, warn};

use crate::server::BridgeServer;
use crate::transport::{BridgeTransport, EnvelopeStream, OutboundStream};

// ---------------------------------------------------------------------------
// Frame helpers
// ---------------------------------------------------------------------------

async fn send_json<S, T>(sink: &mut S, value: &T) -> Result<(), LinkError>
where
    S: Sink<Message, Error = WsError> + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(value).map_err(|e| LinkError::Encoding(e.to_string()))?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| LinkError::Transport(e.to_string()))
}

/// Next text frame, skipping control and binary frames.  `None` once the
/// peer closes.
async fn next_text<S>(source: &mut S) -> Result<Option<String>, LinkError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = source.next().await {
        match frame.map_err(|e| LinkError::Transport(e.to_string()))? {
            Message::Text(text) => return Ok(Some(text.as_str().to_owned())),
            Message::Close(_) => return Ok(None),
            _ => continue,
        }
    }
    Ok(None)
}

fn parse_envelope(text: &str) -> Option<Envelope> {
    match serde_json::from_str(text) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            warn!(error = %e, "skipping unparsable envelope frame");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Serves a [`BridgeServer`] over WebSocket.
pub struct WsBridgeServer {
    server: Arc<BridgeServer>,
    listener: TcpListener,
}

impl WsBridgeServer {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// [`LinkError::Transport`] if `addr` cannot be bound.
    pub async fn bind(server: Arc<BridgeServer>, addr: SocketAddr) -> Result<Self, LinkError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LinkError::Transport(format!("ws bind error on {addr}: {e}")))?;
        Ok(Self { server, listener })
    }

    /// Address actually bound (useful with port `0`).
    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        self.listener
            .local_addr()
            .map_err(|e| LinkError::Transport(e.to_string()))
    }

    /// Accept calls until `shutdown` fires, then shut the bridge server down,
    /// which ends every open call.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), LinkError> {
        info!(addr = %self.local_addr()?, "bridge server listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self.server);
                        tokio::spawn(async move {
                            if let Err(e) = handle_call(server, stream, peer).await {
                                warn!(peer = %peer, error = %e, "bridge call ended with an error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "ws accept error"),
                },
            }
        }
        self.server.shutdown();
        info!("bridge server stopped");
        Ok(())
    }
}

type ServerSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type ServerSource = SplitStream<WebSocketStream<TcpStream>>;

async fn handle_call(server: Arc<BridgeServer>, stream: TcpStream, peer: SocketAddr) -> Result<(), LinkError> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| LinkError::Transport(format!("ws handshake from {peer}: {e}")))?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let Some(first) = next_text(&mut ws_rx).await? else {
        return Ok(());
    };
    let request: CallRequest = serde_json::from_str(&first)
        .map_err(|e| LinkError::Transport(format!("bad call frame from {peer}: {e}")))?;
    debug!(peer = %peer, ?request, "bridge call");

    match request {
        CallRequest::Register => {
            send_json(&mut ws_tx, &server.register()).await?;
            let _ = ws_tx.close().await;
            Ok(())
        }
        CallRequest::Listen { topic_ids } => serve_listen(&server, topic_ids, ws_tx, ws_rx).await,
        CallRequest::Dispatch => serve_dispatch(&server, ws_tx, ws_rx, peer).await,
    }
}

async fn serve_listen(
    server: &BridgeServer,
    topics: Vec<TopicId>,
    mut ws_tx: ServerSink,
    mut ws_rx: ServerSource,
) -> Result<(), LinkError> {
    let mut envelopes = server.listen(topics)?;
    loop {
        tokio::select! {
            next = envelopes.next() => match next {
                Some(envelope) => {
                    if send_json(&mut ws_tx, &envelope).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = ws_tx.close().await;
                    break;
                }
            },
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
        }
    }
    Ok(())
}

async fn serve_dispatch(
    server: &BridgeServer,
    mut ws_tx: ServerSink,
    ws_rx: ServerSource,
    peer: SocketAddr,
) -> Result<(), LinkError> {
    let envelopes = ws_rx
        .take_while(|frame| std::future::ready(matches!(frame, Ok(m) if !m.is_close())))
        .filter_map(|frame| async move {
            match frame {
                Ok(Message::Text(text)) => parse_envelope(text.as_str()),
                _ => None,
            }
        });
    let ack = server.dispatch(envelopes).await;
    debug!(peer = %peer, accepted = ack.accepted, "dispatch call finished");
    let _ = ws_tx.close().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`BridgeTransport`] speaking to a [`WsBridgeServer`].
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    connect_timeout: Duration,
}

impl WsTransport {
    /// `url` is the server endpoint, e.g. `ws://127.0.0.1:9870`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn open(
        &self,
        request: &CallRequest,
    ) -> Result<(SplitSink<ClientStream, Message>, SplitStream<ClientStream>), LinkError> {
        let connecting = connect_async(self.url.as_str());
        let (ws, _) = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| LinkError::Transport(format!("connecting to {} timed out", self.url)))?
            .map_err(|e| LinkError::Transport(format!("connecting to {}: {e}", self.url)))?;
        let (mut tx, rx) = ws.split();
        send_json(&mut tx, request).await?;
        Ok((tx, rx))
    }
}

#[async_trait]
impl BridgeTransport for WsTransport {
    async fn register(&self) -> Result<RegisterResponse, LinkError> {
        let (mut tx, mut rx) = self.open(&CallRequest::Register).await?;
        let text = next_text(&mut rx)
            .await?
            .ok_or_else(|| LinkError::Transport("server closed before answering register".to_string()))?;
        let _ = tx.close().await;
        serde_json::from_str(&text).map_err(|e| LinkError::Transport(format!("bad register response: {e}")))
    }

    async fn listen(&self, topics: Vec<TopicId>) -> Result<EnvelopeStream, LinkError> {
        let (_tx, rx) = self
            .open(&CallRequest::Listen { topic_ids: topics })
            .await?;
        let inbound = rx
            .take_while(|frame| std::future::ready(!matches!(frame, Ok(Message::Close(_)))))
            .filter_map(|frame| async move {
                match frame {
                    Ok(Message::Text(text)) => parse_envelope(text.as_str()).map(Ok),
                    Ok(_) => None,
                    Err(e) => Some(Err(LinkError::Transport(e.to_string()))),
                }
            });
        Ok(inbound.boxed())
    }

    /// Returns the number of envelopes sent once `envelopes` ends.
    async fn dispatch(&self, mut envelopes: OutboundStream) -> Result<Ack, LinkError> {
        let (mut tx, mut rx) = self.open(&CallRequest::Dispatch).await?;
        let mut ack = Ack::default();
        loop {
            tokio::select! {
                next = envelopes.next() => match next {
                    Some(envelope) => {
                        send_json(&mut tx, &envelope).await?;
                        ack.accepted += 1;
                    }
                    None => {
                        let _ = tx.close().await;
                        return Ok(ack);
                    }
                },
                frame = rx.next() => match frame {
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(LinkError::Transport("server closed the dispatch call".to_string()));
                    }
                    Some(Err(e)) => return Err(LinkError::Transport(e.to_string())),
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}
