//! [`BridgeClient`] – the connecting side of a bridge.
//!
//! After the `register` handshake (which re-aligns the local bus clock to the
//! server), the client runs two independent [`Worker`]s:
//!
//! | Worker | Job | Call |
//! |---|---|---|
//! | `bridge-dispatcher` | [`Dispatcher`] | drains a local [`Receiver`] into `dispatch` |
//! | `bridge-listener` | [`Listener`] | feeds `listen` into a local [`Transmitter`] |
//!
//! A transport fault in either call is logged, followed by an abort-aware
//! wait of [`BridgeClientConfig::retry_delay`], then the call is reopened.
//! Neither worker ever looks at the other's state, so one failing link
//! never interrupts the other.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use groundlink_kernel::{Flow, Job, Worker, WorkerContext, WorkerState};
use groundlink_types::{BridgeId, LinkError, TopicId};
use tracing::{debug, error, info, warn};

use crate::bus::LocalBus;
use crate::codec::CodecRegistry;
use crate::receiver::{Receiver, ReceiverConfig, ReceiverScope, envelope_stream};
use crate::transmitter::Transmitter;
use crate::transport::BridgeTransport;

/// Default wait between a transport fault and reopening the call.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeClientConfig {
    /// Topics pulled from the server (empty = every topic).
    pub inbound_topics: Vec<TopicId>,
    /// Topics pushed to the server (empty = every topic).
    pub outbound_topics: Vec<TopicId>,
    /// Wait after a transport fault; zero retries immediately.
    pub retry_delay: Duration,
    /// Outbound queue sizing.
    pub receiver: ReceiverConfig,
    /// Longest the dispatcher waits on an empty queue before re-checking
    /// for abort.
    pub poll_interval: Duration,
}

impl Default for BridgeClientConfig {
    fn default() -> Self {
        Self {
            inbound_topics: Vec::new(),
            outbound_topics: Vec::new(),
            retry_delay: DEFAULT_RETRY_DELAY,
            receiver: ReceiverConfig::default(),
            poll_interval: Duration::from_millis(250),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Pushes locally captured envelopes to the server.
pub struct Dispatcher {
    transport: Arc<dyn BridgeTransport>,
    receiver: Receiver,
    scope: Option<ReceiverScope>,
    retry_delay: Duration,
    poll_interval: Duration,
    reopening: bool,
}

#[async_trait]
impl Job for Dispatcher {
    async fn on_start(&mut self, _ctx: &WorkerContext) -> Result<(), LinkError> {
        self.scope = Some(self.receiver.activate()?);
        self.reopening = false;
        Ok(())
    }

    async fn on_run(&mut self, ctx: &WorkerContext) -> Result<Flow, LinkError> {
        if self.reopening {
            let stale = self.receiver.reset();
            if stale > 0 {
                debug!(worker = ctx.name(), stale, "discarded outbound backlog");
            }
        }

        let outbound = envelope_stream(
            self.receiver.clone(),
            (),
            ctx.abort_signal().clone(),
            self.poll_interval,
        );
        let abort = ctx.abort_signal();
        let result = tokio::select! {
            biased;
            _ = abort.cancelled() => return Ok(Flow::Continue),
            result = self.transport.dispatch(outbound) => result,
        };
        if ctx.is_aborted() {
            return Ok(Flow::Continue);
        }

        match result {
            Ok(ack) => warn!(worker = ctx.name(), accepted = ack.accepted, "dispatch call closed by server"),
            Err(e) => warn!(worker = ctx.name(), error = %e, "dispatch call failed"),
        }
        self.reopening = true;
        ctx.sleep(self.retry_delay).await;
        Ok(Flow::Continue)
    }

    async fn on_stop(&mut self, _ctx: &WorkerContext) {
        self.scope = None;
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Republishes envelopes pulled from the server on the local bus.
pub struct Listener {
    transport: Arc<dyn BridgeTransport>,
    transmitter: Transmitter,
    topics: Vec<TopicId>,
    retry_delay: Duration,
}

#[async_trait]
impl Job for Listener {
    async fn on_run(&mut self, ctx: &WorkerContext) -> Result<Flow, LinkError> {
        let abort = ctx.abort_signal();
        let opened = tokio::select! {
            biased;
            _ = abort.cancelled() => return Ok(Flow::Continue),
            opened = self.transport.listen(self.topics.clone()) => opened,
        };

        match opened {
            Ok(mut inbound) => {
                debug!(worker = ctx.name(), topics = ?self.topics, "listen call opened");
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = abort.cancelled() => return Ok(Flow::Continue),
                        next = inbound.next() => next,
                    };
                    match next {
                        Some(Ok(envelope)) => {
                            if let Err(e) = self.transmitter.transmit(&envelope) {
                                error!(worker = ctx.name(), topic = %envelope.topic_id, error = %e, "dropping inbound envelope");
                            }
                        }
                        Some(Err(e)) => {
                            warn!(worker = ctx.name(), error = %e, "listen call failed");
                            break;
                        }
                        None => {
                            warn!(worker = ctx.name(), "listen call closed by server");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(worker = ctx.name(), error = %e, "listen call could not be opened"),
        }

        ctx.sleep(self.retry_delay).await;
        Ok(Flow::Continue)
    }
}

// ---------------------------------------------------------------------------
// BridgeClient
// ---------------------------------------------------------------------------

pub struct BridgeClient {
    id: BridgeId,
    dispatcher: Worker<Dispatcher>,
    listener: Worker<Listener>,
}

impl BridgeClient {
    /// Handshake with the server, re-align the bus clock, then start the
    /// dispatcher and the listener.
    ///
    /// # Errors
    ///
    /// [`LinkError::Transport`] when the handshake fails; no worker is
    /// started in that case.
    pub async fn connect(
        transport: Arc<dyn BridgeTransport>,
        bus: Arc<LocalBus>,
        codec: Arc<CodecRegistry>,
        config: BridgeClientConfig,
    ) -> Result<Self, LinkError> {
        let clock = Arc::clone(bus.clock());
        let handshake = transport.register().await?;
        let server_time = handshake.time().ok_or_else(|| {
            LinkError::Transport(format!("server sent an invalid timestamp {}", handshake.timestamp))
        })?;
        clock.adjust(server_time);

        let id = BridgeId::new();
        info!(client = %id, %server_time, "registered with bridge server");

        let dispatcher = Dispatcher {
            transport: Arc::clone(&transport),
            receiver: Receiver::new(
                Arc::clone(&bus),
                Arc::clone(&codec),
                id,
                config.outbound_topics,
                config.receiver,
            ),
            scope: None,
            retry_delay: config.retry_delay,
            poll_interval: config.poll_interval,
            reopening: false,
        };
        let listener = Listener {
            transport,
            transmitter: Transmitter::new(bus, codec, id),
            topics: config.inbound_topics,
            retry_delay: config.retry_delay,
        };

        let mut dispatcher = Worker::new("bridge-dispatcher", dispatcher).with_clock(Arc::clone(&clock));
        let mut listener = Worker::new("bridge-listener", listener).with_clock(clock);
        dispatcher.start();
        listener.start();

        Ok(Self {
            id,
            dispatcher,
            listener,
        })
    }

    pub fn id(&self) -> BridgeId {
        self.id
    }

    pub fn dispatcher_state(&self) -> WorkerState {
        self.dispatcher.state()
    }

    pub fn listener_state(&self) -> WorkerState {
        self.listener.state()
    }

    /// Stop the dispatcher, then the listener, waiting for each.
    pub async fn stop(&mut self) {
        self.dispatcher.stop().await;
        self.listener.stop().await;
        info!(client = %self.id, "bridge client stopped");
    }
}
