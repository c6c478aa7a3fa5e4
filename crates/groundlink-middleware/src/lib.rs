//! `groundlink-middleware` – the distributed bus.
//!
//! Lets processes on different machines share one logical event bus: each
//! side publishes and subscribes on its own [`LocalBus`], and a bridge
//! carries the values in between.
//!
//! ```text
//! LocalBus::publish ─▶ Receiver ─▶ [wire] ─▶ Transmitter ─▶ peer LocalBus::publish_from
//! ```
//!
//! # Modules
//!
//! - [`bus`] – In-process topic-keyed publish/subscribe with per-subscriber
//!   rate limiting.
//! - [`codec`] – Conversion between bus [`Value`]s and wire [`Envelope`]s,
//!   driven by a [`CodecRegistry`] built once at startup.
//! - [`receiver`] – Captures local publications into a bounded outbound
//!   queue.
//! - [`transmitter`] – Republishes inbound envelopes locally without echoing
//!   them back.
//! - [`transport`] – The three bridge calls as a trait, plus an in-process
//!   implementation.
//! - [`server`] / [`client`] – The two ends of a bridge.
//! - [`ws`] – The bridge calls over WebSocket.
//!
//! [`Envelope`]: groundlink_types::Envelope

pub mod bus;
pub mod client;
pub mod codec;
pub mod receiver;
pub mod server;
pub mod transmitter;
pub mod transport;
pub mod ws;

pub use bus::{Callback, LocalBus, Publication, Value, callback};
pub use client::{BridgeClient, BridgeClientConfig};
pub use codec::{CodecRegistry, CodecRegistryBuilder, Serializable};
pub use receiver::{EnvelopeQueue, OverflowPolicy, Receiver, ReceiverConfig, ReceiverScope};
pub use server::{BridgeServer, BridgeServerConfig};
pub use transmitter::Transmitter;
pub use transport::{BridgeTransport, EnvelopeStream, InProcessTransport, OutboundStream};
pub use ws::{WsBridgeServer, WsTransport};
