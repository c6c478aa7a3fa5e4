//! `groundlink-kernel` – Time & Lifecycle
//!
//! The small runtime every bridge actor is built on.  It knows nothing about
//! topics or envelopes.
//!
//! # Modules
//!
//! - [`clock`] – [`Clock`][clock::Clock]: injectable time source with
//!   abort-aware waits.  [`SystemClock`][clock::SystemClock] for production,
//!   [`ManualClock`][clock::ManualClock] for deterministic tests and
//!   [`ReplayClock`][clock::ReplayClock] for accelerated replays.
//! - [`worker`] – [`Worker`][worker::Worker]: managed background task with
//!   start/stop lifecycle, optional fixed interval, cooperative cancellation
//!   and per-iteration fault isolation.

pub mod clock;
pub mod worker;

pub use clock::{Clock, ManualClock, ReplayClock, SystemClock};
pub use worker::{Flow, Job, Worker, WorkerContext, WorkerState};

/// Re-exported so jobs and callers can name the abort signal type without a
/// direct `tokio-util` dependency.
pub use tokio_util::sync::CancellationToken;
