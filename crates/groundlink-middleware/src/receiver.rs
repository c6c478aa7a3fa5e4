//! Capture of local publications destined for the wire.
//!
//! A [`Receiver`] subscribes one callback to the [`LocalBus`] (per filtered
//! topic, or as a wildcard when the filter is empty), encodes every matching
//! publication and buffers the resulting [`Envelope`] in a bounded
//! [`EnvelopeQueue`].  Whoever pushes envelopes onto the wire drains it.
//!
//! # Delivery contract
//!
//! Delivery is best effort.  Pushing never blocks the publisher; when the
//! queue is full the [`OverflowPolicy`] decides what is lost:
//!
//! * [`OverflowPolicy::DropNewest`] (default) – the incoming envelope is
//!   discarded, the backlog is kept.
//! * [`OverflowPolicy::DropOldest`] – the oldest queued envelope is evicted
//!   to make room for the incoming one.
//!
//! Within one receiver envelopes stay in publication order.
//!
//! # Echo suppression
//!
//! Publications stamped with the receiver's own [`BridgeId`] (see
//! [`LocalBus::publish_from`]) are ignored: they came from the wire through
//! this side's [`Transmitter`](crate::transmitter::Transmitter) and must not
//! be sent back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use groundlink_kernel::CancellationToken;
use groundlink_types::{BridgeId, Envelope, LinkError, TopicId};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{trace, warn};

use crate::bus::{Callback, LocalBus, callback};
use crate::codec::CodecRegistry;

/// Default number of envelopes a receiver buffers.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// What to lose when a receiver queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the incoming envelope.
    #[default]
    DropNewest,
    /// Evict the oldest queued envelope, then enqueue the incoming one.
    DropOldest,
}

/// Queue sizing for a [`Receiver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverConfig {
    pub capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// EnvelopeQueue
// ---------------------------------------------------------------------------

/// Bounded FIFO with non-blocking push and async pop.
#[derive(Debug)]
pub struct EnvelopeQueue {
    items: Mutex<VecDeque<Envelope>>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
    ready: Notify,
}

impl EnvelopeQueue {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_QUEUE_CAPACITY))),
            capacity,
            policy,
            dropped: AtomicU64::new(0),
            ready: Notify::new(),
        }
    }

    /// Enqueue without blocking.  Returns `false` when `envelope` itself was
    /// discarded because the queue was full.
    pub fn push(&self, envelope: Envelope) -> bool {
        let accepted = {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            if items.len() < self.capacity {
                items.push_back(envelope);
                true
            } else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                match self.policy {
                    OverflowPolicy::DropNewest => false,
                    OverflowPolicy::DropOldest => {
                        items.pop_front();
                        items.push_back(envelope);
                        true
                    }
                }
            }
        };
        if accepted {
            self.ready.notify_one();
        }
        accepted
    }

    pub fn try_pop(&self) -> Option<Envelope> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Wait up to `timeout` for the next envelope.
    pub async fn pop(&self, timeout: Duration) -> Option<Envelope> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let ready = self.ready.notified();
            if let Some(envelope) = self.try_pop() {
                return Some(envelope);
            }
            if tokio::time::timeout_at(deadline, ready).await.is_err() {
                return self.try_pop();
            }
        }
    }

    /// Discard everything queued.  Returns how many envelopes were dropped.
    pub fn reset(&self) -> usize {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let discarded = items.len();
        items.clear();
        discarded
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Envelopes lost to overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

struct Inner {
    bus: Arc<LocalBus>,
    topics: Vec<TopicId>,
    queue: Arc<EnvelopeQueue>,
    callback: Callback,
}

/// Buffers local publications as outbound envelopes.  Cheap to clone; clones
/// share the queue and the subscription callback.
#[derive(Clone)]
pub struct Receiver {
    inner: Arc<Inner>,
}

impl Receiver {
    /// Create an inactive receiver for `topics` (empty = every topic).
    /// Publications stamped with `origin` are ignored.
    pub fn new(
        bus: Arc<LocalBus>,
        codec: Arc<CodecRegistry>,
        origin: BridgeId,
        topics: impl IntoIterator<Item = TopicId>,
        config: ReceiverConfig,
    ) -> Self {
        let mut topics: Vec<TopicId> = topics.into_iter().collect();
        topics.sort();
        topics.dedup();

        let queue = Arc::new(EnvelopeQueue::new(config.capacity, config.overflow_policy));
        let sink = Arc::clone(&queue);
        let callback = callback(move |p| {
            if p.origin == Some(origin) {
                trace!(topic = %p.topic, "echo suppressed");
                return Ok(());
            }
            let envelope = codec.encode(p.topic, p.value, p.timestamp)?;
            if !sink.push(envelope) {
                trace!(topic = %p.topic, "receiver queue full; envelope dropped");
            }
            Ok(())
        });

        Self {
            inner: Arc::new(Inner {
                bus,
                topics,
                queue,
                callback,
            }),
        }
    }

    /// Subscribe to the bus.  The subscription lasts as long as the returned
    /// scope; dropping it (on any path) unsubscribes.
    ///
    /// # Errors
    ///
    /// [`LinkError::AlreadySubscribed`] if this receiver is already active.
    pub fn activate(&self) -> Result<ReceiverScope, LinkError> {
        let mut scope = ReceiverScope {
            bus: Arc::clone(&self.inner.bus),
            callback: Arc::clone(&self.inner.callback),
            filters: Vec::new(),
        };
        let filters: Vec<Option<TopicId>> = if self.inner.topics.is_empty() {
            vec![None]
        } else {
            self.inner.topics.iter().copied().map(Some).collect()
        };
        for filter in filters {
            // On failure `scope` drops here and rolls back what was added.
            self.inner.bus.subscribe(filter, Arc::clone(&self.inner.callback))?;
            scope.filters.push(filter);
        }
        Ok(scope)
    }

    /// Wait up to `timeout` for the next queued envelope.
    pub async fn drain(&self, timeout: Duration) -> Option<Envelope> {
        self.inner.queue.pop(timeout).await
    }

    pub fn try_drain(&self) -> Option<Envelope> {
        self.inner.queue.try_pop()
    }

    /// Discard every queued envelope.
    pub fn reset(&self) -> usize {
        self.inner.queue.reset()
    }

    pub fn queue(&self) -> &EnvelopeQueue {
        &self.inner.queue
    }

    /// Topic filter, sorted; empty means every topic.
    pub fn topics(&self) -> &[TopicId] {
        &self.inner.topics
    }
}

/// Stream of everything `receiver` captures, ending when `stop` fires.
///
/// `guard` is held for as long as the stream lives (typically the
/// [`ReceiverScope`]).  An empty queue is re-checked every `poll`.
pub(crate) fn envelope_stream<G>(
    receiver: Receiver,
    guard: G,
    stop: CancellationToken,
    poll: Duration,
) -> BoxStream<'static, Envelope>
where
    G: Send + 'static,
{
    stream::unfold((receiver, guard, stop), move |(receiver, guard, stop)| async move {
        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                next = receiver.drain(poll) => Some(next),
            };
            match next {
                None => return None,
                Some(Some(envelope)) => return Some((envelope, (receiver, guard, stop))),
                Some(None) => continue,
            }
        }
    })
    .boxed()
}

/// Active subscription of a [`Receiver`].
#[must_use = "the receiver unsubscribes as soon as the scope is dropped"]
pub struct ReceiverScope {
    bus: Arc<LocalBus>,
    callback: Callback,
    filters: Vec<Option<TopicId>>,
}

impl Drop for ReceiverScope {
    fn drop(&mut self) {
        for filter in self.filters.drain(..) {
            if let Err(e) = self.bus.unsubscribe(filter, &self.callback) {
                warn!(error = %e, "receiver deactivation failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use groundlink_types::Payload;

    const SPEED: TopicId = TopicId(1);
    const HEADING: TopicId = TopicId(2);

    fn receiver(bus: &Arc<LocalBus>, topics: Vec<TopicId>, config: ReceiverConfig) -> Receiver {
        Receiver::new(
            Arc::clone(bus),
            Arc::new(CodecRegistry::scalars_only()),
            BridgeId::new(),
            topics,
            config,
        )
    }

    fn drained_integers(rx: &Receiver) -> Vec<i64> {
        std::iter::from_fn(|| rx.try_drain())
            .filter_map(|e| match e.payload {
                Some(Payload::IntegerValue(v)) => Some(v),
                _ => None,
            })
            .collect()
    }

    fn envelope(v: i64) -> Envelope {
        Envelope::new(SPEED, Utc::now(), Payload::IntegerValue(v))
    }

    #[test]
    fn captures_only_filtered_topics_in_order() {
        let bus = Arc::new(LocalBus::new());
        let rx = receiver(&bus, vec![SPEED], ReceiverConfig::default());
        let _scope = rx.activate().unwrap();

        bus.publish(SPEED, 1);
        bus.publish(HEADING, 90);
        bus.publish(SPEED, 2);

        assert_eq!(drained_integers(&rx), vec![1, 2]);
    }

    #[test]
    fn empty_filter_captures_everything() {
        let bus = Arc::new(LocalBus::new());
        let rx = receiver(&bus, vec![], ReceiverConfig::default());
        let _scope = rx.activate().unwrap();

        bus.publish(SPEED, 1);
        bus.publish(HEADING, 90);

        assert_eq!(rx.queue().len(), 2);
        assert_eq!(bus.subscription_count(), 1);
    }

    #[test]
    fn inactive_receiver_captures_nothing() {
        let bus = Arc::new(LocalBus::new());
        let rx = receiver(&bus, vec![SPEED], ReceiverConfig::default());
        bus.publish(SPEED, 1);
        assert!(rx.queue().is_empty());
    }

    #[test]
    fn dropping_the_scope_unsubscribes() {
        let bus = Arc::new(LocalBus::new());
        let rx = receiver(&bus, vec![SPEED, HEADING], ReceiverConfig::default());
        {
            let _scope = rx.activate().unwrap();
            assert_eq!(bus.subscription_count(), 2);
        }
        assert_eq!(bus.subscription_count(), 0);
        bus.publish(SPEED, 1);
        assert!(rx.queue().is_empty());
    }

    #[test]
    fn scope_is_released_on_early_return() {
        fn capture_then_fail(rx: &Receiver) -> Result<(), LinkError> {
            let _scope = rx.activate()?;
            Err(LinkError::Transport("link lost".to_string()))
        }

        let bus = Arc::new(LocalBus::new());
        let rx = receiver(&bus, vec![SPEED], ReceiverConfig::default());
        assert!(capture_then_fail(&rx).is_err());
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn double_activation_is_rejected_without_leaking() {
        let bus = Arc::new(LocalBus::new());
        let rx = receiver(&bus, vec![SPEED], ReceiverConfig::default());
        let _scope = rx.activate().unwrap();
        assert!(matches!(rx.activate(), Err(LinkError::AlreadySubscribed(_))));
        assert_eq!(bus.subscription_count(), 1);
    }

    #[test]
    fn own_origin_is_ignored() {
        let bus = Arc::new(LocalBus::new());
        let side = BridgeId::new();
        let rx = Receiver::new(
            Arc::clone(&bus),
            Arc::new(CodecRegistry::scalars_only()),
            side,
            vec![SPEED],
            ReceiverConfig::default(),
        );
        let _scope = rx.activate().unwrap();

        bus.publish_from(SPEED, 1, side);
        bus.publish_from(SPEED, 2, BridgeId::new());
        bus.publish(SPEED, 3);

        assert_eq!(drained_integers(&rx), vec![2, 3]);
    }

    #[test]
    fn full_queue_drops_the_newest_by_default() {
        let bus = Arc::new(LocalBus::new());
        let config = ReceiverConfig {
            capacity: 2,
            ..ReceiverConfig::default()
        };
        let rx = receiver(&bus, vec![SPEED], config);
        let _scope = rx.activate().unwrap();

        bus.publish(SPEED, 10);
        bus.publish(SPEED, 20);
        bus.publish(SPEED, 30);

        assert_eq!(rx.queue().dropped(), 1);
        assert_eq!(drained_integers(&rx), vec![10, 20]);
    }

    #[test]
    fn full_queue_can_evict_the_oldest() {
        let bus = Arc::new(LocalBus::new());
        let config = ReceiverConfig {
            capacity: 2,
            overflow_policy: OverflowPolicy::DropOldest,
        };
        let rx = receiver(&bus, vec![SPEED], config);
        let _scope = rx.activate().unwrap();

        bus.publish(SPEED, 10);
        bus.publish(SPEED, 20);
        bus.publish(SPEED, 30);

        assert_eq!(rx.queue().dropped(), 1);
        assert_eq!(drained_integers(&rx), vec![20, 30]);
    }

    #[test]
    fn reset_discards_backlog() {
        let bus = Arc::new(LocalBus::new());
        let rx = receiver(&bus, vec![SPEED], ReceiverConfig::default());
        let _scope = rx.activate().unwrap();
        bus.publish(SPEED, 1);
        bus.publish(SPEED, 2);

        assert_eq!(rx.reset(), 2);
        assert!(rx.try_drain().is_none());
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let queue = EnvelopeQueue::new(0, OverflowPolicy::DropNewest);
        assert_eq!(queue.capacity(), 1);
        assert!(queue.push(envelope(1)));
        assert!(!queue.push(envelope(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn pop_times_out_on_empty_queue() {
        let queue = EnvelopeQueue::new(4, OverflowPolicy::DropNewest);
        assert!(queue.pop(Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test]
    async fn pop_wakes_when_an_envelope_arrives() {
        let queue = Arc::new(EnvelopeQueue::new(4, OverflowPolicy::DropNewest));
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(envelope(5));
        });

        let got = queue.pop(Duration::from_secs(5)).await.expect("envelope");
        assert_eq!(got.payload, Some(Payload::IntegerValue(5)));
    }
}
