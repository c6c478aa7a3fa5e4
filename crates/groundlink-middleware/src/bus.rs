//! In-process, topic-keyed publish/subscribe bus.
//!
//! [`LocalBus::publish`] invokes every matching callback synchronously on the
//! publisher's thread: first the subscriptions for that exact topic, then the
//! wildcard subscriptions (topic `None`), each in subscription order.
//!
//! # Rate limiting
//!
//! Every subscription carries its own `min_interval`.  A callback is only
//! invoked when at least `min_interval` has passed (according to the bus
//! [`Clock`]) since the last time *that* callback was invoked, so a throttled
//! subscriber never delays an unthrottled one.
//!
//! # Fault isolation
//!
//! A callback returning `Err` or panicking is logged; the remaining callbacks
//! still run and nothing is propagated to the publisher.
//!
//! # Origins
//!
//! [`LocalBus::publish_from`] stamps a publication with the [`BridgeId`] of
//! the bridge side that republished it from the wire.  Bridge receivers use
//! the stamp to ignore their own echoes; ordinary subscribers can ignore it.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use groundlink_kernel::{Clock, SystemClock};
use groundlink_types::{BridgeId, LinkError, TopicId};
use tracing::{error, trace, warn};

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A value published on the bus.
///
/// `Bytes` and `Message` hold an arbitrary object; crossing a bridge requires
/// a byte serializer or message type registered for the topic in the
/// [`CodecRegistry`](crate::codec::CodecRegistry).
#[derive(Clone)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Text(String),
    /// Opaque object encoded by a per-topic byte serializer.
    Bytes(Arc<dyn Any + Send + Sync>),
    /// Structured message encoded by a per-topic message type.
    Message(Arc<dyn Any + Send + Sync>),
}

impl Value {
    pub fn bytes<T: Any + Send + Sync>(object: T) -> Self {
        Value::Bytes(Arc::new(object))
    }

    pub fn message<T: Any + Send + Sync>(message: T) -> Self {
        Value::Message(Arc::new(message))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow the object inside a `Bytes` or `Message` value as `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Value::Bytes(obj) | Value::Message(obj) => obj.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => f.debug_tuple("Integer").field(v).finish(),
            Value::Float(v) => f.debug_tuple("Float").field(v).finish(),
            Value::Text(v) => f.debug_tuple("Text").field(v).finish(),
            Value::Bytes(_) => f.write_str("Bytes(..)"),
            Value::Message(_) => f.write_str("Message(..)"),
        }
    }
}

/// Scalars compare by value; objects compare by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) | (Value::Message(a), Value::Message(b)) => {
                Arc::ptr_eq(a, b)
            }
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// What a callback sees for each delivered value.
#[derive(Debug)]
pub struct Publication<'a> {
    pub topic: TopicId,
    pub value: &'a Value,
    /// Bridge side that republished this value from the wire, if any.
    pub origin: Option<BridgeId>,
    pub timestamp: DateTime<Utc>,
}

/// Subscriber callback.  Identity (for duplicate detection and
/// unsubscribing) is the `Arc` allocation, so keep the `Arc` around.
pub type Callback = Arc<dyn Fn(&Publication<'_>) -> Result<(), LinkError> + Send + Sync>;

/// Wrap a closure as a [`Callback`].
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&Publication<'_>) -> Result<(), LinkError> + Send + Sync + 'static,
{
    Arc::new(f)
}

struct Subscription {
    topic: Option<TopicId>,
    callback: Callback,
    min_interval: Duration,
    last_sent: Mutex<Option<DateTime<Utc>>>,
}

impl Subscription {
    /// Check the rate limit and, if the callback is due, record `now` as its
    /// last delivery.
    fn claim(&self, now: DateTime<Utc>) -> bool {
        let mut last_sent = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());
        let due = match *last_sent {
            Some(last) => (now - last).to_std().unwrap_or(Duration::ZERO) >= self.min_interval,
            None => true,
        };
        if due {
            *last_sent = Some(now);
        }
        due
    }
}

fn describe(topic: Option<TopicId>) -> String {
    match topic {
        Some(id) => id.to_string(),
        None => "all topics".to_string(),
    }
}

// ---------------------------------------------------------------------------
// LocalBus
// ---------------------------------------------------------------------------

/// In-process publish/subscribe registry.
///
/// Construct one per process at startup and share it as `Arc<LocalBus>`.
pub struct LocalBus {
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    clock: Arc<dyn Clock>,
}

impl LocalBus {
    /// Create an empty bus timed by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty bus timed by `clock` (rate limiting and publication
    /// timestamps).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Publish `value` on `topic`.
    ///
    /// Returns the number of callbacks invoked.  Publishing on a topic with
    /// no subscribers is a normal condition and returns `0`.
    pub fn publish(&self, topic: TopicId, value: impl Into<Value>) -> usize {
        self.dispatch(topic, &value.into(), None)
    }

    /// Publish `value` on `topic` on behalf of the bridge side `origin`.
    pub fn publish_from(&self, topic: TopicId, value: impl Into<Value>, origin: BridgeId) -> usize {
        self.dispatch(topic, &value.into(), Some(origin))
    }

    /// Subscribe `callback` to `topic` (`None` = every topic) without
    /// throttling.
    ///
    /// # Errors
    ///
    /// [`LinkError::AlreadySubscribed`] if this exact callback is already
    /// subscribed to `topic`.
    pub fn subscribe(&self, topic: Option<TopicId>, callback: Callback) -> Result<(), LinkError> {
        self.subscribe_throttled(topic, callback, Duration::ZERO)
    }

    /// Subscribe `callback` to `topic`, invoking it at most once per
    /// `min_interval`.
    pub fn subscribe_throttled(
        &self,
        topic: Option<TopicId>,
        callback: Callback,
        min_interval: Duration,
    ) -> Result<(), LinkError> {
        let mut subs = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        if subs
            .iter()
            .any(|s| s.topic == topic && Arc::ptr_eq(&s.callback, &callback))
        {
            return Err(LinkError::AlreadySubscribed(describe(topic)));
        }
        subs.push(Arc::new(Subscription {
            topic,
            callback,
            min_interval,
            last_sent: Mutex::new(None),
        }));
        Ok(())
    }

    /// Remove the subscription of `callback` to `topic`.
    ///
    /// # Errors
    ///
    /// [`LinkError::NotSubscribed`] if there is no such subscription.
    pub fn unsubscribe(&self, topic: Option<TopicId>, callback: &Callback) -> Result<(), LinkError> {
        let mut subs = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        let position = subs
            .iter()
            .position(|s| s.topic == topic && Arc::ptr_eq(&s.callback, callback))
            .ok_or_else(|| LinkError::NotSubscribed(describe(topic)))?;
        subs.remove(position);
        Ok(())
    }

    /// Number of live subscriptions (exact and wildcard).
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn dispatch(&self, topic: TopicId, value: &Value, origin: Option<BridgeId>) -> usize {
        // Snapshot so callbacks may (un)subscribe or publish re-entrantly.
        let matching: Vec<Arc<Subscription>> = {
            let subs = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
            let exact = subs.iter().filter(|s| s.topic == Some(topic));
            let wildcard = subs.iter().filter(|s| s.topic.is_none());
            exact.chain(wildcard).cloned().collect()
        };
        if matching.is_empty() {
            return 0;
        }

        let now = self.clock.now();
        let publication = Publication {
            topic,
            value,
            origin,
            timestamp: now,
        };

        let mut invoked = 0;
        for sub in matching {
            if !sub.claim(now) {
                trace!(topic = %topic, "subscriber throttled");
                continue;
            }
            invoked += 1;
            match panic::catch_unwind(AssertUnwindSafe(|| (sub.callback)(&publication))) {
                Ok(Ok(())) => {}
                Ok(Err(e @ LinkError::UnregisteredCodec { .. })) => {
                    error!(topic = %topic, error = %e, "subscriber cannot encode value")
                }
                Ok(Err(e)) => warn!(topic = %topic, error = %e, "subscriber failed"),
                Err(_) => warn!(topic = %topic, "subscriber panicked"),
            }
        }
        invoked
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}
