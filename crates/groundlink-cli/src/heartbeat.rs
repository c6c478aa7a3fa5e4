//! Periodic liveness counter published on the local bus.

use std::sync::Arc;

use async_trait::async_trait;
use groundlink_kernel::{Flow, Job, WorkerContext};
use groundlink_middleware::LocalBus;
use groundlink_types::{LinkError, TopicId};
use tracing::debug;

/// Publishes 0, 1, 2, … on `topic`, one value per worker iteration.
pub struct Heartbeat {
    bus: Arc<LocalBus>,
    topic: TopicId,
    beats: i64,
}

impl Heartbeat {
    pub fn new(bus: Arc<LocalBus>, topic: TopicId) -> Self {
        Self { bus, topic, beats: 0 }
    }
}

#[async_trait]
impl Job for Heartbeat {
    async fn on_run(&mut self, ctx: &WorkerContext) -> Result<Flow, LinkError> {
        let delivered = self.bus.publish(self.topic, self.beats);
        debug!(worker = ctx.name(), beat = self.beats, delivered, "heartbeat");
        self.beats = self.beats.wrapping_add(1);
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groundlink_kernel::{ManualClock, Worker};
    use groundlink_middleware::callback;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn publishes_an_increasing_counter_at_the_interval() {
        let clock = Arc::new(ManualClock::default());
        let bus = Arc::new(LocalBus::with_clock(clock.clone()));
        let beats = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&beats);
        bus.subscribe(
            Some(TopicId(100)),
            callback(move |p| {
                sink.lock().unwrap().extend(p.value.as_integer());
                Ok(())
            }),
        )
        .unwrap();

        let mut worker = Worker::new("heartbeat", Heartbeat::new(Arc::clone(&bus), TopicId(100)))
            .with_interval(Duration::from_secs(1))
            .with_clock(clock.clone());
        worker.start();

        tokio::time::timeout(Duration::from_secs(5), async {
            while beats.lock().unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("first beat is immediate");
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(beats.lock().unwrap().len(), 1, "next beat waits for the interval");

        tokio::time::timeout(Duration::from_secs(5), async {
            while beats.lock().unwrap().len() < 3 {
                clock.advance(Duration::from_millis(250));
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("heartbeat keeps publishing as time passes");
        worker.stop().await;

        let seen = beats.lock().unwrap().clone();
        assert_eq!(&seen[..3], &[0, 1, 2]);
    }
}
