//! [`Worker`] – managed background task.
//!
//! A worker drives a [`Job`] through a fixed lifecycle:
//!
//! ```text
//! Idle ──start()──▶ Running ──stop() / Flow::Stop──▶ Stopping ──on_stop()──▶ Idle
//! ```
//!
//! * `on_start` runs once; if it fails the run loop is skipped entirely.
//! * `on_run` is called repeatedly.  An `Err` or a panic from one iteration is
//!   logged and the loop carries on, so a single bad iteration never kills
//!   the worker.
//! * With an interval configured, the worker waits `interval - elapsed`
//!   between iterations through the injected [`Clock`], and that wait ends
//!   immediately when the worker is stopped.
//! * `on_stop` always runs before the worker returns to `Idle`.
//!
//! Workers are restartable: `stop()` followed by `start()` runs a new
//! lifecycle on the same job.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use groundlink_types::LinkError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::clock::{Clock, SystemClock};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// What the run loop should do after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Deliberate stop: leave the run loop and go through `on_stop`.
    Stop,
}

/// Lifecycle phase of a [`Worker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Stopping,
}

/// Handle passed to every [`Job`] hook.
#[derive(Clone)]
pub struct WorkerContext {
    name: Arc<str>,
    abort: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl WorkerContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal that fires when the worker is asked to stop.
    pub fn abort_signal(&self) -> &CancellationToken {
        &self.abort
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Abort-aware sleep.  Returns `true` if the worker was stopped while
    /// sleeping.
    pub async fn sleep(&self, duration: Duration) -> bool {
        self.clock.wait(duration, &self.abort).await
    }
}

/// Behaviour plugged into a [`Worker`].
#[async_trait]
pub trait Job: Send + 'static {
    /// Called once before the run loop.  Returning `Err` skips the loop.
    async fn on_start(&mut self, _ctx: &WorkerContext) -> Result<(), LinkError> {
        Ok(())
    }

    /// One iteration of the run loop.
    async fn on_run(&mut self, ctx: &WorkerContext) -> Result<Flow, LinkError>;

    /// Called once when the lifecycle ends, whatever the reason.
    async fn on_stop(&mut self, _ctx: &WorkerContext) {}
}

// ────────────────────────────────────────────────────────────────────────────
// Worker
// ────────────────────────────────────────────────────────────────────────────

/// Owns a [`Job`] and the tokio task running it.
///
/// `start`/`stop` must not be called from inside the job itself: `stop`
/// awaits the task, which would then wait on itself.
pub struct Worker<J: Job> {
    name: Arc<str>,
    interval: Option<Duration>,
    clock: Arc<dyn Clock>,
    job: Arc<Mutex<J>>,
    state: Arc<StdMutex<WorkerState>>,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl<J: Job> Worker<J> {
    /// Create an idle worker named `name` (used in logs) around `job`.
    pub fn new(name: impl Into<String>, job: J) -> Self {
        Self {
            name: Arc::from(name.into()),
            interval: None,
            clock: Arc::new(SystemClock::new()),
            job: Arc::new(Mutex::new(job)),
            state: Arc::new(StdMutex::new(WorkerState::Idle)),
            task: None,
        }
    }

    /// Run iterations at a fixed period instead of back to back.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Use `clock` for interval waits and [`WorkerContext::sleep`].
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Shared handle to the job.  The lock is held by the worker task for
    /// the whole lifecycle, so it is only available while the worker is idle.
    pub fn job(&self) -> Arc<Mutex<J>> {
        Arc::clone(&self.job)
    }

    /// Start the lifecycle.  No-op while a previous lifecycle is still
    /// running or stopping.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        if let Some((_, handle)) = &self.task
            && !handle.is_finished()
        {
            return;
        }

        let abort = CancellationToken::new();
        let ctx = WorkerContext {
            name: Arc::clone(&self.name),
            abort: abort.clone(),
            clock: Arc::clone(&self.clock),
        };
        set_state(&self.state, WorkerState::Running);
        let handle = tokio::spawn(run_lifecycle(
            Arc::clone(&self.job),
            ctx,
            self.interval,
            Arc::clone(&self.state),
        ));
        self.task = Some((abort, handle));
    }

    /// Signal the job to abort, wait for the task to finish (including
    /// `on_stop`).  No-op when idle.
    pub async fn stop(&mut self) {
        let Some((abort, handle)) = self.task.take() else {
            return;
        };
        abort.cancel();
        if let Err(e) = handle.await {
            error!(worker = %self.name, error = %e, "worker task did not finish cleanly");
            set_state(&self.state, WorkerState::Idle);
        }
    }

    /// Same as [`stop`](Worker::stop); safe to call repeatedly.
    pub async fn close(&mut self) {
        self.stop().await;
    }
}

impl<J: Job> Drop for Worker<J> {
    fn drop(&mut self) {
        if let Some((abort, _)) = &self.task {
            abort.cancel();
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Internal helpers
// ────────────────────────────────────────────────────────────────────────────

fn set_state(state: &StdMutex<WorkerState>, next: WorkerState) {
    *state.lock().unwrap_or_else(|e| e.into_inner()) = next;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run a hook, turning a panic into an `Err` carrying the panic message.
async fn contained<T>(hook: impl Future<Output = T>) -> Result<T, String> {
    AssertUnwindSafe(hook)
        .catch_unwind()
        .await
        .map_err(|payload| panic_message(payload.as_ref()))
}

async fn run_lifecycle<J: Job>(
    job: Arc<Mutex<J>>,
    ctx: WorkerContext,
    interval: Option<Duration>,
    state: Arc<StdMutex<WorkerState>>,
) {
    let mut job = job.lock().await;
    debug!(worker = %ctx.name, "worker starting");

    match contained(job.on_start(&ctx)).await {
        Ok(Ok(())) => run_loop(&mut *job, &ctx, interval).await,
        Ok(Err(e)) => warn!(worker = %ctx.name, error = %e, "on_start failed; skipping run loop"),
        Err(panic) => error!(worker = %ctx.name, panic = %panic, "on_start panicked; skipping run loop"),
    }

    set_state(&state, WorkerState::Stopping);
    if let Err(panic) = contained(job.on_stop(&ctx)).await {
        error!(worker = %ctx.name, panic = %panic, "on_stop panicked");
    }
    set_state(&state, WorkerState::Idle);
    debug!(worker = %ctx.name, "worker stopped");
}

async fn run_loop<J: Job>(job: &mut J, ctx: &WorkerContext, interval: Option<Duration>) {
    while !ctx.is_aborted() {
        let started = ctx.clock.now();

        match contained(job.on_run(ctx)).await {
            Ok(Ok(Flow::Continue)) => {}
            Ok(Ok(Flow::Stop)) => {
                debug!(worker = %ctx.name, "job requested stop");
                break;
            }
            Ok(Err(e)) => warn!(worker = %ctx.name, error = %e, "iteration failed"),
            Err(panic) => error!(worker = %ctx.name, panic = %panic, "iteration panicked"),
        }

        match interval {
            Some(interval) => {
                let elapsed = (ctx.clock.now() - started).to_std().unwrap_or_default();
                if ctx.sleep(interval.saturating_sub(elapsed)).await {
                    break;
                }
            }
            None => tokio::task::yield_now().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{DateTime, TimeDelta, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Clone, Copy, PartialEq)]
    enum Behaviour {
        Ok,
        FailStart,
        FailEveryOther,
        PanicFirst,
        StopAfter(usize),
    }

    #[derive(Default)]
    struct Counters {
        starts: AtomicUsize,
        runs: AtomicUsize,
        stops: AtomicUsize,
    }

    struct ScriptedJob {
        behaviour: Behaviour,
        counters: Arc<Counters>,
        ticks: mpsc::UnboundedSender<usize>,
    }

    #[async_trait]
    impl Job for ScriptedJob {
        async fn on_start(&mut self, _ctx: &WorkerContext) -> Result<(), LinkError> {
            self.counters.starts.fetch_add(1, Ordering::SeqCst);
            if self.behaviour == Behaviour::FailStart {
                return Err(LinkError::Transport("unreachable".to_string()));
            }
            Ok(())
        }

        async fn on_run(&mut self, _ctx: &WorkerContext) -> Result<Flow, LinkError> {
            let n = self.counters.runs.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = self.ticks.send(n);
            match self.behaviour {
                Behaviour::FailEveryOther if n % 2 == 1 => {
                    Err(LinkError::Transport("flaky".to_string()))
                }
                Behaviour::PanicFirst if n == 1 => panic!("first iteration blew up"),
                Behaviour::StopAfter(limit) if n >= limit => Ok(Flow::Stop),
                _ => Ok(Flow::Continue),
            }
        }

        async fn on_stop(&mut self, _ctx: &WorkerContext) {
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn scripted(behaviour: Behaviour) -> (ScriptedJob, Arc<Counters>, mpsc::UnboundedReceiver<usize>) {
        let counters = Arc::new(Counters::default());
        let (ticks, rx) = mpsc::unbounded_channel();
        let job = ScriptedJob {
            behaviour,
            counters: Arc::clone(&counters),
            ticks,
        };
        (job, counters, rx)
    }

    async fn wait_for_tick(rx: &mut mpsc::UnboundedReceiver<usize>, at_least: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(n) = rx.recv().await {
                if n >= at_least {
                    return;
                }
            }
        })
        .await
        .expect("worker did not reach the expected iteration");
    }

    #[tokio::test]
    async fn start_runs_and_stop_returns_to_idle() {
        let (job, counters, mut ticks) = scripted(Behaviour::Ok);
        let mut worker = Worker::new("scripted", job);
        assert_eq!(worker.state(), WorkerState::Idle);

        worker.start();
        assert!(worker.is_running());
        wait_for_tick(&mut ticks, 3).await;

        worker.stop().await;
        assert_eq!(worker.state(), WorkerState::Idle);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_start_while_running_is_noop() {
        let (job, counters, mut ticks) = scripted(Behaviour::Ok);
        let mut worker = Worker::new("scripted", job);
        worker.start();
        wait_for_tick(&mut ticks, 1).await;
        worker.start();
        worker.stop().await;
        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_on_start_skips_run_loop() {
        let (job, counters, _ticks) = scripted(Behaviour::FailStart);
        let mut worker = Worker::new("scripted", job);
        worker.start();
        worker.stop().await;

        assert_eq!(counters.runs.load(Ordering::SeqCst), 0);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn failing_iterations_do_not_kill_the_worker() {
        let (job, _counters, mut ticks) = scripted(Behaviour::FailEveryOther);
        let mut worker = Worker::new("scripted", job);
        worker.start();
        wait_for_tick(&mut ticks, 5).await;
        assert!(worker.is_running());
        worker.stop().await;
    }

    #[tokio::test]
    async fn panicking_iteration_does_not_kill_the_worker() {
        let (job, _counters, mut ticks) = scripted(Behaviour::PanicFirst);
        let mut worker = Worker::new("scripted", job);
        worker.start();
        wait_for_tick(&mut ticks, 3).await;
        assert!(worker.is_running());
        worker.stop().await;
    }

    #[tokio::test]
    async fn flow_stop_ends_lifecycle_without_stop_call() {
        let (job, counters, _ticks) = scripted(Behaviour::StopAfter(2));
        let mut worker = Worker::new("scripted", job);
        worker.start();

        tokio::time::timeout(Duration::from_secs(2), async {
            while worker.state() != WorkerState::Idle {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("worker should go idle after Flow::Stop");

        assert_eq!(counters.runs.load(Ordering::SeqCst), 2);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
        worker.close().await;
    }

    #[tokio::test]
    async fn interval_waits_on_the_injected_clock() {
        let clock = Arc::new(ManualClock::default());
        let (job, counters, mut ticks) = scripted(Behaviour::Ok);
        let mut worker = Worker::new("scripted", job)
            .with_interval(Duration::from_secs(5))
            .with_clock(clock.clone());

        worker.start();
        wait_for_tick(&mut ticks, 1).await;

        let early = tokio::time::timeout(Duration::from_millis(50), ticks.recv()).await;
        assert!(early.is_err(), "second iteration ran before the interval elapsed");
        assert_eq!(counters.runs.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(5));
        wait_for_tick(&mut ticks, 2).await;
        worker.stop().await;
    }

    /// Advances the shared clock by `work` on every iteration and reports
    /// the time each iteration started.
    struct ClockedJob {
        clock: Arc<ManualClock>,
        work: Duration,
        limit: usize,
        runs: usize,
        starts: mpsc::UnboundedSender<DateTime<Utc>>,
    }

    #[async_trait]
    impl Job for ClockedJob {
        async fn on_run(&mut self, _ctx: &WorkerContext) -> Result<Flow, LinkError> {
            let _ = self.starts.send(self.clock.now());
            self.clock.advance(self.work);
            self.runs += 1;
            Ok(if self.runs >= self.limit { Flow::Stop } else { Flow::Continue })
        }
    }

    fn clocked(
        work: Duration,
        limit: usize,
    ) -> (Arc<ManualClock>, ClockedJob, mpsc::UnboundedReceiver<DateTime<Utc>>) {
        let clock = Arc::new(ManualClock::default());
        let (starts, rx) = mpsc::unbounded_channel();
        let job = ClockedJob {
            clock: Arc::clone(&clock),
            work,
            limit,
            runs: 0,
            starts,
        };
        (clock, job, rx)
    }

    async fn next_start(rx: &mut mpsc::UnboundedReceiver<DateTime<Utc>>) -> DateTime<Utc> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("iteration did not start in time")
            .expect("worker dropped its job")
    }

    #[tokio::test]
    async fn interval_wait_subtracts_the_iteration_time() {
        let (clock, job, mut starts) = clocked(Duration::from_secs(2), 2);
        let mut worker = Worker::new("clocked", job)
            .with_interval(Duration::from_secs(5))
            .with_clock(clock.clone());
        worker.start();

        let t0 = next_start(&mut starts).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while clock.sleepers() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("worker never started its interval wait");

        // 2s spent in the iteration + 2s here: one second short.
        clock.advance(Duration::from_secs(2));
        let early = tokio::time::timeout(Duration::from_millis(50), starts.recv()).await;
        assert!(early.is_err(), "next iteration started before the interval elapsed");

        clock.advance(Duration::from_secs(1));
        let t1 = next_start(&mut starts).await;
        assert_eq!(t1 - t0, TimeDelta::seconds(5));
        worker.stop().await;
    }

    #[tokio::test]
    async fn overrunning_iteration_starts_the_next_one_immediately() {
        let (clock, job, mut starts) = clocked(Duration::from_secs(3), 3);
        let mut worker = Worker::new("clocked", job)
            .with_interval(Duration::from_secs(1))
            .with_clock(clock.clone());
        worker.start();

        let t0 = next_start(&mut starts).await;
        let t1 = next_start(&mut starts).await;
        let t2 = next_start(&mut starts).await;
        assert_eq!(t1 - t0, TimeDelta::seconds(3));
        assert_eq!(t2 - t1, TimeDelta::seconds(3));
        worker.stop().await;
    }

    #[tokio::test]
    async fn stop_interrupts_a_long_interval_wait() {
        let (job, _counters, mut ticks) = scripted(Behaviour::Ok);
        let mut worker = Worker::new("scripted", job).with_interval(Duration::from_secs(3600));
        worker.start();
        wait_for_tick(&mut ticks, 1).await;

        tokio::time::timeout(Duration::from_secs(1), worker.stop())
            .await
            .expect("stop must not wait for the interval to elapse");
    }

    #[tokio::test]
    async fn worker_is_restartable() {
        let (job, counters, mut ticks) = scripted(Behaviour::Ok);
        let mut worker = Worker::new("scripted", job);

        worker.start();
        wait_for_tick(&mut ticks, 1).await;
        worker.stop().await;

        worker.start();
        let before = counters.runs.load(Ordering::SeqCst);
        wait_for_tick(&mut ticks, before + 1).await;
        worker.stop().await;

        assert_eq!(counters.starts.load(Ordering::SeqCst), 2);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (job, counters, _ticks) = scripted(Behaviour::Ok);
        let mut worker = Worker::new("scripted", job);
        worker.close().await;
        worker.start();
        worker.close().await;
        worker.close().await;
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
    }
}
