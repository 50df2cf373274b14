//! Clock and cancellable timers.
//!
//! Every time-dependent component takes a [`Clock`] by injection so tests
//! can pin `now` and let tokio's paused runtime drive sleeps
//! deterministically. Timers are single-fire unless built with
//! [`Timers::interval`]; cancellation is idempotent.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Time source used across the control plane.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// Current time as epoch milliseconds.
    fn now_ms(&self) -> i64;

    /// Suspend the calling task for `ms` milliseconds. Non-positive values
    /// return immediately.
    async fn sleep_ms(&self, ms: i64);
}

/// Wall-clock implementation backed by chrono and tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    async fn sleep_ms(&self, ms: i64) {
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(u64::try_from(ms).unwrap_or(0))).await;
        }
    }
}

/// Clock pinned to the tokio time driver.
///
/// `now_ms` is a fixed epoch plus the runtime's elapsed time, so under
/// `#[tokio::test(start_paused = true)]` it tracks tokio's virtual clock
/// exactly: `tokio::time::advance` and auto-advanced sleeps move it
/// deterministically.
#[derive(Debug)]
pub struct TestClock {
    epoch_ms: i64,
    started: tokio::time::Instant,
}

impl TestClock {
    /// Create a clock reading `epoch_ms` at the moment of construction.
    /// Must be called inside a tokio runtime.
    pub fn new(epoch_ms: i64) -> Self {
        Self {
            epoch_ms,
            started: tokio::time::Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for TestClock {
    fn now_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.epoch_ms.saturating_add(elapsed)
    }

    async fn sleep_ms(&self, ms: i64) {
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(u64::try_from(ms).unwrap_or(0))).await;
        }
    }
}

/// Handle to a spawned timer task. Dropping the handle does not cancel the
/// timer; call [`TimerHandle::cancel`].
#[derive(Debug)]
pub struct TimerHandle {
    task: tokio::task::JoinHandle<()>,
}

impl TimerHandle {
    /// Cancel the timer. Safe to call more than once and after firing.
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Whether the timer task has finished (fired or cancelled).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Factory for one-shot and interval timers driven by an injected clock.
#[derive(Clone)]
pub struct Timers {
    clock: Arc<dyn Clock>,
}

impl Timers {
    /// Create a timer factory over `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Fire `f` once at the absolute deadline (epoch ms). Deadlines in the
    /// past fire on the next scheduler turn.
    pub fn at<F, Fut>(&self, deadline_ms: i64, f: F) -> TimerHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let clock = Arc::clone(&self.clock);
        let task = tokio::spawn(async move {
            let delay = deadline_ms.saturating_sub(clock.now_ms());
            clock.sleep_ms(delay).await;
            f().await;
        });
        TimerHandle { task }
    }

    /// Fire `f` once after a relative delay.
    pub fn after<F, Fut>(&self, delay_ms: i64, f: F) -> TimerHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let clock = Arc::clone(&self.clock);
        let task = tokio::spawn(async move {
            clock.sleep_ms(delay_ms).await;
            f().await;
        });
        TimerHandle { task }
    }

    /// Fire `f` every `every_ms` until cancelled. The first fire happens one
    /// full interval after the call.
    pub fn interval<F, Fut>(&self, every_ms: i64, f: F) -> TimerHandle
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let clock = Arc::clone(&self.clock);
        let task = tokio::spawn(async move {
            loop {
                clock.sleep_ms(every_ms).await;
                f().await;
            }
        });
        TimerHandle { task }
    }
}

impl std::fmt::Debug for Timers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timers").finish_non_exhaustive()
    }
}
