//! # poller
//!
//! Periodic broadcast refresh tasks. Two pollers run against the array:
//! one for status words, one for positions. Each owns a cancellation
//! handle and a delay that can be changed at runtime; `set_delay` with
//! `immediate` cancels the current sleep so the next tick runs now.
//! Both are paused for the duration of a trajectory.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

type PollFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type PollFn = Arc<dyn Fn() -> PollFuture + Send + Sync>;

pub struct Poller {
    pub name: &'static str,
    callback: PollFn,
    /// Shared with the running task, which re-reads it every iteration.
    delay: Arc<StdMutex<Duration>>,
    reschedule: Arc<Notify>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl Poller {
    pub fn new<F, Fut>(name: &'static str, delay: Duration, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            callback: Arc::new(move || Box::pin(callback()) as PollFuture),
            delay: Arc::new(StdMutex::new(delay)),
            reschedule: Arc::new(Notify::new()),
            task: StdMutex::new(None),
        }
    }

    /// Start ticking. A poller that is already running stays untouched.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let callback = self.callback.clone();
        let reschedule = self.reschedule.clone();
        let delay = self.delay.clone();
        let name = self.name;
        debug!("poller {name}: started");
        *task = Some(tokio::spawn(async move {
            loop {
                callback().await;
                let delay = *delay.lock().unwrap();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = reschedule.notified() => {
                        debug!("poller {name}: sleep cancelled, rescheduling");
                    }
                }
            }
        }));
    }

    pub async fn stop(&self) {
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            debug!("poller {}: stopped", self.name);
        }
    }

    pub fn running(&self) -> bool {
        self.task.lock().unwrap().as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn delay(&self) -> Duration {
        *self.delay.lock().unwrap()
    }

    /// Change the tick period. With `immediate`, the current sleep is
    /// cancelled and the callback runs right away.
    pub fn set_delay(&self, delay: Duration, immediate: bool) {
        *self.delay.lock().unwrap() = delay;
        if immediate {
            self.reschedule.notify_waiters();
        }
    }
}

/// The status/position poller pair owned by the array controller.
pub struct PollerSet {
    pub status: Poller,
    pub position: Poller,
}

impl PollerSet {
    pub fn start(&self) {
        self.status.start();
        self.position.start();
    }

    pub async fn stop(&self) {
        self.status.stop().await;
        self.position.stop().await;
    }

    pub fn running(&self) -> bool {
        self.status.running() || self.position.running()
    }

    pub fn set_delay(&self, delay: Duration, immediate: bool) {
        self.status.set_delay(delay, immediate);
        self.position.set_delay(delay, immediate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_poller(delay: Duration) -> (Poller, Arc<AtomicUsize>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_cb = ticks.clone();
        let poller = Poller::new("test", delay, move || {
            let ticks = ticks_cb.clone();
            async move {
                ticks.fetch_add(1, Ordering::SeqCst);
            }
        });
        (poller, ticks)
    }

    #[tokio::test]
    async fn ticks_periodically_until_stopped() {
        let (poller, ticks) = counting_poller(Duration::from_millis(10));
        poller.start();
        assert!(poller.running());

        tokio::time::sleep(Duration::from_millis(55)).await;
        poller.stop().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected several ticks, saw {seen}");
        assert!(!poller.running());

        let frozen = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), frozen);
    }

    #[tokio::test]
    async fn immediate_set_delay_cancels_the_sleep() {
        let (poller, ticks) = counting_poller(Duration::from_secs(3600));
        poller.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        // Without the immediate flag the poller would sleep for an hour.
        poller.set_delay(Duration::from_millis(10), true);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 2);
        assert_eq!(poller.delay(), Duration::from_millis(10));

        poller.stop().await;
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let (poller, ticks) = counting_poller(Duration::from_millis(10));
        poller.start();
        tokio::time::sleep(Duration::from_millis(15)).await;
        poller.stop().await;

        let frozen = ticks.load(Ordering::SeqCst);
        poller.start();
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(ticks.load(Ordering::SeqCst) > frozen);
        poller.stop().await;
    }
}
