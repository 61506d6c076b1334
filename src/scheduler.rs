//! Cancellable delayed / periodic jobs on the tokio runtime.
//!
//! Every timer in the client goes through [`schedule`] so that the owner can
//! drop or cancel it the moment its enabling condition goes away.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Handle to a scheduled job. Dropping it cancels the job.
#[derive(Debug)]
pub struct TaskHandle {
    task: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Stop any future runs. A job body already past its last await still
    /// completes; nothing is scheduled after this returns.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Run `job` once after `delay`, then every `repeat` if given.
///
/// Runs never overlap: the next period starts counting only after the
/// previous run has been awaited.
pub fn schedule<F, Fut>(delay: Duration, repeat: Option<Duration>, mut job: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let task = tokio::spawn(async move {
        time::sleep(delay).await;
        job().await;

        let Some(period) = repeat else {
            return;
        };

        let mut interval = time::interval_at(time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            job().await;
        }
    });

    TaskHandle { task: Some(task) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter_job(count: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<()> + Send + 'static {
        let count = count.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_one_shot_fires_once() {
        time::pause();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = schedule(Duration::from_millis(100), None, counter_job(&count));

        time::advance(Duration::from_millis(99)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn test_periodic_after_delay() {
        time::pause();
        let count = Arc::new(AtomicUsize::new(0));
        let _handle = schedule(
            Duration::from_millis(100),
            Some(Duration::from_millis(1000)),
            counter_job(&count),
        );

        time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        time::advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        time::advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_stops_future_runs() {
        time::pause();
        let count = Arc::new(AtomicUsize::new(0));
        let mut handle = schedule(
            Duration::from_millis(100),
            Some(Duration::from_millis(100)),
            counter_job(&count),
        );

        time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        handle.cancel();
        time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        time::pause();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = schedule(Duration::from_millis(100), None, counter_job(&count));
        drop(handle);

        time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
