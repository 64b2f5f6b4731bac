/// Named periodic background tasks
///
/// Each task sleeps for its interval, runs its body to completion and only
/// then starts the next sleep, so one task never runs twice at once and a
/// slow body delays its own next run instead of piling up.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

pub struct PeriodicTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(name: &'static str, interval: Duration, mut body: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("Scheduling {} every {:?}", name, interval);

        let handle = tokio::spawn(async move {
            loop {
                sleep(interval).await;
                tracing::trace!("Running {}", name);
                body().await;
            }
        });

        Self { name, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// The four background loops of a running proxy. Dropping this does not
/// stop them; call `abort_all`.
pub struct Scheduler {
    pub tasks: Vec<PeriodicTask>,
}

impl Scheduler {
    pub fn abort_all(&self) {
        for task in &self.tasks {
            tracing::debug!("Stopping {}", task.name());
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn first_run_waits_one_interval() {
        let runs = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&runs);
        let task = PeriodicTask::spawn("test", Duration::from_secs(10), move || {
            let r = Arc::clone(&r);
            async move {
                r.fetch_add(1, Ordering::SeqCst);
            }
        });

        sleep(Duration::from_secs(9)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_body_never_overlaps_itself() {
        let running = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let runs = Arc::new(AtomicU32::new(0));

        let (running2, max2, runs2) = (running.clone(), max_seen.clone(), runs.clone());
        let task = PeriodicTask::spawn("slow", Duration::from_secs(1), move || {
            let (running, max_seen, runs) = (running2.clone(), max2.clone(), runs2.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                // Body takes five intervals.
                sleep(Duration::from_secs(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Each cycle is 1s sleep + 5s body.
        sleep(Duration::from_secs(61)).await;
        task.abort();

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 10);
    }
}
