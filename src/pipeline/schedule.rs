// src/pipeline/schedule.rs

//! Timer-driven periodic tasks.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::Result;

/// Run `task` every `interval` until `shutdown` turns true.
///
/// The first tick fires immediately. Ticks missed while a slow run was in
/// flight are skipped, not replayed. A failing run is logged and the
/// schedule carries on. Returns the number of runs started.
pub async fn run_every<F, Fut, T>(
    name: impl Into<String>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) -> usize
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let name = name.into();
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut runs = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
        if *shutdown.borrow() {
            break;
        }

        runs += 1;
        if let Err(e) = task().await {
            log::warn!("[{}] run {} failed: {}", name, runs, e);
        }
    }

    log::debug!("[{}] stopped after {} runs", name, runs);
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_runs_until_shutdown() {
        let (tx, rx) = watch::channel(false);
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);

        let handle = tokio::spawn(run_every("count", Duration::from_millis(10), rx, move || {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AppError>(())
            }
        }));

        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send_replace(true);
        let runs = handle.await.unwrap();

        assert!(runs >= 2, "only {runs} runs");
        assert_eq!(runs, counter.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_schedule() {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_every("failing", Duration::from_millis(5), rx, || async {
            Err::<(), _>(AppError::transient("npm", "boom"))
        }));

        tokio::time::sleep(Duration::from_millis(40)).await;
        tx.send_replace(true);
        assert!(handle.await.unwrap() >= 2);
    }

    #[tokio::test]
    async fn test_already_stopped_runs_nothing() {
        let (_tx, rx) = watch::channel(true);
        let runs = run_every("stopped", Duration::from_millis(5), rx, || async {
            Ok::<_, AppError>(())
        })
        .await;
        assert_eq!(runs, 0);
    }
}
