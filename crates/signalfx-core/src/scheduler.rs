// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Runs `job` immediately and then on every `period` until `cancel` fires.
///
/// Invocations never overlap: a run that takes longer than the period delays
/// the next one. A panicking run is logged and the schedule continues. A run
/// in flight when `cancel` fires is awaited, so the returned handle resolves
/// only after it completes.
pub fn run_on_interval<F, Fut>(
    cancel: CancellationToken,
    period: Duration,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Interval job cancelled");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = tokio::spawn(job()).await {
                if e.is_panic() {
                    error!("Interval job panicked: {:?}", e);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing_test::traced_test;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_immediately_then_periodically() {
        let count = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let counter = Arc::clone(&count);
        let handle = run_on_interval(cancel.clone(), Duration::from_secs(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_waits_for_running_job() {
        let completed = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let counter = Arc::clone(&completed);
        let handle = run_on_interval(cancel.clone(), Duration::from_secs(60), move || {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_panicking_job_keeps_schedule() {
        let count = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let counter = Arc::clone(&count);
        let handle = run_on_interval(cancel.clone(), Duration::from_secs(1), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(logs_contain("Interval job panicked"));
        cancel.cancel();
        handle.await.unwrap();
    }
}
