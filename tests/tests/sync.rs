mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use common::Gauge;
use computable::{AdvisoryLocks, ConcurrencyLimiter, EngineConfig, TaskState, TaskTracker};

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_limiter_bounds_concurrency() -> anyhow::Result<()> {
    let limiter = EngineConfig::default().limiter();
    assert_eq!(limiter.limit(), 32);
    let gauge = Gauge::default();
    let completed = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..100)
        .map(|_| {
            let (limiter, gauge, completed) = (limiter.clone(), gauge.clone(), completed.clone());
            tokio::spawn(async move {
                limiter
                    .run(async {
                        gauge.enter();
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        gauge.leave();
                    })
                    .await;
                completed.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    for task in tasks {
        task.await?;
    }

    assert_eq!(completed.load(Ordering::SeqCst), 100);
    assert!(gauge.peak() <= 32, "peak concurrency {}", gauge.peak());
    assert!(gauge.peak() > 1);
    assert_eq!(limiter.in_flight(), 0);
    Ok(())
}

#[tokio::test]
async fn test_limiter_releases_failed_operations() {
    let limiter = ConcurrencyLimiter::new(1);
    let failed: Result<(), &str> = limiter.run(async { Err("boom") }).await;
    assert!(failed.is_err());
    let ok = tokio::time::timeout(Duration::from_millis(100), limiter.run(async { 7 })).await.unwrap();
    assert_eq!(ok, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_advisory_lock_serializes_critical_sections() -> anyhow::Result<()> {
    let locks: AdvisoryLocks<String> = AdvisoryLocks::new();
    let gauge = Gauge::default();
    let log = Arc::new(Mutex::new(Vec::new()));

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let (locks, gauge, log) = (locks.clone(), gauge.clone(), log.clone());
            tokio::spawn(async move {
                locks
                    .with_lock("project-1".to_string(), async {
                        gauge.enter();
                        log.lock().unwrap().push(i);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        gauge.leave();
                    })
                    .await
            })
        })
        .collect();
    // an unrelated id is never blocked by the queue above
    let other = tokio::time::timeout(Duration::from_millis(50), locks.lock("project-2".to_string())).await?;
    drop(other);

    for task in tasks {
        task.await?;
    }
    assert_eq!(gauge.peak(), 1);
    assert_eq!(log.lock().unwrap().len(), 10);
    assert!(locks.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_tracker_barrier() -> anyhow::Result<()> {
    let tracker = TaskTracker::new();
    let finished = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..5u64)
        .map(|i| {
            let finished = finished.clone();
            tracker.track(async move {
                tokio::time::sleep(Duration::from_millis(5 * (i + 1))).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(i)
            })
        })
        .collect();
    let failing = tracker.track_deferred(async {
        tokio::time::sleep(Duration::from_millis(3)).await;
        Err::<(), _>(anyhow::anyhow!("upload rejected"))
    });

    assert_eq!(tracker.await_all().await, 6);
    assert_eq!(finished.load(Ordering::SeqCst), 5);
    assert!(tasks.iter().all(|task| task.state() == TaskState::Fulfilled));
    assert_eq!(failing.state(), TaskState::Rejected);
    assert!(!failing.is_consumed());

    let err = failing.result().await.unwrap_err();
    assert!(err.to_string().contains("upload rejected"));
    assert_eq!(tasks[4].result().await?, 4);
    assert_eq!(tracker.in_flight(), 0);
    Ok(())
}
