mod common;

use std::sync::{
    atomic::{AtomicU32, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use computable::{CancellationToken, ChangeSource, Computable, ComputableError, ComputableOptions, KeyedChangeSource, StabilizeOptions};

/// An input value guarded by its own change source
#[derive(Default)]
struct Input {
    value: AtomicU32,
    change: ChangeSource,
}

impl Input {
    fn set(&self, value: u32) {
        self.value.store(value, Ordering::SeqCst);
        self.change.mark_changed(None);
    }
}

fn reader(input: &Arc<Input>, calls: &Arc<AtomicUsize>, key: &str) -> Computable<u32> {
    let (input, calls) = (input.clone(), calls.clone());
    Computable::make_with(
        move |ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            input.change.attach_watcher(ctx.watcher());
            Ok(input.value.load(Ordering::SeqCst))
        },
        ComputableOptions::default().with_key(key),
    )
}

#[test]
fn test_memoized_until_input_changes() -> anyhow::Result<()> {
    let input = Arc::new(Input::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let cell = reader(&input, &calls, "memo");

    for _ in 0..5 {
        assert_eq!(cell.get_value()?, 0);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    input.set(3);
    assert!(cell.is_changed(None));
    assert_eq!(cell.get_value()?, 3);
    assert_eq!(cell.get_value()?, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn test_nested_invalidation() -> anyhow::Result<()> {
    let left = Arc::new(Input::default());
    let right = Arc::new(Input::default());
    let (left_calls, right_calls, sum_calls) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
    let left_cell = reader(&left, &left_calls, "left");
    let right_cell = reader(&right, &right_calls, "right");

    let sum = {
        let (left_cell, right_cell, sum_calls) = (left_cell.clone(), right_cell.clone(), sum_calls.clone());
        Computable::make_with(
            move |ctx| {
                sum_calls.fetch_add(1, Ordering::SeqCst);
                Ok(ctx.read(&left_cell)? + ctx.read(&right_cell)?)
            },
            ComputableOptions::default().with_key("sum"),
        )
    };
    assert_eq!(sum.get_value()?, 0);

    left.set(2);
    assert!(sum.is_changed(None));
    assert_eq!(sum.get_value()?, 2);
    // the untouched child is reused
    assert_eq!(left_calls.load(Ordering::SeqCst), 2);
    assert_eq!(right_calls.load(Ordering::SeqCst), 1);
    assert_eq!(sum_calls.load(Ordering::SeqCst), 2);

    right.set(5);
    assert_eq!(sum.get_value()?, 7);
    assert_eq!(left_calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn test_keyed_sources_invalidate_independently() -> anyhow::Result<()> {
    let rows: Arc<KeyedChangeSource<&'static str>> = Arc::new(KeyedChangeSource::new());
    let data = Arc::new(Mutex::new((1, 10)));
    let cell_for = |key: &'static str| {
        let (rows, data) = (rows.clone(), data.clone());
        Computable::make(move |ctx| {
            rows.attach_watcher(&key, ctx.watcher());
            let data = data.lock().unwrap();
            Ok(if key == "a" { data.0 } else { data.1 })
        })
    };
    let (a, b) = (cell_for("a"), cell_for("b"));
    assert_eq!((a.get_value()?, b.get_value()?), (1, 10));

    data.lock().unwrap().0 = 2;
    rows.mark_changed(&"a", None);
    assert!(a.is_changed(None));
    assert!(!b.is_changed(None));
    assert_eq!(a.get_value()?, 2);
    Ok(())
}

#[test]
fn test_evaluator_error_does_not_corrupt_state() -> anyhow::Result<()> {
    let input = Arc::new(Input::default());
    let cell = {
        let input = input.clone();
        Computable::make_with(
            move |ctx| {
                input.change.attach_watcher(ctx.watcher());
                match input.value.load(Ordering::SeqCst) {
                    13 => anyhow::bail!("unlucky"),
                    value => Ok(value * 2),
                }
            },
            ComputableOptions::default().with_key("doubler"),
        )
    };
    input.set(4);
    assert_eq!(cell.get_value()?, 8);

    input.set(13);
    let err = cell.get_value().unwrap_err();
    assert!(err.is_evaluation());
    assert_eq!(err.key(), "doubler");
    assert_eq!(cell.peek(), Some(8));

    input.set(5);
    assert_eq!(cell.get_value()?, 10);
    Ok(())
}

#[tokio::test]
async fn test_stabilize_terminates_once_inputs_settle() -> anyhow::Result<()> {
    let progress = Arc::new(Input::default());
    let cell = {
        let progress = progress.clone();
        Computable::make(move |ctx| {
            progress.change.attach_watcher(ctx.watcher());
            let done = progress.value.load(Ordering::SeqCst);
            if done < 100 {
                ctx.mark_unstable(Some(&format!("progress:{done}")));
            }
            Ok(done)
        })
    };

    let driver = {
        let progress = progress.clone();
        tokio::spawn(async move {
            for done in [25, 50, 75, 100] {
                tokio::time::sleep(Duration::from_millis(5)).await;
                progress.set(done);
            }
        })
    };
    let stable = cell.await_stable(StabilizeOptions::default().with_timeout(Duration::from_secs(2))).await?;
    driver.await?;
    assert_eq!(stable.value, 100);
    assert!(stable.unstable_observed);

    // already stable: no waiting at all
    let again = cell.await_stable(StabilizeOptions::default()).await?;
    assert_eq!(again.tag, stable.tag);
    assert!(!again.unstable_observed);
    Ok(())
}

#[tokio::test]
async fn test_stabilize_timeout_and_cancel() {
    let cell = Computable::make_with(
        |ctx| {
            ctx.mark_unstable(Some("forever"));
            Ok(())
        },
        ComputableOptions::default().with_key("restless"),
    );

    match cell.await_stable(StabilizeOptions::default().with_timeout(Duration::from_millis(30))).await {
        Err(ComputableError::Timeout { key, marker, elapsed }) => {
            assert_eq!(key, "restless");
            assert_eq!(marker.as_deref(), Some("forever"));
            assert!(elapsed >= Duration::from_millis(30));
        }
        other => panic!("expected a timeout, got {other:?}"),
    }

    let cancel = CancellationToken::new();
    let waiting = {
        let (cell, cancel) = (cell.clone(), cancel.clone());
        tokio::spawn(async move { cell.await_stable(StabilizeOptions::default().with_cancel(cancel)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap();
    assert!(matches!(result, Err(ComputableError::Aborted { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_share_one_evaluation() -> anyhow::Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let cell = {
        let calls = calls.clone();
        Computable::make(move |_ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            Ok(42u32)
        })
    };

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let cell = cell.clone();
            tokio::task::spawn_blocking(move || cell.get_value())
        })
        .collect();
    for reader in readers {
        assert_eq!(reader.await??, 42);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}
