//! End-to-end tests exercising the operators with full option stacks.

use futures::{stream, StreamExt};
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::adaptive::AdaptiveConfig;
use crate::breaker::CircuitBreakerConfig;
use crate::cancellation::CancelToken;
use crate::errors::{ItemError, ParallelError};
use crate::limiter::RateLimitConfig;
use crate::options::{ErrorMode, ParallelOptions};
use crate::pipeline::{
    batch_parallel, batch_parallel_stream, for_each_parallel, for_each_parallel_stream,
    map_parallel, map_parallel_stream,
};

#[derive(Debug, Clone, Error)]
#[error("{0}")]
struct OpError(&'static str);

fn options() -> ParallelOptions<OpError> {
    ParallelOptions::new().with_max_concurrency(4)
}

#[tokio::test]
async fn test_map_parallel_ordered_end_to_end() {
    let results = map_parallel(
        1..=5,
        |x: i32| async move { Ok::<_, OpError>(x * 10) },
        options().with_ordered_output(),
    )
    .await
    .expect("all items succeed");

    assert_eq!(results, vec![10, 20, 30, 40, 50]);
}

#[tokio::test]
async fn test_map_parallel_unordered_returns_all_results() {
    let mut results = map_parallel(
        1..=20,
        |x: i32| async move { Ok::<_, OpError>(x * 2) },
        options(),
    )
    .await
    .expect("all items succeed");

    results.sort_unstable();
    assert_eq!(results, (1..=20).map(|x| x * 2).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_map_parallel_with_owned_values() {
    let words = vec![
        "alpha".to_string(),
        "beta".to_string(),
        "gamma".to_string(),
    ];
    let results = map_parallel(
        words,
        |word: String| async move { Ok::<_, OpError>(word.to_uppercase()) },
        options().with_ordered_output(),
    )
    .await
    .expect("all items succeed");

    assert_eq!(results, vec!["ALPHA", "BETA", "GAMMA"]);
}

#[tokio::test]
async fn test_map_parallel_empty_source() {
    let results = map_parallel(
        Vec::<i32>::new(),
        |x: i32| async move { Ok::<_, OpError>(x) },
        options().with_ordered_output(),
    )
    .await
    .expect("empty run succeeds");

    assert!(results.is_empty());
}

#[tokio::test]
async fn test_ordered_output_with_inverse_latency() {
    // Later items finish first; ordering must still follow input order.
    let results = map_parallel(
        0..10,
        |x: u64| async move {
            tokio::time::sleep(Duration::from_millis((10 - x) * 5)).await;
            Ok::<_, OpError>(x)
        },
        options().with_max_concurrency(10).with_ordered_output(),
    )
    .await
    .expect("all items succeed");

    assert_eq!(results, (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_concurrency_never_exceeds_ceiling() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (current, high) = (in_flight.clone(), peak.clone());
    map_parallel(
        0..20,
        move |x: i32| {
            let (current, high) = (current.clone(), high.clone());
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                high.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, OpError>(x)
            }
        },
        options().with_max_concurrency(3),
    )
    .await
    .expect("all items succeed");

    let observed = peak.load(Ordering::SeqCst);
    assert!(observed <= 3, "peak concurrency {observed} breached the ceiling");
    assert!(observed >= 2, "pool never actually ran in parallel");
}

#[tokio::test]
async fn test_fail_fast_surfaces_first_failure_and_stops() {
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = processed.clone();

    let result = map_parallel(
        1..=100,
        move |x: i32| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if x == 5 {
                    Err(OpError("boom"))
                } else {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(x)
                }
            }
        },
        options().with_error_mode(ErrorMode::FailFast),
    )
    .await;

    match result {
        Err(ParallelError::Item { index, .. }) => assert_eq!(index, 4),
        other => panic!("expected an item error, got {other:?}"),
    }
    assert!(
        processed.load(Ordering::SeqCst) < 100,
        "fail-fast did not stop in-flight processing"
    );
}

#[tokio::test]
async fn test_collect_and_continue_aggregates_all_failures() {
    let result = map_parallel(
        0..10,
        |x: i32| async move {
            if x % 2 == 0 {
                Err(OpError("even"))
            } else {
                Ok(x)
            }
        },
        options().with_error_mode(ErrorMode::CollectAndContinue),
    )
    .await;

    match result {
        Err(ParallelError::Aggregate { failures }) => {
            let mut indices: Vec<usize> = failures.iter().map(|f| f.index).collect();
            indices.sort_unstable();
            assert_eq!(indices, vec![0, 2, 4, 6, 8]);
        }
        other => panic!("expected an aggregate error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_best_effort_returns_partial_results() {
    let results = map_parallel(
        0..10,
        |x: i32| async move {
            if x % 2 == 0 {
                Err(OpError("even"))
            } else {
                Ok(x)
            }
        },
        options()
            .with_error_mode(ErrorMode::BestEffort)
            .with_ordered_output(),
    )
    .await
    .expect("best effort never raises item failures");

    assert_eq!(results, vec![1, 3, 5, 7, 9]);
}

#[tokio::test]
async fn test_retry_recovers_transient_failures() {
    let attempts: Arc<parking_lot::Mutex<HashMap<i32, u32>>> =
        Arc::new(parking_lot::Mutex::new(HashMap::new()));
    let retry_count = Arc::new(AtomicUsize::new(0));

    let tally = attempts.clone();
    let retries = retry_count.clone();
    let results = map_parallel(
        1..=5,
        move |x: i32| {
            let tally = tally.clone();
            async move {
                let attempt = {
                    let mut map = tally.lock();
                    let entry = map.entry(x).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if attempt <= 2 {
                    Err(OpError("transient"))
                } else {
                    Ok(x * 10)
                }
            }
        },
        options()
            .with_ordered_output()
            .with_max_retries(3)
            .with_base_delay(Duration::from_millis(1))
            .on_retry(move |_, _, _| {
                retries.fetch_add(1, Ordering::SeqCst);
            }),
    )
    .await
    .expect("every item succeeds on its third attempt");

    assert_eq!(results, vec![10, 20, 30, 40, 50]);
    assert_eq!(retry_count.load(Ordering::SeqCst), 10);
    assert!(attempts.lock().values().all(|&n| n == 3));
}

#[tokio::test]
async fn test_on_error_returning_false_cancels_run() {
    let result = map_parallel(
        0..100,
        |x: i32| async move {
            if x == 3 {
                Err(OpError("boom"))
            } else {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(x)
            }
        },
        options()
            .with_error_mode(ErrorMode::BestEffort)
            .on_error(|_, _| false),
    )
    .await;

    match result {
        Err(error) => assert!(error.is_cancelled()),
        Ok(_) => panic!("callback-requested cancellation must surface"),
    }
}

#[tokio::test]
async fn test_lifecycle_callbacks_fire_per_item() {
    let started = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let (s, c) = (started.clone(), completed.clone());
    map_parallel(
        0..10,
        |x: i32| async move { Ok::<_, OpError>(x) },
        options()
            .on_start(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .on_complete(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
    )
    .await
    .expect("all items succeed");

    assert_eq!(started.load(Ordering::SeqCst), 10);
    assert_eq!(completed.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn test_throttle_fires_when_queue_saturates() {
    let throttles = Arc::new(AtomicUsize::new(0));
    let counter = throttles.clone();

    map_parallel(
        0..20,
        |x: i32| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<_, OpError>(x)
        },
        options()
            .with_max_concurrency(1)
            .with_queue_capacity(1)
            .on_throttle(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
    )
    .await
    .expect("all items succeed");

    assert!(
        throttles.load(Ordering::SeqCst) > 0,
        "a single slow worker behind a capacity-1 queue must throttle the producer"
    );
}

#[tokio::test]
async fn test_caller_cancellation_stops_run() {
    let token = CancelToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel("deadline reached");
    });

    let result = map_parallel(
        0..1000,
        |x: i32| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<_, OpError>(x)
        },
        options().with_cancel_token(token),
    )
    .await;

    match result {
        Err(ParallelError::Cancelled { reason }) => assert_eq!(reason, "deadline reached"),
        other => panic!("expected cancellation, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rate_limit_paces_execution() {
    let start = Instant::now();
    map_parallel(
        0..5,
        |x: i32| async move { Ok::<_, OpError>(x) },
        options().with_rate_limit(RateLimitConfig::new(100.0, 1.0)),
    )
    .await
    .expect("all items succeed");

    // Burst of 1 plus four refills at 10 ms apiece.
    assert!(
        start.elapsed() >= Duration::from_millis(30),
        "rate limiting did not pace the run"
    );
}

#[tokio::test]
async fn test_circuit_breaker_rejects_after_trip() {
    let result = map_parallel(
        0..20,
        |_: i32| async move { Err::<i32, _>(OpError("down")) },
        options()
            .with_max_concurrency(1)
            .with_error_mode(ErrorMode::CollectAndContinue)
            .with_circuit_breaker(CircuitBreakerConfig::new(1, 1, Duration::from_secs(60))),
    )
    .await;

    match result {
        Err(ParallelError::Aggregate { failures }) => {
            assert_eq!(failures.len(), 20);
            let rejected = failures
                .iter()
                .filter(|f| matches!(f.error, ItemError::CircuitOpen))
                .count();
            // Item 0 trips the breaker; every later item is rejected.
            assert_eq!(rejected, 19);
        }
        other => panic!("expected an aggregate error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_adaptive_concurrency_respects_ceiling() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (current, high) = (in_flight.clone(), peak.clone());
    map_parallel(
        0..30,
        move |x: i32| {
            let (current, high) = (current.clone(), high.clone());
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                high.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, OpError>(x)
            }
        },
        options().with_adaptive_concurrency(AdaptiveConfig::new(1, 3).with_initial(2)),
    )
    .await
    .expect("all items succeed");

    assert!(peak.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn test_item_timeout_fails_slow_items() {
    let result = map_parallel(
        0..3,
        |x: i32| async move {
            if x == 1 {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok::<_, OpError>(x)
        },
        options()
            .with_item_timeout(Duration::from_millis(20))
            .with_error_mode(ErrorMode::CollectAndContinue),
    )
    .await;

    match result {
        Err(ParallelError::Aggregate { failures }) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].index, 1);
            assert!(matches!(failures[0].error, ItemError::Timeout(_)));
        }
        other => panic!("expected one timeout failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_map_parallel_stream_ordered_yields_input_order() {
    let stream = map_parallel_stream(
        stream::iter(0..10u64),
        |x| async move {
            tokio::time::sleep(Duration::from_millis((10 - x) * 2)).await;
            Ok::<_, OpError>(x * 3)
        },
        options().with_max_concurrency(10).with_ordered_output(),
    );

    let results: Vec<u64> = stream
        .map(|item| item.expect("all items succeed"))
        .collect()
        .await;
    assert_eq!(results, (0..10).map(|x| x * 3).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_map_parallel_stream_fail_fast_ends_with_error() {
    let stream = map_parallel_stream(
        stream::iter(0..6),
        |x: i32| async move {
            if x == 3 {
                Err(OpError("boom"))
            } else {
                Ok(x)
            }
        },
        options().with_error_mode(ErrorMode::FailFast),
    );

    let items: Vec<_> = stream.collect().await;
    assert!(!items.is_empty());
    for item in &items[..items.len() - 1] {
        assert!(item.is_ok());
    }
    match items.last() {
        Some(Err(ParallelError::Item { index, .. })) => assert_eq!(*index, 3),
        other => panic!("expected a trailing item error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_map_parallel_stream_invalid_options_yield_config_error() {
    let mut stream = map_parallel_stream(
        stream::iter(0..3),
        |x: i32| async move { Ok::<_, OpError>(x) },
        options().with_max_concurrency(0),
    );

    let first = stream.next().await.expect("one element");
    assert!(matches!(first, Err(ParallelError::Config(_))));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_stream_runs_nothing_until_polled() {
    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = invoked.clone();

    let mut stream = map_parallel_stream(
        stream::iter(0..50),
        move |x: i32| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, OpError>(x)
            }
        },
        options(),
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        invoked.load(Ordering::SeqCst),
        0,
        "operations ran before the stream was polled"
    );

    let mut seen = 0;
    while let Some(item) = stream.next().await {
        item.expect("all items succeed");
        seen += 1;
    }
    assert_eq!(seen, 50);
    assert_eq!(invoked.load(Ordering::SeqCst), 50);
}

#[tokio::test]
async fn test_dropping_stream_cancels_processing() {
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = processed.clone();

    let mut stream = map_parallel_stream(
        stream::iter(0..1000),
        move |x: i32| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, OpError>(x)
            }
        },
        options(),
    );

    let _ = stream.next().await;
    let _ = stream.next().await;
    drop(stream);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let after_drop = processed.load(Ordering::SeqCst);
    assert!(
        after_drop < 500,
        "dropping the stream left {after_drop} items running"
    );
}

#[tokio::test]
async fn test_for_each_parallel_applies_side_effects() {
    let sum = Arc::new(AtomicUsize::new(0));
    let total = sum.clone();

    for_each_parallel(
        1..=10usize,
        move |x| {
            let total = total.clone();
            async move {
                total.fetch_add(x, Ordering::SeqCst);
                Ok::<_, OpError>(())
            }
        },
        options(),
    )
    .await
    .expect("all items succeed");

    assert_eq!(sum.load(Ordering::SeqCst), 55);
}

#[tokio::test]
async fn test_for_each_parallel_stream_over_async_source() {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();

    for_each_parallel_stream(
        stream::iter(0..25),
        move |_: i32| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, OpError>(())
            }
        },
        options(),
    )
    .await
    .expect("all items succeed");

    assert_eq!(seen.load(Ordering::SeqCst), 25);
}

#[tokio::test]
async fn test_batch_parallel_sums_with_short_tail() {
    let results = batch_parallel(
        1..=5,
        2,
        |batch: Vec<i32>| async move { Ok::<_, OpError>(batch.iter().sum::<i32>()) },
        options().with_ordered_output(),
    )
    .await
    .expect("all batches succeed");

    assert_eq!(results, vec![3, 7, 5]);
}

#[tokio::test]
async fn test_batch_parallel_rejects_zero_batch_size() {
    let result = batch_parallel(
        1..=5,
        0,
        |batch: Vec<i32>| async move { Ok::<_, OpError>(batch.len()) },
        options(),
    )
    .await;

    assert!(matches!(result, Err(ParallelError::Config(_))));
}

#[tokio::test]
async fn test_batch_parallel_stream_ordered() {
    let stream = batch_parallel_stream(
        stream::iter(1..=5),
        2,
        None,
        |batch: Vec<i32>| async move { Ok::<_, OpError>(batch.iter().sum::<i32>()) },
        options().with_ordered_output(),
    );

    let results: Vec<i32> = stream
        .map(|item| item.expect("all batches succeed"))
        .collect()
        .await;
    assert_eq!(results, vec![3, 7, 5]);
}
