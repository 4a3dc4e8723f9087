use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use breakwater::{
    BadRequest, Command, CommandError, CommandProperties, EventType, FailureType,
    IsolationStrategy, RequestContext, ThreadPoolProperties,
};

/// Properties tuned for tests: tight breaker volume, instant health
/// recomputation, short sleep window.
fn test_properties() -> CommandProperties {
    CommandProperties::default()
        .with_request_volume_threshold(3)
        .with_error_threshold_percentage(50)
        .with_sleep_window(Duration::from_millis(200))
        .with_health_snapshot_interval(Duration::ZERO)
}

#[tokio::test]
async fn happy_path_records_a_single_success() {
    breakwater::init_logging(Some("debug".to_string()));
    let context = RequestContext::new();
    context
        .scope(async {
            let command = Command::builder("HappyGroup", "HappyPath")
                .properties(test_properties())
                .run(|| async { Ok(true) })
                .build();

            let result = command.execute().await.unwrap();
            assert!(result);
            assert!(command.is_successful_execution());
            assert!(!command.is_failed_execution());
            assert!(!command.is_response_from_fallback());
            assert!(command.execution_time_ms() >= 0);
            assert_eq!(command.execution_events(), vec![EventType::Success]);

            let metrics = command.metrics();
            assert_eq!(metrics.rolling_count(EventType::Success), 1);
            assert_eq!(metrics.rolling_count(EventType::Failure), 0);
            assert_eq!(metrics.rolling_count(EventType::Timeout), 0);
            assert_eq!(metrics.rolling_count(EventType::FallbackSuccess), 0);
            assert_eq!(metrics.health_counts().error_percentage, 0);
        })
        .await;

    let summary = context.log().summary();
    assert!(
        summary.starts_with("HappyPath[Success]["),
        "unexpected summary: {summary}"
    );
    assert!(summary.ends_with("ms]"));
    context.shutdown();
}

#[tokio::test]
async fn breaker_trips_after_three_failures_and_short_circuits_the_fourth() {
    fn failing_command(n: u32) -> Command<bool> {
        Command::builder("TripGroup", "TripAfterThree")
            .properties(test_properties())
            .run(move || async move { Err(anyhow!("simulated dependency failure #{n}")) })
            .fallback(|| async { Ok(false) })
            .build()
    }

    for n in 0..3 {
        let command = failing_command(n);
        assert_eq!(command.execute().await.unwrap(), false);
        assert!(command.is_failed_execution());
        assert!(command.is_response_from_fallback());
    }

    let fourth = failing_command(3);
    assert!(fourth.is_circuit_breaker_open());
    assert_eq!(fourth.execute().await.unwrap(), false);
    assert!(fourth.is_response_short_circuited());
    assert!(!fourth.is_failed_execution());

    let metrics = fourth.metrics();
    assert_eq!(metrics.rolling_count(EventType::Failure), 3);
    assert_eq!(metrics.rolling_count(EventType::FallbackSuccess), 4);
    assert_eq!(metrics.rolling_count(EventType::ShortCircuited), 1);
}

#[tokio::test]
async fn timeout_falls_back_and_discards_the_late_result() {
    let command = Command::builder("TimeoutGroup", "TimeoutWithFallback")
        .properties(
            test_properties().with_execution_timeout(Duration::from_millis(50)),
        )
        .run(|| async {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            Ok(true)
        })
        .fallback(|| async { Ok(false) })
        .build();

    let result = command.execute().await.unwrap();
    assert_eq!(result, false);
    assert!(command.is_response_timed_out());
    assert!(command.is_response_from_fallback());
    assert!(!command.is_successful_execution());
    assert!(command.execution_time_ms() >= 50);

    let metrics = command.metrics();
    assert_eq!(metrics.rolling_count(EventType::Timeout), 1);
    assert_eq!(metrics.rolling_count(EventType::FallbackSuccess), 1);
    assert_eq!(metrics.rolling_count(EventType::Success), 0);

    // The body never gets to report a late success.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(metrics.rolling_count(EventType::Success), 0);
    assert_eq!(metrics.rolling_count(EventType::Timeout), 1);
}

#[tokio::test]
async fn late_completion_without_interrupt_never_records_success() {
    let command = Command::builder("TimeoutGroup2", "TimeoutNoInterrupt")
        .properties(
            test_properties()
                .with_execution_timeout(Duration::from_millis(50))
                .with_interrupt_on_timeout(false),
        )
        .run(|| async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(true)
        })
        .fallback(|| async { Ok(false) })
        .build();

    assert_eq!(command.execute().await.unwrap(), false);
    assert!(command.is_response_timed_out());

    // Let the abandoned body run to completion; its result is discarded.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let metrics = command.metrics();
    assert_eq!(metrics.rolling_count(EventType::Success), 0);
    assert_eq!(metrics.rolling_count(EventType::Timeout), 1);
}

#[tokio::test]
async fn saturated_pool_rejects_the_second_command() {
    let filler = Command::builder("RejectGroup", "PoolFiller")
        .properties(test_properties())
        .thread_pool_properties(
            ThreadPoolProperties::default()
                .with_core_size(1)
                .with_max_queue_size(-1),
        )
        .run(|| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(true)
        })
        .build();
    let queued = filler.queue().await.unwrap();

    let rejected = Command::builder("RejectGroup", "PoolRejected")
        .properties(test_properties())
        .run(|| async { Ok(true) })
        .fallback(|| async { Ok(false) })
        .build();
    assert_eq!(rejected.execute().await.unwrap(), false);
    assert!(rejected.is_response_rejected());
    assert!(rejected.is_response_from_fallback());

    let metrics = rejected.metrics();
    assert_eq!(metrics.rolling_count(EventType::ThreadPoolRejected), 1);
    assert_eq!(metrics.rolling_count(EventType::FallbackSuccess), 1);

    // The occupying command itself is unaffected.
    assert_eq!(queued.join().await.unwrap(), true);
    assert!(filler.is_successful_execution());
    assert!(!filler.is_response_rejected());
}

#[tokio::test]
async fn request_cache_deduplicates_by_cache_key() {
    static BODY_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn cached_command(cache_key: &str) -> Command<String> {
        let value = cache_key.to_string();
        Command::builder("CacheGroup", "CachedLookup")
            .properties(test_properties())
            .cache_key(cache_key)
            .run(move || async move {
                BODY_RUNS.fetch_add(1, Ordering::SeqCst);
                Ok(format!("value-{value}"))
            })
            .build()
    }

    let context = RequestContext::new();
    context
        .scope(async {
            let first = cached_command("A");
            assert_eq!(first.execute().await.unwrap(), "value-A");
            assert!(!first.is_response_from_cache());

            let second = cached_command("B");
            assert_eq!(second.execute().await.unwrap(), "value-B");

            let third = cached_command("A");
            assert_eq!(third.execute().await.unwrap(), "value-A");
            assert!(third.is_response_from_cache());
            assert!(third.is_successful_execution());
            assert_eq!(third.execution_time_ms(), -1);
            assert_eq!(
                third.execution_events(),
                vec![EventType::Success, EventType::ResponseFromCache]
            );

            assert_eq!(BODY_RUNS.load(Ordering::SeqCst), 2);
            assert_eq!(
                third.metrics().rolling_count(EventType::ResponseFromCache),
                1
            );
        })
        .await;
    context.shutdown();
}

#[tokio::test]
async fn breaker_recovers_through_a_half_open_probe() {
    fn recovery_command(fail: bool) -> Command<bool> {
        Command::builder("RecoveryGroup", "HalfOpenRecovery")
            .properties(test_properties())
            .run(move || async move {
                if fail {
                    Err(anyhow!("still broken"))
                } else {
                    Ok(true)
                }
            })
            .fallback(|| async { Ok(false) })
            .build()
    }

    for _ in 0..4 {
        assert_eq!(recovery_command(true).execute().await.unwrap(), false);
    }
    let tripped = recovery_command(true);
    assert!(tripped.is_circuit_breaker_open());
    assert_eq!(tripped.execute().await.unwrap(), false);
    assert!(tripped.is_response_short_circuited());

    // Past the sleep window the breaker admits a single probe while still
    // reporting open.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let probe = recovery_command(false);
    assert!(probe.is_circuit_breaker_open());
    assert_eq!(probe.execute().await.unwrap(), true);
    assert!(probe.is_successful_execution());
    assert!(!probe.is_response_short_circuited());

    // Closed again: everyone passes.
    let after = recovery_command(false);
    assert!(!after.is_circuit_breaker_open());
    assert_eq!(after.execute().await.unwrap(), true);
    assert!(after.is_successful_execution());
}

#[tokio::test]
async fn second_execution_fails_without_touching_metrics() {
    let command = Command::builder("SingleShotGroup", "SingleShot")
        .properties(test_properties())
        .run(|| async { Ok(1u32) })
        .build();

    assert_eq!(command.execute().await.unwrap(), 1);
    let success_count = command.metrics().rolling_count(EventType::Success);

    let err = command.execute().await.unwrap_err();
    assert!(matches!(err, CommandError::IllegalState(_)));
    assert_eq!(
        command.metrics().rolling_count(EventType::Success),
        success_count
    );
    assert_eq!(command.execution_events(), vec![EventType::Success]);
}

#[tokio::test]
async fn bad_request_bypasses_fallback_and_failure_accounting() {
    static FALLBACK_RAN: AtomicBool = AtomicBool::new(false);

    let context = RequestContext::new();
    context
        .scope(async {
            let command = Command::builder("BadRequestGroup", "BadRequestPassthrough")
                .properties(test_properties())
                .run(|| async { Err(BadRequest::new("id must be positive").into()) })
                .fallback(|| async {
                    FALLBACK_RAN.store(true, Ordering::SeqCst);
                    Ok(0u32)
                })
                .build();

            let err = command.execute().await.unwrap_err();
            assert!(err.is_bad_request());
            assert!(!FALLBACK_RAN.load(Ordering::SeqCst));
            assert!(!command.is_failed_execution());

            let metrics = command.metrics();
            assert_eq!(metrics.rolling_count(EventType::Failure), 0);
            assert_eq!(metrics.rolling_count(EventType::ExceptionThrown), 0);
            assert_eq!(metrics.rolling_count(EventType::FallbackSuccess), 0);
        })
        .await;
    // Bad requests still appear in the request log.
    assert_eq!(context.log().entries().len(), 1);
    context.shutdown();
}

#[tokio::test]
async fn fallback_disabled_surfaces_the_originating_failure_type() {
    let command = Command::builder("NoFallbackGroup", "FallbackDisabled")
        .properties(test_properties().with_fallback_enabled(false))
        .run(|| async { Err::<bool, _>(anyhow!("boom")) })
        .fallback(|| async { Ok(true) })
        .build();

    let err = command.execute().await.unwrap_err();
    assert_eq!(err.failure_type(), Some(FailureType::CommandFailure));
    let metrics = command.metrics();
    assert_eq!(metrics.rolling_count(EventType::Failure), 1);
    assert_eq!(metrics.rolling_count(EventType::ExceptionThrown), 1);
    assert_eq!(metrics.rolling_count(EventType::FallbackSuccess), 0);
}

#[tokio::test]
async fn missing_fallback_wraps_the_run_error() {
    let command = Command::builder("NoFallbackGroup2", "MissingFallback")
        .properties(test_properties())
        .run(|| async { Err::<bool, _>(anyhow!("dependency exploded")) })
        .build();

    let err = command.execute().await.unwrap_err();
    let CommandError::Runtime(failure) = err else {
        panic!("expected a runtime failure");
    };
    assert_eq!(failure.failure_type(), FailureType::CommandFailure);
    assert!(failure.cause().is_some());
    assert!(failure.fallback_cause().is_none());
    assert_eq!(
        command.metrics().rolling_count(EventType::FallbackFailure),
        1
    );
}

#[tokio::test]
async fn queue_raises_on_short_circuit_without_fallback() {
    let command = Command::builder("ForceOpenGroup", "ForcedOpenQueue")
        .properties(test_properties().with_force_open(true))
        .run(|| async { Ok(true) })
        .build();

    let err = match command.queue().await {
        Err(err) => err,
        Ok(_) => panic!("queue should raise when short-circuited without a fallback"),
    };
    assert_eq!(err.failure_type(), Some(FailureType::ShortCircuit));
    assert!(command.is_response_short_circuited());
}

#[tokio::test]
async fn queue_settles_through_the_future_when_fallback_supplies_a_value() {
    let command = Command::builder("ForceOpenGroup2", "ForcedOpenFallback")
        .properties(test_properties().with_force_open(true))
        .run(|| async { Ok(true) })
        .fallback(|| async { Ok(false) })
        .build();

    let queued = command.queue().await.unwrap();
    assert_eq!(queued.join().await.unwrap(), false);
    assert!(command.is_response_short_circuited());
    assert!(command.is_response_from_fallback());
}

#[tokio::test]
async fn queue_returns_a_live_future_for_thread_isolation() {
    let command = Command::builder("QueueGroup", "QueuedThread")
        .properties(test_properties())
        .run(|| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(7u32)
        })
        .build();

    let queued = command.queue().await.unwrap();
    assert_eq!(queued.join().await.unwrap(), 7);
    assert!(command.is_successful_execution());
}

#[tokio::test]
async fn semaphore_isolation_rejects_beyond_the_permit_count() {
    let properties = test_properties()
        .with_isolation_strategy(IsolationStrategy::Semaphore)
        .with_execution_semaphore_max(1);

    let slow = Command::builder("SemaphoreGroup", "SemaphoreBounded")
        .properties(properties.clone())
        .run(|| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(true)
        })
        .build();
    let slow_task = tokio::spawn(async move { slow.execute().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let rejected = Command::builder("SemaphoreGroup", "SemaphoreBounded")
        .properties(properties)
        .run(|| async { Ok(true) })
        .fallback(|| async { Ok(false) })
        .build();
    assert_eq!(rejected.execute().await.unwrap(), false);
    assert!(rejected.is_response_rejected());
    assert_eq!(
        rejected.metrics().rolling_count(EventType::SemaphoreRejected),
        1
    );

    assert_eq!(slow_task.await.unwrap().unwrap(), true);
}

#[tokio::test]
async fn saturated_fallback_semaphore_rejects_the_fallback() {
    fn failing(slow_fallback: bool) -> Command<bool> {
        Command::builder("FallbackSemGroup", "FallbackSemBounded")
            .properties(
                test_properties()
                    .with_request_volume_threshold(100)
                    .with_fallback_semaphore_max(1),
            )
            .run(|| async { Err(anyhow!("dependency down")) })
            .fallback(move || async move {
                if slow_fallback {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Ok(false)
            })
            .build()
    }

    let slow = failing(true);
    let slow_task = tokio::spawn(async move { slow.execute().await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let rejected = failing(false);
    let err = rejected.execute().await.unwrap_err();
    assert_eq!(
        err.failure_type(),
        Some(FailureType::FallbackSemaphoreRejected)
    );
    let events = rejected.execution_events();
    assert!(events.contains(&EventType::FallbackRejection));
    assert!(events.contains(&EventType::FallbackFailure));

    // The rejection marks only the rejection counter; fallback-failure
    // counts stay reserved for fallback bodies that ran and failed.
    let metrics = rejected.metrics();
    assert_eq!(metrics.rolling_count(EventType::FallbackRejection), 1);
    assert_eq!(metrics.rolling_count(EventType::FallbackFailure), 0);

    assert_eq!(slow_task.await.unwrap().unwrap(), false);
    assert_eq!(metrics.rolling_count(EventType::FallbackSuccess), 1);
    assert_eq!(metrics.rolling_count(EventType::FallbackFailure), 0);
}

#[tokio::test]
async fn semaphore_success_is_written_to_the_request_cache() {
    static BODY_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn semaphore_cached() -> Command<u32> {
        Command::builder("SemaphoreCacheGroup", "SemaphoreCached")
            .properties(
                test_properties().with_isolation_strategy(IsolationStrategy::Semaphore),
            )
            .cache_key("fixed")
            .run(|| async {
                BODY_RUNS.fetch_add(1, Ordering::SeqCst);
                Ok(99u32)
            })
            .build()
    }

    let context = RequestContext::new();
    context
        .scope(async {
            assert_eq!(semaphore_cached().execute().await.unwrap(), 99);
            let second = semaphore_cached();
            assert_eq!(second.execute().await.unwrap(), 99);
            assert!(second.is_response_from_cache());
            assert_eq!(BODY_RUNS.load(Ordering::SeqCst), 1);
        })
        .await;
    context.shutdown();
}

#[tokio::test]
async fn cache_key_without_a_context_is_an_illegal_state() {
    let command = Command::builder("NoContextGroup", "CacheNeedsContext")
        .properties(test_properties())
        .cache_key("orphan")
        .run(|| async { Ok(true) })
        .build();

    let err = command.execute().await.unwrap_err();
    assert!(matches!(err, CommandError::IllegalState(_)));
}

#[tokio::test]
async fn request_log_aggregates_repeated_failures() {
    let context = RequestContext::new();
    context
        .scope(async {
            for _ in 0..2 {
                let command = Command::builder("LogGroup", "LoggedFailure")
                    .properties(
                        test_properties().with_request_volume_threshold(100),
                    )
                    .run(|| async { Err::<bool, _>(anyhow!("nope")) })
                    .build();
                let _ = command.execute().await;
            }
        })
        .await;

    let summary = context.log().summary();
    assert!(
        summary.contains("LoggedFailure[Failure, FallbackFailure, ExceptionThrown["),
        "unexpected summary: {summary}"
    );
    assert!(summary.ends_with("x2"), "unexpected summary: {summary}");
    assert_eq!(summary, context.log().summary());
    context.shutdown();
}

#[tokio::test]
async fn disabled_request_cache_runs_every_body() {
    static BODY_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn uncached() -> Command<u32> {
        Command::builder("UncachedGroup", "UncachedLookup")
            .properties(test_properties().with_request_cache_enabled(false))
            .cache_key("same")
            .run(|| async {
                BODY_RUNS.fetch_add(1, Ordering::SeqCst);
                Ok(1u32)
            })
            .build()
    }

    let context = RequestContext::new();
    context
        .scope(async {
            uncached().execute().await.unwrap();
            uncached().execute().await.unwrap();
            assert_eq!(BODY_RUNS.load(Ordering::SeqCst), 2);
        })
        .await;
    context.shutdown();
}

#[tokio::test]
async fn concurrent_duplicates_share_one_thread_isolated_execution() {
    static BODY_RUNS: AtomicUsize = AtomicUsize::new(0);

    let context = RequestContext::new();

    fn shared(context: &Arc<RequestContext>) -> Command<u32> {
        Command::builder("SharedGroup", "SharedExecution")
            .properties(test_properties())
            .cache_key("dup")
            .context(Arc::clone(context))
            .run(|| async {
                BODY_RUNS.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(5u32)
            })
            .build()
    }

    let first = shared(&context);
    let second = shared(&context);
    let (a, b) = tokio::join!(first.execute(), second.execute());
    assert_eq!(a.unwrap(), 5);
    assert_eq!(b.unwrap(), 5);
    // The loser of the cache race waits on the winner's pending future.
    assert_eq!(BODY_RUNS.load(Ordering::SeqCst), 1);
    assert!(first.is_response_from_cache() || second.is_response_from_cache());
    context.shutdown();
}
