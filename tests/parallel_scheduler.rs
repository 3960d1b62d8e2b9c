//! Worker-pool scheduling end to end
//!
//! These tests drive the global scheduler singleton and therefore run
//! serially.

use std::time::{Duration, Instant};

use serde_json::{json, Value};
use serial_test::serial;

use routines::{
    get_parallel_scheduler, initialize_parallel_scheduler, proxy, shutdown_parallel_scheduler,
    Context, SchedulerConfig,
};

fn pool_config(threads: usize) -> SchedulerConfig {
    SchedulerConfig {
        thread_count: Some(threads),
        timeout_ms: 10_000,
        ..Default::default()
    }
}

fn cpu_sum(upper: u64) -> u64 {
    let mut acc = 0u64;
    for i in 0..upper {
        acc = acc.wrapping_add(i ^ (i >> 3));
    }
    acc
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn parallel_sums_return_in_input_order() {
    shutdown_parallel_scheduler().await;
    let scheduler = initialize_parallel_scheduler(pool_config(4)).unwrap();
    scheduler
        .register("cpu_sum", |args| {
            let upper = args.first().and_then(Value::as_u64).unwrap_or(0);
            Ok(json!(cpu_sum(upper)))
        })
        .unwrap();

    const UPPER: u64 = 3_000_000;

    // Single-job baseline.
    let serial_started = Instant::now();
    let baseline = scheduler
        .execute("cpu_sum", vec![json!(UPPER)], None)
        .await
        .unwrap();
    let serial_elapsed = serial_started.elapsed();

    // Four jobs at once, results in input order.
    let parallel_started = Instant::now();
    let results = futures::future::join_all((0..4).map(|i| {
        let scheduler = scheduler.clone();
        async move {
            scheduler
                .execute("cpu_sum", vec![json!(UPPER + i)], None)
                .await
        }
    }))
    .await;
    let parallel_elapsed = parallel_started.elapsed();

    let values: Vec<u64> = results
        .into_iter()
        .map(|r| r.unwrap().as_u64().unwrap())
        .collect();
    assert_eq!(values[0], baseline.as_u64().unwrap());
    assert_eq!(values.len(), 4);
    // Distinct inputs give distinct sums, proving order was preserved.
    for (i, value) in values.iter().enumerate() {
        assert_eq!(*value, cpu_sum(UPPER + i as u64));
    }

    // Coarse parallelism check: four jobs on four workers must come in
    // well under four times the single-job wall time.
    assert!(
        parallel_elapsed < serial_elapsed * 3,
        "parallel {parallel_elapsed:?} vs serial {serial_elapsed:?}"
    );

    shutdown_parallel_scheduler().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn worker_job_observes_context_cancellation() {
    shutdown_parallel_scheduler().await;
    let scheduler = initialize_parallel_scheduler(pool_config(2)).unwrap();

    scheduler
        .register("poll_until_cancelled", |args| {
            let raw = args.first().cloned().unwrap_or(Value::Null);
            let id: routines::ContextId = serde_json::from_value(raw)
                .map_err(|e| routines::RuntimeError::Internal(e.to_string()))?;
            // Poll the snapshot board until the cancellation propagates.
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if let Some(code) = proxy::context_err(&id) {
                    return Ok(json!(code));
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(json!("never-cancelled"))
        })
        .unwrap();

    let (ctx, cancel) = Context::with_cancel(&Context::background());
    scheduler.track_context(&ctx);

    let exec_scheduler = scheduler.clone();
    let ctx_id = serde_json::to_value(ctx.id()).unwrap();
    let job = tokio::spawn(async move {
        exec_scheduler
            .execute("poll_until_cancelled", vec![ctx_id], None)
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let observed = job.await.unwrap().unwrap();
    assert_eq!(observed, json!("context.cancelled"));

    shutdown_parallel_scheduler().await;
}

#[tokio::test]
#[serial]
async fn scheduler_survives_job_errors_and_keeps_serving() {
    shutdown_parallel_scheduler().await;
    let scheduler = initialize_parallel_scheduler(pool_config(2)).unwrap();
    scheduler
        .register("flaky", |args| {
            if args.first().and_then(Value::as_bool).unwrap_or(false) {
                Err(routines::RuntimeError::Internal("requested failure".to_string()))
            } else {
                Ok(json!("fine"))
            }
        })
        .unwrap();

    let err = scheduler
        .execute("flaky", vec![json!(true)], None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "internal");

    let ok = scheduler
        .execute("flaky", vec![json!(false)], None)
        .await
        .unwrap();
    assert_eq!(ok, json!("fine"));

    let stats = scheduler.stats();
    assert_eq!(stats.dispatched, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);

    shutdown_parallel_scheduler().await;
}

#[tokio::test]
#[serial]
async fn get_returns_none_after_shutdown() {
    shutdown_parallel_scheduler().await;
    initialize_parallel_scheduler(pool_config(2)).unwrap();
    assert!(get_parallel_scheduler().is_some());
    shutdown_parallel_scheduler().await;
    assert!(get_parallel_scheduler().is_none());
}
