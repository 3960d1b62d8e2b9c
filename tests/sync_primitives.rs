//! Cross-routine behavior of the synchronization primitives

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use routines::{
    Context, MutexConfig, Once, RwMutex, RwMutexConfig, Semaphore, SemaphoreConfig, Timeout,
    WaitGroup,
};

#[tokio::test]
async fn rwmutex_late_readers_wait_for_the_queued_writer() {
    let rw = RwMutex::new(RwMutexConfig::default()).unwrap();
    let log: Arc<parking_lot::Mutex<Vec<&'static str>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));

    // Three readers hold the lock.
    for _ in 0..3 {
        rw.read_lock().await.unwrap();
    }

    let rw_writer = rw.clone();
    let log_writer = log.clone();
    let writer = tokio::spawn(async move {
        rw_writer.write_lock_timeout(Timeout::Millis(2000)).await.unwrap();
        log_writer.lock().push("writer");
        rw_writer.write_unlock().unwrap();
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Two late readers arrive while the writer waits.
    let mut late = Vec::new();
    for _ in 0..2 {
        let rw_reader = rw.clone();
        let log_reader = log.clone();
        late.push(tokio::spawn(async move {
            rw_reader.read_lock_timeout(Timeout::Millis(2000)).await.unwrap();
            log_reader.lock().push("late-reader");
            rw_reader.read_unlock().unwrap();
        }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Nothing has run yet: the writer is blocked by the held read locks,
    // the late readers queue behind the writer.
    assert!(log.lock().is_empty());

    for _ in 0..3 {
        rw.read_unlock().unwrap();
    }
    writer.await.unwrap();
    for handle in late {
        handle.await.unwrap();
    }

    let order = log.lock().clone();
    assert_eq!(order, vec!["writer", "late-reader", "late-reader"]);
}

#[tokio::test]
async fn semaphore_bounds_concurrency() {
    let sem = Semaphore::new(SemaphoreConfig {
        permits: 2,
        timeout_ms: 2000,
        name: None,
    })
    .unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let sem = sem.clone();
        let active = active.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            sem.acquire().await.unwrap();
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            sem.release();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(sem.available(), 2);
}

#[tokio::test]
async fn waitgroup_coordinates_a_fan_out() {
    let wg = WaitGroup::new();
    let done = Arc::new(AtomicUsize::new(0));

    wg.add(5).unwrap();
    for _ in 0..5 {
        let wg = wg.clone();
        let done = done.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            done.fetch_add(1, Ordering::SeqCst);
            wg.done().unwrap();
        });
    }

    wg.wait_timeout(Timeout::Millis(2000)).await.unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn once_under_contention_runs_single_entry() {
    let once: Once<u64> = Once::new();
    let entries = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let once = once.clone();
        let entries = entries.clone();
        handles.push(tokio::spawn(async move {
            once.call(|| async {
                entries.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(7)
            })
            .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 7);
    }
    assert_eq!(entries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn mutex_guards_a_critical_section_across_routines() {
    let mutex = routines::Mutex::new(MutexConfig::default()).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let in_section = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let mutex = mutex.clone();
        let counter = counter.clone();
        let in_section = in_section.clone();
        handles.push(tokio::spawn(async move {
            mutex.lock_timeout(Timeout::Millis(5000)).await.unwrap();
            assert_eq!(in_section.fetch_add(1, Ordering::SeqCst), 0);
            tokio::task::yield_now().await;
            counter.fetch_add(1, Ordering::SeqCst);
            in_section.fetch_sub(1, Ordering::SeqCst);
            mutex.unlock().unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 10);
    assert!(!mutex.is_locked());
}

#[tokio::test]
async fn context_deadline_attribution_is_precise() {
    // Deadline-triggered cancellation reports deadline-exceeded...
    let (timed, _cancel) =
        Context::with_timeout(&Context::background(), Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(
        timed.err().map(|e| e.code()),
        Some("context.deadline-exceeded")
    );

    // ...and explicit cancellation reports cancelled, even with a deadline.
    let (cancelled, cancel) =
        Context::with_timeout(&Context::background(), Duration::from_secs(60));
    cancel.cancel();
    assert_eq!(cancelled.err().map(|e| e.code()), Some("context.cancelled"));
}
