//! Monotonic time source and cooperative delay
//!
//! All internal deadlines are computed against [`Instant`] so wall-clock
//! adjustments never fire or starve a timer. Epoch milliseconds exist only
//! for wire records and telemetry.

use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Monotonic now.
pub fn now() -> Instant {
    Instant::now()
}

/// Milliseconds elapsed since the first call into this module.
pub fn monotonic_ms() -> u64 {
    let start = *PROCESS_START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// Milliseconds since the Unix epoch, for wire records.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Cooperative sleep. Suspends the calling routine without blocking the thread.
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// Cooperative sleep in milliseconds.
pub async fn sleep_ms(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_decreases() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }

    #[tokio::test]
    async fn sleep_ms_waits_at_least_requested() {
        let start = now();
        sleep_ms(20).await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
