//! Ingress validation for durations, buffer sizes, and concurrency parameters
//!
//! Validation happens once at the public surface; the primitives themselves
//! assume validated input. Malformed parameters fail with the
//! `validation.*` error family before any state is touched.

use std::time::Duration;

use crate::error::{RuntimeError, RuntimeResult};

/// Upper bound for any finite timeout (24 hours).
pub const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// Upper bound for a channel buffer.
pub const MAX_BUFFER_SIZE: usize = 1 << 20;

/// Upper bound for semaphore permits.
pub const MAX_PERMITS: usize = 1 << 30;

/// Upper bound for worker threads in a pool.
pub const MAX_THREADS: usize = 128;

/// A validated timeout.
///
/// `-1` on the untyped surface maps to [`Timeout::Infinite`], `0` collapses
/// to the non-blocking variant of the operation where one exists, and a
/// positive value is capped at [`MAX_TIMEOUT_MS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait forever.
    Infinite,
    /// Do not wait at all; take the try path.
    NonBlocking,
    /// Wait at most this many milliseconds.
    Millis(u64),
}

impl Timeout {
    /// Validate a raw millisecond count (`-1` = infinite, `0` = non-blocking).
    pub fn from_millis(millis: i64) -> RuntimeResult<Self> {
        match millis {
            -1 => Ok(Self::Infinite),
            0 => Ok(Self::NonBlocking),
            m if m < -1 => Err(RuntimeError::InvalidTimeout {
                reason: format!("{m} is negative (only -1 means infinite)"),
            }),
            m if m as u64 > MAX_TIMEOUT_MS => Err(RuntimeError::InvalidTimeout {
                reason: format!("{m}ms exceeds the {MAX_TIMEOUT_MS}ms cap"),
            }),
            m => Ok(Self::Millis(m as u64)),
        }
    }

    /// The finite wait duration, if any.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Infinite | Self::NonBlocking => None,
            Self::Millis(m) => Some(Duration::from_millis(*m)),
        }
    }

    /// Milliseconds for error reporting (`0` for the non-finite variants).
    pub fn millis(&self) -> u64 {
        match self {
            Self::Infinite | Self::NonBlocking => 0,
            Self::Millis(m) => *m,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Millis((d.as_millis() as u64).min(MAX_TIMEOUT_MS))
    }
}

/// Validate a channel buffer size. Zero means rendezvous.
pub fn validate_buffer_size(size: usize) -> RuntimeResult<usize> {
    if size > MAX_BUFFER_SIZE {
        return Err(RuntimeError::InvalidBufferSize {
            reason: format!("{size} exceeds the {MAX_BUFFER_SIZE} cap"),
        });
    }
    Ok(size)
}

/// Validate a semaphore permit count. At least one permit is required.
pub fn validate_permits(permits: usize) -> RuntimeResult<usize> {
    if permits == 0 {
        return Err(RuntimeError::InvalidConcurrency {
            reason: "semaphore needs at least one permit".to_string(),
        });
    }
    if permits > MAX_PERMITS {
        return Err(RuntimeError::InvalidConcurrency {
            reason: format!("{permits} permits exceeds the {MAX_PERMITS} cap"),
        });
    }
    Ok(permits)
}

/// Validate a worker-thread count.
pub fn validate_thread_count(threads: usize) -> RuntimeResult<usize> {
    if threads == 0 {
        return Err(RuntimeError::InvalidConcurrency {
            reason: "thread count must be at least 1".to_string(),
        });
    }
    if threads > MAX_THREADS {
        return Err(RuntimeError::InvalidConcurrency {
            reason: format!("{threads} threads exceeds the {MAX_THREADS} cap"),
        });
    }
    Ok(threads)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_sentinels() {
        assert_eq!(Timeout::from_millis(-1), Ok(Timeout::Infinite));
        assert_eq!(Timeout::from_millis(0), Ok(Timeout::NonBlocking));
        assert_eq!(Timeout::from_millis(250), Ok(Timeout::Millis(250)));
    }

    #[test]
    fn timeout_rejects_malformed() {
        assert_eq!(
            Timeout::from_millis(-2).map_err(|e| e.code()),
            Err("validation.timeout")
        );
        assert_eq!(
            Timeout::from_millis(MAX_TIMEOUT_MS as i64 + 1).map_err(|e| e.code()),
            Err("validation.timeout")
        );
    }

    #[test]
    fn buffer_size_bounds() {
        assert_eq!(validate_buffer_size(0), Ok(0));
        assert_eq!(validate_buffer_size(3), Ok(3));
        assert!(validate_buffer_size(MAX_BUFFER_SIZE + 1).is_err());
    }

    #[test]
    fn permits_bounds() {
        assert!(validate_permits(0).is_err());
        assert_eq!(validate_permits(4), Ok(4));
        assert!(validate_permits(MAX_PERMITS + 1).is_err());
    }

    #[test]
    fn thread_count_bounds() {
        assert!(validate_thread_count(0).is_err());
        assert_eq!(validate_thread_count(8), Ok(8));
        assert!(validate_thread_count(MAX_THREADS + 1).is_err());
    }
}
