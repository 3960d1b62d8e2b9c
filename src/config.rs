//! Typed configuration for every primitive
//!
//! Each primitive takes a config struct whose `Default` carries the
//! documented defaults. Scheduler-level settings can additionally be
//! overridden from `ROUTINES_*` environment variables.

use serde::{Deserialize, Serialize};

use crate::error::RuntimeResult;
use crate::validate::{self, Timeout};

/// Channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Buffer capacity; 0 means rendezvous.
    pub buffer_size: usize,
    /// Default timeout for blocking send/receive, in milliseconds.
    pub timeout_ms: i64,
    /// Optional debug name.
    pub name: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            buffer_size: 0,
            timeout_ms: 1000,
            name: None,
        }
    }
}

impl ChannelConfig {
    /// Buffered channel with the given capacity.
    pub fn buffered(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> RuntimeResult<(usize, Timeout)> {
        let size = validate::validate_buffer_size(self.buffer_size)?;
        let timeout = Timeout::from_millis(self.timeout_ms)?;
        Ok((size, timeout))
    }
}

/// Mutex configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutexConfig {
    /// Default lock-acquisition timeout, in milliseconds.
    pub timeout_ms: i64,
    pub name: Option<String>,
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            name: None,
        }
    }
}

impl MutexConfig {
    pub fn validate(&self) -> RuntimeResult<Timeout> {
        Timeout::from_millis(self.timeout_ms)
    }
}

/// Read-write mutex configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RwMutexConfig {
    /// Default read- and write-lock timeout, in milliseconds.
    pub timeout_ms: i64,
    /// Cap on concurrent readers.
    pub max_readers: usize,
    pub name: Option<String>,
}

impl Default for RwMutexConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            max_readers: 1_000_000,
            name: None,
        }
    }
}

impl RwMutexConfig {
    pub fn validate(&self) -> RuntimeResult<Timeout> {
        Timeout::from_millis(self.timeout_ms)
    }
}

/// Semaphore configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemaphoreConfig {
    /// Number of permits.
    pub permits: usize,
    /// Default acquire timeout, in milliseconds.
    pub timeout_ms: i64,
    pub name: Option<String>,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            permits: 1,
            timeout_ms: 2000,
            name: None,
        }
    }
}

impl SemaphoreConfig {
    pub fn permits(permits: usize) -> Self {
        Self {
            permits,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> RuntimeResult<(usize, Timeout)> {
        let permits = validate::validate_permits(self.permits)?;
        let timeout = Timeout::from_millis(self.timeout_ms)?;
        Ok((permits, timeout))
    }
}

/// Retry configuration for `go_with_retry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds; doubles per attempt.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

/// Worker-balancing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancingStrategy {
    /// Rotate through healthy workers.
    RoundRobin,
    /// Pick the healthy worker with the lowest tracked load.
    LeastBusy,
    /// Probabilistic pick, weight proportional to `100 - load`.
    Weighted,
}

/// Parallel scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Dispatch registered functions to OS worker threads.
    pub use_worker_threads: bool,
    /// Worker-thread count; `None` sizes the pool as max(2, min(8, cpus)).
    pub thread_count: Option<usize>,
    /// Advisory; pinning is best-effort and may be ignored by the platform.
    pub cpu_affinity: bool,
    /// Advisory; reserved for a future shared-memory transport.
    pub shared_memory: bool,
    /// Worker execute timeout, in milliseconds.
    pub timeout_ms: i64,
    /// Balancing strategy for dispatch.
    pub strategy: BalancingStrategy,
    /// Restart a dead worker under the same id.
    pub auto_restart: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            use_worker_threads: true,
            thread_count: None,
            cpu_affinity: false,
            shared_memory: false,
            timeout_ms: 5000,
            strategy: BalancingStrategy::RoundRobin,
            auto_restart: true,
        }
    }
}

impl SchedulerConfig {
    /// Resolve the pool size: explicit count, or max(2, min(8, cpus)).
    pub fn resolved_thread_count(&self) -> RuntimeResult<usize> {
        match self.thread_count {
            Some(n) => validate::validate_thread_count(n),
            None => Ok(num_cpus::get().clamp(2, 8)),
        }
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        self.resolved_thread_count()?;
        Timeout::from_millis(self.timeout_ms)?;
        Ok(())
    }

    /// Apply `ROUTINES_*` environment overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("ROUTINES_USE_WORKER_THREADS") {
            if let Ok(flag) = val.parse::<bool>() {
                self.use_worker_threads = flag;
            }
        }
        if let Ok(val) = std::env::var("ROUTINES_THREAD_COUNT") {
            if val == "auto" {
                self.thread_count = None;
            } else if let Ok(n) = val.parse::<usize>() {
                self.thread_count = Some(n);
            }
        }
        if let Ok(val) = std::env::var("ROUTINES_TIMEOUT_MS") {
            if let Ok(ms) = val.parse::<i64>() {
                self.timeout_ms = ms;
            }
        }
        self
    }
}
