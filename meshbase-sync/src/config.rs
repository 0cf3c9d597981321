//! Tunables of a NetMeshBase and its proxies.

use meshbase_types::{CoherenceDefaults, CoherenceSpecification};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a NetMeshBase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetMeshBaseConfig {
    /// Timeout for one request/response exchange (ms).
    pub request_timeout_ms: u64,
    /// Retry policy for timeouts and network errors.
    pub retry: RetryPolicy,
    /// How often the background task looks for due replicas (ms).
    pub refresh_tick_ms: u64,
    /// Consecutive channel failures after which a proxy is discarded.
    pub max_consecutive_failures: u32,
    /// Unconfirmed locks are reclaimed after this long (ms). `None` leaves
    /// them to `force_obtain_locks`.
    pub lock_reclaim_delay_ms: Option<u64>,
    /// Whether requests for multi-hop paths are relayed onwards.
    pub relay_enabled: bool,
    /// Coherence used where an access specification names none.
    pub coherence: CoherenceDefaults,
    /// Responses kept per partner for replaying retried requests.
    pub response_cache_size: usize,
}

impl Default for NetMeshBaseConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
            refresh_tick_ms: 1_000,
            max_consecutive_failures: 5,
            lock_reclaim_delay_ms: Some(300_000),
            relay_enabled: true,
            coherence: CoherenceDefaults::default(),
            response_cache_size: 16,
        }
    }
}

impl NetMeshBaseConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn refresh_tick(&self) -> Duration {
        Duration::from_millis(self.refresh_tick_ms)
    }

    #[must_use]
    pub const fn default_coherence(&self) -> CoherenceSpecification {
        self.coherence.coherence()
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound of the random delay added to each backoff.
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
            jitter_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retrying after `failed_attempts` failures.
    #[must_use]
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(20);
        let base = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        Duration::from_millis(base + jitter)
    }
}
