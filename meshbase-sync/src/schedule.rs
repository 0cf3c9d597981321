//! Refresh scheduling of replicas under a [`CoherenceSpecification`].
//!
//! The schedule only decides *when* a replica would like fresh data. A
//! refresh that fails leaves it untouched; coping with failures is the
//! channel's retry policy.

use meshbase_types::CoherenceSpecification;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Wall-clock milliseconds that advance with the tokio clock, so paused
/// test time moves schedules too.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    base_ms: u64,
    origin: Instant,
}

impl Clock {
    #[must_use]
    pub fn new() -> Self {
        let base_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self {
            base_ms: u64::try_from(base_ms).unwrap_or(u64::MAX),
            origin: Instant::now(),
        }
    }

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        let elapsed = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.base_ms.saturating_add(elapsed)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    /// Nothing to do yet.
    Fresh,
    /// The next check time has passed.
    Due,
    /// No further checks.
    Terminal,
}

/// Next-check bookkeeping for one replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshSchedule {
    coherence: CoherenceSpecification,
    delay_ms: u64,
    /// `None` once terminal.
    next_check_ms: Option<u64>,
}

impl RefreshSchedule {
    /// Schedule for a replica obtained at `now_ms`.
    #[must_use]
    pub fn new(coherence: CoherenceSpecification, now_ms: u64) -> Self {
        let delay_ms = match coherence {
            CoherenceSpecification::OneTimeOnly => 0,
            CoherenceSpecification::Periodic { period_ms } => period_ms,
            CoherenceSpecification::AdaptivePeriodic {
                fallback_delay_ms, ..
            } => fallback_delay_ms,
        };
        let next_check_ms =
            (!coherence.is_one_time_only()).then(|| now_ms.saturating_add(delay_ms));
        Self {
            coherence,
            delay_ms,
            next_check_ms,
        }
    }

    #[must_use]
    pub const fn coherence(&self) -> CoherenceSpecification {
        self.coherence
    }

    /// Delay used for the most recent scheduling.
    #[must_use]
    pub const fn current_delay_ms(&self) -> u64 {
        self.delay_ms
    }

    #[must_use]
    pub const fn next_check_ms(&self) -> Option<u64> {
        self.next_check_ms
    }

    #[must_use]
    pub fn state(&self, now_ms: u64) -> RefreshState {
        match self.next_check_ms {
            None => RefreshState::Terminal,
            Some(next) if now_ms >= next => RefreshState::Due,
            Some(_) => RefreshState::Fresh,
        }
    }

    /// The partner reported a change.
    pub fn on_changed(&mut self, now_ms: u64) {
        match self.coherence {
            CoherenceSpecification::OneTimeOnly => self.next_check_ms = None,
            CoherenceSpecification::Periodic { period_ms } => {
                self.delay_ms = period_ms;
                self.next_check_ms = Some(now_ms.saturating_add(period_ms));
            }
            CoherenceSpecification::AdaptivePeriodic {
                fallback_delay_ms, ..
            } => {
                self.delay_ms = fallback_delay_ms;
                self.next_check_ms = Some(now_ms.saturating_add(fallback_delay_ms));
            }
        }
    }

    /// The partner reported no change.
    pub fn on_unchanged(&mut self, now_ms: u64) {
        match self.coherence {
            CoherenceSpecification::OneTimeOnly => self.next_check_ms = None,
            CoherenceSpecification::Periodic { period_ms } => {
                self.next_check_ms = Some(now_ms.saturating_add(period_ms));
            }
            CoherenceSpecification::AdaptivePeriodic {
                max_delay_ms,
                adaptive_factor,
                ..
            } => {
                #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let mut grown = (self.delay_ms as f64 * adaptive_factor).round() as u64;
                // Small delays must still grow towards the maximum.
                if adaptive_factor > 1.0 {
                    grown = grown.max(self.delay_ms.saturating_add(1));
                }
                self.delay_ms = grown.min(max_delay_ms);
                self.next_check_ms = Some(now_ms.saturating_add(self.delay_ms));
            }
        }
    }

    /// Makes the replica due immediately, unless terminal.
    pub fn expire(&mut self, now_ms: u64) {
        if self.next_check_ms.is_some() {
            self.next_check_ms = Some(now_ms);
        }
    }
}
