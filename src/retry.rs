//! Retry/CSMA helper.
//!
//! Two orthogonal layers wrap every transmission:
//!
//! 1. The CSMA layer reacts to a busy medium with a jittered exponential
//!    backoff, giving up after `max_csma_backoffs` attempts.
//! 2. The retransmission layer reacts to a missing acknowledgement, giving
//!    up after `max_retransmissions` reissues. A no-ack implies the medium
//!    was clear, so it also counts as the CSMA layer's success edge.
//!
//! The state machine treats both as opaque: it reports the failure kind and
//! acts on the returned [`RetryDecision`].

use crate::config::RetryConfig;
use log::debug;
use std::time::Duration;

/// What the core should do with the current transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "ignoring a retry decision leaves the transmission in limbo"]
pub enum RetryDecision {
    /// Reissue the frame after the backoff elapses. The radio stays marked
    /// busy until the next completion event.
    Retry {
        /// Backoff before the reissue.
        backoff: Duration,
    },
    /// Budget exhausted; abandon the transmission.
    GiveUp,
}

/// Per-transmission retry state for both layers.
pub struct LinkRetry {
    config: RetryConfig,
    csma_backoffs: u8,
    retransmissions: u8,
    /// LCG state for backoff jitter; host-testable without an RNG crate.
    rng_state: u32,
}

impl LinkRetry {
    /// Create a helper with the given budgets.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            csma_backoffs: 0,
            retransmissions: 0,
            rng_state: 0x12345678,
        }
    }

    /// Seed the backoff jitter. Zero is mapped to one to keep the LCG alive.
    pub fn seed(&mut self, seed: u32) {
        self.rng_state = if seed == 0 { 1 } else { seed };
    }

    /// CSMA failure edge: the medium was sensed busy.
    pub fn on_medium_busy(&mut self) -> RetryDecision {
        if self.csma_backoffs >= self.config.max_csma_backoffs {
            debug!(
                "csma budget exhausted after {} backoffs",
                self.csma_backoffs
            );
            self.reset();
            return RetryDecision::GiveUp;
        }
        let backoff = self.calculate_backoff(self.csma_backoffs);
        self.csma_backoffs += 1;
        debug!(
            "medium busy, backoff {:?} (attempt {}/{})",
            backoff, self.csma_backoffs, self.config.max_csma_backoffs
        );
        RetryDecision::Retry { backoff }
    }

    /// Retransmission failure edge: the frame went out but was not acked.
    ///
    /// Reaching the peer means the CSMA layer succeeded, so its counter
    /// starts over for the reissue.
    pub fn on_no_ack(&mut self) -> RetryDecision {
        self.csma_backoffs = 0;
        if self.retransmissions >= self.config.max_retransmissions {
            debug!(
                "retransmission budget exhausted after {} reissues",
                self.retransmissions
            );
            self.reset();
            return RetryDecision::GiveUp;
        }
        let backoff = self.calculate_backoff(self.retransmissions);
        self.retransmissions += 1;
        debug!(
            "no ack, retransmit after {:?} ({}/{})",
            backoff, self.retransmissions, self.config.max_retransmissions
        );
        RetryDecision::Retry { backoff }
    }

    /// Success edge for both layers.
    pub fn on_success(&mut self) {
        self.reset();
    }

    /// Clear all per-transmission counters.
    pub fn reset(&mut self) {
        self.csma_backoffs = 0;
        self.retransmissions = 0;
    }

    /// Attempts consumed on the current transmission, for diagnostics.
    pub fn attempts(&self) -> (u8, u8) {
        (self.csma_backoffs, self.retransmissions)
    }

    /// Random backoff with a window that doubles per attempt, capped at
    /// `max_backoff_ms`.
    fn calculate_backoff(&mut self, attempt: u8) -> Duration {
        let window = self
            .config
            .min_backoff_ms
            .saturating_mul(1 << (attempt as u32 + 1).min(10));
        let window = window.min(self.config.max_backoff_ms);

        let range = window.saturating_sub(self.config.min_backoff_ms);
        if range == 0 {
            return Duration::from_millis(self.config.min_backoff_ms as u64);
        }

        let random = self.next_random();
        Duration::from_millis((self.config.min_backoff_ms + random % range) as u64)
    }

    /// LCG with Numerical Recipes parameters; good enough for jitter.
    fn next_random(&mut self) -> u32 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(1664525)
            .wrapping_add(1013904223);
        self.rng_state
    }
}
