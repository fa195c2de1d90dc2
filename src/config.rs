//! MAC configuration.
//!
//! All duty-cycling knobs live here: the sleep interval range, the listen
//! window, queue and mailbox bounds, and the retry budgets. The sleep
//! interval doubles on idle cycles, so `interval_max` must be an exact
//! power-of-two multiple of `interval_min`.

use std::time::Duration;

/// Configuration for the duty-cycling MAC layer.
#[derive(Debug, Clone, Copy)]
pub struct MacConfig {
    /// Minimum sleep interval between wakeups.
    ///
    /// A productive cycle (data sent or received) resets the interval back
    /// to this value.
    pub interval_min: Duration,

    /// Maximum sleep interval. Must equal `interval_min << k` for some
    /// integer `k <= 31`.
    pub interval_max: Duration,

    /// Listen window kept open after a beacon is answered with the
    /// pending-data bit.
    pub wakeup_interval: Duration,

    /// Transmit queue capacity. Frames arriving while the queue is full are
    /// dropped and the send fails.
    pub queue_capacity: usize,

    /// Mailbox depth for the event loop.
    pub mailbox_depth: usize,

    /// How many times a deferred retransmission may repost itself before it
    /// counts as retry exhaustion.
    pub max_deferrals: u8,

    /// CSMA / retransmission budgets.
    pub retry: RetryConfig,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            interval_min: Duration::from_millis(100),
            // 100 ms << 10
            interval_max: Duration::from_millis(102_400),
            wakeup_interval: Duration::from_millis(250),
            queue_capacity: 128,
            mailbox_depth: 64,
            max_deferrals: 4,
            retry: RetryConfig::default(),
        }
    }
}

impl MacConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_min.is_zero() {
            return Err(ConfigError::Invalid("interval_min must be > 0"));
        }
        if self.interval_max < self.interval_min {
            return Err(ConfigError::Invalid(
                "interval_max must be >= interval_min",
            ));
        }
        match self.interval_shift() {
            Some(shift) if shift <= 31 => {}
            Some(_) => {
                return Err(ConfigError::Invalid(
                    "interval_max must be within 31 doublings of interval_min",
                ));
            }
            None => {
                return Err(ConfigError::Invalid(
                    "interval_max must be interval_min << k for integer k",
                ));
            }
        }
        if self.wakeup_interval.is_zero() {
            return Err(ConfigError::Invalid("wakeup_interval must be > 0"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be > 0"));
        }
        if self.mailbox_depth == 0 {
            return Err(ConfigError::Invalid("mailbox_depth must be > 0"));
        }
        self.retry.validate()
    }

    /// The `k` for which `interval_max == interval_min << k`, if one exists.
    pub(crate) fn interval_shift(&self) -> Option<u32> {
        let min = self.interval_min.as_millis() as u64;
        let max = self.interval_max.as_millis() as u64;
        if min == 0 || max % min != 0 {
            return None;
        }
        let ratio = max / min;
        if !ratio.is_power_of_two() {
            return None;
        }
        Some(ratio.trailing_zeros())
    }
}

/// Budgets for the two retry layers.
///
/// The CSMA layer handles a busy medium with a jittered exponential backoff;
/// the retransmission layer handles missing acknowledgements. The two are
/// orthogonal: a medium-busy retry does not consume a retransmission.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Maximum CSMA backoffs for one transmission before giving up.
    pub max_csma_backoffs: u8,

    /// Maximum retransmissions after missing acknowledgements.
    pub max_retransmissions: u8,

    /// Minimum backoff time in milliseconds.
    pub min_backoff_ms: u32,

    /// Maximum backoff time in milliseconds (caps exponential growth).
    pub max_backoff_ms: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_csma_backoffs: 5,
            max_retransmissions: 3,
            min_backoff_ms: 8,
            max_backoff_ms: 256,
        }
    }
}

impl RetryConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_csma_backoffs == 0 {
            return Err(ConfigError::Invalid("max_csma_backoffs must be > 0"));
        }
        if self.max_retransmissions == 0 {
            return Err(ConfigError::Invalid("max_retransmissions must be > 0"));
        }
        if self.min_backoff_ms == 0 {
            return Err(ConfigError::Invalid("min_backoff_ms must be > 0"));
        }
        if self.max_backoff_ms < self.min_backoff_ms {
            return Err(ConfigError::Invalid(
                "max_backoff_ms must be >= min_backoff_ms",
            ));
        }
        Ok(())
    }
}

/// Error type for configuration validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid configuration parameter.
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(msg) => write!(f, "invalid MAC config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MacConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.interval_shift(), Some(10));
    }

    #[test]
    fn test_zero_interval_min_rejected() {
        let config = MacConfig {
            interval_min: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_max_below_min_rejected() {
        let config = MacConfig {
            interval_min: Duration::from_millis(200),
            interval_max: Duration::from_millis(100),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_non_power_of_two_ratio_rejected() {
        let config = MacConfig {
            interval_min: Duration::from_millis(100),
            interval_max: Duration::from_millis(300),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_non_multiple_ratio_rejected() {
        let config = MacConfig {
            interval_min: Duration::from_millis(100),
            interval_max: Duration::from_millis(250),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_equal_min_max_allowed() {
        let config = MacConfig {
            interval_min: Duration::from_millis(100),
            interval_max: Duration::from_millis(100),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.interval_shift(), Some(0));
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let config = MacConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_mailbox_depth_rejected() {
        let config = MacConfig {
            mailbox_depth: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_retry_config_validation() {
        let retry = RetryConfig {
            min_backoff_ms: 0,
            ..Default::default()
        };
        assert!(matches!(retry.validate(), Err(ConfigError::Invalid(_))));

        let retry = RetryConfig {
            min_backoff_ms: 100,
            max_backoff_ms: 50,
            ..Default::default()
        };
        assert!(matches!(retry.validate(), Err(ConfigError::Invalid(_))));

        let retry = RetryConfig {
            max_csma_backoffs: 0,
            ..Default::default()
        };
        assert!(matches!(retry.validate(), Err(ConfigError::Invalid(_))));

        let retry = RetryConfig {
            max_retransmissions: 0,
            ..Default::default()
        };
        assert!(matches!(retry.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_retry_config_fails_mac_validation() {
        let config = MacConfig {
            retry: RetryConfig {
                max_backoff_ms: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
