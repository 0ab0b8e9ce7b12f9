//! # Reconnect backoff
//!
//! Bounded exponential backoff for the supervisor's `Recovering` state.
//!
//! ```rust
//! use cdcrepl::resilience::RetryConfig;
//! use std::time::Duration;
//!
//! let retry = RetryConfig::builder()
//!     .max_retries(5)
//!     .retry_delay(Duration::from_millis(500))
//!     .max_delay(Duration::from_secs(30))
//!     .jitter(0.0)
//!     .build();
//!
//! assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(500));
//! assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(2));
//! assert!(retry.should_retry(4));
//! assert!(!retry.should_retry(5));
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry limits and delays.
///
/// `max_retries` counts consecutive failures without a committed
/// transaction in between: `-1` retries forever, `0` never retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    max_retries: i32,
    #[serde(rename = "initial_backoff_ms", with = "millis")]
    retry_delay: Duration,
    #[serde(rename = "max_backoff_ms", with = "millis")]
    max_delay: Duration,
    /// 0.0 - 1.0
    jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    pub fn infinite() -> Self {
        Self {
            max_retries: -1,
            ..Default::default()
        }
    }

    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn is_infinite(&self) -> bool {
        self.max_retries < 0
    }

    /// Whether failure number `attempt` (0-based) may be retried.
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.max_retries {
            n if n < 0 => true,
            0 => false,
            n => attempt < n as u32,
        }
    }

    /// Exponential delay capped at `max_delay`, with deterministic jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self
            .retry_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        let capped = base.min(self.max_delay);

        if self.jitter > 0.0 {
            let jitter_range = capped.as_secs_f64() * self.jitter;
            // golden ratio spread
            let offset = (f64::from(attempt) * 0.618_033_988_749_895) % 1.0;
            let adjusted = capped.as_secs_f64() + jitter_range * (offset * 2.0 - 1.0);
            Duration::from_secs_f64(adjusted.clamp(0.0, self.max_delay.as_secs_f64()))
        } else {
            capped
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.retry_delay.is_zero() {
            return Err("retry.initial_backoff_ms must be > 0".into());
        }
        if self.max_delay < self.retry_delay {
            return Err("retry.max_backoff_ms must be >= retry.initial_backoff_ms".into());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("retry.jitter must be within 0.0..=1.0".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryConfigBuilder {
    max_retries: Option<i32>,
    retry_delay: Option<Duration>,
    max_delay: Option<Duration>,
    jitter: Option<f64>,
}

impl RetryConfigBuilder {
    pub fn max_retries(mut self, value: i32) -> Self {
        self.max_retries = Some(value);
        self
    }

    pub fn retry_delay(mut self, value: Duration) -> Self {
        self.retry_delay = Some(value);
        self
    }

    pub fn max_delay(mut self, value: Duration) -> Self {
        self.max_delay = Some(value);
        self
    }

    pub fn jitter(mut self, value: f64) -> Self {
        self.jitter = Some(value.clamp(0.0, 1.0));
        self
    }

    pub fn build(self) -> RetryConfig {
        let defaults = RetryConfig::default();
        RetryConfig {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_delay: self.retry_delay.unwrap_or(defaults.retry_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
