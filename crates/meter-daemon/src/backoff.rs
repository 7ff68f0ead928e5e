use std::time::Duration;

use meter_proto::config::SinkConfig;

/// Delay between a sink failure and the next launch attempt.
///
/// `delay(n)` for the n-th consecutive failure is
/// `initial * multiplier^(n-1)`, capped at `max`.  A multiplier of 1 gives a
/// fixed delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
            multiplier: 1,
        }
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: 2,
        }
    }

    /// Fixed when the configured maximum does not exceed the base delay.
    pub fn from_config(sink: &SinkConfig) -> Self {
        let initial = Duration::from_millis(sink.retry_delay_ms);
        let max = Duration::from_millis(sink.max_retry_delay_ms);
        if max <= initial {
            Self::fixed(initial)
        } else {
            Self::exponential(initial, max)
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.saturating_pow(exponent);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1))
    }
}
